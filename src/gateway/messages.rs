//! JSON message types exchanged with clients.
//!
//! Requests are tagged by their `command` field. Every outbound message is a
//! [`Response`]: a `resp` envelope answering a command, or a `notice`
//! broadcast from the server.
//!
//! ```json
//! {"command": "set_roi", "roi": 1, "from": 10, "to": 20}
//! {"type": "resp", "command": "set_roi", "message": "", "status": 0, "roi": 1, "counts": 11, ...}
//! {"type": "notice", "sender": "Server", "message": "User2 joined"}
//! ```

use crate::acquisition::AcquisitionState;
use crate::error::BridgeError;
use crate::protocol::{HistogramBuffer, OscilloscopeBuffer, TimerReading};
use crate::roi::RoiReport;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Oscilloscope channel bitmask: channel 1.
pub const OSCILLOSCOPE_CHANNEL_1: u8 = 0b01;
/// Oscilloscope channel bitmask: channel 2.
pub const OSCILLOSCOPE_CHANNEL_2: u8 = 0b10;

fn both_channels() -> u8 {
    OSCILLOSCOPE_CHANNEL_1 | OSCILLOSCOPE_CHANNEL_2
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    /// Open the device connection.
    Connect {
        /// Device host name or address.
        deviceip: String,
        /// Device TCP port.
        port: u16,
    },
    /// Close the device connection.
    Disconnect,
    /// Store the run length in seconds.
    SetAcquisitionTime {
        /// Seconds.
        value: u64,
    },
    /// 1 starts a run, 0 stops it.
    SetAcquisitionState {
        /// Requested state.
        state: i64,
    },
    /// Report the channel 0 acquisition state.
    GetAcquisitionState,
    /// Define an ROI slot.
    SetRoi {
        /// Slot, 1 to 3.
        roi: i64,
        /// First bin, inclusive.
        from: i64,
        /// Last bin, inclusive.
        to: i64,
    },
    /// Set the sample-rate divider.
    SetSampleRate {
        /// Divider; values below 4 are raised to 4.
        value: u64,
    },
    /// Read and publish the histogram with its ROI reports.
    GetHistogramData {
        /// Device channel.
        #[serde(default)]
        channel: i64,
    },
    /// Report one ROI slot.
    GetRoiData {
        /// Slot, 1 to 3.
        roi: i64,
    },
    /// Reset the device histogram and republish it.
    ClearSpectrum {
        /// Device channel.
        #[serde(default)]
        channel: i64,
    },
    /// Capture the oscilloscope; `channels` is a bitmask of the traces to return.
    GetOscilloscopeData {
        /// Bitmask, see [`OSCILLOSCOPE_CHANNEL_1`] and [`OSCILLOSCOPE_CHANNEL_2`].
        #[serde(default = "both_channels")]
        channels: u8,
    },
}

/// A message that could not be turned into a [`Request`].
#[derive(Debug)]
pub struct RejectedRequest {
    /// The `command` field, when one could be read.
    pub command: Option<String>,
    /// Why decoding failed.
    pub error: BridgeError,
}

impl Request {
    /// Decode one JSON message.
    ///
    /// The command name is recovered first so that a request with bad fields
    /// can still be answered under its own command.
    pub fn decode(text: &str) -> Result<Request, RejectedRequest> {
        let value: Value = serde_json::from_str(text).map_err(|e| RejectedRequest {
            command: None,
            error: e.into(),
        })?;

        let command = value
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_string);

        if command.is_none() {
            return Err(RejectedRequest {
                command: None,
                error: BridgeError::InvalidRequest("missing \"command\" field".into()),
            });
        }

        serde_json::from_value(value).map_err(|e| RejectedRequest {
            command,
            error: e.into(),
        })
    }

    /// The wire name of this request's command.
    pub fn command_name(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "connect",
            Request::Disconnect => "disconnect",
            Request::SetAcquisitionTime { .. } => "set_acquisition_time",
            Request::SetAcquisitionState { .. } => "set_acquisition_state",
            Request::GetAcquisitionState => "get_acquisition_state",
            Request::SetRoi { .. } => "set_roi",
            Request::SetSampleRate { .. } => "set_sample_rate",
            Request::GetHistogramData { .. } => "get_histogram_data",
            Request::GetRoiData { .. } => "get_roi_data",
            Request::ClearSpectrum { .. } => "clear_spectrum",
            Request::GetOscilloscopeData { .. } => "get_oscilloscope_data",
        }
    }
}

/// Envelope type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Answer to a command.
    Resp,
    /// Server broadcast.
    Notice,
}

/// Outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// `resp` or `notice`.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Set on notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// The command being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Human-readable outcome.
    pub message: String,
    /// 0 success, 1 failure. Absent on notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u8>,
    /// Command-specific fields, serialized inline.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Response {
    /// Successful reply to `command`.
    pub fn ok(command: &str) -> Self {
        Self {
            kind: MessageType::Resp,
            sender: None,
            command: Some(command.to_string()),
            message: String::new(),
            status: Some(0),
            fields: Map::new(),
        }
    }

    /// Failed reply to `command` (`status = 1`).
    pub fn failure(command: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(1),
            ..Self::ok(command)
        }
    }

    /// Server notice sent to every client.
    pub fn notice(message: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Notice,
            sender: Some("Server".to_string()),
            command: None,
            message: message.into(),
            status: None,
            fields: Map::new(),
        }
    }

    /// Replace the message text.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Add one field.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Add every field of a serializable struct.
    fn with_all(mut self, value: impl Serialize) -> Self {
        if let Ok(Value::Object(map)) = serde_json::to_value(value) {
            self.fields.extend(map);
        }
        self
    }

    /// `get_histogram_data` payload for one acquisition snapshot.
    pub fn histogram(timer: TimerReading, histogram: &HistogramBuffer) -> Self {
        Self::ok("get_histogram_data")
            .with("timer", format!("{:.2}", timer.seconds()))
            .with("label", "histogram")
            .with("data", histogram.series())
    }

    /// ROI payload under `command` (`set_roi` or `get_roi_data`).
    pub fn roi(command: &str, report: &RoiReport) -> Self {
        Self::ok(command).with_all(report)
    }

    /// Current acquisition state under `command`.
    pub fn acquisition_state(command: &str, state: AcquisitionState) -> Self {
        Self::ok(command).with("state", state)
    }

    /// `get_oscilloscope_data` payload with the traces selected by `channels`.
    pub fn oscilloscope(buffer: &OscilloscopeBuffer, channels: u8) -> Self {
        let trace = |channel: usize| -> Vec<[i64; 2]> {
            buffer
                .channel(channel)
                .enumerate()
                .map(|(i, v)| [i as i64, i64::from(v)])
                .collect()
        };

        let mut response = Self::ok("get_oscilloscope_data");
        if channels & OSCILLOSCOPE_CHANNEL_1 != 0 {
            response = response.with("data1", trace(0)).with("label1", "Channel 1");
        }
        if channels & OSCILLOSCOPE_CHANNEL_2 != 0 {
            response = response.with("data2", trace(1)).with("label2", "Channel 2");
        }
        response
    }

    /// `status`, if this is a reply.
    pub fn status(&self) -> Option<u8> {
        self.status
    }

    /// A command-specific field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Serialize to a single JSON line.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize response: {}", e);
            String::from("{}")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_tagged_requests() {
        let req = Request::decode(r#"{"command":"set_roi","roi":1,"from":10,"to":20}"#).unwrap();
        assert_eq!(
            req,
            Request::SetRoi {
                roi: 1,
                from: 10,
                to: 20
            }
        );

        let req = Request::decode(r#"{"command":"connect","deviceip":"10.0.0.2","port":1001}"#)
            .unwrap();
        assert_eq!(req.command_name(), "connect");

        let req = Request::decode(r#"{"command":"get_oscilloscope_data"}"#).unwrap();
        assert_eq!(req, Request::GetOscilloscopeData { channels: 3 });
    }

    #[test]
    fn bad_fields_keep_the_command_name() {
        let rejected = Request::decode(r#"{"command":"set_roi","roi":"one"}"#).unwrap_err();
        assert_eq!(rejected.command.as_deref(), Some("set_roi"));

        let rejected = Request::decode(r#"{"command":"make_coffee"}"#).unwrap_err();
        assert_eq!(rejected.command.as_deref(), Some("make_coffee"));

        let rejected = Request::decode("not json").unwrap_err();
        assert!(rejected.command.is_none());

        let rejected = Request::decode(r#"{"roi":1}"#).unwrap_err();
        assert!(rejected.command.is_none());
    }

    #[test]
    fn reply_envelope_flattens_fields() {
        let resp = Response::ok("get_acquisition_state").with("state", "inactive");
        let value: Value = serde_json::from_str(&resp.to_json()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "resp",
                "command": "get_acquisition_state",
                "message": "",
                "status": 0,
                "state": "inactive"
            })
        );
    }

    #[test]
    fn notice_envelope() {
        let value: Value = serde_json::from_str(&Response::notice("User1 joined").to_json()).unwrap();
        assert_eq!(
            value,
            json!({"type": "notice", "sender": "Server", "message": "User1 joined"})
        );
    }

    #[test]
    fn histogram_reply_formats_timer_seconds() {
        let resp = Response::histogram(
            TimerReading { ticks: 187_500_000 },
            &HistogramBuffer::new(vec![3, 4]),
        );
        assert_eq!(resp.field("timer"), Some(&json!("1.50")));
        assert_eq!(resp.field("data"), Some(&json!([[0, 3], [1, 4]])));
    }

    #[test]
    fn oscilloscope_reply_only_includes_requested_traces() {
        let buffer = OscilloscopeBuffer::new(vec![10, -10, 11, -11]);
        let resp = Response::oscilloscope(&buffer, OSCILLOSCOPE_CHANNEL_2);
        assert!(resp.field("data1").is_none());
        assert_eq!(resp.field("data2"), Some(&json!([[0, -10], [1, -11]])));
        assert_eq!(resp.field("label2"), Some(&json!("Channel 2")));
    }
}
