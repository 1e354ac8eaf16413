//! Client request handling.
//!
//! The [`Gateway`] turns each decoded [`Request`] into device, acquisition or
//! ROI operations and queues the resulting [`Response`]s on the requesting
//! client's outbox. It never fails: every error becomes a reply.
//!
//! - `status = 1` with the error text for connection, protocol, ROI index and
//!   malformed-request failures.
//! - `status = 0` with `Device not connected` when an operation needs the
//!   device and there is none. Those operations are treated as no-ops.

pub mod hub;
pub mod messages;

pub use hub::{ClientId, ClientInfo, Outbox, SessionHub};
pub use messages::{MessageType, RejectedRequest, Request, Response};

use crate::acquisition::{publish_histogram, AcquisitionController};
use crate::config::BridgeConfig;
use crate::device::{DeviceProfile, DeviceSession, OscilloscopeCapture};
use crate::error::{BridgeError, BridgeResult, ErrorKind};
use crate::protocol::{validate_channel, MAX_PAYLOAD, TIMER_FREQ};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Longest run whose tick count still fits in a command payload.
pub const MAX_ACQUISITION_TIME_SECS: u64 = MAX_PAYLOAD / TIMER_FREQ;

/// Behaviour knobs for a [`Gateway`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Written to the device after every fresh connection.
    pub profile: DeviceProfile,
    /// Run length until a client sets one.
    pub default_time_secs: u64,
    /// Interval between acquisition polls.
    pub poll_interval: Duration,
    /// Oscilloscope capture timing.
    pub capture: OscilloscopeCapture,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        BridgeConfig::default().into()
    }
}

impl From<BridgeConfig> for GatewaySettings {
    fn from(config: BridgeConfig) -> Self {
        Self {
            poll_interval: config.acquisition.poll_interval(),
            profile: config.device.profile,
            default_time_secs: config.acquisition.default_time_secs,
            capture: OscilloscopeCapture::default(),
        }
    }
}

/// Maps client requests onto the device.
pub struct Gateway {
    device: Arc<DeviceSession>,
    acquisition: AcquisitionController,
    hub: SessionHub,
    profile: DeviceProfile,
    capture: OscilloscopeCapture,
    acquisition_time_secs: AtomicU64,
}

impl Gateway {
    /// A gateway over `device` with its own acquisition controller and hub.
    pub fn new(device: Arc<DeviceSession>, settings: GatewaySettings) -> Self {
        Self {
            acquisition: AcquisitionController::new(Arc::clone(&device), settings.poll_interval),
            device,
            hub: SessionHub::new(),
            profile: settings.profile,
            capture: settings.capture,
            acquisition_time_secs: AtomicU64::new(settings.default_time_secs),
        }
    }

    /// A gateway with a fresh, disconnected device built from `config`.
    pub fn from_config(config: &BridgeConfig) -> Self {
        let device = Arc::new(DeviceSession::new(config.device.link()));
        Self::new(device, config.clone().into())
    }

    /// The shared device session.
    pub fn device(&self) -> &Arc<DeviceSession> {
        &self.device
    }

    /// Registry of connected clients.
    pub fn hub(&self) -> &SessionHub {
        &self.hub
    }

    /// Current run length in seconds.
    pub fn acquisition_time_secs(&self) -> u64 {
        self.acquisition_time_secs.load(Ordering::Relaxed)
    }

    /// Connect to the device and, if the connection is new, write the
    /// initialization profile. Returns whether a new connection was made.
    pub async fn connect_device(&self, host: &str, port: u16) -> BridgeResult<bool> {
        let fresh = self.device.connect(host, port).await?;
        if fresh {
            self.device.apply_profile(&self.profile).await?;
            self.hub
                .broadcast(format!("Device connected at {}:{}", host, port))
                .await;
        }
        Ok(fresh)
    }

    /// Decode one raw client message and handle it.
    pub async fn handle_message(&self, text: &str, outbox: &Outbox) {
        match Request::decode(text) {
            Ok(request) => self.handle(request, outbox).await,
            Err(RejectedRequest { command, error }) => {
                tracing::warn!(?command, "Rejected client message: {}", error);
                let command = command.unwrap_or_else(|| "unknown".to_string());
                reply(outbox, Response::failure(&command, error.to_string()));
            }
        }
    }

    /// Handle one request. Every outcome, including failure, is replied to.
    pub async fn handle(&self, request: Request, outbox: &Outbox) {
        let command = request.command_name();
        tracing::debug!(command, ?request, "Handling request");

        if let Err(e) = self.dispatch(request, outbox).await {
            let response = if e.kind() == ErrorKind::NotConnected {
                Response::ok(command).with_message(e.to_string())
            } else {
                tracing::warn!(command, "Request failed: {}", e);
                Response::failure(command, e.to_string())
            };
            reply(outbox, response);
        }
    }

    async fn dispatch(&self, request: Request, outbox: &Outbox) -> BridgeResult<()> {
        match request {
            Request::Connect { deviceip, port } => self.connect(&deviceip, port, outbox).await,
            Request::Disconnect => self.disconnect(outbox).await,
            Request::SetAcquisitionTime { value } => {
                if value > MAX_ACQUISITION_TIME_SECS {
                    return Err(BridgeError::InvalidRequest(format!(
                        "acquisition time {} s exceeds the maximum of {} s",
                        value, MAX_ACQUISITION_TIME_SECS
                    )));
                }
                self.acquisition_time_secs.store(value, Ordering::Relaxed);
                reply(outbox, Response::ok("set_acquisition_time").with("value", value));
                Ok(())
            }
            Request::SetAcquisitionState { state } => self.set_acquisition_state(state, outbox).await,
            Request::GetAcquisitionState => {
                let state = self.acquisition.state(0);
                reply(outbox, Response::acquisition_state("get_acquisition_state", state));
                Ok(())
            }
            Request::SetRoi { roi, from, to } => {
                let response = match self.device.set_roi(roi, from, to)? {
                    Some(report) => Response::roi("set_roi", &report),
                    None => Response::ok("set_roi")
                        .with("roi", roi)
                        .with("start", from)
                        .with("end", to),
                };
                reply(outbox, response);
                Ok(())
            }
            Request::SetSampleRate { value } => {
                let sent = self.device.set_sample_rate(value).await?;
                reply(outbox, Response::ok("set_sample_rate").with("value", sent));
                Ok(())
            }
            Request::GetHistogramData { channel } => {
                publish_histogram(&self.device, validate_channel(channel), outbox).await?;
                Ok(())
            }
            Request::GetRoiData { roi } => {
                let response = match self.device.roi_report(roi)? {
                    Some(report) => Response::roi("get_roi_data", &report),
                    None => Response::ok("get_roi_data")
                        .with_message("No data")
                        .with("roi", roi),
                };
                reply(outbox, response);
                Ok(())
            }
            Request::ClearSpectrum { channel } => {
                let channel = validate_channel(channel);
                self.device.reset_histogram(channel).await?;
                publish_histogram(&self.device, channel, outbox).await?;
                Ok(())
            }
            Request::GetOscilloscopeData { channels } => {
                let buffer = self.device.capture_oscilloscope(&self.capture).await?;
                reply(outbox, Response::oscilloscope(&buffer, channels));
                Ok(())
            }
        }
    }

    async fn connect(&self, host: &str, port: u16, outbox: &Outbox) -> BridgeResult<()> {
        let message = if self.connect_device(host, port).await? {
            "Connection established".to_string()
        } else {
            let peer = self.device.peer().await.unwrap_or_default();
            format!("Already connected to {}", peer)
        };
        reply(outbox, Response::ok("connect").with_message(message));
        publish_histogram(&self.device, 0, outbox).await?;
        Ok(())
    }

    async fn disconnect(&self, outbox: &Outbox) -> BridgeResult<()> {
        self.acquisition.abandon_all().await;
        let response = if self.device.disconnect().await {
            self.hub.broadcast("Device disconnected").await;
            Response::ok("disconnect").with_message("Device disconnected")
        } else {
            Response::ok("disconnect").with_message("Nothing to do. Device not connected")
        };
        reply(outbox, response);
        Ok(())
    }

    /// `1` programs the run length, resets the timer and starts polling (the
    /// controller announces the new state itself). `0` stops the run.
    async fn set_acquisition_state(&self, state: i64, outbox: &Outbox) -> BridgeResult<()> {
        match state {
            1 => {
                if !self.device.is_connected().await {
                    return Err(BridgeError::NotConnected);
                }
                let ticks = TIMER_FREQ * self.acquisition_time_secs();
                self.device.set_timer_value(0, ticks).await?;
                self.device.reset_timer(0).await?;
                self.acquisition.start(0, outbox.clone()).await?;
            }
            0 => {
                let new_state = self.acquisition.stop(0).await?;
                reply(
                    outbox,
                    Response::acquisition_state("set_acquisition_state", new_state),
                );
            }
            other => {
                return Err(BridgeError::InvalidRequest(format!(
                    "acquisition state must be 0 or 1, got {}",
                    other
                )))
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("profile", &self.profile)
            .field("acquisition_time_secs", &self.acquisition_time_secs())
            .finish_non_exhaustive()
    }
}

fn reply(outbox: &Outbox, response: Response) {
    if outbox.send(response).is_err() {
        tracing::debug!("Client outbox closed, dropping reply");
    }
}
