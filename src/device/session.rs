//! Process-wide device state.
//!
//! `DeviceSession` owns the one [`DeviceLink`] plus the latest histogram and
//! oscilloscope snapshots and the ROI table. It is created once and shared as
//! `Arc<DeviceSession>` between the gateway and the acquisition controller.
//!
//! # Locking
//!
//! - The link sits behind an async mutex. Every public device operation takes
//!   it for the full send + response read, so exchanges from different
//!   callers can never interleave on the wire.
//! - Snapshots and ROIs sit behind a separate short-lived mutex that is never
//!   held across an `.await`. Buffers are swapped in as whole `Arc`s, so a
//!   reader always sees one complete acquisition snapshot.

use super::link::DeviceLink;
use crate::error::BridgeResult;
use crate::protocol::{
    decode_histogram, decode_oscilloscope, decode_status, decode_timer, Command, CommandCode,
    HistogramBuffer, OscilloscopeBuffer, ResponseKind, TimerReading,
};
use crate::roi::{RoiReport, RoiTable};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Lowest sample-rate divider the device accepts.
pub const MIN_SAMPLE_RATE: u64 = 4;

/// Timer run mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TimerMode {
    /// Timer halted; acquisition stops.
    Stopped = 0,
    /// Timer counting; acquisition runs.
    Running = 1,
}

/// Settings written to the device after every fresh connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Sample-rate divider.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u64,
    /// PHA delay (channel 0).
    #[serde(default = "default_pha_delay")]
    pub pha_delay: u64,
    /// PHA minimum threshold (channel 0).
    #[serde(default = "default_pha_min_threshold")]
    pub pha_min_threshold: u64,
    /// PHA maximum threshold (channel 0).
    #[serde(default = "default_pha_max_threshold")]
    pub pha_max_threshold: u64,
    /// Negator mode for both channels.
    #[serde(default)]
    pub negator_mode: u64,
}

fn default_sample_rate() -> u64 {
    4
}

fn default_pha_delay() -> u64 {
    100
}

fn default_pha_min_threshold() -> u64 {
    300
}

fn default_pha_max_threshold() -> u64 {
    16_300
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            pha_delay: default_pha_delay(),
            pha_min_threshold: default_pha_min_threshold(),
            pha_max_threshold: default_pha_max_threshold(),
            negator_mode: 0,
        }
    }
}

/// Timing of an oscilloscope capture.
#[derive(Debug, Clone)]
pub struct OscilloscopeCapture {
    /// Samples to skip before the trigger.
    pub pre_trigger_samples: u64,
    /// Total samples to acquire.
    pub total_samples: u64,
    /// Wait after resetting the oscilloscope.
    pub reset_settle: Duration,
    /// Wait after starting the capture.
    pub start_settle: Duration,
    /// Number of status reads before fetching data.
    pub status_polls: usize,
    /// Wait before each status read.
    pub status_interval: Duration,
}

impl Default for OscilloscopeCapture {
    fn default() -> Self {
        Self {
            pre_trigger_samples: 5_000,
            total_samples: 65_536,
            reset_settle: Duration::from_millis(1_000),
            start_settle: Duration::from_millis(200),
            status_polls: 5,
            status_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Default)]
struct Snapshots {
    histogram: Option<Arc<HistogramBuffer>>,
    oscilloscope: Option<Arc<OscilloscopeBuffer>>,
    rois: RoiTable,
}

/// The single instrument and everything derived from it.
pub struct DeviceSession {
    link: tokio::sync::Mutex<DeviceLink>,
    snapshots: Mutex<Snapshots>,
}

impl DeviceSession {
    /// Wrap a (normally disconnected) link.
    pub fn new(link: DeviceLink) -> Self {
        Self {
            link: tokio::sync::Mutex::new(link),
            snapshots: Mutex::new(Snapshots::default()),
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to the device. `Ok(false)` if a connection already existed.
    pub async fn connect(&self, host: &str, port: u16) -> BridgeResult<bool> {
        self.link.lock().await.connect(host, port).await
    }

    /// Close the connection. `false` if there was nothing to close.
    pub async fn disconnect(&self) -> bool {
        self.link.lock().await.disconnect().await
    }

    /// Whether a device socket is currently held.
    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_connected()
    }

    /// `host:port` of the connected device.
    pub async fn peer(&self) -> Option<String> {
        self.link.lock().await.peer().map(str::to_string)
    }

    // =========================================================================
    // Raw exchange
    // =========================================================================

    /// Send a command that has no response.
    pub async fn send(&self, command: Command) -> BridgeResult<()> {
        self.link.lock().await.send_command(&command).await
    }

    /// Send a command and read its fixed-size response under one lock.
    pub async fn query(&self, command: Command, kind: ResponseKind) -> BridgeResult<Vec<u8>> {
        self.link
            .lock()
            .await
            .exchange(&command, kind.byte_len())
            .await
    }

    // =========================================================================
    // Setters
    // =========================================================================

    /// Reset the acquisition timer.
    pub async fn reset_timer(&self, channel: u8) -> BridgeResult<()> {
        self.send(Command::new(CommandCode::ResetTimer, channel.into(), 0))
            .await
    }

    /// Clear the histogram on the device.
    pub async fn reset_histogram(&self, channel: u8) -> BridgeResult<()> {
        self.send(Command::new(CommandCode::ResetHistogram, channel.into(), 0))
            .await
    }

    /// Reset the oscilloscope.
    pub async fn reset_oscilloscope(&self) -> BridgeResult<()> {
        self.send(Command::bare(CommandCode::ResetOscilloscope)).await
    }

    /// Reset the pulse generator.
    pub async fn reset_generator(&self) -> BridgeResult<()> {
        self.send(Command::bare(CommandCode::ResetGenerator)).await
    }

    /// Set the sample-rate divider, raised to at least [`MIN_SAMPLE_RATE`].
    ///
    /// Returns the value actually sent.
    pub async fn set_sample_rate(&self, rate: u64) -> BridgeResult<u64> {
        let rate = rate.max(MIN_SAMPLE_RATE);
        self.send(Command::new(CommandCode::SetSampleRate, 0, rate))
            .await?;
        Ok(rate)
    }

    /// 0 disabled, 1 enabled.
    pub async fn set_negator_mode(&self, channel: u8, mode: u64) -> BridgeResult<()> {
        self.send(Command::new(CommandCode::SetNegatorMode, channel.into(), mode))
            .await
    }

    /// 0 none, 1 auto.
    pub async fn set_baseline_mode(&self, channel: u8, mode: u64) -> BridgeResult<()> {
        self.send(Command::new(CommandCode::SetBaselineMode, channel.into(), mode))
            .await
    }

    /// Fixed baseline level, used when the baseline mode is 0.
    pub async fn set_baseline_level(&self, channel: u8, level: u64) -> BridgeResult<()> {
        self.send(Command::new(CommandCode::SetBaselineLevel, channel.into(), level))
            .await
    }

    /// PHA delay in samples.
    pub async fn set_pha_delay(&self, channel: u8, delay: u64) -> BridgeResult<()> {
        self.send(Command::new(CommandCode::SetPhaDelay, channel.into(), delay))
            .await
    }

    /// Lowest pulse height counted into the histogram.
    pub async fn set_pha_min_threshold(&self, channel: u8, threshold: u64) -> BridgeResult<()> {
        self.send(Command::new(
            CommandCode::SetPhaMinThreshold,
            channel.into(),
            threshold,
        ))
        .await
    }

    /// Highest pulse height counted into the histogram.
    pub async fn set_pha_max_threshold(&self, channel: u8, threshold: u64) -> BridgeResult<()> {
        self.send(Command::new(
            CommandCode::SetPhaMaxThreshold,
            channel.into(),
            threshold,
        ))
        .await
    }

    /// Program the run length in timer ticks.
    pub async fn set_timer_value(&self, channel: u8, ticks: u64) -> BridgeResult<()> {
        self.send(Command::new(CommandCode::SetTimerValue, channel.into(), ticks))
            .await
    }

    /// Start or stop the acquisition timer.
    pub async fn set_timer_mode(&self, channel: u8, mode: TimerMode) -> BridgeResult<()> {
        self.send(Command::new(
            CommandCode::SetTimerMode,
            channel.into(),
            mode as u64,
        ))
        .await
    }

    /// Oscilloscope pre-trigger sample count.
    pub async fn set_samples_before_trigger(&self, samples: u64) -> BridgeResult<()> {
        self.send(Command::new(CommandCode::SetSamplesBeforeTrigger, 0, samples))
            .await
    }

    /// Oscilloscope total sample count.
    pub async fn set_total_samples(&self, samples: u64) -> BridgeResult<()> {
        self.send(Command::new(CommandCode::SetTotalSamples, 0, samples))
            .await
    }

    /// Arm the oscilloscope.
    pub async fn start_oscilloscope(&self) -> BridgeResult<()> {
        self.send(Command::bare(CommandCode::StartOscilloscope)).await
    }

    /// Write the initialization profile to the device.
    pub async fn apply_profile(&self, profile: &DeviceProfile) -> BridgeResult<()> {
        self.set_sample_rate(profile.sample_rate).await?;
        self.set_pha_delay(0, profile.pha_delay).await?;
        self.set_pha_min_threshold(0, profile.pha_min_threshold)
            .await?;
        self.set_pha_max_threshold(0, profile.pha_max_threshold)
            .await?;
        self.set_negator_mode(0, profile.negator_mode).await?;
        self.set_negator_mode(1, profile.negator_mode).await?;
        tracing::debug!(?profile, "Applied device profile");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the acquisition timer.
    pub async fn read_timer(&self, channel: u8) -> BridgeResult<TimerReading> {
        let block = self
            .query(
                Command::new(CommandCode::ReadTimer, channel.into(), 0),
                ResponseKind::Timer,
            )
            .await?;
        Ok(TimerReading {
            ticks: decode_timer(&block)?,
        })
    }

    /// Read the histogram and make it the current snapshot.
    ///
    /// The snapshot is replaced before the link is released, so a slower
    /// reader can never overwrite a newer histogram with an older one.
    pub async fn read_histogram(&self, channel: u8) -> BridgeResult<Arc<HistogramBuffer>> {
        let command = Command::new(CommandCode::ReadHistogram, channel.into(), 0);
        let mut link = self.link.lock().await;
        let block = link
            .exchange(&command, ResponseKind::Histogram.byte_len())
            .await?;
        let histogram = Arc::new(decode_histogram(&block)?);
        self.snapshots.lock().histogram = Some(Arc::clone(&histogram));
        drop(link);
        Ok(histogram)
    }

    /// Read the oscilloscope status word.
    pub async fn read_oscilloscope_status(&self) -> BridgeResult<u32> {
        // The status query carries the response size as its payload.
        let block = self
            .query(
                Command::new(CommandCode::ReadOscilloscopeStatus, 0, 4),
                ResponseKind::Status,
            )
            .await?;
        decode_status(&block)
    }

    /// Read the oscilloscope buffer and make it the current snapshot.
    pub async fn read_oscilloscope_data(&self) -> BridgeResult<Arc<OscilloscopeBuffer>> {
        let command = Command::bare(CommandCode::ReadOscilloscopeData);
        let mut link = self.link.lock().await;
        let block = link
            .exchange(&command, ResponseKind::Oscilloscope.byte_len())
            .await?;
        let buffer = Arc::new(decode_oscilloscope(&block)?);
        self.snapshots.lock().oscilloscope = Some(Arc::clone(&buffer));
        drop(link);
        Ok(buffer)
    }

    /// Run a full oscilloscope capture: reset, arm, start, poll status, read.
    pub async fn capture_oscilloscope(
        &self,
        capture: &OscilloscopeCapture,
    ) -> BridgeResult<Arc<OscilloscopeBuffer>> {
        self.reset_oscilloscope().await?;
        tokio::time::sleep(capture.reset_settle).await;

        self.set_samples_before_trigger(capture.pre_trigger_samples)
            .await?;
        self.set_total_samples(capture.total_samples).await?;
        self.start_oscilloscope().await?;
        tokio::time::sleep(capture.start_settle).await;

        for _ in 0..capture.status_polls {
            tokio::time::sleep(capture.status_interval).await;
            let status = self.read_oscilloscope_status().await?;
            tracing::debug!(status, "Oscilloscope status");
        }

        self.read_oscilloscope_data().await
    }

    // =========================================================================
    // Snapshots & ROIs
    // =========================================================================

    /// The most recent histogram, if any has been read.
    pub fn histogram(&self) -> Option<Arc<HistogramBuffer>> {
        self.snapshots.lock().histogram.clone()
    }

    /// The most recent oscilloscope capture, if any.
    pub fn oscilloscope(&self) -> Option<Arc<OscilloscopeBuffer>> {
        self.snapshots.lock().oscilloscope.clone()
    }

    /// Define ROI `index` and report it against the current histogram.
    ///
    /// Fails with [`crate::error::BridgeError::InvalidRoiIndex`] without changing any slot
    /// when `index` is outside `1..=3`.
    pub fn set_roi(&self, index: i64, start: i64, end: i64) -> BridgeResult<Option<RoiReport>> {
        let mut snapshots = self.snapshots.lock();
        snapshots.rois.set(index, start, end)?;
        let histogram = snapshots.histogram.clone();
        snapshots.rois.report(index, histogram.as_deref())
    }

    /// Report ROI `index` against the current histogram.
    pub fn roi_report(&self, index: i64) -> BridgeResult<Option<RoiReport>> {
        let mut snapshots = self.snapshots.lock();
        let histogram = snapshots.histogram.clone();
        snapshots.rois.report(index, histogram.as_deref())
    }

    /// Reports for every defined ROI against the current histogram.
    pub fn roi_reports(&self) -> Vec<RoiReport> {
        let mut snapshots = self.snapshots.lock();
        let histogram = snapshots.histogram.clone();
        snapshots.rois.report_all(histogram.as_deref())
    }
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self::new(DeviceLink::default())
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession").finish_non_exhaustive()
    }
}
