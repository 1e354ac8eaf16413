//! MCPHA binary command protocol.
//!
//! The instrument accepts fixed 8-byte command words and answers a subset of
//! them with fixed-size, unframed response blocks. The receiver has to know
//! from the command it just sent how many bytes will come back; see
//! [`CommandCode::response_kind`].
//!
//! # Command word layout
//!
//! ```text
//!  63        56 55    52 51                                   0
//! +------------+--------+--------------------------------------+
//! |    code    |  chan  |               payload                |
//! +------------+--------+--------------------------------------+
//! ```
//!
//! The word goes out byte-reversed (least significant byte first); the
//! multi-byte integers in response blocks are stored the same way.

pub mod codec;

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};

pub use codec::{
    decode_command, decode_histogram, decode_oscilloscope, decode_status, decode_timer,
    encode_command, encode_histogram, encode_oscilloscope, encode_status, encode_timer,
    validate_channel,
};

/// Instrument timer frequency (ticks per second).
pub const TIMER_FREQ: u64 = 125_000_000;

/// Seconds represented by one timer tick.
pub const TIME_PER_TICK: f64 = 1.0 / TIMER_FREQ as f64;

/// Size of a histogram or oscilloscope data block.
pub const DATA_BLOCK_LEN: usize = 65_536;

/// Number of 32-bit bins in a histogram block.
pub const HISTOGRAM_BINS: usize = DATA_BLOCK_LEN / 4;

/// Number of 16-bit samples (both channels) in an oscilloscope block.
pub const OSCILLOSCOPE_SAMPLES: usize = DATA_BLOCK_LEN / 2;

/// Largest payload a command word can carry (52 bits).
pub const MAX_PAYLOAD: u64 = (1 << 52) - 1;

/// Device command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandCode {
    /// Reset the acquisition timer.
    ResetTimer = 0,
    /// Clear the histogram.
    ResetHistogram = 1,
    /// Reset the oscilloscope.
    ResetOscilloscope = 2,
    /// Reset the pulse generator.
    ResetGenerator = 3,
    /// Sample-rate divider.
    SetSampleRate = 4,
    /// Invert input polarity.
    SetNegatorMode = 5,
    /// Baseline subtraction mode.
    SetBaselineMode = 6,
    /// Fixed baseline level.
    SetBaselineLevel = 7,
    /// PHA delay.
    SetPhaDelay = 8,
    /// PHA lower threshold.
    SetPhaMinThreshold = 9,
    /// PHA upper threshold.
    SetPhaMaxThreshold = 10,
    /// Run length in ticks.
    SetTimerValue = 11,
    /// Start (1) or stop (0) the timer.
    SetTimerMode = 12,
    /// Read the tick counter (8-byte reply).
    ReadTimer = 13,
    /// Read the histogram (65536-byte reply).
    ReadHistogram = 14,
    /// Oscilloscope pre-trigger samples.
    SetSamplesBeforeTrigger = 19,
    /// Oscilloscope total samples.
    SetTotalSamples = 20,
    /// Arm the oscilloscope.
    StartOscilloscope = 21,
    /// Read the oscilloscope status (4-byte reply).
    ReadOscilloscopeStatus = 22,
    /// Read the oscilloscope buffer (65536-byte reply).
    ReadOscilloscopeData = 23,
}

impl CommandCode {
    /// Look up a code from its wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CommandCode::ResetTimer),
            1 => Some(CommandCode::ResetHistogram),
            2 => Some(CommandCode::ResetOscilloscope),
            3 => Some(CommandCode::ResetGenerator),
            4 => Some(CommandCode::SetSampleRate),
            5 => Some(CommandCode::SetNegatorMode),
            6 => Some(CommandCode::SetBaselineMode),
            7 => Some(CommandCode::SetBaselineLevel),
            8 => Some(CommandCode::SetPhaDelay),
            9 => Some(CommandCode::SetPhaMinThreshold),
            10 => Some(CommandCode::SetPhaMaxThreshold),
            11 => Some(CommandCode::SetTimerValue),
            12 => Some(CommandCode::SetTimerMode),
            13 => Some(CommandCode::ReadTimer),
            14 => Some(CommandCode::ReadHistogram),
            19 => Some(CommandCode::SetSamplesBeforeTrigger),
            20 => Some(CommandCode::SetTotalSamples),
            21 => Some(CommandCode::StartOscilloscope),
            22 => Some(CommandCode::ReadOscilloscopeStatus),
            23 => Some(CommandCode::ReadOscilloscopeData),
            _ => None,
        }
    }

    /// The response block the device sends back for this command, if any.
    pub fn response_kind(self) -> Option<ResponseKind> {
        match self {
            CommandCode::ReadTimer => Some(ResponseKind::Timer),
            CommandCode::ReadOscilloscopeStatus => Some(ResponseKind::Status),
            CommandCode::ReadHistogram => Some(ResponseKind::Histogram),
            CommandCode::ReadOscilloscopeData => Some(ResponseKind::Oscilloscope),
            _ => None,
        }
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = BridgeError;

    fn try_from(value: u8) -> BridgeResult<Self> {
        CommandCode::from_u8(value).ok_or(BridgeError::UnknownCommandCode(value))
    }
}

/// Shape of a fixed-size response block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// 64-bit tick counter.
    Timer,
    /// 32-bit oscilloscope status word.
    Status,
    /// 16384 x u32 bin counts.
    Histogram,
    /// 32768 x i16 samples, channel-interleaved.
    Oscilloscope,
}

impl ResponseKind {
    /// Exact length in bytes of this block on the wire.
    pub const fn byte_len(self) -> usize {
        match self {
            ResponseKind::Timer => 8,
            ResponseKind::Status => 4,
            ResponseKind::Histogram | ResponseKind::Oscilloscope => DATA_BLOCK_LEN,
        }
    }
}

/// A single device command. Built and consumed per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Command code.
    pub code: CommandCode,
    /// Channel, always 0 or 1.
    pub channel: u8,
    /// 52-bit payload.
    pub payload: u64,
}

impl Command {
    /// Build a command, clamping `channel` into `{0, 1}`.
    pub fn new(code: CommandCode, channel: i64, payload: u64) -> Self {
        Self {
            code,
            channel: validate_channel(channel),
            payload,
        }
    }

    /// A command without payload on channel 0.
    pub fn bare(code: CommandCode) -> Self {
        Self::new(code, 0, 0)
    }
}

/// Timer value read back from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerReading {
    /// Raw 125 MHz tick count.
    pub ticks: u64,
}

impl TimerReading {
    /// Elapsed acquisition time in seconds.
    pub fn seconds(self) -> f64 {
        self.ticks as f64 * TIME_PER_TICK
    }
}

/// A full histogram snapshot. Replaced wholesale on every read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramBuffer {
    bins: Vec<u32>,
}

impl HistogramBuffer {
    /// Wrap a bin vector.
    pub fn new(bins: Vec<u32>) -> Self {
        Self { bins }
    }

    /// A zeroed buffer of the device's size.
    pub fn zeroed() -> Self {
        Self::new(vec![0; HISTOGRAM_BINS])
    }

    /// Bin counts.
    pub fn bins(&self) -> &[u32] {
        &self.bins
    }

    /// Number of bins.
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// Whether the buffer holds no bins.
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// `[bin, count]` pairs for the whole buffer.
    pub fn series(&self) -> Vec<[i64; 2]> {
        self.bins
            .iter()
            .enumerate()
            .map(|(i, &count)| [i as i64, i64::from(count)])
            .collect()
    }
}

/// Oscilloscope capture, samples interleaved ch1, ch2, ch1, ch2, ...
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OscilloscopeBuffer {
    samples: Vec<i16>,
}

impl OscilloscopeBuffer {
    /// Wrap an interleaved sample vector.
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Raw interleaved samples.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Samples of one channel (0 = channel 1, 1 = channel 2).
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = i16> + '_ {
        self.samples.iter().skip(channel.min(1)).step_by(2).copied()
    }
}
