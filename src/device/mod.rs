//! Instrument access.
//!
//! - [`link`]: the raw TCP connection (connect, send, exact reads)
//! - [`session`]: the process-wide device object that serializes every exchange
//! - [`mock`]: an in-process simulated instrument speaking the same protocol

pub mod link;
pub mod mock;
pub mod session;

pub use link::DeviceLink;
pub use mock::{MockInstrument, MockInstrumentHandle, TimerScript};
pub use session::{DeviceProfile, DeviceSession, OscilloscopeCapture, TimerMode};
