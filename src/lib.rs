//! # MCPHA Bridge
//!
//! Bridges JSON clients to a Red Pitaya multichannel pulse-height analyzer
//! (MCPHA) that only speaks a compact binary command protocol over TCP.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: command codes, the 8-byte command word codec and the
//!   fixed-size response blocks (timer, status, histogram, oscilloscope).
//! - **`device`**: the single instrument connection (`DeviceLink`), the shared
//!   `DeviceSession` that serializes every exchange and holds the latest
//!   snapshots, and `MockInstrument`, a simulated device for tests.
//! - **`roi`**: the three region-of-interest slots and their aggregation.
//! - **`acquisition`**: run start/stop and the background polling task that
//!   detects when a run has finished.
//! - **`gateway`**: JSON request/response types, the client registry and
//!   request dispatch.
//! - **`server`**: line-delimited JSON transport for clients.
//! - **`config`**, **`logging`**, **`error`**: ambient infrastructure.

pub mod acquisition;
pub mod config;
pub mod device;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod protocol;
pub mod roi;
pub mod server;

pub use error::{BridgeError, BridgeResult};
