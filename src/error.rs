//! Custom error types for the bridge.
//!
//! `BridgeError` is the single error type for the library. Using `thiserror`,
//! it groups everything that can go wrong between a client request and the
//! instrument socket.
//!
//! ## Error Hierarchy
//!
//! Every variant belongs to one [`ErrorKind`]:
//!
//! - **`Connection`**: socket connect/read/write failures, including the connect
//!   and read timeouts. Any of these tears down the device connection.
//! - **`InvalidRoiIndex`**: an ROI slot outside `1..=3`. No state is mutated.
//! - **`NotConnected`**: an operation that needs the device ran without a live
//!   socket. Most gateway operations treat this as a silent no-op instead.
//! - **`Protocol`**: a command or response block that cannot be encoded or decoded.
//! - **`InvalidRequest`**: a client message that is not valid JSON or names an
//!   unknown command.
//! - **`Config`**: configuration loading and validation.
//!
//! The gateway converts any of these into a `status = 1` response carrying the
//! `Display` text, so none of them can take down the service.

use thiserror::Error;

/// Convenience alias for results using the bridge error type.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Coarse classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket failure; the connection has been invalidated.
    Connection,
    /// ROI index outside `1..=3`.
    InvalidRoiIndex,
    /// No live device socket.
    NotConnected,
    /// Malformed command word or response block.
    Protocol,
    /// Malformed client request.
    InvalidRequest,
    /// Configuration problem.
    Config,
}

/// Error type for all bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Socket failure; the link has been closed.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Connect attempt exceeded its timeout.
    #[error("Connection to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout {
        /// `host:port` that was dialled.
        addr: String,
        /// Configured connect timeout.
        timeout_ms: u64,
    },

    /// Response block did not arrive in time; the link has been closed.
    #[error("Timed out after {timeout_ms} ms waiting for {expected} byte response")]
    ReadTimeout {
        /// Length of the block being read.
        expected: usize,
        /// Configured read timeout.
        timeout_ms: u64,
    },

    /// No device socket is held.
    #[error("Device not connected")]
    NotConnected,

    /// ROI index outside `1..=3`.
    #[error("ROI number [{0}] outside range of 1 to 3.")]
    InvalidRoiIndex(i64),

    /// Payload wider than 52 bits.
    #[error("Payload {payload:#x} does not fit in {bits} bits")]
    PayloadOverflow {
        /// Rejected payload.
        payload: u64,
        /// Payload width of a command word.
        bits: u32,
    },

    /// Command word with a code the device does not define.
    #[error("Unknown command code {0}")]
    UnknownCommandCode(u8),

    /// Response block of the wrong length.
    #[error("Expected a {expected} byte block, got {actual} bytes")]
    BlockSize {
        /// Fixed size of the block.
        expected: usize,
        /// Bytes actually supplied.
        actual: usize,
    },

    /// Client request that cannot be carried out.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Figment failed to extract the configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values out of range.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl BridgeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Io(_) | BridgeError::ConnectTimeout { .. } | BridgeError::ReadTimeout { .. } => {
                ErrorKind::Connection
            }
            BridgeError::NotConnected => ErrorKind::NotConnected,
            BridgeError::InvalidRoiIndex(_) => ErrorKind::InvalidRoiIndex,
            BridgeError::PayloadOverflow { .. }
            | BridgeError::UnknownCommandCode(_)
            | BridgeError::BlockSize { .. } => ErrorKind::Protocol,
            BridgeError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            BridgeError::Config(_) | BridgeError::Configuration(_) => ErrorKind::Config,
        }
    }

    /// Whether this error invalidated the device connection.
    pub fn is_connection_error(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(value: serde_json::Error) -> Self {
        BridgeError::InvalidRequest(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roi_index_message_names_the_valid_range() {
        let err = BridgeError::InvalidRoiIndex(5);
        assert_eq!(err.to_string(), "ROI number [5] outside range of 1 to 3.");
        assert_eq!(err.kind(), ErrorKind::InvalidRoiIndex);
    }

    #[test]
    fn io_errors_are_connection_errors() {
        let err: BridgeError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer").into();
        assert!(err.is_connection_error());
        assert_eq!(err.to_string(), "reset by peer");

        let timeout = BridgeError::ReadTimeout {
            expected: 8,
            timeout_ms: 60_000,
        };
        assert!(timeout.is_connection_error());
    }

    #[test]
    fn json_errors_become_invalid_requests() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: BridgeError = parse.into();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }
}
