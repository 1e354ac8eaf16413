//! The single TCP connection to the instrument.
//!
//! `DeviceLink` is deliberately `&mut self` throughout: callers serialize
//! access through [`DeviceSession`](super::DeviceSession), which holds the only
//! link behind one lock, so a command and the read of its response can never be
//! interleaved with another caller's.
//!
//! Any I/O failure drops the socket. The next operation sees a disconnected
//! link instead of a half-read stream.

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{encode_command, Command};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 8_000;

/// Default read timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 60_000;

/// Owner of the instrument socket.
pub struct DeviceLink {
    stream: Option<TcpStream>,
    peer: Option<String>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Default for DeviceLink {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        )
    }
}

impl DeviceLink {
    /// Create a disconnected link with the given timeouts.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            stream: None,
            peer: None,
            connect_timeout,
            read_timeout,
        }
    }

    /// Whether a socket is currently held.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// `host:port` of the connected device.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Connect to the instrument.
    ///
    /// Returns `Ok(false)` without touching the socket when already connected,
    /// `Ok(true)` when a new connection was made.
    pub async fn connect(&mut self, host: &str, port: u16) -> BridgeResult<bool> {
        if self.is_connected() {
            tracing::debug!(peer = ?self.peer, "Connect requested while already connected");
            return Ok(false);
        }

        let addr = format!("{}:{}", host, port);
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| BridgeError::ConnectTimeout {
                addr: addr.clone(),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })??;

        // Commands are tiny; don't let Nagle hold them back
        stream.set_nodelay(true)?;

        tracing::info!("Connected to MCPHA device at {}", addr);
        self.stream = Some(stream);
        self.peer = Some(addr);
        Ok(true)
    }

    /// Close the socket. Returns `false` if there was nothing to close.
    pub async fn disconnect(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    tracing::debug!("Socket shutdown failed: {}", e);
                }
                tracing::info!(peer = ?self.peer, "Disconnected from MCPHA device");
                self.peer = None;
                true
            }
            None => false,
        }
    }

    fn invalidate(&mut self, error: &BridgeError) {
        if self.stream.take().is_some() {
            tracing::warn!(peer = ?self.peer, "Dropping device connection: {}", error);
            self.peer = None;
        }
    }

    /// Write one command word.
    pub async fn send_command(&mut self, command: &Command) -> BridgeResult<()> {
        let word = encode_command(command)?;
        let stream = self.stream.as_mut().ok_or(BridgeError::NotConnected)?;

        tracing::debug!(
            code = command.code as u8,
            channel = command.channel,
            payload = command.payload,
            "send_command"
        );

        let mut result = stream.write_all(&word).await;
        if result.is_ok() {
            result = stream.flush().await;
        }

        if let Err(e) = result {
            let err = BridgeError::Io(e);
            self.invalidate(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Read exactly `n` bytes, failing on a short read or the read timeout.
    pub async fn read_exact(&mut self, n: usize) -> BridgeResult<Vec<u8>> {
        let read_timeout = self.read_timeout;
        let stream = self.stream.as_mut().ok_or(BridgeError::NotConnected)?;

        let mut buf = vec![0u8; n];
        let result = match timeout(read_timeout, stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(e)) => Err(BridgeError::Io(e)),
            Err(_) => Err(BridgeError::ReadTimeout {
                expected: n,
                timeout_ms: read_timeout.as_millis() as u64,
            }),
        };

        if let Err(err) = &result {
            self.invalidate(err);
        }
        result
    }

    /// Send a command and read its fixed-size response.
    pub async fn exchange(&mut self, command: &Command, response_len: usize) -> BridgeResult<Vec<u8>> {
        self.send_command(command).await?;
        self.read_exact(response_len).await
    }
}
