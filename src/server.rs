//! Client transport: line-delimited JSON over TCP.
//!
//! Each accepted connection gets a reader loop that feeds one JSON request
//! per line to the [`Gateway`], and a writer task that drains the client's
//! outbox, one JSON response per line. Responses published later by
//! acquisition tasks go through the same outbox.

use crate::config::BridgeConfig;
use crate::error::BridgeResult;
use crate::gateway::{ClientInfo, Gateway, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Accepts clients and wires them to the gateway.
pub struct BridgeServer {
    listener: TcpListener,
    gateway: Arc<Gateway>,
}

impl BridgeServer {
    /// Bind the client listener.
    pub async fn bind(addr: &str, gateway: Arc<Gateway>) -> BridgeResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Bridge listening on {}", listener.local_addr()?);
        Ok(Self { listener, gateway })
    }

    /// Build the gateway from `config`, connect to the device if one is
    /// configured, and bind the listener.
    pub async fn from_config(config: &BridgeConfig) -> BridgeResult<Self> {
        let gateway = Arc::new(Gateway::from_config(config));
        if let Some((host, port)) = config.device.auto_connect() {
            // A missing device is not fatal; clients can connect later
            match gateway.connect_device(host, port).await {
                Ok(_) => tracing::info!("Connected to configured device {}:{}", host, port),
                Err(e) => tracing::warn!("Could not connect to {}:{}: {}", host, port, e),
            }
        }
        Self::bind(&config.server.listen_addr, gateway).await
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> BridgeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The gateway serving clients.
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Accept clients until the task is dropped.
    pub async fn run(self) -> BridgeResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => {
                    let gateway = Arc::clone(&self.gateway);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(socket, addr, gateway).await {
                            tracing::warn!("Client {} error: {}", addr, e);
                        }
                    });
                }
                Err(e) => tracing::error!("Accept error: {}", e),
            }
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
) -> BridgeResult<()> {
    let (reader, writer) = socket.into_split();
    let (outbox, inbox) = mpsc::unbounded_channel();

    let client = gateway.hub().register(outbox.clone()).await;
    tracing::info!(client = %client.id, "{} connected from {}", client.username, addr);
    let writer_task = tokio::spawn(write_responses(writer, inbox, client.clone()));

    let mut lines = BufReader::new(reader).lines();
    let result = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                gateway.handle_message(line, &outbox).await;
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        }
    };

    gateway.hub().unregister(client.id).await;
    // Acquisition tasks can still hold outbox clones
    drop(outbox);
    writer_task.abort();
    tracing::info!(client = %client.id, "{} disconnected", client.username);
    result
}

async fn write_responses(
    mut writer: OwnedWriteHalf,
    mut inbox: mpsc::UnboundedReceiver<Response>,
    client: ClientInfo,
) {
    while let Some(response) = inbox.recv().await {
        let mut line = response.to_json();
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::debug!(client = %client.id, "Write failed, closing writer: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSession;
    use crate::gateway::GatewaySettings;
    use serde_json::Value;

    async fn start_server() -> SocketAddr {
        let gateway = Arc::new(Gateway::new(
            Arc::new(DeviceSession::default()),
            GatewaySettings::default(),
        ));
        let server = BridgeServer::bind("127.0.0.1:0", gateway).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    #[tokio::test]
    async fn answers_one_line_per_request() {
        let addr = start_server().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"command\":\"disconnect\"}\n\n{\"command\":\"set_roi\",\"roi\":9,\"from\":0,\"to\":1}\n")
            .await
            .unwrap();

        let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["command"], "disconnect");
        assert_eq!(first["message"], "Nothing to do. Device not connected");
        assert_eq!(first["status"], 0);

        let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second["command"], "set_roi");
        assert_eq!(second["status"], 1);
    }

    #[tokio::test]
    async fn other_clients_see_joins() {
        let addr = start_server().await;
        let first = TcpStream::connect(addr).await.unwrap();
        let mut first_lines = BufReader::new(first).lines();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let _second = TcpStream::connect(addr).await.unwrap();
        let notice: Value =
            serde_json::from_str(&first_lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(notice["type"], "notice");
        assert_eq!(notice["sender"], "Server");
        assert_eq!(notice["message"], "User2 joined");
    }
}
