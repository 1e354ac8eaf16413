//! A JSON client talking to the bridge server, which talks to a simulated
//! instrument over the binary protocol.

use mcpha_bridge::config::BridgeConfig;
use mcpha_bridge::device::MockInstrument;
use mcpha_bridge::protocol::{CommandCode, HistogramBuffer, HISTOGRAM_BINS};
use mcpha_bridge::server::BridgeServer;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, json: &str) {
        self.writer.write_all(json.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Next reply to `command`, skipping notices and other messages.
    async fn reply(&mut self, command: &str) -> Value {
        timeout(Duration::from_secs(5), async {
            loop {
                let line = self.lines.next_line().await.unwrap().unwrap();
                let value: Value = serde_json::from_str(&line).unwrap();
                if value["command"] == command {
                    return value;
                }
            }
        })
        .await
        .unwrap()
    }
}

#[tokio::test]
async fn test_roi_over_the_wire() {
    let mut bins = vec![0u32; HISTOGRAM_BINS];
    for bin in &mut bins[10..=20] {
        *bin = 1;
    }
    let mock = MockInstrument::new()
        .with_histogram(HistogramBuffer::new(bins))
        .spawn()
        .await
        .unwrap();

    let mut config = BridgeConfig::default();
    config.server.listen_addr = "127.0.0.1:0".into();
    let server = BridgeServer::from_config(&config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let mut client = Client::connect(addr).await;
    client
        .send(&format!(
            r#"{{"command":"connect","deviceip":"127.0.0.1","port":{}}}"#,
            mock.port()
        ))
        .await;
    let connected = client.reply("connect").await;
    assert_eq!(connected["type"], "resp");
    assert_eq!(connected["status"], 0);

    let histogram = client.reply("get_histogram_data").await;
    assert_eq!(histogram["data"].as_array().map(Vec::len), Some(HISTOGRAM_BINS));

    client
        .send(r#"{"command":"set_roi","roi":1,"from":10,"to":20}"#)
        .await;
    let roi = client.reply("set_roi").await;
    assert_eq!(roi["status"], 0);
    assert_eq!(roi["roi"], 1);
    assert_eq!(roi["start"], 10);
    assert_eq!(roi["end"], 20);
    assert_eq!(roi["counts"], 11);

    client.send(r#"{"command":"disconnect"}"#).await;
    assert_eq!(client.reply("disconnect").await["message"], "Device disconnected");
}

#[tokio::test]
async fn test_configured_device_connects_on_startup() {
    let mock = MockInstrument::new().spawn().await.unwrap();

    let mut config = BridgeConfig::default();
    config.server.listen_addr = "127.0.0.1:0".into();
    config.device.host = Some("127.0.0.1".into());
    config.device.port = Some(mock.port());
    config.device.profile.sample_rate = 8;

    let server = BridgeServer::from_config(&config).await.unwrap();
    assert!(server.gateway().device().is_connected().await);

    // Profile writes have no response; give the instrument time to read them
    timeout(Duration::from_secs(5), async {
        while mock.count(CommandCode::SetNegatorMode) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let rate = mock
        .commands()
        .into_iter()
        .find(|c| c.code == CommandCode::SetSampleRate)
        .unwrap();
    assert_eq!(rate.payload, 8);
}
