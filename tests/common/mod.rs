//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_hub::{HttpServer, RelayConfig, RelayHub, Shutdown};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A relay running on an ephemeral loopback port.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub hub: Arc<RelayHub>,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<(), std::io::Error>>,
}

impl TestRelay {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Defaults tuned for tests: every client shares 127.0.0.1 and reconnects fast.
pub fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.security.reconnect_interval_ms = 0;
    config.security.max_connections_per_ip = 50;
    config.security.http_requests_per_window = 10_000;
    config.routing.jitter_min_ms = 1;
    config.routing.jitter_max_ms = 2;
    config.status.access_token = Some("test-token".to_string());
    config
}

pub async fn start_relay(config: RelayConfig) -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let server = HttpServer::new(config, shutdown.clone());
    let hub = server.hub();
    // Sender dropped: no hot reload in tests.
    let (_, updates) = mpsc::unbounded_channel();
    let task = tokio::spawn(server.run(listener, updates));

    TestRelay {
        addr,
        hub,
        shutdown,
        task,
    }
}

pub async fn connect(relay: &TestRelay) -> Client {
    let (ws, _) = connect_async(relay.ws_url()).await.unwrap();
    ws
}

pub async fn emit(client: &mut Client, event: &str, data: Value) {
    client
        .send(Message::text(json!({ "event": event, "data": data }).to_string()))
        .await
        .unwrap();
}

/// Next JSON event from the server, failing the test after two seconds.
pub async fn next_event(client: &mut Client) -> Value {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

/// True if nothing arrives within `wait`.
#[allow(dead_code)]
pub async fn is_silent(client: &mut Client, wait: Duration) -> bool {
    tokio::time::timeout(wait, client.next()).await.is_err()
}

pub async fn register(client: &mut Client, kind: &str, id: &str) -> Value {
    emit(client, "register", json!({ "type": kind, "id": id })).await;
    next_event(client).await
}

/// Poll `check` until it holds or two seconds pass.
#[allow(dead_code)]
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
