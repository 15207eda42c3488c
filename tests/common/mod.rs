//! Shared helpers for broker integration tests: an ephemeral-port broker
//! and a raw WebSocket client that speaks the wire protocol directly.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use meshd::{Broker, MeshConfig};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub const DEADLINE: Duration = Duration::from_secs(10);

/// Start a broker on an ephemeral port, with config tweaks applied on top
/// of the defaults.
pub async fn start_broker(tweak: impl FnOnce(&mut MeshConfig)) -> (Arc<Broker>, SocketAddr) {
    let mut config = MeshConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..MeshConfig::default()
    };
    tweak(&mut config);
    let broker = Broker::new(config);
    let addr = broker.start().await.expect("broker should bind");
    (broker, addr)
}

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Notifications read while waiting for a response, replayed by the
    /// next `recv`/`wait_for` so nothing gets lost to interleaving.
    buffer: VecDeque<Value>,
    next_id: u64,
}

impl TestClient {
    /// Connect and consume the `connection_established` greeting.
    pub async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}"))
            .await
            .expect("websocket connect");
        let mut client = Self {
            ws,
            buffer: VecDeque::new(),
            next_id: 0,
        };
        let hello = client.recv().await;
        assert_eq!(hello["method"], "connection_established");
        client
    }

    pub async fn send_text(&mut self, text: String) {
        self.ws
            .send(Message::Text(text))
            .await
            .expect("websocket send");
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send_text(
            json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string(),
        )
        .await;
    }

    /// Send a request and wait for the response echoing its id. Frames that
    /// arrive in between are buffered, not dropped.
    pub async fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        self.send_text(
            json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id}).to_string(),
        )
        .await;

        let deadline = tokio::time::Instant::now() + DEADLINE;
        loop {
            let frame = self.socket_next(deadline).await.unwrap_or_else(|| {
                panic!("no response to {method} before deadline");
            });
            if frame["id"] == json!(id) {
                return frame;
            }
            self.buffer.push_back(frame);
        }
    }

    /// Next frame (buffered first), panicking on close or deadline.
    pub async fn recv(&mut self) -> Value {
        let deadline = tokio::time::Instant::now() + DEADLINE;
        self.next_frame(deadline)
            .await
            .expect("connection closed while a frame was expected")
    }

    /// Next frame if one arrives within `wait`; `None` on timeout.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + wait;
        self.next_frame(deadline).await
    }

    /// Skip frames until a notification with the given method arrives.
    pub async fn wait_for(&mut self, method: &str) -> Value {
        let deadline = tokio::time::Instant::now() + DEADLINE;
        loop {
            let frame = self
                .next_frame(deadline)
                .await
                .unwrap_or_else(|| panic!("never received {method}"));
            if frame["method"] == method {
                return frame;
            }
        }
    }

    /// True if the broker closes the connection without further frames.
    pub async fn expect_closed(&mut self) -> bool {
        let deadline = tokio::time::Instant::now() + DEADLINE;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, self.ws.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    async fn next_frame(&mut self, deadline: tokio::time::Instant) -> Option<Value> {
        if let Some(frame) = self.buffer.pop_front() {
            return Some(frame);
        }
        self.socket_next(deadline).await
    }

    async fn socket_next(&mut self, deadline: tokio::time::Instant) -> Option<Value> {
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, self.ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return Some(serde_json::from_str(&text).expect("frame is JSON"));
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return None,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => return None,
                Err(_) => return None,
            }
        }
    }
}

/// Poll `get_server_stats` until the registry holds `count` agents.
pub async fn wait_for_agents(client: &mut TestClient, count: u64) {
    let deadline = tokio::time::Instant::now() + DEADLINE;
    loop {
        let stats = client.request("get_server_stats", json!({})).await;
        if stats["result"]["agents"]["total_registered"] == json!(count) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry never reached {count} agents"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
