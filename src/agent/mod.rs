// SPDX-License-Identifier: MIT
//! Agent-side runtime.
//!
//! Worker processes link this module to attach to a broker: connect with
//! exponential backoff and jitter, register capabilities, execute incoming
//! `task_request`s on local handlers (up to `max_concurrent` at once), send
//! heartbeats, and reconnect when the socket drops. Handlers may also send
//! solicited requests back through the broker with per-request timeouts.
//!
//! ```rust,ignore
//! use meshd::agent::{AgentConfig, MeshAgent, TaskError, TaskHandler};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl TaskHandler for Echo {
//!     async fn handle(&self, _task_type: &str, data: serde_json::Value)
//!         -> Result<serde_json::Value, TaskError>
//!     {
//!         Ok(data)
//!     }
//! }
//!
//! let agent = std::sync::Arc::new(
//!     MeshAgent::new(AgentConfig::new("worker", "ws://127.0.0.1:9000"))
//!         .with_handler("echo", Echo),
//! );
//! tokio::spawn(agent.clone().run());
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng as _;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::protocol::{self, Frame, RpcError, METHOD_NOT_FOUND};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to connect to broker after {attempts} attempts")]
    ConnectFailed { attempts: u32 },

    #[error("not connected to broker")]
    NotConnected,

    #[error("request timed out: {method}")]
    RequestTimeout { method: String },

    #[error("broker error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("agent stopped")]
    Stopped,
}

/// Failure returned by a task handler; reported to the broker as a
/// `task_result` with `status = "error"`.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TaskError(pub String);

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        Self(e.to_string())
    }
}

// ─── Handler contract ────────────────────────────────────────────────────────

/// One capability implementation. Handlers run concurrently up to the
/// agent's `max_concurrent`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task_type: &str, task_data: Value) -> Result<Value, TaskError>;
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    /// Stable for the session. Defaults to `{agent_type}-{short uuid}`.
    pub agent_id: String,
    pub agent_type: String,
    /// Declared capabilities. Empty = derive from registered handlers.
    pub capabilities: Vec<String>,
    pub max_concurrent: usize,
    pub heartbeat_interval: Duration,
    /// Timeout for solicited requests to the broker.
    pub request_timeout: Duration,
    /// Connection attempts before giving up.
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub max_message_bytes: usize,
}

impl AgentConfig {
    pub fn new(agent_type: impl Into<String>, server_url: impl Into<String>) -> Self {
        let agent_type = agent_type.into();
        let agent_id = format!(
            "{}-{}",
            agent_type,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            server_url: server_url.into(),
            agent_id,
            agent_type,
            capabilities: Vec::new(),
            max_concurrent: 1,
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            max_retries: 15,
            base_retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(300),
            max_message_bytes: protocol::DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// `base * 2^attempt`, capped. Jitter is applied separately.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u64 << attempt.min(16);
    base.checked_mul(factor as u32).unwrap_or(cap).min(cap)
}

/// Add up to 10% of uniform random jitter so reconnecting fleets spread out.
fn with_jitter(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..=0.1) * delay.as_secs_f64();
    delay + Duration::from_secs_f64(jitter)
}

/// Canonical map key for a JSON-RPC id value.
fn id_key(id: &Value) -> String {
    id.to_string()
}

// ─── Runtime ─────────────────────────────────────────────────────────────────

pub struct MeshAgent {
    config: AgentConfig,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, AgentError>>>>,
    cancelled: Mutex<HashSet<String>>,
    slots: Arc<Semaphore>,
    request_seq: AtomicU64,
}

impl MeshAgent {
    pub fn new(config: AgentConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            handlers: HashMap::new(),
            running: AtomicBool::new(false),
            shutdown_tx,
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            slots,
            request_seq: AtomicU64::new(0),
        }
    }

    /// Register a handler for an action. Builder style; call before `run`.
    pub fn with_handler(
        mut self,
        action: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> Self {
        self.handlers.insert(action.into(), Arc::new(handler));
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    fn capabilities(&self) -> Vec<String> {
        if !self.config.capabilities.is_empty() {
            return self.config.capabilities.clone();
        }
        let mut capabilities: Vec<String> = self.handlers.keys().cloned().collect();
        capabilities.sort();
        capabilities
    }

    /// Connect, register, and process tasks until [`stop`](Self::stop) is
    /// called. Reconnects automatically when the socket drops; in-flight
    /// tasks at the moment of disconnect are abandoned and time out on the
    /// broker.
    pub async fn run(self: Arc<Self>) -> Result<(), AgentError> {
        self.running.store(true, Ordering::SeqCst);

        loop {
            let ws = match self.connect_with_backoff().await {
                Ok(ws) => ws,
                Err(AgentError::Stopped) => break,
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            };

            info!(agent_id = %self.config.agent_id, url = %self.config.server_url, "connected to broker");
            self.session(ws).await;
            self.drop_connection().await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            info!(agent_id = %self.config.agent_id, "connection lost — reconnecting");
        }
        Ok(())
    }

    /// Graceful shutdown: unregister, close the socket, stop the run loop.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(agent_id = %self.config.agent_id, "agent stopping");
        if self
            .send_text(protocol::notification(
                "agent_unregister",
                json!({"agent_id": self.config.agent_id}),
            ))
            .await
        {
            // Give the writer a moment to flush the unregister before the
            // socket comes down; the broker cleans up either way.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let _ = self.shutdown_tx.send(true);
    }

    /// Send a solicited request to the broker and await its response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, AgentError> {
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = json!(format!("{}-req-{}", self.config.agent_id, seq));
        let key = id_key(&id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        if !self.send_text(protocol::request(&id, method, params)).await {
            self.pending.lock().await.remove(&key);
            return Err(AgentError::NotConnected);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AgentError::NotConnected),
            Err(_) => {
                self.pending.lock().await.remove(&key);
                Err(AgentError::RequestTimeout {
                    method: method.to_string(),
                })
            }
        }
    }

    // ─── Connection management ───────────────────────────────────────────────

    async fn connect_with_backoff(&self) -> Result<WsStream, AgentError> {
        let mut shutdown = self.shutdown_tx.subscribe();

        for attempt in 1..=self.config.max_retries {
            if !self.running.load(Ordering::SeqCst) {
                return Err(AgentError::Stopped);
            }
            match connect_async(&self.config.server_url).await {
                Ok((ws, _)) => return Ok(ws),
                Err(e) => {
                    warn!(
                        agent_id = %self.config.agent_id,
                        attempt,
                        max = self.config.max_retries,
                        err = %e,
                        "broker connection failed"
                    );
                    if attempt < self.config.max_retries {
                        let delay = with_jitter(backoff_delay(
                            attempt,
                            self.config.base_retry_delay,
                            self.config.max_retry_delay,
                        ));
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return Err(AgentError::Stopped);
                                }
                            }
                        }
                    }
                }
            }
        }
        Err(AgentError::ConnectFailed {
            attempts: self.config.max_retries,
        })
    }

    async fn session(self: &Arc<Self>, ws: WsStream) {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock().await = Some(tx.clone());

        // Single writer per socket.
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.send_text(protocol::notification(
            "agent_register",
            json!({
                "agent_id": self.config.agent_id,
                "agent_type": self.config.agent_type,
                "capabilities": self.capabilities(),
                "max_concurrent": self.config.max_concurrent,
            }),
        ))
        .await;

        let heartbeat = tokio::spawn(heartbeat_loop(
            tx.clone(),
            self.config.agent_id.clone(),
            self.config.heartbeat_interval,
            self.shutdown_tx.subscribe(),
        ));
        drop(tx);

        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                        Some(Ok(Message::Ping(data))) => {
                            self.send_message(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(err = %e, "socket error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
        heartbeat.abort();
        writer.abort();
    }

    /// Tear down per-connection state and fail anything still waiting.
    async fn drop_connection(&self) {
        *self.outbound.lock().await = None;
        let pending: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(AgentError::NotConnected));
        }
    }

    async fn send_message(&self, message: Message) -> bool {
        let outbound = self.outbound.lock().await;
        match outbound.as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    async fn send_text(&self, text: String) -> bool {
        self.send_message(Message::Text(text)).await
    }

    // ─── Inbound frames ──────────────────────────────────────────────────────

    async fn handle_frame(self: &Arc<Self>, text: &str) {
        let frame = match Frame::decode(text, self.config.max_message_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(err = %e, "malformed frame from broker dropped");
                return;
            }
        };

        match frame {
            Frame::Request { id, method, params } => {
                let reply = match method.as_str() {
                    "ping" => protocol::response(
                        &id,
                        json!({"agent_id": self.config.agent_id, "status": "alive"}),
                    ),
                    "status_request" => protocol::response(&id, self.status_payload()),
                    "task_request" => {
                        self.spawn_task(params).await;
                        protocol::response(&id, json!({"status": "received"}))
                    }
                    _ => protocol::error_response(&id, METHOD_NOT_FOUND, "Method not found"),
                };
                self.send_text(reply).await;
            }

            Frame::Notification { method, params } => match method.as_str() {
                "task_request" => self.spawn_task(params).await,
                "task_cancel_request" => {
                    if let Some(task_id) = params.get("task_id").and_then(Value::as_str) {
                        debug!(task_id = %task_id, "cancel requested");
                        self.cancelled.lock().await.insert(task_id.to_string());
                    }
                }
                "registration_confirmed" => {
                    info!(agent_id = %self.config.agent_id, "registration confirmed");
                }
                "shutdown" => {
                    info!(agent_id = %self.config.agent_id, "shutdown requested by broker");
                    self.stop().await;
                }
                "connection_established" | "heartbeat" => {}
                other => debug!(method = %other, "unhandled notification"),
            },

            Frame::Response { id, result, error } => {
                let key = id_key(&id);
                let Some(tx) = self.pending.lock().await.remove(&key) else {
                    debug!(id = %id, "response with no pending request");
                    return;
                };
                let outcome = match error {
                    Some(RpcError { code, message, .. }) => Err(AgentError::Rpc { code, message }),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
        }
    }

    async fn spawn_task(self: &Arc<Self>, params: Value) {
        let task_id = params
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let task_type = params
            .get("task_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let (Some(task_id), Some(task_type)) = (task_id, task_type) else {
            warn!("task_request missing task_id or task_type");
            return;
        };
        let task_data = params.get("task_data").cloned().unwrap_or(Value::Null);

        let Some(handler) = self.handlers.get(&task_type).cloned() else {
            warn!(task_id = %task_id, task_type = %task_type, "no handler for task");
            self.send_task_result(&task_id, Err(TaskError::new(format!(
                "no handler for action: {task_type}"
            ))))
            .await;
            return;
        };

        let agent = self.clone();
        let slots = self.slots.clone();
        tokio::spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };
            debug!(task_id = %task_id, task_type = %task_type, "executing task");
            let result = handler.handle(&task_type, task_data).await;

            // A cancel request that arrived while we were executing wins;
            // the broker has already discarded the task.
            if agent.cancelled.lock().await.remove(&task_id) {
                debug!(task_id = %task_id, "result suppressed after cancel");
                return;
            }
            agent.send_task_result(&task_id, result).await;
        });
    }

    async fn send_task_result(&self, task_id: &str, result: Result<Value, TaskError>) {
        let params = match result {
            Ok(value) => json!({
                "task_id": task_id,
                "status": "completed",
                "result": value,
                "agent_id": self.config.agent_id,
            }),
            Err(e) => json!({
                "task_id": task_id,
                "status": "error",
                "error": e.to_string(),
                "agent_id": self.config.agent_id,
            }),
        };
        if !self
            .send_text(protocol::notification("task_result", params))
            .await
        {
            warn!(task_id = %task_id, "task result lost — not connected");
        }
    }

    fn status_payload(&self) -> Value {
        let max = self.config.max_concurrent.max(1);
        json!({
            "agent_id": self.config.agent_id,
            "agent_type": self.config.agent_type,
            "status": if self.running.load(Ordering::SeqCst) { "running" } else { "stopped" },
            "active_tasks": max - self.slots.available_permits().min(max),
            "capabilities": self.capabilities(),
        })
    }
}

async fn heartbeat_loop(
    tx: mpsc::UnboundedSender<Message>,
    agent_id: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick fires immediately; registration covers it
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frame = protocol::notification("heartbeat", json!({"agent_id": agent_id}));
                if tx.send(Message::Text(frame)).is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(10));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(20));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_secs(40));
        // 5 * 2^10 = 5120s, clamped to the cap
        assert_eq!(backoff_delay(10, base, cap), cap);
        // absurd attempts do not overflow
        assert_eq!(backoff_delay(u32::MAX, base, cap), cap);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let delay = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = with_jitter(delay);
            assert!(jittered >= delay);
            assert!(jittered <= delay + Duration::from_secs(1) + Duration::from_millis(1));
        }
    }

    #[test]
    fn default_agent_id_carries_type_prefix() {
        let config = AgentConfig::new("network", "ws://127.0.0.1:9000");
        assert!(config.agent_id.starts_with("network-"));
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.max_retries, 15);
    }

    struct Nop;

    #[async_trait]
    impl TaskHandler for Nop {
        async fn handle(&self, _task_type: &str, _data: Value) -> Result<Value, TaskError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn capabilities_derive_from_handlers() {
        let agent = MeshAgent::new(AgentConfig::new("worker", "ws://127.0.0.1:9000"))
            .with_handler("search", Nop)
            .with_handler("fetch", Nop);
        assert_eq!(agent.capabilities(), vec!["fetch", "search"]);

        let mut config = AgentConfig::new("worker", "ws://127.0.0.1:9000");
        config.capabilities = vec!["declared".to_string()];
        let agent = MeshAgent::new(config).with_handler("search", Nop);
        assert_eq!(agent.capabilities(), vec!["declared"]);
    }

    #[test]
    fn id_keys_distinguish_types() {
        assert_ne!(id_key(&json!(1)), id_key(&json!("1")));
        assert_eq!(id_key(&json!("a-req-1")), id_key(&json!("a-req-1")));
    }
}
