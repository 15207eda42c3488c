//! WebSocket front door.
//!
//! One reader task and one writer task per connection. All outbound traffic
//! for a socket goes through its writer task's channel, so concurrent
//! broker-side senders never interleave partial frames. The accept loop and
//! every reader select against the broker's shutdown signal.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
};
use tracing::{debug, trace, warn};

use crate::broker::Broker;
use crate::protocol::{self, Frame};

// ─── Connection registry ─────────────────────────────────────────────────────

struct ClientHandle {
    outbound: mpsc::UnboundedSender<Message>,
    agent_id: Option<String>,
}

#[derive(Default)]
struct ConnInner {
    clients: HashMap<String, ClientHandle>,
    agent_to_client: HashMap<String, String>,
}

/// Maps client ids to live sockets and agent ids to client ids. Also keeps
/// the broker-wide message counters.
pub struct ConnectionRegistry {
    inner: RwLock<ConnInner>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ConnInner::default()),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        }
    }

    async fn insert(&self, client_id: &str, outbound: mpsc::UnboundedSender<Message>) {
        self.inner.write().await.clients.insert(
            client_id.to_string(),
            ClientHandle {
                outbound,
                agent_id: None,
            },
        );
    }

    /// Drop a connection. Returns the agent id that was bound to it, if any.
    pub async fn remove(&self, client_id: &str) -> Option<String> {
        let mut inner = self.inner.write().await;
        let handle = inner.clients.remove(client_id)?;
        if let Some(agent_id) = &handle.agent_id {
            // Only clear the reverse mapping if it still points at us; a
            // superseding registration may have moved the agent elsewhere.
            if inner.agent_to_client.get(agent_id) == Some(&client_id.to_string()) {
                inner.agent_to_client.remove(agent_id);
            }
        }
        handle.agent_id
    }

    /// Bind an agent id to a socket. Any previous socket for the same agent
    /// is unbound (it stays open as a plain client).
    pub async fn bind_agent(&self, client_id: &str, agent_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(previous) = inner
            .agent_to_client
            .insert(agent_id.to_string(), client_id.to_string())
        {
            if previous != client_id {
                if let Some(handle) = inner.clients.get_mut(&previous) {
                    handle.agent_id = None;
                }
            }
        }
        if let Some(handle) = inner.clients.get_mut(client_id) {
            // A socket re-registering under a new agent id drops its old one.
            if let Some(old) = handle.agent_id.replace(agent_id.to_string()) {
                if old != agent_id {
                    inner.agent_to_client.remove(&old);
                }
            }
        }
    }

    pub async fn unbind_agent(&self, agent_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(client_id) = inner.agent_to_client.remove(agent_id) {
            if let Some(handle) = inner.clients.get_mut(&client_id) {
                handle.agent_id = None;
            }
        }
    }

    pub async fn send_to_client(&self, client_id: &str, text: String) -> bool {
        let inner = self.inner.read().await;
        let Some(handle) = inner.clients.get(client_id) else {
            return false;
        };
        let ok = handle.outbound.send(Message::Text(text)).is_ok();
        if ok {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub async fn send_to_agent(&self, agent_id: &str, text: String) -> bool {
        let client_id = {
            let inner = self.inner.read().await;
            inner.agent_to_client.get(agent_id).cloned()
        };
        match client_id {
            Some(client_id) => self.send_to_client(&client_id, text).await,
            None => false,
        }
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    /// Drop every connection handle; writer tasks close their sockets when
    /// the channels drain.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.clients.clear();
        inner.agent_to_client.clear();
    }

    pub fn note_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Accept loop ─────────────────────────────────────────────────────────────

pub async fn run(broker: Arc<Broker>, listener: TcpListener) {
    let mut shutdown = broker.shutdown_signal();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("accept loop stopping");
                    break;
                }
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(err = %e, "accept error");
                        continue;
                    }
                };

                if broker.connections().client_count().await >= broker.config.max_connections {
                    warn!(peer = %peer, "connection limit reached — rejecting");
                    drop(stream);
                    continue;
                }

                debug!(peer = %peer, "new connection");
                let broker = broker.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(broker, stream).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }
}

async fn handle_connection(broker: Arc<Broker>, stream: TcpStream) -> anyhow::Result<()> {
    let max_bytes = broker.config.max_message_bytes;
    let ws_config = WebSocketConfig {
        max_message_size: Some(max_bytes),
        max_frame_size: Some(max_bytes),
        ..Default::default()
    };
    let ws = accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut sink, mut stream) = ws.split();

    let client_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    broker.connections().insert(&client_id, tx).await;
    broker.on_client_connect(&client_id).await;

    // Single writer per socket: everything outbound funnels through here.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    broker
        .connections()
        .send_to_client(
            &client_id,
            protocol::notification("connection_established", json!({"client_id": client_id})),
        )
        .await;

    let mut shutdown = broker.shutdown_signal();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        broker.connections().note_received();
                        match Frame::decode(&text, max_bytes) {
                            Ok(frame) => dispatch_frame(&broker, &client_id, frame).await,
                            Err(e) => {
                                // Malformed traffic: this peer does not speak
                                // the protocol, drop the connection.
                                warn!(client_id = %client_id, err = %e, "malformed frame — closing connection");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        broker
                            .connections()
                            .send_raw(&client_id, Message::Pong(data))
                            .await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(client_id = %client_id, "binary frame — closing connection");
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(client_id = %client_id, err = %e, "socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    broker.on_client_disconnect(&client_id).await;
    writer.abort();
    Ok(())
}

impl ConnectionRegistry {
    async fn send_raw(&self, client_id: &str, message: Message) {
        let inner = self.inner.read().await;
        if let Some(handle) = inner.clients.get(client_id) {
            let _ = handle.outbound.send(message);
        }
    }
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

async fn dispatch_frame(broker: &Arc<Broker>, client_id: &str, frame: Frame) {
    match frame {
        Frame::Request { id, method, params } => {
            trace!(client_id = %client_id, method = %method, "rpc request");
            let reply = match method.as_str() {
                // Task submission and cancellation work both as requests and
                // as notifications; the request form answers in the response.
                "research_action" => {
                    broker
                        .on_research_action(client_id, params, Some(&id))
                        .await;
                    None
                }
                "cancel_task" => {
                    broker.on_cancel_task(client_id, params, Some(&id)).await;
                    None
                }
                "get_task_status" => Some(broker.task_status_response(&id, &params).await),
                "get_task_details" => Some(broker.task_details_response(&id, &params).await),
                "get_active_tasks" => {
                    Some(protocol::response(&id, broker.active_tasks_payload().await))
                }
                "get_server_stats" => {
                    Some(protocol::response(&id, broker.server_stats_payload().await))
                }
                "set_strategy" => Some(broker.set_strategy_response(&id, &params).await),
                // Agent lifecycle methods are notification-only.
                "agent_register" | "agent_unregister" | "heartbeat" | "task_result" => {
                    Some(protocol::error_response(
                        &id,
                        protocol::INVALID_REQUEST,
                        "method is notification-only",
                    ))
                }
                _ => Some(protocol::error_response(
                    &id,
                    protocol::METHOD_NOT_FOUND,
                    "Method not found",
                )),
            };
            if let Some(reply) = reply {
                broker.connections().send_to_client(client_id, reply).await;
            }
        }

        Frame::Notification { method, params } => {
            trace!(client_id = %client_id, method = %method, "rpc notification");
            match method.as_str() {
                "research_action" => broker.on_research_action(client_id, params, None).await,
                "agent_register" => broker.on_agent_register(client_id, params).await,
                "agent_unregister" => broker.on_agent_unregister(params).await,
                "heartbeat" => broker.on_heartbeat(params).await,
                "task_result" => broker.on_task_result(client_id, params).await,
                "cancel_task" => broker.on_cancel_task(client_id, params, None).await,
                other => {
                    debug!(client_id = %client_id, method = %other, "unknown notification dropped");
                }
            }
        }

        // The broker never solicits requests from its peers.
        Frame::Response { id, .. } => {
            trace!(client_id = %client_id, id = %id, "unsolicited response dropped");
        }
    }
}
