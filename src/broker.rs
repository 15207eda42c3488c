//! The broker: owns every shared component, runs the dispatch loop and the
//! periodic sweeps, and implements the method surface the server exposes.
//!
//! All mutable state lives in the registry, queue, balancer, and connection
//! registry; the broker itself only wires them together, so every handler is
//! free to run concurrently.

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::balancer::{LoadBalancer, Strategy};
use crate::balancer::breaker::BreakerConfig;
use crate::config::MeshConfig;
use crate::events::{EventKind, EventLevel, EventLog};
use crate::protocol;
use crate::queue::{
    AdmitError, CancelOutcome, CompletionOutcome, FailOutcome, ResearchAction, TaskQueue,
    TaskRecord,
};
use crate::registry::{AgentRegistration, AgentRegistry};
use crate::server::{self, ConnectionRegistry};

/// Idle backoff of the dispatch loop.
const DISPATCH_POLL: Duration = Duration::from_millis(100);
/// How often dispatched tasks are checked against their deadlines.
const TIMEOUT_SWEEP: Duration = Duration::from_millis(500);
/// How often terminal tasks older than the retention window are pruned.
const RETENTION_SWEEP: Duration = Duration::from_secs(3600);
/// Retention window for terminal tasks.
const RETENTION_HOURS: i64 = 24;
/// Cadence of the metrics observability tick.
const METRICS_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TaskResult {
    task_id: String,
    status: String,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
    agent_id: String,
}

struct BrokerStats {
    started_at: DateTime<Utc>,
    started_instant: Instant,
    total_tasks_processed: AtomicU64,
    total_agents_registered: AtomicU64,
}

/// Central coordinator. One per process, shared behind an `Arc`.
pub struct Broker {
    pub config: MeshConfig,
    registry: AgentRegistry,
    queue: TaskQueue,
    balancer: LoadBalancer,
    connections: ConnectionRegistry,
    events: Arc<EventLog>,
    stats: BrokerStats,
    shutdown_tx: watch::Sender<bool>,
}

impl Broker {
    pub fn new(config: MeshConfig) -> Arc<Self> {
        let events = Arc::new(match &config.log_path {
            Some(dir) => EventLog::with_dir(dir).unwrap_or_else(|e| {
                warn!(path = %dir.display(), err = %e, "event file sink unavailable — stderr only");
                EventLog::stderr_only()
            }),
            None => EventLog::stderr_only(),
        });

        let queue = TaskQueue::new(
            config.max_queue_size,
            config.task_timeout_secs,
            config.retry_attempts,
            events.clone(),
        );
        let balancer = LoadBalancer::new(
            config.load_balance_strategy,
            config.circuit_breaker_enabled,
            BreakerConfig {
                failure_threshold: config.circuit_breaker_threshold,
                base_cooldown: Duration::from_secs(5)
                    .min(Duration::from_secs(config.circuit_breaker_cooldown_secs.max(1))),
                max_cooldown: Duration::from_secs(config.circuit_breaker_cooldown_secs.max(1)),
            },
            events.clone(),
        );

        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            registry: AgentRegistry::new(),
            queue,
            balancer,
            connections: ConnectionRegistry::new(),
            events,
            stats: BrokerStats {
                started_at: Utc::now(),
                started_instant: Instant::now(),
                total_tasks_processed: AtomicU64::new(0),
                total_agents_registered: AtomicU64::new(0),
            },
            shutdown_tx,
        })
    }

    /// Bind the listening socket and start every background loop. Returns
    /// the bound address (useful with port 0). Failing to bind is fatal.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<SocketAddr> {
        let bind_addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind broker socket at {bind_addr}"))?;
        let addr = listener.local_addr()?;

        self.queue.restore().await;

        info!(addr = %addr, strategy = %self.config.load_balance_strategy, "broker listening");
        self.events.emit(
            EventLevel::Info,
            EventKind::ServerStart,
            "broker started",
            json!({"host": self.config.host, "port": addr.port()}),
        );

        tokio::spawn(server::run(self.clone(), listener));
        tokio::spawn(self.clone().dispatch_loop());
        tokio::spawn(self.clone().timeout_loop());
        tokio::spawn(self.clone().liveness_loop());
        tokio::spawn(self.clone().retention_loop());
        tokio::spawn(self.clone().metrics_loop());
        Ok(addr)
    }

    /// Stop accepting, drop every connection, and stop the background loops.
    pub async fn shutdown(&self) {
        info!("broker shutting down");
        let _ = self.shutdown_tx.send(true);
        self.connections.clear().await;
        self.events.emit(
            EventLevel::Info,
            EventKind::ServerStop,
            "broker stopped",
            json!({"graceful": true}),
        );
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    // ─── Connection lifecycle ────────────────────────────────────────────────

    pub(crate) async fn on_client_connect(&self, client_id: &str) {
        self.events.emit(
            EventLevel::Info,
            EventKind::ClientConnect,
            "client connected",
            json!({"client_id": client_id}),
        );
    }

    pub(crate) async fn on_client_disconnect(&self, client_id: &str) {
        let agent_id = self.connections.remove(client_id).await;
        self.events.emit(
            EventLevel::Info,
            EventKind::ClientDisconnect,
            "client disconnected",
            json!({"client_id": client_id, "agent_id": agent_id}),
        );
        if let Some(agent_id) = agent_id {
            self.unregister_agent(&agent_id, "connection closed").await;
        }
    }

    // ─── Agent lifecycle ─────────────────────────────────────────────────────

    pub(crate) async fn on_agent_register(&self, client_id: &str, params: Value) {
        let registration: AgentRegistration = match serde_json::from_value(params.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!(client_id = %client_id, err = %e, "invalid agent registration");
                let agent_id = params.get("agent_id").cloned().unwrap_or(Value::Null);
                self.connections
                    .send_to_client(
                        client_id,
                        protocol::notification(
                            "registration_failed",
                            json!({"agent_id": agent_id, "error": "invalid registration"}),
                        ),
                    )
                    .await;
                return;
            }
        };

        let agent_id = registration.agent_id.clone();
        let agent_type = registration.agent_type.clone();
        let capabilities = registration.capabilities.clone();

        let drained = self.registry.register(registration).await;
        if !drained.is_empty() {
            debug!(agent_id = %agent_id, count = drained.len(), "superseded registration — requeueing tasks");
            self.requeue_tasks(&drained, "agent re-registered").await;
        }
        self.connections.bind_agent(client_id, &agent_id).await;
        self.stats
            .total_agents_registered
            .fetch_add(1, Ordering::Relaxed);

        info!(agent_id = %agent_id, agent_type = %agent_type, capabilities = ?capabilities, "agent registered");
        self.events.emit(
            EventLevel::Info,
            EventKind::AgentRegistration,
            "agent registered",
            json!({
                "agent_id": agent_id,
                "agent_type": agent_type,
                "capabilities": capabilities,
                "client_id": client_id,
            }),
        );

        self.connections
            .send_to_client(
                client_id,
                protocol::notification("registration_confirmed", json!({"agent_id": agent_id})),
            )
            .await;
    }

    pub(crate) async fn on_agent_unregister(&self, params: Value) {
        if let Some(agent_id) = params.get("agent_id").and_then(Value::as_str) {
            self.unregister_agent(agent_id, "unregistered").await;
        }
    }

    async fn unregister_agent(&self, agent_id: &str, reason: &str) {
        let Some(drained) = self.registry.unregister(agent_id).await else {
            return;
        };
        self.balancer.remove_agent(agent_id).await;
        self.connections.unbind_agent(agent_id).await;
        self.events.emit(
            EventLevel::Info,
            EventKind::AgentUnregistered,
            "agent unregistered",
            json!({"agent_id": agent_id, "reason": reason, "drained_tasks": drained.len()}),
        );
        self.requeue_tasks(&drained, "agent unregistered").await;
    }

    pub(crate) async fn on_heartbeat(&self, params: Value) {
        if let Some(agent_id) = params.get("agent_id").and_then(Value::as_str) {
            if !self.registry.heartbeat(agent_id).await {
                debug!(agent_id = %agent_id, "heartbeat from unknown agent");
            }
        }
    }

    // ─── Task submission ─────────────────────────────────────────────────────

    pub(crate) async fn on_research_action(
        &self,
        client_id: &str,
        params: Value,
        request_id: Option<&Value>,
    ) {
        let action: ResearchAction = match serde_json::from_value(params.clone()) {
            Ok(action) => action,
            Err(e) => {
                let task_id = params.get("task_id").cloned().unwrap_or(Value::Null);
                warn!(client_id = %client_id, err = %e, "invalid research_action");
                self.reject(client_id, request_id, task_id, "invalid_action").await;
                return;
            }
        };
        let task_id = action.task_id.clone();

        match self.queue.add_task(action, Some(client_id.to_string())).await {
            Ok(task_id) => {
                self.stats
                    .total_tasks_processed
                    .fetch_add(1, Ordering::Relaxed);
                let ack = match request_id {
                    Some(id) => protocol::response(
                        id,
                        json!({"task_id": task_id, "status": "queued"}),
                    ),
                    None => protocol::notification(
                        "task_queued",
                        json!({"task_id": task_id, "status": "queued"}),
                    ),
                };
                self.connections.send_to_client(client_id, ack).await;
            }
            Err(e) => {
                if matches!(&e, AdmitError::QueueFull) {
                    self.events.emit(
                        EventLevel::Error,
                        EventKind::QueueOverflow,
                        "task rejected — queue full",
                        json!({"task_id": task_id, "client_id": client_id}),
                    );
                }
                self.reject(client_id, request_id, json!(task_id), e.reason_code())
                    .await;
            }
        }
    }

    async fn reject(
        &self,
        client_id: &str,
        request_id: Option<&Value>,
        task_id: Value,
        reason: &str,
    ) {
        let reply = match request_id {
            Some(id) => protocol::error_response(id, protocol::INVALID_PARAMS, reason),
            None => protocol::notification(
                "task_rejected",
                json!({"task_id": task_id, "reason": reason}),
            ),
        };
        self.connections.send_to_client(client_id, reply).await;
    }

    // ─── Result handling ─────────────────────────────────────────────────────

    pub(crate) async fn on_task_result(&self, client_id: &str, params: Value) {
        let result: TaskResult = match serde_json::from_value(params) {
            Ok(r) => r,
            Err(e) => {
                warn!(client_id = %client_id, err = %e, "invalid task_result");
                return;
            }
        };

        let Some(record) = self.queue.get_task(&result.task_id).await else {
            self.events.emit(
                EventLevel::Warning,
                EventKind::LateResult,
                "result for unknown task dropped",
                json!({"task_id": result.task_id, "agent_id": result.agent_id}),
            );
            return;
        };
        if record.status != crate::queue::TaskStatus::Dispatched {
            self.events.emit(
                EventLevel::Warning,
                EventKind::LateResult,
                "late result dropped",
                json!({"task_id": result.task_id, "agent_id": result.agent_id}),
            );
            return;
        }
        if record.assigned_agent.as_deref() != Some(result.agent_id.as_str()) {
            self.events.emit(
                EventLevel::Warning,
                EventKind::MisroutedResult,
                "result from unassigned agent dropped",
                json!({
                    "task_id": result.task_id,
                    "agent_id": result.agent_id,
                    "assigned_agent": record.assigned_agent,
                }),
            );
            return;
        }

        self.registry
            .complete_task(&result.agent_id, &result.task_id)
            .await;

        match result.status.as_str() {
            "completed" => {
                self.balancer
                    .record_request_success(&result.agent_id, &result.task_id)
                    .await;
                match self.queue.complete_task(&result.task_id, result.result).await {
                    CompletionOutcome::Completed(record) => {
                        self.notify_completion(&record).await;
                    }
                    CompletionOutcome::Ignored => {
                        debug!(task_id = %result.task_id, "duplicate completion ignored");
                    }
                }
            }
            "error" | "failed" => {
                let error = result.error.unwrap_or_else(|| "task failed".to_string());
                self.balancer
                    .record_request_failure(&result.agent_id, &result.task_id, &error)
                    .await;
                match self.queue.fail_task(&result.task_id, &error, true).await {
                    FailOutcome::Failed(record) => self.notify_failure(&record).await,
                    FailOutcome::Retried { .. } | FailOutcome::Ignored => {}
                }
            }
            "cancelled" => {
                // The agent honored a cancel request; the task is already
                // terminal and the result is discarded.
                debug!(task_id = %result.task_id, "agent acknowledged cancellation");
            }
            other => {
                warn!(task_id = %result.task_id, status = %other, "unknown task_result status");
            }
        }
    }

    async fn notify_completion(&self, record: &TaskRecord) {
        let Some(client) = &record.origin_client else {
            return;
        };
        self.connections
            .send_to_client(
                client,
                protocol::notification(
                    "task_completed",
                    json!({
                        "task_id": record.action.task_id,
                        "result": record.result,
                        "context_id": record.action.context_id,
                    }),
                ),
            )
            .await;
    }

    async fn notify_failure(&self, record: &TaskRecord) {
        let Some(client) = &record.origin_client else {
            return;
        };
        self.connections
            .send_to_client(
                client,
                protocol::notification(
                    "task_failed",
                    json!({
                        "task_id": record.action.task_id,
                        "error": record.error,
                        "context_id": record.action.context_id,
                    }),
                ),
            )
            .await;
    }

    /// Push failed-over tasks back through the retry path, notifying
    /// originators of any that exhaust their budget.
    async fn requeue_tasks(&self, task_ids: &[String], reason: &str) {
        for task_id in task_ids {
            match self.queue.fail_task(task_id, reason, true).await {
                FailOutcome::Failed(record) => self.notify_failure(&record).await,
                FailOutcome::Retried { .. } | FailOutcome::Ignored => {}
            }
        }
    }

    // ─── Cancellation ────────────────────────────────────────────────────────

    pub(crate) async fn on_cancel_task(
        &self,
        client_id: &str,
        params: Value,
        request_id: Option<&Value>,
    ) {
        let Some(task_id) = params.get("task_id").and_then(Value::as_str) else {
            if let Some(id) = request_id {
                let reply =
                    protocol::error_response(id, protocol::INVALID_PARAMS, "task_id required");
                self.connections.send_to_client(client_id, reply).await;
            }
            return;
        };

        let outcome = self.queue.cancel_task(task_id).await;
        let cancelled = match outcome {
            CancelOutcome::Cancelled { assigned_agent } => {
                if let Some(agent_id) = assigned_agent {
                    // Best effort: the agent may ignore this; a late result
                    // will be discarded either way.
                    self.connections
                        .send_to_agent(
                            &agent_id,
                            protocol::notification(
                                "task_cancel_request",
                                json!({"task_id": task_id}),
                            ),
                        )
                        .await;
                    self.registry.complete_task(&agent_id, task_id).await;
                    // The dispatch was started but will never resolve;
                    // neutralize it so the agent's metrics stay honest.
                    self.balancer
                        .record_request_cancelled(&agent_id, task_id)
                        .await;
                }
                true
            }
            CancelOutcome::NotFound | CancelOutcome::AlreadyTerminal => false,
        };

        let reply = match request_id {
            Some(id) => protocol::response(
                id,
                json!({"task_id": task_id, "cancelled": cancelled}),
            ),
            None => protocol::notification(
                if cancelled { "task_cancelled" } else { "cancel_failed" },
                json!({"task_id": task_id}),
            ),
        };
        self.connections.send_to_client(client_id, reply).await;
    }

    // ─── Introspection ───────────────────────────────────────────────────────

    pub(crate) async fn task_status_response(&self, id: &Value, params: &Value) -> String {
        let Some(task_id) = params.get("task_id").and_then(Value::as_str) else {
            return protocol::error_response(id, protocol::INVALID_PARAMS, "task_id required");
        };
        let status = self.queue.task_status(task_id).await;
        protocol::response(id, json!({"task_id": task_id, "task_status": status}))
    }

    pub(crate) async fn task_details_response(&self, id: &Value, params: &Value) -> String {
        let Some(task_id) = params.get("task_id").and_then(Value::as_str) else {
            return protocol::error_response(id, protocol::INVALID_PARAMS, "task_id required");
        };
        match self.queue.get_task(task_id).await {
            Some(record) => protocol::response(id, json!({"task": task_payload(&record)})),
            None => protocol::error_response(id, protocol::INVALID_PARAMS, "task not found"),
        }
    }

    pub(crate) async fn active_tasks_payload(&self) -> Value {
        let tasks: Vec<Value> = self
            .queue
            .active_tasks()
            .await
            .iter()
            .map(task_payload)
            .collect();
        json!({"tasks": tasks})
    }

    pub(crate) async fn set_strategy_response(&self, id: &Value, params: &Value) -> String {
        let Some(name) = params.get("strategy").and_then(Value::as_str) else {
            return protocol::error_response(id, protocol::INVALID_PARAMS, "strategy required");
        };
        match name.parse::<Strategy>() {
            Ok(strategy) => {
                self.balancer.set_strategy(strategy).await;
                protocol::response(id, json!({"strategy": strategy}))
            }
            Err(e) => protocol::error_response(id, protocol::INVALID_PARAMS, &e.to_string()),
        }
    }

    pub(crate) async fn server_stats_payload(&self) -> Value {
        let queue_stats = self.queue.stats().await;
        let agents = self.registry.all().await;
        let metrics = self.balancer.snapshot_all().await;

        let agent_details: serde_json::Map<String, Value> = agents
            .iter()
            .map(|record| {
                (
                    record.registration.agent_id.clone(),
                    json!({
                        "agent_type": record.registration.agent_type,
                        "capabilities": record.registration.capabilities,
                        "status": record.status,
                        "current_tasks": record.current_tasks.len(),
                        "max_concurrent": record.registration.max_concurrent,
                        "load_factor": record.load_factor(),
                        "is_available": record.is_available(),
                        "last_heartbeat": record.last_heartbeat,
                    }),
                )
            })
            .collect();

        json!({
            "server": {
                "started_at": self.stats.started_at,
                "uptime_seconds": self.stats.started_instant.elapsed().as_secs_f64(),
                "is_running": !*self.shutdown_tx.borrow(),
                "total_tasks_processed": self.stats.total_tasks_processed.load(Ordering::Relaxed),
                "total_messages_sent": self.connections.sent(),
                "total_messages_received": self.connections.received(),
                "total_agents_registered": self.stats.total_agents_registered.load(Ordering::Relaxed),
                "active_connections": self.connections.client_count().await,
            },
            "load_balancer": {
                "strategy": self.balancer.strategy().await,
                "circuit_breaker_enabled": self.config.circuit_breaker_enabled,
            },
            "agents": {
                "total_registered": agents.len(),
                "available_capabilities": self.registry.capability_names().await,
                "agent_details": agent_details,
                "performance_metrics": metrics,
            },
            "task_queue": queue_stats,
        })
    }

    // ─── Background loops ────────────────────────────────────────────────────

    /// Pull ready tasks and push them to agents. The only blocking wait is a
    /// short poll, checked against the shutdown signal.
    async fn dispatch_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        info!("dispatch loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let dispatched = if self.queue.dispatched_count().await
                >= self.config.max_concurrent_tasks
            {
                false
            } else {
                match self.queue.next_ready_task().await {
                    Some(task) => self.dispatch_one(task).await,
                    None => false,
                }
            };

            if !dispatched {
                tokio::select! {
                    _ = tokio::time::sleep(DISPATCH_POLL) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        info!("dispatch loop stopped");
    }

    /// Returns true only when the task actually went out; every other path
    /// requeues or fails the task and lets the loop back off.
    async fn dispatch_one(&self, task: TaskRecord) -> bool {
        let task_id = task.action.task_id.clone();
        let action = task.action.action.clone();

        let candidates = self.registry.candidates(&action).await;
        let Some(agent_id) = self.balancer.select_agent(&candidates).await else {
            match self.queue.fail_task(&task_id, "no_available_agents", true).await {
                FailOutcome::Failed(record) => self.notify_failure(&record).await,
                FailOutcome::Retried { .. } | FailOutcome::Ignored => {}
            }
            return false;
        };

        self.balancer.record_request_start(&agent_id, &task_id).await;

        if let Err(e) = self.registry.assign_task(&agent_id, &task_id).await {
            warn!(task_id = %task_id, agent_id = %agent_id, err = %e, "assignment failed");
            self.balancer
                .record_request_failure(&agent_id, &task_id, "assignment failed")
                .await;
            match self.queue.fail_task(&task_id, "assignment failed", true).await {
                FailOutcome::Failed(record) => self.notify_failure(&record).await,
                FailOutcome::Retried { .. } | FailOutcome::Ignored => {}
            }
            return false;
        }
        if let Err(e) = self.queue.assign_agent(&task_id, &agent_id).await {
            // The task was cancelled between claim and assignment; back out
            // the started request without charging the agent a failure.
            debug!(task_id = %task_id, err = %e, "task vanished before dispatch");
            self.registry.complete_task(&agent_id, &task_id).await;
            self.balancer
                .record_request_cancelled(&agent_id, &task_id)
                .await;
            return false;
        }

        let sent = self
            .connections
            .send_to_agent(
                &agent_id,
                protocol::notification(
                    "task_request",
                    json!({
                        "task_id": task_id,
                        "task_type": action,
                        "task_data": task.action.payload,
                    }),
                ),
            )
            .await;

        if sent {
            debug!(task_id = %task_id, agent_id = %agent_id, action = %action, "task dispatched");
            self.events.emit(
                EventLevel::Info,
                EventKind::TaskDispatch,
                "task dispatched",
                json!({"task_id": task_id, "agent_id": agent_id, "action": action}),
            );
            true
        } else {
            warn!(task_id = %task_id, agent_id = %agent_id, "send failed — requeueing");
            self.balancer
                .record_request_failure(&agent_id, &task_id, "send failed")
                .await;
            self.registry.complete_task(&agent_id, &task_id).await;
            match self
                .queue
                .fail_task(&task_id, "failed to send task to agent", true)
                .await
            {
                FailOutcome::Failed(record) => self.notify_failure(&record).await,
                FailOutcome::Retried { .. } | FailOutcome::Ignored => {}
            }
            false
        }
    }

    /// Fail dispatched tasks that blew their deadline; late results for them
    /// are discarded by the result handler.
    async fn timeout_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TIMEOUT_SWEEP) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            for record in self.queue.overdue_tasks().await {
                let task_id = record.action.task_id.clone();
                let outcome = self.queue.fail_task(&task_id, "timeout", true).await;
                if matches!(&outcome, FailOutcome::Ignored) {
                    continue; // a result won the race
                }
                warn!(task_id = %task_id, agent_id = ?record.assigned_agent, "task timed out");
                if let Some(agent_id) = &record.assigned_agent {
                    self.connections
                        .send_to_agent(
                            agent_id,
                            protocol::notification(
                                "task_cancel_request",
                                json!({"task_id": task_id}),
                            ),
                        )
                        .await;
                    self.registry.complete_task(agent_id, &task_id).await;
                    self.balancer
                        .record_request_failure(agent_id, &task_id, "timeout")
                        .await;
                }
                if let FailOutcome::Failed(record) = outcome {
                    self.notify_failure(&record).await;
                }
            }
        }
    }

    /// Mark silent agents unhealthy, and unregister agents that stay silent
    /// past the grace period, draining their tasks back to the queue.
    async fn liveness_loop(self: Arc<Self>) {
        let heartbeat = self.config.heartbeat_interval_secs.max(1);
        let sweep_every = Duration::from_millis(heartbeat * 500);
        let unhealthy_after = chrono::Duration::seconds((2 * heartbeat) as i64);
        let grace = chrono::Duration::seconds(self.config.ping_timeout_secs.max(1) as i64);

        let mut shutdown = self.shutdown_signal();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(sweep_every) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let outcome = self.registry.sweep_liveness(unhealthy_after, grace).await;
            for agent_id in &outcome.newly_unhealthy {
                warn!(agent_id = %agent_id, "agent missed heartbeats — marked unhealthy");
                self.events.emit(
                    EventLevel::Warning,
                    EventKind::HeartbeatTimeout,
                    "agent marked unhealthy",
                    json!({"agent_id": agent_id}),
                );
            }
            for (agent_id, drained) in outcome.unregistered {
                warn!(agent_id = %agent_id, drained = drained.len(), "agent heartbeat timeout — unregistering");
                self.balancer.remove_agent(&agent_id).await;
                self.connections.unbind_agent(&agent_id).await;
                self.events.emit(
                    EventLevel::Warning,
                    EventKind::AgentUnregistered,
                    "agent unregistered",
                    json!({"agent_id": agent_id, "reason": "heartbeat_timeout", "drained_tasks": drained.len()}),
                );
                self.requeue_tasks(&drained, "agent heartbeat timeout").await;
            }
        }
    }

    async fn retention_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RETENTION_SWEEP) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            let pruned = self
                .queue
                .cleanup_old_tasks(chrono::Duration::hours(RETENTION_HOURS))
                .await;
            if pruned > 0 {
                info!(pruned, "old terminal tasks pruned");
            }
        }
    }

    async fn metrics_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(METRICS_TICK) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            self.balancer.log_health_snapshot().await;
        }
    }
}

/// Wire shape of a task in introspection replies.
fn task_payload(record: &TaskRecord) -> Value {
    json!({
        "task_id": record.action.task_id,
        "parent_id": record.action.parent_task_id,
        "context_id": record.action.context_id,
        "agent_type": record.action.agent_type,
        "action": record.action.action,
        "status": record.status,
        "priority": record.action.priority,
        "created_at": record.created_at,
        "queued_at": record.queued_at,
        "dispatched_at": record.dispatched_at,
        "completed_at": record.completed_at,
        "content": record.action.payload,
        "dependencies": record.action.dependencies,
        "metadata": {
            "assigned_agent": record.assigned_agent,
            "retry_count": record.retry_count,
            "max_retries": record.max_retries,
            "timeout": record.timeout_secs,
        },
        "result": record.result,
        "error": record.error,
    })
}
