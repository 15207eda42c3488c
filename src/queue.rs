//! Priority task queue.
//!
//! Tasks are dequeued highest priority first, FIFO within a priority tier.
//! Dependencies strictly gate dispatch: a task is only ready when every
//! dependency is completed, regardless of priority. Failed tasks re-enter the
//! queue with their original enqueue time until their retry budget runs out.
//!
//! The queue is in-memory; a [`TaskStore`] hook exists for callers that want
//! to mirror task state elsewhere, with a no-op default.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::events::{EventKind, EventLevel, EventLog};

// ─── Task model ───────────────────────────────────────────────────────────────

/// Scheduling priority. Declaration order defines dispatch precedence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Dispatched,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

fn generate_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A task submission as it arrives on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchAction {
    #[serde(default = "generate_task_id")]
    pub task_id: String,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub context_id: Option<String>,
    /// Advisory; routing is by `action` capability.
    #[serde(default)]
    pub agent_type: Option<String>,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, rename = "timeout")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// A task and everything the broker tracks about it.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub action: ResearchAction,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub retry_count: u32,
    /// Retry budget, resolved from the action or the broker default.
    pub max_retries: u32,
    /// Dispatch deadline in seconds, resolved likewise.
    pub timeout_secs: u64,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Client that submitted the task and receives its completion.
    pub origin_client: Option<String>,
    #[serde(skip)]
    entry_seq: u64,
}

// ─── Heap ordering ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Eq)]
struct QueueEntry {
    priority: TaskPriority,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: cmp returning Greater means self pops
        // first. Higher priority pops first; within a tier, earlier
        // created_at pops first (FIFO, retries keep their original slot).
        self.priority
            .cmp(&other.priority)
            .then(other.created_at.cmp(&self.created_at))
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

// ─── Errors & outcomes ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("task queue full")]
    QueueFull,

    #[error("task has no action")]
    MissingAction,

    #[error("task dependencies form a cycle")]
    CyclicDependencies,

    #[error("task id already active: {0}")]
    DuplicateTask(String),
}

impl AdmitError {
    /// Machine-readable rejection reason for `task_rejected`.
    pub fn reason_code(&self) -> &'static str {
        match self {
            AdmitError::QueueFull => "queue_overflow",
            AdmitError::MissingAction => "missing_action",
            AdmitError::CyclicDependencies => "cyclic_dependencies",
            AdmitError::DuplicateTask(_) => "duplicate_task_id",
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task_id} is {status:?}, expected {expected:?}")]
    InvalidTransition {
        task_id: String,
        status: TaskStatus,
        expected: TaskStatus,
    },
}

/// What `complete_task` did.
#[derive(Debug)]
pub enum CompletionOutcome {
    /// Transitioned to completed; the record is returned for notification.
    Completed(Box<TaskRecord>),
    /// Already terminal or no longer dispatched; the result is discarded.
    Ignored,
}

/// What `fail_task` did.
#[derive(Debug)]
pub enum FailOutcome {
    /// Retry budget remained; the task is queued again.
    Retried { retry_count: u32 },
    /// Terminal failure; the record is returned for notification.
    Failed(Box<TaskRecord>),
    /// Task unknown or already terminal.
    Ignored,
}

/// What `cancel_task` did.
#[derive(Debug)]
pub enum CancelOutcome {
    /// Cancelled; if it was in flight, the holding agent is returned.
    Cancelled { assigned_agent: Option<String> },
    NotFound,
    AlreadyTerminal,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_queue_size: usize,
}

// ─── Pluggable store ──────────────────────────────────────────────────────────

/// Hook for mirroring task state to external storage. The broker itself
/// keeps no state across restarts.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_task(&self, task: &TaskRecord) -> anyhow::Result<()>;
    async fn load_unfinished(&self) -> anyhow::Result<Vec<TaskRecord>>;
}

/// Default store: remembers nothing.
pub struct NoopStore;

#[async_trait]
impl TaskStore for NoopStore {
    async fn save_task(&self, _task: &TaskRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn load_unfinished(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(Vec::new())
    }
}

// ─── Queue ────────────────────────────────────────────────────────────────────

struct Inner {
    heap: BinaryHeap<QueueEntry>,
    tasks: HashMap<String, TaskRecord>,
    next_seq: u64,
}

impl Inner {
    fn push_entry(&mut self, record: &mut TaskRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        record.entry_seq = seq;
        self.heap.push(QueueEntry {
            priority: record.action.priority,
            created_at: record.created_at,
            seq,
            task_id: record.action.task_id.clone(),
        });
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    fn dependencies_met(&self, record: &TaskRecord) -> bool {
        record.action.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// True if following dependency edges from `start` can reach `target`.
    /// Existing tasks are acyclic, so a new cycle must pass through the
    /// task being admitted.
    fn reaches(&self, start: &[String], target: &str) -> bool {
        let mut pending: VecDeque<&str> = start.iter().map(String::as_str).collect();
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(id) = pending.pop_front() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(task) = self.tasks.get(id) {
                pending.extend(task.action.dependencies.iter().map(String::as_str));
            }
        }
        false
    }
}

pub struct TaskQueue {
    inner: Mutex<Inner>,
    max_size: usize,
    default_timeout_secs: u64,
    default_max_retries: u32,
    events: Arc<EventLog>,
    store: Arc<dyn TaskStore>,
}

impl TaskQueue {
    pub fn new(
        max_size: usize,
        default_timeout_secs: u64,
        default_max_retries: u32,
        events: Arc<EventLog>,
    ) -> Self {
        Self::with_store(
            max_size,
            default_timeout_secs,
            default_max_retries,
            events,
            Arc::new(NoopStore),
        )
    }

    pub fn with_store(
        max_size: usize,
        default_timeout_secs: u64,
        default_max_retries: u32,
        events: Arc<EventLog>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                tasks: HashMap::new(),
                next_seq: 0,
            }),
            max_size,
            default_timeout_secs,
            default_max_retries,
            events,
            store,
        }
    }

    /// Re-admit tasks the store considers unfinished. Called once at startup.
    pub async fn restore(&self) {
        let unfinished = match self.store.load_unfinished().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(err = %e, "task store restore failed — starting empty");
                return;
            }
        };
        let mut inner = self.inner.lock().await;
        for mut record in unfinished {
            record.status = TaskStatus::Queued;
            record.assigned_agent = None;
            record.dispatched_at = None;
            inner.push_entry(&mut record);
            inner.tasks.insert(record.action.task_id.clone(), record);
        }
    }

    /// Admit a task. Rejects on overflow, empty action, duplicate active id,
    /// or a dependency cycle.
    pub async fn add_task(
        &self,
        action: ResearchAction,
        origin_client: Option<String>,
    ) -> Result<String, AdmitError> {
        let record = {
            let mut inner = self.inner.lock().await;

            if action.action.trim().is_empty() {
                return Err(AdmitError::MissingAction);
            }
            if let Some(existing) = inner.tasks.get(&action.task_id) {
                if !existing.status.is_terminal() {
                    return Err(AdmitError::DuplicateTask(action.task_id.clone()));
                }
                // A terminal record may be superseded by a fresh submission.
                let stale = existing.action.task_id.clone();
                inner.tasks.remove(&stale);
            }
            if inner.count(TaskStatus::Queued) >= self.max_size {
                return Err(AdmitError::QueueFull);
            }
            if action.dependencies.contains(&action.task_id)
                || inner.reaches(&action.dependencies, &action.task_id)
            {
                return Err(AdmitError::CyclicDependencies);
            }

            let now = Utc::now();
            let mut record = TaskRecord {
                max_retries: action.max_retries.unwrap_or(self.default_max_retries),
                timeout_secs: action.timeout_secs.unwrap_or(self.default_timeout_secs),
                action,
                status: TaskStatus::Queued,
                assigned_agent: None,
                retry_count: 0,
                result: None,
                error: None,
                created_at: now,
                queued_at: now,
                dispatched_at: None,
                completed_at: None,
                origin_client,
                entry_seq: 0,
            };
            inner.push_entry(&mut record);
            inner
                .tasks
                .insert(record.action.task_id.clone(), record.clone());
            record
        };

        self.events.emit(
            EventLevel::Info,
            EventKind::TaskQueued,
            "task queued",
            json!({
                "task_id": record.action.task_id,
                "action": record.action.action,
                "priority": record.action.priority,
            }),
        );
        self.persist(&record).await;
        Ok(record.action.task_id)
    }

    /// Pop the highest-priority queued task whose dependencies are all
    /// completed. The returned task is claimed: it stays `queued` until
    /// `assign_agent` or `fail_task`, but no concurrent call will see it.
    pub async fn next_ready_task(&self) -> Option<TaskRecord> {
        let mut inner = self.inner.lock().await;
        let mut deferred = Vec::new();
        let mut ready = None;

        while let Some(entry) = inner.heap.pop() {
            let Some(record) = inner.tasks.get(&entry.task_id) else {
                continue; // stale entry for a pruned task
            };
            if record.status != TaskStatus::Queued || record.entry_seq != entry.seq {
                continue; // cancelled, superseded, or already claimed
            }
            if !inner.dependencies_met(record) {
                deferred.push(entry);
                continue;
            }
            ready = Some(record.clone());
            break;
        }

        // Gated tasks go back untouched; their entries were only borrowed.
        for entry in deferred {
            inner.heap.push(entry);
        }
        ready
    }

    /// Transition a claimed task to dispatched.
    pub async fn assign_agent(&self, task_id: &str, agent_id: &str) -> Result<(), QueueError> {
        let record = {
            let mut inner = self.inner.lock().await;
            let record = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;
            if record.status != TaskStatus::Queued {
                return Err(QueueError::InvalidTransition {
                    task_id: task_id.to_string(),
                    status: record.status,
                    expected: TaskStatus::Queued,
                });
            }
            record.status = TaskStatus::Dispatched;
            record.assigned_agent = Some(agent_id.to_string());
            record.dispatched_at = Some(Utc::now());
            record.clone()
        };
        self.persist(&record).await;
        Ok(())
    }

    /// Store a result and finish the task. Idempotent: repeat completions and
    /// completions for tasks that timed out back into the queue are ignored.
    pub async fn complete_task(&self, task_id: &str, result: Value) -> CompletionOutcome {
        let record = {
            let mut inner = self.inner.lock().await;
            let Some(record) = inner.tasks.get_mut(task_id) else {
                return CompletionOutcome::Ignored;
            };
            if record.status != TaskStatus::Dispatched {
                return CompletionOutcome::Ignored;
            }
            record.status = TaskStatus::Completed;
            record.result = Some(result);
            record.completed_at = Some(Utc::now());
            record.clone()
        };

        self.events.emit(
            EventLevel::Info,
            EventKind::TaskCompletion,
            "task completed",
            json!({
                "task_id": record.action.task_id,
                "agent_id": record.assigned_agent,
                "retry_count": record.retry_count,
            }),
        );
        self.persist(&record).await;
        CompletionOutcome::Completed(Box::new(record))
    }

    /// Fail a task. With retry budget left (and `retry` set) the task
    /// re-enters the queue keeping its original enqueue time; otherwise it
    /// fails terminally.
    pub async fn fail_task(&self, task_id: &str, error: &str, retry: bool) -> FailOutcome {
        let (outcome, record) = {
            let mut inner = self.inner.lock().await;
            let Some(mut record) = inner.tasks.get(task_id).cloned() else {
                return FailOutcome::Ignored;
            };
            if record.status.is_terminal() {
                return FailOutcome::Ignored;
            }

            if retry && record.retry_count < record.max_retries {
                record.retry_count += 1;
                record.status = TaskStatus::Queued;
                record.assigned_agent = None;
                record.dispatched_at = None;
                record.error = Some(error.to_string());
                inner.push_entry(&mut record);
                let outcome = FailOutcome::Retried {
                    retry_count: record.retry_count,
                };
                inner.tasks.insert(task_id.to_string(), record.clone());
                (outcome, record)
            } else {
                record.status = TaskStatus::Failed;
                record.error = Some(error.to_string());
                record.completed_at = Some(Utc::now());
                inner.tasks.insert(task_id.to_string(), record.clone());
                (FailOutcome::Failed(Box::new(record.clone())), record)
            }
        };

        match &outcome {
            FailOutcome::Retried { retry_count } => self.events.emit(
                EventLevel::Warning,
                EventKind::TaskRetry,
                "task requeued for retry",
                json!({
                    "task_id": task_id,
                    "retry_count": retry_count,
                    "max_retries": record.max_retries,
                    "error": error,
                }),
            ),
            FailOutcome::Failed(_) => self.events.emit(
                EventLevel::Error,
                EventKind::TaskFailure,
                "task failed",
                json!({
                    "task_id": task_id,
                    "retry_count": record.retry_count,
                    "error": error,
                }),
            ),
            FailOutcome::Ignored => {}
        }
        self.persist(&record).await;
        outcome
    }

    /// Cancel any non-terminal task.
    pub async fn cancel_task(&self, task_id: &str) -> CancelOutcome {
        let (outcome, record) = {
            let mut inner = self.inner.lock().await;
            let Some(record) = inner.tasks.get_mut(task_id) else {
                return CancelOutcome::NotFound;
            };
            if record.status.is_terminal() {
                return CancelOutcome::AlreadyTerminal;
            }
            let assigned_agent = record.assigned_agent.clone();
            record.status = TaskStatus::Cancelled;
            record.completed_at = Some(Utc::now());
            (CancelOutcome::Cancelled { assigned_agent }, record.clone())
        };

        self.events.emit(
            EventLevel::Info,
            EventKind::TaskCancelled,
            "task cancelled",
            json!({"task_id": task_id}),
        );
        self.persist(&record).await;
        outcome
    }

    /// Dispatched tasks whose deadline has passed.
    pub async fn overdue_tasks(&self) -> Vec<TaskRecord> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        inner
            .tasks
            .values()
            .filter(|record| {
                record.status == TaskStatus::Dispatched
                    && record
                        .dispatched_at
                        .map(|at| now - at > Duration::seconds(record.timeout_secs as i64))
                        .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub async fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.lock().await.tasks.get(task_id).map(|t| t.status)
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner.lock().await.tasks.get(task_id).cloned()
    }

    /// Queued and dispatched tasks.
    pub async fn active_tasks(&self) -> Vec<TaskRecord> {
        self.inner
            .lock()
            .await
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect()
    }

    pub async fn dispatched_count(&self) -> usize {
        self.inner.lock().await.count(TaskStatus::Dispatched)
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        QueueStats {
            queued: inner.count(TaskStatus::Queued),
            dispatched: inner.count(TaskStatus::Dispatched),
            completed: inner.count(TaskStatus::Completed),
            failed: inner.count(TaskStatus::Failed),
            cancelled: inner.count(TaskStatus::Cancelled),
            max_queue_size: self.max_size,
        }
    }

    /// Drop terminal tasks older than `max_age`. Returns how many were pruned.
    pub async fn cleanup_old_tasks(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut inner = self.inner.lock().await;
        let before = inner.tasks.len();
        inner.tasks.retain(|_, record| {
            !(record.status.is_terminal()
                && record.completed_at.unwrap_or(record.queued_at) < cutoff)
        });
        before - inner.tasks.len()
    }

    async fn persist(&self, record: &TaskRecord) {
        if let Err(e) = self.store.save_task(record).await {
            warn!(task_id = %record.action.task_id, err = %e, "task store write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(task_id: &str, name: &str) -> ResearchAction {
        ResearchAction {
            task_id: task_id.to_string(),
            parent_task_id: None,
            context_id: None,
            agent_type: None,
            action: name.to_string(),
            payload: Value::Null,
            priority: TaskPriority::Normal,
            dependencies: Vec::new(),
            timeout_secs: None,
            max_retries: None,
        }
    }

    fn queue(max_size: usize, retries: u32) -> TaskQueue {
        TaskQueue::new(max_size, 300, retries, Arc::new(EventLog::disabled()))
    }

    #[tokio::test]
    async fn fifo_within_priority() {
        let q = queue(10, 3);
        q.add_task(action("t1", "echo"), None).await.unwrap();
        q.add_task(action("t2", "echo"), None).await.unwrap();

        assert_eq!(q.next_ready_task().await.unwrap().action.task_id, "t1");
        assert_eq!(q.next_ready_task().await.unwrap().action.task_id, "t2");
        assert!(q.next_ready_task().await.is_none());
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first() {
        let q = queue(10, 3);
        let mut low = action("t_low", "echo");
        low.priority = TaskPriority::Low;
        let mut high = action("t_high", "echo");
        high.priority = TaskPriority::High;
        let mut critical = action("t_crit", "echo");
        critical.priority = TaskPriority::Critical;

        q.add_task(low, None).await.unwrap();
        q.add_task(high, None).await.unwrap();
        q.add_task(critical, None).await.unwrap();

        assert_eq!(q.next_ready_task().await.unwrap().action.task_id, "t_crit");
        assert_eq!(q.next_ready_task().await.unwrap().action.task_id, "t_high");
        assert_eq!(q.next_ready_task().await.unwrap().action.task_id, "t_low");
    }

    #[tokio::test]
    async fn claimed_task_is_not_returned_twice() {
        let q = queue(10, 3);
        q.add_task(action("t1", "echo"), None).await.unwrap();

        let first = q.next_ready_task().await;
        assert!(first.is_some());
        // Claimed but not yet assigned: still queued, but invisible.
        assert_eq!(q.task_status("t1").await, Some(TaskStatus::Queued));
        assert!(q.next_ready_task().await.is_none());
    }

    #[tokio::test]
    async fn dependencies_gate_dispatch_over_priority() {
        let q = queue(10, 3);
        let mut parent = action("t_parent", "echo");
        parent.priority = TaskPriority::Low;
        let mut child = action("t_child", "echo");
        child.priority = TaskPriority::Critical;
        child.dependencies = vec!["t_parent".to_string()];

        q.add_task(parent, None).await.unwrap();
        q.add_task(child, None).await.unwrap();

        // The critical child is gated; the low parent is the only ready task.
        assert_eq!(q.next_ready_task().await.unwrap().action.task_id, "t_parent");
        q.assign_agent("t_parent", "a1").await.unwrap();
        assert!(q.next_ready_task().await.is_none());

        q.complete_task("t_parent", json!({"ok": true})).await;
        assert_eq!(q.next_ready_task().await.unwrap().action.task_id, "t_child");
    }

    #[tokio::test]
    async fn unknown_dependency_keeps_task_gated() {
        let q = queue(10, 3);
        let mut task = action("t1", "echo");
        task.dependencies = vec!["nonexistent".to_string()];
        q.add_task(task, None).await.unwrap();

        assert!(q.next_ready_task().await.is_none());
        assert_eq!(q.task_status("t1").await, Some(TaskStatus::Queued));
    }

    #[tokio::test]
    async fn rejects_overflow() {
        let q = queue(2, 3);
        q.add_task(action("t1", "echo"), None).await.unwrap();
        q.add_task(action("t2", "echo"), None).await.unwrap();

        let err = q.add_task(action("t3", "echo"), None).await.unwrap_err();
        assert!(matches!(&err, AdmitError::QueueFull));
        assert_eq!(err.reason_code(), "queue_overflow");
    }

    #[tokio::test]
    async fn rejects_missing_action_and_duplicates() {
        let q = queue(10, 3);
        let err = q.add_task(action("t1", "  "), None).await.unwrap_err();
        assert!(matches!(err, AdmitError::MissingAction));

        q.add_task(action("t1", "echo"), None).await.unwrap();
        let err = q.add_task(action("t1", "echo"), None).await.unwrap_err();
        assert!(matches!(err, AdmitError::DuplicateTask(_)));
    }

    #[tokio::test]
    async fn rejects_dependency_cycles() {
        let q = queue(10, 3);
        let mut selfish = action("t1", "echo");
        selfish.dependencies = vec!["t1".to_string()];
        assert!(matches!(
            q.add_task(selfish, None).await.unwrap_err(),
            AdmitError::CyclicDependencies
        ));

        // t2 → t3 (queued), then t3 → t2 would close the loop.
        let mut t2 = action("t2", "echo");
        t2.dependencies = vec!["t3".to_string()];
        q.add_task(t2, None).await.unwrap();
        let mut t3 = action("t3", "echo");
        t3.dependencies = vec!["t2".to_string()];
        assert!(matches!(
            q.add_task(t3, None).await.unwrap_err(),
            AdmitError::CyclicDependencies
        ));
    }

    #[tokio::test]
    async fn retry_preserves_enqueue_order() {
        let q = queue(10, 3);
        q.add_task(action("t1", "echo"), None).await.unwrap();
        q.add_task(action("t2", "echo"), None).await.unwrap();

        // Claim and fail t1; it keeps its original created_at so it still
        // dispatches ahead of t2.
        let t1 = q.next_ready_task().await.unwrap();
        assert_eq!(t1.action.task_id, "t1");
        let outcome = q.fail_task("t1", "no agents", true).await;
        assert!(matches!(outcome, FailOutcome::Retried { retry_count: 1 }));

        assert_eq!(q.next_ready_task().await.unwrap().action.task_id, "t1");
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_is_terminal() {
        let q = queue(10, 1);
        q.add_task(action("t1", "echo"), None).await.unwrap();

        q.next_ready_task().await.unwrap();
        assert!(matches!(
            q.fail_task("t1", "boom", true).await,
            FailOutcome::Retried { retry_count: 1 }
        ));

        q.next_ready_task().await.unwrap();
        match q.fail_task("t1", "boom again", true).await {
            FailOutcome::Failed(record) => {
                assert_eq!(record.status, TaskStatus::Failed);
                assert_eq!(record.error.as_deref(), Some("boom again"));
            }
            other => panic!("expected terminal failure, got {other:?}"),
        }
        // Terminal tasks stay down.
        assert!(matches!(
            q.fail_task("t1", "late", true).await,
            FailOutcome::Ignored
        ));
    }

    #[tokio::test]
    async fn completion_is_idempotent() {
        let q = queue(10, 3);
        q.add_task(action("t1", "echo"), None).await.unwrap();
        q.next_ready_task().await.unwrap();
        q.assign_agent("t1", "a1").await.unwrap();

        match q.complete_task("t1", json!({"x": 7})).await {
            CompletionOutcome::Completed(record) => {
                assert_eq!(record.result, Some(json!({"x": 7})));
                assert_eq!(record.assigned_agent.as_deref(), Some("a1"));
            }
            CompletionOutcome::Ignored => panic!("first completion must land"),
        }
        assert!(matches!(
            q.complete_task("t1", json!({"x": 8})).await,
            CompletionOutcome::Ignored
        ));
        // The stored result is the first one.
        assert_eq!(q.get_task("t1").await.unwrap().result, Some(json!({"x": 7})));
    }

    #[tokio::test]
    async fn completion_requires_dispatch() {
        let q = queue(10, 3);
        q.add_task(action("t1", "echo"), None).await.unwrap();
        // Still queued, so any result for it is a stray.
        assert!(matches!(
            q.complete_task("t1", json!(1)).await,
            CompletionOutcome::Ignored
        ));
    }

    #[tokio::test]
    async fn cancel_paths() {
        let q = queue(10, 3);
        q.add_task(action("t1", "echo"), None).await.unwrap();
        q.add_task(action("t2", "echo"), None).await.unwrap();
        q.next_ready_task().await.unwrap();
        q.assign_agent("t1", "a1").await.unwrap();

        match q.cancel_task("t1").await {
            CancelOutcome::Cancelled { assigned_agent } => {
                assert_eq!(assigned_agent.as_deref(), Some("a1"));
            }
            other => panic!("expected cancel, got {other:?}"),
        }
        match q.cancel_task("t2").await {
            CancelOutcome::Cancelled { assigned_agent } => assert!(assigned_agent.is_none()),
            other => panic!("expected cancel, got {other:?}"),
        }
        assert!(matches!(q.cancel_task("t1").await, CancelOutcome::AlreadyTerminal));
        assert!(matches!(q.cancel_task("ghost").await, CancelOutcome::NotFound));

        // A cancelled queued task never dispatches.
        assert!(q.next_ready_task().await.is_none());
    }

    #[tokio::test]
    async fn overdue_detection() {
        let q = queue(10, 3);
        let mut fast = action("t1", "echo");
        fast.timeout_secs = Some(0);
        q.add_task(fast, None).await.unwrap();
        q.next_ready_task().await.unwrap();
        q.assign_agent("t1", "a1").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let overdue = q.overdue_tasks().await;
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].action.task_id, "t1");
    }

    #[tokio::test]
    async fn cleanup_prunes_only_old_terminal_tasks() {
        let q = queue(10, 3);
        q.add_task(action("t1", "echo"), None).await.unwrap();
        q.add_task(action("t2", "echo"), None).await.unwrap();
        q.next_ready_task().await.unwrap();
        q.assign_agent("t1", "a1").await.unwrap();
        q.complete_task("t1", json!(null)).await;

        // Nothing is older than an hour.
        assert_eq!(q.cleanup_old_tasks(Duration::hours(1)).await, 0);
        // With a zero window the completed task goes; the queued one stays.
        assert_eq!(q.cleanup_old_tasks(Duration::zero()).await, 1);
        assert!(q.get_task("t1").await.is_none());
        assert!(q.get_task("t2").await.is_some());
    }

    #[tokio::test]
    async fn stats_reflect_statuses() {
        let q = queue(10, 3);
        q.add_task(action("t1", "echo"), None).await.unwrap();
        q.add_task(action("t2", "echo"), None).await.unwrap();
        q.next_ready_task().await.unwrap();
        q.assign_agent("t1", "a1").await.unwrap();

        let stats = q.stats().await;
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.max_queue_size, 10);
    }
}
