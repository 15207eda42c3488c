// SPDX-License-Identifier: MIT
//! Typed structured event log.
//!
//! Every broker state transition emits an [`Event`] serialized as one JSON
//! line. Events always go to stderr; when a log directory is configured they
//! are mirrored to `meshd_events.jsonl`, and task lifecycle events are
//! additionally written to `meshd_tasks.jsonl` so the task stream can be
//! audited on its own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;

/// Event severity. Matches the level names used in the JSON stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Every event type the broker can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ServerStart,
    ServerStop,
    ClientConnect,
    ClientDisconnect,
    AgentRegistration,
    AgentUnregistered,
    TaskQueued,
    TaskDispatch,
    TaskCompletion,
    TaskFailure,
    TaskRetry,
    TaskCancelled,
    QueueOverflow,
    CircuitBreakerOpen,
    CircuitBreakerClose,
    HeartbeatTimeout,
    LateResult,
    MisroutedResult,
}

impl EventKind {
    /// Task lifecycle events are mirrored to the task-only stream.
    fn is_task_event(self) -> bool {
        matches!(
            self,
            EventKind::TaskQueued
                | EventKind::TaskDispatch
                | EventKind::TaskCompletion
                | EventKind::TaskFailure
                | EventKind::TaskRetry
                | EventKind::TaskCancelled
        )
    }
}

#[derive(Debug, Serialize)]
struct Event<'a> {
    level: EventLevel,
    event_type: EventKind,
    message: &'a str,
    #[serde(flatten)]
    fields: Value,
    timestamp: DateTime<Utc>,
}

/// JSON-lines event sink. Cheap to share behind an `Arc`.
pub struct EventLog {
    stderr: bool,
    file: Option<Mutex<File>>,
    task_file: Option<Mutex<File>>,
}

impl EventLog {
    /// Events go to stderr only.
    pub fn stderr_only() -> Self {
        Self {
            stderr: true,
            file: None,
            task_file: None,
        }
    }

    /// Events go to stderr plus JSON-lines files under `dir`.
    pub fn with_dir(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let open = |name: &str| -> std::io::Result<Mutex<File>> {
            Ok(Mutex::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(name))?,
            ))
        };
        Ok(Self {
            stderr: true,
            file: Some(open("meshd_events.jsonl")?),
            task_file: Some(open("meshd_tasks.jsonl")?),
        })
    }

    /// Silent sink for unit tests.
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            stderr: false,
            file: None,
            task_file: None,
        }
    }

    /// Emit one event. `fields` must be a JSON object (or `Null` for none);
    /// its keys are flattened into the serialized record.
    pub fn emit(&self, level: EventLevel, kind: EventKind, message: &str, fields: Value) {
        let fields = match fields {
            Value::Object(_) => fields,
            _ => Value::Object(serde_json::Map::new()),
        };
        let event = Event {
            level,
            event_type: kind,
            message,
            fields,
            timestamp: Utc::now(),
        };
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(_) => return,
        };

        if self.stderr {
            eprintln!("{line}");
        }
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{line}");
            }
        }
        if kind.is_task_event() {
            if let Some(file) = &self.task_file {
                if let Ok(mut f) = file.lock() {
                    let _ = writeln!(f, "{line}");
                }
            }
        }
    }
}
