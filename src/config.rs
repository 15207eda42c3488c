//! Broker configuration.
//!
//! Priority: CLI / env var  >  TOML  >  built-in default.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

use crate::balancer::Strategy;
use crate::protocol;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9000;
const DEFAULT_MAX_CONCURRENT_TASKS: usize = 100;
const DEFAULT_MAX_QUEUE_SIZE: usize = 50;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_PING_TIMEOUT_SECS: u64 = 60;
const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 60;
const DEFAULT_MAX_CONNECTIONS: usize = 1024;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `meshd.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    host: Option<String>,
    port: Option<u16>,
    max_concurrent_tasks: Option<usize>,
    max_queue_size: Option<usize>,
    task_timeout_seconds: Option<u64>,
    retry_attempts: Option<u32>,
    heartbeat_interval_seconds: Option<u64>,
    ping_timeout_seconds: Option<u64>,
    load_balance_strategy: Option<String>,
    circuit_breaker_enabled: Option<bool>,
    circuit_breaker_threshold: Option<u32>,
    circuit_breaker_cooldown_seconds: Option<u64>,
    max_connections: Option<usize>,
    max_message_bytes: Option<usize>,
    log: Option<String>,
    log_path: Option<PathBuf>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
            None
        }
    }
}

// ─── CLI / env overrides ──────────────────────────────────────────────────────

/// The subset of settings the CLI can override. Everything is optional;
/// `None` falls through to the TOML layer, then the built-in default.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log: Option<String>,
    pub log_path: Option<PathBuf>,
    pub strategy: Option<String>,
}

// ─── MeshConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub host: String,
    pub port: u16,
    /// System-wide cap on dispatched (in-flight) tasks.
    pub max_concurrent_tasks: usize,
    /// Cap on queued tasks; admission beyond this is rejected.
    pub max_queue_size: usize,
    /// Default per-task timeout, overridable per action.
    pub task_timeout_secs: u64,
    /// Default per-task retry budget, overridable per action.
    pub retry_attempts: u32,
    pub heartbeat_interval_secs: u64,
    /// Grace period before an unhealthy agent is unregistered.
    pub ping_timeout_secs: u64,
    pub load_balance_strategy: Strategy,
    pub circuit_breaker_enabled: bool,
    /// Consecutive failures before a breaker opens.
    pub circuit_breaker_threshold: u32,
    /// Cap on the breaker's exponentially growing cooldown.
    pub circuit_breaker_cooldown_secs: u64,
    pub max_connections: usize,
    pub max_message_bytes: usize,
    /// Log level filter string, e.g. "debug", "info,meshd=trace".
    pub log: String,
    /// Directory for the JSON event file sinks. None = stderr only.
    pub log_path: Option<PathBuf>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            ping_timeout_secs: DEFAULT_PING_TIMEOUT_SECS,
            load_balance_strategy: Strategy::Adaptive,
            circuit_breaker_enabled: true,
            circuit_breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
            circuit_breaker_cooldown_secs: DEFAULT_BREAKER_COOLDOWN_SECS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_bytes: protocol::DEFAULT_MAX_MESSAGE_BYTES,
            log: "info".to_string(),
            log_path: None,
        }
    }
}

impl MeshConfig {
    /// Build config from CLI/env overrides plus an optional TOML file.
    pub fn new(overrides: Overrides, config_file: Option<&Path>) -> Self {
        let toml = config_file.and_then(load_toml).unwrap_or_default();
        let defaults = Self::default();

        let strategy = overrides
            .strategy
            .or(toml.load_balance_strategy)
            .and_then(|s| match s.parse::<Strategy>() {
                Ok(strategy) => Some(strategy),
                Err(e) => {
                    error!(err = %e, "invalid load_balance_strategy — using adaptive");
                    None
                }
            })
            .unwrap_or(defaults.load_balance_strategy);

        Self {
            host: overrides.host.or(toml.host).unwrap_or(defaults.host),
            port: overrides.port.or(toml.port).unwrap_or(defaults.port),
            max_concurrent_tasks: toml
                .max_concurrent_tasks
                .unwrap_or(defaults.max_concurrent_tasks),
            max_queue_size: toml.max_queue_size.unwrap_or(defaults.max_queue_size),
            task_timeout_secs: toml
                .task_timeout_seconds
                .unwrap_or(defaults.task_timeout_secs),
            retry_attempts: toml.retry_attempts.unwrap_or(defaults.retry_attempts),
            heartbeat_interval_secs: toml
                .heartbeat_interval_seconds
                .unwrap_or(defaults.heartbeat_interval_secs),
            ping_timeout_secs: toml
                .ping_timeout_seconds
                .unwrap_or(defaults.ping_timeout_secs),
            load_balance_strategy: strategy,
            circuit_breaker_enabled: toml
                .circuit_breaker_enabled
                .unwrap_or(defaults.circuit_breaker_enabled),
            circuit_breaker_threshold: toml
                .circuit_breaker_threshold
                .unwrap_or(defaults.circuit_breaker_threshold),
            circuit_breaker_cooldown_secs: toml
                .circuit_breaker_cooldown_seconds
                .unwrap_or(defaults.circuit_breaker_cooldown_secs),
            max_connections: toml.max_connections.unwrap_or(defaults.max_connections),
            max_message_bytes: toml
                .max_message_bytes
                .unwrap_or(defaults.max_message_bytes),
            log: overrides.log.or(toml.log).unwrap_or(defaults.log),
            log_path: overrides.log_path.or(toml.log_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults_when_nothing_is_given() {
        let cfg = MeshConfig::new(Overrides::default(), None);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.max_queue_size, 50);
        assert_eq!(cfg.retry_attempts, 3);
        assert_eq!(cfg.load_balance_strategy, Strategy::Adaptive);
        assert!(cfg.circuit_breaker_enabled);
    }

    #[test]
    fn toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port = 9100\nmax_queue_size = 5\nload_balance_strategy = \"least_loaded\""
        )
        .unwrap();

        let cfg = MeshConfig::new(Overrides::default(), Some(file.path()));
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.max_queue_size, 5);
        assert_eq!(cfg.load_balance_strategy, Strategy::LeastLoaded);
        // untouched fields keep their defaults
        assert_eq!(cfg.task_timeout_secs, 300);
    }

    #[test]
    fn cli_beats_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9100\nlog = \"debug\"").unwrap();

        let overrides = Overrides {
            port: Some(9200),
            ..Overrides::default()
        };
        let cfg = MeshConfig::new(overrides, Some(file.path()));
        assert_eq!(cfg.port, 9200);
        assert_eq!(cfg.log, "debug");
    }

    #[test]
    fn bad_strategy_falls_back_to_adaptive() {
        let overrides = Overrides {
            strategy: Some("fastest_ever".to_string()),
            ..Overrides::default()
        };
        let cfg = MeshConfig::new(overrides, None);
        assert_eq!(cfg.load_balance_strategy, Strategy::Adaptive);
    }
}
