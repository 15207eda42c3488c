//! Load balancing across capable agents.
//!
//! The balancer owns per-agent performance metrics and circuit breakers,
//! keyed by agent id. It never looks inside the registry: the dispatcher
//! hands it the current candidate set and gets back at most one agent id.

pub mod breaker;

use serde::Serialize;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::events::{EventKind, EventLevel, EventLog};
use crate::registry::Candidate;
use breaker::{BreakerConfig, BreakerState, BreakerTransition, CircuitBreaker};

/// Exponential moving average weight for new response-time samples.
const EMA_ALPHA: f64 = 0.3;
/// Window over which the health-score recency component decays to zero.
const RECENCY_WINDOW_SECS: f64 = 300.0;
/// Adaptive strategy weights: load, health, speed.
const ADAPTIVE_WEIGHTS: (f64, f64, f64) = (0.4, 0.4, 0.2);

// ─── Strategy ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastLoaded,
    Fastest,
    Healthiest,
    Adaptive,
}

#[derive(Debug, Error)]
#[error("unknown load balance strategy: {0}")]
pub struct UnknownStrategy(String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_loaded" => Ok(Strategy::LeastLoaded),
            "fastest" => Ok(Strategy::Fastest),
            "healthiest" => Ok(Strategy::Healthiest),
            "adaptive" => Ok(Strategy::Adaptive),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastLoaded => "least_loaded",
            Strategy::Fastest => "fastest",
            Strategy::Healthiest => "healthiest",
            Strategy::Adaptive => "adaptive",
        };
        write!(f, "{name}")
    }
}

// ─── Metrics ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct AgentMetrics {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    consecutive_failures: u32,
    /// EMA of response time in seconds. None until the first sample.
    avg_response_secs: Option<f64>,
    last_success: Option<Instant>,
    in_flight: HashMap<String, Instant>,
}

impl AgentMetrics {
    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    /// Linear decay from 1 to 0 over the recency window since the last
    /// success; optimistic 1.0 before any request has completed.
    fn recency(&self) -> f64 {
        match self.last_success {
            Some(at) => (1.0 - at.elapsed().as_secs_f64() / RECENCY_WINDOW_SECS).max(0.0),
            None => 1.0,
        }
    }

    fn health_score(&self) -> f64 {
        let failure_penalty = (1.0 - self.consecutive_failures as f64 / 5.0).max(0.0);
        0.5 * self.success_rate() + 0.3 * self.recency() + 0.2 * failure_penalty
    }

    fn observe_response_time(&mut self, secs: f64) {
        self.avg_response_secs = Some(match self.avg_response_secs {
            Some(avg) => EMA_ALPHA * secs + (1.0 - EMA_ALPHA) * avg,
            None => secs,
        });
    }
}

/// Point-in-time copy of one agent's metrics, as exposed in server stats.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub average_response_time: f64,
    pub health_score: f64,
    pub circuit_breaker: String,
}

// ─── Balancer ─────────────────────────────────────────────────────────────────

struct BalancerInner {
    metrics: HashMap<String, AgentMetrics>,
    breakers: HashMap<String, CircuitBreaker>,
    rr_cursor: usize,
}

pub struct LoadBalancer {
    strategy: Mutex<Strategy>,
    inner: Mutex<BalancerInner>,
    breaker_enabled: bool,
    breaker_config: BreakerConfig,
    events: Arc<EventLog>,
}

impl LoadBalancer {
    pub fn new(
        strategy: Strategy,
        breaker_enabled: bool,
        breaker_config: BreakerConfig,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            inner: Mutex::new(BalancerInner {
                metrics: HashMap::new(),
                breakers: HashMap::new(),
                rr_cursor: 0,
            }),
            breaker_enabled,
            breaker_config,
            events,
        }
    }

    pub async fn strategy(&self) -> Strategy {
        *self.strategy.lock().await
    }

    pub async fn set_strategy(&self, strategy: Strategy) {
        let mut current = self.strategy.lock().await;
        if *current != strategy {
            info!(strategy = %strategy, "load balance strategy changed");
            *current = strategy;
        }
    }

    /// Pick the best agent for the candidate set, or `None` when no candidate
    /// survives the circuit-breaker filter. Half-open breakers release one
    /// probe dispatch.
    pub async fn select_agent(&self, candidates: &[Candidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let strategy = *self.strategy.lock().await;
        let mut inner = self.inner.lock().await;

        let ordered = Self::preference_order(&mut inner, strategy, candidates);
        for agent_id in ordered {
            if !self.breaker_enabled {
                return Some(agent_id);
            }
            let config = self.breaker_config.clone();
            let breaker = inner
                .breakers
                .entry(agent_id.clone())
                .or_insert_with(|| CircuitBreaker::new(config));
            if breaker.try_acquire() {
                return Some(agent_id);
            }
        }
        None
    }

    fn preference_order(
        inner: &mut BalancerInner,
        strategy: Strategy,
        candidates: &[Candidate],
    ) -> Vec<String> {
        let score = |inner: &BalancerInner, candidate: &Candidate| -> f64 {
            let metrics = inner.metrics.get(&candidate.agent_id);
            match strategy {
                Strategy::RoundRobin => 0.0,
                // Lower load wins; ties broken by fewest total requests.
                Strategy::LeastLoaded => {
                    let total = metrics.map(|m| m.total_requests).unwrap_or(0);
                    -(candidate.load_factor + total as f64 * 1e-9)
                }
                Strategy::Fastest => {
                    let avg = metrics.and_then(|m| m.avg_response_secs).unwrap_or(0.0);
                    -avg
                }
                Strategy::Healthiest => metrics.map(|m| m.health_score()).unwrap_or(1.0),
                Strategy::Adaptive => {
                    let (w_load, w_health, w_speed) = ADAPTIVE_WEIGHTS;
                    let health = metrics.map(|m| m.health_score()).unwrap_or(1.0);
                    let avg = metrics.and_then(|m| m.avg_response_secs).unwrap_or(0.0);
                    w_load * (1.0 - candidate.load_factor)
                        + w_health * health
                        + w_speed * (1.0 / (1.0 + avg))
                }
            }
        };

        match strategy {
            Strategy::RoundRobin => {
                // Candidates arrive sorted by id; rotate by a shared cursor.
                let start = inner.rr_cursor % candidates.len();
                inner.rr_cursor = inner.rr_cursor.wrapping_add(1);
                candidates
                    .iter()
                    .cycle()
                    .skip(start)
                    .take(candidates.len())
                    .map(|c| c.agent_id.clone())
                    .collect()
            }
            _ => {
                let mut scored: Vec<(f64, &Candidate)> = candidates
                    .iter()
                    .map(|c| (score(inner, c), c))
                    .collect();
                scored.sort_by(|(a, ca), (b, cb)| {
                    b.partial_cmp(a)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| ca.agent_id.cmp(&cb.agent_id))
                });
                scored.into_iter().map(|(_, c)| c.agent_id.clone()).collect()
            }
        }
    }

    /// Call at dispatch time, before the task leaves the broker.
    pub async fn record_request_start(&self, agent_id: &str, task_id: &str) {
        let mut inner = self.inner.lock().await;
        let metrics = inner.metrics.entry(agent_id.to_string()).or_default();
        metrics.total_requests += 1;
        metrics.in_flight.insert(task_id.to_string(), Instant::now());
    }

    pub async fn record_request_success(&self, agent_id: &str, task_id: &str) {
        let transition = {
            let mut inner = self.inner.lock().await;
            let metrics = inner.metrics.entry(agent_id.to_string()).or_default();
            metrics.successful_requests += 1;
            metrics.consecutive_failures = 0;
            metrics.last_success = Some(Instant::now());
            if let Some(started) = metrics.in_flight.remove(task_id) {
                metrics.observe_response_time(started.elapsed().as_secs_f64());
            }
            inner
                .breakers
                .get_mut(agent_id)
                .and_then(|b| b.record_success())
        };
        if transition == Some(BreakerTransition::Closed) {
            info!(agent_id, "circuit breaker closed (probe succeeded)");
            self.events.emit(
                EventLevel::Info,
                EventKind::CircuitBreakerClose,
                "circuit breaker closed",
                json!({"agent_id": agent_id}),
            );
        }
    }

    /// Undo `record_request_start` for a task cancelled before any outcome
    /// arrived. The started request is neutralized: no success, no failure,
    /// no breaker activity, and the agent's health is left untouched.
    pub async fn record_request_cancelled(&self, agent_id: &str, task_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(metrics) = inner.metrics.get_mut(agent_id) else {
            return;
        };
        if metrics.in_flight.remove(task_id).is_some() {
            metrics.total_requests = metrics.total_requests.saturating_sub(1);
        }
    }

    pub async fn record_request_failure(&self, agent_id: &str, task_id: &str, error: &str) {
        let transition = {
            let mut inner = self.inner.lock().await;
            let metrics = inner.metrics.entry(agent_id.to_string()).or_default();
            metrics.failed_requests += 1;
            metrics.consecutive_failures += 1;
            metrics.in_flight.remove(task_id);
            if !self.breaker_enabled {
                None
            } else {
                let config = self.breaker_config.clone();
                inner
                    .breakers
                    .entry(agent_id.to_string())
                    .or_insert_with(|| CircuitBreaker::new(config))
                    .record_failure()
            }
        };
        match transition {
            Some(BreakerTransition::Opened) | Some(BreakerTransition::Reopened) => {
                warn!(agent_id, error, "circuit breaker opened");
                self.events.emit(
                    EventLevel::Warning,
                    EventKind::CircuitBreakerOpen,
                    "circuit breaker opened",
                    json!({"agent_id": agent_id, "error": error}),
                );
            }
            _ => {}
        }
    }

    /// Drop all state for an agent (metrics live for the agent's lifetime).
    pub async fn remove_agent(&self, agent_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.metrics.remove(agent_id);
        inner.breakers.remove(agent_id);
    }

    pub async fn breaker_state(&self, agent_id: &str) -> BreakerState {
        self.inner
            .lock()
            .await
            .breakers
            .get(agent_id)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    pub async fn snapshot(&self, agent_id: &str) -> Option<MetricsSnapshot> {
        let inner = self.inner.lock().await;
        let metrics = inner.metrics.get(agent_id)?;
        Some(Self::snapshot_of(&inner, agent_id, metrics))
    }

    pub async fn snapshot_all(&self) -> HashMap<String, MetricsSnapshot> {
        let inner = self.inner.lock().await;
        inner
            .metrics
            .iter()
            .map(|(agent_id, metrics)| {
                (agent_id.clone(), Self::snapshot_of(&inner, agent_id, metrics))
            })
            .collect()
    }

    fn snapshot_of(
        inner: &BalancerInner,
        agent_id: &str,
        metrics: &AgentMetrics,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: metrics.total_requests,
            successful_requests: metrics.successful_requests,
            failed_requests: metrics.failed_requests,
            consecutive_failures: metrics.consecutive_failures,
            success_rate: metrics.success_rate(),
            average_response_time: metrics.avg_response_secs.unwrap_or(0.0),
            health_score: metrics.health_score(),
            circuit_breaker: inner
                .breakers
                .get(agent_id)
                .map(|b| b.state().to_string())
                .unwrap_or_else(|| BreakerState::Closed.to_string()),
        }
    }

    /// Periodic observability tick: logs the current health picture. The
    /// recency component decays on read, so no state mutation is needed.
    pub async fn log_health_snapshot(&self) {
        let inner = self.inner.lock().await;
        for (agent_id, metrics) in &inner.metrics {
            debug!(
                agent_id = %agent_id,
                health_score = metrics.health_score(),
                success_rate = metrics.success_rate(),
                consecutive_failures = metrics.consecutive_failures,
                "agent health"
            );
        }
    }
}
