//! Agent registry — registration, capability index, liveness, and
//! per-agent task assignment bookkeeping.
//!
//! The registry owns agent records by id; other components refer to agents
//! by id only. Capabilities are reverse-indexed (`action → agent ids`) so
//! dispatch candidate lookup is a single map hit.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::RwLock;

fn default_max_concurrent() -> usize {
    1
}

/// Payload of an `agent_register` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

/// Liveness/availability state of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Ready,
    Busy,
    Unhealthy,
    Unregistered,
}

/// One registered agent.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub registration: AgentRegistration,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub current_tasks: HashSet<String>,
}

impl AgentRecord {
    fn new(registration: AgentRegistration) -> Self {
        Self {
            registration,
            status: AgentStatus::Ready,
            last_heartbeat: Utc::now(),
            current_tasks: HashSet::new(),
        }
    }

    /// In-flight tasks over declared concurrency, in `[0, 1]` under the
    /// capacity invariant.
    pub fn load_factor(&self) -> f64 {
        let max = self.registration.max_concurrent.max(1);
        self.current_tasks.len() as f64 / max as f64
    }

    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Ready && self.load_factor() < 1.0
    }

    /// Re-derive ready/busy from current load, preserving unhealthy.
    fn refresh_status(&mut self) {
        if self.status == AgentStatus::Unhealthy || self.status == AgentStatus::Unregistered {
            return;
        }
        self.status = if self.load_factor() >= 1.0 {
            AgentStatus::Busy
        } else {
            AgentStatus::Ready
        };
    }
}

/// Dispatch candidate snapshot handed to the load balancer.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub agent_id: String,
    pub load_factor: f64,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent {agent_id} is at capacity ({max_concurrent})")]
    AtCapacity {
        agent_id: String,
        max_concurrent: usize,
    },
}

/// Result of one liveness sweep.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Agents newly marked unhealthy this sweep.
    pub newly_unhealthy: Vec<String>,
    /// Agents removed, each with the task ids they were still holding.
    pub unregistered: Vec<(String, Vec<String>)>,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<String, AgentRecord>,
    capabilities: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn index_capabilities(&mut self, agent_id: &str, capabilities: &[String]) {
        for capability in capabilities {
            self.capabilities
                .entry(capability.clone())
                .or_default()
                .insert(agent_id.to_string());
        }
    }

    fn unindex_capabilities(&mut self, agent_id: &str, capabilities: &[String]) {
        for capability in capabilities {
            if let Some(agents) = self.capabilities.get_mut(capability) {
                agents.remove(agent_id);
                if agents.is_empty() {
                    self.capabilities.remove(capability);
                }
            }
        }
    }

    fn remove_agent(&mut self, agent_id: &str) -> Option<Vec<String>> {
        let record = self.agents.remove(agent_id)?;
        self.unindex_capabilities(agent_id, &record.registration.capabilities);
        Some(record.current_tasks.into_iter().collect())
    }
}

/// Shared registry of all agents attached to the broker.
pub struct AgentRegistry {
    inner: RwLock<Inner>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Upsert an agent. A registration for an already-known id supersedes the
    /// old one: the previous record is dropped and its in-flight task ids are
    /// returned so the caller can requeue them.
    pub async fn register(&self, registration: AgentRegistration) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let drained = inner
            .remove_agent(&registration.agent_id)
            .unwrap_or_default();

        let agent_id = registration.agent_id.clone();
        let capabilities = registration.capabilities.clone();
        inner.agents.insert(agent_id.clone(), AgentRecord::new(registration));
        inner.index_capabilities(&agent_id, &capabilities);
        drained
    }

    /// Remove an agent, returning the task ids it was still holding.
    /// `None` if the agent was not registered.
    pub async fn unregister(&self, agent_id: &str) -> Option<Vec<String>> {
        self.inner.write().await.remove_agent(agent_id)
    }

    /// Record a heartbeat. An unhealthy agent that heartbeats again is
    /// restored to ready/busy. Returns false for unknown agents.
    pub async fn heartbeat(&self, agent_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.agents.get_mut(agent_id) {
            Some(record) => {
                record.last_heartbeat = Utc::now();
                if record.status == AgentStatus::Unhealthy {
                    record.status = AgentStatus::Ready;
                    record.refresh_status();
                }
                true
            }
            None => false,
        }
    }

    /// Book a task against an agent. Fails if the agent is unknown or would
    /// exceed its declared concurrency.
    pub async fn assign_task(&self, agent_id: &str, task_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))?;

        if record.current_tasks.len() >= record.registration.max_concurrent.max(1) {
            return Err(RegistryError::AtCapacity {
                agent_id: agent_id.to_string(),
                max_concurrent: record.registration.max_concurrent,
            });
        }
        record.current_tasks.insert(task_id.to_string());
        record.refresh_status();
        Ok(())
    }

    /// Release a task from an agent's in-flight set. Returns false if either
    /// the agent or the booking is unknown.
    pub async fn complete_task(&self, agent_id: &str, task_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.agents.get_mut(agent_id) {
            Some(record) => {
                let removed = record.current_tasks.remove(task_id);
                record.refresh_status();
                removed
            }
            None => false,
        }
    }

    /// Agents that are capable of `action` and currently available.
    pub async fn candidates(&self, action: &str) -> Vec<Candidate> {
        let inner = self.inner.read().await;
        let Some(capable) = inner.capabilities.get(action) else {
            return Vec::new();
        };
        let mut candidates: Vec<Candidate> = capable
            .iter()
            .filter_map(|agent_id| inner.agents.get(agent_id))
            .filter(|record| record.is_available())
            .map(|record| Candidate {
                agent_id: record.registration.agent_id.clone(),
                load_factor: record.load_factor(),
            })
            .collect();
        // Stable order so round-robin cursors mean something.
        candidates.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        candidates
    }

    /// Mark agents silent for longer than `unhealthy_after` as unhealthy, and
    /// remove agents that have stayed silent a further `grace` beyond that.
    pub async fn sweep_liveness(&self, unhealthy_after: Duration, grace: Duration) -> SweepOutcome {
        let now = Utc::now();
        let mut outcome = SweepOutcome::default();
        let mut inner = self.inner.write().await;

        let mut to_remove = Vec::new();
        for (agent_id, record) in inner.agents.iter_mut() {
            let silence = now - record.last_heartbeat;
            match record.status {
                AgentStatus::Ready | AgentStatus::Busy if silence > unhealthy_after => {
                    record.status = AgentStatus::Unhealthy;
                    outcome.newly_unhealthy.push(agent_id.clone());
                }
                AgentStatus::Unhealthy if silence > unhealthy_after + grace => {
                    to_remove.push(agent_id.clone());
                }
                _ => {}
            }
        }
        for agent_id in to_remove {
            if let Some(drained) = inner.remove_agent(&agent_id) {
                outcome.unregistered.push((agent_id, drained));
            }
        }
        outcome
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.inner.read().await.agents.get(agent_id).cloned()
    }

    pub async fn all(&self) -> Vec<AgentRecord> {
        self.inner.read().await.agents.values().cloned().collect()
    }

    pub async fn capability_names(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(agent_id: &str, capabilities: &[&str], max_concurrent: usize) -> AgentRegistration {
        AgentRegistration {
            agent_id: agent_id.to_string(),
            agent_type: "worker".to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            max_concurrent,
        }
    }

    #[tokio::test]
    async fn register_indexes_capabilities() {
        let registry = AgentRegistry::new();
        registry.register(registration("a1", &["search", "fetch"], 2)).await;

        let candidates = registry.candidates("search").await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].agent_id, "a1");
        assert!(registry.candidates("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn re_register_drains_in_flight_tasks() {
        let registry = AgentRegistry::new();
        registry.register(registration("a1", &["search"], 2)).await;
        registry.assign_task("a1", "t1").await.unwrap();

        let drained = registry.register(registration("a1", &["search"], 2)).await;
        assert_eq!(drained, vec!["t1".to_string()]);

        // fresh record: no in-flight tasks
        let record = registry.get("a1").await.unwrap();
        assert!(record.current_tasks.is_empty());
        assert_eq!(record.status, AgentStatus::Ready);
    }

    #[tokio::test]
    async fn assignment_respects_capacity() {
        let registry = AgentRegistry::new();
        registry.register(registration("a1", &["search"], 1)).await;

        registry.assign_task("a1", "t1").await.unwrap();
        let record = registry.get("a1").await.unwrap();
        assert_eq!(record.status, AgentStatus::Busy);
        assert!(!record.is_available());

        // at capacity: no longer a candidate, further assignment errors
        assert!(registry.candidates("search").await.is_empty());
        assert!(matches!(
            registry.assign_task("a1", "t2").await,
            Err(RegistryError::AtCapacity { .. })
        ));

        assert!(registry.complete_task("a1", "t1").await);
        let record = registry.get("a1").await.unwrap();
        assert_eq!(record.status, AgentStatus::Ready);
        assert!(record.is_available());
    }

    #[tokio::test]
    async fn unregister_returns_held_tasks() {
        let registry = AgentRegistry::new();
        registry.register(registration("a1", &["search"], 2)).await;
        registry.assign_task("a1", "t1").await.unwrap();
        registry.assign_task("a1", "t2").await.unwrap();

        let mut drained = registry.unregister("a1").await.unwrap();
        drained.sort();
        assert_eq!(drained, vec!["t1".to_string(), "t2".to_string()]);
        assert!(registry.get("a1").await.is_none());
        assert!(registry.candidates("search").await.is_empty());
    }

    #[tokio::test]
    async fn liveness_sweep_marks_then_removes() {
        let registry = AgentRegistry::new();
        registry.register(registration("a1", &["search"], 1)).await;
        registry.assign_task("a1", "t1").await.unwrap();

        // Nothing is silent yet.
        let outcome = registry
            .sweep_liveness(Duration::seconds(60), Duration::seconds(60))
            .await;
        assert!(outcome.newly_unhealthy.is_empty());
        assert!(outcome.unregistered.is_empty());

        // A zero-width window makes any silence count.
        let outcome = registry
            .sweep_liveness(Duration::zero(), Duration::seconds(60))
            .await;
        assert_eq!(outcome.newly_unhealthy, vec!["a1".to_string()]);
        assert_eq!(registry.get("a1").await.unwrap().status, AgentStatus::Unhealthy);
        // unhealthy agents are not candidates
        assert!(registry.candidates("search").await.is_empty());

        // Past the grace period the agent is removed and its task drained.
        let outcome = registry
            .sweep_liveness(Duration::zero(), Duration::zero())
            .await;
        assert_eq!(outcome.unregistered.len(), 1);
        assert_eq!(outcome.unregistered[0].0, "a1");
        assert_eq!(outcome.unregistered[0].1, vec!["t1".to_string()]);
        assert!(registry.get("a1").await.is_none());
    }

    #[tokio::test]
    async fn heartbeat_restores_unhealthy_agent() {
        let registry = AgentRegistry::new();
        registry.register(registration("a1", &["search"], 1)).await;
        registry
            .sweep_liveness(Duration::zero(), Duration::seconds(60))
            .await;
        assert_eq!(registry.get("a1").await.unwrap().status, AgentStatus::Unhealthy);

        assert!(registry.heartbeat("a1").await);
        assert_eq!(registry.get("a1").await.unwrap().status, AgentStatus::Ready);
        assert!(!registry.heartbeat("ghost").await);
    }

    #[tokio::test]
    async fn candidates_are_sorted_by_id() {
        let registry = AgentRegistry::new();
        registry.register(registration("b", &["search"], 1)).await;
        registry.register(registration("a", &["search"], 1)).await;
        registry.register(registration("c", &["search"], 1)).await;

        let ids: Vec<String> = registry
            .candidates("search")
            .await
            .into_iter()
            .map(|c| c.agent_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
