// SPDX-License-Identifier: MIT
//! Circuit breaker for per-agent dispatch.
//!
//! Protects the dispatcher from repeatedly sending tasks to an agent that
//! keeps failing. When an agent fails `failure_threshold` times in a row the
//! circuit opens and the agent is excluded from selection until a cooldown
//! elapses, after which a single probe task is allowed through.
//!
//! # State machine
//!
//! ```text
//! Closed ──(threshold consecutive failures)──► Open
//!   ▲                                           │
//!   └──(probe succeeds)──── HalfOpen ◄──(cooldown elapsed)──┘
//!                              │
//!                              └─(probe fails)─► Open, cooldown doubled
//! ```
//!
//! The cooldown grows exponentially with successive trips, capped at
//! `max_cooldown`, and resets when a probe succeeds.

use std::time::{Duration, Instant};

/// Observable state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation — dispatch is allowed.
    Closed,
    /// Failing — the agent is excluded from selection.
    Open,
    /// Cooldown elapsed — exactly one probe dispatch is allowed.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    ///
    /// Default: 5
    pub failure_threshold: u32,
    /// Cooldown after the first trip. Doubles with each successive trip.
    ///
    /// Default: 5 seconds
    pub base_cooldown: Duration,
    /// Upper bound on the cooldown growth.
    ///
    /// Default: 60 seconds
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(60),
        }
    }
}

/// Transition reported back to the caller for event emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened,
    Reopened,
    Closed,
}

enum State {
    Closed { failures: u32 },
    Open { since: Instant, cooldown: Duration },
    HalfOpen { probe_taken: bool },
}

/// Per-agent circuit breaker. Not internally synchronized; the balancer
/// guards its breaker map with its own lock.
pub struct CircuitBreaker {
    state: State,
    config: BreakerConfig,
    /// Trips since the last recovery; drives the cooldown growth.
    trips: u32,
}

impl CircuitBreaker {
    /// Starts in the `Closed` state.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: State::Closed { failures: 0 },
            config,
            trips: 0,
        }
    }

    fn cooldown_for_trip(&self, trips: u32) -> Duration {
        let factor = 1u32 << trips.saturating_sub(1).min(16);
        (self.config.base_cooldown * factor).min(self.config.max_cooldown)
    }

    /// Non-consuming check: would a dispatch currently be allowed?
    pub fn would_permit(&self) -> bool {
        match &self.state {
            State::Closed { .. } => true,
            State::Open { since, cooldown } => since.elapsed() >= *cooldown,
            State::HalfOpen { probe_taken } => !probe_taken,
        }
    }

    /// Consume a dispatch slot. In `Open` state this transitions to
    /// `HalfOpen` once the cooldown has elapsed; in `HalfOpen` only the
    /// first caller gets the probe.
    pub fn try_acquire(&mut self) -> bool {
        match &mut self.state {
            State::Closed { .. } => true,
            State::Open { since, cooldown } => {
                if since.elapsed() >= *cooldown {
                    self.state = State::HalfOpen { probe_taken: true };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probe_taken } => {
                if *probe_taken {
                    false
                } else {
                    *probe_taken = true;
                    true
                }
            }
        }
    }

    /// Record a successful dispatch outcome.
    pub fn record_success(&mut self) -> Option<BreakerTransition> {
        match self.state {
            State::HalfOpen { .. } => {
                self.state = State::Closed { failures: 0 };
                self.trips = 0;
                Some(BreakerTransition::Closed)
            }
            State::Closed { .. } => {
                self.state = State::Closed { failures: 0 };
                None
            }
            // No dispatch should have been allowed while open.
            State::Open { .. } => None,
        }
    }

    /// Record a failed dispatch outcome.
    pub fn record_failure(&mut self) -> Option<BreakerTransition> {
        match &mut self.state {
            State::Closed { failures } => {
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    self.trips += 1;
                    self.state = State::Open {
                        since: Instant::now(),
                        cooldown: self.cooldown_for_trip(self.trips),
                    };
                    Some(BreakerTransition::Opened)
                } else {
                    None
                }
            }
            State::HalfOpen { .. } => {
                self.trips += 1;
                self.state = State::Open {
                    since: Instant::now(),
                    cooldown: self.cooldown_for_trip(self.trips),
                };
                Some(BreakerTransition::Reopened)
            }
            State::Open { .. } => None,
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Consecutive failures recorded while closed (diagnostics).
    pub fn failure_count(&self) -> u32 {
        match self.state {
            State::Closed { failures } => failures,
            _ => 0,
        }
    }

    /// Current cooldown, for diagnostics. Zero unless open.
    pub fn current_cooldown(&self) -> Duration {
        match self.state {
            State::Open { cooldown, .. } => cooldown,
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            base_cooldown: Duration::from_millis(50),
            max_cooldown: Duration::from_millis(200),
        }
    }

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new(fast_config());
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.would_permit());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let mut cb = CircuitBreaker::new(fast_config());
        assert!(cb.record_failure().is_none());
        assert!(cb.record_failure().is_none());
        assert_eq!(cb.state(), BreakerState::Closed); // Not yet
        assert_eq!(cb.record_failure(), Some(BreakerTransition::Opened));
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.would_permit());
        assert!(!cb.try_acquire());
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        let mut cb = CircuitBreaker::new(fast_config());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.record_success().is_none());
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn single_probe_after_cooldown() {
        let mut cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(80));
        assert!(cb.would_permit());
        assert!(cb.try_acquire()); // the probe
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(!cb.try_acquire()); // only one probe
    }

    #[test]
    fn probe_success_closes_and_resets() {
        let mut cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(80));
        assert!(cb.try_acquire());
        assert_eq!(cb.record_success(), Some(BreakerTransition::Closed));
        assert_eq!(cb.state(), BreakerState::Closed);
        // Recovery resets the trip counter, so the next trip starts from
        // the base cooldown again.
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.current_cooldown(), Duration::from_millis(50));
    }

    #[test]
    fn probe_failure_reopens_with_longer_cooldown() {
        let mut cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.current_cooldown(), Duration::from_millis(50));

        std::thread::sleep(Duration::from_millis(80));
        assert!(cb.try_acquire());
        assert_eq!(cb.record_failure(), Some(BreakerTransition::Reopened));
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.current_cooldown(), Duration::from_millis(100));
    }

    #[test]
    fn cooldown_growth_is_capped() {
        let mut cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        for _ in 0..4 {
            std::thread::sleep(cb.current_cooldown() + Duration::from_millis(10));
            assert!(cb.try_acquire());
            cb.record_failure();
        }
        assert_eq!(cb.current_cooldown(), Duration::from_millis(200));
    }
}
