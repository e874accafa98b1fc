//! Circuit breaker guarding the reconnect loop.
//!
//! - **Closed**: dial attempts proceed, consecutive failures are counted
//! - **Open**: no dial attempts until the cool-down elapses
//! - **Half-Open**: a limited number of probe dials test whether the broker is back

use crate::config::BreakerConfig;
use crate::metrics::{MetricsSink, BREAKER_STATE};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The current state of a reconnect breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Convert state to numeric value for the gauge
    pub fn to_metric_value(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Represents a state transition in the breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct StateData {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_probes: u32,
    transition_count: u64,
    last_state_change: DateTime<Utc>,
}

impl StateData {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_probes: 0,
            transition_count: 0,
            last_state_change: Utc::now(),
        }
    }

    fn transition_to(&mut self, new_state: BreakerState) -> StateTransition {
        let reason = match (self.state, new_state) {
            (BreakerState::Closed, BreakerState::Open) => format!(
                "Failure threshold exceeded ({} consecutive dial failures)",
                self.consecutive_failures
            ),
            (BreakerState::Open, BreakerState::HalfOpen) => {
                "Cool-down elapsed, probing broker".to_string()
            }
            (BreakerState::HalfOpen, BreakerState::Closed) => "Probe dial succeeded".to_string(),
            (BreakerState::HalfOpen, BreakerState::Open) => "Probe dial failed".to_string(),
            (from, to) => format!("Transitioned from {} to {}", from, to),
        };
        let transition = StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        };

        self.state = new_state;
        self.last_state_change = transition.timestamp;
        self.transition_count += 1;
        self.half_open_probes = 0;

        match new_state {
            BreakerState::Open => self.opened_at = Some(Instant::now()),
            BreakerState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {}
        }

        transition
    }

    fn remaining_cool_down(&self, cool_down: Duration) -> Duration {
        match self.opened_at {
            Some(opened_at) => cool_down.saturating_sub(opened_at.elapsed()),
            None => Duration::ZERO,
        }
    }
}

/// Statistics for a breaker
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub transition_count: u64,
    pub last_state_change: DateTime<Utc>,
}

/// Thread-safe reconnect breaker; clones share state
#[derive(Clone)]
pub struct ReconnectBreaker {
    name: String,
    config: BreakerConfig,
    state: Arc<RwLock<StateData>>,
    metrics: Arc<dyn MetricsSink>,
}

impl ReconnectBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        metrics.set_gauge(BREAKER_STATE, BreakerState::Closed.to_metric_value());
        Self {
            name: name.into(),
            config,
            state: Arc::new(RwLock::new(StateData::new())),
            metrics,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state.read().state
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Ask for permission to dial.
    ///
    /// Returns `Err(remaining)` while the breaker is open, where `remaining`
    /// is how long the caller should wait before asking again.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.write();

        if state.state == BreakerState::Open {
            let remaining = state.remaining_cool_down(self.config.cool_down());
            if !remaining.is_zero() {
                return Err(remaining);
            }
            let transition = state.transition_to(BreakerState::HalfOpen);
            self.log_transition(&transition);
        }

        match state.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                if state.half_open_probes >= self.config.half_open_probes {
                    // Probes are still in flight; come back after another cool-down
                    Err(self.config.cool_down())
                } else {
                    state.half_open_probes += 1;
                    Ok(())
                }
            }
            BreakerState::Open => Err(self.config.cool_down()),
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.write();
        state.consecutive_failures = 0;
        if state.state != BreakerState::Closed {
            let transition = state.transition_to(BreakerState::Closed);
            self.log_transition(&transition);
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.write();
        state.consecutive_failures += 1;

        debug!(
            name = %self.name,
            current_state = %state.state,
            consecutive_failures = state.consecutive_failures,
            "Dial attempt failed"
        );

        let should_open = match state.state {
            BreakerState::Closed => state.consecutive_failures >= self.config.failure_threshold,
            BreakerState::HalfOpen => true,
            BreakerState::Open => false,
        };
        if should_open {
            let transition = state.transition_to(BreakerState::Open);
            self.log_transition(&transition);
        }
    }

    /// Manually close the breaker
    pub fn reset(&self) {
        let mut state = self.state.write();
        if state.state != BreakerState::Closed {
            let transition = state.transition_to(BreakerState::Closed);
            self.log_transition(&transition);
        }
        state.consecutive_failures = 0;
    }

    pub fn stats(&self) -> BreakerStats {
        let state = self.state.read();
        BreakerStats {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            transition_count: state.transition_count,
            last_state_change: state.last_state_change,
        }
    }

    fn log_transition(&self, transition: &StateTransition) {
        if transition.to == BreakerState::Open {
            warn!(
                name = %self.name,
                from = %transition.from,
                to = %transition.to,
                reason = %transition.reason,
                "Reconnect breaker state transition"
            );
        } else {
            info!(
                name = %self.name,
                from = %transition.from,
                to = %transition.to,
                reason = %transition.reason,
                "Reconnect breaker state transition"
            );
        }
        self.metrics
            .set_gauge(BREAKER_STATE, transition.to.to_metric_value());
    }
}

impl fmt::Debug for ReconnectBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;

    fn breaker(threshold: u32, cool_down_ms: u64) -> (ReconnectBreaker, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let config = BreakerConfig {
            failure_threshold: threshold,
            cool_down_ms,
            half_open_probes: 1,
        };
        (ReconnectBreaker::new("test", config, sink.clone()), sink)
    }

    #[test]
    fn test_state_metric_values() {
        assert_eq!(BreakerState::Closed.to_metric_value(), 0.0);
        assert_eq!(BreakerState::Open.to_metric_value(), 1.0);
        assert_eq!(BreakerState::HalfOpen.to_metric_value(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let (breaker, sink) = breaker(3, 1000);
        assert!(breaker.try_acquire().is_ok());

        for _ in 0..3 {
            breaker.record_failure();
        }

        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(sink.gauge(BREAKER_STATE), Some(1.0));
        let remaining = breaker.try_acquire().unwrap_err();
        assert!(remaining <= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cool_down_then_closes() {
        let (breaker, sink) = breaker(1, 500);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(501)).await;
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(sink.gauge(BREAKER_STATE), Some(2.0));

        // Only one probe admitted while it is outstanding
        assert!(breaker.try_acquire().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);
        assert_eq!(sink.gauge(BREAKER_STATE), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let (breaker, _) = breaker(1, 500);
        breaker.record_failure();
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(breaker.try_acquire().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.stats().transition_count, 3);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let (breaker, _) = breaker(1, 60_000);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }
}
