//! Reconnect pacing strategies

use crate::config::{RetryConfig, RetryStrategy};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Decides how long to wait before each reconnect attempt
pub trait RetryPolicy: Send + Sync + Debug {
    /// Delay before attempt number `attempt` (starting at 1); `None` gives up
    fn delay(&self, attempt: u32) -> Option<Duration>;
}

/// Same delay before every attempt
#[derive(Debug, Clone)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

impl FixedDelay {
    /// Retry forever with `delay` between attempts
    pub fn forever(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }
}

impl RetryPolicy for FixedDelay {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(self.delay),
        }
    }
}

/// Delay multiplied after every failed attempt, capped at `max`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }
}

/// Build the policy described by `config`; `fixed_delay` backs the fixed strategy
pub fn policy_from_config(config: &RetryConfig, fixed_delay: Duration) -> Arc<dyn RetryPolicy> {
    match config.strategy {
        RetryStrategy::Fixed => Arc::new(FixedDelay {
            delay: fixed_delay,
            max_attempts: config.max_attempts,
        }),
        RetryStrategy::Exponential => Arc::new(ExponentialBackoff {
            initial: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
        }),
    }
}
