//! Shared fixtures for the integration tests.
//!
//! Every test runs against `MemoryBroker`; time-dependent tests use tokio's
//! paused clock so reconnect delays elapse instantly.

#![allow(dead_code)]

use rbmq_link::config::{ConsumerConfig, NotifierConfig};
use rbmq_link::connection::{FixedDelay, RetryPolicy};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const RECONNECT_DELAY: Duration = Duration::from_millis(100);

pub fn notifier_config(capacity: usize) -> NotifierConfig {
    NotifierConfig {
        chan_capacity: capacity,
        gauge_interval_ms: 50,
        ..NotifierConfig::default()
    }
}

pub fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        queue_size_interval_secs: 1,
        ..ConsumerConfig::default()
    }
}

/// Retry every `RECONNECT_DELAY`, forever
pub fn fast_retry() -> Arc<dyn RetryPolicy> {
    Arc::new(FixedDelay::forever(RECONNECT_DELAY))
}

/// Retry every `RECONNECT_DELAY`, giving up after `attempts`
pub fn bounded_retry(attempts: u32) -> Arc<dyn RetryPolicy> {
    Arc::new(FixedDelay {
        delay: RECONNECT_DELAY,
        max_attempts: Some(attempts),
    })
}

/// Poll `condition` every 10ms of (usually paused) time until it holds
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..20_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Drive a `tokio_test` task until it completes
pub async fn finish<F: Future>(task: &mut tokio_test::task::Spawn<F>) -> F::Output {
    for _ in 0..20_000 {
        if let std::task::Poll::Ready(output) = task.poll() {
            return output;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task did not complete");
}
