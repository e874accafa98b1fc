//! Metrics sink used by the connection layer.
//!
//! Components report through the object-safe [`MetricsSink`] trait so each
//! notifier or consumer can be handed its own sink. Two implementations ship
//! with the crate:
//!
//! - [`PrometheusSink`]: per-instance `prometheus::Registry`, gauges created
//!   lazily on first use
//! - [`MemorySink`]: lock-free map of gauge values, used by tests and by
//!   services that export metrics some other way
//!
//! # Example
//! ```no_run
//! use rbmq_link::metrics::{MetricsSink, PrometheusSink, CONNECTED};
//!
//! let sink = PrometheusSink::new("billing", "notifier");
//! sink.set_gauge(CONNECTED, 1.0);
//! println!("{}", sink.gather());
//! ```

mod memory;
mod prometheus_sink;

pub use memory::MemorySink;
pub use prometheus_sink::PrometheusSink;

use std::sync::Arc;

/// 1 while a channel is open, 0 otherwise
pub const CONNECTED: &str = "connected";
/// Failed reconnect attempts since the last success
pub const RECONNECT_COUNT: &str = "reconnect_count";
/// Queue announce failures since the last successful announce
pub const ANNOUNCE_ERRORS: &str = "announce_errors";
/// Failed declare/publish calls
pub const PUBLISH_ERRORS: &str = "publish_errors";
/// Messages waiting in the pending buffer
pub const PENDING_BUFFER_SIZE: &str = "pending_buffer_size";
/// Messages waiting in the staging buffer
pub const READING_BUFFER_SIZE: &str = "reading_buffer_size";
/// Broker-reported backlog of the consumed queue
pub const QUEUE_SIZE: &str = "queue_size";
/// Reconnect breaker state (0=closed, 1=open, 2=half-open)
pub const BREAKER_STATE: &str = "breaker_state";

/// Destination for gauge updates
pub trait MetricsSink: Send + Sync {
    /// Set a gauge to an absolute value
    fn set_gauge(&self, name: &str, value: f64);

    /// Add one to a gauge
    fn increment(&self, name: &str);

    /// Current value of a gauge, if it has ever been written
    fn gauge(&self, name: &str) -> Option<f64>;
}

/// A view over another sink that prefixes every metric name with `<prefix>_`
pub struct PrefixedSink {
    inner: Arc<dyn MetricsSink>,
    prefix: String,
}

impl PrefixedSink {
    pub fn new(inner: Arc<dyn MetricsSink>, prefix: &str) -> Self {
        Self {
            inner,
            prefix: sanitize_metric_name(prefix),
        }
    }

    fn full_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.prefix, name)
        }
    }
}

impl MetricsSink for PrefixedSink {
    fn set_gauge(&self, name: &str, value: f64) {
        self.inner.set_gauge(&self.full_name(name), value);
    }

    fn increment(&self, name: &str) {
        self.inner.increment(&self.full_name(name));
    }

    fn gauge(&self, name: &str) -> Option<f64> {
        self.inner.gauge(&self.full_name(name))
    }
}

/// Replace every character Prometheus does not accept in a metric name with `_`
pub fn sanitize_metric_name(raw: &str) -> String {
    raw.chars()
        .enumerate()
        .map(|(i, c)| {
            if c.is_ascii_alphabetic() || c == '_' || (i > 0 && c.is_ascii_digit()) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_metric_name() {
        assert_eq!(sanitize_metric_name("sms.requests-1"), "sms_requests_1");
        assert_eq!(sanitize_metric_name("9lives"), "_lives");
        assert_eq!(sanitize_metric_name("ok_name"), "ok_name");
    }

    #[test]
    fn test_prefixed_sink() {
        let inner = Arc::new(MemorySink::new());
        let prefixed = PrefixedSink::new(inner.clone(), "mobilink.requests");

        prefixed.set_gauge(CONNECTED, 1.0);
        prefixed.increment(RECONNECT_COUNT);

        assert_eq!(inner.gauge("mobilink_requests_connected"), Some(1.0));
        assert_eq!(prefixed.gauge(RECONNECT_COUNT), Some(1.0));
        assert_eq!(inner.gauge(CONNECTED), None);
    }
}
