use super::{sanitize_metric_name, MetricsSink};
use dashmap::DashMap;
use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};
use tracing::warn;

/// Gauges registered in a registry owned by this sink
pub struct PrometheusSink {
    registry: Registry,
    namespace: String,
    subsystem: String,
    gauges: DashMap<String, Gauge>,
}

impl PrometheusSink {
    /// Create a sink with its own registry
    pub fn new(namespace: &str, subsystem: &str) -> Self {
        Self::with_registry(Registry::new(), namespace, subsystem)
    }

    /// Create a sink that registers into an existing registry
    pub fn with_registry(registry: Registry, namespace: &str, subsystem: &str) -> Self {
        Self {
            registry,
            namespace: sanitize_metric_name(namespace),
            subsystem: sanitize_metric_name(subsystem),
            gauges: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export metrics in Prometheus text format
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    fn with_gauge(&self, name: &str, f: impl FnOnce(&Gauge)) {
        let entry = self.gauges.entry(name.to_string()).or_try_insert_with(|| {
            let opts = Opts::new(
                sanitize_metric_name(name),
                format!("rbmq {} {}", self.subsystem, name.replace('_', " ")),
            )
            .namespace(self.namespace.clone())
            .subsystem(self.subsystem.clone());
            let gauge = Gauge::with_opts(opts)?;
            self.registry.register(Box::new(gauge.clone()))?;
            Ok::<_, prometheus::Error>(gauge)
        });

        match entry {
            Ok(gauge) => f(&gauge),
            Err(e) => warn!(metric = %name, error = %e, "Failed to register gauge"),
        }
    }
}

impl MetricsSink for PrometheusSink {
    fn set_gauge(&self, name: &str, value: f64) {
        self.with_gauge(name, |g| g.set(value));
    }

    fn increment(&self, name: &str) {
        self.with_gauge(name, |g| g.inc());
    }

    fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|g| g.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CONNECTED, PUBLISH_ERRORS};

    #[test]
    fn test_gauges_are_exported() {
        let sink = PrometheusSink::new("billing", "notifier");
        sink.set_gauge(CONNECTED, 1.0);
        sink.increment(PUBLISH_ERRORS);
        sink.increment(PUBLISH_ERRORS);

        assert_eq!(sink.gauge(CONNECTED), Some(1.0));
        assert_eq!(sink.gauge(PUBLISH_ERRORS), Some(2.0));

        let output = sink.gather();
        assert!(output.contains("billing_notifier_connected 1"));
        assert!(output.contains("billing_notifier_publish_errors 2"));
    }

    #[test]
    fn test_independent_instances_do_not_collide() {
        let first = PrometheusSink::new("billing", "notifier");
        let second = PrometheusSink::new("billing", "notifier");
        first.set_gauge(CONNECTED, 1.0);
        second.set_gauge(CONNECTED, 0.0);

        assert_eq!(first.gauge(CONNECTED), Some(1.0));
        assert_eq!(second.gauge(CONNECTED), Some(0.0));
    }
}
