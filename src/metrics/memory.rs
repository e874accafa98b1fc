use super::MetricsSink;
use dashmap::DashMap;

/// In-memory gauge store
#[derive(Debug, Default)]
pub struct MemorySink {
    gauges: DashMap<String, f64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every gauge, sorted by name
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let mut values: Vec<(String, f64)> = self
            .gauges
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }
}

impl MetricsSink for MemorySink {
    fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.insert(name.to_string(), value);
    }

    fn increment(&self, name: &str) {
        *self.gauges.entry(name.to_string()).or_insert(0.0) += 1.0;
    }

    fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|v| *v)
    }
}
