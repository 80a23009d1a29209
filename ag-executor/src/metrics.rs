use dashmap::DashMap;
use std::collections::BTreeMap;

/// Counter sink keyed `<operation_type>.<outcome>`.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, key: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, key: &str) {
        tracing::debug!(metric = key, value = 1u64, "counter incremented");
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counts: DashMap<String, u64>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counts.get(key).map(|v| *v).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, key: &str) {
        *self.counts.entry(key.to_string()).or_insert(0) += 1;
    }
}
