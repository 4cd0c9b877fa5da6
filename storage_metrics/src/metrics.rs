use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::OnceCell;
use prometheus::{
    histogram_opts, opts, HistogramTimer, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

use crate::helpers;

/// Process-wide access point for storage metrics. Optional; components accept
/// an `Arc<StorageMetrics>` directly and never read this themselves.
pub static METRICS: OnceCell<Arc<StorageMetrics>> = OnceCell::new();

#[derive(Debug)]
pub struct StorageMetrics {
    pub operation_times: HistogramVec,
    pub operation_calls: IntCounterVec,
    pub index_cache_hits: IntCounterVec,
    pub index_cache_misses: IntCounterVec,
    pub index_cache_weight_bytes: IntGaugeVec,
    pub index_cache_entries: IntGaugeVec,
}

impl StorageMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            operation_times: HistogramVec::new(
                histogram_opts!(
                    "dag_store_operation_duration_seconds",
                    "Wall time of DAG store operations"
                ),
                &["source", "operation"],
            )?,

            operation_calls: IntCounterVec::new(
                opts!(
                    "dag_store_operations_total",
                    "Number of DAG store operation calls"
                ),
                &["source", "operation"],
            )?,

            index_cache_hits: IntCounterVec::new(
                opts!(
                    "dag_store_index_cache_hits_total",
                    "Number of DAG index cache reads answered from the cache"
                ),
                &["source", "index"],
            )?,

            index_cache_misses: IntCounterVec::new(
                opts!(
                    "dag_store_index_cache_misses_total",
                    "Number of DAG index cache reads delegated to the durable store"
                ),
                &["source", "index"],
            )?,

            index_cache_weight_bytes: IntGaugeVec::new(
                opts!(
                    "dag_store_index_cache_weight_bytes",
                    "Approximate weight of all cached DAG index entries"
                ),
                &["source", "index"],
            )?,

            index_cache_entries: IntGaugeVec::new(
                opts!(
                    "dag_store_index_cache_entries",
                    "Number of cached DAG index entries"
                ),
                &["source", "index"],
            )?,
        })
    }

    pub fn register_in(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.operation_times.clone()))?;
        registry.register(Box::new(self.operation_calls.clone()))?;
        registry.register(Box::new(self.index_cache_hits.clone()))?;
        registry.register(Box::new(self.index_cache_misses.clone()))?;
        registry.register(Box::new(self.index_cache_weight_bytes.clone()))?;
        registry.register(Box::new(self.index_cache_entries.clone()))?;
        Ok(())
    }

    /// Counts a call to `operation` and starts its latency timer.
    /// The returned timer observes the elapsed time when dropped.
    pub fn observe_operation(&self, source: &str, operation: &str) -> Option<HistogramTimer> {
        helpers::increment_counter_vec(&self.operation_calls, &[source, operation]);
        helpers::start_timer_vec(&self.operation_times, &[source, operation])
    }

    pub fn record_index_cache_hit(&self, source: &str, index: &str) {
        helpers::increment_counter_vec(&self.index_cache_hits, &[source, index]);
    }

    pub fn record_index_cache_miss(&self, source: &str, index: &str) {
        helpers::increment_counter_vec(&self.index_cache_misses, &[source, index]);
    }

    pub fn set_index_cache_size(&self, source: &str, index: &str, weight_bytes: u64, entries: usize) {
        helpers::set_gauge_vec(
            &self.index_cache_weight_bytes,
            &[source, index],
            i64::try_from(weight_bytes).unwrap_or(i64::MAX),
        );

        helpers::set_gauge_vec(
            &self.index_cache_entries,
            &[source, index],
            i64::try_from(entries).unwrap_or(i64::MAX),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_does_not_conflict() -> Result<()> {
        let metrics = StorageMetrics::new()?;
        let registry = Registry::new();

        metrics.register_in(&registry)?;

        Ok(())
    }

    #[test]
    fn observe_operation_counts_calls() -> Result<()> {
        let metrics = StorageMetrics::new()?;

        drop(metrics.observe_operation("dag", "children"));
        drop(metrics.observe_operation("dag", "children"));
        drop(metrics.observe_operation("dag", "insert"));

        let children_calls = metrics
            .operation_calls
            .get_metric_with_label_values(&["dag", "children"])?
            .get();

        let insert_calls = metrics
            .operation_calls
            .get_metric_with_label_values(&["dag", "insert"])?
            .get();

        assert_eq!(children_calls, 2);
        assert_eq!(insert_calls, 1);

        Ok(())
    }
}
