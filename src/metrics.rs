//! Scalar metric events and process counters.
//!
//! Builds and the refresh controller report [`MetricEvent`]s to whatever
//! [`MetricSink`] the embedder supplies. Process-wide counters live in
//! [`Metrics`] and are exposed through [`Metrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

pub const BUILD_DURATION_MS: &str = "build.duration_ms";
pub const BUILD_ENTITY_COUNT: &str = "build.entity_count";
pub const BUILD_PARTITIONS: &str = "build.partitions";
pub const BUILD_RECALL_AT_10: &str = "build.recall_at_10";
pub const BUILD_RETRY: &str = "build.retry";
pub const BUILD_PERSISTENT_FAILURE: &str = "build.persistent_failure";
pub const BUILD_EXTERNAL_FAILURE: &str = "build.external_failure";
pub const PROMOTION_REJECTED: &str = "promotion.rejected";

/// One scalar observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: f64,
    pub generation_id: Option<u64>,
    pub snapshot_id: Option<u64>,
}

impl MetricEvent {
    pub fn new(name: &'static str, value: f64) -> Self {
        Self {
            name,
            value,
            generation_id: None,
            snapshot_id: None,
        }
    }

    pub fn generation(mut self, generation_id: u64) -> Self {
        self.generation_id = Some(generation_id);
        self
    }

    pub fn snapshot(mut self, snapshot_id: u64) -> Self {
        self.snapshot_id = Some(snapshot_id);
        self
    }
}

/// Destination for metric events (experiment tracker, log pipeline, tests).
pub trait MetricSink: Send + Sync {
    fn report(&self, event: &MetricEvent);
}

/// Emits each event as a structured `tracing` line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn report(&self, event: &MetricEvent) {
        tracing::info!(
            target: "nodevec::metrics",
            metric = event.name,
            value = event.value,
            generation_id = event.generation_id,
            snapshot_id = event.snapshot_id,
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<MetricEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    /// Values reported under `name`, in arrival order.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.value)
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name == name).count()
    }
}

impl MetricSink for MemorySink {
    fn report(&self, event: &MetricEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn report(&self, _event: &MetricEvent) {}
}

#[derive(Default)]
pub struct Metrics {
    pub query_total: AtomicU64,
    pub query_errors_total: AtomicU64,
    pub ingest_total: AtomicU64,
    pub tombstone_total: AtomicU64,
    pub builds_total: AtomicU64,
    pub build_failures_total: AtomicU64,
    pub build_retries_total: AtomicU64,
    pub builds_aborted_total: AtomicU64,
    pub promotions_total: AtomicU64,
    pub promotions_rejected_total: AtomicU64,
    pub generations_reclaimed_total: AtomicU64,
    pub checkpoint_total: AtomicU64,
    pub compaction_total: AtomicU64,
    pub log_entries_compacted_total: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub query_total: u64,
    pub query_errors_total: u64,
    pub ingest_total: u64,
    pub tombstone_total: u64,
    pub builds_total: u64,
    pub build_failures_total: u64,
    pub build_retries_total: u64,
    pub builds_aborted_total: u64,
    pub promotions_total: u64,
    pub promotions_rejected_total: u64,
    pub generations_reclaimed_total: u64,
    pub checkpoint_total: u64,
    pub compaction_total: u64,
    pub log_entries_compacted_total: u64,
}

impl Metrics {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            query_total: get(&self.query_total),
            query_errors_total: get(&self.query_errors_total),
            ingest_total: get(&self.ingest_total),
            tombstone_total: get(&self.tombstone_total),
            builds_total: get(&self.builds_total),
            build_failures_total: get(&self.build_failures_total),
            build_retries_total: get(&self.build_retries_total),
            builds_aborted_total: get(&self.builds_aborted_total),
            promotions_total: get(&self.promotions_total),
            promotions_rejected_total: get(&self.promotions_rejected_total),
            generations_reclaimed_total: get(&self.generations_reclaimed_total),
            checkpoint_total: get(&self.checkpoint_total),
            compaction_total: get(&self.compaction_total),
            log_entries_compacted_total: get(&self.log_entries_compacted_total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_filters_by_name() {
        let sink = MemorySink::new();
        sink.report(&MetricEvent::new(BUILD_DURATION_MS, 12.0).generation(1));
        sink.report(&MetricEvent::new(BUILD_ENTITY_COUNT, 3.0).generation(1));
        sink.report(&MetricEvent::new(BUILD_DURATION_MS, 8.0).generation(2));

        assert_eq!(sink.values(BUILD_DURATION_MS), vec![12.0, 8.0]);
        assert_eq!(sink.count(BUILD_ENTITY_COUNT), 1);
        assert_eq!(sink.events()[2].generation_id, Some(2));
    }

    #[test]
    fn test_counters_snapshot() {
        let metrics = Metrics::default();
        Metrics::incr(&metrics.query_total);
        Metrics::incr(&metrics.query_total);
        Metrics::incr(&metrics.promotions_total);

        let snap = metrics.snapshot();
        assert_eq!(snap.query_total, 2);
        assert_eq!(snap.promotions_total, 1);
        assert_eq!(snap.build_failures_total, 0);
    }
}
