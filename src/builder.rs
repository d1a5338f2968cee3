//! Index builder: turns one store snapshot into one immutable generation.
//!
//! Builds are deterministic for a given snapshot and [`IndexParams`]. They run
//! on whatever rayon pool they are installed on (the engine's background
//! pool), never on the query pool, and poll a [`CancelToken`] between phases.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nodevec_core::ivf::SearchParams;
use nodevec_core::{CancelToken, EntityId, Error, IvfIndex, Result, StoreSnapshot};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::ThreadPool;

use crate::config::IndexParams;
use crate::generation::{GenerationId, IndexGeneration};
use crate::metrics::{self, MetricEvent, MetricSink};

const RECALL_K: usize = 10;

/// Something that can produce a generation from a snapshot.
///
/// The in-process [`IndexBuilder`] is the default; tests and external job
/// runners substitute their own.
pub trait BuildExecutor: Send + Sync {
    fn build(&self, snapshot: &StoreSnapshot, cancel: &CancelToken) -> Result<IndexGeneration>;

    /// Make sure ids handed out from now on are greater than `generation_id`.
    fn reserve_after(&self, _generation_id: GenerationId) {}
}

pub struct IndexBuilder {
    params: IndexParams,
    next_generation: AtomicU64,
    sink: Arc<dyn MetricSink>,
    pool: Option<Arc<ThreadPool>>,
}

impl IndexBuilder {
    pub fn new(params: IndexParams, sink: Arc<dyn MetricSink>) -> Self {
        Self {
            params,
            next_generation: AtomicU64::new(1),
            sink,
            pool: None,
        }
    }

    /// Run builds on `pool` instead of the global rayon pool.
    pub fn with_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn params(&self) -> &IndexParams {
        &self.params
    }

    fn build_index(&self, snapshot: &StoreSnapshot, cancel: &CancelToken) -> Result<IvfIndex> {
        let ivf = self.params.ivf();
        let run = || IvfIndex::build(snapshot.records(), snapshot.dimension(), &ivf, cancel);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }));

        match outcome {
            Ok(Some(index)) => Ok(index),
            Ok(None) => Err(Error::BuildAborted {
                snapshot_id: snapshot.id(),
            }),
            Err(payload) => Err(Error::BuildFailed(panic_message(payload.as_ref()))),
        }
    }

    /// Recall@10 of the partitioned search against exhaustive search over a
    /// deterministic sample of the snapshot's own vectors.
    fn recall_sample(&self, snapshot: &StoreSnapshot, index: &IvfIndex) -> Option<f64> {
        let n = snapshot.len();
        let sample = self.params.recall_sample.min(n);
        if sample == 0 {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(self.params.seed ^ 0x5eed);
        let picked = rand::seq::index::sample(&mut rng, n, sample);

        let params = SearchParams {
            k: RECALL_K,
            nprobe: self.params.nprobe,
            metric: None,
        };
        let mut expected = 0usize;
        let mut found = 0usize;
        for i in picked.iter() {
            let query = &snapshot.records()[i].vector;
            let truth: HashSet<EntityId> = index
                .exact_search(query, RECALL_K, None)
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            let approx = index.search(query, params, |_| true);
            expected += truth.len();
            found += approx
                .hits
                .iter()
                .filter(|(id, _)| truth.contains(id))
                .count();
        }
        (expected > 0).then(|| found as f64 / expected as f64)
    }
}

impl BuildExecutor for IndexBuilder {
    fn build(&self, snapshot: &StoreSnapshot, cancel: &CancelToken) -> Result<IndexGeneration> {
        if snapshot.is_empty() {
            return Err(Error::EmptySnapshot {
                snapshot_id: snapshot.id(),
            });
        }
        if cancel.is_cancelled() {
            return Err(Error::BuildAborted {
                snapshot_id: snapshot.id(),
            });
        }

        let start = Instant::now();
        let index = self.build_index(snapshot, cancel)?;
        let recall = self.recall_sample(snapshot, &index);
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        let id = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let generation = IndexGeneration::new(
            id,
            snapshot.id(),
            snapshot.write_counter(),
            self.params.seed,
            index,
        );

        let report = |name: &'static str, value: f64| {
            self.sink.report(
                &MetricEvent::new(name, value)
                    .generation(id)
                    .snapshot(snapshot.id()),
            )
        };
        report(metrics::BUILD_DURATION_MS, duration_ms);
        report(metrics::BUILD_ENTITY_COUNT, generation.entity_count() as f64);
        report(
            metrics::BUILD_PARTITIONS,
            generation.params().partitions as f64,
        );
        if let Some(recall) = recall {
            report(metrics::BUILD_RECALL_AT_10, recall);
        }

        tracing::info!(
            generation_id = id,
            snapshot_id = snapshot.id(),
            snapshot_counter = snapshot.write_counter(),
            entities = generation.entity_count(),
            partitions = generation.params().partitions,
            duration_ms = duration_ms as u64,
            "built index generation"
        );
        Ok(generation)
    }

    fn reserve_after(&self, generation_id: GenerationId) {
        self.next_generation
            .fetch_max(generation_id + 1, Ordering::AcqRel);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "build panicked".to_string()
    }
}
