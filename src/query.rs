//! Query engine.
//!
//! Every request loads the active generation exactly once and runs to
//! completion against it. Queries share nothing mutable, so any number of them
//! run in parallel; batches fan out over a dedicated query pool kept apart
//! from the build pool.

use std::collections::HashSet;
use std::sync::Arc;

use nodevec_core::ivf::SearchParams;
use nodevec_core::types::check_vector;
use nodevec_core::{EntityId, Error, Metric, Result};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;

use crate::generation::GenerationId;
use crate::manager::IndexManager;
use crate::metrics::Metrics;

/// Restricts which entities may appear in results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdFilter {
    Allow(HashSet<EntityId>),
    Deny(HashSet<EntityId>),
}

impl IdFilter {
    pub fn allow<I: IntoIterator<Item = EntityId>>(ids: I) -> Self {
        IdFilter::Allow(ids.into_iter().collect())
    }

    pub fn deny<I: IntoIterator<Item = EntityId>>(ids: I) -> Self {
        IdFilter::Deny(ids.into_iter().collect())
    }

    #[inline]
    pub fn admits(&self, id: EntityId) -> bool {
        match self {
            IdFilter::Allow(ids) => ids.contains(&id),
            IdFilter::Deny(ids) => !ids.contains(&id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub vector: Vec<f32>,
    pub k: usize,
    /// Rank with this metric instead of the generation's own
    pub metric: Option<Metric>,
    pub filter: Option<IdFilter>,
    /// Partitions to scan before widening
    pub nprobe: Option<usize>,
}

impl QueryRequest {
    pub fn new(vector: Vec<f32>, k: usize) -> Self {
        Self {
            vector,
            k,
            metric: None,
            filter: None,
            nprobe: None,
        }
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn with_filter(mut self, filter: IdFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_nprobe(mut self, nprobe: usize) -> Self {
        self.nprobe = Some(nprobe);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueryHit {
    pub entity_id: EntityId,
    pub distance: f32,
}

/// Hits ordered by distance then entity id, all from one generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub generation_id: GenerationId,
    pub hits: Vec<QueryHit>,
    pub partitions_scanned: usize,
}

impl QueryResult {
    pub fn ids(&self) -> Vec<EntityId> {
        self.hits.iter().map(|h| h.entity_id).collect()
    }
}

pub struct QueryEngine {
    manager: Arc<IndexManager>,
    dimension: usize,
    default_nprobe: usize,
    pool: Arc<ThreadPool>,
    metrics: Arc<Metrics>,
}

impl QueryEngine {
    pub fn new(
        manager: Arc<IndexManager>,
        dimension: usize,
        default_nprobe: usize,
        pool: Arc<ThreadPool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            manager,
            dimension,
            default_nprobe: default_nprobe.max(1),
            pool,
            metrics,
        }
    }

    pub fn search(&self, request: &QueryRequest) -> Result<QueryResult> {
        Metrics::incr(&self.metrics.query_total);
        let result = self.search_inner(request);
        if result.is_err() {
            Metrics::incr(&self.metrics.query_errors_total);
        }
        result
    }

    fn search_inner(&self, request: &QueryRequest) -> Result<QueryResult> {
        if request.k == 0 {
            return Err(Error::InvalidK(request.k));
        }
        check_vector(&request.vector, self.dimension)?;

        let generation = self.manager.current()?;
        let index = generation.index();
        if index.dimension() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: index.dimension(),
                actual: self.dimension,
            });
        }

        let params = SearchParams {
            k: request.k,
            nprobe: request.nprobe.unwrap_or(self.default_nprobe),
            metric: request.metric,
        };
        let output = match &request.filter {
            Some(filter) => index.search(&request.vector, params, |id| filter.admits(id)),
            None => index.search(&request.vector, params, |_| true),
        };
        tracing::trace!(
            generation_id = generation.id(),
            scanned = output.partitions_scanned,
            scanned = output.candidates_scanned,
            hits = output.hits.len(),
            "query served"
        );

        Ok(QueryResult {
            generation_id: generation.id(),
            hits: output
                .hits
                .into_iter()
                .map(|(entity_id, distance)| QueryHit {
                    entity_id,
                    distance,
                })
                .collect(),
            partitions_scanned: output.partitions_scanned,
        })
    }

    /// Run independent searches in parallel on the query pool.
    ///
    /// Each request resolves the active generation on its own.
    pub fn search_batch(&self, requests: &[QueryRequest]) -> Vec<Result<QueryResult>> {
        self.pool
            .install(|| requests.par_iter().map(|r| self.search(r)).collect())
    }
}
