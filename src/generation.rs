//! Immutable index generations.

use std::time::{SystemTime, UNIX_EPOCH};

use nodevec_core::format::GenerationHeader;
use nodevec_core::{IvfIndex, Metric};
use serde::Serialize;

pub type GenerationId = u64;

/// Structural parameters recorded with a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenerationParams {
    pub partitions: usize,
    pub metric: Metric,
    pub seed: u64,
}

/// One fully built, read-only version of the index over exactly one snapshot.
#[derive(Debug)]
pub struct IndexGeneration {
    id: GenerationId,
    snapshot_id: u64,
    snapshot_counter: u64,
    built_at_ms: u64,
    params: GenerationParams,
    index: IvfIndex,
}

impl IndexGeneration {
    pub fn new(
        id: GenerationId,
        snapshot_id: u64,
        snapshot_counter: u64,
        seed: u64,
        index: IvfIndex,
    ) -> Self {
        let params = GenerationParams {
            partitions: index.num_partitions(),
            metric: index.metric(),
            seed,
        };
        Self {
            id,
            snapshot_id,
            snapshot_counter,
            built_at_ms: now_unix_ms(),
            params,
            index,
        }
    }

    /// Rebuild from a persisted header and its index body.
    pub fn from_header(header: &GenerationHeader, index: IvfIndex) -> Self {
        Self {
            id: header.generation_id,
            snapshot_id: header.snapshot_id,
            snapshot_counter: header.snapshot_counter,
            built_at_ms: header.built_at_ms,
            params: GenerationParams {
                partitions: index.num_partitions(),
                metric: header.metric,
                seed: header.seed,
            },
            index,
        }
    }

    pub fn header(&self) -> GenerationHeader {
        GenerationHeader {
            dimension: self.index.dimension() as u32,
            metric: self.params.metric,
            partitions: self.index.num_partitions() as u32,
            generation_id: self.id,
            snapshot_id: self.snapshot_id,
            snapshot_counter: self.snapshot_counter,
            built_at_ms: self.built_at_ms,
            seed: self.params.seed,
            entity_count: self.index.len() as u64,
        }
    }

    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn snapshot_id(&self) -> u64 {
        self.snapshot_id
    }

    /// Store write counter captured by the snapshot this generation was built from.
    pub fn snapshot_counter(&self) -> u64 {
        self.snapshot_counter
    }

    pub fn entity_count(&self) -> usize {
        self.index.len()
    }

    pub fn built_at_ms(&self) -> u64 {
        self.built_at_ms
    }

    pub fn params(&self) -> GenerationParams {
        self.params
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    pub fn index(&self) -> &IvfIndex {
        &self.index
    }

    /// Milliseconds since this generation was built.
    pub fn age_ms(&self) -> u64 {
        now_unix_ms().saturating_sub(self.built_at_ms)
    }
}

/// Summary used in stats output.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationInfo {
    pub generation_id: GenerationId,
    pub snapshot_id: u64,
    pub snapshot_counter: u64,
    pub entity_count: usize,
    pub built_at_ms: u64,
    pub params: GenerationParams,
}

impl From<&IndexGeneration> for GenerationInfo {
    fn from(generation: &IndexGeneration) -> Self {
        Self {
            generation_id: generation.id,
            snapshot_id: generation.snapshot_id,
            snapshot_counter: generation.snapshot_counter,
            entity_count: generation.entity_count(),
            built_at_ms: generation.built_at_ms,
            params: generation.params,
        }
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
