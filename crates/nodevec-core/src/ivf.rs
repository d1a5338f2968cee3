//! IVF-Flat partitioned index
//!
//! The vector space is split by a k-means coarse quantizer into partitions
//! (inverted lists). A query ranks the centroids, scans the `nprobe` closest
//! partitions exhaustively and keeps the best `k` hits, so query cost grows
//! with `entity_count / partitions * nprobe` instead of `entity_count`.
//!
//! # Layout
//!
//! ```text
//! centroids: [c0 | c1 | ... | cP-1]          P × D floats
//! partition: ids   [e0, e1, ...]              sorted by entity id
//!            data  [v(e0) | v(e1) | ...]      contiguous, D floats each
//!            norms [|v(e0)|, |v(e1)|, ...]    for cosine scoring
//! ```
//!
//! Built once, read-only afterwards: there is no insert or delete.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::cancel::CancelToken;
use crate::distance::{l2_norm, Metric};
use crate::format::FormatError;
use crate::kmeans::{self, KMeansConfig};
use crate::types::{EmbeddingRecord, EntityId};

/// Build-time parameters for an IVF index.
#[derive(Debug, Clone, PartialEq)]
pub struct IvfParams {
    pub partitions: usize,
    pub metric: Metric,
    pub seed: u64,
    pub max_iters: usize,
    pub tolerance: f32,
    /// Upper bound on points used to train the coarse quantizer.
    pub train_sample: usize,
}

impl Default for IvfParams {
    fn default() -> Self {
        Self {
            partitions: 64,
            metric: Metric::L2Squared,
            seed: 42,
            max_iters: 20,
            tolerance: 1e-4,
            train_sample: 50_000,
        }
    }
}

/// One inverted list.
#[derive(Debug, Clone)]
pub struct Partition {
    ids: Vec<EntityId>,
    vectors: Vec<f32>,
    norms: Vec<f64>,
}

impl Partition {
    pub fn new(ids: Vec<EntityId>, vectors: Vec<f32>, dim: usize) -> Self {
        let norms = vectors
            .chunks_exact(dim)
            .map(l2_norm)
            .collect();
        Self {
            ids,
            vectors,
            norms,
        }
    }

    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    pub fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Search hit ordered by (distance, entity id).
#[derive(Debug, Clone, Copy)]
struct Hit {
    distance: f32,
    id: EntityId,
}

impl PartialEq for Hit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Hit {}

impl Ord for Hit {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on this order keeps the current worst hit on top
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Hit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-query knobs for [`IvfIndex::search`].
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    pub k: usize,
    pub nprobe: usize,
    /// Rank with this metric instead of the one the index was built for.
    pub metric: Option<Metric>,
}

/// Outcome of a search, with scan statistics.
#[derive(Debug, Clone, Default)]
pub struct SearchOutput {
    pub hits: Vec<(EntityId, f32)>,
    pub partitions_scanned: usize,
    pub candidates_scanned: usize,
}

/// Immutable IVF-Flat index.
#[derive(Debug, Clone)]
pub struct IvfIndex {
    dimension: usize,
    metric: Metric,
    centroids: Vec<f32>,
    partitions: Vec<Partition>,
    len: usize,
}

impl IvfIndex {
    /// Build over `records`. Returns `None` if `cancel` fires.
    ///
    /// `records` must be non-empty and all of length `dimension`.
    pub fn build(
        records: &[EmbeddingRecord],
        dimension: usize,
        params: &IvfParams,
        cancel: &CancelToken,
    ) -> Option<Self> {
        debug_assert!(!records.is_empty());
        let n = records.len();
        let k = params.partitions.clamp(1, n);

        // Quantizer space: unit vectors for cosine, raw otherwise
        let prepared: Vec<Vec<f32>> = records
            .par_iter()
            .map(|r| params.metric.prepare(&r.vector))
            .collect();

        let sample: Vec<&[f32]> = if n > params.train_sample.max(k) {
            let mut rng = StdRng::seed_from_u64(params.seed);
            let mut picked =
                rand::seq::index::sample(&mut rng, n, params.train_sample.max(k)).into_vec();
            picked.sort_unstable();
            picked.into_iter().map(|i| prepared[i].as_slice()).collect()
        } else {
            prepared.iter().map(|v| v.as_slice()).collect()
        };

        let config = KMeansConfig {
            k,
            max_iters: params.max_iters,
            tolerance: params.tolerance,
            seed: params.seed,
        };
        let centroids = kmeans::train(&sample, dimension, &config, cancel)?;
        let k = centroids.len() / dimension;

        if cancel.is_cancelled() {
            return None;
        }
        let assignments: Vec<usize> = prepared
            .par_iter()
            .map(|v| kmeans::nearest_centroid(&centroids, dimension, v))
            .collect();

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); k];
        for (i, &c) in assignments.iter().enumerate() {
            members[c].push(i);
        }

        if cancel.is_cancelled() {
            return None;
        }
        let partitions: Vec<Partition> = members
            .into_par_iter()
            .map(|idxs| {
                let mut ids = Vec::with_capacity(idxs.len());
                let mut vectors = Vec::with_capacity(idxs.len() * dimension);
                for i in idxs {
                    ids.push(records[i].entity_id);
                    vectors.extend_from_slice(&records[i].vector);
                }
                Partition::new(ids, vectors, dimension)
            })
            .collect();

        Some(Self {
            dimension,
            metric: params.metric,
            centroids,
            partitions,
            len: n,
        })
    }

    /// Reassemble an index from persisted parts.
    pub fn from_parts(
        dimension: usize,
        metric: Metric,
        centroids: Vec<f32>,
        partitions: Vec<Partition>,
    ) -> Result<Self, FormatError> {
        if dimension == 0 || centroids.len() != partitions.len() * dimension {
            return Err(FormatError::Corrupt(format!(
                "{} centroid floats for {} partitions of dimension {}",
                centroids.len(),
                partitions.len(),
                dimension
            )));
        }
        if let Some(bad) = partitions
            .iter()
            .find(|p| p.vectors.len() != p.ids.len() * dimension)
        {
            return Err(FormatError::Corrupt(format!(
                "partition holds {} floats for {} ids",
                bad.vectors.len(),
                bad.ids.len()
            )));
        }
        let len = partitions.iter().map(Partition::len).sum();
        Ok(Self {
            dimension,
            metric,
            centroids,
            partitions,
            len,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Approximate k-NN restricted to ids accepted by `admit`.
    ///
    /// Scans the `nprobe` nearest partitions, then keeps widening to the next
    /// nearest partition while fewer than `k` admitted hits were found. The
    /// result holds `min(k, admitted live ids)` hits sorted by distance, then
    /// ascending entity id.
    pub fn search<F>(&self, query: &[f32], params: SearchParams, admit: F) -> SearchOutput
    where
        F: Fn(EntityId) -> bool,
    {
        let mut out = SearchOutput::default();
        if params.k == 0 || self.partitions.is_empty() {
            return out;
        }
        let metric = params.metric.unwrap_or(self.metric);
        let prepared_query = self.metric.prepare(query);
        let query_norm = l2_norm(query);

        let mut order: Vec<(f32, usize)> = self
            .centroids
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(c, centroid)| (self.metric.distance(&prepared_query, centroid), c))
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let nprobe = params.nprobe.max(1);
        let mut heap: BinaryHeap<Hit> = BinaryHeap::with_capacity(params.k + 1);
        for &(_, c) in &order {
            if out.partitions_scanned >= nprobe && heap.len() >= params.k {
                break;
            }
            let partition = &self.partitions[c];
            out.partitions_scanned += 1;

            for ((id, v), &norm) in partition
                .ids
                .iter()
                .zip(partition.vectors.chunks_exact(self.dimension))
                .zip(&partition.norms)
            {
                if !admit(*id) {
                    continue;
                }
                out.candidates_scanned += 1;
                let hit = Hit {
                    distance: metric.distance_with_norms(query, query_norm, v, norm),
                    id: *id,
                };
                if heap.len() < params.k {
                    heap.push(hit);
                } else if heap.peek().is_some_and(|worst| hit < *worst) {
                    heap.pop();
                    heap.push(hit);
                }
            }
        }

        out.hits = heap
            .into_sorted_vec()
            .into_iter()
            .map(|h| (h.id, h.distance))
            .collect();
        out
    }

    /// Exhaustive k-NN over every partition (ground truth for recall checks).
    pub fn exact_search(
        &self,
        query: &[f32],
        k: usize,
        metric: Option<Metric>,
    ) -> Vec<(EntityId, f32)> {
        let params = SearchParams {
            k,
            nprobe: self.partitions.len(),
            metric,
        };
        self.search(query, params, |_| true).hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn record(id: u64, v: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            entity_id: EntityId(id),
            vector: Arc::from(v),
            epoch: 0,
            sequence: id,
        }
    }

    fn random_records(n: usize, dim: usize, seed: u64) -> Vec<EmbeddingRecord> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| record(i as u64, (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect()))
            .collect()
    }

    fn params(partitions: usize) -> IvfParams {
        IvfParams {
            partitions,
            ..IvfParams::default()
        }
    }

    #[test]
    fn test_build_assigns_every_record_once() {
        let records = random_records(500, 16, 1);
        let index = IvfIndex::build(&records, 16, &params(8), &CancelToken::new()).unwrap();

        assert_eq!(index.len(), 500);
        assert_eq!(index.num_partitions(), 8);
        let mut seen = HashSet::new();
        for p in index.partitions() {
            for id in p.ids() {
                assert!(seen.insert(*id), "id {id} assigned twice");
            }
        }
        assert_eq!(seen.len(), 500);
    }

    #[test]
    fn test_partitions_clamped_to_record_count() {
        let records = random_records(3, 4, 2);
        let index = IvfIndex::build(&records, 4, &params(64), &CancelToken::new()).unwrap();
        assert_eq!(index.num_partitions(), 3);
    }

    #[test]
    fn test_small_scenario_ranking() {
        let records = vec![
            record(1, vec![0.0, 0.0, 0.0, 0.0]),
            record(2, vec![1.0, 0.0, 0.0, 0.0]),
            record(3, vec![0.0, 1.0, 0.0, 0.0]),
        ];
        let index = IvfIndex::build(&records, 4, &params(2), &CancelToken::new()).unwrap();
        let out = index.search(
            &[0.9, 0.0, 0.0, 0.0],
            SearchParams {
                k: 2,
                nprobe: 1,
                metric: None,
            },
            |_| true,
        );

        assert_eq!(out.hits.len(), 2);
        assert_eq!(out.hits[0].0, EntityId(2));
        assert!((out.hits[0].1 - 0.01).abs() < 1e-5);
        assert_eq!(out.hits[1].0, EntityId(1));
        assert!((out.hits[1].1 - 0.81).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_ranks_huge_aligned_vector_first() {
        let records = vec![
            record(1, vec![1e20, 1e20]),
            record(2, vec![1.0, -1.0]),
            record(3, vec![-1.0, 1.0]),
        ];
        let cosine = IvfParams {
            partitions: 1,
            metric: Metric::Cosine,
            ..IvfParams::default()
        };
        let index = IvfIndex::build(&records, 2, &cosine, &CancelToken::new()).unwrap();
        let hits = index.exact_search(&[1.0, 1.0], 3, None);

        assert_eq!(hits[0].0, EntityId(1));
        assert!(hits[0].1.abs() < 1e-6, "aligned distance {}", hits[0].1);
    }

    #[test]
    fn test_ties_break_by_entity_id() {
        let records = vec![
            record(9, vec![1.0, 0.0]),
            record(4, vec![-1.0, 0.0]),
            record(6, vec![0.0, 1.0]),
        ];
        let index = IvfIndex::build(&records, 2, &params(1), &CancelToken::new()).unwrap();
        let out = index.search(
            &[0.0, 0.0],
            SearchParams {
                k: 3,
                nprobe: 1,
                metric: None,
            },
            |_| true,
        );
        let ids: Vec<u64> = out.hits.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![4, 6, 9]);
    }

    #[test]
    fn test_scan_widens_until_k_found() {
        let records = random_records(200, 8, 3);
        let index = IvfIndex::build(&records, 8, &params(16), &CancelToken::new()).unwrap();
        let out = index.search(
            &records[0].vector,
            SearchParams {
                k: 150,
                nprobe: 1,
                metric: None,
            },
            |_| true,
        );
        assert_eq!(out.hits.len(), 150);
        assert!(out.partitions_scanned > 1);
    }

    #[test]
    fn test_filter_is_respected() {
        let records = random_records(300, 8, 4);
        let index = IvfIndex::build(&records, 8, &params(8), &CancelToken::new()).unwrap();
        let out = index.search(
            &records[10].vector,
            SearchParams {
                k: 5,
                nprobe: 2,
                metric: None,
            },
            |id| id.0 % 3 == 0,
        );
        assert_eq!(out.hits.len(), 5);
        assert!(out.hits.iter().all(|(id, _)| id.0 % 3 == 0));
    }

    #[test]
    fn test_self_query_finds_itself() {
        let records = random_records(400, 32, 5);
        let index = IvfIndex::build(&records, 32, &params(16), &CancelToken::new()).unwrap();
        for r in records.iter().step_by(37) {
            let out = index.search(
                &r.vector,
                SearchParams {
                    k: 1,
                    nprobe: 1,
                    metric: None,
                },
                |_| true,
            );
            assert_eq!(out.hits[0].0, r.entity_id);
        }
    }

    #[test]
    fn test_recall_reasonable() {
        let records = random_records(2000, 16, 6);
        let index = IvfIndex::build(&records, 16, &params(32), &CancelToken::new()).unwrap();
        let mut rng = StdRng::seed_from_u64(77);
        let mut total = 0usize;
        let mut found = 0usize;
        for _ in 0..20 {
            let q: Vec<f32> = (0..16).map(|_| rng.gen::<f32>() - 0.5).collect();
            let truth: HashSet<EntityId> = index
                .exact_search(&q, 10, None)
                .into_iter()
                .map(|h| h.0)
                .collect();
            let approx = index.search(
                &q,
                SearchParams {
                    k: 10,
                    nprobe: 16,
                    metric: None,
                },
                |_| true,
            );
            total += truth.len();
            found += approx.hits.iter().filter(|(id, _)| truth.contains(id)).count();
        }
        let recall = found as f64 / total as f64;
        assert!(recall > 0.6, "recall@10 with nprobe=16/32 too low: {recall}");
    }

    #[test]
    fn test_metric_override_reranks() {
        let records = vec![record(1, vec![10.0, 0.0]), record(2, vec![0.5, 0.1])];
        let index = IvfIndex::build(&records, 2, &params(1), &CancelToken::new()).unwrap();
        let query = [1.0, 0.0];
        let by = |metric| {
            index
                .search(&query, SearchParams { k: 1, nprobe: 1, metric }, |_| true)
                .hits[0]
                .0
        };
        assert_eq!(by(Some(Metric::L2Squared)), EntityId(2));
        assert_eq!(by(Some(Metric::InnerProduct)), EntityId(1));
    }

    #[test]
    fn test_build_is_deterministic() {
        let records = random_records(300, 8, 8);
        let a = IvfIndex::build(&records, 8, &params(8), &CancelToken::new()).unwrap();
        let b = IvfIndex::build(&records, 8, &params(8), &CancelToken::new()).unwrap();
        assert_eq!(a.centroids(), b.centroids());
        for (pa, pb) in a.partitions().iter().zip(b.partitions()) {
            assert_eq!(pa.ids(), pb.ids());
        }
    }

    #[test]
    fn test_cancelled_build_returns_none() {
        let records = random_records(100, 4, 9);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(IvfIndex::build(&records, 4, &params(4), &cancel).is_none());
    }
}
