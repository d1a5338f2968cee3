//! Index manager: owns the active generation and the in-flight build slot.
//!
//! # Promotion
//!
//! The active generation lives behind an [`ArcSwapOption`]. Readers load it
//! lock-free and keep their `Arc` for the whole request, so a promotion that
//! lands mid-query never changes what that query sees. Promoters serialize on
//! a short mutex around compare-and-store; nothing else takes it.
//!
//! # Retirement
//!
//! A superseded generation is remembered as a `Weak`. It is freed by `Arc`
//! reference counting the moment its last reader drops it; [`IndexManager::reclaim`]
//! observes that and reports the ids so their persisted files can be removed.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use nodevec_core::{Error, Result};
use parking_lot::Mutex;

use crate::generation::{GenerationId, IndexGeneration};

/// Outcome of [`IndexManager::promote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    Promoted {
        generation_id: GenerationId,
        replaced: Option<GenerationId>,
    },
    /// The candidate was built from an older snapshot than the active one.
    Rejected {
        generation_id: GenerationId,
        active_id: GenerationId,
        candidate_counter: u64,
        active_counter: u64,
    },
}

impl Promotion {
    pub fn is_promoted(&self) -> bool {
        matches!(self, Promotion::Promoted { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct BuildSlot {
    snapshot_id: u64,
    started: Instant,
}

#[derive(Default)]
pub struct IndexManager {
    active: ArcSwapOption<IndexGeneration>,
    promote_lock: Mutex<()>,
    building: Mutex<Option<BuildSlot>>,
    retired: Mutex<HashMap<GenerationId, Weak<IndexGeneration>>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest promoted generation.
    pub fn current(&self) -> Result<Arc<IndexGeneration>> {
        self.active.load_full().ok_or(Error::NoIndexAvailable)
    }

    pub fn has_active(&self) -> bool {
        self.active.load().is_some()
    }

    /// Make `candidate` active unless it is staler than the active generation.
    ///
    /// Freshness is the snapshot write counter: a candidate is accepted when
    /// its counter is at least the active one, so out-of-order build
    /// completions can never demote the index.
    pub fn promote(&self, candidate: Arc<IndexGeneration>) -> Promotion {
        let _guard = self.promote_lock.lock();

        let previous = self.active.load_full();
        if let Some(active) = &previous {
            if candidate.snapshot_counter() < active.snapshot_counter() {
                tracing::info!(
                    candidate = candidate.id(),
                    candidate_counter = candidate.snapshot_counter(),
                    active = active.id(),
                    active_counter = active.snapshot_counter(),
                    "rejected stale generation"
                );
                return Promotion::Rejected {
                    generation_id: candidate.id(),
                    active_id: active.id(),
                    candidate_counter: candidate.snapshot_counter(),
                    active_counter: active.snapshot_counter(),
                };
            }
        }

        let generation_id = candidate.id();
        let counter = candidate.snapshot_counter();
        self.active.store(Some(candidate));

        let replaced = previous.map(|old| {
            if old.id() != generation_id {
                self.retired.lock().insert(old.id(), Arc::downgrade(&old));
            }
            old.id()
        });
        tracing::info!(
            generation_id,
            snapshot_counter = counter,
            replaced = ?replaced,
            "promoted index generation"
        );
        Promotion::Promoted {
            generation_id,
            replaced,
        }
    }

    /// Claim the single build slot. Returns `false` if a build is already in flight.
    pub fn begin_build(&self, snapshot_id: u64) -> bool {
        let mut slot = self.building.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(BuildSlot {
            snapshot_id,
            started: Instant::now(),
        });
        true
    }

    pub fn end_build(&self) {
        if let Some(slot) = self.building.lock().take() {
            tracing::debug!(
                snapshot_id = slot.snapshot_id,
                elapsed_ms = slot.started.elapsed().as_millis() as u64,
                "build slot released"
            );
        }
    }

    /// Snapshot id of the in-flight build, if any.
    pub fn building(&self) -> Option<u64> {
        self.building.lock().map(|slot| slot.snapshot_id)
    }

    /// Forget retired generations nobody references any more and return their ids.
    pub fn reclaim(&self) -> Vec<GenerationId> {
        let mut retired = self.retired.lock();
        let mut reclaimed = Vec::new();
        retired.retain(|id, weak| {
            let alive = weak.strong_count() > 0;
            if !alive {
                reclaimed.push(*id);
            }
            alive
        });
        if !reclaimed.is_empty() {
            reclaimed.sort_unstable();
            tracing::debug!(?reclaimed, "reclaimed retired generations");
        }
        reclaimed
    }

    /// Retired generations still held by at least one reader.
    pub fn retired_in_use(&self) -> usize {
        self.retired
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
