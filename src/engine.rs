//! Engine facade wiring store, builder, manager, query engine and controller.
//!
//! ```text
//! ingest ──► VectorStore ──snapshot──► IndexBuilder (background pool)
//!                 ▲                         │ generation
//!                 │ staleness               ▼
//!          RefreshController ──promote──► IndexManager ◄── current() ── QueryEngine (query pool)
//!                                           │
//!                                   GenerationStore (records.log, generations/, manifest.json)
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use nodevec_core::{EntityId, VectorStore};
use rayon::ThreadPool;
use serde::Serialize;

use crate::builder::{BuildExecutor, IndexBuilder};
use crate::config::EngineConfig;
use crate::controller::{
    ControllerDeps, ControllerState, CycleOutcome, ExternalBuild, GenerationObserver,
    NoopObserver, RefreshController,
};
use crate::generation::{GenerationId, GenerationInfo, IndexGeneration};
use crate::manager::{IndexManager, Promotion};
use crate::metrics::{MetricSink, Metrics, MetricsSnapshot, TracingSink};
use crate::persist::{GenerationStore, Manifest};
use crate::query::{QueryEngine, QueryRequest, QueryResult};

/// Point-in-time view of the engine for health and stats output.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub dimension: usize,
    pub write_counter: u64,
    pub live_entities: usize,
    pub log_entries: usize,
    pub epoch: u64,
    pub active: Option<GenerationInfo>,
    pub building_snapshot: Option<u64>,
    pub controller_state: String,
    pub retired_in_use: usize,
    pub counters: MetricsSnapshot,
}

/// Persists each promoted generation and deletes reclaimed ones.
struct PersistObserver {
    generations: Arc<GenerationStore>,
    store: Arc<VectorStore>,
}

impl GenerationObserver for PersistObserver {
    fn promoted(&self, generation: &Arc<IndexGeneration>) -> Result<()> {
        self.generations
            .checkpoint(&self.store, Some(generation.as_ref()))
            .map(|_| ())
    }

    fn reclaimed(&self, ids: &[GenerationId]) -> Result<()> {
        let deleted = self.generations.remove_generations(ids)?;
        tracing::debug!(?ids, deleted, "deleted reclaimed generation files");
        Ok(())
    }
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<VectorStore>,
    manager: Arc<IndexManager>,
    queries: QueryEngine,
    controller: RefreshController,
    generations: Option<Arc<GenerationStore>>,
    metrics: Arc<Metrics>,
}

impl Engine {
    /// Open with metric events going to the log.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with_sink(config, Arc::new(TracingSink))
    }

    /// Open, reloading the store log and the active generation from
    /// `config.data_dir` when persistence is enabled. Nothing is rebuilt.
    pub fn open_with_sink(config: EngineConfig, sink: Arc<dyn MetricSink>) -> Result<Self> {
        config.validate()?;

        let (store, restored, generations) = if config.persist_generations {
            let generations = Arc::new(
                GenerationStore::open(&config)
                    .with_context(|| format!("opening data dir {:?}", config.data_dir))?,
            );
            let store = generations.load_store()?;
            let restored = generations.load_active()?;
            let removed = generations.remove_unreferenced()?;
            if removed > 0 {
                tracing::info!(removed, "removed unreferenced generation files");
            }
            (store, restored, Some(generations))
        } else {
            (VectorStore::new(config.dimension)?, None, None)
        };
        let store = Arc::new(store);

        let (query_pool, build_pool) = build_pools(&config)?;
        let builder = IndexBuilder::new(config.index.clone(), Arc::clone(&sink))
            .with_pool(Arc::clone(&build_pool));

        let manager = Arc::new(IndexManager::new());
        if let Some(generation) = restored {
            tracing::info!(
                generation_id = generation.id(),
                snapshot_counter = generation.snapshot_counter(),
                entities = generation.entity_count(),
                "restored active generation"
            );
            builder.reserve_after(generation.id());
            store.reserve_snapshot_ids_after(generation.snapshot_id());
            manager.promote(Arc::new(generation));
        }

        let metrics = Arc::new(Metrics::default());
        let queries = QueryEngine::new(
            Arc::clone(&manager),
            config.dimension,
            config.index.nprobe,
            query_pool,
            Arc::clone(&metrics),
        );

        let observer: Arc<dyn GenerationObserver> = match &generations {
            Some(generations) => Arc::new(PersistObserver {
                generations: Arc::clone(generations),
                store: Arc::clone(&store),
            }),
            None => Arc::new(NoopObserver),
        };
        let controller = RefreshController::new(
            ControllerDeps {
                store: Arc::clone(&store),
                manager: Arc::clone(&manager),
                executor: Arc::new(builder),
                pool: build_pool,
                sink,
                metrics: Arc::clone(&metrics),
                observer,
            },
            config.refresh.clone(),
        );

        tracing::info!(
            data_dir = %config.data_dir.display(),
            dimension = config.dimension,
            metric = %config.index.metric,
            live = store.live_count(),
            "engine opened"
        );
        Ok(Self {
            config,
            store,
            manager,
            queries,
            controller,
            generations,
            metrics,
        })
    }

    /// Start background refreshes.
    pub fn start(&self) -> Result<()> {
        self.controller.start()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<IndexManager> {
        &self.manager
    }

    pub fn controller(&self) -> &RefreshController {
        &self.controller
    }

    /// Encoder entry point.
    pub fn ingest(&self, entity_id: EntityId, vector: &[f32]) -> nodevec_core::Result<u64> {
        let sequence = self.store.append(entity_id, vector)?;
        Metrics::incr(&self.metrics.ingest_total);
        Ok(sequence)
    }

    pub fn tombstone(&self, entity_id: EntityId) -> bool {
        let removed = self.store.tombstone(entity_id);
        if removed {
            Metrics::incr(&self.metrics.tombstone_total);
        }
        removed
    }

    /// Mark that the encoder was retrained; later writes carry the new epoch.
    pub fn begin_epoch(&self) -> u64 {
        self.store.begin_epoch()
    }

    pub fn search(&self, request: &QueryRequest) -> nodevec_core::Result<QueryResult> {
        self.queries.search(request)
    }

    pub fn search_batch(&self, requests: &[QueryRequest]) -> Vec<nodevec_core::Result<QueryResult>> {
        self.queries.search_batch(requests)
    }

    /// Build and promote a generation now, blocking until done.
    pub fn refresh_now(&self) -> CycleOutcome {
        self.controller.refresh_now()
    }

    pub fn trigger_refresh(&self) {
        self.controller.trigger();
    }

    pub fn submit_external(&self, build: ExternalBuild) -> Result<Option<Promotion>> {
        self.controller.submit_external(build)
    }

    /// Persist the store log and the active generation.
    pub fn checkpoint(&self) -> Result<Option<Manifest>> {
        let Some(generations) = &self.generations else {
            return Ok(None);
        };
        let active = self.manager.current().ok();
        let manifest = generations
            .checkpoint(&self.store, active.as_deref())
            .context("checkpointing engine state")?;
        Metrics::incr(&self.metrics.checkpoint_total);
        tracing::info!(
            write_counter = manifest.log_write_counter,
            active = ?manifest.active.as_ref().map(|a| a.generation_id),
            "checkpoint complete"
        );
        Ok(Some(manifest))
    }

    pub fn stats(&self) -> EngineStats {
        let state = match self.controller.state() {
            ControllerState::Idle => "idle",
            ControllerState::Building => "building",
            ControllerState::Promoting => "promoting",
        };
        EngineStats {
            dimension: self.store.dimension(),
            write_counter: self.store.write_counter(),
            live_entities: self.store.live_count(),
            log_entries: self.store.log_len(),
            epoch: self.store.epoch(),
            active: self
                .manager
                .current()
                .ok()
                .map(|g| GenerationInfo::from(g.as_ref())),
            building_snapshot: self.manager.building(),
            controller_state: state.to_string(),
            retired_in_use: self.manager.retired_in_use(),
            counters: self.metrics.snapshot(),
        }
    }

    /// Stop background work and write a final checkpoint.
    pub fn shutdown(&self) -> Result<()> {
        self.controller.shutdown();
        self.checkpoint()?;
        tracing::info!("engine shut down");
        Ok(())
    }
}

fn build_pools(config: &EngineConfig) -> Result<(Arc<ThreadPool>, Arc<ThreadPool>)> {
    let available = std::thread::available_parallelism()
        .map(|v| v.get())
        .unwrap_or(2);
    let query_threads = if config.query_threads > 0 {
        config.query_threads
    } else {
        (available / 2).clamp(1, 4)
    };
    let build_threads = if config.build_threads > 0 {
        config.build_threads
    } else {
        available.saturating_sub(query_threads).max(1)
    };

    let query_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(query_threads)
        .thread_name(|idx| format!("nodevec-query-{idx}"))
        .build()
        .context("building query pool")?;

    let low_priority = config.low_priority_builds;
    let build_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(build_threads)
        .thread_name(|idx| format!("nodevec-build-{idx}"))
        .start_handler(move |_| {
            if low_priority {
                set_background_worker_priority();
            }
        })
        .panic_handler(|_| tracing::error!("background build task panicked"))
        .build()
        .context("building background build pool")?;

    Ok((Arc::new(query_pool), Arc::new(build_pool)))
}

fn set_background_worker_priority() {
    #[cfg(target_os = "linux")]
    {
        use libc::{c_int, c_long, pid_t};

        const IOPRIO_CLASS_SHIFT: c_int = 13;
        const IOPRIO_CLASS_BE: c_int = 2;
        const IOPRIO_LOWEST_BE_LEVEL: c_int = 7;
        const IOPRIO_WHO_PROCESS: c_int = 1;

        unsafe {
            // Nice values apply per thread under NPTL
            let tid = libc::syscall(libc::SYS_gettid as c_long) as pid_t;
            let _ = libc::setpriority(libc::PRIO_PROCESS, tid as u32, 10);

            let ioprio = (IOPRIO_CLASS_BE << IOPRIO_CLASS_SHIFT) | IOPRIO_LOWEST_BE_LEVEL;
            let _ = libc::syscall(
                libc::SYS_ioprio_set as c_long,
                IOPRIO_WHO_PROCESS as c_long,
                tid as c_long,
                ioprio as c_long,
            );
        }
    }
}
