//! Refresh controller: decides when to rebuild and drives build → promote.
//!
//! # State machine
//!
//! ```text
//!        trigger (age / pending writes / manual / first data)
//!   Idle ──────────────────────────────────────────────► Building
//!    ▲                                                      │ ok
//!    │      failed / aborted / promoted / rejected          ▼
//!    └──────────────────────────────────────────────── Promoting
//! ```
//!
//! One cycle runs at a time. Triggers that arrive while a cycle is in flight
//! set a single pending flag, re-evaluated once the cycle ends, so any number
//! of them yield at most one follow-up cycle. Under
//! [`CancelPolicy::AbortAndRestart`] such a trigger also cancels the running
//! build, whose partial result is dropped.
//!
//! Builds run on the background pool. The thread driving the cycle only waits
//! on the result channel, waking every poll interval to notice shutdown or
//! superseding writes.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use nodevec_core::{CancelToken, Error, Result, StoreSnapshot, VectorStore};
use parking_lot::Mutex;
use rayon::ThreadPool;

use crate::builder::BuildExecutor;
use crate::config::{CancelPolicy, RefreshPolicy};
use crate::generation::{GenerationId, IndexGeneration};
use crate::manager::{IndexManager, Promotion};
use crate::metrics::{self, MetricEvent, MetricSink, Metrics};
use crate::persist;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Building,
    Promoting,
}

impl ControllerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ControllerState::Building,
            2 => ControllerState::Promoting,
            _ => ControllerState::Idle,
        }
    }
}

/// Why a cycle started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// No generation yet and the store holds data.
    Initial,
    MaxAge,
    PendingWrites,
    Manual,
    /// Re-evaluation of triggers that arrived during the previous cycle.
    Coalesced,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Promoted { generation_id: GenerationId },
    /// Built fine, but a fresher generation was already active.
    Rejected { generation_id: GenerationId },
    Failed { kind: &'static str, attempts: u32 },
    Aborted,
    /// Another cycle was running; this request was folded into it.
    Coalesced,
}

/// Result of a build dispatched outside this process.
#[derive(Debug, Clone)]
pub enum ExternalBuild {
    Completed { artifact: PathBuf, snapshot_id: u64 },
    Failed { snapshot_id: u64, reason: String },
}

/// Hook for side effects of promotion and reclamation (persistence).
pub trait GenerationObserver: Send + Sync {
    fn promoted(&self, _generation: &Arc<IndexGeneration>) -> anyhow::Result<()> {
        Ok(())
    }

    fn reclaimed(&self, _ids: &[GenerationId]) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NoopObserver;

impl GenerationObserver for NoopObserver {}

/// Collaborators the controller drives.
pub struct ControllerDeps {
    pub store: Arc<VectorStore>,
    pub manager: Arc<IndexManager>,
    pub executor: Arc<dyn BuildExecutor>,
    pub pool: Arc<ThreadPool>,
    pub sink: Arc<dyn MetricSink>,
    pub metrics: Arc<Metrics>,
    pub observer: Arc<dyn GenerationObserver>,
}

enum Command {
    Wake,
    Shutdown,
}

struct Shared {
    deps: ControllerDeps,
    policy: RefreshPolicy,
    state: AtomicU8,
    manual: AtomicBool,
    pending: AtomicBool,
    shutdown: AtomicBool,
    cycle_lock: Mutex<()>,
    in_flight: Mutex<Option<CancelToken>>,
    cooldown_until: Mutex<Option<Instant>>,
}

pub struct RefreshController {
    shared: Arc<Shared>,
    tx: Sender<Command>,
    rx: Mutex<Option<Receiver<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshController {
    pub fn new(deps: ControllerDeps, policy: RefreshPolicy) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self {
            shared: Arc::new(Shared {
                deps,
                policy,
                state: AtomicU8::new(0),
                manual: AtomicBool::new(false),
                pending: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                cycle_lock: Mutex::new(()),
                in_flight: Mutex::new(None),
                cooldown_until: Mutex::new(None),
            }),
            tx,
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the background loop. Calling it again is a no-op.
    pub fn start(&self) -> anyhow::Result<()> {
        let Some(rx) = self.rx.lock().take() else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("nodevec-refresh".to_string())
            .spawn(move || shared.run(rx))
            .context("spawning refresh controller thread")?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    pub fn state(&self) -> ControllerState {
        self.shared.state()
    }

    /// Whether a trigger is waiting for the current cycle to end.
    pub fn has_pending(&self) -> bool {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Request a rebuild. Coalesced if a cycle is already running.
    pub fn trigger(&self) {
        if self.shared.state() == ControllerState::Idle {
            self.shared.manual.store(true, Ordering::Release);
        } else {
            self.shared.coalesce();
        }
        // A full channel already holds a wake-up
        let _ = self.tx.try_send(Command::Wake);
    }

    /// Run one cycle on the calling thread and wait for it.
    ///
    /// If a cycle is already running the request is coalesced into it and
    /// this returns [`CycleOutcome::Coalesced`] once that cycle has ended.
    pub fn refresh_now(&self) -> CycleOutcome {
        match self.shared.cycle_lock.try_lock() {
            Some(_guard) => self.shared.run_cycle(Trigger::Manual),
            None => {
                self.shared.coalesce();
                drop(self.shared.cycle_lock.lock());
                CycleOutcome::Coalesced
            }
        }
    }

    /// Accept the result of an externally executed build.
    ///
    /// A completed artifact must carry the announced snapshot id, a write
    /// counter matching the one this store recorded for that snapshot, the
    /// store's dimension and a generation id above the active one. It is then
    /// promoted under the usual freshness rule. Returns `None` for failures.
    pub fn submit_external(&self, build: ExternalBuild) -> anyhow::Result<Option<Promotion>> {
        let shared = &self.shared;
        match build {
            ExternalBuild::Failed {
                snapshot_id,
                reason,
            } => {
                Metrics::incr(&shared.deps.metrics.build_failures_total);
                shared.deps.sink.report(
                    &MetricEvent::new(metrics::BUILD_EXTERNAL_FAILURE, 1.0).snapshot(snapshot_id),
                );
                tracing::error!(snapshot_id, %reason, "external build failed");
                Ok(None)
            }
            ExternalBuild::Completed {
                artifact,
                snapshot_id,
            } => {
                let generation = persist::read_generation_file(&artifact)?;
                if generation.snapshot_id() != snapshot_id {
                    bail!(
                        "artifact {:?} was built from snapshot {}, not {}",
                        artifact,
                        generation.snapshot_id(),
                        snapshot_id
                    );
                }
                match shared.deps.store.issued_counter(snapshot_id) {
                    Some(counter) if counter == generation.snapshot_counter() => {}
                    Some(counter) => bail!(
                        "artifact {:?} claims write counter {} but snapshot {} was taken at {}",
                        artifact,
                        generation.snapshot_counter(),
                        snapshot_id,
                        counter
                    ),
                    None => bail!(
                        "artifact {:?} was built from snapshot {}, which this store did not issue recently",
                        artifact,
                        snapshot_id
                    ),
                }
                let dimension = shared.deps.store.dimension();
                if generation.dimension() != dimension {
                    bail!(
                        "artifact {:?} has dimension {}, store has {}",
                        artifact,
                        generation.dimension(),
                        dimension
                    );
                }
                if let Ok(active) = shared.deps.manager.current() {
                    if generation.id() <= active.id() {
                        bail!(
                            "artifact {:?} carries generation {} but {} is already active",
                            artifact,
                            generation.id(),
                            active.id()
                        );
                    }
                }
                shared.deps.executor.reserve_after(generation.id());

                let _guard = shared.cycle_lock.lock();
                let promotion = shared.promote(generation);
                shared.set_state(ControllerState::Idle);
                Ok(Some(promotion))
            }
        }
    }

    /// Stop the background loop, cancelling any in-flight build.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cancel_in_flight();
        let _ = self.tx.try_send(Command::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("refresh controller thread panicked");
            }
        }
    }
}

impl Drop for RefreshController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn state(&self) -> ControllerState {
        ControllerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ControllerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn coalesce(&self) {
        self.pending.store(true, Ordering::Release);
        if self.policy.cancel_policy == CancelPolicy::AbortAndRestart
            && self.state() == ControllerState::Building
        {
            tracing::info!("newer trigger cancels in-flight build");
            self.cancel_in_flight();
        }
    }

    fn cancel_in_flight(&self) {
        if let Some(token) = self.in_flight.lock().as_ref() {
            token.cancel();
        }
    }

    fn run(self: Arc<Self>, rx: Receiver<Command>) {
        tracing::info!(
            poll_ms = self.policy.poll_interval_ms,
            max_age_ms = ?self.policy.max_age_ms,
            max_pending_writes = ?self.policy.max_pending_writes,
            "refresh controller started"
        );
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Some(trigger) = self.due() {
                match self.cycle_lock.try_lock() {
                    Some(_guard) => {
                        self.run_cycle(trigger);
                        continue;
                    }
                    None => self.pending.store(true, Ordering::Release),
                }
            }
            match rx.recv_timeout(self.policy.poll_interval()) {
                Ok(Command::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
            // Generations retired while a query still held them
            self.reclaim();
        }
        tracing::info!("refresh controller stopped");
    }

    /// True when the store holds writes the active generation has not seen.
    fn behind(&self) -> bool {
        let store = &self.deps.store;
        match self.deps.manager.current() {
            Ok(active) => store.write_counter() > active.snapshot_counter(),
            Err(_) => store.live_count() > 0,
        }
    }

    fn due(&self) -> Option<Trigger> {
        if self.manual.swap(false, Ordering::AcqRel) {
            return Some(Trigger::Manual);
        }
        let coalesced = self.pending.swap(false, Ordering::AcqRel);
        if coalesced && self.behind() {
            return Some(Trigger::Coalesced);
        }

        if let Some(until) = *self.cooldown_until.lock() {
            if Instant::now() < until {
                return None;
            }
        }

        let store = &self.deps.store;
        let active = match self.deps.manager.current() {
            Ok(active) => active,
            Err(_) => return (store.live_count() > 0).then_some(Trigger::Initial),
        };
        let behind = store.write_counter().saturating_sub(active.snapshot_counter());
        if behind == 0 {
            return None;
        }
        if self.policy.max_pending_writes.is_some_and(|max| behind >= max) {
            return Some(Trigger::PendingWrites);
        }
        let age = Duration::from_millis(active.age_ms());
        if self.policy.max_age().is_some_and(|max| age >= max) {
            return Some(Trigger::MaxAge);
        }
        None
    }

    /// One full cycle. Caller holds `cycle_lock`.
    fn run_cycle(&self, trigger: Trigger) -> CycleOutcome {
        tracing::info!(
            ?trigger,
            write_counter = self.deps.store.write_counter(),
            "refresh cycle started"
        );
        let outcome = self.build_with_retries();
        self.set_state(ControllerState::Idle);

        match &outcome {
            CycleOutcome::Failed { .. } => {
                let cooldown = Duration::from_millis(self.policy.backoff_max_ms);
                *self.cooldown_until.lock() = Some(Instant::now() + cooldown);
            }
            CycleOutcome::Promoted { .. } => *self.cooldown_until.lock() = None,
            _ => {}
        }
        outcome
    }

    fn build_with_retries(&self) -> CycleOutcome {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.set_state(ControllerState::Building);
            let snapshot = self.deps.store.snapshot();
            let snapshot_id = snapshot.id();

            match self.build_on_pool(snapshot) {
                Ok(generation) => {
                    Metrics::incr(&self.deps.metrics.builds_total);
                    return match self.promote(generation) {
                        Promotion::Promoted { generation_id, .. } => {
                            CycleOutcome::Promoted { generation_id }
                        }
                        Promotion::Rejected { generation_id, .. } => {
                            CycleOutcome::Rejected { generation_id }
                        }
                    };
                }
                Err(Error::BuildAborted { snapshot_id }) => {
                    Metrics::incr(&self.deps.metrics.builds_aborted_total);
                    tracing::info!(snapshot_id, "build aborted, partial result discarded");
                    return CycleOutcome::Aborted;
                }
                Err(err) if err.is_transient() && attempt <= self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt);
                    Metrics::incr(&self.deps.metrics.build_retries_total);
                    self.deps.sink.report(
                        &MetricEvent::new(metrics::BUILD_RETRY, attempt as f64)
                            .snapshot(snapshot_id),
                    );
                    tracing::warn!(
                        snapshot_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient build failure, retrying: {err}"
                    );
                    if !self.pause(delay) {
                        return CycleOutcome::Aborted;
                    }
                }
                Err(err) => {
                    Metrics::incr(&self.deps.metrics.build_failures_total);
                    if err.is_transient() {
                        self.deps.sink.report(
                            &MetricEvent::new(metrics::BUILD_PERSISTENT_FAILURE, attempt as f64)
                                .snapshot(snapshot_id),
                        );
                    }
                    tracing::error!(
                        snapshot_id,
                        attempts = attempt,
                        kind = err.kind(),
                        "index build failed: {err}"
                    );
                    return CycleOutcome::Failed {
                        kind: err.kind(),
                        attempts: attempt,
                    };
                }
            }
        }
    }

    /// Run the executor on the background pool and wait for its result.
    fn build_on_pool(&self, snapshot: StoreSnapshot) -> Result<IndexGeneration> {
        let snapshot_id = snapshot.id();
        let snapshot_counter = snapshot.write_counter();
        let cancel = CancelToken::new();
        *self.in_flight.lock() = Some(cancel.clone());
        if self.shutdown.load(Ordering::Acquire) {
            cancel.cancel();
        }
        if !self.deps.manager.begin_build(snapshot_id) {
            tracing::warn!(snapshot_id, "build slot already taken");
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        let executor = Arc::clone(&self.deps.executor);
        let task_cancel = cancel.clone();
        self.deps.pool.spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                executor.build(&snapshot, &task_cancel)
            }))
            .unwrap_or_else(|_| Err(Error::BuildFailed("build executor panicked".to_string())));
            let _ = tx.send(result);
        });

        let result = loop {
            match rx.recv_timeout(self.policy.poll_interval()) {
                Ok(result) => break result,
                Err(RecvTimeoutError::Timeout) => self.check_superseded(snapshot_counter, &cancel),
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(Error::BuildFailed(
                        "build task exited without a result".to_string(),
                    ))
                }
            }
        };

        *self.in_flight.lock() = None;
        self.deps.manager.end_build();
        result
    }

    fn check_superseded(&self, snapshot_counter: u64, cancel: &CancelToken) {
        if cancel.is_cancelled() {
            return;
        }
        if self.shutdown.load(Ordering::Acquire) {
            cancel.cancel();
            return;
        }
        if self.policy.cancel_policy != CancelPolicy::AbortAndRestart {
            return;
        }
        let newer = self
            .deps
            .store
            .write_counter()
            .saturating_sub(snapshot_counter);
        if self.policy.max_pending_writes.is_some_and(|max| newer >= max) {
            tracing::info!(newer, "writes superseded in-flight build");
            self.pending.store(true, Ordering::Release);
            cancel.cancel();
        }
    }

    fn promote(&self, generation: IndexGeneration) -> Promotion {
        self.set_state(ControllerState::Promoting);
        let generation = Arc::new(generation);
        let promotion = self.deps.manager.promote(Arc::clone(&generation));
        match promotion {
            Promotion::Promoted { generation_id, .. } => {
                Metrics::incr(&self.deps.metrics.promotions_total);
                self.compact(generation.snapshot_counter());
                if let Err(err) = self.deps.observer.promoted(&generation) {
                    tracing::warn!(generation_id, "persisting promoted generation failed: {err:#}");
                }
            }
            Promotion::Rejected { generation_id, .. } => {
                Metrics::incr(&self.deps.metrics.promotions_rejected_total);
                self.deps.sink.report(
                    &MetricEvent::new(metrics::PROMOTION_REJECTED, 1.0)
                        .generation(generation_id)
                        .snapshot(generation.snapshot_id()),
                );
            }
        }
        drop(generation);
        self.reclaim();
        promotion
    }

    /// Fold log history the promoted generation already covers.
    fn compact(&self, up_to: u64) {
        let dropped = self.deps.store.compact(up_to);
        if dropped == 0 {
            return;
        }
        Metrics::incr(&self.deps.metrics.compaction_total);
        self.deps
            .metrics
            .log_entries_compacted_total
            .fetch_add(dropped as u64, Ordering::Relaxed);
        tracing::info!(up_to, dropped, log_len = self.deps.store.log_len(), "compacted store log");
    }

    fn reclaim(&self) {
        let ids = self.deps.manager.reclaim();
        if ids.is_empty() {
            return;
        }
        self.deps
            .metrics
            .generations_reclaimed_total
            .fetch_add(ids.len() as u64, Ordering::Relaxed);
        if let Err(err) = self.deps.observer.reclaimed(&ids) {
            tracing::warn!(?ids, "removing reclaimed generations failed: {err:#}");
        }
    }

    /// Sleep for `delay` unless shutdown is requested first.
    fn pause(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(self.policy.poll_interval()));
        }
    }
}
