//! Engine configuration.
//!
//! Every field has a default so a config file only needs to name what it
//! changes:
//!
//! ```json
//! {
//!   "data_dir": "/var/lib/nodevec",
//!   "dimension": 128,
//!   "index": { "partitions": 256, "metric": "cosine", "nprobe": 16 },
//!   "refresh": { "max_pending_writes": 50000, "cancel_policy": "abort_and_restart" }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nodevec_core::{IvfParams, Metric};
use serde::{Deserialize, Serialize};

/// Structural and search parameters of the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexParams {
    /// Coarse partitions (clamped to the entity count at build time)
    pub partitions: usize,
    pub metric: Metric,
    /// Seed for k-means seeding and training-sample selection
    pub seed: u64,
    pub kmeans_iters: usize,
    pub kmeans_tolerance: f32,
    /// Upper bound on vectors used to train the quantizer
    pub train_sample: usize,
    /// Partitions scanned per query unless the request overrides it
    pub nprobe: usize,
    /// Records sampled after each build to estimate recall@10; 0 disables it
    pub recall_sample: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            partitions: 64,
            metric: Metric::L2Squared,
            seed: 42,
            kmeans_iters: 20,
            kmeans_tolerance: 1e-4,
            train_sample: 50_000,
            nprobe: 8,
            recall_sample: 0,
        }
    }
}

impl IndexParams {
    pub fn ivf(&self) -> IvfParams {
        IvfParams {
            partitions: self.partitions,
            metric: self.metric,
            seed: self.seed,
            max_iters: self.kmeans_iters,
            tolerance: self.kmeans_tolerance,
            train_sample: self.train_sample,
        }
    }
}

/// What happens to an in-flight build when a newer trigger arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Let the build finish, then re-check staleness.
    #[default]
    FinishThenCheck,
    /// Cancel the build and start over from a fresh snapshot.
    AbortAndRestart,
}

/// When and how the refresh controller rebuilds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshPolicy {
    /// Rebuild once the active generation is this old (None disables)
    pub max_age_ms: Option<u64>,
    /// Rebuild once this many writes landed since the active snapshot (None disables)
    pub max_pending_writes: Option<u64>,
    /// How often the controller re-evaluates triggers
    pub poll_interval_ms: u64,
    pub cancel_policy: CancelPolicy,
    /// Retries of a transient build failure before it is reported as persistent
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_age_ms: Some(300_000),
            max_pending_writes: Some(10_000),
            poll_interval_ms: 100,
            cancel_policy: CancelPolicy::FinishThenCheck,
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 10_000,
        }
    }
}

impl RefreshPolicy {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Delay before retry number `attempt` (1-based): base doubling, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub dimension: usize,
    pub index: IndexParams,
    pub refresh: RefreshPolicy,
    /// Query pool size; 0 picks half the available cores (1..=4)
    pub query_threads: usize,
    /// Build pool size; 0 picks all available cores minus the query pool
    pub build_threads: usize,
    /// Lower CPU and IO priority of build threads (Linux only)
    pub low_priority_builds: bool,
    /// Persist generations and the store log after every promotion
    pub persist_generations: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("nodevec-data"),
            dimension: 0,
            index: IndexParams::default(),
            refresh: RefreshPolicy::default(),
            query_threads: 0,
            build_threads: 0,
            low_priority_builds: true,
            persist_generations: true,
        }
    }
}

impl EngineConfig {
    pub fn from_data_dir(data_dir: PathBuf, dimension: usize) -> Self {
        Self {
            data_dir,
            dimension,
            ..Self::default()
        }
    }

    /// Load and validate a JSON config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            std::fs::read(path).with_context(|| format!("reading config {:?}", path))?;
        let config: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing config {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            bail!("dimension must be at least 1");
        }
        if self.index.partitions == 0 {
            bail!("index.partitions must be at least 1");
        }
        if self.index.nprobe == 0 {
            bail!("index.nprobe must be at least 1");
        }
        if self.refresh.max_pending_writes == Some(0) {
            bail!("refresh.max_pending_writes must be at least 1 when set");
        }
        if self.refresh.backoff_base_ms > self.refresh.backoff_max_ms {
            bail!(
                "refresh.backoff_base_ms ({}) exceeds refresh.backoff_max_ms ({})",
                self.refresh.backoff_base_ms,
                self.refresh.backoff_max_ms
            );
        }
        Ok(())
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("records.log")
    }

    pub fn generations_dir(&self) -> PathBuf {
        self.data_dir.join("generations")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join("manifest.json")
    }
}
