//! nodevec: an embedding index that stays queryable while it is rebuilt
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Engine (ingest · search · stats)            │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │  VectorStore   │  │  QueryEngine     │  │ RefreshController│
//! │ versioned log  │  │  query pool      │  │ triggers, retry  │
//! └────────────────┘  └──────────────────┘  └──────────────────┘
//!          │                    ▲                     │
//!          │ snapshot           │ current()           │ build / promote
//!          ▼                    │                     ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │  IndexBuilder  │─►│  IndexManager    │◄─│ GenerationStore  │
//! │ IVF, bg pool   │  │  ArcSwap active  │  │ manifest + files │
//! └────────────────┘  └──────────────────┘  └──────────────────┘
//! ```
//!
//! Vector math, the store and the IVF index live in `nodevec-core`.

pub mod builder;
pub mod config;
pub mod controller;
pub mod engine;
pub mod generation;
pub mod manager;
pub mod metrics;
pub mod persist;
pub mod query;
pub mod telemetry;

pub use builder::{BuildExecutor, IndexBuilder};
pub use config::{CancelPolicy, EngineConfig, IndexParams, RefreshPolicy};
pub use controller::{ControllerState, CycleOutcome, ExternalBuild, RefreshController};
pub use engine::{Engine, EngineStats};
pub use generation::{GenerationId, IndexGeneration};
pub use manager::{IndexManager, Promotion};
pub use metrics::{MemorySink, MetricEvent, MetricSink, NoopSink, TracingSink};
pub use query::{IdFilter, QueryEngine, QueryHit, QueryRequest, QueryResult};

pub use nodevec_core::{EmbeddingRecord, EntityId, Error, Metric, StoreSnapshot, VectorStore};
