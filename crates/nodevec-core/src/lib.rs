//! nodevec core – versioned embedding store, IVF index and vector math
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              IVF-Flat index (k-means quantizer)             │
//! │     nprobe partition scan · widening · filtered search      │
//! ├─────────────────────────────────────────────────────────────┤
//! │        Distance kernels (NEON / AVX2+FMA / scalar)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │      VectorStore (segmented append-only log, snapshots)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod cancel;
pub mod distance;
pub mod error;
pub mod format;
pub mod ivf;
pub mod kmeans;
pub mod store;
pub mod types;

pub use cancel::CancelToken;
pub use distance::{dot_product, l2_distance_squared, l2_norm, Metric};
pub use error::{Error, Result};
pub use format::FormatError;
pub use ivf::{IvfIndex, IvfParams, SearchOutput, SearchParams};
pub use store::{StoreSnapshot, VectorStore};
pub use types::{EmbeddingRecord, EntityId};
