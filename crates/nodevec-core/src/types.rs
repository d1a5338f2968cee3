//! Identifiers and records shared across the crate.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque entity identifier assigned by the encoder side (e.g. a graph node id).
///
/// Ordering is only used to break distance ties deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live embedding as seen through a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub entity_id: EntityId,
    pub vector: Arc<[f32]>,
    /// Encoder epoch in force when this vector was written.
    pub epoch: u64,
    /// Store write counter value assigned to the write.
    pub sequence: u64,
}

/// Validate length and finiteness of an incoming vector.
pub fn check_vector(vector: &[f32], dimension: usize) -> Result<()> {
    if vector.len() != dimension {
        return Err(Error::DimensionMismatch {
            expected: dimension,
            actual: vector.len(),
        });
    }
    if let Some(index) = vector.iter().position(|x| !x.is_finite()) {
        return Err(Error::InvalidVector { index });
    }
    Ok(())
}
