//! Binary on-disk layouts
//!
//! # Store log (`records.log`)
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "NVLOG001"
//! 0x08     4       u32 LE      Version (1)
//! 0x0C     4       u32 LE      D: Dimensions
//! 0x10     ...     entries     Repeated until EOF:
//!                              u8 op (1 = put, 2 = tombstone)
//!                              u64 LE sequence, u64 LE epoch, u64 LE entity id
//!                              [f32 LE; D] vector (puts only)
//! ```
//!
//! # Index generation (`gen-<id>-snap-<id>.nvx`)
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "NVGEN001"
//! 0x08     4       u32 LE      Version (1)
//! 0x0C     4       u32 LE      D: Dimensions
//! 0x10     1       u8          Metric tag
//! 0x11     3       [u8; 3]     Reserved
//! 0x14     4       u32 LE      P: Partitions
//! 0x18     8       u64 LE      Generation id
//! 0x20     8       u64 LE      Snapshot id
//! 0x28     8       u64 LE      Snapshot write counter
//! 0x30     8       u64 LE      Build timestamp (unix ms)
//! 0x38     8       u64 LE      Seed
//! 0x40     8       u64 LE      Entity count
//! 0x48     P*D*4   [f32]       Centroids
//! ...              partitions  Per partition: u32 LE count,
//!                              [u64 LE; count] ids, [f32 LE; count*D] vectors
//! ```
//!
//! Partition norms are not stored; they are recomputed on load.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::distance::Metric;
use crate::ivf::{IvfIndex, Partition};
use crate::store::{LogEntry, WriteOp};
use crate::types::EntityId;

/// Magic bytes identifying a store log.
pub const LOG_MAGIC: [u8; 8] = *b"NVLOG001";

/// Magic bytes identifying an index generation artifact.
pub const GENERATION_MAGIC: [u8; 8] = *b"NVGEN001";

pub const FORMAT_VERSION: u32 = 1;

/// Generation header size in bytes.
pub const GENERATION_HEADER_SIZE: usize = 72;

/// Largest element count reserved up front while decoding.
const PREALLOC_LIMIT: usize = 1 << 16;

const OP_PUT: u8 = 1;
const OP_TOMBSTONE: u8 = 2;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic bytes: expected {expected}")]
    InvalidMagic { expected: &'static str },

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("Unknown metric tag: {0}")]
    UnknownMetric(u8),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct LogHeader {
    pub dimension: u32,
}

/// Entries recovered from a log, and whether a partial entry was dropped.
#[derive(Debug, Default)]
pub struct LogReplay {
    pub entries: Vec<LogEntry>,
    pub torn_tail: bool,
}

/// Identity of a persisted generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationHeader {
    pub dimension: u32,
    pub metric: Metric,
    pub partitions: u32,
    pub generation_id: u64,
    pub snapshot_id: u64,
    pub snapshot_counter: u64,
    pub built_at_ms: u64,
    pub seed: u64,
    pub entity_count: u64,
}

impl GenerationHeader {
    pub fn to_bytes(&self) -> [u8; GENERATION_HEADER_SIZE] {
        let mut buf = [0u8; GENERATION_HEADER_SIZE];
        buf[0..8].copy_from_slice(&GENERATION_MAGIC);
        buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dimension.to_le_bytes());
        buf[16] = self.metric.to_tag();
        buf[20..24].copy_from_slice(&self.partitions.to_le_bytes());
        buf[24..32].copy_from_slice(&self.generation_id.to_le_bytes());
        buf[32..40].copy_from_slice(&self.snapshot_id.to_le_bytes());
        buf[40..48].copy_from_slice(&self.snapshot_counter.to_le_bytes());
        buf[48..56].copy_from_slice(&self.built_at_ms.to_le_bytes());
        buf[56..64].copy_from_slice(&self.seed.to_le_bytes());
        buf[64..72].copy_from_slice(&self.entity_count.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; GENERATION_HEADER_SIZE]) -> Result<Self, FormatError> {
        if bytes[0..8] != GENERATION_MAGIC {
            return Err(FormatError::InvalidMagic {
                expected: "NVGEN001",
            });
        }
        let version = le_u32(&bytes[8..12]);
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let metric = Metric::from_tag(bytes[16]).ok_or(FormatError::UnknownMetric(bytes[16]))?;

        Ok(Self {
            dimension: le_u32(&bytes[12..16]),
            metric,
            partitions: le_u32(&bytes[20..24]),
            generation_id: le_u64(&bytes[24..32]),
            snapshot_id: le_u64(&bytes[32..40]),
            snapshot_counter: le_u64(&bytes[40..48]),
            built_at_ms: le_u64(&bytes[48..56]),
            seed: le_u64(&bytes[56..64]),
            entity_count: le_u64(&bytes[64..72]),
        })
    }
}

// ============================================================================
// Store log
// ============================================================================

pub fn write_log_header<W: Write>(writer: &mut W, header: &LogHeader) -> Result<(), FormatError> {
    writer.write_all(&LOG_MAGIC)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
    writer.write_all(&header.dimension.to_le_bytes())?;
    Ok(())
}

pub fn read_log_header<R: Read>(reader: &mut R) -> Result<LogHeader, FormatError> {
    let mut buf = [0u8; 16];
    reader.read_exact(&mut buf)?;
    if buf[0..8] != LOG_MAGIC {
        return Err(FormatError::InvalidMagic {
            expected: "NVLOG001",
        });
    }
    let version = le_u32(&buf[8..12]);
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    Ok(LogHeader {
        dimension: le_u32(&buf[12..16]),
    })
}

pub fn write_log_entry<W: Write>(writer: &mut W, entry: &LogEntry) -> Result<(), FormatError> {
    let op = match entry.op {
        WriteOp::Put(_) => OP_PUT,
        WriteOp::Tombstone => OP_TOMBSTONE,
    };
    writer.write_all(&[op])?;
    writer.write_all(&entry.sequence.to_le_bytes())?;
    writer.write_all(&entry.epoch.to_le_bytes())?;
    writer.write_all(&entry.entity_id.0.to_le_bytes())?;
    if let WriteOp::Put(vector) = &entry.op {
        write_f32s(writer, vector)?;
    }
    Ok(())
}

/// Read entries until EOF. An entry cut short by EOF is reported as a torn
/// tail rather than an error; sequences must be strictly increasing.
pub fn read_log_entries<R: Read>(reader: &mut R, dimension: usize) -> Result<LogReplay, FormatError> {
    let mut replay = LogReplay::default();
    let mut last_sequence = 0u64;

    loop {
        let mut op = [0u8; 1];
        match reader.read_exact(&mut op) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let entry = match read_entry_body(reader, op[0], dimension) {
            Ok(entry) => entry,
            Err(FormatError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                replay.torn_tail = true;
                break;
            }
            Err(e) => return Err(e),
        };

        if entry.sequence <= last_sequence {
            return Err(FormatError::Corrupt(format!(
                "log sequence {} does not follow {}",
                entry.sequence, last_sequence
            )));
        }
        last_sequence = entry.sequence;
        replay.entries.push(entry);
    }

    Ok(replay)
}

fn read_entry_body<R: Read>(reader: &mut R, op: u8, dimension: usize) -> Result<LogEntry, FormatError> {
    let sequence = read_u64(reader)?;
    let epoch = read_u64(reader)?;
    let entity_id = EntityId(read_u64(reader)?);
    let op = match op {
        OP_PUT => WriteOp::Put(read_f32s(reader, dimension)?.into()),
        OP_TOMBSTONE => WriteOp::Tombstone,
        other => return Err(FormatError::Corrupt(format!("unknown log op {other}"))),
    };
    Ok(LogEntry {
        sequence,
        epoch,
        entity_id,
        op,
    })
}

// ============================================================================
// Index generation
// ============================================================================

/// Serialize a generation header followed by the index body.
pub fn write_generation<W: Write>(
    writer: &mut W,
    header: &GenerationHeader,
    index: &IvfIndex,
) -> Result<(), FormatError> {
    writer.write_all(&header.to_bytes())?;
    write_f32s(writer, index.centroids())?;
    for partition in index.partitions() {
        writer.write_all(&(partition.len() as u32).to_le_bytes())?;
        for id in partition.ids() {
            writer.write_all(&id.0.to_le_bytes())?;
        }
        write_f32s(writer, partition.vectors())?;
    }
    Ok(())
}

/// Read back what [`write_generation`] produced.
pub fn read_generation<R: Read>(reader: &mut R) -> Result<(GenerationHeader, IvfIndex), FormatError> {
    let mut header_bytes = [0u8; GENERATION_HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = GenerationHeader::from_bytes(&header_bytes)?;

    let dim = header.dimension as usize;
    let num_partitions = header.partitions as usize;
    if dim == 0 || num_partitions == 0 {
        return Err(FormatError::Corrupt(format!(
            "generation {} has dimension {} and {} partitions",
            header.generation_id, dim, num_partitions
        )));
    }

    // Counts come from an unchecksummed file: bound them before allocating
    if num_partitions as u64 > header.entity_count {
        return Err(FormatError::Corrupt(format!(
            "generation {} has {} partitions for {} entities",
            header.generation_id, num_partitions, header.entity_count
        )));
    }
    let centroids = read_f32s(reader, checked_len(num_partitions, dim)?)?;
    let mut partitions = Vec::with_capacity(num_partitions.min(PREALLOC_LIMIT));
    let mut total = 0u64;
    for _ in 0..num_partitions {
        let count = read_u32(reader)? as usize;
        if count as u64 > header.entity_count - total {
            return Err(FormatError::Corrupt(format!(
                "generation {} partition holds {} entities, only {} remain",
                header.generation_id,
                count,
                header.entity_count - total
            )));
        }
        let mut ids = Vec::with_capacity(count.min(PREALLOC_LIMIT));
        for _ in 0..count {
            ids.push(EntityId(read_u64(reader)?));
        }
        let vectors = read_f32s(reader, checked_len(count, dim)?)?;
        total += count as u64;
        partitions.push(Partition::new(ids, vectors, dim));
    }

    if total != header.entity_count {
        return Err(FormatError::Corrupt(format!(
            "generation {} declares {} entities but contains {}",
            header.generation_id, header.entity_count, total
        )));
    }

    let index = IvfIndex::from_parts(dim, header.metric, centroids, partitions)?;
    Ok((header, index))
}

// ============================================================================
// Little-endian helpers
// ============================================================================

#[inline]
fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

#[inline]
fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, FormatError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, FormatError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_f32s<W: Write>(writer: &mut W, values: &[f32]) -> Result<(), FormatError> {
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn checked_len(count: usize, dim: usize) -> Result<usize, FormatError> {
    count
        .checked_mul(dim)
        .filter(|n| n.checked_mul(4).is_some())
        .ok_or_else(|| FormatError::Corrupt(format!("{count} x {dim} floats overflow")))
}

/// Read `count` floats. The buffer grows with the bytes actually present, so
/// a bogus count fails with `UnexpectedEof` instead of a huge allocation.
fn read_f32s<R: Read>(reader: &mut R, count: usize) -> Result<Vec<f32>, FormatError> {
    let len = count
        .checked_mul(4)
        .ok_or_else(|| FormatError::Corrupt(format!("{count} floats overflow")))?;
    let mut bytes = Vec::with_capacity(len.min(PREALLOC_LIMIT * 4));
    reader.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
