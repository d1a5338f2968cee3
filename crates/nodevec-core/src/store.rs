//! Versioned, append-only embedding store
//!
//! Every write (put or tombstone) is appended to a log and stamped with a
//! monotonically increasing sequence number, the store's *write counter*.
//! Nothing is mutated in place: re-inserting an id appends a newer put that
//! supersedes the old one.
//!
//! # Concurrency
//!
//! ```text
//! base:   Arc<Vec<LogEntry>>                          latest put per id, compacted
//! sealed: [Arc<[LogEntry]>; SEGMENT_LEN] [..] [..]   immutable, shared by Arc
//! tail:   Vec<LogEntry> (< SEGMENT_LEN)               guarded by the log mutex
//! ```
//!
//! A snapshot holds the mutex only long enough to clone the sealed segment
//! pointers and the bounded tail, then materializes the live view outside the
//! lock. Writers therefore never wait on snapshot materialization and a
//! snapshot never observes a half-written entry.
//!
//! # Compaction
//!
//! [`VectorStore::compact`] folds a prefix of sealed segments into the base,
//! keeping only the newest put for each id and dropping superseded puts and
//! tombstones. The fold runs outside the log mutex; only the final swap
//! takes it. The newest log entry is never folded, so a replayed log always
//! restores the same write counter and epoch.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::format::{self, LogHeader};
use crate::types::{check_vector, EmbeddingRecord, EntityId};

/// Entries per sealed log segment.
pub const SEGMENT_LEN: usize = 1024;

/// Snapshots remembered for [`VectorStore::issued_counter`].
pub const ISSUED_HISTORY: usize = 1024;

/// Payload of one log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(Arc<[f32]>),
    Tombstone,
}

/// One write in the store log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub sequence: u64,
    pub epoch: u64,
    pub entity_id: EntityId,
    pub op: WriteOp,
}

#[derive(Default)]
struct Log {
    /// Puts surviving compaction, ordered by sequence.
    base: Arc<Vec<LogEntry>>,
    sealed: Vec<Arc<[LogEntry]>>,
    tail: Vec<LogEntry>,
    /// Live ids and the sequence of their current put.
    live: HashMap<EntityId, u64>,
    /// `(snapshot id, write counter)` of recent snapshots, oldest first.
    issued: VecDeque<(u64, u64)>,
}

struct Captured {
    base: Arc<Vec<LogEntry>>,
    sealed: Vec<Arc<[LogEntry]>>,
    tail: Vec<LogEntry>,
}

impl Captured {
    fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.base
            .iter()
            .chain(self.sealed.iter().flat_map(|s| s.iter()))
            .chain(self.tail.iter())
    }
}

impl Log {
    fn push(&mut self, entry: LogEntry) {
        self.tail.push(entry);
        if self.tail.len() >= SEGMENT_LEN {
            let segment: Arc<[LogEntry]> = std::mem::take(&mut self.tail).into();
            self.sealed.push(segment);
        }
    }

    /// Cheap capture: Arc clones for the base and sealed segments, a bounded
    /// copy of the tail.
    fn capture(&self) -> Captured {
        Captured {
            base: self.base.clone(),
            sealed: self.sealed.clone(),
            tail: self.tail.clone(),
        }
    }

    fn len(&self) -> usize {
        self.base.len() + self.sealed.iter().map(|s| s.len()).sum::<usize>() + self.tail.len()
    }
}

/// Append-only embedding store with point-in-time snapshots.
pub struct VectorStore {
    dimension: usize,
    log: Mutex<Log>,
    write_counter: AtomicU64,
    epoch: AtomicU64,
    next_snapshot_id: AtomicU64,
    compaction: Mutex<()>,
}

impl VectorStore {
    /// Create an empty store for vectors of `dimension` elements.
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidDimension(dimension));
        }
        Ok(Self {
            dimension,
            log: Mutex::new(Log::default()),
            write_counter: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            next_snapshot_id: AtomicU64::new(1),
            compaction: Mutex::new(()),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Sequence number of the most recent write (0 when nothing was written).
    pub fn write_counter(&self) -> u64 {
        self.write_counter.load(Ordering::Acquire)
    }

    /// Current encoder epoch stamped on new writes.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Number of ids currently live.
    pub fn live_count(&self) -> usize {
        self.log.lock().live.len()
    }

    /// Entries currently held in the log, compacted base included.
    pub fn log_len(&self) -> usize {
        self.log.lock().len()
    }

    /// Id of the most recent snapshot (0 when none was taken).
    pub fn last_snapshot_id(&self) -> u64 {
        self.next_snapshot_id.load(Ordering::Acquire) - 1
    }

    /// Make every future snapshot id greater than `snapshot_id`.
    pub fn reserve_snapshot_ids_after(&self, snapshot_id: u64) {
        self.next_snapshot_id
            .fetch_max(snapshot_id.saturating_add(1), Ordering::AcqRel);
    }

    /// Write counter captured by snapshot `snapshot_id`, if this store issued
    /// it among its last [`ISSUED_HISTORY`] snapshots.
    pub fn issued_counter(&self, snapshot_id: u64) -> Option<u64> {
        let log = self.log.lock();
        log.issued
            .binary_search_by_key(&snapshot_id, |&(id, _)| id)
            .ok()
            .map(|idx| log.issued[idx].1)
    }

    /// Start a new encoder epoch (e.g. after the encoder was retrained).
    pub fn begin_epoch(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(epoch, "vector store entered new encoder epoch");
        epoch
    }

    /// Append `vector` for `entity_id`, superseding any previous vector.
    ///
    /// Returns the sequence number assigned to the write.
    pub fn append(&self, entity_id: EntityId, vector: &[f32]) -> Result<u64> {
        check_vector(vector, self.dimension)?;
        let vector: Arc<[f32]> = vector.into();

        let mut log = self.log.lock();
        let sequence = self.write_counter.load(Ordering::Relaxed) + 1;
        log.push(LogEntry {
            sequence,
            epoch: self.epoch.load(Ordering::Acquire),
            entity_id,
            op: WriteOp::Put(vector),
        });
        log.live.insert(entity_id, sequence);
        self.write_counter.store(sequence, Ordering::Release);
        Ok(sequence)
    }

    /// Logically delete `entity_id`.
    ///
    /// Idempotent: returns `false` without writing when the id is absent or
    /// already tombstoned.
    pub fn tombstone(&self, entity_id: EntityId) -> bool {
        let mut log = self.log.lock();
        if log.live.remove(&entity_id).is_none() {
            return false;
        }
        let sequence = self.write_counter.load(Ordering::Relaxed) + 1;
        log.push(LogEntry {
            sequence,
            epoch: self.epoch.load(Ordering::Acquire),
            entity_id,
            op: WriteOp::Tombstone,
        });
        self.write_counter.store(sequence, Ordering::Release);
        true
    }

    /// Capture a consistent, immutable view of all live records.
    pub fn snapshot(&self) -> StoreSnapshot {
        let (captured, counter, id) = {
            let mut log = self.log.lock();
            let counter = self.write_counter.load(Ordering::Acquire);
            let id = self.next_snapshot_id.fetch_add(1, Ordering::AcqRel);
            log.issued.push_back((id, counter));
            if log.issued.len() > ISSUED_HISTORY {
                log.issued.pop_front();
            }
            (log.capture(), counter, id)
        };

        let mut latest: BTreeMap<EntityId, Option<EmbeddingRecord>> = BTreeMap::new();
        for entry in captured.entries() {
            let value = match &entry.op {
                WriteOp::Put(vector) => Some(EmbeddingRecord {
                    entity_id: entry.entity_id,
                    vector: vector.clone(),
                    epoch: entry.epoch,
                    sequence: entry.sequence,
                }),
                WriteOp::Tombstone => None,
            };
            latest.insert(entry.entity_id, value);
        }

        let records: Vec<EmbeddingRecord> = latest.into_values().flatten().collect();
        StoreSnapshot {
            id,
            write_counter: counter,
            dimension: self.dimension,
            records: records.into(),
        }
    }

    /// Persist the full write log to `path` (temp file + rename).
    pub fn save_log<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        let path = path.as_ref();
        let (captured, counter) = {
            let log = self.log.lock();
            (log.capture(), self.write_counter.load(Ordering::Acquire))
        };

        let tmp = path.with_extension("log.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            let header = LogHeader {
                dimension: self.dimension as u32,
            };
            format::write_log_header(&mut writer, &header)?;
            for entry in captured.entries() {
                format::write_log_entry(&mut writer, entry)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(counter)
    }

    /// Fold sealed segments whose writes are all at or below `up_to` into the
    /// compacted base.
    ///
    /// Returns the number of log entries dropped. Snapshots taken before and
    /// after compaction see the same records.
    pub fn compact(&self, up_to: u64) -> usize {
        let _guard = self.compaction.lock();
        let (base, prefix) = {
            let log = self.log.lock();
            // The newest entry stays in the log so replay restores the counter
            let eligible = if log.tail.is_empty() {
                log.sealed.len().saturating_sub(1)
            } else {
                log.sealed.len()
            };
            let prefix: Vec<Arc<[LogEntry]>> = log.sealed[..eligible]
                .iter()
                .take_while(|s| s.last().map_or(true, |e| e.sequence <= up_to))
                .cloned()
                .collect();
            (log.base.clone(), prefix)
        };
        if prefix.is_empty() {
            return 0;
        }

        let before = base.len() + prefix.iter().map(|s| s.len()).sum::<usize>();
        let mut latest: HashMap<EntityId, LogEntry> = HashMap::with_capacity(base.len());
        for entry in base.iter().chain(prefix.iter().flat_map(|s| s.iter())) {
            match entry.op {
                WriteOp::Put(_) => {
                    latest.insert(entry.entity_id, entry.clone());
                }
                WriteOp::Tombstone => {
                    latest.remove(&entry.entity_id);
                }
            }
        }
        let mut folded: Vec<LogEntry> = latest.into_values().collect();
        folded.sort_unstable_by_key(|e| e.sequence);
        let dropped = before - folded.len();

        {
            let mut log = self.log.lock();
            log.base = Arc::new(folded);
            log.sealed.drain(..prefix.len());
        }
        tracing::debug!(
            up_to,
            segments = prefix.len(),
            dropped,
            "compacted vector store log"
        );
        dropped
    }

    /// Rebuild a store by replaying a log written by [`VectorStore::save_log`].
    ///
    /// A header dimension different from `expected_dimension` is fatal for
    /// this store instance. A torn trailing entry is dropped.
    pub fn load<P: AsRef<Path>>(path: P, expected_dimension: usize) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        let header = format::read_log_header(&mut reader)?;
        if header.dimension as usize != expected_dimension {
            return Err(Error::DimensionMismatch {
                expected: expected_dimension,
                actual: header.dimension as usize,
            });
        }

        let replay = format::read_log_entries(&mut reader, expected_dimension)?;
        if replay.torn_tail {
            tracing::warn!(
                path = %path.as_ref().display(),
                replayed = replay.entries.len(),
                "dropping torn trailing entry from store log"
            );
        }

        let store = Self::new(expected_dimension)?;
        {
            let mut log = store.log.lock();
            let mut counter = 0u64;
            let mut epoch = 0u64;
            for entry in replay.entries {
                counter = entry.sequence;
                epoch = epoch.max(entry.epoch);
                match entry.op {
                    WriteOp::Put(_) => {
                        log.live.insert(entry.entity_id, entry.sequence);
                    }
                    WriteOp::Tombstone => {
                        log.live.remove(&entry.entity_id);
                    }
                }
                log.push(entry);
            }
            store.write_counter.store(counter, Ordering::Release);
            store.epoch.store(epoch, Ordering::Release);
        }
        Ok(store)
    }
}

/// Frozen view of the live records at one write counter value.
///
/// Records are sorted by entity id.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    id: u64,
    write_counter: u64,
    dimension: usize,
    records: Arc<[EmbeddingRecord]>,
}

impl StoreSnapshot {
    /// Assemble a snapshot from externally produced records (sorted and
    /// de-duplicated by entity id, last one wins).
    pub fn from_records(
        id: u64,
        write_counter: u64,
        dimension: usize,
        records: Vec<EmbeddingRecord>,
    ) -> Result<Self> {
        let mut by_id = BTreeMap::new();
        for record in records {
            check_vector(&record.vector, dimension)?;
            by_id.insert(record.entity_id, record);
        }
        Ok(Self {
            id,
            write_counter,
            dimension,
            records: by_id.into_values().collect::<Vec<_>>().into(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn write_counter(&self) -> u64 {
        self.write_counter
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, entity_id: EntityId) -> Option<&EmbeddingRecord> {
        self.records
            .binary_search_by_key(&entity_id, |r| r.entity_id)
            .ok()
            .map(|idx| &self.records[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id(v: u64) -> EntityId {
        EntityId(v)
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(matches!(
            VectorStore::new(0),
            Err(Error::InvalidDimension(0))
        ));
    }

    #[test]
    fn test_append_validates_input() {
        let store = VectorStore::new(3).unwrap();
        assert!(matches!(
            store.append(id(1), &[1.0, 2.0]),
            Err(Error::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert!(matches!(
            store.append(id(1), &[1.0, f32::NAN, 0.0]),
            Err(Error::InvalidVector { index: 1 })
        ));
        assert_eq!(store.write_counter(), 0);
    }

    #[test]
    fn test_snapshot_keeps_latest_vector_per_id() {
        let store = VectorStore::new(2).unwrap();
        store.append(id(7), &[1.0, 1.0]).unwrap();
        store.append(id(3), &[0.0, 1.0]).unwrap();
        store.append(id(7), &[2.0, 2.0]).unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.write_counter(), 3);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.records()[0].entity_id, id(3));
        assert_eq!(&*snap.get(id(7)).unwrap().vector, &[2.0, 2.0]);
        assert_eq!(snap.get(id(7)).unwrap().sequence, 3);
    }

    #[test]
    fn test_tombstone_is_idempotent() {
        let store = VectorStore::new(2).unwrap();
        store.append(id(1), &[1.0, 0.0]).unwrap();
        store.append(id(2), &[0.0, 1.0]).unwrap();

        assert!(store.tombstone(id(1)));
        let counter = store.write_counter();
        assert!(!store.tombstone(id(1)));
        assert!(!store.tombstone(id(99)));
        assert_eq!(store.write_counter(), counter);

        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap.get(id(1)).is_none());
        assert_eq!(store.live_count(), 1);
    }

    #[test]
    fn test_reinsert_after_tombstone_revives() {
        let store = VectorStore::new(1).unwrap();
        store.append(id(1), &[1.0]).unwrap();
        store.tombstone(id(1));
        store.append(id(1), &[5.0]).unwrap();

        let snap = store.snapshot();
        assert_eq!(&*snap.get(id(1)).unwrap().vector, &[5.0]);
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let store = VectorStore::new(1).unwrap();
        store.append(id(1), &[1.0]).unwrap();
        let before = store.snapshot();
        store.append(id(2), &[2.0]).unwrap();
        store.tombstone(id(1));

        assert_eq!(before.len(), 1);
        assert!(before.get(id(1)).is_some());
        assert!(store.snapshot().id() > before.id());
    }

    #[test]
    fn test_epoch_is_stamped() {
        let store = VectorStore::new(1).unwrap();
        store.append(id(1), &[1.0]).unwrap();
        assert_eq!(store.begin_epoch(), 1);
        store.append(id(2), &[2.0]).unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.get(id(1)).unwrap().epoch, 0);
        assert_eq!(snap.get(id(2)).unwrap().epoch, 1);
    }

    #[test]
    fn test_segments_seal_across_boundary() {
        let store = VectorStore::new(1).unwrap();
        let n = SEGMENT_LEN * 2 + 17;
        for i in 0..n {
            store.append(id(i as u64), &[i as f32]).unwrap();
        }
        let snap = store.snapshot();
        assert_eq!(snap.len(), n);
        assert_eq!(snap.write_counter(), n as u64);
        assert_eq!(&*snap.get(id(SEGMENT_LEN as u64)).unwrap().vector, &[SEGMENT_LEN as f32]);
    }

    #[test]
    fn test_concurrent_appends_and_snapshots() {
        let store = Arc::new(VectorStore::new(4).unwrap());
        let writers: Vec<_> = (0..4u64)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        store
                            .append(id(w * 10_000 + i), &[w as f32, i as f32, 0.0, 1.0])
                            .unwrap();
                    }
                })
            })
            .collect();

        let mut last_counter = 0;
        for _ in 0..50 {
            let snap = store.snapshot();
            assert!(snap.write_counter() >= last_counter);
            // Every record in the view was written at or before the capture counter
            assert!(snap
                .records()
                .iter()
                .all(|r| r.sequence <= snap.write_counter() && r.vector.len() == 4));
            last_counter = snap.write_counter();
        }

        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(store.snapshot().len(), 2000);
    }

    #[test]
    fn test_save_and_load_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.log");

        let store = VectorStore::new(2).unwrap();
        store.append(id(1), &[1.0, 2.0]).unwrap();
        store.begin_epoch();
        store.append(id(2), &[3.0, 4.0]).unwrap();
        store.tombstone(id(1));
        assert_eq!(store.save_log(&path).unwrap(), 3);

        let loaded = VectorStore::load(&path, 2).unwrap();
        assert_eq!(loaded.write_counter(), 3);
        assert_eq!(loaded.epoch(), 1);
        let snap = loaded.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(&*snap.get(id(2)).unwrap().vector, &[3.0, 4.0]);

        // Writes continue numbering after the replayed log
        assert_eq!(loaded.append(id(5), &[0.0, 0.0]).unwrap(), 4);
    }

    #[test]
    fn test_load_with_wrong_dimension_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.log");
        let store = VectorStore::new(2).unwrap();
        store.append(id(1), &[1.0, 2.0]).unwrap();
        store.save_log(&path).unwrap();

        assert!(matches!(
            VectorStore::load(&path, 3),
            Err(Error::DimensionMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_compaction_bounds_log_of_reappended_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.log");
        let store = VectorStore::new(2).unwrap();
        for round in 0..100u64 {
            for i in 0..50u64 {
                store.append(id(i), &[round as f32, i as f32]).unwrap();
            }
            if round % 7 == 0 {
                store.tombstone(id(round % 50));
            }
        }
        let before = store.snapshot();
        let dropped = store.compact(store.write_counter());

        assert!(dropped > 0);
        assert!(store.log_len() <= 50 + 2 * SEGMENT_LEN, "log_len {}", store.log_len());
        let after = store.snapshot();
        assert_eq!(after.write_counter(), before.write_counter());
        assert_eq!(after.records(), before.records());

        store.save_log(&path).unwrap();
        let loaded = VectorStore::load(&path, 2).unwrap();
        assert_eq!(loaded.write_counter(), store.write_counter());
        assert_eq!(loaded.snapshot().records(), before.records());
        assert_eq!(loaded.live_count(), store.live_count());
    }

    #[test]
    fn test_compaction_stays_bounded_across_repeated_rounds() {
        let store = VectorStore::new(1).unwrap();
        for round in 0..20u64 {
            for i in 0..300u64 {
                store.append(id(i), &[round as f32]).unwrap();
            }
            store.compact(store.write_counter());
            assert!(store.log_len() <= 300 + 2 * SEGMENT_LEN, "round {round}");
        }
        let snap = store.snapshot();
        assert_eq!(snap.len(), 300);
        assert!(snap.records().iter().all(|r| *r.vector == [19.0]));
    }

    #[test]
    fn test_compaction_respects_upper_bound() {
        let store = VectorStore::new(1).unwrap();
        for i in 0..(SEGMENT_LEN * 3) as u64 {
            store.append(id(i % 10), &[i as f32]).unwrap();
        }
        // Nothing sealed lies entirely at or below sequence 10
        assert_eq!(store.compact(10), 0);
        let len = store.log_len();
        assert_eq!(len, SEGMENT_LEN * 3);

        store.compact(SEGMENT_LEN as u64);
        assert_eq!(store.log_len(), 10 + SEGMENT_LEN * 2);
    }

    #[test]
    fn test_issued_counter_tracks_snapshots() {
        let store = VectorStore::new(1).unwrap();
        store.append(id(1), &[1.0]).unwrap();
        let first = store.snapshot();
        store.append(id(2), &[2.0]).unwrap();
        let second = store.snapshot();

        assert_eq!(store.issued_counter(first.id()), Some(1));
        assert_eq!(store.issued_counter(second.id()), Some(2));
        assert_eq!(store.issued_counter(second.id() + 1), None);

        for _ in 0..ISSUED_HISTORY {
            store.snapshot();
        }
        assert_eq!(store.issued_counter(first.id()), None);
    }

    #[test]
    fn test_snapshot_ids_can_be_reserved() {
        let store = VectorStore::new(1).unwrap();
        assert_eq!(store.last_snapshot_id(), 0);
        store.reserve_snapshot_ids_after(41);
        assert_eq!(store.snapshot().id(), 42);
        // Reserving below the current id never rewinds
        store.reserve_snapshot_ids_after(3);
        assert_eq!(store.snapshot().id(), 43);
        assert_eq!(store.last_snapshot_id(), 43);
    }

    #[test]
    fn test_load_drops_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.log");
        let store = VectorStore::new(2).unwrap();
        store.append(id(1), &[1.0, 2.0]).unwrap();
        store.append(id(2), &[3.0, 4.0]).unwrap();
        store.save_log(&path).unwrap();

        // Chop the last float off the final entry
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        let loaded = VectorStore::load(&path, 2).unwrap();
        assert_eq!(loaded.write_counter(), 1);
        assert_eq!(loaded.snapshot().len(), 1);
    }
}
