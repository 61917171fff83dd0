//! Engine capability surface consumed by the migration driver.
//!
//! The production LSM engine lives outside this crate; the driver only needs
//! a read-consistent snapshot with its sequence number, prefix scans per
//! column family, the current WAL head, and a WAL iterator from a given
//! sequence. [`MemoryEngine`] implements the same surface in process and
//! backs the test suite and embedded deployments.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;

/// WAL sequence number. Each record consumes exactly one.
pub type SeqNo = u64;

/// Column families the migration core reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnFamily {
    /// Per-key metadata blobs (and string values).
    Metadata,
    /// Per-subkey records of complex kinds.
    Subkey,
    /// Stream entries.
    Stream,
}

impl ColumnFamily {
    fn index(self) -> usize {
        match self {
            Self::Metadata => 0,
            Self::Subkey => 1,
            Self::Stream => 2,
        }
    }
}

/// One write inside a WAL batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Put {
        cf: ColumnFamily,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: ColumnFamily,
        key: Vec<u8>,
    },
}

impl WalRecord {
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }
}

/// Atomic group of writes starting at `first_seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalBatch {
    pub first_seq: SeqNo,
    pub records: Vec<WalRecord>,
}

impl WalBatch {
    pub fn count(&self) -> u64 {
        self.records.len() as u64
    }

    /// Sequence number of the last record in this batch.
    pub fn last_seq(&self) -> SeqNo {
        self.first_seq + self.count().saturating_sub(1)
    }
}

/// Read-consistent view of the engine at a fixed sequence number.
pub trait SnapshotView: Send {
    /// Sequence number the view was taken at.
    fn sequence(&self) -> SeqNo;

    /// Ordered scan of every `(key, value)` under `prefix` in `cf`.
    fn scan_prefix(
        &self,
        cf: ColumnFamily,
        prefix: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>;
}

/// Iterator over WAL batches in sequence order.
pub type WalIter<'a> = Box<dyn Iterator<Item = Result<WalBatch>> + Send + 'a>;

/// Capability handle to the storage engine.
pub trait StorageEngine: Send + Sync + 'static {
    /// Acquires a snapshot; released when the returned view is dropped.
    fn acquire_snapshot(&self) -> Result<Box<dyn SnapshotView>>;

    /// Current WAL head sequence.
    fn latest_sequence(&self) -> SeqNo;

    /// WAL batches from `from_seq` onward. `from_seq` must be a batch
    /// boundary; callers verify the first batch lines up.
    fn wal_iterator(&self, from_seq: SeqNo) -> Result<WalIter<'_>>;
}

/// In-process engine with the same snapshot and WAL semantics as the LSM
/// engine, used by the tests and embedded deployments.
#[derive(Default)]
pub struct MemoryEngine {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    seq: SeqNo,
    cfs: [BTreeMap<Vec<u8>, Vec<u8>>; 3],
    wal: Vec<WalBatch>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `records` atomically and appends them to the WAL as one batch.
    /// Returns the sequence of the last record written.
    pub fn write_batch(&self, records: Vec<WalRecord>) -> SeqNo {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let first_seq = inner.seq + 1;
        for record in &records {
            match record {
                WalRecord::Put { cf, key, value } => {
                    inner.cfs[cf.index()].insert(key.clone(), value.clone());
                }
                WalRecord::Delete { cf, key } => {
                    inner.cfs[cf.index()].remove(key);
                }
            }
        }
        inner.seq += records.len() as u64;
        let last = inner.seq;
        inner.wal.push(WalBatch { first_seq, records });
        last
    }

    /// Point read of the live (not snapshot) state.
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.cfs[cf.index()].get(key).cloned()
    }
}

struct MemorySnapshot {
    seq: SeqNo,
    cfs: [BTreeMap<Vec<u8>, Vec<u8>>; 3],
}

impl SnapshotView for MemorySnapshot {
    fn sequence(&self) -> SeqNo {
        self.seq
    }

    fn scan_prefix(
        &self,
        cf: ColumnFamily,
        prefix: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_> {
        let prefix = prefix.to_vec();
        let iter = self.cfs[cf.index()]
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()));
        Box::new(iter)
    }
}

impl StorageEngine for MemoryEngine {
    fn acquire_snapshot(&self) -> Result<Box<dyn SnapshotView>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(Box::new(MemorySnapshot {
            seq: inner.seq,
            cfs: inner.cfs.clone(),
        }))
    }

    fn latest_sequence(&self) -> SeqNo {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .seq
    }

    fn wal_iterator(&self, from_seq: SeqNo) -> Result<WalIter<'_>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let batches: Vec<WalBatch> = inner
            .wal
            .iter()
            .filter(|batch| batch.last_seq() >= from_seq)
            .cloned()
            .collect();
        Ok(Box::new(batches.into_iter().map(Ok)))
    }
}
