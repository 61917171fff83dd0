//! Slot migration core for the RiftKV clustered key-value server.
//!
//! A RiftKV cluster partitions the keyspace into a fixed number of slots and
//! rebalances by moving one slot at a time from a source node to a
//! destination node while the source keeps serving traffic. This crate owns
//! that transfer: a consistent snapshot scan over the slot's keys, a WAL tail
//! that catches up with concurrent writes, a pipelined RESP sender with a
//! throughput ceiling, and the brief server-wide barrier under which the slot
//! is forbidden on the source so ownership can change hands with no lost
//! updates.
//!
//! The LSM engine, cluster topology, and the server's exclusivity lock are
//! consumed through capability handles ([`storage::StorageEngine`],
//! [`cluster::SlotTopology`], [`ExclusivityBarrier`]) passed to
//! [`migrate::SlotMigrator`] at construction.

pub mod cluster;
pub mod extractor;
pub mod metadata;
pub mod migrate;
pub mod pipeline;
pub mod resp;
pub mod slot;
pub mod storage;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

pub use migrate::{MigrationJob, MigrationState, MigrationStage, MigratorOptions, SlotMigrator};
pub use slot::{SlotId, SLOT_COUNT};

/// Synchronous admission errors returned to the operator command layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmitError {
    /// A migration job is already in flight.
    #[error("there is already a migrating slot")]
    AlreadyMigrating,

    /// The slot was already handed over and is forbidden on this node.
    #[error("can't migrate slot which has been migrated")]
    SlotAlreadyMigrated,

    /// The job parameters are malformed.
    #[error("invalid migration argument: {0}")]
    InvalidArgument(&'static str),
}

/// Marker error raised when the stop flag cuts a migration short.
///
/// Detectable via `anyhow::Error::is::<Canceled>` so callers can tell a
/// cancellation apart from transport or engine failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("key migration stopped due to a task cancellation")]
pub struct Canceled;

/// Server-wide readers-writers barrier shared with command admission.
///
/// Command workers hold the shared side while admitting a write; the migrator
/// takes the exclusive side once, to publish the forbidden slot. Together the
/// two sides guarantee that every write admitted before the barrier is fully
/// in the WAL before the migrator reads the head sequence after it.
#[derive(Debug, Default)]
pub struct ExclusivityBarrier {
    lock: RwLock<()>,
}

impl ExclusivityBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared side, held across one command admission.
    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive side, held only while the forbidden slot is published.
    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(PoisonError::into_inner)
    }
}
