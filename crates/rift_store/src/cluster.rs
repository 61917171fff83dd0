//! Cluster-topology capability consumed by the migration driver.

use anyhow::Result;

use crate::slot::SlotId;

/// Commits slot ownership changes into the cluster topology.
///
/// The driver calls this exactly once per successful migration, after the
/// destination acknowledged `IMPORT SUCCESS`; a failure here fails the
/// migration and the destination is left to garbage-collect.
pub trait SlotTopology: Send + Sync + 'static {
    /// Records that `slot` is now served by `dst`, as `ip:port`.
    fn commit_slot_migrated(&self, slot: SlotId, dst: &str) -> Result<()>;
}
