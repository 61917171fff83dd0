//! Slot ids and the on-disk key layouts that encode them.
//!
//! Every user key carries its slot as a fixed-width big-endian `u16` right
//! after the length-prefixed namespace, so one slot's keys form a contiguous
//! range in each column family and a prefix scan visits exactly that slot.

use anyhow::{ensure, Context, Result};

/// Logical partition of the keyspace; the unit of ownership transfer.
pub type SlotId = u16;

/// Number of slots a cluster is partitioned into.
pub const SLOT_COUNT: u16 = 16384;

/// Namespace used when the server runs without tenant isolation.
pub const DEFAULT_NAMESPACE: &[u8] = b"rift";

/// Maps a user key onto its slot.
pub fn key_slot(key: &[u8]) -> SlotId {
    (crc32fast::hash(key) % u32::from(SLOT_COUNT)) as SlotId
}

/// Prefix shared by every key of `slot` in the metadata column family:
/// `[ns_len][ns][slot BE]`.
pub fn slot_prefix(namespace: &[u8], slot: SlotId) -> Vec<u8> {
    debug_assert!(namespace.len() <= u8::MAX as usize);
    let mut out = Vec::with_capacity(1 + namespace.len() + 2);
    out.push(namespace.len() as u8);
    out.extend_from_slice(namespace);
    out.extend_from_slice(&slot.to_be_bytes());
    out
}

/// Full metadata-column key for `user_key`: `[ns_len][ns][slot BE][user_key]`.
pub fn metadata_key(namespace: &[u8], slot: SlotId, user_key: &[u8]) -> Vec<u8> {
    let mut out = slot_prefix(namespace, slot);
    out.extend_from_slice(user_key);
    out
}

/// Splits a metadata-column key into `(namespace, slot, user_key)`.
pub fn split_metadata_key(key: &[u8]) -> Result<(&[u8], SlotId, &[u8])> {
    ensure!(!key.is_empty(), "metadata key is empty");
    let ns_len = key[0] as usize;
    ensure!(key.len() >= 1 + ns_len + 2, "metadata key is truncated");
    let namespace = &key[1..1 + ns_len];
    let slot = u16::from_be_bytes([key[1 + ns_len], key[2 + ns_len]]);
    let user_key = &key[3 + ns_len..];
    Ok((namespace, slot, user_key))
}

/// Prefix shared by every subkey record of one key version:
/// `[ns_len][ns][slot BE][ukey_len BE][user_key][version BE]`.
pub fn subkey_prefix(namespace: &[u8], slot: SlotId, user_key: &[u8], version: u64) -> Vec<u8> {
    let mut out = slot_prefix(namespace, slot);
    out.extend_from_slice(&(user_key.len() as u32).to_be_bytes());
    out.extend_from_slice(user_key);
    out.extend_from_slice(&version.to_be_bytes());
    out
}

/// Full subkey-column key: [`subkey_prefix`] followed by the raw subkey.
pub fn subkey_key(
    namespace: &[u8],
    slot: SlotId,
    user_key: &[u8],
    version: u64,
    subkey: &[u8],
) -> Vec<u8> {
    let mut out = subkey_prefix(namespace, slot, user_key, version);
    out.extend_from_slice(subkey);
    out
}

/// Borrowed decomposition of a subkey-column key.
#[derive(Debug, PartialEq, Eq)]
pub struct SubkeyRef<'a> {
    pub namespace: &'a [u8],
    pub slot: SlotId,
    pub user_key: &'a [u8],
    pub version: u64,
    pub subkey: &'a [u8],
}

/// Splits a subkey-column key into its parts.
pub fn split_subkey_key(key: &[u8]) -> Result<SubkeyRef<'_>> {
    ensure!(!key.is_empty(), "subkey key is empty");
    let ns_len = key[0] as usize;
    let mut at = 1 + ns_len;
    ensure!(key.len() >= at + 2 + 4, "subkey key is truncated");
    let namespace = &key[1..1 + ns_len];
    let slot = u16::from_be_bytes([key[at], key[at + 1]]);
    at += 2;
    let ukey_len = u32::from_be_bytes(
        key[at..at + 4]
            .try_into()
            .context("subkey key length field")?,
    ) as usize;
    at += 4;
    ensure!(key.len() >= at + ukey_len + 8, "subkey key is truncated");
    let user_key = &key[at..at + ukey_len];
    at += ukey_len;
    let version = u64::from_be_bytes(key[at..at + 8].try_into().context("subkey key version")?);
    at += 8;
    Ok(SubkeyRef {
        namespace,
        slot,
        user_key,
        version,
        subkey: &key[at..],
    })
}

/// True when `key` (from any column family) belongs to `slot` in `namespace`.
pub fn key_in_slot(key: &[u8], namespace: &[u8], slot: SlotId) -> bool {
    key.starts_with(&slot_prefix(namespace, slot))
}
