//! Value-kind metadata and per-subkey record codecs.
//!
//! The metadata column family stores one blob per user key. Every blob opens
//! with `[kind:u8][expire_ms:u64 BE]`; a string keeps its value as the tail of
//! the blob, every other kind continues with `[version:u64 BE][size:u64 BE]`
//! and streams append their id counters. Subkey records use the encodings in
//! this module for scores, sortedint ids, and stream entries.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, ensure, Context, Result};

/// Byte offset of a string value inside its metadata blob.
pub const STRING_HEADER_LEN: usize = 9;

/// Bitmap fragment width; one subkey record covers this many bytes.
pub const BITMAP_FRAGMENT_BYTES: usize = 1024;

/// Kind tag stored in the first metadata byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    String = 0,
    List = 1,
    Hash = 2,
    Set = 3,
    ZSet = 4,
    SortedInt = 5,
    Bitmap = 6,
    Stream = 7,
}

impl ValueKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::String,
            1 => Self::List,
            2 => Self::Hash,
            3 => Self::Set,
            4 => Self::ZSet,
            5 => Self::SortedInt,
            6 => Self::Bitmap,
            7 => Self::Stream,
            other => bail!("unknown value kind tag {other}"),
        })
    }

    /// Restore verb used when re-creating this kind on a destination node.
    pub fn restore_verb(self) -> &'static str {
        match self {
            Self::String => "SET",
            Self::List => "RPUSH",
            Self::Hash => "HMSET",
            Self::Set => "SADD",
            Self::ZSet => "ZADD",
            Self::SortedInt => "SIADD",
            Self::Bitmap => "SETBIT",
            Self::Stream => "XADD",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::List => "list",
            Self::Hash => "hash",
            Self::Set => "set",
            Self::ZSet => "zset",
            Self::SortedInt => "sortedint",
            Self::Bitmap => "bitmap",
            Self::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// Decoded metadata common to all kinds.
///
/// For strings `version` and `size` stay zero; the value is the blob tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: ValueKind,
    /// Absolute expiry in unix milliseconds, 0 for none.
    pub expire_ms: u64,
    pub version: u64,
    pub size: u64,
}

impl Metadata {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure!(buf.len() >= STRING_HEADER_LEN, "metadata blob is truncated");
        let kind = ValueKind::from_u8(buf[0])?;
        let expire_ms = read_u64(buf, 1)?;
        if kind == ValueKind::String {
            return Ok(Self {
                kind,
                expire_ms,
                version: 0,
                size: 0,
            });
        }
        let version = read_u64(buf, 9)?;
        let size = read_u64(buf, 17)?;
        Ok(Self {
            kind,
            expire_ms,
            version,
            size,
        })
    }

    /// Encodes a non-string metadata blob.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert_ne!(self.kind, ValueKind::String);
        let mut out = Vec::with_capacity(25);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.expire_ms.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.size.to_be_bytes());
        out
    }

    /// Encodes a string metadata blob with the value as the tail.
    pub fn encode_string(expire_ms: u64, value: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(STRING_HEADER_LEN + value.len());
        out.push(ValueKind::String as u8);
        out.extend_from_slice(&expire_ms.to_be_bytes());
        out.extend_from_slice(value);
        out
    }

    /// The string value stored after the expiry header.
    pub fn string_value(blob: &[u8]) -> Result<&[u8]> {
        ensure!(blob.len() >= STRING_HEADER_LEN, "string blob is truncated");
        Ok(&blob[STRING_HEADER_LEN..])
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expire_ms > 0 && self.expire_ms <= now_ms
    }
}

/// Stream entry id, ordered by `(ms, seq)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct StreamEntryId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamEntryId {
    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.ms.to_be_bytes());
        out[8..].copy_from_slice(&self.seq.to_be_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        ensure!(buf.len() == 16, "stream entry id must be 16 bytes");
        Ok(Self {
            ms: u64::from_be_bytes(buf[..8].try_into().context("stream id ms")?),
            seq: u64::from_be_bytes(buf[8..].try_into().context("stream id seq")?),
        })
    }
}

impl fmt::Display for StreamEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Stream metadata: the common header plus the id counters `XSETID` restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMetadata {
    pub base: Metadata,
    pub last_generated_id: StreamEntryId,
    pub max_deleted_entry_id: StreamEntryId,
    pub entries_added: u64,
}

impl StreamMetadata {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let base = Metadata::decode(buf)?;
        ensure!(base.kind == ValueKind::Stream, "not a stream metadata blob");
        ensure!(buf.len() >= 25 + 16 + 16 + 8, "stream metadata is truncated");
        let last_generated_id = StreamEntryId::from_bytes(&buf[25..41])?;
        let max_deleted_entry_id = StreamEntryId::from_bytes(&buf[41..57])?;
        let entries_added = read_u64(buf, 57)?;
        Ok(Self {
            base,
            last_generated_id,
            max_deleted_entry_id,
            entries_added,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.base.encode();
        out.extend_from_slice(&self.last_generated_id.to_bytes());
        out.extend_from_slice(&self.max_deleted_entry_id.to_bytes());
        out.extend_from_slice(&self.entries_added.to_be_bytes());
        out
    }
}

/// Order-preserving encoding of an `f64` score.
///
/// Positive values get the sign bit flipped, negative values are fully
/// inverted, so byte order equals numeric order.
pub fn encode_score(score: f64) -> [u8; 8] {
    let bits = score.to_bits();
    let mapped = if bits & (1 << 63) == 0 {
        bits | (1 << 63)
    } else {
        !bits
    };
    mapped.to_be_bytes()
}

pub fn decode_score(buf: &[u8]) -> Result<f64> {
    ensure!(buf.len() >= 8, "score record is truncated");
    let mapped = u64::from_be_bytes(buf[..8].try_into().context("score bytes")?);
    let bits = if mapped & (1 << 63) != 0 {
        mapped & !(1 << 63)
    } else {
        !mapped
    };
    Ok(f64::from_bits(bits))
}

/// Shortest decimal form of a score, `5` rather than `5.0`.
pub fn format_score(score: f64) -> String {
    if score == score.trunc() && score.abs() < 1e15 {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}

/// Sortedint member ids are stored as fixed little-endian `u64`.
pub fn encode_sortedint_id(id: u64) -> [u8; 8] {
    id.to_le_bytes()
}

pub fn decode_sortedint_id(buf: &[u8]) -> Result<u64> {
    ensure!(buf.len() >= 8, "sortedint id is truncated");
    Ok(u64::from_le_bytes(buf[..8].try_into().context("id bytes")?))
}

/// Encodes a stream entry's field-value pairs.
pub fn encode_stream_fields(fields: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(fields.len() as u32).to_be_bytes());
    for (field, value) in fields {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field);
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }
    out
}

pub fn decode_stream_fields(buf: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut at = 0usize;
    let count = read_u32(buf, &mut at)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let field = read_chunk(buf, &mut at)?;
        let value = read_chunk(buf, &mut at)?;
        out.push((field, value));
    }
    Ok(out)
}

/// Parses a bitmap fragment subkey: the ASCII-decimal byte offset at which
/// the fragment starts.
pub fn parse_bitmap_index(subkey: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(subkey)
        .map_err(|_| anyhow::anyhow!("bitmap fragment index is not ascii"))?;
    text.parse::<u64>()
        .map_err(|_| anyhow::anyhow!("bitmap fragment index is not a valid integer: {text:?}"))
}

/// Absolute bit offsets of every set bit in a fragment starting at byte
/// offset `index`.
pub fn bitmap_bit_offsets(index: u64, fragment: &[u8]) -> Vec<u64> {
    let mut out = Vec::new();
    for (byte_idx, byte) in fragment.iter().enumerate() {
        if *byte == 0 {
            continue;
        }
        for bit_idx in 0..8u64 {
            if byte & (1 << bit_idx) != 0 {
                out.push(index * 8 + byte_idx as u64 * 8 + bit_idx);
            }
        }
    }
    out
}

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}

fn read_u64(buf: &[u8], at: usize) -> Result<u64> {
    ensure!(buf.len() >= at + 8, "metadata field is truncated");
    Ok(u64::from_be_bytes(
        buf[at..at + 8].try_into().context("u64 field")?,
    ))
}

fn read_u32(buf: &[u8], at: &mut usize) -> Result<u32> {
    ensure!(buf.len() >= *at + 4, "stream payload is truncated");
    let v = u32::from_be_bytes(buf[*at..*at + 4].try_into().context("u32 field")?);
    *at += 4;
    Ok(v)
}

fn read_chunk(buf: &[u8], at: &mut usize) -> Result<Vec<u8>> {
    let len = read_u32(buf, at)? as usize;
    ensure!(buf.len() >= *at + len, "stream payload is truncated");
    let out = buf[*at..*at + len].to_vec();
    *at += len;
    Ok(out)
}
