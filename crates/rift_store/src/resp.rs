//! RESP framing for restore commands and the incremental response verifier.
//!
//! Restore commands go out as multi-bulk frames. The destination answers each
//! one with a single reply; [`ResponseVerifier`] counts those replies out of a
//! byte buffer without assuming a reply arrives in one read, so it works over
//! any transport that delivers bytes in arbitrary chunks.

use anyhow::{bail, ensure, Result};
use bytes::{Buf, BytesMut};

/// Appends one multi-bulk command frame to `out`.
pub fn encode_multi_bulk<A: AsRef<[u8]>>(out: &mut BytesMut, args: &[A]) {
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    /// Dispatch on the first byte of a reply line.
    ArrayLen,
    /// Parse the `$<len>` header of a bulk reply.
    BulkLen,
    /// Consume `bulk_remaining` payload bytes (CRLF included).
    BulkData,
    /// One full reply consumed.
    OneRspEnd,
}

/// Incremental counter of single-frame replies.
///
/// Feed it the receive buffer as bytes arrive; it consumes complete replies,
/// leaves partial ones in place, and keeps its position across calls. An
/// error reply (`-...`) or a malformed frame fails verification.
#[derive(Debug)]
pub struct ResponseVerifier {
    state: ParserState,
    bulk_remaining: usize,
}

impl Default for ResponseVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseVerifier {
    pub fn new() -> Self {
        Self {
            state: ParserState::ArrayLen,
            bulk_remaining: 0,
        }
    }

    /// Consumes as many complete replies as `buf` holds; returns how many.
    pub fn consume(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let mut completed = 0usize;
        loop {
            match self.state {
                ParserState::ArrayLen => {
                    let Some(line_end) = find_crlf(buf) else {
                        return Ok(completed);
                    };
                    match buf.first().copied() {
                        Some(b'-') => {
                            let line = String::from_utf8_lossy(&buf[..line_end]).into_owned();
                            bail!("destination replied with an error: {line}");
                        }
                        Some(b'$') => self.state = ParserState::BulkLen,
                        Some(b'+') | Some(b':') => {
                            buf.advance(line_end + 2);
                            self.state = ParserState::OneRspEnd;
                        }
                        _ => {
                            let line = String::from_utf8_lossy(&buf[..line_end]).into_owned();
                            bail!("protocol error: unexpected reply line {line:?}");
                        }
                    }
                }
                ParserState::BulkLen => {
                    let Some(line_end) = find_crlf(buf) else {
                        return Ok(completed);
                    };
                    let len = parse_int(&buf[1..line_end])?;
                    buf.advance(line_end + 2);
                    if len < 0 {
                        // RESP nil carries no payload.
                        self.state = ParserState::OneRspEnd;
                    } else {
                        self.bulk_remaining = len as usize + 2;
                        self.state = ParserState::BulkData;
                    }
                }
                ParserState::BulkData => {
                    if buf.len() < self.bulk_remaining {
                        return Ok(completed);
                    }
                    buf.advance(self.bulk_remaining);
                    self.bulk_remaining = 0;
                    self.state = ParserState::OneRspEnd;
                }
                ParserState::OneRspEnd => {
                    completed += 1;
                    self.state = ParserState::ArrayLen;
                }
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

fn parse_int(digits: &[u8]) -> Result<i64> {
    ensure!(!digits.is_empty(), "protocol error: empty bulk length");
    let text = std::str::from_utf8(digits)
        .map_err(|_| anyhow::anyhow!("protocol error: non-ascii bulk length"))?;
    text.parse::<i64>()
        .map_err(|_| anyhow::anyhow!("protocol error: expected integer value, got {text:?}"))
}
