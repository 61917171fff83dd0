//! Pipelined restore-command sender with backpressure and a speed ceiling.
//!
//! Commands accumulate in one buffer; `flush_if_needed` sends the buffer when
//! the pipeline is full or a flush is forced, then reads and verifies exactly
//! one reply per queued command before accepting more. The throughput ceiling
//! is applied per flush: with pipeline size `P` and a speed of `B` commands
//! per second, flushes are spaced `max(1µs, 1_000_000·P/B)` apart.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use bytes::BytesMut;

use crate::resp::{encode_multi_bulk, ResponseVerifier};
use crate::Canceled;

/// Receive timeout on the destination socket.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

const RECV_CHUNK: usize = 4096;

/// Buffers restore commands and flushes them down `stream`.
///
/// Generic over the transport so unit tests can drive it without sockets; the
/// driver instantiates it over a `TcpStream` with [`RECV_TIMEOUT`] set. The
/// pipeline and speed limits are read through shared atomics so runtime
/// setters apply to the job in flight.
pub struct PipelineSender<S> {
    stream: S,
    buf: BytesMut,
    recv_buf: BytesMut,
    pending: usize,
    max_pipeline_size: Arc<AtomicU64>,
    max_migration_speed: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    last_send_at: Option<Instant>,
}

impl<S: Read + Write> PipelineSender<S> {
    pub fn new(
        stream: S,
        max_pipeline_size: Arc<AtomicU64>,
        max_migration_speed: Arc<AtomicU64>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            recv_buf: BytesMut::new(),
            pending: 0,
            max_pipeline_size,
            max_migration_speed,
            stop,
            last_send_at: None,
        }
    }

    /// Number of commands queued for the next flush.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Queues one command; does not touch the socket.
    pub fn push_command<A: AsRef<[u8]>>(&mut self, args: &[A]) {
        encode_multi_bulk(&mut self.buf, args);
        self.pending += 1;
    }

    /// Sends the queued commands when the pipeline is full, or always when
    /// `force` is set, then verifies one reply per command.
    pub fn flush_if_needed(&mut self, force: bool) -> Result<()> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(Canceled.into());
        }

        let max_pipeline = self.max_pipeline_size.load(Ordering::Relaxed).max(1) as usize;
        if !force && self.pending < max_pipeline {
            return Ok(());
        }
        if self.pending == 0 {
            return Ok(());
        }

        self.apply_speed_limit(max_pipeline);

        self.stream
            .write_all(&self.buf)
            .context("failed to write restore commands to the destination")?;
        self.stream.flush().context("failed to flush the socket")?;
        self.last_send_at = Some(Instant::now());

        let total = self.pending;
        self.verify_responses(total)
            .context("wrong response from the destination node")?;

        self.buf.clear();
        self.pending = 0;
        Ok(())
    }

    /// Sends one command outside the pipeline and verifies its single reply.
    /// Used for the handshake round-trips; commands still queued from an
    /// aborted pipeline are abandoned.
    pub fn send_command_now<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<()> {
        self.buf.clear();
        self.pending = 0;
        let mut frame = BytesMut::new();
        encode_multi_bulk(&mut frame, args);
        self.stream
            .write_all(&frame)
            .context("failed to send command to the destination node")?;
        self.stream.flush().context("failed to flush the socket")?;
        self.verify_responses(1)
            .context("failed to check the response from the destination node")
    }

    fn apply_speed_limit(&mut self, max_pipeline: usize) {
        let speed = self.max_migration_speed.load(Ordering::Relaxed);
        if speed == 0 {
            return;
        }
        let interval_us = (1_000_000u64)
            .saturating_mul(max_pipeline as u64)
            .checked_div(speed)
            .unwrap_or(0)
            .max(1);
        let interval = Duration::from_micros(interval_us);
        if let Some(last) = self.last_send_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                let pause = interval - elapsed;
                tracing::debug!(pause_us = pause.as_micros() as u64, "speed limit sleep");
                std::thread::sleep(pause);
            }
        }
    }

    fn verify_responses(&mut self, total: usize) -> Result<()> {
        let mut verifier = ResponseVerifier::new();
        let mut done = 0usize;
        let mut chunk = [0u8; RECV_CHUNK];
        self.recv_buf.clear();
        while done < total {
            let n = self
                .stream
                .read(&mut chunk)
                .context("failed to read response")?;
            ensure!(n > 0, "destination closed the connection");
            self.recv_buf.extend_from_slice(&chunk[..n]);
            done += verifier.consume(&mut self.recv_buf)?;
        }
        Ok(())
    }
}
