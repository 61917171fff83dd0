//! Slot migration driver: admission, the stage machine, and the codecs that
//! turn one slot's data into restore commands on a destination node.
//!
//! One long-lived thread waits on the job slot. A submitted job wakes it and
//! runs START → SNAPSHOT → WAL → SUCCESS/FAILED → CLEAN: acquire a snapshot
//! and connect, scan the slot's keys at the snapshot, tail the WAL until the
//! gap is small, publish the forbidden slot under the server-wide exclusive
//! barrier, drain the remainder, then hand ownership to the topology. Every
//! exit path runs CLEAN, which releases the snapshot and the socket and
//! resets the job markers.

use std::net::TcpStream;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};

use crate::cluster::SlotTopology;
use crate::extractor::extract_batch_commands;
use crate::metadata::{
    bitmap_bit_offsets, decode_score, decode_sortedint_id, decode_stream_fields, format_score,
    now_ms, parse_bitmap_index, Metadata, StreamEntryId, StreamMetadata, ValueKind,
};
use crate::pipeline::{PipelineSender, RECV_TIMEOUT};
use crate::slot::{slot_prefix, split_metadata_key, split_subkey_key, subkey_prefix, SlotId,
    DEFAULT_NAMESPACE, SLOT_COUNT};
use crate::storage::{ColumnFamily, SeqNo, SnapshotView, StorageEngine, WalIter};
use crate::{AdmitError, Canceled, ExclusivityBarrier};

pub const DEFAULT_MAX_PIPELINE_SIZE: u64 = 16;
pub const DEFAULT_MAX_MIGRATION_SPEED: u64 = 4096;
pub const DEFAULT_SEQ_GAP_LIMIT: u64 = 10000;

/// Element tuples per synthesized multi-item restore command.
pub const MAX_ITEMS_IN_COMMAND: usize = 16;

/// Pre-barrier WAL convergence attempts before the barrier is taken anyway.
const MAX_LOOP_TIMES: u32 = 10;

const NO_SLOT: i32 = -1;

const IMPORT_START: u8 = 0;
const IMPORT_SUCCESS: u8 = 1;
const IMPORT_FAILED: u8 = 2;

const ERR_SEND_COMMANDS: &str = "failed to send commands to restore a key";

/// Observable migration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationState {
    None = 0,
    Started = 1,
    Success = 2,
    Failed = 3,
}

impl MigrationState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Started,
            2 => Self::Success,
            3 => Self::Failed,
            _ => Self::None,
        }
    }
}

/// Internal stage of the migration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationStage {
    None = 0,
    Start = 1,
    Snapshot = 2,
    Wal = 3,
    Success = 4,
    Failed = 5,
    Clean = 6,
}

impl MigrationStage {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Start,
            2 => Self::Snapshot,
            3 => Self::Wal,
            4 => Self::Success,
            5 => Self::Failed,
            6 => Self::Clean,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ThreadState {
    Uninitialized = 0,
    Running = 1,
    Terminated = 2,
}

/// One accepted migration job.
#[derive(Debug, Clone)]
pub struct MigrationJob {
    pub slot: SlotId,
    pub dst_node: String,
    pub dst_ip: String,
    pub dst_port: u16,
    /// Commands per second, 0 for unlimited.
    pub max_speed: u64,
    pub max_pipeline_size: u64,
    pub seq_gap_limit: u64,
}

/// Construction-time options for the migrator.
#[derive(Debug, Clone)]
pub struct MigratorOptions {
    pub namespace: Vec<u8>,
    /// Password expected by the destination, if any.
    pub password: Option<String>,
    pub max_migration_speed: u64,
    pub max_pipeline_size: u64,
    pub seq_gap_limit: u64,
    /// Replicas refuse to drive migrations until promoted.
    pub replica: bool,
}

impl Default for MigratorOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_vec(),
            password: None,
            max_migration_speed: DEFAULT_MAX_MIGRATION_SPEED,
            max_pipeline_size: DEFAULT_MAX_PIPELINE_SIZE,
            seq_gap_limit: DEFAULT_SEQ_GAP_LIMIT,
            replica: false,
        }
    }
}

impl MigratorOptions {
    /// Defaults with `RIFT_MIGRATE_*` environment overrides applied.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_migration_speed: read_env_u64(
                "RIFT_MIGRATE_MAX_SPEED",
                defaults.max_migration_speed,
            ),
            max_pipeline_size: read_env_u64(
                "RIFT_MIGRATE_MAX_PIPELINE_SIZE",
                defaults.max_pipeline_size,
            )
            .max(1),
            seq_gap_limit: read_env_u64("RIFT_MIGRATE_SEQ_GAP_LIMIT", defaults.seq_gap_limit)
                .max(1),
            ..defaults
        }
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Owner of the migration driver thread.
///
/// Shared state lives in [`MigratorCore`], reachable through `Deref`; request
/// workers read the slot markers through it while the driver thread runs the
/// stage machine. Dropping the owner stops any migration in flight and joins
/// the thread.
pub struct SlotMigrator {
    core: Arc<MigratorCore>,
    worker: Option<JoinHandle<()>>,
}

impl SlotMigrator {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        topology: Arc<dyn SlotTopology>,
        barrier: Arc<ExclusivityBarrier>,
        options: MigratorOptions,
    ) -> Result<Self> {
        let core = Arc::new(MigratorCore::build(storage, topology, barrier, options));
        let worker_core = core.clone();
        let worker = std::thread::Builder::new()
            .name("slot-migrate".to_string())
            .spawn(move || {
                let _ = worker_core.thread_state.compare_exchange(
                    ThreadState::Uninitialized as u8,
                    ThreadState::Running as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                worker_core.run_loop();
            })
            .context("failed to spawn the slot migration thread")?;
        Ok(Self {
            core,
            worker: Some(worker),
        })
    }
}

impl Deref for SlotMigrator {
    type Target = MigratorCore;

    fn deref(&self) -> &MigratorCore {
        &self.core
    }
}

impl Drop for SlotMigrator {
    fn drop(&mut self) {
        self.core.stop_migration.store(true, Ordering::SeqCst);
        self.core
            .thread_state
            .store(ThreadState::Terminated as u8, Ordering::SeqCst);
        self.core.job_cv.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("slot migration thread panicked");
            }
        }
    }
}

/// State shared between the driver thread and request workers.
pub struct MigratorCore {
    storage: Arc<dyn StorageEngine>,
    topology: Arc<dyn SlotTopology>,
    barrier: Arc<ExclusivityBarrier>,
    namespace: Vec<u8>,
    password: Option<String>,

    // Configured defaults, applied when a job leaves a parameter unset.
    config_max_speed: AtomicU64,
    config_max_pipeline: AtomicU64,
    config_seq_gap: AtomicU64,

    // Live limits of the job in flight, shared with the pipeline sender so
    // runtime setters apply immediately.
    max_migration_speed: Arc<AtomicU64>,
    max_pipeline_size: Arc<AtomicU64>,
    seq_gap_limit: Arc<AtomicU64>,

    migrating_slot: AtomicI32,
    forbidden_slot: AtomicI32,
    migrate_failed_slot: AtomicI32,
    stop_migration: Arc<AtomicBool>,
    thread_state: AtomicU8,
    migration_state: AtomicU8,
    current_stage: AtomicU8,

    job: Mutex<Option<MigrationJob>>,
    job_cv: Condvar,
    dst_node: Mutex<String>,
}

/// Resources scoped to one migration run. Dropping the context in CLEAN
/// releases the snapshot and closes the socket on every exit path.
struct RunContext {
    job: MigrationJob,
    snapshot: Option<Box<dyn SnapshotView>>,
    sender: Option<PipelineSender<TcpStream>>,
    wal_cursor: SeqNo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyMigrationResult {
    Migrated,
    Expired,
    Empty,
}

impl MigratorCore {
    fn build(
        storage: Arc<dyn StorageEngine>,
        topology: Arc<dyn SlotTopology>,
        barrier: Arc<ExclusivityBarrier>,
        options: MigratorOptions,
    ) -> Self {
        Self {
            storage,
            topology,
            barrier,
            namespace: options.namespace,
            password: options.password,
            config_max_speed: AtomicU64::new(options.max_migration_speed),
            config_max_pipeline: AtomicU64::new(options.max_pipeline_size.max(1)),
            config_seq_gap: AtomicU64::new(options.seq_gap_limit.max(1)),
            max_migration_speed: Arc::new(AtomicU64::new(options.max_migration_speed)),
            max_pipeline_size: Arc::new(AtomicU64::new(options.max_pipeline_size.max(1))),
            seq_gap_limit: Arc::new(AtomicU64::new(options.seq_gap_limit.max(1))),
            migrating_slot: AtomicI32::new(NO_SLOT),
            forbidden_slot: AtomicI32::new(NO_SLOT),
            migrate_failed_slot: AtomicI32::new(NO_SLOT),
            stop_migration: Arc::new(AtomicBool::new(options.replica)),
            thread_state: AtomicU8::new(ThreadState::Uninitialized as u8),
            migration_state: AtomicU8::new(MigrationState::None as u8),
            current_stage: AtomicU8::new(MigrationStage::None as u8),
            job: Mutex::new(None),
            job_cv: Condvar::new(),
            dst_node: Mutex::new(String::new()),
        }
    }

    // ---- admission and observation -------------------------------------

    /// Accepts a migration job. `speed`, `pipeline_size`, and `seq_gap` fall
    /// back to the configured defaults when `<= 0`.
    pub fn perform_slot_migration(
        &self,
        node_id: &str,
        dst_ip: &str,
        dst_port: u16,
        slot: SlotId,
        speed: i64,
        pipeline_size: i64,
        seq_gap: i64,
    ) -> Result<(), AdmitError> {
        if slot >= SLOT_COUNT {
            return Err(AdmitError::InvalidArgument("slot id out of range"));
        }

        // Only one migration job at a time; this CAS is the serialization
        // point for everything that follows.
        if self
            .migrating_slot
            .compare_exchange(NO_SLOT, i32::from(slot), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AdmitError::AlreadyMigrating);
        }

        if self.forbidden_slot.load(Ordering::SeqCst) == i32::from(slot) {
            self.migrating_slot.store(NO_SLOT, Ordering::SeqCst);
            return Err(AdmitError::SlotAlreadyMigrated);
        }

        self.migration_state
            .store(MigrationState::Started as u8, Ordering::SeqCst);

        let job = MigrationJob {
            slot,
            dst_node: node_id.to_string(),
            dst_ip: dst_ip.to_string(),
            dst_port,
            max_speed: resolve(speed, &self.config_max_speed),
            max_pipeline_size: resolve(pipeline_size, &self.config_max_pipeline).max(1),
            seq_gap_limit: resolve(seq_gap, &self.config_seq_gap).max(1),
        };

        *lock(&self.dst_node) = node_id.to_string();
        {
            let mut slot_guard = lock(&self.job);
            *slot_guard = Some(job);
            self.job_cv.notify_one();
        }

        tracing::info!(slot, dst_ip, dst_port, "accepted slot migration job");
        Ok(())
    }

    pub fn is_migration_in_progress(&self) -> bool {
        self.migration_state() == MigrationState::Started
    }

    pub fn migration_state(&self) -> MigrationState {
        MigrationState::from_u8(self.migration_state.load(Ordering::SeqCst))
    }

    pub fn current_stage(&self) -> MigrationStage {
        MigrationStage::from_u8(self.current_stage.load(Ordering::SeqCst))
    }

    pub fn migrating_slot(&self) -> Option<SlotId> {
        to_slot(self.migrating_slot.load(Ordering::SeqCst))
    }

    pub fn forbidden_slot(&self) -> Option<SlotId> {
        to_slot(self.forbidden_slot.load(Ordering::SeqCst))
    }

    /// Admission-side check, taken under the shared side of the barrier so it
    /// serializes against forbidden-slot publication.
    pub fn slot_writable(&self, slot: SlotId) -> bool {
        let _shared = self.barrier.shared();
        self.forbidden_slot.load(Ordering::SeqCst) != i32::from(slot)
    }

    /// Operator command: clears the forbidden-slot marker.
    pub fn release_forbidden_slot(&self) {
        tracing::info!(
            slot = self.forbidden_slot.load(Ordering::SeqCst),
            "releasing forbidden slot"
        );
        self.forbidden_slot.store(NO_SLOT, Ordering::SeqCst);
    }

    /// Cooperative cancellation hook: role demotion, FLUSH handling, and
    /// operator stop all land here.
    pub fn set_stop_migration_flag(&self, value: bool) {
        self.stop_migration.store(value, Ordering::SeqCst);
    }

    pub fn set_max_migration_speed(&self, value: u64) {
        self.config_max_speed.store(value, Ordering::Relaxed);
        self.max_migration_speed.store(value, Ordering::Relaxed);
    }

    pub fn set_max_pipeline_size(&self, value: u64) {
        if value > 0 {
            self.config_max_pipeline.store(value, Ordering::Relaxed);
            self.max_pipeline_size.store(value, Ordering::Relaxed);
        }
    }

    pub fn set_seq_gap_limit(&self, value: u64) {
        if value > 0 {
            self.config_seq_gap.store(value, Ordering::Relaxed);
            self.seq_gap_limit.store(value, Ordering::Relaxed);
        }
    }

    /// Info-section lines: migrating slot, destination node, and state.
    pub fn migration_info(&self) -> String {
        let migrating = self.migrating_slot.load(Ordering::SeqCst);
        let forbidden = self.forbidden_slot.load(Ordering::SeqCst);
        let failed = self.migrate_failed_slot.load(Ordering::SeqCst);
        if migrating < 0 && forbidden < 0 && failed < 0 {
            return String::new();
        }

        let (slot, state) = match self.migration_state() {
            MigrationState::None => (NO_SLOT, "none"),
            MigrationState::Started => (migrating, "start"),
            MigrationState::Success => (forbidden, "success"),
            MigrationState::Failed => (failed, "fail"),
        };
        let dst_node = lock(&self.dst_node).clone();
        format!(
            "migrating_slot: {slot}\r\ndestination_node: {dst_node}\r\nmigrating_state: {state}\r\n"
        )
    }

    // ---- driver thread --------------------------------------------------

    fn is_terminated(&self) -> bool {
        self.thread_state.load(Ordering::SeqCst) == ThreadState::Terminated as u8
    }

    fn set_stage(&self, stage: MigrationStage) {
        self.current_stage.store(stage as u8, Ordering::SeqCst);
    }

    fn run_loop(&self) {
        loop {
            let job = {
                let mut slot_guard = lock(&self.job);
                loop {
                    if self.is_terminated() {
                        return;
                    }
                    if let Some(job) = slot_guard.take() {
                        break job;
                    }
                    slot_guard = self
                        .job_cv
                        .wait(slot_guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            tracing::info!(
                slot = job.slot,
                dst_ip = %job.dst_ip,
                dst_port = job.dst_port,
                max_speed = job.max_speed,
                max_pipeline_size = job.max_pipeline_size,
                seq_gap_limit = job.seq_gap_limit,
                "migrating slot"
            );

            self.max_migration_speed
                .store(job.max_speed, Ordering::Relaxed);
            self.max_pipeline_size
                .store(job.max_pipeline_size, Ordering::Relaxed);
            self.seq_gap_limit
                .store(job.seq_gap_limit, Ordering::Relaxed);

            self.run_migration(job);
        }
    }

    fn run_migration(&self, job: MigrationJob) {
        let slot = job.slot;
        self.set_stage(MigrationStage::Start);
        let mut ctx = RunContext {
            job,
            snapshot: None,
            sender: None,
            wal_cursor: 0,
        };

        loop {
            if self.is_terminated() {
                tracing::warn!(slot, "stopping the state machine, the thread was terminated");
                break;
            }

            match self.current_stage() {
                MigrationStage::Start => match self.start_migration(&mut ctx) {
                    Ok(()) => {
                        tracing::info!(slot, "succeeded to start migrating the slot");
                        self.set_stage(MigrationStage::Snapshot);
                    }
                    Err(err) => {
                        tracing::error!(slot, error = %format!("{err:#}"), "failed to start the migration");
                        self.set_stage(MigrationStage::Failed);
                    }
                },
                MigrationStage::Snapshot => match self.send_snapshot(&mut ctx) {
                    Ok(()) => self.set_stage(MigrationStage::Wal),
                    Err(err) => {
                        tracing::error!(slot, error = %format!("{err:#}"), "failed to send the slot snapshot");
                        self.set_stage(MigrationStage::Failed);
                    }
                },
                MigrationStage::Wal => match self.sync_wal(&mut ctx) {
                    Ok(()) => {
                        tracing::info!(slot, "succeeded to sync from the WAL");
                        self.set_stage(MigrationStage::Success);
                    }
                    Err(err) => {
                        tracing::error!(slot, error = %format!("{err:#}"), "failed to sync from the WAL");
                        self.set_stage(MigrationStage::Failed);
                    }
                },
                MigrationStage::Success => match self.finish_successful_migration(&mut ctx) {
                    Ok(()) => {
                        tracing::info!(slot, "succeeded to migrate the slot");
                        self.migration_state
                            .store(MigrationState::Success as u8, Ordering::SeqCst);
                        self.set_stage(MigrationStage::Clean);
                    }
                    Err(err) => {
                        tracing::error!(slot, error = %format!("{err:#}"), "failed to finish a successful migration");
                        self.set_stage(MigrationStage::Failed);
                    }
                },
                MigrationStage::Failed => {
                    self.finish_failed_migration(&mut ctx);
                    tracing::info!(slot, "migration of the slot failed");
                    self.migration_state
                        .store(MigrationState::Failed as u8, Ordering::SeqCst);
                    self.set_stage(MigrationStage::Clean);
                }
                MigrationStage::Clean | MigrationStage::None => break,
            }
        }

        self.clean(ctx);
    }

    fn clean(&self, ctx: RunContext) {
        tracing::info!(slot = ctx.job.slot, "cleaning resources of the migration");
        // Snapshot release and socket close.
        drop(ctx);

        self.set_stage(MigrationStage::None);
        *lock(&self.job) = None;
        self.migrating_slot.store(NO_SLOT, Ordering::SeqCst);
        self.stop_migration.store(false, Ordering::SeqCst);
    }

    // ---- stages ---------------------------------------------------------

    fn start_migration(&self, ctx: &mut RunContext) -> Result<()> {
        let snapshot = self
            .storage
            .acquire_snapshot()
            .context("failed to create snapshot")?;
        ctx.wal_cursor = snapshot.sequence();
        ctx.snapshot = Some(snapshot);

        let addr = format!("{}:{}", ctx.job.dst_ip, ctx.job.dst_port);
        let stream = TcpStream::connect(&addr)
            .with_context(|| format!("failed to connect to the destination node {addr}"))?;
        stream
            .set_read_timeout(Some(RECV_TIMEOUT))
            .context("failed to set the receive timeout")?;

        let mut sender = PipelineSender::new(
            stream,
            self.max_pipeline_size.clone(),
            self.max_migration_speed.clone(),
            self.stop_migration.clone(),
        );

        if let Some(password) = &self.password {
            sender
                .send_command_now(&[b"AUTH".to_vec(), password.clone().into_bytes()])
                .context("failed to authenticate on the destination node")?;
        }

        self.set_import_status(&mut sender, ctx.job.slot, IMPORT_START)?;
        ctx.sender = Some(sender);

        tracing::info!(
            slot = ctx.job.slot,
            snapshot_seq = ctx.wal_cursor,
            "connected to the destination, import started"
        );
        Ok(())
    }

    fn send_snapshot(&self, ctx: &mut RunContext) -> Result<()> {
        let slot = ctx.job.slot;
        tracing::info!(slot, "start migrating the slot snapshot");

        let snapshot = ctx.snapshot.as_deref().context("snapshot is not acquired")?;
        let sender = ctx.sender.as_mut().context("destination is not connected")?;

        let mut migrated = 0u64;
        let mut expired = 0u64;
        let mut empty = 0u64;

        let prefix = slot_prefix(&self.namespace, slot);
        for (key, value) in snapshot.scan_prefix(ColumnFamily::Metadata, &prefix) {
            // Role changes and FLUSH commands cancel between keys.
            if self.stop_migration.load(Ordering::SeqCst) {
                return Err(Canceled.into());
            }

            let (_, _, user_key) = split_metadata_key(&key)?;
            let result = self
                .migrate_one_key(snapshot, sender, slot, user_key, &value)
                .with_context(|| {
                    format!("failed to migrate key {}", String::from_utf8_lossy(user_key))
                })?;
            match result {
                KeyMigrationResult::Migrated => migrated += 1,
                KeyMigrationResult::Expired => expired += 1,
                KeyMigrationResult::Empty => empty += 1,
            }
        }

        // The final pipeline may be below the threshold; force it out.
        sender.flush_if_needed(true).context(ERR_SEND_COMMANDS)?;

        tracing::info!(slot, migrated, expired, empty, "migrated the slot snapshot");
        Ok(())
    }

    fn sync_wal(&self, ctx: &mut RunContext) -> Result<()> {
        self.sync_wal_before_forbidding_slot(ctx)
            .context("failed to sync WAL before forbidding the slot")?;

        self.set_forbidden_slot(ctx.job.slot);

        self.sync_wal_after_forbidding_slot(ctx)
            .context("failed to sync WAL after forbidding the slot")?;
        Ok(())
    }

    fn finish_successful_migration(&self, ctx: &mut RunContext) -> Result<()> {
        if self.stop_migration.load(Ordering::SeqCst) {
            return Err(Canceled.into());
        }

        let slot = ctx.job.slot;
        let sender = ctx.sender.as_mut().context("destination is not connected")?;
        self.set_import_status(sender, slot, IMPORT_SUCCESS)?;

        let dst = format!("{}:{}", ctx.job.dst_ip, ctx.job.dst_port);
        self.topology
            .commit_slot_migrated(slot, &dst)
            .with_context(|| format!("failed to set slot {slot} as migrated to {dst}"))?;

        self.migrate_failed_slot.store(NO_SLOT, Ordering::SeqCst);
        Ok(())
    }

    fn finish_failed_migration(&self, ctx: &mut RunContext) {
        self.migrate_failed_slot
            .store(self.migrating_slot.load(Ordering::SeqCst), Ordering::SeqCst);
        // Writes to the slot resume on this node.
        self.forbidden_slot.store(NO_SLOT, Ordering::SeqCst);

        if let Some(sender) = ctx.sender.as_mut() {
            if let Err(err) = self.set_import_status(sender, ctx.job.slot, IMPORT_FAILED) {
                tracing::warn!(
                    slot = ctx.job.slot,
                    error = %format!("{err:#}"),
                    "failed to notify the destination about the failed migration"
                );
            }
        }
    }

    // ---- destination handshake ------------------------------------------

    fn set_import_status(
        &self,
        sender: &mut PipelineSender<TcpStream>,
        slot: SlotId,
        status: u8,
    ) -> Result<()> {
        sender
            .send_command_now(&[
                b"CLUSTER".to_vec(),
                b"IMPORT".to_vec(),
                slot.to_string().into_bytes(),
                status.to_string().into_bytes(),
            ])
            .context("failed to set import status on the destination node")
    }

    // ---- per-key codecs --------------------------------------------------

    fn migrate_one_key(
        &self,
        snapshot: &dyn SnapshotView,
        sender: &mut PipelineSender<TcpStream>,
        slot: SlotId,
        user_key: &[u8],
        blob: &[u8],
    ) -> Result<KeyMigrationResult> {
        let meta = Metadata::decode(blob)?;

        if meta.kind != ValueKind::String && meta.kind != ValueKind::Stream && meta.size == 0 {
            return Ok(KeyMigrationResult::Empty);
        }
        if meta.is_expired(now_ms()) {
            return Ok(KeyMigrationResult::Expired);
        }

        match meta.kind {
            ValueKind::String => self.migrate_simple_key(sender, user_key, &meta, blob)?,
            ValueKind::Stream => {
                let smeta = StreamMetadata::decode(blob)?;
                self.migrate_stream(snapshot, sender, slot, user_key, &smeta)?;
            }
            _ => self.migrate_complex_key(snapshot, sender, slot, user_key, &meta)?,
        }

        Ok(KeyMigrationResult::Migrated)
    }

    fn migrate_simple_key(
        &self,
        sender: &mut PipelineSender<TcpStream>,
        user_key: &[u8],
        meta: &Metadata,
        blob: &[u8],
    ) -> Result<()> {
        let mut cmd = vec![
            b"SET".to_vec(),
            user_key.to_vec(),
            Metadata::string_value(blob)?.to_vec(),
        ];
        if meta.expire_ms > 0 {
            cmd.push(b"PXAT".to_vec());
            cmd.push(meta.expire_ms.to_string().into_bytes());
        }
        sender.push_command(&cmd);
        sender.flush_if_needed(false).context(ERR_SEND_COMMANDS)
    }

    fn migrate_complex_key(
        &self,
        snapshot: &dyn SnapshotView,
        sender: &mut PipelineSender<TcpStream>,
        slot: SlotId,
        user_key: &[u8],
        meta: &Metadata,
    ) -> Result<()> {
        let verb = meta.kind.restore_verb().as_bytes().to_vec();
        let mut args: Vec<Vec<u8>> = vec![verb, user_key.to_vec()];
        let mut item_count = 0usize;

        let prefix = subkey_prefix(&self.namespace, slot, user_key, meta.version);
        for (key, value) in snapshot.scan_prefix(ColumnFamily::Subkey, &prefix) {
            if self.stop_migration.load(Ordering::SeqCst) {
                return Err(Canceled.into());
            }

            let sub = split_subkey_key(&key)?;
            match meta.kind {
                ValueKind::Set => args.push(sub.subkey.to_vec()),
                ValueKind::SortedInt => {
                    let id = decode_sortedint_id(sub.subkey)?;
                    args.push(id.to_string().into_bytes());
                }
                ValueKind::ZSet => {
                    let score = decode_score(&value)?;
                    args.push(format_score(score).into_bytes());
                    args.push(sub.subkey.to_vec());
                }
                ValueKind::Hash => {
                    args.push(sub.subkey.to_vec());
                    args.push(value);
                }
                ValueKind::List => args.push(value),
                ValueKind::Bitmap => {
                    self.migrate_bitmap_fragment(sender, user_key, sub.subkey, &value)?;
                }
                other => bail!("unexpected subkey record for {other} value"),
            }

            // Bitmaps emit one command per set bit and skip item batching.
            if meta.kind != ValueKind::Bitmap {
                item_count += 1;
                if item_count >= MAX_ITEMS_IN_COMMAND {
                    sender.push_command(&args);
                    item_count = 0;
                    args.truncate(2);
                    sender.flush_if_needed(false).context(ERR_SEND_COMMANDS)?;
                }
            }
        }

        if item_count > 0 {
            sender.push_command(&args);
        }

        if meta.expire_ms > 0 {
            sender.push_command(&[
                b"PEXPIREAT".to_vec(),
                user_key.to_vec(),
                meta.expire_ms.to_string().into_bytes(),
            ]);
        }

        sender.flush_if_needed(false).context(ERR_SEND_COMMANDS)
    }

    fn migrate_bitmap_fragment(
        &self,
        sender: &mut PipelineSender<TcpStream>,
        user_key: &[u8],
        subkey: &[u8],
        fragment: &[u8],
    ) -> Result<()> {
        let index = parse_bitmap_index(subkey)?;
        for offset in bitmap_bit_offsets(index, fragment) {
            sender.push_command(&[
                b"SETBIT".to_vec(),
                user_key.to_vec(),
                offset.to_string().into_bytes(),
                b"1".to_vec(),
            ]);
        }
        sender.flush_if_needed(false).context(ERR_SEND_COMMANDS)
    }

    fn migrate_stream(
        &self,
        snapshot: &dyn SnapshotView,
        sender: &mut PipelineSender<TcpStream>,
        slot: SlotId,
        user_key: &[u8],
        smeta: &StreamMetadata,
    ) -> Result<()> {
        let prefix = subkey_prefix(&self.namespace, slot, user_key, smeta.base.version);
        for (key, value) in snapshot.scan_prefix(ColumnFamily::Stream, &prefix) {
            if self.stop_migration.load(Ordering::SeqCst) {
                return Err(Canceled.into());
            }

            let sub = split_subkey_key(&key)?;
            let id = StreamEntryId::from_bytes(sub.subkey)?;
            let mut cmd = vec![
                b"XADD".to_vec(),
                user_key.to_vec(),
                id.to_string().into_bytes(),
            ];
            for (field, field_value) in decode_stream_fields(&value)? {
                cmd.push(field);
                cmd.push(field_value);
            }
            sender.push_command(&cmd);
            sender.flush_if_needed(false).context(ERR_SEND_COMMANDS)?;
        }

        // XADD alone rebuilds the entries but not the id counters; XSETID
        // aligns the destination's stream metadata with the source.
        sender.push_command(&[
            b"XSETID".to_vec(),
            user_key.to_vec(),
            smeta.last_generated_id.to_string().into_bytes(),
            b"ENTRIESADDED".to_vec(),
            smeta.entries_added.to_string().into_bytes(),
            b"MAXDELETEDID".to_vec(),
            smeta.max_deleted_entry_id.to_string().into_bytes(),
        ]);

        if smeta.base.expire_ms > 0 {
            sender.push_command(&[
                b"PEXPIREAT".to_vec(),
                user_key.to_vec(),
                smeta.base.expire_ms.to_string().into_bytes(),
            ]);
        }

        sender.flush_if_needed(false).context(ERR_SEND_COMMANDS)
    }

    // ---- WAL tail --------------------------------------------------------

    fn sync_wal_before_forbidding_slot(&self, ctx: &mut RunContext) -> Result<()> {
        let slot = ctx.job.slot;
        let mut epoch = 0u32;

        while epoch < MAX_LOOP_TIMES {
            let head = self.storage.latest_sequence();
            let gap = head.saturating_sub(ctx.wal_cursor);
            let limit = self.seq_gap_limit.load(Ordering::Relaxed);
            if gap <= limit {
                tracing::info!(slot, gap, limit, "incremental data is below the gap limit");
                break;
            }

            let iter = self
                .storage
                .wal_iterator(ctx.wal_cursor + 1)
                .context("failed to create a WAL iterator")?;
            let sender = ctx.sender.as_mut().context("destination is not connected")?;
            let mut cursor = ctx.wal_cursor;
            self.migrate_increment_data(slot, sender, &mut cursor, iter, head)?;
            ctx.wal_cursor = head.max(cursor);
            epoch += 1;
        }

        tracing::info!(slot, epochs = epoch, "migrated incremental data before forbidding the slot");
        Ok(())
    }

    fn sync_wal_after_forbidding_slot(&self, ctx: &mut RunContext) -> Result<()> {
        let slot = ctx.job.slot;
        // Unrelated writes may still advance the head; slot writes cannot.
        let head = self.storage.latest_sequence();
        if head <= ctx.wal_cursor {
            return Ok(());
        }

        let iter = self
            .storage
            .wal_iterator(ctx.wal_cursor + 1)
            .context("failed to create a WAL iterator")?;
        let sender = ctx.sender.as_mut().context("destination is not connected")?;
        let mut cursor = ctx.wal_cursor;
        self.migrate_increment_data(slot, sender, &mut cursor, iter, head)?;
        ctx.wal_cursor = head.max(cursor);
        Ok(())
    }

    fn migrate_increment_data(
        &self,
        slot: SlotId,
        sender: &mut PipelineSender<TcpStream>,
        cursor: &mut SeqNo,
        mut iter: WalIter<'_>,
        end_seq: SeqNo,
    ) -> Result<()> {
        let begin_seq = *cursor;
        let mut next_seq = *cursor + 1;

        loop {
            if self.stop_migration.load(Ordering::SeqCst) {
                return Err(Canceled.into());
            }

            let Some(batch) = iter.next() else {
                bail!("WAL iterator is exhausted, expected end seq {end_seq}, next seq {next_seq}");
            };
            let batch = batch.context("failed to read a WAL batch")?;
            ensure!(
                batch.first_seq == next_seq,
                "WAL sequence gap, expected sequence {next_seq} but got {}",
                batch.first_seq
            );

            let commands = extract_batch_commands(&self.namespace, slot, &batch)
                .context("failed to generate commands from a write batch")?;
            for command in &commands {
                sender.push_command(command);
            }
            sender.flush_if_needed(false).context(ERR_SEND_COMMANDS)?;

            next_seq = batch.first_seq + batch.count();
            if next_seq > end_seq {
                tracing::debug!(slot, from = begin_seq, to = end_seq, "migrated one WAL epoch");
                break;
            }
        }

        sender.flush_if_needed(true).context(ERR_SEND_COMMANDS)?;
        *cursor = next_seq - 1;
        Ok(())
    }

    // ---- forbid barrier --------------------------------------------------

    fn set_forbidden_slot(&self, slot: SlotId) {
        tracing::info!(slot, "setting the forbidden slot");
        let start = Instant::now();
        {
            // Exclusive barrier: no command is mid-admission while the marker
            // is published, so every accepted slot write is already in the
            // WAL when the head is read next.
            let _exclusive = self.barrier.exclusive();
            self.forbidden_slot
                .store(i32::from(slot), Ordering::SeqCst);
        }
        tracing::info!(
            slot,
            blocked_us = start.elapsed().as_micros() as u64,
            "forbidden slot is set"
        );
    }
}

fn resolve(requested: i64, config: &AtomicU64) -> u64 {
    if requested <= 0 {
        config.load(Ordering::Relaxed)
    } else {
        requested as u64
    }
}

fn to_slot(v: i32) -> Option<SlotId> {
    u16::try_from(v).ok()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
