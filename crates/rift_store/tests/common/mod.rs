//! Shared helpers for the slot migration integration tests: a mock
//! destination node speaking RESP on a real socket, a model store it applies
//! restore commands to, and helpers that populate the source engine through
//! its WAL write path.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};

use rift_store::cluster::SlotTopology;
use rift_store::metadata::{
    encode_score, encode_sortedint_id, encode_stream_fields, Metadata, StreamEntryId,
    StreamMetadata, ValueKind,
};
use rift_store::slot::{key_slot, metadata_key, subkey_key, SlotId, DEFAULT_NAMESPACE};
use rift_store::storage::{ColumnFamily, MemoryEngine, StorageEngine, WalRecord};
use rift_store::{ExclusivityBarrier, MigrationState, MigratorOptions, SlotMigrator};

/// Version stamped on every key the helpers create.
pub const VERSION: u64 = 1;

/// Startup and completion budget for one migration in tests.
pub const MIGRATION_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---- migrator plumbing ---------------------------------------------------

/// Topology that records committed handovers.
#[derive(Default)]
pub struct RecordingTopology {
    pub committed: Mutex<Vec<(SlotId, String)>>,
}

impl SlotTopology for RecordingTopology {
    fn commit_slot_migrated(&self, slot: SlotId, dst: &str) -> Result<()> {
        lock(&self.committed).push((slot, dst.to_string()));
        Ok(())
    }
}

pub fn new_migrator(
    engine: Arc<MemoryEngine>,
    topology: Arc<RecordingTopology>,
    options: MigratorOptions,
) -> SlotMigrator {
    SlotMigrator::new(
        engine as Arc<dyn StorageEngine>,
        topology,
        Arc::new(ExclusivityBarrier::new()),
        options,
    )
    .expect("failed to build migrator")
}

/// Polls until the migration reaches `state` and the driver finished CLEAN.
pub fn wait_for_state(migrator: &SlotMigrator, state: MigrationState) -> bool {
    let deadline = Instant::now() + MIGRATION_TIMEOUT;
    while Instant::now() < deadline {
        if migrator.migration_state() == state && migrator.migrating_slot().is_none() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Finds a key of the form `{prefix}{i}` that hashes into `slot`.
pub fn key_for_slot(prefix: &str, slot: SlotId) -> String {
    for i in 0..1_000_000u64 {
        let key = format!("{prefix}{i}");
        if key_slot(key.as_bytes()) == slot {
            return key;
        }
    }
    panic!("no key with prefix {prefix} found for slot {slot}");
}

// ---- source engine population --------------------------------------------

fn meta_put(key: &str, meta: &Metadata) -> WalRecord {
    WalRecord::Put {
        cf: ColumnFamily::Metadata,
        key: metadata_key(DEFAULT_NAMESPACE, key_slot(key.as_bytes()), key.as_bytes()),
        value: meta.encode(),
    }
}

fn sub_put(key: &str, subkey: &[u8], value: &[u8]) -> WalRecord {
    WalRecord::Put {
        cf: ColumnFamily::Subkey,
        key: subkey_key(
            DEFAULT_NAMESPACE,
            key_slot(key.as_bytes()),
            key.as_bytes(),
            VERSION,
            subkey,
        ),
        value: value.to_vec(),
    }
}

pub fn put_string(engine: &MemoryEngine, key: &str, value: &[u8], expire_ms: u64) {
    engine.write_batch(vec![WalRecord::Put {
        cf: ColumnFamily::Metadata,
        key: metadata_key(DEFAULT_NAMESPACE, key_slot(key.as_bytes()), key.as_bytes()),
        value: Metadata::encode_string(expire_ms, value),
    }]);
}

pub fn put_hash(engine: &MemoryEngine, key: &str, fields: &[(String, String)], expire_ms: u64) {
    let mut records: Vec<WalRecord> = fields
        .iter()
        .map(|(f, v)| sub_put(key, f.as_bytes(), v.as_bytes()))
        .collect();
    records.push(meta_put(
        key,
        &Metadata {
            kind: ValueKind::Hash,
            expire_ms,
            version: VERSION,
            size: fields.len() as u64,
        },
    ));
    engine.write_batch(records);
}

pub fn put_set(engine: &MemoryEngine, key: &str, members: &[&str]) {
    let mut records: Vec<WalRecord> = members
        .iter()
        .map(|m| sub_put(key, m.as_bytes(), b""))
        .collect();
    records.push(meta_put(
        key,
        &Metadata {
            kind: ValueKind::Set,
            expire_ms: 0,
            version: VERSION,
            size: members.len() as u64,
        },
    ));
    engine.write_batch(records);
}

pub fn put_zset(engine: &MemoryEngine, key: &str, members: &[(&str, f64)]) {
    let mut records: Vec<WalRecord> = members
        .iter()
        .map(|(m, score)| sub_put(key, m.as_bytes(), &encode_score(*score)))
        .collect();
    records.push(meta_put(
        key,
        &Metadata {
            kind: ValueKind::ZSet,
            expire_ms: 0,
            version: VERSION,
            size: members.len() as u64,
        },
    ));
    engine.write_batch(records);
}

pub fn put_sortedint(engine: &MemoryEngine, key: &str, ids: &[u64]) {
    let mut records: Vec<WalRecord> = ids
        .iter()
        .map(|id| sub_put(key, &encode_sortedint_id(*id), b""))
        .collect();
    records.push(meta_put(
        key,
        &Metadata {
            kind: ValueKind::SortedInt,
            expire_ms: 0,
            version: VERSION,
            size: ids.len() as u64,
        },
    ));
    engine.write_batch(records);
}

pub fn put_list(engine: &MemoryEngine, key: &str, values: &[&str]) {
    let mut records: Vec<WalRecord> = values
        .iter()
        .enumerate()
        .map(|(i, v)| sub_put(key, &(i as u64).to_be_bytes(), v.as_bytes()))
        .collect();
    records.push(meta_put(
        key,
        &Metadata {
            kind: ValueKind::List,
            expire_ms: 0,
            version: VERSION,
            size: values.len() as u64,
        },
    ));
    engine.write_batch(records);
}

pub fn put_bitmap(engine: &MemoryEngine, key: &str, offsets: &[u64]) {
    const FRAGMENT: u64 = 1024;
    let mut fragments: HashMap<u64, Vec<u8>> = HashMap::new();
    for offset in offsets {
        let byte = offset / 8;
        let start = byte / FRAGMENT * FRAGMENT;
        let fragment = fragments.entry(start).or_default();
        let rel = (byte - start) as usize;
        if fragment.len() <= rel {
            fragment.resize(rel + 1, 0);
        }
        fragment[rel] |= 1 << (offset % 8);
    }

    let mut records: Vec<WalRecord> = fragments
        .into_iter()
        .map(|(start, fragment)| sub_put(key, start.to_string().as_bytes(), &fragment))
        .collect();
    records.push(meta_put(
        key,
        &Metadata {
            kind: ValueKind::Bitmap,
            expire_ms: 0,
            version: VERSION,
            size: offsets.len() as u64,
        },
    ));
    engine.write_batch(records);
}

pub fn put_stream(
    engine: &MemoryEngine,
    key: &str,
    entries: &[(StreamEntryId, Vec<(String, String)>)],
    last_id: StreamEntryId,
    max_deleted_id: StreamEntryId,
    entries_added: u64,
) {
    let mut records: Vec<WalRecord> = entries
        .iter()
        .map(|(id, fields)| {
            let fields: Vec<(Vec<u8>, Vec<u8>)> = fields
                .iter()
                .map(|(f, v)| (f.clone().into_bytes(), v.clone().into_bytes()))
                .collect();
            WalRecord::Put {
                cf: ColumnFamily::Stream,
                key: subkey_key(
                    DEFAULT_NAMESPACE,
                    key_slot(key.as_bytes()),
                    key.as_bytes(),
                    VERSION,
                    &id.to_bytes(),
                ),
                value: encode_stream_fields(&fields),
            }
        })
        .collect();
    records.push(WalRecord::Put {
        cf: ColumnFamily::Metadata,
        key: metadata_key(DEFAULT_NAMESPACE, key_slot(key.as_bytes()), key.as_bytes()),
        value: StreamMetadata {
            base: Metadata {
                kind: ValueKind::Stream,
                expire_ms: 0,
                version: VERSION,
                size: entries.len() as u64,
            },
            last_generated_id: last_id,
            max_deleted_entry_id: max_deleted_id,
            entries_added,
        }
        .encode(),
    });
    engine.write_batch(records);
}

/// Complex-kind metadata with `size == 0`, which the snapshot scan skips.
pub fn put_empty_hash(engine: &MemoryEngine, key: &str) {
    engine.write_batch(vec![meta_put(
        key,
        &Metadata {
            kind: ValueKind::Hash,
            expire_ms: 0,
            version: VERSION,
            size: 0,
        },
    )]);
}

/// Metadata delete, the shape a concurrent expiry leaves in the WAL.
pub fn del_key(engine: &MemoryEngine, key: &str) {
    engine.write_batch(vec![WalRecord::Delete {
        cf: ColumnFamily::Metadata,
        key: metadata_key(DEFAULT_NAMESPACE, key_slot(key.as_bytes()), key.as_bytes()),
    }]);
}

// ---- mock destination node -----------------------------------------------

#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    cv: Condvar,
}

#[derive(Default)]
struct GateState {
    held: bool,
    released: bool,
}

impl Gate {
    fn hold(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.held = true;
        self.cv.notify_all();
        while !state.released {
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wait_until_held(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !state.held {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (next, result) = self
                .cv
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
            if result.timed_out() && !state.held {
                return false;
            }
        }
        true
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.released = true;
        self.cv.notify_all();
    }
}

struct MockShared {
    store: Mutex<DestStore>,
    commands: Mutex<Vec<Vec<String>>>,
    gate: Gate,
    hold_at: Option<usize>,
}

/// Destination node double: accepts one connection, applies every restore
/// command to a model store, and replies per verb. With `hold_at`, replying
/// to that command index is delayed until the test calls `release`.
pub struct MockDestination {
    addr: SocketAddr,
    shared: Arc<MockShared>,
    serve: Option<JoinHandle<()>>,
}

impl MockDestination {
    pub fn spawn(hold_at: Option<usize>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock destination");
        let addr = listener.local_addr().expect("local addr");
        let shared = Arc::new(MockShared {
            store: Mutex::new(DestStore::default()),
            commands: Mutex::new(Vec::new()),
            gate: Gate::default(),
            hold_at,
        });

        let serve_shared = shared.clone();
        let serve = std::thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            if let Err(err) = serve_connection(stream, &serve_shared) {
                eprintln!("mock destination stopped: {err:#}");
            }
        });

        Self {
            addr,
            shared,
            serve: Some(serve),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn wait_until_held(&self) -> bool {
        self.shared.gate.wait_until_held(MIGRATION_TIMEOUT)
    }

    pub fn release(&self) {
        self.shared.gate.release();
    }

    /// Every command received so far, lossily decoded for assertions.
    pub fn commands(&self) -> Vec<Vec<String>> {
        lock(&self.shared.commands).clone()
    }

    pub fn command_count(&self, verb: &str) -> usize {
        self.commands()
            .iter()
            .filter(|cmd| cmd.first().map(String::as_str) == Some(verb))
            .count()
    }

    /// `(slot, status)` pairs of every `CLUSTER IMPORT` received.
    pub fn imports(&self) -> Vec<(u16, u8)> {
        self.with_store(|store| store.imports.clone())
    }

    pub fn with_store<T>(&self, f: impl FnOnce(&DestStore) -> T) -> T {
        let store = lock(&self.shared.store);
        f(&store)
    }
}

impl Drop for MockDestination {
    fn drop(&mut self) {
        self.shared.gate.release();
        if let Some(serve) = self.serve.take() {
            let _ = serve.join();
        }
    }
}

fn serve_connection(stream: TcpStream, shared: &MockShared) -> Result<()> {
    // Bail out rather than block forever if a failing test leaks the socket.
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .context("set mock read timeout")?;
    let mut writer = stream.try_clone().context("clone mock stream")?;
    let mut reader = FrameReader::new(stream);
    let mut index = 0usize;

    while let Some(command) = reader.next_command()? {
        lock(&shared.commands).push(
            command
                .iter()
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect(),
        );
        if shared.hold_at == Some(index) {
            shared.gate.hold();
        }

        let reply = lock(&shared.store).apply(&command);
        writer.write_all(&reply).context("write mock reply")?;
        index += 1;
    }
    Ok(())
}

struct FrameReader {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl FrameReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; 512];
        let n = self.stream.read(&mut chunk).context("read mock socket")?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(i) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf[..i].to_vec();
                self.buf.drain(..i + 2);
                return Ok(Some(line));
            }
            if self.fill()? == 0 {
                ensure!(self.buf.is_empty(), "connection closed mid-frame");
                return Ok(None);
            }
        }
    }

    fn exact(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.buf.len() < n {
            ensure!(self.fill()? > 0, "connection closed mid-bulk");
        }
        let out = self.buf[..n].to_vec();
        self.buf.drain(..n);
        Ok(out)
    }

    /// Reads one multi-bulk command; `None` on a clean EOF between frames.
    fn next_command(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(header) = self.line()? else {
            return Ok(None);
        };
        ensure!(header.first() == Some(&b'*'), "expected multi-bulk header");
        let count: usize = std::str::from_utf8(&header[1..])?.parse()?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            let bulk = self
                .line()?
                .context("connection closed inside a command")?;
            ensure!(bulk.first() == Some(&b'$'), "expected bulk header");
            let len: usize = std::str::from_utf8(&bulk[1..])?.parse()?;
            let mut data = self.exact(len + 2)?;
            data.truncate(len);
            args.push(data);
        }
        Ok(Some(args))
    }
}

// ---- destination model store ---------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct DestStream {
    pub entries: Vec<(String, Vec<(String, String)>)>,
    pub last_id: String,
    pub max_deleted_id: String,
    pub entries_added: u64,
}

/// Model of the keyspace the destination rebuilds from restore commands.
#[derive(Debug, Default)]
pub struct DestStore {
    pub strings: HashMap<String, Vec<u8>>,
    pub hashes: HashMap<String, HashMap<String, String>>,
    pub sets: HashMap<String, BTreeSet<String>>,
    pub zsets: HashMap<String, HashMap<String, f64>>,
    pub sortedints: HashMap<String, BTreeSet<u64>>,
    pub lists: HashMap<String, Vec<String>>,
    pub bitmaps: HashMap<String, Vec<u8>>,
    pub streams: HashMap<String, DestStream>,
    pub expires: HashMap<String, u64>,
    pub imports: Vec<(u16, u8)>,
    pub auths: Vec<String>,
}

impl DestStore {
    pub fn getbit(&self, key: &str, offset: u64) -> bool {
        let Some(bits) = self.bitmaps.get(key) else {
            return false;
        };
        let byte = (offset / 8) as usize;
        byte < bits.len() && bits[byte] & (1 << (offset % 8)) != 0
    }

    pub fn bitcount(&self, key: &str) -> u32 {
        self.bitmaps
            .get(key)
            .map(|bits| bits.iter().map(|b| b.count_ones()).sum())
            .unwrap_or(0)
    }

    fn apply(&mut self, command: &[Vec<u8>]) -> Vec<u8> {
        match self.dispatch(command) {
            Ok(reply) => reply,
            Err(err) => format!("-ERR {err}\r\n").into_bytes(),
        }
    }

    fn dispatch(&mut self, command: &[Vec<u8>]) -> Result<Vec<u8>> {
        ensure!(!command.is_empty(), "empty command");
        let verb = String::from_utf8_lossy(&command[0]).to_ascii_uppercase();
        let arg = |i: usize| -> Result<String> {
            command
                .get(i)
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .with_context(|| format!("{verb} missing argument {i}"))
        };

        let reply = match verb.as_str() {
            "AUTH" => {
                self.auths.push(arg(1)?);
                ok()
            }
            "CLUSTER" => {
                ensure!(arg(1)?.eq_ignore_ascii_case("import"), "unknown subcommand");
                let slot: u16 = arg(2)?.parse()?;
                let status: u8 = arg(3)?.parse()?;
                self.imports.push((slot, status));
                ok()
            }
            "SET" => {
                let key = arg(1)?;
                self.strings.insert(key.clone(), command[2].clone());
                if command.len() > 3 {
                    ensure!(arg(3)?.eq_ignore_ascii_case("pxat"), "unknown SET option");
                    self.expires.insert(key, arg(4)?.parse()?);
                }
                ok()
            }
            "HMSET" => {
                let key = arg(1)?;
                ensure!(command.len() % 2 == 0, "HMSET needs field/value pairs");
                let hash = self.hashes.entry(key).or_default();
                for pair in command[2..].chunks(2) {
                    hash.insert(
                        String::from_utf8_lossy(&pair[0]).into_owned(),
                        String::from_utf8_lossy(&pair[1]).into_owned(),
                    );
                }
                ok()
            }
            "HDEL" => {
                let key = arg(1)?;
                let field = arg(2)?;
                let removed = self
                    .hashes
                    .get_mut(&key)
                    .map(|h| h.remove(&field).is_some())
                    .unwrap_or(false);
                int(removed as i64)
            }
            "SADD" => {
                let key = arg(1)?;
                let set = self.sets.entry(key).or_default();
                let mut added = 0;
                for member in &command[2..] {
                    if set.insert(String::from_utf8_lossy(member).into_owned()) {
                        added += 1;
                    }
                }
                int(added)
            }
            "SREM" => {
                let key = arg(1)?;
                let member = arg(2)?;
                let removed = self
                    .sets
                    .get_mut(&key)
                    .map(|s| s.remove(&member))
                    .unwrap_or(false);
                int(removed as i64)
            }
            "ZADD" => {
                let key = arg(1)?;
                ensure!(command.len() % 2 == 0, "ZADD needs score/member pairs");
                let zset = self.zsets.entry(key).or_default();
                let mut added = 0;
                for pair in command[2..].chunks(2) {
                    let score: f64 = String::from_utf8_lossy(&pair[0]).parse()?;
                    let member = String::from_utf8_lossy(&pair[1]).into_owned();
                    if zset.insert(member, score).is_none() {
                        added += 1;
                    }
                }
                int(added)
            }
            "ZREM" => {
                let key = arg(1)?;
                let member = arg(2)?;
                let removed = self
                    .zsets
                    .get_mut(&key)
                    .map(|z| z.remove(&member).is_some())
                    .unwrap_or(false);
                int(removed as i64)
            }
            "SIADD" => {
                let key = arg(1)?;
                let set = self.sortedints.entry(key).or_default();
                let mut added = 0;
                for id in &command[2..] {
                    if set.insert(String::from_utf8_lossy(id).parse()?) {
                        added += 1;
                    }
                }
                int(added)
            }
            "SIREM" => {
                let key = arg(1)?;
                let id: u64 = arg(2)?.parse()?;
                let removed = self
                    .sortedints
                    .get_mut(&key)
                    .map(|s| s.remove(&id))
                    .unwrap_or(false);
                int(removed as i64)
            }
            "RPUSH" => {
                let key = arg(1)?;
                let list = self.lists.entry(key).or_default();
                for value in &command[2..] {
                    list.push(String::from_utf8_lossy(value).into_owned());
                }
                int(list.len() as i64)
            }
            "SETBIT" => {
                let key = arg(1)?;
                let offset: u64 = arg(2)?.parse()?;
                let bit: u8 = arg(3)?.parse()?;
                let bits = self.bitmaps.entry(key).or_default();
                let byte = (offset / 8) as usize;
                if bits.len() <= byte {
                    bits.resize(byte + 1, 0);
                }
                if bit != 0 {
                    bits[byte] |= 1 << (offset % 8);
                } else {
                    bits[byte] &= !(1 << (offset % 8));
                }
                int(0)
            }
            "XADD" => {
                let key = arg(1)?;
                let id = arg(2)?;
                ensure!(command.len() % 2 == 1, "XADD needs field/value pairs");
                let mut fields = Vec::new();
                for pair in command[3..].chunks(2) {
                    fields.push((
                        String::from_utf8_lossy(&pair[0]).into_owned(),
                        String::from_utf8_lossy(&pair[1]).into_owned(),
                    ));
                }
                let stream = self.streams.entry(key).or_default();
                stream.entries.push((id.clone(), fields));
                stream.last_id = id.clone();
                stream.entries_added += 1;
                Ok(format!("${}\r\n{id}\r\n", id.len()).into_bytes())
            }
            "XDEL" => {
                let key = arg(1)?;
                let id = arg(2)?;
                let removed = self
                    .streams
                    .get_mut(&key)
                    .map(|s| {
                        let before = s.entries.len();
                        s.entries.retain(|(entry_id, _)| *entry_id != id);
                        before - s.entries.len()
                    })
                    .unwrap_or(0);
                int(removed as i64)
            }
            "XSETID" => {
                let key = arg(1)?;
                ensure!(arg(3)?.eq_ignore_ascii_case("entriesadded"), "bad XSETID");
                ensure!(arg(5)?.eq_ignore_ascii_case("maxdeletedid"), "bad XSETID");
                let stream = self.streams.entry(key).or_default();
                stream.last_id = arg(2)?;
                stream.entries_added = arg(4)?.parse()?;
                stream.max_deleted_id = arg(6)?;
                ok()
            }
            "PEXPIREAT" => {
                let key = arg(1)?;
                self.expires.insert(key, arg(2)?.parse()?);
                int(1)
            }
            "DEL" => {
                let key = arg(1)?;
                self.strings.remove(&key);
                self.hashes.remove(&key);
                self.sets.remove(&key);
                self.zsets.remove(&key);
                self.sortedints.remove(&key);
                self.lists.remove(&key);
                self.bitmaps.remove(&key);
                self.streams.remove(&key);
                self.expires.remove(&key);
                int(1)
            }
            other => bail!("unknown command {other}"),
        };
        reply
    }
}

fn ok() -> Result<Vec<u8>> {
    Ok(b"+OK\r\n".to_vec())
}

fn int(v: i64) -> Result<Vec<u8>> {
    Ok(format!(":{v}\r\n").into_bytes())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
