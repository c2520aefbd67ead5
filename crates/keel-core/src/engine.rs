//! Core storage engine
//!
//! KeelEngine keeps the whole key space in an ordered multi-version memtable,
//! made crash-safe by the WAL and periodically checkpointed into a table file.
//!
//! **Read path**: RAM-first via RwLock, optionally through the shared block cache
//! **Write path**: WAL-first, then the memtable, one batch at a time
//! **Checkpoint**: compact_range (or a WAL past `write_buffer_size`) writes the
//! live state to a table, rotates the WAL and prunes versions nobody can see
//!
//! Lock order: `log` mutex, then `state`, then `pins`.

use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::batch::WriteBatch;
use crate::config::{Config, ReadOptions, WriteOptions};
use crate::durability::sync_dir;
use crate::error::{KeelError, KeelResult};
use crate::format::serialize_batch;
use crate::lock::{StoreLock, LOCK_FILE};
use crate::memtable::{MemTable, Visible};
use crate::table::{list_tables, read_table, remove_tables_except, write_table, DATA_DIR};
use crate::wal::{list_segments, remove_segments_before, RecoveryMode, WalReader, WalWriter, WAL_DIR};

/// Marker file whose presence means a store exists at the path
pub const CURRENT_FILE: &str = "CURRENT";

const CURRENT_CONTENTS: &[u8] = b"keel 1\n";

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Writer-side state, serialized by one mutex
struct LogState {
    wal: WalWriter,
    last_sequence: u64,
    table_number: u64,
}

/// Sequences that readers still need, with a reference count each
#[derive(Default)]
struct Pins {
    counts: HashMap<u64, usize>,
    explicit: usize,
}

#[derive(Default)]
struct Counters {
    writes: AtomicU64,
    reads: AtomicU64,
    checkpoints: AtomicU64,
    recovered_records: AtomicU64,
    skipped_records: AtomicU64,
}

/// Everything iterators and snapshots keep alive after the engine value is gone.
struct Shared {
    path: PathBuf,
    config: Config,
    instance: u64,
    log: Mutex<LogState>,
    state: RwLock<MemTable>,
    pins: Mutex<Pins>,
    closed: AtomicBool,
    lock: Mutex<Option<StoreLock>>,
    counters: Counters,
}

impl Shared {
    fn pin(&self, sequence: u64, explicit: bool) {
        let mut pins = self.pins.lock();
        *pins.counts.entry(sequence).or_insert(0) += 1;
        if explicit {
            pins.explicit += 1;
        }
    }

    fn unpin(&self, sequence: u64, explicit: bool) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.counts.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                pins.counts.remove(&sequence);
            }
        }
        if explicit {
            pins.explicit = pins.explicit.saturating_sub(1);
        }
    }

    fn check_open(&self) -> KeelResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KeelError::Closed);
        }
        Ok(())
    }
}

/// Outcome of replaying tables and WAL into a fresh memtable.
struct Recovery {
    mem: MemTable,
    table_number: u64,
    records: usize,
    skipped: usize,
}

fn recover(path: &Path, mode: RecoveryMode) -> KeelResult<Recovery> {
    let mut mem = MemTable::new();
    let mut skipped = 0;
    let mut covered = 0;

    let tables = list_tables(&path.join(DATA_DIR))?;
    let table_number = tables.last().map_or(0, |(number, _)| *number);
    if let Some((_, table_path)) = tables.last() {
        let table = read_table(table_path, mode)?;
        covered = table.last_sequence;
        skipped += table.skipped;
        for (key, value) in table.entries {
            mem.load(covered, &key, value);
        }
        mem.advance_sequence(covered);
    }

    let recovered = WalReader::new(path.join(WAL_DIR)).recover(mode)?;
    skipped += recovered.skipped;
    let mut records = 0;
    for record in recovered.records {
        // Records at or below the table's sequence are already in it
        if record.sequence <= covered {
            continue;
        }
        mem.apply(record.sequence, &record.batch);
        records += 1;
    }

    Ok(Recovery { mem, table_number, records, skipped })
}

fn write_current(path: &Path) -> KeelResult<()> {
    let current = path.join(CURRENT_FILE);
    fs::write(&current, CURRENT_CONTENTS).map_err(|e| KeelError::io_at(&current, "write CURRENT", e))?;
    sync_dir(path).map_err(|e| KeelError::io_at(path, "sync store directory", e))
}

/// Embedded ordered key-value store.
///
/// All public methods take `&self` for concurrent access. Readers share the
/// memtable RwLock; writers serialize on the log mutex, append to the WAL,
/// then briefly hold the memtable write lock to apply the whole batch.
pub struct KeelEngine {
    shared: Arc<Shared>,
}

impl KeelEngine {
    /// Open or create the store at `path`.
    ///
    /// Takes the store lock, replays the newest table plus every WAL record
    /// past it, and starts a fresh WAL segment.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> KeelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let config = config.sanitized();

        let exists = path.join(CURRENT_FILE).exists();
        if !exists && !config.create_if_missing {
            return Err(KeelError::NotFound(path));
        }
        if exists && config.error_if_exists {
            return Err(KeelError::AlreadyExists(path));
        }

        fs::create_dir_all(&path).map_err(|e| KeelError::io_at(&path, "create store directory", e))?;
        let lock = StoreLock::acquire(&path)?;
        if !exists {
            write_current(&path)?;
        }

        let mode = if config.paranoid_checks { RecoveryMode::Strict } else { RecoveryMode::Salvage };
        let recovery = recover(&path, mode)?;
        if recovery.skipped > 0 {
            warn!(path = %path.display(), skipped = recovery.skipped, "damaged records skipped during recovery");
        }

        let wal = WalWriter::new(path.join(WAL_DIR))?;
        let last_sequence = recovery.mem.last_sequence();
        info!(
            path = %path.display(),
            records = recovery.records,
            entries = recovery.mem.live_count(last_sequence),
            sequence = last_sequence,
            "opened store"
        );

        let counters = Counters::default();
        counters.recovered_records.store(recovery.records as u64, Ordering::Relaxed);
        counters.skipped_records.store(recovery.skipped as u64, Ordering::Relaxed);

        Ok(Self {
            shared: Arc::new(Shared {
                path,
                config,
                instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
                log: Mutex::new(LogState { wal, last_sequence, table_number: recovery.table_number }),
                state: RwLock::new(recovery.mem),
                pins: Mutex::new(Pins::default()),
                closed: AtomicBool::new(false),
                lock: Mutex::new(Some(lock)),
                counters,
            }),
        })
    }

    /// Value of `key`, as of the snapshot in `options` or the latest state.
    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> KeelResult<Option<Vec<u8>>> {
        self.shared.check_open()?;
        self.shared.counters.reads.fetch_add(1, Ordering::Relaxed);

        let cache = self.shared.config.block_cache.as_ref().filter(|_| options.snapshot.is_none());
        let instance = self.shared.instance;

        // Cached values skip the checksum, so verified reads go to the memtable
        if let Some(cache) = cache.filter(|_| !options.verify_checksums) {
            if let Some(value) = cache.lookup(instance, key) {
                return Ok(Some(value));
            }
        }

        // Fill under the read lock: writers invalidate under the write lock,
        // so a filled value is never older than the memtable
        let state = self.shared.state.read();
        let sequence = options.snapshot.unwrap_or_else(|| state.last_sequence());
        let Some(visible) = state.get(key, sequence) else {
            return Ok(None);
        };
        verify(options, key, &visible)?;
        if let Some(cache) = cache.filter(|_| options.fill_cache) {
            cache.insert(instance, key, &visible.value);
        }
        Ok(Some(visible.value))
    }

    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> KeelResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, &batch)
    }

    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> KeelResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, &batch)
    }

    /// Apply a batch atomically.
    ///
    /// WRITE ORDERING:
    /// 1. WAL append (durable_sync when `options.sync`)
    /// 2. Memtable apply and cache invalidation under one write lock
    ///
    /// If the WAL append fails, memory is never modified. An empty batch
    /// writes nothing. A checkpoint failure after the commit is logged, not
    /// returned.
    pub fn write(&self, options: &WriteOptions, batch: &WriteBatch) -> KeelResult<()> {
        if batch.is_empty() {
            return self.shared.check_open();
        }

        let mut log = self.shared.log.lock();
        self.shared.check_open()?;

        let first = log.last_sequence + 1;
        let record = serialize_batch(first, batch)?;
        log.wal.append(&record, options.sync)?;
        log.last_sequence += batch.len() as u64;

        {
            let mut state = self.shared.state.write();
            state.apply(first, batch);
            if let Some(cache) = &self.shared.config.block_cache {
                for op in batch.ops() {
                    cache.invalidate(self.shared.instance, op.key());
                }
            }
        }
        self.shared.counters.writes.fetch_add(1, Ordering::Relaxed);

        if log.wal.current_size() > self.shared.config.write_buffer_size as u64 {
            debug!(
                path = %self.shared.path.display(),
                wal_bytes = log.wal.current_size(),
                "WAL past write buffer size, checkpointing"
            );
            // The batch is already committed; the next write retries the checkpoint
            if let Err(e) = self.checkpoint(&mut log, None, None) {
                warn!(path = %self.shared.path.display(), error = %e, "checkpoint after write failed");
            }
        }
        Ok(())
    }

    /// Cursor over the state as of `options.snapshot` (or now). The cursor
    /// starts unpositioned.
    pub fn iter(&self, options: &ReadOptions) -> KeelResult<EngineIterator> {
        self.shared.check_open()?;
        let sequence = {
            let state = self.shared.state.read();
            let sequence = options.snapshot.unwrap_or_else(|| state.last_sequence());
            self.shared.pin(sequence, false);
            sequence
        };
        Ok(EngineIterator {
            shared: Arc::clone(&self.shared),
            sequence,
            verify_checksums: options.verify_checksums,
            current: None,
            error: None,
        })
    }

    /// Pin the current state.
    pub fn snapshot(&self) -> KeelResult<EngineSnapshot> {
        self.shared.check_open()?;
        let state = self.shared.state.read();
        let sequence = state.last_sequence();
        self.shared.pin(sequence, true);
        Ok(EngineSnapshot { shared: Arc::clone(&self.shared), sequence })
    }

    /// Checkpoint the store and prune versions in `[start, limit)` that no
    /// snapshot or iterator can see. `None` bounds are open.
    pub fn compact_range(&self, start: Option<&[u8]>, limit: Option<&[u8]>) -> KeelResult<()> {
        let mut log = self.shared.log.lock();
        self.shared.check_open()?;
        self.checkpoint(&mut log, start, limit)
    }

    /// Crash safety: the table is installed before any WAL segment is
    /// removed, and recovery skips WAL records the newest table covers.
    fn checkpoint(&self, log: &mut LogState, start: Option<&[u8]>, limit: Option<&[u8]>) -> KeelResult<()> {
        let data_dir = self.shared.path.join(DATA_DIR);
        let wal_dir = self.shared.path.join(WAL_DIR);
        let number = log.table_number + 1;

        let info = {
            let state = self.shared.state.read();
            let sequence = state.last_sequence();
            write_table(&data_dir, number, sequence, self.shared.config.compression, state.live_entries(sequence))?
        };
        log.table_number = number;

        let segment = log.wal.rotate()?;
        let removed_segments = remove_segments_before(&wal_dir, segment)?;
        let removed_tables = remove_tables_except(&data_dir, number)?;

        let pruned = {
            let mut state = self.shared.state.write();
            let pinned: Vec<u64> = self.shared.pins.lock().counts.keys().copied().collect();
            state.prune(start, limit, &pinned)
        };
        self.shared.counters.checkpoints.fetch_add(1, Ordering::Relaxed);

        debug!(
            path = %self.shared.path.display(),
            table = number,
            entries = info.entries,
            bytes = info.bytes,
            removed_segments,
            removed_tables,
            pruned,
            "checkpoint complete"
        );
        Ok(())
    }

    /// Diagnostic value for a `keel.*` property name; `None` for unknown names.
    pub fn property(&self, name: &str) -> KeelResult<Option<String>> {
        self.shared.check_open()?;
        let value = match name {
            "keel.num-entries" => {
                let state = self.shared.state.read();
                Some(state.live_count(state.last_sequence()).to_string())
            }
            "keel.num-snapshots" => Some(self.shared.pins.lock().explicit.to_string()),
            "keel.approximate-memory-usage" => {
                Some(self.shared.state.read().approximate_memory_usage().to_string())
            }
            "keel.cache-usage" => Some(
                self.shared.config.block_cache.as_ref().map_or(0, |c| c.total_charge()).to_string(),
            ),
            "keel.stats" => Some(self.stats()),
            _ => None,
        };
        Ok(value)
    }

    fn stats(&self) -> String {
        let (segment, wal_bytes, tables) = {
            let log = self.shared.log.lock();
            (log.wal.sequence(), log.wal.current_size(), log.table_number)
        };
        let (entries, sequence, memory) = {
            let state = self.shared.state.read();
            let sequence = state.last_sequence();
            (state.live_count(sequence), sequence, state.approximate_memory_usage())
        };
        let (pinned, snapshots) = {
            let pins = self.shared.pins.lock();
            (pins.counts.len(), pins.explicit)
        };
        let counters = &self.shared.counters;
        let mut out = String::from("Keel store statistics\n");
        out.push_str(&format!("  entries: {}\n", entries));
        out.push_str(&format!("  sequence: {}\n", sequence));
        out.push_str(&format!("  memory bytes: {}\n", memory));
        out.push_str(&format!("  wal segment: {} ({} bytes)\n", segment, wal_bytes));
        out.push_str(&format!("  table: {}\n", tables));
        out.push_str(&format!("  snapshots: {} (pinned sequences: {})\n", snapshots, pinned));
        out.push_str(&format!("  writes: {}\n", counters.writes.load(Ordering::Relaxed)));
        out.push_str(&format!("  reads: {}\n", counters.reads.load(Ordering::Relaxed)));
        out.push_str(&format!("  checkpoints: {}\n", counters.checkpoints.load(Ordering::Relaxed)));
        out.push_str(&format!(
            "  recovered records: {} (skipped {})\n",
            counters.recovered_records.load(Ordering::Relaxed),
            counters.skipped_records.load(Ordering::Relaxed)
        ));
        out.push_str(&format!("  max open files: {}\n", self.shared.config.max_open_files));
        if let Some(cache) = &self.shared.config.block_cache {
            out.push_str(&format!(
                "  cache: {} / {} bytes, {} hits, {} misses\n",
                cache.total_charge(),
                cache.capacity(),
                cache.hits(),
                cache.misses()
            ));
        }
        out
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Sync the WAL, release the store lock and drop this store's cache
    /// entries. Idempotent. Snapshots and iterators that outlive the close
    /// keep reading the in-memory state.
    pub fn close(&self) {
        let log = self.shared.log.lock();
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = log.wal.sync() {
            warn!(path = %self.shared.path.display(), error = %e, "WAL sync on close failed");
        }
        drop(log);

        if let Some(cache) = &self.shared.config.block_cache {
            cache.purge(self.shared.instance);
        }
        self.shared.lock.lock().take();
        debug!(path = %self.shared.path.display(), "closed store");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Rebuild a store from whatever is still readable.
    ///
    /// Salvages the newest table and every WAL segment, skipping damaged
    /// records, then writes a clean checkpoint and deletes the old files.
    pub fn repair<P: AsRef<Path>>(path: P, config: &Config) -> KeelResult<()> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(KeelError::NotFound(path.to_path_buf()));
        }
        let _lock = StoreLock::acquire(path)?;
        let config = config.sanitized();

        let recovery = recover(path, RecoveryMode::Salvage)?;
        let sequence = recovery.mem.last_sequence();
        let data_dir = path.join(DATA_DIR);
        let wal_dir = path.join(WAL_DIR);

        let number = recovery.table_number + 1;
        let info = write_table(&data_dir, number, sequence, config.compression, recovery.mem.live_entries(sequence))?;
        remove_tables_except(&data_dir, number)?;
        let segments = list_segments(&wal_dir)?;
        if let Some((last, _)) = segments.last() {
            remove_segments_before(&wal_dir, last + 1)?;
        }
        write_current(path)?;

        info!(
            path = %path.display(),
            entries = info.entries,
            records = recovery.records,
            skipped = recovery.skipped,
            "repaired store"
        );
        Ok(())
    }

    /// Delete every engine file under `path`. A missing path is not an error.
    /// Fails if another handle holds the store open.
    pub fn destroy<P: AsRef<Path>>(path: P) -> KeelResult<()> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Ok(());
        }
        let lock = StoreLock::acquire(path)?;

        remove_if_present(&path.join(CURRENT_FILE))?;
        let wal_dir = path.join(WAL_DIR);
        let data_dir = path.join(DATA_DIR);
        remove_segments_before(&wal_dir, u64::MAX)?;
        remove_tables_except(&data_dir, u64::MAX)?;
        for dir in [&wal_dir, &data_dir] {
            // Left in place if the user keeps their own files there
            if let Err(e) = fs::remove_dir(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(dir = %dir.display(), error = %e, "directory kept after destroy");
                }
            }
        }

        drop(lock);
        remove_if_present(&path.join(LOCK_FILE))?;
        let _ = fs::remove_dir(path);
        info!(path = %path.display(), "destroyed store");
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> KeelResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KeelError::io_at(path, "remove", e)),
    }
}

fn verify(options: &ReadOptions, key: &[u8], visible: &Visible) -> KeelResult<()> {
    if options.verify_checksums && !visible.verify() {
        return Err(KeelError::ChecksumMismatch {
            path: PathBuf::from(format!("<memtable key of {} bytes>", key.len())),
            expected: visible.crc,
            actual: crc32c::crc32c(&visible.value),
            offset: 0,
        });
    }
    Ok(())
}

impl Drop for KeelEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for KeelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeelEngine")
            .field("path", &self.shared.path)
            .field("instance", &self.shared.instance)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A pinned sequence number. Reads through `ReadOptions::snapshot` set to
/// `sequence()` see the store exactly as it was when this was taken.
pub struct EngineSnapshot {
    shared: Arc<Shared>,
    sequence: u64,
}

impl EngineSnapshot {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Drop for EngineSnapshot {
    fn drop(&mut self) {
        self.shared.unpin(self.sequence, true);
    }
}

/// Forward cursor over the store at a fixed sequence.
///
/// Positions are found by re-seeking the memtable from the current key, so
/// the cursor holds no lock between steps and sees neither later writes nor
/// versions pruned away (its sequence stays pinned until drop).
pub struct EngineIterator {
    shared: Arc<Shared>,
    sequence: u64,
    verify_checksums: bool,
    current: Option<(Vec<u8>, Vec<u8>)>,
    error: Option<KeelError>,
}

impl EngineIterator {
    fn land(&mut self, from: Bound<&[u8]>) {
        let found = self.shared.state.read().next_visible(from, self.sequence);
        self.current = match found {
            Some((key, visible)) => {
                if self.verify_checksums && !visible.verify() {
                    self.error = Some(KeelError::ChecksumMismatch {
                        path: PathBuf::from("<memtable>"),
                        expected: visible.crc,
                        actual: crc32c::crc32c(&visible.value),
                        offset: 0,
                    });
                    None
                } else {
                    Some((key, visible.value))
                }
            }
            None => None,
        };
    }

    pub fn seek_to_first(&mut self) {
        self.error = None;
        self.land(Bound::Unbounded);
    }

    /// Position at the first key `>= target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.error = None;
        self.land(Bound::Included(target));
    }

    /// Step past the current entry. No-op when not positioned.
    pub fn next(&mut self) {
        if let Some((key, _)) = self.current.take() {
            self.land(Bound::Excluded(&key));
        }
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(key, _)| key.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, value)| value.as_slice())
    }

    /// The error that stopped the cursor, if any.
    pub fn status(&self) -> Option<&KeelError> {
        self.error.as_ref()
    }
}

impl Drop for EngineIterator {
    fn drop(&mut self) {
        self.shared.unpin(self.sequence, false);
    }
}
