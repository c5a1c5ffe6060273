//! The key-value store: column families over a write-ahead batch log.

use crate::backend::StorageBackend;
use crate::batch::{BatchOp, WriteBatch};
use crate::cf::ColumnFamily;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use crate::record::{decode_record, encode_record, DecodeOutcome};
use crate::snapshot::{prefix_bounds, Snapshot};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

/// Name of the batch log file inside a database directory.
pub const LOG_FILE: &str = "themis.log";
/// Name of the advisory lock file inside a database directory.
pub const LOCK_FILE: &str = "LOCK";

/// Options controlling store behavior.
#[derive(Debug, Clone)]
pub struct KvStoreOptions {
    /// Whether to fsync the log on every committed batch.
    pub sync_on_commit: bool,
}

impl Default for KvStoreOptions {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
        }
    }
}

/// The key-value substrate.
///
/// Owns all on-disk state. A [`WriteBatch`] is the only atomicity
/// primitive: commit assigns a monotonic sequence number, appends one framed
/// log record, then applies the operations to the in-memory tables under the
/// commit lock. Reads are strong by default; [`KvStore::snapshot`] provides
/// a detached consistent view for scans.
pub struct KvStore {
    tables: Vec<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    log: Mutex<Box<dyn StorageBackend>>,
    commit_lock: Mutex<()>,
    last_sequence: AtomicU64,
    closed: AtomicBool,
    options: KvStoreOptions,
    // Held for the lifetime of the store to keep the directory lock.
    _dir_lock: Option<File>,
}

impl KvStore {
    /// Opens an ephemeral in-memory store with default options.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches the persistent path.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()), KvStoreOptions::default(), None)
    }

    /// Opens or creates a persistent store in `dir`.
    ///
    /// Acquires an exclusive advisory lock on `dir/LOCK`; a second open of
    /// the same directory fails with [`StorageError::Locked`].
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or locked, or if
    /// log replay finds corruption.
    pub fn open(dir: &Path, options: KvStoreOptions) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StorageError::Locked)?;

        let backend = FileBackend::open(&dir.join(LOG_FILE))?;
        Self::open_with_backend(Box::new(backend), options, Some(lock_file))
    }

    /// Opens a store over an arbitrary backend, replaying any existing log.
    fn open_with_backend(
        mut backend: Box<dyn StorageBackend>,
        options: KvStoreOptions,
        dir_lock: Option<File>,
    ) -> StorageResult<Self> {
        let mut tables: Vec<BTreeMap<Vec<u8>, Vec<u8>>> =
            ColumnFamily::ALL.iter().map(|_| BTreeMap::new()).collect();
        let mut last_sequence = 0u64;

        let size = backend.size()?;
        if size > 0 {
            let bytes = backend.read_at(0, size as usize)?;
            let mut offset = 0usize;
            let mut replayed = 0u64;

            while offset < bytes.len() {
                match decode_record(&bytes[offset..])? {
                    DecodeOutcome::Record(record) => {
                        if record.sequence <= last_sequence {
                            return Err(StorageError::corrupted(format!(
                                "non-monotonic sequence {} after {}",
                                record.sequence, last_sequence
                            )));
                        }
                        last_sequence = record.sequence;
                        apply_batch(&mut tables, record.batch.ops());
                        offset += record.encoded_len;
                        replayed += 1;
                    }
                    DecodeOutcome::TornTail => {
                        warn!(
                            offset,
                            dropped = bytes.len() - offset,
                            "torn record at log tail, truncating"
                        );
                        backend.truncate(offset as u64)?;
                        backend.sync()?;
                        break;
                    }
                }
            }
            info!(records = replayed, sequence = last_sequence, "log replayed");
        }

        Ok(Self {
            tables: tables.into_iter().map(RwLock::new).collect(),
            log: Mutex::new(backend),
            commit_lock: Mutex::new(()),
            last_sequence: AtomicU64::new(last_sequence),
            closed: AtomicBool::new(false),
            options,
            _dir_lock: dir_lock,
        })
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn table(&self, cf: ColumnFamily) -> &RwLock<BTreeMap<Vec<u8>, Vec<u8>>> {
        &self.tables[cf.as_byte() as usize]
    }

    /// Returns the sequence of the most recent commit (0 before any).
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Reads a key.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] after [`KvStore::close`].
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.table(cf).read().get(key).cloned())
    }

    /// Reads many keys in one call, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] after [`KvStore::close`].
    pub fn multi_get(
        &self,
        cf: ColumnFamily,
        keys: &[Vec<u8>],
    ) -> StorageResult<Vec<Option<Vec<u8>>>> {
        self.check_open()?;
        let table = self.table(cf).read();
        Ok(keys.iter().map(|k| table.get(k).cloned()).collect())
    }

    /// Inserts or replaces a single key as a one-operation batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub fn put(&self, cf: ColumnFamily, key: Vec<u8>, value: Vec<u8>) -> StorageResult<u64> {
        let mut batch = WriteBatch::new();
        batch.put(cf, key, value);
        self.write_batch(batch)
    }

    /// Deletes a single key as a one-operation batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub fn delete(&self, cf: ColumnFamily, key: Vec<u8>) -> StorageResult<u64> {
        let mut batch = WriteBatch::new();
        batch.delete(cf, key);
        self.write_batch(batch)
    }

    /// Commits a batch atomically and returns its sequence number.
    ///
    /// The batch is durable (log-first) before it becomes visible. All
    /// operations become visible at the returned sequence together.
    ///
    /// # Errors
    ///
    /// Returns an error if the log append fails; in that case nothing is
    /// applied.
    pub fn write_batch(&self, batch: WriteBatch) -> StorageResult<u64> {
        self.check_open()?;
        let _commit = self.commit_lock.lock();

        let sequence = self.last_sequence.load(Ordering::Acquire) + 1;
        let record = encode_record(sequence, &batch)?;

        {
            let mut log = self.log.lock();
            log.append(&record)?;
            if self.options.sync_on_commit {
                log.sync()?;
            } else {
                log.flush()?;
            }
        }

        for op in batch.ops() {
            let mut table = self.table(op.cf()).write();
            match op {
                BatchOp::Put { key, value, .. } => {
                    table.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key, .. } => {
                    table.remove(key);
                }
            }
        }

        self.last_sequence.store(sequence, Ordering::Release);
        Ok(sequence)
    }

    /// Scans keys with the given prefix, ascending (or descending with
    /// `reverse`), up to `limit` entries.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] after [`KvStore::close`].
    pub fn scan_prefix(
        &self,
        cf: ColumnFamily,
        prefix: &[u8],
        limit: Option<usize>,
        reverse: bool,
    ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let (lo, hi) = prefix_bounds(prefix);
        self.scan_range(cf, lo, hi, limit, reverse)
    }

    /// Scans keys in `[lo, hi]` (per the given bounds), up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] after [`KvStore::close`].
    pub fn scan_range(
        &self,
        cf: ColumnFamily,
        lo: Bound<Vec<u8>>,
        hi: Bound<Vec<u8>>,
        limit: Option<usize>,
        reverse: bool,
    ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_open()?;
        let table = self.table(cf).read();
        let limit = limit.unwrap_or(usize::MAX);
        let iter = table.range((lo, hi));

        let out: Vec<(Vec<u8>, Vec<u8>)> = if reverse {
            iter.rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            iter.take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Ok(out)
    }

    /// Takes a consistent snapshot of every column family.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] after [`KvStore::close`].
    pub fn snapshot(&self) -> StorageResult<Snapshot> {
        self.check_open()?;
        // Taking the commit lock pins a single sequence across all tables.
        let _commit = self.commit_lock.lock();
        let sequence = self.last_sequence.load(Ordering::Acquire);
        let tables = self.tables.iter().map(|t| t.read().clone()).collect();
        Ok(Snapshot::new(sequence, tables))
    }

    /// Writes a compacted, durable copy of the current state into `dir`.
    ///
    /// The checkpoint is a fresh log holding one batch with every live key,
    /// stamped with the current commit sequence, and can be opened as a
    /// database directory for backup or restore.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint directory cannot be written.
    pub fn checkpoint(&self, dir: &Path) -> StorageResult<()> {
        let snapshot = self.snapshot()?;
        std::fs::create_dir_all(dir)?;

        let mut batch = WriteBatch::new();
        for cf in ColumnFamily::ALL {
            for (key, value) in snapshot.iter(cf) {
                batch.put(cf, key.clone(), value.clone());
            }
        }

        let record = encode_record(snapshot.sequence().max(1), &batch)?;
        let mut backend = FileBackend::open(&dir.join(LOG_FILE))?;
        backend.truncate(0)?;
        backend.append(&record)?;
        backend.sync()?;
        info!(path = %dir.display(), sequence = snapshot.sequence(), "checkpoint written");
        Ok(())
    }

    /// Flushes the batch log to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn flush(&self) -> StorageResult<()> {
        self.check_open()?;
        self.log.lock().sync()
    }

    /// Flushes and closes the store. Further operations fail with
    /// [`StorageError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails; the store is closed
    /// regardless.
    pub fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.log.lock().sync()
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("last_sequence", &self.last_sequence())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn apply_batch(tables: &mut [BTreeMap<Vec<u8>, Vec<u8>>], ops: &[BatchOp]) {
    for op in ops {
        let table = &mut tables[op.cf().as_byte() as usize];
        match op {
            BatchOp::Put { key, value, .. } => {
                table.insert(key.clone(), value.clone());
            }
            BatchOp::Delete { key, .. } => {
                table.remove(key);
            }
        }
    }
}
