//! The orchestrator: lifecycle, commit coordination, background workers.
//!
//! `Database` is the only component that commits mutations. Every entity
//! put or delete builds one atomic batch holding the entity bytes, all
//! secondary/spatial/graph index co-updates, and exactly one CDC event
//! sharing the commit sequence. Startup ordering: open KV, load keys
//! (KEK then DEK), open indexes, load the vector index from `save_path`,
//! open the CDC log, start background workers. Shutdown reverses: stop
//! workers, save vector indexes, flush, close.

use crate::changefeed::{CdcEvent, CdcEventType, CdcLog};
use crate::config::Config;
use crate::content::{ContentManager, ContentPolicy};
use crate::crypto::{EncryptionContext, FieldCipher, KeyHierarchy};
use crate::error::{CoreError, CoreResult};
use crate::graph::GraphIndex;
use crate::index::{is_reserved_table, IndexKind, SecondaryIndexManager};
use crate::integrity::{IntegrityPolicy, IntegrityVerifier};
use crate::query::eval::entity_to_json;
use crate::query::{QueryEngine, QueryOptions, QueryOutput};
use crate::semcache::SemanticCache;
use crate::spatial::SpatialIndex;
use crate::stats::{DatabaseStats, StatsSnapshot};
use crate::timeseries::TsStore;
use crate::vector::{persistence, HnswParams, VectorIndexManager, VectorMetric};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use themis_codec::{Entity, Value};
use themis_storage::{ColumnFamily, KvStore, KvStoreOptions, WriteBatch};
use tracing::{info, warn};

/// Interval between background worker ticks.
const WORKER_TICK: Duration = Duration::from_millis(200);
/// TTL cleanup cadence, in ticks.
const TTL_EVERY_TICKS: u64 = 5;
/// Semantic-cache sweep cadence, in ticks.
const CACHE_SWEEP_EVERY_TICKS: u64 = 300;

/// The service id used for the key hierarchy.
const SERVICE_ID: &str = "themisdb";

/// The database orchestrator.
pub struct Database {
    config: Config,
    store: Arc<KvStore>,
    keys: Arc<KeyHierarchy>,
    cipher: Arc<FieldCipher>,
    index: Arc<SecondaryIndexManager>,
    spatial: Arc<SpatialIndex>,
    vector: Arc<VectorIndexManager>,
    graph: Arc<GraphIndex>,
    timeseries: Arc<TsStore>,
    cdc: Option<Arc<CdcLog>>,
    semcache: Option<Arc<SemanticCache>>,
    content: Arc<ContentManager>,
    integrity: Arc<IntegrityVerifier>,
    engine: QueryEngine,
    stats: Arc<DatabaseStats>,
    /// The commit coordinator: serializes all mutating batches.
    commit_lock: Mutex<()>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    /// Re-encrypt stale blobs on read.
    lazy_reencrypt: bool,
}

impl Database {
    /// Opens a database per the configuration.
    ///
    /// # Errors
    ///
    /// Returns configuration, storage, or key errors; a corrupt vector
    /// index degrades to empty with an `IndexCorrupt` log instead of
    /// failing.
    pub fn open(config: Config) -> CoreResult<Self> {
        config.validate()?;

        // 1. KV substrate.
        let store_options = KvStoreOptions {
            sync_on_commit: config.storage.sync_on_commit,
        };
        let store = Arc::new(match config.storage_path() {
            Some(path) => KvStore::open(&path, store_options)?,
            None => KvStore::open_in_memory()?,
        });

        // 2. Integrity verifier.
        let integrity = Arc::new(IntegrityVerifier::new(
            Arc::clone(&store),
            IntegrityPolicy::default(),
        ));

        // 3. Keys: KEK, then DEK.
        let keys = Arc::new(KeyHierarchy::new(Arc::clone(&store), SERVICE_ID));
        keys.ensure_kek()?;
        keys.ensure_dek()?;
        let cipher = Arc::new(FieldCipher::new(Arc::clone(&keys)));

        // 4. Indexes.
        let index = Arc::new(SecondaryIndexManager::open(Arc::clone(&store))?);
        let spatial = Arc::new(SpatialIndex::new(Arc::clone(&store)));
        let graph = Arc::new(GraphIndex::new(Arc::clone(&store)));
        let timeseries = Arc::new(TsStore::new(Arc::clone(&store)));

        // 5. Vector indexes from save_path, fail-open on corruption.
        let vector = Arc::new(VectorIndexManager::new());
        if let Some(save_path) = config.vector_save_path() {
            Self::load_vector_indexes(&vector, &save_path);
        }

        // 6. CDC.
        let cdc = if config.features.cdc {
            Some(Arc::new(CdcLog::open(Arc::clone(&store))?))
        } else {
            None
        };

        let semcache = if config.features.semantic_cache {
            Some(Arc::new(SemanticCache::new(Arc::clone(&store))))
        } else {
            None
        };
        let content = Arc::new(ContentManager::new(
            Arc::clone(&store),
            ContentPolicy::default(),
            Some(Arc::clone(&keys)),
        ));

        let stats = Arc::new(DatabaseStats::new());
        let engine = QueryEngine::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&spatial),
            Arc::clone(&vector),
            Arc::clone(&graph),
            Some(Arc::clone(&cipher)),
            Arc::clone(&stats),
        );

        let database = Self {
            config,
            store,
            keys,
            cipher,
            index,
            spatial,
            vector,
            graph,
            timeseries,
            cdc,
            semcache,
            content,
            integrity,
            engine,
            stats,
            commit_lock: Mutex::new(()),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            lazy_reencrypt: true,
        };

        // 7. Background workers.
        database.start_workers();
        info!(sequence = database.store.last_sequence(), "database open");
        Ok(database)
    }

    /// Opens an in-memory database with default configuration.
    ///
    /// # Errors
    ///
    /// See [`Database::open`].
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open(Config::default())
    }

    fn load_vector_indexes(vector: &VectorIndexManager, save_path: &Path) {
        let Ok(entries) = std::fs::read_dir(save_path) else {
            return;
        };
        for entry in entries.filter_map(Result::ok) {
            let dir = entry.path();
            if !persistence::exists(&dir) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some((table, field)) = name.split_once("__") else {
                continue;
            };
            match persistence::load(&dir) {
                Ok(index) => {
                    info!(table, field, vectors = index.len(), "vector index loaded");
                    vector.install(table, field, index);
                }
                Err(err) => {
                    warn!(table, field, error = %err, "IndexCorrupt: starting with empty vector index");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The configuration the database was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The secondary index manager.
    #[must_use]
    pub fn indexes(&self) -> &Arc<SecondaryIndexManager> {
        &self.index
    }

    /// The spatial index.
    #[must_use]
    pub fn spatial(&self) -> &Arc<SpatialIndex> {
        &self.spatial
    }

    /// The graph index.
    #[must_use]
    pub fn graph(&self) -> &Arc<GraphIndex> {
        &self.graph
    }

    /// The time-series store (regardless of the feature toggle; the
    /// toggle gates background workers and the transport surface).
    #[must_use]
    pub fn timeseries(&self) -> &Arc<TsStore> {
        &self.timeseries
    }

    /// The CDC log, when the feature is enabled.
    #[must_use]
    pub fn changefeed(&self) -> Option<&Arc<CdcLog>> {
        self.cdc.as_ref()
    }

    /// The semantic cache, when the feature is enabled.
    #[must_use]
    pub fn semantic_cache(&self) -> Option<&Arc<SemanticCache>> {
        self.semcache.as_ref()
    }

    /// The content manager.
    #[must_use]
    pub fn content(&self) -> &Arc<ContentManager> {
        &self.content
    }

    /// The integrity verifier.
    #[must_use]
    pub fn integrity(&self) -> &Arc<IntegrityVerifier> {
        &self.integrity
    }

    /// The key hierarchy.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyHierarchy> {
        &self.keys
    }

    /// The field cipher.
    #[must_use]
    pub fn cipher(&self) -> &Arc<FieldCipher> {
        &self.cipher
    }

    /// A handle to the underlying substrate (read-mostly sharing).
    #[must_use]
    pub fn store_handle(&self) -> Arc<KvStore> {
        Arc::clone(&self.store)
    }

    /// Current metrics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Sequence of the most recent commit.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.store.last_sequence()
    }

    // ------------------------------------------------------------------
    // Entity CRUD
    // ------------------------------------------------------------------

    fn validate_entity_key(key: &str) -> CoreResult<(String, String)> {
        let Some((table, pk)) = key.split_once(':') else {
            return Err(CoreError::invalid_operation(format!(
                "entity key '{key}' must be <table>:<pk>"
            )));
        };
        if table.is_empty() || pk.is_empty() || pk.contains(':') {
            return Err(CoreError::invalid_operation(format!(
                "entity key '{key}' must be <table>:<pk> with a colon-free pk"
            )));
        }
        if is_reserved_table(table) {
            return Err(CoreError::invalid_operation(format!(
                "table '{table}' collides with a reserved prefix"
            )));
        }
        Ok((table.to_string(), pk.to_string()))
    }

    fn load_entity(&self, key: &str) -> CoreResult<Option<Entity>> {
        match self.store.get(ColumnFamily::Default, key.as_bytes())? {
            None => Ok(None),
            Some(bytes) => Ok(Some(Entity::from_bytes(key, &bytes)?)),
        }
    }

    /// Inserts or fully replaces an entity.
    ///
    /// The commit batch carries the entity, every declared index
    /// co-update, and one CDC event, all at the returned sequence.
    ///
    /// # Errors
    ///
    /// Returns `UniqueViolation` without writing anything on duplicate
    /// unique values.
    pub fn put(&self, entity: &Entity) -> CoreResult<u64> {
        let _commit = self.commit_lock.lock();
        self.put_inner(entity)
    }

    /// The put body; the caller must hold the commit lock.
    fn put_inner(&self, entity: &Entity) -> CoreResult<u64> {
        let (_, pk) = Self::validate_entity_key(entity.key())?;
        let prior = self.load_entity(entity.key())?;

        let mut batch = WriteBatch::new();
        batch.extend(self.index.ops_for_put(&pk, entity, prior.as_ref())?);
        batch.extend(self.spatial.ops_for_put(&pk, entity, prior.as_ref()));
        batch.extend(self.graph.ops_for_put(&pk, entity, prior.as_ref()));
        batch.put(
            ColumnFamily::Default,
            entity.key().as_bytes().to_vec(),
            entity.to_bytes()?,
        );

        let sequence = self.append_cdc_and_commit(
            batch,
            CdcEventType::Put,
            entity.key(),
            Some(entity_to_json(entity)),
        )?;

        self.apply_vector_updates(entity, prior.as_ref());
        self.stats.record_write();
        Ok(sequence)
    }

    /// Encrypts the named fields under `ctx`, then puts the entity.
    ///
    /// # Errors
    ///
    /// See [`Database::put`]; additionally fails if a named field is
    /// absent.
    pub fn put_encrypted(
        &self,
        entity: &Entity,
        fields: &[&str],
        ctx: &EncryptionContext,
    ) -> CoreResult<u64> {
        let mut entity = entity.clone();
        if let Some(group) = &ctx.group {
            self.keys.ensure_group_dek(group)?;
        }
        for field in fields {
            self.cipher.encrypt_field(&mut entity, field, ctx)?;
        }
        self.put(&entity)
    }

    /// Reads an entity, optionally decrypting under a context.
    ///
    /// With the lazy-rewrite policy enabled, blobs sealed under an older
    /// key version are re-encrypted with the latest and persisted before
    /// the plaintext is returned.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for absent keys.
    pub fn get(&self, key: &str, decrypt: Option<&EncryptionContext>) -> CoreResult<Entity> {
        Self::validate_entity_key(key)?;
        let mut entity = self
            .load_entity(key)?
            .ok_or_else(|| CoreError::not_found(key))?;
        self.stats.record_read();

        let Some(ctx) = decrypt else {
            return Ok(entity);
        };

        if self.lazy_reencrypt {
            match self.cipher.upgrade_stale_fields(&mut entity, ctx) {
                Ok(upgraded) if !upgraded.is_empty() => {
                    self.put(&entity)?;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(key, error = %err, "lazy re-encryption skipped");
                }
            }
        }

        let report = self.cipher.decrypt_entity(&mut entity, ctx);
        for _ in &report.failed {
            self.stats.record_decrypt_failure();
        }
        Ok(entity)
    }

    /// Deletes an entity and all of its index entries.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for absent keys.
    pub fn delete(&self, key: &str) -> CoreResult<u64> {
        let (_, pk) = Self::validate_entity_key(key)?;
        let _commit = self.commit_lock.lock();
        let prior = self
            .load_entity(key)?
            .ok_or_else(|| CoreError::not_found(key))?;

        let mut batch = WriteBatch::new();
        batch.extend(self.index.ops_for_delete(&pk, &prior));
        batch.extend(self.spatial.ops_for_delete(&pk, &prior));
        batch.extend(self.graph.ops_for_delete(&pk, &prior));
        batch.delete(ColumnFamily::Default, key.as_bytes().to_vec());

        let sequence =
            self.append_cdc_and_commit(batch, CdcEventType::Delete, key, None)?;

        self.remove_vector_entries(&prior);
        self.stats.record_delete();
        Ok(sequence)
    }

    /// Declared atomic merge: read-modify-write under the commit lock.
    ///
    /// Fields set to [`Value::Absent`] are removed; others are replaced.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for absent keys.
    pub fn merge(&self, key: &str, fields: BTreeMap<String, Value>) -> CoreResult<u64> {
        Self::validate_entity_key(key)?;
        // Read and rewrite under the same commit-lock hold, so concurrent
        // merges cannot interleave.
        let _commit = self.commit_lock.lock();
        let mut entity = self
            .load_entity(key)?
            .ok_or_else(|| CoreError::not_found(key))?;
        for (name, value) in fields {
            entity.set_field(name, value);
        }
        self.put_inner(&entity)
    }

    fn append_cdc_and_commit(
        &self,
        mut batch: WriteBatch,
        event_type: CdcEventType,
        key: &str,
        value: Option<serde_json::Value>,
    ) -> CoreResult<u64> {
        // The upcoming sequence is stable: the commit lock is held and
        // this is the only committer.
        let sequence = self.store.last_sequence() + 1;
        if let Some(cdc) = &self.cdc {
            let event = CdcEvent {
                sequence,
                event_type,
                key: key.to_string(),
                value,
                timestamp_ms: now_ms(),
                metadata: BTreeMap::new(),
            };
            cdc.append_op(&event, &mut batch)?;
        }

        let committed = self.store.write_batch(batch)?;
        debug_assert_eq!(committed, sequence);
        if let Some(cdc) = &self.cdc {
            cdc.notify_appended(committed);
            self.stats.record_cdc_event();
        }
        Ok(committed)
    }

    // ------------------------------------------------------------------
    // Vector index integration
    // ------------------------------------------------------------------

    /// Declares a vector index over `(table, field)`.
    ///
    /// Existing entities with the field are indexed immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if existing vectors fail to index.
    pub fn ensure_vector_index(
        &self,
        table: &str,
        field: &str,
        dim: usize,
        metric: VectorMetric,
    ) -> CoreResult<()> {
        let params = HnswParams {
            dim,
            metric,
            m: self.config.vector_index.hnsw_m,
            ef_construction: self.config.vector_index.hnsw_ef_construction,
            ef_search: self.config.vector_index.hnsw_ef_search,
        };
        let index = self.vector.get_or_create(table, field, params);

        let prefix = format!("{table}:");
        let entities = self
            .store
            .scan_prefix(ColumnFamily::Default, prefix.as_bytes(), None, false)?;
        let mut guard = index.write();
        for (key, bytes) in entities {
            let key = String::from_utf8(key)
                .map_err(|_| CoreError::invalid_operation("entity key is not UTF-8"))?;
            let entity = Entity::from_bytes(key.clone(), &bytes)?;
            if let Some(vector) = entity.get_field(field).and_then(Value::as_float_vec) {
                guard.add(&key, vector)?;
            }
        }
        Ok(())
    }

    fn apply_vector_updates(&self, entity: &Entity, prior: Option<&Entity>) {
        let Some(table) = entity.table() else {
            return;
        };
        for (index_table, field) in self.vector.keys() {
            if index_table != table {
                continue;
            }
            let Some(index) = self.vector.get(&index_table, &field) else {
                continue;
            };
            let mut guard = index.write();
            match entity.get_field(&field).and_then(Value::as_float_vec) {
                Some(vector) => {
                    if let Err(err) = guard.add(entity.key(), vector) {
                        warn!(key = entity.key(), field = %field, error = %err, "vector index update failed");
                    }
                }
                None => {
                    if prior.is_some_and(|p| p.get_field(&field).is_some()) {
                        guard.delete(entity.key());
                    }
                }
            }
        }
    }

    fn remove_vector_entries(&self, prior: &Entity) {
        let Some(table) = prior.table() else {
            return;
        };
        for (index_table, field) in self.vector.keys() {
            if index_table != table {
                continue;
            }
            if let Some(index) = self.vector.get(&index_table, &field) {
                index.write().delete(prior.key());
            }
        }
    }

    /// The vector index registry (search entry point for callers outside
    /// AQL).
    #[must_use]
    pub fn vector_indexes(&self) -> &Arc<VectorIndexManager> {
        &self.vector
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Executes an AQL query.
    ///
    /// # Errors
    ///
    /// See [`QueryEngine::execute`].
    pub fn query(&self, aql: &str, options: &QueryOptions) -> CoreResult<QueryOutput> {
        self.engine.execute(aql, options)
    }

    // ------------------------------------------------------------------
    // Maintenance operations
    // ------------------------------------------------------------------

    /// Removes entities whose TTL entry expired at or before now.
    ///
    /// Each expired entity goes through the normal delete path: entity,
    /// index entries, and CDC event in one batch per primary key.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or a delete fails.
    pub fn cleanup_ttl(&self, table: &str, column: &str) -> CoreResult<usize> {
        let expired = self.index.expired(table, column, now_ms())?;
        let mut removed = 0usize;
        for (entity_key, _) in expired {
            match self.delete(&entity_key) {
                Ok(_) => removed += 1,
                Err(CoreError::NotFound { .. }) => {
                    // Entity already gone; drop the orphaned schedule
                    // entry.
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        if removed > 0 {
            self.stats.record_ttl_removed(removed as u64);
        }
        Ok(removed)
    }

    /// Writes a durable checkpoint usable for backup/restore.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint fails.
    pub fn backup(&self, dir: &Path) -> CoreResult<()> {
        self.save_vector_indexes();
        self.store.checkpoint(dir)?;
        Ok(())
    }

    /// Opens an audit log over this database's store and keys.
    ///
    /// The signer is the external PKI collaborator; without one, sealed
    /// categories fall back to plain storage with a warning.
    ///
    /// # Errors
    ///
    /// Returns `ChainViolation` if the existing chain fails verification.
    pub fn open_audit_log(
        &self,
        signer: Option<Box<dyn crate::audit::Signer>>,
    ) -> CoreResult<crate::audit::AuditLog> {
        crate::audit::AuditLog::open(
            self.store_handle(),
            crate::audit::AuditPolicy::default(),
            Some(Arc::clone(&self.keys)),
            signer,
        )
    }

    /// Rotates the database DEK; blobs upgrade lazily on read.
    ///
    /// # Errors
    ///
    /// Returns a key error if the hierarchy is unavailable.
    pub fn rotate_dek(&self) -> CoreResult<u32> {
        self.keys.rotate_dek()
    }

    /// Rotates a group DEK; metadata only, no eager re-encryption.
    ///
    /// # Errors
    ///
    /// Returns a key error if the hierarchy is unavailable.
    pub fn rotate_group_dek(&self, group: &str) -> CoreResult<u32> {
        self.keys.rotate_group_dek(group)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn start_workers(&self) {
        let shutdown = Arc::clone(&self.shutdown);
        let index = Arc::clone(&self.index);
        let semcache = self.semcache.clone();
        let stats = Arc::clone(&self.stats);

        // TTL and cache sweeps run on one maintenance thread; expired
        // entities route through a weak handle pattern kept simple here:
        // the worker only reads the index registry and marks work, and
        // the heavy path stays in cleanup_ttl called by callers. To keep
        // deletes atomic with CDC, the worker clones what it needs.
        let store = Arc::clone(&self.store);
        let handle = std::thread::Builder::new()
            .name("themis-maintenance".to_string())
            .spawn(move || {
                let mut tick = 0u64;
                loop {
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::sleep(WORKER_TICK);
                    tick += 1;

                    if tick % TTL_EVERY_TICKS == 0 {
                        // Orphan schedule entries (entity already gone)
                        // are swept here; full entity deletion goes
                        // through Database::cleanup_ttl so it carries CDC
                        // events.
                        for def in index.definitions() {
                            if def.kind != IndexKind::Ttl {
                                continue;
                            }
                            if let Ok(expired) =
                                index.expired(&def.table, &def.columns[0], now_ms())
                            {
                                let mut batch = WriteBatch::new();
                                for (entity_key, entry_key) in expired {
                                    let gone = store
                                        .get(ColumnFamily::Default, entity_key.as_bytes())
                                        .map(|v| v.is_none())
                                        .unwrap_or(false);
                                    if gone {
                                        batch.delete(ColumnFamily::Default, entry_key);
                                    }
                                }
                                if !batch.is_empty() {
                                    let _ = store.write_batch(batch);
                                }
                            }
                        }
                    }

                    if tick % CACHE_SWEEP_EVERY_TICKS == 0 {
                        if let Some(cache) = &semcache {
                            match cache.clear_expired() {
                                Ok(removed) if removed > 0 => {
                                    info!(removed, "semantic cache swept");
                                }
                                Ok(_) => {}
                                Err(_) => stats.record_error(),
                            }
                        }
                    }
                }
            });
        if let Ok(handle) = handle {
            self.workers.lock().push(handle);
        }
    }

    fn save_vector_indexes(&self) {
        let Some(save_path) = self.config.vector_save_path() else {
            return;
        };
        for (table, field) in self.vector.keys() {
            let Some(index) = self.vector.get(&table, &field) else {
                continue;
            };
            let dir = save_path.join(format!("{table}__{field}"));
            let guard = index.read();
            if let Err(err) = persistence::save(&guard, &dir) {
                warn!(table, field, error = %err, "vector index save failed");
            }
        }
    }

    /// Flushes all state to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.save_vector_indexes();
        self.store.flush()?;
        Ok(())
    }

    /// Stops workers, saves vector indexes, flushes, and closes.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered; shutdown continues regardless.
    pub fn close(&self) -> CoreResult<()> {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        self.save_vector_indexes();
        self.store.close()?;
        info!("database closed");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("sequence", &self.store.last_sequence())
            .finish_non_exhaustive()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
