//! Secondary indexing over the KV keyspace.
//!
//! Seven index kinds share one registry keyed by `(table, column, kind)`.
//! Index entries are deterministic functions of entity fields, so every
//! index is reconstructable from entities plus the registry. Entry updates
//! are emitted as batch operations that the orchestrator commits atomically
//! with the entity write and its CDC event.

pub mod fulltext;
pub mod keys;

use crate::error::{CoreError, CoreResult};
use crate::spatial::morton::{self, WorldBounds};
use fulltext::{unique_tokens, TokenizerConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use themis_codec::{Entity, Value};
use themis_storage::{ColumnFamily, KvStore, WriteBatch};
use tracing::{debug, warn};

/// Key prefixes reserved by the engine in the default column family.
///
/// Table names must not collide with these; the orchestrator rejects them
/// at write time.
pub const RESERVED_PREFIXES: &[&str] = &[
    "idx", "ridx", "sidx", "gidx", "ttlidx", "ftidx", "idxmeta", "kek", "dek", "key",
    "content_blob", "semantic_cache", "security_sig", "spatial", "graph", "ts",
    "changefeed", "audit",
];

/// Returns true if `table` collides with a reserved engine prefix.
#[must_use]
pub fn is_reserved_table(table: &str) -> bool {
    RESERVED_PREFIXES.contains(&table)
}

/// The kind of a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Exact-match index on one column.
    Equality,
    /// Exact-match index over several columns (`a+b`, value `a:b`).
    Composite,
    /// Ordered index for range scans (lex-safe encoded values).
    Range,
    /// Equality index that skips absent or empty values.
    Sparse,
    /// Morton-bucketed geo index over `<col>_lat` / `<col>_lon`.
    Geo,
    /// Expiry schedule over an absolute-milliseconds column.
    Ttl,
    /// Inverted fulltext postings.
    Fulltext,
}

impl IndexKind {
    /// Stable name used in registry keys.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            IndexKind::Equality => "equality",
            IndexKind::Composite => "composite",
            IndexKind::Range => "range",
            IndexKind::Sparse => "sparse",
            IndexKind::Geo => "geo",
            IndexKind::Ttl => "ttl",
            IndexKind::Fulltext => "fulltext",
        }
    }
}

/// A persisted index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Table the index covers.
    pub table: String,
    /// Indexed columns (one, except for composite).
    pub columns: Vec<String>,
    /// Index kind.
    pub kind: IndexKind,
    /// Whether the index rejects duplicate values across primary keys.
    pub unique: bool,
}

impl IndexDef {
    /// The registry column key (`a` or `a+b`).
    #[must_use]
    pub fn column_key(&self) -> String {
        keys::composite_column(&self.columns)
    }

    fn meta_key(&self) -> Vec<u8> {
        format!(
            "idxmeta:{}:{}:{}",
            self.table,
            self.column_key(),
            self.kind.name()
        )
        .into_bytes()
    }
}

type RegistryKey = (String, String, IndexKind);

/// Manages all secondary indexes.
///
/// Shares read access to the substrate and owns the `idx*`-prefixed key
/// ranges for writes.
pub struct SecondaryIndexManager {
    store: Arc<KvStore>,
    registry: RwLock<HashMap<RegistryKey, IndexDef>>,
    tokenizer: TokenizerConfig,
    bounds: WorldBounds,
}

impl SecondaryIndexManager {
    /// Creates a manager and loads persisted definitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub fn open(store: Arc<KvStore>) -> CoreResult<Self> {
        let manager = Self {
            store,
            registry: RwLock::new(HashMap::new()),
            tokenizer: TokenizerConfig::default(),
            bounds: WorldBounds::default(),
        };
        manager.load_registry()?;
        Ok(manager)
    }

    fn load_registry(&self) -> CoreResult<()> {
        let entries = self
            .store
            .scan_prefix(ColumnFamily::Default, b"idxmeta:", None, false)?;
        let mut registry = self.registry.write();
        for (_, value) in entries {
            let def: IndexDef = serde_json::from_slice(&value).map_err(|e| {
                CoreError::invalid_operation(format!("corrupt index definition: {e}"))
            })?;
            registry.insert((def.table.clone(), def.column_key(), def.kind), def);
        }
        debug!(indexes = registry.len(), "index registry loaded");
        Ok(())
    }

    /// Creates an index and builds entries for existing entities.
    ///
    /// # Errors
    ///
    /// Fails if an identical index already exists, if a composite index has
    /// fewer than two columns, or if building entries hits a unique
    /// violation in existing data.
    pub fn create_index(
        &self,
        kind: IndexKind,
        table: &str,
        columns: &[String],
        unique: bool,
    ) -> CoreResult<()> {
        if columns.is_empty() {
            return Err(CoreError::invalid_operation("index needs a column"));
        }
        if kind == IndexKind::Composite && columns.len() < 2 {
            return Err(CoreError::invalid_operation(
                "composite index needs at least two columns",
            ));
        }
        if kind != IndexKind::Composite && columns.len() != 1 {
            return Err(CoreError::invalid_operation(
                "non-composite index takes exactly one column",
            ));
        }
        if unique && !matches!(kind, IndexKind::Equality | IndexKind::Composite) {
            return Err(CoreError::invalid_operation(
                "unique applies to equality and composite indexes only",
            ));
        }

        let def = IndexDef {
            table: table.to_string(),
            columns: columns.to_vec(),
            kind,
            unique,
        };
        let registry_key = (def.table.clone(), def.column_key(), def.kind);

        {
            let registry = self.registry.read();
            if registry.contains_key(&registry_key) {
                return Err(CoreError::invalid_operation(format!(
                    "index on {}.{} ({}) already exists",
                    table,
                    def.column_key(),
                    kind.name()
                )));
            }
        }

        let meta = serde_json::to_vec(&def)
            .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
        self.store
            .put(ColumnFamily::Default, def.meta_key(), meta)?;
        self.registry.write().insert(registry_key, def.clone());

        self.rebuild_def(&def)?;
        Ok(())
    }

    /// Drops an index and deletes its entries.
    ///
    /// Returns false if no such index exists.
    ///
    /// # Errors
    ///
    /// Returns an error if entry deletion fails.
    pub fn drop_index(
        &self,
        kind: IndexKind,
        table: &str,
        columns: &[String],
    ) -> CoreResult<bool> {
        let column_key = keys::composite_column(columns);
        let registry_key = (table.to_string(), column_key.clone(), kind);

        let Some(def) = self.registry.write().remove(&registry_key) else {
            return Ok(false);
        };
        self.store
            .delete(ColumnFamily::Default, def.meta_key())?;
        self.delete_index_range(&def)?;
        Ok(true)
    }

    /// Returns every registered index definition.
    #[must_use]
    pub fn definitions(&self) -> Vec<IndexDef> {
        self.registry.read().values().cloned().collect()
    }

    /// Returns all index definitions covering a table.
    #[must_use]
    pub fn indexes_on(&self, table: &str) -> Vec<IndexDef> {
        self.registry
            .read()
            .values()
            .filter(|def| def.table == table)
            .cloned()
            .collect()
    }

    /// Looks up an index definition.
    #[must_use]
    pub fn index_for(&self, table: &str, column_key: &str, kind: IndexKind) -> Option<IndexDef> {
        self.registry
            .read()
            .get(&(table.to_string(), column_key.to_string(), kind))
            .cloned()
    }

    /// Returns the widest composite index whose leading columns match a set
    /// of equality predicates. Used by the planner.
    #[must_use]
    pub fn widest_composite(&self, table: &str, available: &[String]) -> Option<IndexDef> {
        let set: HashSet<&str> = available.iter().map(String::as_str).collect();
        self.registry
            .read()
            .values()
            .filter(|def| {
                def.table == table
                    && def.kind == IndexKind::Composite
                    && def.columns.iter().all(|c| set.contains(c.as_str()))
            })
            .max_by_key(|def| def.columns.len())
            .cloned()
    }

    // ------------------------------------------------------------------
    // Entry computation
    // ------------------------------------------------------------------

    /// Computes every index entry key (with payload) for an entity under a
    /// definition.
    fn entries_for(&self, def: &IndexDef, pk: &str, entity: &Entity) -> Vec<(Vec<u8>, Vec<u8>)> {
        let table = &def.table;
        match def.kind {
            IndexKind::Equality => {
                let column = &def.columns[0];
                match entity.get_field(column).and_then(Value::index_repr) {
                    Some(value) => vec![(keys::eq_key(table, column, &value, pk), Vec::new())],
                    None => Vec::new(),
                }
            }
            IndexKind::Composite => {
                let mut parts = Vec::with_capacity(def.columns.len());
                for column in &def.columns {
                    match entity.get_field(column).and_then(Value::index_repr) {
                        Some(value) => parts.push(value),
                        None => return Vec::new(),
                    }
                }
                let value = keys::composite_value(&parts);
                vec![(
                    keys::eq_key(table, &def.column_key(), &value, pk),
                    Vec::new(),
                )]
            }
            IndexKind::Range => {
                let column = &def.columns[0];
                match entity.get_field(column).and_then(keys::range_value) {
                    Some(value) => {
                        vec![(keys::range_key(table, column, &value, pk), Vec::new())]
                    }
                    None => Vec::new(),
                }
            }
            IndexKind::Sparse => {
                let column = &def.columns[0];
                match entity.get_field(column).and_then(Value::index_repr) {
                    Some(value) if !value.is_empty() => {
                        vec![(keys::sparse_key(table, column, &value, pk), Vec::new())]
                    }
                    _ => Vec::new(),
                }
            }
            IndexKind::Geo => {
                let column = &def.columns[0];
                let Some((lat, lon)) = geo_coordinates(entity, column) else {
                    return Vec::new();
                };
                let code = morton::encode(&self.bounds, lon, lat);
                vec![(
                    keys::geo_key(table, column, &morton::code_to_key(code), pk),
                    format!("{lat}:{lon}").into_bytes(),
                )]
            }
            IndexKind::Ttl => {
                let column = &def.columns[0];
                match entity.get_field(column).and_then(Value::as_int) {
                    Some(expiry) if expiry >= 0 => {
                        #[allow(clippy::cast_sign_loss)]
                        let expiry_ms = expiry as u64;
                        vec![(keys::ttl_key(table, column, expiry_ms, pk), Vec::new())]
                    }
                    Some(_) => {
                        warn!(table, column, pk, "negative TTL expiry skipped");
                        Vec::new()
                    }
                    None => Vec::new(),
                }
            }
            IndexKind::Fulltext => {
                let column = &def.columns[0];
                match entity.get_field(column).and_then(Value::as_str) {
                    Some(text) => unique_tokens(&self.tokenizer, text)
                        .into_iter()
                        .map(|token| {
                            (keys::fulltext_key(table, column, &token, pk), Vec::new())
                        })
                        .collect(),
                    None => Vec::new(),
                }
            }
        }
    }

    /// Builds the index co-update operations for an entity put.
    ///
    /// Prior entries are deleted and new entries inserted inside the same
    /// batch. Unique indexes are checked against current state first; on a
    /// violation nothing is written.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UniqueViolation`] if a unique value is already
    /// indexed under another primary key.
    pub fn ops_for_put(
        &self,
        pk: &str,
        entity: &Entity,
        prior: Option<&Entity>,
    ) -> CoreResult<WriteBatch> {
        let table = entity.table().ok_or_else(|| {
            CoreError::invalid_operation(format!("entity key '{}' has no table", entity.key()))
        })?;
        let defs = self.indexes_on(table);
        let mut batch = WriteBatch::new();

        // Unique checks happen before any op is emitted.
        for def in &defs {
            if !def.unique {
                continue;
            }
            for (key, _) in self.entries_for(def, pk, entity) {
                self.check_unique(def, &key, pk)?;
            }
        }

        for def in &defs {
            if let Some(prior) = prior {
                for (key, _) in self.entries_for(def, pk, prior) {
                    batch.delete(ColumnFamily::Default, key);
                }
            }
            for (key, payload) in self.entries_for(def, pk, entity) {
                batch.put(ColumnFamily::Default, key, payload);
            }
        }
        Ok(batch)
    }

    /// Builds the index operations removing every entry of a prior entity.
    #[must_use]
    pub fn ops_for_delete(&self, pk: &str, prior: &Entity) -> WriteBatch {
        let mut batch = WriteBatch::new();
        let Some(table) = prior.table() else {
            return batch;
        };
        for def in self.indexes_on(table) {
            for (key, _) in self.entries_for(&def, pk, prior) {
                batch.delete(ColumnFamily::Default, key);
            }
        }
        batch
    }

    fn check_unique(&self, def: &IndexDef, entry_key: &[u8], pk: &str) -> CoreResult<()> {
        // The entry key ends with `:pk`; the shared value prefix is
        // everything up to and including the last separator.
        let key_text = std::str::from_utf8(entry_key)
            .map_err(|_| CoreError::invalid_operation("index key is not UTF-8"))?;
        let (value_prefix, _) = key_text
            .rsplit_once(':')
            .ok_or_else(|| CoreError::invalid_operation("malformed index key"))?;
        let prefix = format!("{value_prefix}:");

        let existing = self
            .store
            .scan_prefix(ColumnFamily::Default, prefix.as_bytes(), None, false)?;
        for (key, _) in existing {
            let existing_pk = keys::pk_of_entry(&key)?;
            if existing_pk != pk {
                let value = value_prefix
                    .rsplit_once(':')
                    .map(|(_, v)| v.to_string())
                    .unwrap_or_default();
                return Err(CoreError::UniqueViolation {
                    table: def.table.clone(),
                    column: def.column_key(),
                    value,
                    existing_pk: format!("{}:{existing_pk}", def.table),
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scans
    // ------------------------------------------------------------------

    fn entity_key(table: &str, pk: &str) -> String {
        format!("{table}:{pk}")
    }

    /// Looks up primary keys by exact value.
    ///
    /// # Errors
    ///
    /// Returns an error if no equality index exists on the column.
    pub fn scan_equal(
        &self,
        table: &str,
        column: &str,
        value: &str,
        limit: Option<usize>,
    ) -> CoreResult<Vec<String>> {
        let def = self
            .index_for(table, column, IndexKind::Equality)
            .or_else(|| self.index_for(table, column, IndexKind::Sparse))
            .ok_or_else(|| {
                CoreError::invalid_operation(format!("no equality index on {table}.{column}"))
            })?;
        let prefix = match def.kind {
            IndexKind::Sparse => keys::sparse_prefix(table, column, value),
            _ => keys::eq_prefix(table, column, value),
        };
        let hits = self
            .store
            .scan_prefix(ColumnFamily::Default, &prefix, limit, false)?;
        hits.iter()
            .map(|(key, _)| Ok(Self::entity_key(table, &keys::pk_of_entry(key)?)))
            .collect()
    }

    /// Looks up primary keys by exact composite value.
    ///
    /// # Errors
    ///
    /// Returns an error if no matching composite index exists.
    pub fn scan_equal_composite(
        &self,
        table: &str,
        columns: &[String],
        values: &[String],
        limit: Option<usize>,
    ) -> CoreResult<Vec<String>> {
        if columns.len() != values.len() {
            return Err(CoreError::invalid_operation(
                "composite scan needs one value per column",
            ));
        }
        let column_key = keys::composite_column(columns);
        self.index_for(table, &column_key, IndexKind::Composite)
            .ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "no composite index on {table}.{column_key}"
                ))
            })?;
        let value = keys::composite_value(values);
        let prefix = keys::eq_prefix(table, &column_key, &value);
        let hits = self
            .store
            .scan_prefix(ColumnFamily::Default, &prefix, limit, false)?;
        hits.iter()
            .map(|(key, _)| Ok(Self::entity_key(table, &keys::pk_of_entry(key)?)))
            .collect()
    }

    /// Range scan over an ordered index.
    ///
    /// Bounds are entity field values; integers and doubles are compared
    /// numerically via their order-preserving encodings.
    ///
    /// # Errors
    ///
    /// Returns an error if no range index exists on the column.
    #[allow(clippy::too_many_arguments)]
    pub fn scan_range(
        &self,
        table: &str,
        column: &str,
        lo: Option<&Value>,
        hi: Option<&Value>,
        inclusive: (bool, bool),
        limit: Option<usize>,
        reverse: bool,
    ) -> CoreResult<Vec<String>> {
        self.index_for(table, column, IndexKind::Range).ok_or_else(|| {
            CoreError::invalid_operation(format!("no range index on {table}.{column}"))
        })?;

        let prefix = keys::range_prefix(table, column);
        let lo_bound = match lo {
            None => Bound::Included(prefix.clone()),
            Some(value) => {
                let encoded = keys::range_value(value).ok_or_else(|| {
                    CoreError::invalid_operation("value is not range-indexable")
                })?;
                let mut key = prefix.clone();
                key.extend_from_slice(encoded.as_bytes());
                if inclusive.0 {
                    Bound::Included(key)
                } else {
                    // Skip the whole `value:` block: `;` sorts just after `:`.
                    key.push(b';');
                    Bound::Included(key)
                }
            }
        };
        let hi_bound = match hi {
            None => Bound::Excluded(prefix_upper(&prefix)),
            Some(value) => {
                let encoded = keys::range_value(value).ok_or_else(|| {
                    CoreError::invalid_operation("value is not range-indexable")
                })?;
                let mut key = prefix.clone();
                key.extend_from_slice(encoded.as_bytes());
                if inclusive.1 {
                    key.push(b';');
                } else {
                    key.push(b':');
                }
                Bound::Excluded(key)
            }
        };

        let hits = self
            .store
            .scan_range(ColumnFamily::Default, lo_bound, hi_bound, limit, reverse)?;
        hits.iter()
            .map(|(key, _)| Ok(Self::entity_key(table, &keys::pk_of_entry(key)?)))
            .collect()
    }

    /// Fulltext search with AND semantics over query tokens.
    ///
    /// The limit applies after postings intersection.
    ///
    /// # Errors
    ///
    /// Returns an error if no fulltext index exists on the column.
    pub fn scan_fulltext(
        &self,
        table: &str,
        column: &str,
        query: &str,
        limit: Option<usize>,
    ) -> CoreResult<Vec<String>> {
        self.index_for(table, column, IndexKind::Fulltext)
            .ok_or_else(|| {
                CoreError::invalid_operation(format!("no fulltext index on {table}.{column}"))
            })?;

        let tokens = unique_tokens(&self.tokenizer, query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut postings: Vec<HashSet<String>> = Vec::with_capacity(tokens.len());
        for token in &tokens {
            let prefix = keys::fulltext_prefix(table, column, token);
            let hits = self
                .store
                .scan_prefix(ColumnFamily::Default, &prefix, None, false)?;
            let set: HashSet<String> = hits
                .iter()
                .map(|(key, _)| keys::pk_of_entry(key))
                .collect::<CoreResult<_>>()?;
            if set.is_empty() {
                return Ok(Vec::new());
            }
            postings.push(set);
        }

        // Intersect starting from the rarest token.
        postings.sort_by_key(HashSet::len);
        let mut result = postings.remove(0);
        for set in &postings {
            result.retain(|pk| set.contains(pk));
            if result.is_empty() {
                return Ok(Vec::new());
            }
        }

        let mut pks: Vec<String> = result
            .into_iter()
            .map(|pk| Self::entity_key(table, &pk))
            .collect();
        pks.sort();
        if let Some(limit) = limit {
            pks.truncate(limit);
        }
        Ok(pks)
    }

    /// Geo broadphase: entries inside the box's Morton range, refined by
    /// their stored coordinates.
    fn geo_candidates(
        &self,
        table: &str,
        column: &str,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    ) -> CoreResult<Vec<(String, f64, f64)>> {
        self.index_for(table, column, IndexKind::Geo).ok_or_else(|| {
            CoreError::invalid_operation(format!("no geo index on {table}.{column}"))
        })?;

        let (z_lo, z_hi) = morton::bbox_range(&self.bounds, min_x, min_y, max_x, max_y);
        let prefix = keys::geo_prefix(table, column);
        let mut lo_key = prefix.clone();
        lo_key.extend_from_slice(morton::code_to_key(z_lo).as_bytes());
        let mut hi_key = prefix.clone();
        hi_key.extend_from_slice(morton::code_to_key(z_hi).as_bytes());
        hi_key.push(b';');

        let hits = self.store.scan_range(
            ColumnFamily::Default,
            Bound::Included(lo_key),
            Bound::Excluded(hi_key),
            None,
            false,
        )?;

        let mut out = Vec::new();
        for (key, payload) in hits {
            let Some((lat, lon)) = parse_geo_payload(&payload) else {
                continue;
            };
            if lon >= min_x && lon <= max_x && lat >= min_y && lat <= max_y {
                out.push((Self::entity_key(table, &keys::pk_of_entry(&key)?), lat, lon));
            }
        }
        Ok(out)
    }

    /// Geo bounding-box search: Morton broadphase, coordinate refine.
    ///
    /// # Errors
    ///
    /// Returns an error if no geo index exists on the column.
    #[allow(clippy::too_many_arguments)]
    pub fn scan_geo_bbox(
        &self,
        table: &str,
        column: &str,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
        limit: Option<usize>,
    ) -> CoreResult<Vec<String>> {
        let mut out: Vec<String> = self
            .geo_candidates(table, column, min_x, min_y, max_x, max_y)?
            .into_iter()
            .map(|(key, _, _)| key)
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Geo radius search: bounding-box broadphase, Euclidean refine in
    /// coordinate space.
    ///
    /// # Errors
    ///
    /// Returns an error if no geo index exists on the column.
    pub fn scan_geo_radius(
        &self,
        table: &str,
        column: &str,
        x: f64,
        y: f64,
        distance: f64,
        limit: Option<usize>,
    ) -> CoreResult<Vec<String>> {
        let candidates = self.geo_candidates(
            table,
            column,
            x - distance,
            y - distance,
            x + distance,
            y + distance,
        )?;

        let mut out = Vec::new();
        for (entity_key, lat, lon) in candidates {
            let dx = lon - x;
            let dy = lat - y;
            if (dx * dx + dy * dy).sqrt() <= distance {
                out.push(entity_key);
                if limit.is_some_and(|l| out.len() >= l) {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Returns entities whose TTL entry expired at or before `now_ms`,
    /// with the entry keys that schedule them.
    ///
    /// # Errors
    ///
    /// Returns an error if no TTL index exists on the column.
    pub fn expired(
        &self,
        table: &str,
        column: &str,
        now_ms: u64,
    ) -> CoreResult<Vec<(String, Vec<u8>)>> {
        self.index_for(table, column, IndexKind::Ttl).ok_or_else(|| {
            CoreError::invalid_operation(format!("no ttl index on {table}.{column}"))
        })?;

        let prefix = keys::ttl_prefix(table, column);
        let mut hi = prefix.clone();
        hi.extend_from_slice(format!("{now_ms:0w$}", w = keys::SEQ_WIDTH).as_bytes());
        hi.push(b';');

        let hits = self.store.scan_range(
            ColumnFamily::Default,
            Bound::Included(prefix),
            Bound::Excluded(hi),
            None,
            false,
        )?;
        hits.into_iter()
            .map(|(key, _)| {
                let pk = keys::pk_of_entry(&key)?;
                Ok((Self::entity_key(table, &pk), key))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Rebuild
    // ------------------------------------------------------------------

    /// Rebuilds one index from entities, replacing its prior key range.
    ///
    /// # Errors
    ///
    /// Returns an error if the index does not exist or entities fail to
    /// decode.
    pub fn rebuild_index(
        &self,
        table: &str,
        column_key: &str,
        kind: IndexKind,
    ) -> CoreResult<()> {
        let def = self.index_for(table, column_key, kind).ok_or_else(|| {
            CoreError::invalid_operation(format!(
                "no {} index on {table}.{column_key}",
                kind.name()
            ))
        })?;
        self.delete_index_range(&def)?;
        self.rebuild_def(&def)
    }

    /// Rebuilds every index on a table.
    ///
    /// # Errors
    ///
    /// Returns an error if any rebuild fails.
    pub fn reindex_table(&self, table: &str) -> CoreResult<()> {
        for def in self.indexes_on(table) {
            self.delete_index_range(&def)?;
            self.rebuild_def(&def)?;
        }
        Ok(())
    }

    fn rebuild_def(&self, def: &IndexDef) -> CoreResult<()> {
        const CHUNK: usize = 512;
        let prefix = format!("{}:", def.table);
        let entities = self
            .store
            .scan_prefix(ColumnFamily::Default, prefix.as_bytes(), None, false)?;

        let mut batch = WriteBatch::new();
        for (key, bytes) in entities {
            let key_text = String::from_utf8(key)
                .map_err(|_| CoreError::invalid_operation("entity key is not UTF-8"))?;
            let entity = Entity::from_bytes(key_text.clone(), &bytes)?;
            if entity.is_tombstone() {
                continue;
            }
            let Some(pk) = entity.pk().map(str::to_string) else {
                continue;
            };
            for (entry_key, payload) in self.entries_for(def, &pk, &entity) {
                batch.put(ColumnFamily::Default, entry_key, payload);
                if batch.len() >= CHUNK {
                    self.store.write_batch(std::mem::take(&mut batch))?;
                }
            }
        }
        if !batch.is_empty() {
            self.store.write_batch(batch)?;
        }
        debug!(table = %def.table, column = %def.column_key(), kind = def.kind.name(), "index rebuilt");
        Ok(())
    }

    fn delete_index_range(&self, def: &IndexDef) -> CoreResult<()> {
        const CHUNK: usize = 512;
        let prefix = match def.kind {
            IndexKind::Equality | IndexKind::Composite => {
                format!("idx:{}:{}:", def.table, def.column_key()).into_bytes()
            }
            IndexKind::Range => keys::range_prefix(&def.table, &def.columns[0]),
            IndexKind::Sparse => format!("sidx:{}:{}:", def.table, def.columns[0]).into_bytes(),
            IndexKind::Geo => keys::geo_prefix(&def.table, &def.columns[0]),
            IndexKind::Ttl => keys::ttl_prefix(&def.table, &def.columns[0]),
            IndexKind::Fulltext => {
                format!("ftidx:{}:{}:", def.table, def.columns[0]).into_bytes()
            }
        };

        let entries = self
            .store
            .scan_prefix(ColumnFamily::Default, &prefix, None, false)?;
        let mut batch = WriteBatch::new();
        for (key, _) in entries {
            batch.delete(ColumnFamily::Default, key);
            if batch.len() >= CHUNK {
                self.store.write_batch(std::mem::take(&mut batch))?;
            }
        }
        if !batch.is_empty() {
            self.store.write_batch(batch)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SecondaryIndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryIndexManager")
            .field("indexes", &self.registry.read().len())
            .finish_non_exhaustive()
    }
}

/// Reads the `<col>_lat` / `<col>_lon` numeric-string fields of an entity.
///
/// Invalid numbers skip indexing with a warning (writes never fail for geo
/// reasons).
fn geo_coordinates(entity: &Entity, column: &str) -> Option<(f64, f64)> {
    let lat_field = format!("{column}_lat");
    let lon_field = format!("{column}_lon");
    let lat = numeric_field(entity, &lat_field);
    let lon = numeric_field(entity, &lon_field);
    match (lat, lon) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        _ => {
            if entity.get_field(&lat_field).is_some() || entity.get_field(&lon_field).is_some() {
                warn!(key = entity.key(), column, "invalid geo coordinates, skipping index entry");
            }
            None
        }
    }
}

fn numeric_field(entity: &Entity, field: &str) -> Option<f64> {
    match entity.get_field(field)? {
        Value::Str(s) => s.trim().parse().ok(),
        value => value.as_float(),
    }
}

fn parse_geo_payload(payload: &[u8]) -> Option<(f64, f64)> {
    let text = std::str::from_utf8(payload).ok()?;
    let (lat, lon) = text.split_once(':')?;
    Some((lat.parse().ok()?, lon.parse().ok()?))
}

/// Successor of a prefix for exclusive upper bounds.
fn prefix_upper(prefix: &[u8]) -> Vec<u8> {
    let mut upper = prefix.to_vec();
    while let Some(&last) = upper.last() {
        if last == 0xff {
            upper.pop();
        } else {
            *upper.last_mut().expect("non-empty") += 1;
            return upper;
        }
    }
    vec![0xff; 9]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<KvStore>, SecondaryIndexManager) {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let manager = SecondaryIndexManager::open(Arc::clone(&store)).unwrap();
        (store, manager)
    }

    fn put_entity(store: &KvStore, manager: &SecondaryIndexManager, entity: &Entity) {
        let pk = entity.pk().unwrap().to_string();
        let prior = store
            .get(ColumnFamily::Default, entity.key().as_bytes())
            .unwrap()
            .map(|bytes| Entity::from_bytes(entity.key(), &bytes).unwrap());
        let mut batch = manager
            .ops_for_put(&pk, entity, prior.as_ref())
            .unwrap();
        let mut full = WriteBatch::new();
        full.put(
            ColumnFamily::Default,
            entity.key().as_bytes().to_vec(),
            entity.to_bytes().unwrap(),
        );
        full.extend(std::mem::take(&mut batch));
        store.write_batch(full).unwrap();
    }

    fn user(pk: &str, email: &str) -> Entity {
        let mut e = Entity::new(format!("users:{pk}"));
        e.set_field("email", Value::from(email));
        e
    }

    #[test]
    fn equality_scan_finds_pk() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Equality, "users", &["email".to_string()], false)
            .unwrap();
        put_entity(&store, &manager, &user("alice", "a@x"));
        put_entity(&store, &manager, &user("bob", "b@x"));

        let hits = manager.scan_equal("users", "email", "a@x", None).unwrap();
        assert_eq!(hits, vec!["users:alice".to_string()]);
    }

    #[test]
    fn unique_violation_rejected_without_write() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Equality, "users", &["email".to_string()], true)
            .unwrap();
        put_entity(&store, &manager, &user("alice", "a@x"));

        let bob = user("bob", "a@x");
        let err = manager.ops_for_put("bob", &bob, None).unwrap_err();
        assert_eq!(err.kind(), "UniqueViolation");

        // Re-putting the same pk with the same value is fine.
        let alice = user("alice", "a@x");
        assert!(manager.ops_for_put("alice", &alice, Some(&alice)).is_ok());
    }

    #[test]
    fn put_replaces_prior_entries() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Equality, "users", &["email".to_string()], false)
            .unwrap();
        put_entity(&store, &manager, &user("alice", "old@x"));
        put_entity(&store, &manager, &user("alice", "new@x"));

        assert!(manager
            .scan_equal("users", "email", "old@x", None)
            .unwrap()
            .is_empty());
        assert_eq!(
            manager.scan_equal("users", "email", "new@x", None).unwrap(),
            vec!["users:alice".to_string()]
        );
    }

    #[test]
    fn delete_removes_entries() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Equality, "users", &["email".to_string()], false)
            .unwrap();
        let alice = user("alice", "a@x");
        put_entity(&store, &manager, &alice);

        let batch = manager.ops_for_delete("alice", &alice);
        store.write_batch(batch).unwrap();
        assert!(manager
            .scan_equal("users", "email", "a@x", None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn composite_index() {
        let (store, manager) = setup();
        let columns = vec!["city".to_string(), "zip".to_string()];
        manager
            .create_index(IndexKind::Composite, "users", &columns, false)
            .unwrap();

        let mut e = Entity::new("users:alice");
        e.set_field("city", Value::from("berlin"));
        e.set_field("zip", Value::from("10115"));
        put_entity(&store, &manager, &e);

        let hits = manager
            .scan_equal_composite(
                "users",
                &columns,
                &["berlin".to_string(), "10115".to_string()],
                None,
            )
            .unwrap();
        assert_eq!(hits, vec!["users:alice".to_string()]);

        // Missing any column means no entry.
        let mut partial = Entity::new("users:bob");
        partial.set_field("city", Value::from("berlin"));
        put_entity(&store, &manager, &partial);
        let hits = manager
            .scan_equal_composite(
                "users",
                &columns,
                &["berlin".to_string(), String::new()],
                None,
            )
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn range_scan_bounds() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Range, "orders", &["amount".to_string()], false)
            .unwrap();

        for (pk, amount) in [("a", 5i64), ("b", 10), ("c", 20), ("d", 30)] {
            let mut e = Entity::new(format!("orders:{pk}"));
            e.set_field("amount", Value::from(amount));
            put_entity(&store, &manager, &e);
        }

        // [10, 30) ascending
        let hits = manager
            .scan_range(
                "orders",
                "amount",
                Some(&Value::Int(10)),
                Some(&Value::Int(30)),
                (true, false),
                None,
                false,
            )
            .unwrap();
        assert_eq!(hits, vec!["orders:b".to_string(), "orders:c".to_string()]);

        // (10, 30] descending with limit
        let hits = manager
            .scan_range(
                "orders",
                "amount",
                Some(&Value::Int(10)),
                Some(&Value::Int(30)),
                (false, true),
                Some(1),
                true,
            )
            .unwrap();
        assert_eq!(hits, vec!["orders:d".to_string()]);

        // Unbounded low
        let hits = manager
            .scan_range(
                "orders",
                "amount",
                None,
                Some(&Value::Int(5)),
                (true, true),
                None,
                false,
            )
            .unwrap();
        assert_eq!(hits, vec!["orders:a".to_string()]);

        // Negative values order correctly
        let mut e = Entity::new("orders:neg");
        e.set_field("amount", Value::from(-7i64));
        put_entity(&store, &manager, &e);
        let hits = manager
            .scan_range("orders", "amount", None, None, (true, true), None, false)
            .unwrap();
        assert_eq!(hits[0], "orders:neg");
    }

    #[test]
    fn sparse_skips_empty() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Sparse, "users", &["nickname".to_string()], false)
            .unwrap();

        let mut with = Entity::new("users:a");
        with.set_field("nickname", Value::from("ace"));
        put_entity(&store, &manager, &with);

        let mut empty = Entity::new("users:b");
        empty.set_field("nickname", Value::from(""));
        put_entity(&store, &manager, &empty);

        let without = Entity::new("users:c");
        put_entity(&store, &manager, &without);

        assert_eq!(
            manager.scan_equal("users", "nickname", "ace", None).unwrap(),
            vec!["users:a".to_string()]
        );
        assert!(manager
            .scan_equal("users", "nickname", "", None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn fulltext_and_semantics() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Fulltext, "docs", &["body".to_string()], false)
            .unwrap();

        for (pk, body) in [
            ("1", "the quick brown fox"),
            ("2", "the lazy dog"),
            ("3", "quick dog tricks"),
        ] {
            let mut e = Entity::new(format!("docs:{pk}"));
            e.set_field("body", Value::from(body));
            put_entity(&store, &manager, &e);
        }

        let hits = manager.scan_fulltext("docs", "body", "quick", None).unwrap();
        assert_eq!(hits, vec!["docs:1".to_string(), "docs:3".to_string()]);

        let hits = manager
            .scan_fulltext("docs", "body", "quick dog", None)
            .unwrap();
        assert_eq!(hits, vec!["docs:3".to_string()]);

        let hits = manager
            .scan_fulltext("docs", "body", "quick elephant", None)
            .unwrap();
        assert!(hits.is_empty());

        let hits = manager
            .scan_fulltext("docs", "body", "the", Some(1))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn geo_bbox_and_radius() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Geo, "places", &["loc".to_string()], false)
            .unwrap();

        for (pk, lat, lon) in [
            ("berlin", "52.52", "13.40"),
            ("munich", "48.14", "11.58"),
            ("tokyo", "35.68", "139.69"),
        ] {
            let mut e = Entity::new(format!("places:{pk}"));
            e.set_field("loc_lat", Value::from(lat));
            e.set_field("loc_lon", Value::from(lon));
            put_entity(&store, &manager, &e);
        }

        // Germany-ish box.
        let hits = manager
            .scan_geo_bbox("places", "loc", 5.0, 47.0, 15.0, 55.0, None)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.contains(&"places:berlin".to_string()));
        assert!(hits.contains(&"places:munich".to_string()));

        // Tight radius around Berlin.
        let hits = manager
            .scan_geo_radius("places", "loc", 13.40, 52.52, 1.0, None)
            .unwrap();
        assert_eq!(hits, vec!["places:berlin".to_string()]);
    }

    #[test]
    fn invalid_geo_coordinates_skip_entry() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Geo, "places", &["loc".to_string()], false)
            .unwrap();

        let mut e = Entity::new("places:bad");
        e.set_field("loc_lat", Value::from("not-a-number"));
        e.set_field("loc_lon", Value::from("13.4"));
        // Write must succeed despite the bad coordinate.
        put_entity(&store, &manager, &e);

        let hits = manager
            .scan_geo_bbox("places", "loc", -180.0, -90.0, 180.0, 90.0, None)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn ttl_expired_selection() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Ttl, "sessions", &["expires".to_string()], false)
            .unwrap();

        for (pk, expiry) in [("old", 100i64), ("older", 50), ("fresh", 10_000)] {
            let mut e = Entity::new(format!("sessions:{pk}"));
            e.set_field("expires", Value::from(expiry));
            put_entity(&store, &manager, &e);
        }

        let expired = manager.expired("sessions", "expires", 500).unwrap();
        let keys: Vec<&str> = expired.iter().map(|(k, _)| k.as_str()).collect();
        // Ordered by expiry ascending.
        assert_eq!(keys, vec!["sessions:older", "sessions:old"]);
    }

    #[test]
    fn rebuild_is_idempotent() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Equality, "users", &["email".to_string()], false)
            .unwrap();
        put_entity(&store, &manager, &user("alice", "a@x"));
        put_entity(&store, &manager, &user("bob", "b@x"));

        let before = store
            .scan_prefix(ColumnFamily::Default, b"idx:users:", None, false)
            .unwrap();

        manager
            .rebuild_index("users", "email", IndexKind::Equality)
            .unwrap();
        let after = store
            .scan_prefix(ColumnFamily::Default, b"idx:users:", None, false)
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn registry_survives_reopen() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Equality, "users", &["email".to_string()], true)
            .unwrap();
        drop(manager);

        let manager = SecondaryIndexManager::open(store).unwrap();
        let def = manager
            .index_for("users", "email", IndexKind::Equality)
            .unwrap();
        assert!(def.unique);
    }

    #[test]
    fn widest_composite_selection() {
        let (_, manager) = setup();
        manager
            .create_index(
                IndexKind::Composite,
                "users",
                &["a".to_string(), "b".to_string()],
                false,
            )
            .unwrap();
        manager
            .create_index(
                IndexKind::Composite,
                "users",
                &["a".to_string(), "b".to_string(), "c".to_string()],
                false,
            )
            .unwrap();

        let available = vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "d".to_string(),
        ];
        let def = manager.widest_composite("users", &available).unwrap();
        assert_eq!(def.columns.len(), 3);

        let narrow = vec!["a".to_string(), "b".to_string()];
        let def = manager.widest_composite("users", &narrow).unwrap();
        assert_eq!(def.columns.len(), 2);
    }

    #[test]
    fn drop_index_removes_entries() {
        let (store, manager) = setup();
        manager
            .create_index(IndexKind::Equality, "users", &["email".to_string()], false)
            .unwrap();
        put_entity(&store, &manager, &user("alice", "a@x"));

        assert!(manager
            .drop_index(IndexKind::Equality, "users", &["email".to_string()])
            .unwrap());
        let entries = store
            .scan_prefix(ColumnFamily::Default, b"idx:users:", None, false)
            .unwrap();
        assert!(entries.is_empty());
        assert!(manager.scan_equal("users", "email", "a@x", None).is_err());
    }

    #[test]
    fn create_index_builds_existing_entities() {
        let (store, manager) = setup();
        // Entity exists before the index does.
        let alice = user("alice", "a@x");
        store
            .put(
                ColumnFamily::Default,
                alice.key().as_bytes().to_vec(),
                alice.to_bytes().unwrap(),
            )
            .unwrap();

        manager
            .create_index(IndexKind::Equality, "users", &["email".to_string()], false)
            .unwrap();
        assert_eq!(
            manager.scan_equal("users", "email", "a@x", None).unwrap(),
            vec!["users:alice".to_string()]
        );
    }

    #[test]
    fn reserved_tables() {
        assert!(is_reserved_table("idx"));
        assert!(is_reserved_table("changefeed"));
        assert!(!is_reserved_table("users"));
    }
}
