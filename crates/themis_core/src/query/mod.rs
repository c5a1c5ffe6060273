//! Query engine: planning, candidate selection, materialization, shaping.
//!
//! Execution of a parsed query follows the plan pipeline: conjunctive
//! predicate extraction, index selection (widest composite preferred),
//! candidate intersection, batched entity materialization with residual
//! post-filters and permission-gated decryption, then
//! COLLECT/SORT/LIMIT/RETURN shaping. Hybrid plans combine the spatial,
//! fulltext, vector, and graph paths; every plan records its cost
//! attributes for tracing.

pub mod cte;
pub mod eval;
pub mod plan;

use crate::aql::{self, AggregateFn, Direction, Expr, ForSource, Query};
use crate::crypto::{EncryptionContext, FieldCipher};
use crate::error::{CoreError, CoreResult};
use crate::graph::GraphIndex;
use crate::index::{IndexKind, SecondaryIndexManager};
use crate::spatial::SpatialIndex;
use crate::stats::DatabaseStats;
use crate::vector::VectorIndexManager;
use cte::CteCache;
use eval::{cmp_json, entity_to_json, eval, truthy, Env, SubqueryExec};
use plan::{ConjunctiveQuery, PlanTrace};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use themis_codec::Entity;
use themis_storage::{ColumnFamily, KvStore};
use tracing::debug;

/// Row-count threshold above which a CTE is materialized instead of
/// inlined.
const CTE_MATERIALIZE_ROWS: usize = 10_000;

/// Per-query execution options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Bind parameters.
    pub params: HashMap<String, Json>,
    /// Optional deadline; exceeding it returns `Timeout` without writes.
    pub deadline: Option<Instant>,
    /// Decrypt loaded entities under this context.
    pub decrypt: Option<EncryptionContext>,
}

/// A query result with its recorded plan.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    /// Result rows in final order.
    pub rows: Vec<Json>,
    /// Recorded plan attributes.
    pub trace: PlanTrace,
}

/// The query engine.
pub struct QueryEngine {
    store: Arc<KvStore>,
    index: Arc<SecondaryIndexManager>,
    spatial: Arc<SpatialIndex>,
    vector: Arc<VectorIndexManager>,
    graph: Arc<GraphIndex>,
    cipher: Option<Arc<FieldCipher>>,
    cte_cache: CteCache,
    stats: Arc<DatabaseStats>,
}

impl QueryEngine {
    /// Creates an engine over the given subsystems.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<KvStore>,
        index: Arc<SecondaryIndexManager>,
        spatial: Arc<SpatialIndex>,
        vector: Arc<VectorIndexManager>,
        graph: Arc<GraphIndex>,
        cipher: Option<Arc<FieldCipher>>,
        stats: Arc<DatabaseStats>,
    ) -> Self {
        Self {
            store,
            index,
            spatial,
            vector,
            graph,
            cipher,
            cte_cache: CteCache::with_default_budget(),
            stats,
        }
    }

    /// Parses and executes AQL text.
    ///
    /// # Errors
    ///
    /// Returns `Parse`, `Plan`, `Timeout`, `Cardinality`, or storage
    /// errors.
    pub fn execute(&self, text: &str, options: &QueryOptions) -> CoreResult<QueryOutput> {
        self.stats.record_query();
        let query = aql::parse(text)?;
        self.execute_query(&query, &Env::new(), options)
    }

    fn check_deadline(options: &QueryOptions) -> CoreResult<()> {
        if let Some(deadline) = options.deadline {
            let now = Instant::now();
            if now >= deadline {
                let over = now.duration_since(deadline).as_millis();
                return Err(CoreError::Timeout {
                    elapsed_ms: u64::try_from(over).unwrap_or(u64::MAX),
                });
            }
        }
        Ok(())
    }

    /// Executes a parsed query under bindings.
    ///
    /// # Errors
    ///
    /// See [`QueryEngine::execute`].
    pub fn execute_query(
        &self,
        query: &Query,
        outer: &Env,
        options: &QueryOptions,
    ) -> CoreResult<QueryOutput> {
        Self::check_deadline(options)?;
        let mut env = outer.clone();

        // CTEs: materialize when referenced more than once, when they
        // aggregate, or when their estimated row count is large; otherwise
        // execute inline at bind time.
        for cte in &query.with {
            let refs = count_variable_refs(query, &cte.name);
            let aggregates = cte.query.collect.is_some();
            let estimated = self.estimate_query_rows(&cte.query)?;
            let materialize = refs > 1 || aggregates || estimated > CTE_MATERIALIZE_ROWS;

            let rows = if materialize {
                let key = self.cte_cache_key(cte, options);
                match self.cte_cache.get(&key)? {
                    Some(rows) => rows,
                    None => {
                        let rows = self.execute_query(&cte.query, &env, options)?.rows;
                        self.cte_cache.put(&key, &rows)?;
                        rows
                    }
                }
            } else {
                self.execute_query(&cte.query, &env, options)?.rows
            };
            env.bind(cte.name.clone(), Json::Array(rows));
        }

        self.run_body(query, env, options)
    }

    fn cte_cache_key(&self, cte: &aql::Cte, options: &QueryOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}", cte.query).as_bytes());
        let mut params: Vec<(&String, &Json)> = options.params.iter().collect();
        params.sort_by_key(|(name, _)| (*name).clone());
        for (name, value) in params {
            hasher.update(name.as_bytes());
            hasher.update(value.to_string().as_bytes());
        }
        // Invalidate on any newer commit.
        hasher.update(self.store.last_sequence().to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn estimate_query_rows(&self, query: &Query) -> CoreResult<usize> {
        let Some(first) = query.for_nodes.first() else {
            return Ok(1);
        };
        match &first.source {
            ForSource::Collection(table) => self.estimate_table_rows(table),
            _ => Ok(1),
        }
    }

    fn estimate_table_rows(&self, table: &str) -> CoreResult<usize> {
        let prefix = format!("{table}:");
        let sample = self.store.scan_prefix(
            ColumnFamily::Default,
            prefix.as_bytes(),
            Some(CTE_MATERIALIZE_ROWS + 1),
            false,
        )?;
        Ok(sample.len())
    }

    // ------------------------------------------------------------------
    // Body execution
    // ------------------------------------------------------------------

    fn run_body(
        &self,
        query: &Query,
        base_env: Env,
        options: &QueryOptions,
    ) -> CoreResult<QueryOutput> {
        let mut trace = PlanTrace::default();
        let mut rows: Vec<Env> = vec![base_env];

        for (position, node) in query.for_nodes.iter().enumerate() {
            Self::check_deadline(options)?;
            let mut expanded = Vec::new();
            for env in rows {
                let bindings = if position == 0 {
                    self.primary_bindings(query, node, &env, options, &mut trace)?
                } else {
                    self.secondary_bindings(node, &env, options)?
                };
                for value in bindings {
                    let mut next = env.clone();
                    next.bind(node.var.clone(), value);
                    expanded.push(next);
                }
            }
            rows = expanded;
        }

        // LET bindings in source order.
        for binding in &query.lets {
            Self::check_deadline(options)?;
            for env in &mut rows {
                let value = eval(&binding.expr, env, &options.params, Some(&Shim(self, options)))?;
                env.bind(binding.name.clone(), value);
            }
        }

        // Residual filters: every FILTER is re-checked, so index pushdown
        // is purely an optimization.
        let mut filtered = Vec::with_capacity(rows.len());
        for env in rows {
            Self::check_deadline(options)?;
            let mut keep = true;
            for filter in &query.filters {
                let value = eval(filter, &env, &options.params, Some(&Shim(self, options)))?;
                if !truthy(&value) {
                    keep = false;
                    break;
                }
            }
            if keep {
                filtered.push(env);
            }
        }
        let mut rows = filtered;

        // COLLECT / AGGREGATE: hash group-by.
        if let Some(collect) = &query.collect {
            rows = self.apply_collect(collect, rows, options)?;
        }

        // SORT.
        if !query.sort.is_empty() {
            let mut keyed: Vec<(Vec<Json>, Env)> = Vec::with_capacity(rows.len());
            for env in rows {
                let mut keys = Vec::with_capacity(query.sort.len());
                for spec in &query.sort {
                    keys.push(eval(&spec.expr, &env, &options.params, Some(&Shim(self, options)))?);
                }
                keyed.push((keys, env));
            }
            keyed.sort_by(|(a, _), (b, _)| {
                for (spec, (ka, kb)) in query.sort.iter().zip(a.iter().zip(b.iter())) {
                    let ordering = cmp_json(ka, kb).unwrap_or(std::cmp::Ordering::Equal);
                    let ordering = if spec.descending {
                        ordering.reverse()
                    } else {
                        ordering
                    };
                    if ordering != std::cmp::Ordering::Equal {
                        return ordering;
                    }
                }
                std::cmp::Ordering::Equal
            });
            rows = keyed.into_iter().map(|(_, env)| env).collect();
        }

        // LIMIT.
        if let Some(limit) = query.limit {
            let offset = usize::try_from(limit.offset).unwrap_or(usize::MAX);
            let count = usize::try_from(limit.count).unwrap_or(usize::MAX);
            rows = rows.into_iter().skip(offset).take(count).collect();
        }

        // RETURN projection.
        let return_expr = query
            .return_expr
            .as_ref()
            .ok_or_else(|| CoreError::plan("query has no RETURN clause"))?;
        let mut projected = Vec::with_capacity(rows.len());
        for env in &rows {
            projected.push(eval(return_expr, env, &options.params, Some(&Shim(self, options)))?);
        }

        Ok(QueryOutput {
            rows: projected,
            trace,
        })
    }

    /// Candidate selection and materialization for the outermost `FOR`.
    fn primary_bindings(
        &self,
        query: &Query,
        node: &aql::ForNode,
        env: &Env,
        options: &QueryOptions,
        trace: &mut PlanTrace,
    ) -> CoreResult<Vec<Json>> {
        match &node.source {
            ForSource::Collection(table) => {
                let cq = plan::extract(query, &node.var, &options.params)?;
                let candidates = self.plan_candidates(table, query, &cq, options, trace)?;
                let keys = match candidates {
                    Some(keys) => keys,
                    None => {
                        trace.strategy = "table_scan".to_string();
                        self.stats.record_table_scan();
                        self.table_keys(table)?
                    }
                };
                trace.entities_loaded = keys.len();
                self.load_rows(&keys, options)
            }
            other => self.bindings_for_source(other, env, options, Some((query, trace))),
        }
    }

    fn secondary_bindings(
        &self,
        node: &aql::ForNode,
        env: &Env,
        options: &QueryOptions,
    ) -> CoreResult<Vec<Json>> {
        match &node.source {
            ForSource::Collection(table) => {
                self.stats.record_table_scan();
                let keys = self.table_keys(table)?;
                self.load_rows(&keys, options)
            }
            other => self.bindings_for_source(other, env, options, None),
        }
    }

    fn bindings_for_source(
        &self,
        source: &ForSource,
        env: &Env,
        options: &QueryOptions,
        planning: Option<(&Query, &mut PlanTrace)>,
    ) -> CoreResult<Vec<Json>> {
        match source {
            ForSource::Collection(_) => unreachable!("handled by callers"),
            ForSource::Variable(name) => match env.get(name) {
                Some(Json::Array(items)) => Ok(items.clone()),
                Some(other) => Ok(vec![other.clone()]),
                None => Err(CoreError::plan(format!("unbound source variable {name}"))),
            },
            ForSource::Subquery(subquery) => {
                Ok(self.execute_query(subquery, env, options)?.rows)
            }
            ForSource::Traversal {
                direction,
                start,
                edges,
                min_depth,
                max_depth,
            } => {
                let start = self.eval_vertex_key(start, env, options)?;
                let vertices = self.graph.bfs(
                    &start,
                    *direction,
                    edges,
                    *min_depth,
                    *max_depth,
                    None,
                )?;
                self.load_rows(&vertices, options)
            }
            ForSource::ShortestPath {
                direction,
                start,
                target,
                edges,
            } => {
                let start = self.eval_vertex_key(start, env, options)?;
                let target = self.eval_vertex_key(target, env, options)?;

                let mut allowed = None;
                if let Some((query, trace)) = planning {
                    allowed = self.shortest_path_constraint(&start, query, options)?;
                    let (branching, fanout) =
                        self.graph.estimate_branching(&start, *direction, edges)?;
                    trace.branching_estimate = Some(branching);
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let expanded = (fanout as f64 * branching.max(1.0).powi(4)) as u64;
                    trace.expanded_estimate = Some(expanded);
                    trace.strategy = if allowed.is_some() {
                        "graph+geo".to_string()
                    } else {
                        "shortest_path".to_string()
                    };
                }

                let path = self.graph.shortest_path(
                    &start,
                    &target,
                    *direction,
                    edges,
                    allowed.as_ref(),
                )?;
                match path {
                    Some(path) => self.load_rows(&path.vertices, options),
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    /// Spatial constraint pushdown for graph+geo shortest paths: vertices
    /// outside the query box are pruned during expansion.
    fn shortest_path_constraint(
        &self,
        start: &str,
        query: &Query,
        options: &QueryOptions,
    ) -> CoreResult<Option<HashSet<String>>> {
        // The spatial FILTER applies to the traversal variable.
        let Some(node) = query.for_nodes.first() else {
            return Ok(None);
        };
        let cq = plan::extract(query, &node.var, &options.params)?;
        let Some(spatial) = cq.spatial_pred else {
            return Ok(None);
        };
        let Some(table) = start.split_once(':').map(|(table, _)| table) else {
            return Ok(None);
        };
        self.stats.record_spatial_search();
        let keys = self.spatial.search_intersects(table, &spatial.bbox)?;
        Ok(Some(keys.into_iter().collect()))
    }

    fn eval_vertex_key(
        &self,
        expr: &Expr,
        env: &Env,
        options: &QueryOptions,
    ) -> CoreResult<String> {
        let value = eval(expr, env, &options.params, Some(&Shim(self, options)))?;
        match value {
            Json::String(key) => Ok(key),
            other => Err(CoreError::plan(format!(
                "traversal start must be a vertex key string, got {other}"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Candidate selection
    // ------------------------------------------------------------------

    /// Produces the candidate entity-key set for the primary collection,
    /// or `None` for a full scan.
    fn plan_candidates(
        &self,
        table: &str,
        query: &Query,
        cq: &ConjunctiveQuery,
        options: &QueryOptions,
        trace: &mut PlanTrace,
    ) -> CoreResult<Option<Vec<String>>> {
        let mut sets: Vec<Vec<String>> = Vec::new();
        let mut strategies: Vec<&str> = Vec::new();

        // Equality predicates: prefer the widest matching composite.
        let mut remaining_eq: Vec<&plan::EqPred> = cq.eq_preds.iter().collect();
        let eq_columns: Vec<String> = cq.eq_preds.iter().map(|p| p.column.clone()).collect();
        if let Some(composite) = self.index.widest_composite(table, &eq_columns) {
            let values: Option<Vec<String>> = composite
                .columns
                .iter()
                .map(|column| {
                    cq.eq_preds
                        .iter()
                        .find(|p| &p.column == column)
                        .map(|p| p.value.clone())
                })
                .collect();
            if let Some(values) = values {
                self.stats.record_index_lookup();
                sets.push(self.index.scan_equal_composite(
                    table,
                    &composite.columns,
                    &values,
                    None,
                )?);
                trace.composite_prefilter_applied = true;
                strategies.push("composite");
                remaining_eq.retain(|p| !composite.columns.contains(&p.column));
            }
        }
        for pred in remaining_eq {
            let has_index = self
                .index
                .index_for(table, &pred.column, IndexKind::Equality)
                .or_else(|| self.index.index_for(table, &pred.column, IndexKind::Sparse))
                .is_some();
            if has_index {
                self.stats.record_index_lookup();
                sets.push(self.index.scan_equal(table, &pred.column, &pred.value, None)?);
                strategies.push("equality");
            }
        }

        // Range predicates.
        for pred in &cq.range_preds {
            if self
                .index
                .index_for(table, &pred.column, IndexKind::Range)
                .is_none()
            {
                continue;
            }
            self.stats.record_index_lookup();
            let lo = pred.lo.as_ref().map(json_to_field_value).transpose()?;
            let hi = pred.hi.as_ref().map(json_to_field_value).transpose()?;
            sets.push(self.index.scan_range(
                table,
                &pred.column,
                lo.as_ref(),
                hi.as_ref(),
                pred.inclusive,
                None,
                false,
            )?);
            strategies.push("range");
        }

        // Fulltext.
        let mut fulltext_hits: Option<usize> = None;
        if let Some(pred) = &cq.fulltext_pred {
            if self
                .index
                .index_for(table, &pred.column, IndexKind::Fulltext)
                .is_some()
            {
                self.stats.record_index_lookup();
                let hits = self.index.scan_fulltext(table, &pred.column, &pred.query, None)?;
                fulltext_hits = Some(hits.len());
                #[allow(clippy::cast_precision_loss)]
                {
                    trace.fulltext_first_cost = Some(hits.len() as f64);
                }
                sets.push(hits);
                strategies.push("fulltext");
            }
        }

        // Spatial: the entity geometry slot goes through the spatial
        // index; `<col>_lat`/`<col>_lon` columns go through the geo index.
        if let Some(pred) = &cq.spatial_pred {
            self.stats.record_spatial_search();
            let table_rows = self.estimate_table_rows(table)?;
            let world_area = 360.0 * 180.0;
            #[allow(clippy::cast_precision_loss)]
            let spatial_cost = (pred.bbox.area() / world_area) * table_rows as f64;
            trace.spatial_first_cost = Some(spatial_cost);

            let hits = if pred.column == crate::spatial::GEOMETRY_FIELD {
                if pred.within {
                    self.spatial.search_within(table, &pred.bbox, None)?
                } else {
                    self.spatial.search_intersects(table, &pred.bbox)?
                }
            } else {
                self.index.scan_geo_bbox(
                    table,
                    &pred.column,
                    pred.bbox.min_x,
                    pred.bbox.min_y,
                    pred.bbox.max_x,
                    pred.bbox.max_y,
                    None,
                )?
            };
            sets.push(hits);
            strategies.push("spatial");
        }

        // PROXIMITY(...) < d residuals contribute a broadphase box.
        let primary_var = query.for_nodes.first().map(|node| node.var.clone());
        for residual in &cq.residual {
            let Some(var) = primary_var.as_deref() else {
                break;
            };
            if let Some((column, bbox)) = plan::proximity_bbox(residual, var, &options.params)
            {
                self.stats.record_spatial_search();
                let hits = if column == crate::spatial::GEOMETRY_FIELD {
                    self.spatial.search_intersects(table, &bbox)?
                } else {
                    self.index.scan_geo_bbox(
                        table,
                        &column,
                        bbox.min_x,
                        bbox.min_y,
                        bbox.max_x,
                        bbox.max_y,
                        None,
                    )?
                };
                sets.push(hits);
                strategies.push("proximity");
            }
        }

        // Content+geo ordering decision (recorded; intersection is
        // order-independent).
        if let (Some(fulltext), Some(spatial)) = (fulltext_hits, trace.spatial_first_cost) {
            #[allow(clippy::cast_precision_loss)]
            let fulltext_cost = fulltext as f64;
            strategies.push(if fulltext_cost <= spatial {
                "content+geo:fulltext_first"
            } else {
                "content+geo:spatial_first"
            });
        }

        // Vector ordering: ANN over the intersected whitelist.
        if let Some(sort) = &cq.vector_sort {
            if let Some(index) = self.vector.get(table, &sort.field) {
                self.stats.record_vector_search();
                let whitelist: Option<HashSet<String>> = if sets.is_empty() {
                    None
                } else {
                    Some(intersect_all(&sets).into_iter().collect())
                };
                let k = query
                    .limit
                    .map_or(128, |l| usize::try_from(l.offset + l.count).unwrap_or(128))
                    .max(1);
                // Over-fetch so residual filters can't starve the limit.
                let fetch = k.saturating_mul(4).max(32);
                let hits = index.read().search_knn(&sort.query, fetch, whitelist.as_ref())?;
                #[allow(clippy::cast_precision_loss)]
                {
                    trace.vector_first_cost = Some(hits.len() as f64);
                }
                trace.strategy = if cq.spatial_pred.is_some() {
                    "vector+geo".to_string()
                } else {
                    "vector".to_string()
                };
                return Ok(Some(hits.into_iter().map(|(label, _)| label).collect()));
            }
        }

        if sets.is_empty() {
            return Ok(None);
        }
        trace.strategy = strategies.join("+");
        debug!(table, strategy = %trace.strategy, "index plan selected");
        Ok(Some(intersect_all(&sets)))
    }

    fn table_keys(&self, table: &str) -> CoreResult<Vec<String>> {
        let prefix = format!("{table}:");
        let entries = self
            .store
            .scan_prefix(ColumnFamily::Default, prefix.as_bytes(), None, false)?;
        let mut keys = Vec::with_capacity(entries.len());
        for (key, _) in entries {
            keys.push(
                String::from_utf8(key)
                    .map_err(|_| CoreError::invalid_operation("entity key is not UTF-8"))?,
            );
        }
        Ok(keys)
    }

    /// Loads entities by key in one batched read, decrypting when the
    /// caller holds a context, and renders them as rows.
    fn load_rows(&self, keys: &[String], options: &QueryOptions) -> CoreResult<Vec<Json>> {
        let raw_keys: Vec<Vec<u8>> = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
        let loaded = self.store.multi_get(ColumnFamily::Default, &raw_keys)?;

        let mut rows = Vec::with_capacity(keys.len());
        for (key, bytes) in keys.iter().zip(loaded) {
            let Some(bytes) = bytes else {
                continue;
            };
            let mut entity = Entity::from_bytes(key.clone(), &bytes)?;
            if entity.is_tombstone() {
                continue;
            }
            if let (Some(cipher), Some(ctx)) = (&self.cipher, &options.decrypt) {
                let report = cipher.decrypt_entity(&mut entity, ctx);
                for _ in &report.failed {
                    self.stats.record_decrypt_failure();
                }
            }
            rows.push(entity_to_json(&entity));
        }
        Ok(rows)
    }

    fn apply_collect(
        &self,
        collect: &aql::Collect,
        rows: Vec<Env>,
        options: &QueryOptions,
    ) -> CoreResult<Vec<Env>> {
        struct Group {
            env: Env,
            values: Vec<Vec<Json>>,
            count: u64,
        }

        let mut groups: HashMap<String, Group> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for env in rows {
            let mut group_env = Env::new();
            let mut key_parts = Vec::with_capacity(collect.groups.len());
            for (name, expr) in &collect.groups {
                let value = eval(expr, &env, &options.params, Some(&Shim(self, options)))?;
                key_parts.push(value.to_string());
                group_env.bind(name.clone(), value);
            }
            let key = key_parts.join("\u{1f}");

            let group = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                Group {
                    env: group_env,
                    values: vec![Vec::new(); collect.aggregates.len()],
                    count: 0,
                }
            });
            group.count += 1;
            for (slot, (_, _, arg)) in collect.aggregates.iter().enumerate() {
                let value = eval(arg, &env, &options.params, Some(&Shim(self, options)))?;
                group.values[slot].push(value);
            }
        }

        let mut out = Vec::with_capacity(order.len());
        for key in order {
            let mut group = groups.remove(&key).expect("keyed by order");
            for (slot, (name, function, _)) in collect.aggregates.iter().enumerate() {
                let values = &group.values[slot];
                let numbers: Vec<f64> =
                    values.iter().filter_map(Json::as_f64).collect();
                let result = match function {
                    AggregateFn::Count => {
                        Json::Number(group.count.into())
                    }
                    AggregateFn::Sum => number(numbers.iter().sum()),
                    AggregateFn::Min => numbers
                        .iter()
                        .copied()
                        .min_by(f64::total_cmp)
                        .map_or(Json::Null, number),
                    AggregateFn::Max => numbers
                        .iter()
                        .copied()
                        .max_by(f64::total_cmp)
                        .map_or(Json::Null, number),
                    AggregateFn::Avg => {
                        if numbers.is_empty() {
                            Json::Null
                        } else {
                            #[allow(clippy::cast_precision_loss)]
                            number(numbers.iter().sum::<f64>() / numbers.len() as f64)
                        }
                    }
                };
                group.env.bind(name.clone(), result);
            }
            out.push(group.env);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine").finish_non_exhaustive()
    }
}

/// Adapter so expression evaluation can run correlated subqueries.
struct Shim<'a>(&'a QueryEngine, &'a QueryOptions);

impl SubqueryExec for Shim<'_> {
    fn execute_subquery(&self, query: &Query, env: &Env) -> CoreResult<Vec<Json>> {
        Ok(self.0.execute_query(query, env, self.1)?.rows)
    }
}

fn number(n: f64) -> Json {
    serde_json::Number::from_f64(n).map_or(Json::Null, Json::Number)
}

fn intersect_all(sets: &[Vec<String>]) -> Vec<String> {
    let Some((smallest_idx, smallest)) = sets
        .iter()
        .enumerate()
        .min_by_key(|(_, set)| set.len())
    else {
        return Vec::new();
    };
    let others: Vec<HashSet<&String>> = sets
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != smallest_idx)
        .map(|(_, set)| set.iter().collect())
        .collect();

    let mut out: Vec<String> = smallest
        .iter()
        .filter(|key| others.iter().all(|set| set.contains(key)))
        .cloned()
        .collect();
    out.sort();
    out.dedup();
    out
}

fn json_to_field_value(value: &Json) -> CoreResult<themis_codec::Value> {
    Ok(match value {
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                themis_codec::Value::Int(i)
            } else {
                themis_codec::Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => themis_codec::Value::Str(s.clone()),
        other => {
            return Err(CoreError::plan(format!(
                "value {other} is not range-comparable"
            )));
        }
    })
}

/// Counts `FOR x IN name` references to a variable in a query body.
fn count_variable_refs(query: &Query, name: &str) -> usize {
    let mut count = 0;
    for node in &query.for_nodes {
        match &node.source {
            ForSource::Variable(source) if source == name => count += 1,
            ForSource::Subquery(inner) => count += count_variable_refs(inner, name),
            _ => {}
        }
    }
    for binding in &query.lets {
        count += count_expr_refs(&binding.expr, name);
    }
    for filter in &query.filters {
        count += count_expr_refs(filter, name);
    }
    if let Some(expr) = &query.return_expr {
        count += count_expr_refs(expr, name);
    }
    count
}

fn count_expr_refs(expr: &Expr, name: &str) -> usize {
    match expr {
        Expr::Var(var) => usize::from(var == name),
        Expr::Field(base, _) => count_expr_refs(base, name),
        Expr::Index(base, index) => count_expr_refs(base, name) + count_expr_refs(index, name),
        Expr::Unary(_, inner) => count_expr_refs(inner, name),
        Expr::Binary(_, left, right) => {
            count_expr_refs(left, name) + count_expr_refs(right, name)
        }
        Expr::Call(_, args) | Expr::Array(args) => {
            args.iter().map(|a| count_expr_refs(a, name)).sum()
        }
        Expr::Object(fields) => fields.iter().map(|(_, v)| count_expr_refs(v, name)).sum(),
        Expr::Subquery(query) => count_variable_refs(query, name),
        Expr::Quantified { list, cond, .. } => {
            count_expr_refs(list, name) + count_expr_refs(cond, name)
        }
        Expr::Literal(_) | Expr::Param(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersect_all_basics() {
        let sets = vec![
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            vec!["b".to_string(), "c".to_string(), "d".to_string()],
            vec!["c".to_string(), "b".to_string()],
        ];
        assert_eq!(intersect_all(&sets), vec!["b".to_string(), "c".to_string()]);

        let disjoint = vec![vec!["a".to_string()], vec!["b".to_string()]];
        assert!(intersect_all(&disjoint).is_empty());
    }

    #[test]
    fn variable_ref_counting() {
        let query = aql::parse(
            "WITH adults AS (FOR u IN users RETURN u) \
             FOR a IN adults FOR b IN adults RETURN [a, b]",
        )
        .unwrap();
        assert_eq!(count_variable_refs(&query, "adults"), 2);
        assert_eq!(count_variable_refs(&query, "other"), 0);
    }
}
