//! Time-series store.
//!
//! Points live in the `timeseries` column family at
//! `ts:<metric>:<entity>:<ts20>`. Older stretches of a series can be
//! compacted into Gorilla-encoded chunks at
//! `tschunk:<metric>:<entity>:<start20>`; queries merge raw points and
//! chunks transparently. Windowed aggregates materialize into the derived
//! metric `<metric>__agg_<window>ms`.

pub mod gorilla;

use crate::error::{CoreError, CoreResult};
use gorilla::{decode_chunk, encode_chunk, Sample};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use themis_storage::{ColumnFamily, KvStore, WriteBatch};
use tracing::debug;

const TS_WIDTH: usize = 20;

/// One time-series point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsPoint {
    /// Metric name (no `:`).
    pub metric: String,
    /// Source entity (no `:`).
    pub entity: String,
    /// Timestamp in milliseconds.
    pub ts_ms: u64,
    /// Sample value.
    pub value: f64,
    /// Optional tags, filterable at query time.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Stored payload of a raw point (the key carries metric/entity/ts).
#[derive(Debug, Serialize, Deserialize)]
struct PointPayload {
    value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    tags: BTreeMap<String, String>,
}

/// Aggregation operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    /// Window minimum.
    Min,
    /// Window maximum.
    Max,
    /// Window mean.
    Avg,
    /// Window sum.
    Sum,
    /// Window sample count.
    Count,
}

/// One aggregated window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregate {
    /// Window start timestamp (inclusive).
    pub window_start_ms: u64,
    /// Window minimum.
    pub min: f64,
    /// Window maximum.
    pub max: f64,
    /// Window sum.
    pub sum: f64,
    /// Window sample count.
    pub count: u64,
    /// Window mean.
    pub avg: f64,
}

impl WindowAggregate {
    /// The value selected by an operator.
    #[must_use]
    pub fn value(&self, op: AggregateOp) -> f64 {
        match op {
            AggregateOp::Min => self.min,
            AggregateOp::Max => self.max,
            AggregateOp::Avg => self.avg,
            AggregateOp::Sum => self.sum,
            #[allow(clippy::cast_precision_loss)]
            AggregateOp::Count => self.count as f64,
        }
    }
}

/// Configuration of a continuous aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousAggregateConfig {
    /// Source metric.
    pub metric: String,
    /// Window width in milliseconds.
    pub window_ms: u64,
    /// Restrict to one entity, or aggregate across all.
    pub entity: Option<String>,
}

/// The time-series store.
pub struct TsStore {
    store: Arc<KvStore>,
}

impl TsStore {
    /// Creates a store over the substrate.
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    fn point_key(metric: &str, entity: &str, ts_ms: u64) -> Vec<u8> {
        format!("ts:{metric}:{entity}:{ts_ms:0TS_WIDTH$}").into_bytes()
    }

    fn chunk_key(metric: &str, entity: &str, start_ms: u64) -> Vec<u8> {
        format!("tschunk:{metric}:{entity}:{start_ms:0TS_WIDTH$}").into_bytes()
    }

    fn validate_name(name: &str, what: &str) -> CoreResult<()> {
        if name.is_empty() || name.contains(':') {
            return Err(CoreError::invalid_operation(format!(
                "{what} must be non-empty and contain no ':'"
            )));
        }
        Ok(())
    }

    /// Appends a point.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid names or NaN values.
    pub fn put(&self, point: &TsPoint) -> CoreResult<()> {
        Self::validate_name(&point.metric, "metric")?;
        Self::validate_name(&point.entity, "entity")?;
        if point.value.is_nan() {
            return Err(CoreError::invalid_operation("NaN sample value"));
        }
        let payload = PointPayload {
            value: point.value,
            tags: point.tags.clone(),
        };
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
        self.store.put(
            ColumnFamily::Timeseries,
            Self::point_key(&point.metric, &point.entity, point.ts_ms),
            bytes,
        )?;
        Ok(())
    }

    /// Queries points in `[start_ms, end_ms]`, sorted by timestamp.
    ///
    /// `entity = None` merges all entities of the metric. Tag filters are
    /// conjunctive equality.
    ///
    /// # Errors
    ///
    /// Returns an error if stored data fails to decode.
    pub fn query(
        &self,
        metric: &str,
        start_ms: u64,
        end_ms: u64,
        entity: Option<&str>,
        tags: Option<&BTreeMap<String, String>>,
        limit: Option<usize>,
    ) -> CoreResult<Vec<TsPoint>> {
        Self::validate_name(metric, "metric")?;
        let mut out = Vec::new();

        let entities: Vec<String> = match entity {
            Some(entity) => vec![entity.to_string()],
            None => self.entities_of(metric)?,
        };

        for entity in &entities {
            // Chunks whose range may overlap the query.
            let chunk_prefix = format!("tschunk:{metric}:{entity}:");
            for (_, bytes) in self.store.scan_prefix(
                ColumnFamily::Timeseries,
                chunk_prefix.as_bytes(),
                None,
                false,
            )? {
                for sample in decode_chunk(&bytes)? {
                    if sample.ts_ms >= start_ms && sample.ts_ms <= end_ms {
                        out.push(TsPoint {
                            metric: metric.to_string(),
                            entity: entity.clone(),
                            ts_ms: sample.ts_ms,
                            value: sample.value,
                            tags: BTreeMap::new(),
                        });
                    }
                }
            }

            // Raw points in the range.
            let lo = Self::point_key(metric, entity, start_ms);
            let mut hi = Self::point_key(metric, entity, end_ms);
            hi.push(b';');
            for (key, bytes) in self.store.scan_range(
                ColumnFamily::Timeseries,
                std::ops::Bound::Included(lo),
                std::ops::Bound::Excluded(hi),
                None,
                false,
            )? {
                let ts_ms = parse_ts_suffix(&key)?;
                let payload: PointPayload = serde_json::from_slice(&bytes)
                    .map_err(|e| CoreError::invalid_operation(format!("corrupt point: {e}")))?;
                out.push(TsPoint {
                    metric: metric.to_string(),
                    entity: entity.clone(),
                    ts_ms,
                    value: payload.value,
                    tags: payload.tags,
                });
            }
        }

        if let Some(tags) = tags {
            out.retain(|p| tags.iter().all(|(k, v)| p.tags.get(k) == Some(v)));
        }
        out.sort_by_key(|p| (p.ts_ms, p.entity.clone()));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn entities_of(&self, metric: &str) -> CoreResult<Vec<String>> {
        let prefix = format!("ts:{metric}:");
        let mut entities = std::collections::BTreeSet::new();
        for (key, _) in
            self.store
                .scan_prefix(ColumnFamily::Timeseries, prefix.as_bytes(), None, false)?
        {
            let text = std::str::from_utf8(&key)
                .map_err(|_| CoreError::invalid_operation("non-UTF-8 series key"))?;
            if let Some(rest) = text.strip_prefix(&prefix) {
                if let Some((entity, _)) = rest.rsplit_once(':') {
                    entities.insert(entity.to_string());
                }
            }
        }
        let chunk_prefix = format!("tschunk:{metric}:");
        for (key, _) in self.store.scan_prefix(
            ColumnFamily::Timeseries,
            chunk_prefix.as_bytes(),
            None,
            false,
        )? {
            let text = std::str::from_utf8(&key)
                .map_err(|_| CoreError::invalid_operation("non-UTF-8 series key"))?;
            if let Some(rest) = text.strip_prefix(&chunk_prefix) {
                if let Some((entity, _)) = rest.rsplit_once(':') {
                    entities.insert(entity.to_string());
                }
            }
        }
        Ok(entities.into_iter().collect())
    }

    /// Aggregates a metric into fixed windows over `[start_ms, end_ms]`.
    ///
    /// # Errors
    ///
    /// Returns an error on a zero window or decode failure.
    pub fn aggregate(
        &self,
        metric: &str,
        window_ms: u64,
        start_ms: u64,
        end_ms: u64,
        entity: Option<&str>,
    ) -> CoreResult<Vec<WindowAggregate>> {
        if window_ms == 0 {
            return Err(CoreError::invalid_operation("window must be positive"));
        }
        let points = self.query(metric, start_ms, end_ms, entity, None, None)?;

        let mut windows: BTreeMap<u64, WindowAggregate> = BTreeMap::new();
        for point in points {
            let window_start = point.ts_ms / window_ms * window_ms;
            let agg = windows.entry(window_start).or_insert(WindowAggregate {
                window_start_ms: window_start,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                sum: 0.0,
                count: 0,
                avg: 0.0,
            });
            agg.min = agg.min.min(point.value);
            agg.max = agg.max.max(point.value);
            agg.sum += point.value;
            agg.count += 1;
        }

        let mut out: Vec<WindowAggregate> = windows.into_values().collect();
        for agg in &mut out {
            #[allow(clippy::cast_precision_loss)]
            let count = agg.count as f64;
            agg.avg = agg.sum / count;
        }
        Ok(out)
    }

    /// Materializes windowed aggregates into the derived metric
    /// `<metric>__agg_<window>ms`, one point per window with the full
    /// `{min,max,sum,count,avg}` metadata in tags.
    ///
    /// Returns the number of windows written.
    ///
    /// # Errors
    ///
    /// Returns an error if aggregation or the write fails.
    pub fn continuous_aggregate(
        &self,
        config: &ContinuousAggregateConfig,
        start_ms: u64,
        end_ms: u64,
    ) -> CoreResult<usize> {
        let windows = self.aggregate(
            &config.metric,
            config.window_ms,
            start_ms,
            end_ms,
            config.entity.as_deref(),
        )?;
        let derived = format!("{}__agg_{}ms", config.metric, config.window_ms);
        let entity = config.entity.as_deref().unwrap_or("all");

        let mut batch = WriteBatch::new();
        for window in &windows {
            let mut tags = BTreeMap::new();
            tags.insert("min".to_string(), window.min.to_string());
            tags.insert("max".to_string(), window.max.to_string());
            tags.insert("sum".to_string(), window.sum.to_string());
            tags.insert("count".to_string(), window.count.to_string());
            tags.insert("avg".to_string(), window.avg.to_string());
            let payload = PointPayload {
                value: window.avg,
                tags,
            };
            let bytes = serde_json::to_vec(&payload)
                .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
            batch.put(
                ColumnFamily::Timeseries,
                Self::point_key(&derived, entity, window.window_start_ms),
                bytes,
            );
        }
        if !batch.is_empty() {
            self.store.write_batch(batch)?;
        }
        debug!(metric = %config.metric, derived = %derived, windows = windows.len(), "continuous aggregate materialized");
        Ok(windows.len())
    }

    /// Compacts a series' raw points older than `before_ms` into one
    /// Gorilla chunk, deleting the raw points in the same batch.
    ///
    /// Returns the number of compacted points.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the commit fails.
    pub fn compact_series(&self, metric: &str, entity: &str, before_ms: u64) -> CoreResult<usize> {
        Self::validate_name(metric, "metric")?;
        Self::validate_name(entity, "entity")?;

        let lo = Self::point_key(metric, entity, 0);
        let hi = Self::point_key(metric, entity, before_ms);
        let raw = self.store.scan_range(
            ColumnFamily::Timeseries,
            std::ops::Bound::Included(lo),
            std::ops::Bound::Excluded(hi),
            None,
            false,
        )?;
        if raw.len() < 2 {
            return Ok(0);
        }

        let mut samples = Vec::with_capacity(raw.len());
        let mut batch = WriteBatch::new();
        for (key, bytes) in &raw {
            let payload: PointPayload = serde_json::from_slice(bytes)
                .map_err(|e| CoreError::invalid_operation(format!("corrupt point: {e}")))?;
            samples.push(Sample {
                ts_ms: parse_ts_suffix(key)?,
                value: payload.value,
            });
            batch.delete(ColumnFamily::Timeseries, key.clone());
        }

        let chunk = encode_chunk(&samples)?;
        batch.put(
            ColumnFamily::Timeseries,
            Self::chunk_key(metric, entity, samples[0].ts_ms),
            chunk,
        );
        self.store.write_batch(batch)?;
        Ok(samples.len())
    }

    /// Deletes raw points and chunks older than `cutoff_ms`.
    ///
    /// `metric = None` sweeps every metric. Returns the number of removed
    /// keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweep commit fails.
    pub fn retention_cleanup(&self, metric: Option<&str>, cutoff_ms: u64) -> CoreResult<usize> {
        let prefixes = match metric {
            Some(metric) => vec![format!("ts:{metric}:"), format!("tschunk:{metric}:")],
            None => vec!["ts:".to_string(), "tschunk:".to_string()],
        };

        let mut batch = WriteBatch::new();
        let mut removed = 0usize;
        for prefix in prefixes {
            let is_chunk = prefix.starts_with("tschunk:");
            for (key, bytes) in self.store.scan_prefix(
                ColumnFamily::Timeseries,
                prefix.as_bytes(),
                None,
                false,
            )? {
                let expired = if is_chunk {
                    // A chunk expires when its newest sample does.
                    decode_chunk(&bytes)?
                        .last()
                        .is_some_and(|s| s.ts_ms < cutoff_ms)
                } else {
                    parse_ts_suffix(&key)? < cutoff_ms
                };
                if expired {
                    batch.delete(ColumnFamily::Timeseries, key);
                    removed += 1;
                }
            }
        }
        if !batch.is_empty() {
            self.store.write_batch(batch)?;
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for TsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsStore").finish_non_exhaustive()
    }
}

fn parse_ts_suffix(key: &[u8]) -> CoreResult<u64> {
    let text = std::str::from_utf8(key)
        .map_err(|_| CoreError::invalid_operation("non-UTF-8 series key"))?;
    text.rsplit_once(':')
        .and_then(|(_, ts)| ts.parse().ok())
        .ok_or_else(|| CoreError::invalid_operation("series key has no timestamp"))
}
