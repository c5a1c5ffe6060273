//! Semantic cache: content-addressed prompt/response pairs with TTL.
//!
//! The cache key is `SHA-256(prompt || canonical_json(params))`; entries
//! live at `semantic_cache:<hex>` in the default column family. A TTL of
//! `-1` means no expiry; expired entries are removed lazily on lookup or
//! in bulk by [`SemanticCache::clear_expired`].

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use themis_codec::canonical_json;
use themis_storage::{ColumnFamily, KvStore, WriteBatch};

/// A cached response with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cached response payload.
    pub response: serde_json::Value,
    /// Caller-supplied metadata.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    /// Insertion time.
    pub timestamp_ms: u64,
    /// Time-to-live in seconds; `-1` disables expiry.
    pub ttl_s: i64,
}

impl CacheEntry {
    fn expired_at(&self, now_ms: u64) -> bool {
        if self.ttl_s < 0 {
            return false;
        }
        #[allow(clippy::cast_sign_loss)]
        let ttl_ms = (self.ttl_s as u64).saturating_mul(1000);
        now_ms >= self.timestamp_ms.saturating_add(ttl_ms)
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookup hits.
    pub hits: u64,
    /// Lookup misses (including expired entries).
    pub misses: u64,
    /// `hits / (hits + misses)`.
    pub hit_rate: f64,
    /// Mean lookup latency in milliseconds.
    pub avg_lookup_ms: f64,
    /// Live entries.
    pub entries: u64,
    /// Approximate stored bytes.
    pub bytes: u64,
}

/// The semantic cache.
pub struct SemanticCache {
    store: Arc<KvStore>,
    hits: AtomicU64,
    misses: AtomicU64,
    lookup_micros_total: AtomicU64,
    lookups: AtomicU64,
}

impl SemanticCache {
    /// Creates a cache over the substrate.
    pub fn new(store: Arc<KvStore>) -> Self {
        Self {
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            lookup_micros_total: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
        }
    }

    /// The content-addressed key for a prompt/params pair.
    #[must_use]
    pub fn cache_key(prompt: &str, params: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        hasher.update(canonical_json(params).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn storage_key(hash: &str) -> Vec<u8> {
        format!("semantic_cache:{hash}").into_bytes()
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    /// Stores a response.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn put(
        &self,
        prompt: &str,
        params: &serde_json::Value,
        response: serde_json::Value,
        metadata: serde_json::Value,
        ttl_s: i64,
    ) -> CoreResult<()> {
        let entry = CacheEntry {
            response,
            metadata,
            timestamp_ms: Self::now_ms(),
            ttl_s,
        };
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
        self.store.put(
            ColumnFamily::Default,
            Self::storage_key(&Self::cache_key(prompt, params)),
            bytes,
        )?;
        Ok(())
    }

    /// Looks up a response; a hit requires the entry to be unexpired.
    ///
    /// Expired entries are removed on the spot and count as misses.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn query(
        &self,
        prompt: &str,
        params: &serde_json::Value,
    ) -> CoreResult<Option<CacheEntry>> {
        let started = std::time::Instant::now();
        let key = Self::storage_key(&Self::cache_key(prompt, params));
        let result = self.store.get(ColumnFamily::Default, &key)?;

        let outcome = match result {
            None => None,
            Some(bytes) => {
                let entry: CacheEntry = serde_json::from_slice(&bytes).map_err(|e| {
                    CoreError::invalid_operation(format!("corrupt cache entry: {e}"))
                })?;
                if entry.expired_at(Self::now_ms()) {
                    self.store.delete(ColumnFamily::Default, key)?;
                    None
                } else {
                    Some(entry)
                }
            }
        };

        let elapsed = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.lookup_micros_total.fetch_add(elapsed, Ordering::Relaxed);
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if outcome.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    /// Sweeps all expired entries. Returns the removed count.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweep commit fails.
    pub fn clear_expired(&self) -> CoreResult<usize> {
        let now_ms = Self::now_ms();
        let entries = self
            .store
            .scan_prefix(ColumnFamily::Default, b"semantic_cache:", None, false)?;
        let mut batch = WriteBatch::new();
        for (key, bytes) in entries {
            let Ok(entry) = serde_json::from_slice::<CacheEntry>(&bytes) else {
                batch.delete(ColumnFamily::Default, key);
                continue;
            };
            if entry.expired_at(now_ms) {
                batch.delete(ColumnFamily::Default, key);
            }
        }
        let removed = batch.len();
        if !batch.is_empty() {
            self.store.write_batch(batch)?;
        }
        Ok(removed)
    }

    /// Current counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry scan fails.
    pub fn stats(&self) -> CoreResult<CacheStats> {
        let entries = self
            .store
            .scan_prefix(ColumnFamily::Default, b"semantic_cache:", None, false)?;
        let bytes: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = self.lookups.load(Ordering::Relaxed);
        let total_micros = self.lookup_micros_total.load(Ordering::Relaxed);

        #[allow(clippy::cast_precision_loss)]
        Ok(CacheStats {
            hits,
            misses,
            hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            avg_lookup_ms: if lookups == 0 {
                0.0
            } else {
                total_micros as f64 / lookups as f64 / 1000.0
            },
            entries: entries.len() as u64,
            bytes: bytes as u64,
        })
    }
}

impl std::fmt::Debug for SemanticCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SemanticCache {
        SemanticCache::new(Arc::new(KvStore::open_in_memory().unwrap()))
    }

    #[test]
    fn hit_after_put() {
        let cache = cache();
        let params = serde_json::json!({"model": "m1", "temp": 0.2});
        cache
            .put("what is themis", &params, serde_json::json!("a goddess"), serde_json::Value::Null, -1)
            .unwrap();

        let entry = cache.query("what is themis", &params).unwrap().unwrap();
        assert_eq!(entry.response, serde_json::json!("a goddess"));
        assert_eq!(entry.ttl_s, -1);
    }

    #[test]
    fn key_depends_on_prompt_and_params() {
        let a = SemanticCache::cache_key("p", &serde_json::json!({"x": 1}));
        let b = SemanticCache::cache_key("p", &serde_json::json!({"x": 2}));
        let c = SemanticCache::cache_key("q", &serde_json::json!({"x": 1}));
        assert_ne!(a, b);
        assert_ne!(a, c);

        // Canonical params: key ordering doesn't matter.
        let d = SemanticCache::cache_key("p", &serde_json::json!({"x": 1, "y": 2}));
        let e = SemanticCache::cache_key("p", &serde_json::json!({"y": 2, "x": 1}));
        assert_eq!(d, e);
    }

    #[test]
    fn miss_for_unknown() {
        let cache = cache();
        assert!(cache
            .query("never seen", &serde_json::Value::Null)
            .unwrap()
            .is_none());
        let stats = cache.stats().unwrap();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let cache = cache();
        let params = serde_json::Value::Null;
        cache
            .put("p", &params, serde_json::json!(1), serde_json::Value::Null, 0)
            .unwrap();
        // ttl 0: expired as soon as written.
        assert!(cache.query("p", &params).unwrap().is_none());
        // The expired entry was removed lazily.
        assert_eq!(cache.stats().unwrap().entries, 0);
    }

    #[test]
    fn negative_ttl_never_expires() {
        let cache = cache();
        let params = serde_json::Value::Null;
        cache
            .put("p", &params, serde_json::json!(1), serde_json::Value::Null, -1)
            .unwrap();
        assert!(cache.query("p", &params).unwrap().is_some());
    }

    #[test]
    fn clear_expired_sweeps() {
        let cache = cache();
        cache
            .put("a", &serde_json::Value::Null, serde_json::json!(1), serde_json::Value::Null, 0)
            .unwrap();
        cache
            .put("b", &serde_json::Value::Null, serde_json::json!(2), serde_json::Value::Null, -1)
            .unwrap();

        let removed = cache.clear_expired().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().unwrap().entries, 1);
    }

    #[test]
    fn stats_track_rates() {
        let cache = cache();
        let params = serde_json::Value::Null;
        cache
            .put("p", &params, serde_json::json!(1), serde_json::Value::Null, -1)
            .unwrap();

        cache.query("p", &params).unwrap();
        cache.query("p", &params).unwrap();
        cache.query("missing", &params).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(stats.bytes > 0);
    }
}
