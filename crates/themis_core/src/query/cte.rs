//! CTE materialization cache.
//!
//! Materialized CTE result sets live in an LRU in-memory cache with a byte
//! budget (default 100 MiB). Result sets that don't fit the remaining
//! budget spill to JSON-lines files under a temp path; spilled entries are
//! read back transparently.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

/// Default cache budget: 100 MiB.
pub const DEFAULT_BUDGET_BYTES: usize = 100 * 1024 * 1024;

enum Stored {
    Memory { rows: Vec<serde_json::Value>, bytes: usize },
    Spilled { path: PathBuf },
}

struct Inner {
    entries: HashMap<String, Stored>,
    /// LRU order, least recent first.
    order: Vec<String>,
    used_bytes: usize,
    budget_bytes: usize,
    spill_dir: PathBuf,
    spill_counter: u64,
}

/// The materialization cache.
pub struct CteCache {
    inner: Mutex<Inner>,
}

impl CteCache {
    /// Creates a cache with the given byte budget, spilling under
    /// `spill_dir`.
    #[must_use]
    pub fn new(budget_bytes: usize, spill_dir: PathBuf) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
                used_bytes: 0,
                budget_bytes,
                spill_dir,
                spill_counter: 0,
            }),
        }
    }

    /// Creates a cache with the default budget under the OS temp dir.
    #[must_use]
    pub fn with_default_budget() -> Self {
        Self::new(
            DEFAULT_BUDGET_BYTES,
            std::env::temp_dir().join("themis-cte-spill"),
        )
    }

    /// Inserts a materialized result set.
    ///
    /// # Errors
    ///
    /// Returns an error if a spill file cannot be written.
    pub fn put(&self, key: &str, rows: &[serde_json::Value]) -> CoreResult<()> {
        let bytes: usize = rows
            .iter()
            .map(|r| serde_json::to_string(r).map_or(0, |s| s.len() + 1))
            .sum();

        let mut inner = self.inner.lock();
        inner.remove_entry(key);

        if bytes > inner.budget_bytes {
            let path = inner.spill(key, rows)?;
            inner.entries.insert(key.to_string(), Stored::Spilled { path });
        } else {
            // Evict least-recently-used memory entries until it fits.
            while inner.used_bytes + bytes > inner.budget_bytes {
                let Some(victim) = inner.order.first().cloned() else {
                    break;
                };
                inner.evict_to_disk(&victim)?;
            }
            inner.used_bytes += bytes;
            inner.entries.insert(
                key.to_string(),
                Stored::Memory {
                    rows: rows.to_vec(),
                    bytes,
                },
            );
        }
        inner.order.push(key.to_string());
        Ok(())
    }

    /// Fetches a materialized result set, refreshing its LRU position.
    ///
    /// # Errors
    ///
    /// Returns an error if a spilled entry cannot be read back.
    pub fn get(&self, key: &str) -> CoreResult<Option<Vec<serde_json::Value>>> {
        let mut inner = self.inner.lock();
        let rows = match inner.entries.get(key) {
            None => return Ok(None),
            Some(Stored::Memory { rows, .. }) => rows.clone(),
            Some(Stored::Spilled { path }) => {
                let file = std::fs::File::open(path)
                    .map_err(|e| CoreError::invalid_operation(format!("spill read: {e}")))?;
                let mut rows = Vec::new();
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if line.is_empty() {
                        continue;
                    }
                    rows.push(serde_json::from_str(&line).map_err(|e| {
                        CoreError::invalid_operation(format!("spill decode: {e}"))
                    })?);
                }
                rows
            }
        };
        inner.touch(key);
        Ok(Some(rows))
    }

    /// Number of cached entries (memory and spilled).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// In-memory bytes currently held.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes
    }

    /// Drops every entry and deletes spill files.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for stored in inner.entries.values() {
            if let Stored::Spilled { path } = stored {
                let _ = std::fs::remove_file(path);
            }
        }
        inner.entries.clear();
        inner.order.clear();
        inner.used_bytes = 0;
    }
}

impl Inner {
    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push(key.to_string());
    }

    fn remove_entry(&mut self, key: &str) {
        if let Some(stored) = self.entries.remove(key) {
            match stored {
                Stored::Memory { bytes, .. } => self.used_bytes -= bytes,
                Stored::Spilled { path } => {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
        self.order.retain(|k| k != key);
    }

    fn spill(&mut self, key: &str, rows: &[serde_json::Value]) -> CoreResult<PathBuf> {
        std::fs::create_dir_all(&self.spill_dir)?;
        self.spill_counter += 1;
        let digest = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(key.as_bytes());
            format!("{:x}", hasher.finalize())
        };
        let path = self
            .spill_dir
            .join(format!("cte-{}-{}.jsonl", &digest[..16], self.spill_counter));
        let mut file = std::fs::File::create(&path)?;
        for row in rows {
            let line = serde_json::to_string(row)
                .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        Ok(path)
    }

    fn evict_to_disk(&mut self, key: &str) -> CoreResult<()> {
        let Some(Stored::Memory { rows, bytes }) = self.entries.remove(key) else {
            self.order.retain(|k| k != key);
            return Ok(());
        };
        self.used_bytes -= bytes;
        let path = self.spill(key, &rows)?;
        self.entries.insert(key.to_string(), Stored::Spilled { path });
        Ok(())
    }
}

impl Drop for CteCache {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for CteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CteCache")
            .field("entries", &inner.entries.len())
            .field("used_bytes", &inner.used_bytes)
            .finish_non_exhaustive()
    }
}
