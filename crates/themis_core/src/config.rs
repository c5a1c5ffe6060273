//! Database configuration.
//!
//! A single JSON document with sections for storage, server, security,
//! logging, vector index, features, tracing, and streaming. Environment
//! variables prefixed `THEMIS_` override individual keys, e.g.
//! `THEMIS_SERVER_PORT=9000` or `THEMIS_FEATURES_CDC=false`.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage substrate options.
    pub storage: StorageConfig,
    /// Server surface options (consumed by the transport facade).
    pub server: ServerConfig,
    /// Security options.
    pub security: SecurityConfig,
    /// Logging options.
    pub logging: LoggingConfig,
    /// Vector (ANN) index options.
    pub vector_index: VectorIndexConfig,
    /// Feature toggles. Read-only after initialization.
    pub features: FeatureToggles,
    /// Tracing options.
    pub tracing: TracingConfig,
    /// Streaming (SSE) options.
    pub sse: SseConfig,
}

/// Storage substrate options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database directory. Empty means in-memory.
    pub path: String,
    /// Memtable budget in MiB (advisory).
    pub memtable_size_mb: u64,
    /// Block cache budget in MiB (advisory).
    pub block_cache_size_mb: u64,
    /// Maximum open file handles (advisory).
    pub max_open_files: u32,
    /// Whether to fsync the batch log on every commit.
    pub sync_on_commit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            memtable_size_mb: 64,
            block_cache_size_mb: 128,
            max_open_files: 1024,
            sync_on_commit: true,
        }
    }
}

/// Server surface options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen port for the transport facade.
    pub port: u16,
    /// Worker thread count (0 = number of CPUs).
    pub worker_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            worker_threads: 0,
        }
    }
}

/// Security options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// TLS termination toggle (handled by the transport facade).
    pub tls: ToggleConfig,
    /// RBAC evaluation toggle (handled by the auth collaborator).
    pub rbac: ToggleConfig,
    /// Per-connection rate limiting toggle.
    pub rate_limiting: ToggleConfig,
}

/// A single on/off switch with room for future options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToggleConfig {
    /// Whether the feature is enabled.
    pub enabled: bool,
}

/// Logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (`error|warn|info|debug|trace`).
    pub level: String,
    /// Output format (`text|json`).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Vector (ANN) index options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorIndexConfig {
    /// Index engine name. Only `hnsw` is supported.
    pub engine: String,
    /// HNSW M parameter (max neighbors per node).
    pub hnsw_m: usize,
    /// HNSW efConstruction parameter.
    pub hnsw_ef_construction: usize,
    /// HNSW efSearch parameter.
    pub hnsw_ef_search: usize,
    /// Directory for index persistence. Empty disables persistence.
    pub save_path: String,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            engine: "hnsw".to_string(),
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 64,
            save_path: String::new(),
        }
    }
}

/// Feature toggles. Read-only after initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureToggles {
    /// Change-data-capture log and streaming.
    pub cdc: bool,
    /// Semantic response cache.
    pub semantic_cache: bool,
    /// Time-series store and its background workers.
    pub timeseries: bool,
    /// Update manifest checker.
    pub update_checker: bool,
    /// Manifest-driven hot reload.
    pub hot_reload: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            cdc: true,
            semantic_cache: true,
            timeseries: true,
            update_checker: false,
            hot_reload: false,
        }
    }
}

/// Tracing options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Whether span export is enabled.
    pub enabled: bool,
    /// OTLP collector endpoint.
    pub otlp_endpoint: String,
}

/// Streaming (SSE) options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SseConfig {
    /// Per-connection emission rate cap (0 = unlimited).
    pub max_events_per_second: u32,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_ms: u64,
    /// `retry:` hint sent in the stream header, in milliseconds.
    pub retry_ms: u64,
    /// Per-connection ring buffer capacity.
    pub buffer_size: usize,
    /// Maximum events delivered per poll iteration.
    pub max_events_per_poll: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            max_events_per_second: 0,
            heartbeat_ms: 15_000,
            retry_ms: 3_000,
            buffer_size: 1000,
            max_events_per_poll: 256,
        }
    }
}

impl Config {
    /// Parses a configuration document from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigInvalid`] on malformed JSON or failed
    /// validation.
    pub fn from_json(text: &str) -> CoreResult<Self> {
        let config: Config = serde_json::from_str(text)
            .map_err(|e| CoreError::config_invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration document from a file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigInvalid`] if the file cannot be read or
    /// parsed.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CoreError::config_invalid(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// Applies `THEMIS_*` environment-variable overrides from the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigInvalid`] if an override value fails to
    /// parse.
    pub fn apply_env(&mut self) -> CoreResult<()> {
        let vars: Vec<(String, String)> = std::env::vars().collect();
        self.apply_env_from(vars)
    }

    /// Applies overrides from an explicit variable list (testable form).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigInvalid`] if an override value fails to
    /// parse.
    pub fn apply_env_from<I>(&mut self, vars: I) -> CoreResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(suffix) = key.strip_prefix("THEMIS_") else {
                continue;
            };
            match suffix {
                "STORAGE_PATH" => self.storage.path = value,
                "STORAGE_MEMTABLE_SIZE_MB" => {
                    self.storage.memtable_size_mb = parse(&key, &value)?;
                }
                "STORAGE_BLOCK_CACHE_SIZE_MB" => {
                    self.storage.block_cache_size_mb = parse(&key, &value)?;
                }
                "STORAGE_MAX_OPEN_FILES" => {
                    self.storage.max_open_files = parse(&key, &value)?;
                }
                "STORAGE_SYNC_ON_COMMIT" => {
                    self.storage.sync_on_commit = parse_bool(&key, &value)?;
                }
                "SERVER_PORT" => self.server.port = parse(&key, &value)?,
                "SERVER_WORKER_THREADS" => {
                    self.server.worker_threads = parse(&key, &value)?;
                }
                "SECURITY_TLS_ENABLED" => {
                    self.security.tls.enabled = parse_bool(&key, &value)?;
                }
                "SECURITY_RBAC_ENABLED" => {
                    self.security.rbac.enabled = parse_bool(&key, &value)?;
                }
                "SECURITY_RATE_LIMITING_ENABLED" => {
                    self.security.rate_limiting.enabled = parse_bool(&key, &value)?;
                }
                "LOGGING_LEVEL" => self.logging.level = value,
                "LOGGING_FORMAT" => self.logging.format = value,
                "VECTOR_INDEX_ENGINE" => self.vector_index.engine = value,
                "VECTOR_INDEX_HNSW_M" => {
                    self.vector_index.hnsw_m = parse(&key, &value)?;
                }
                "VECTOR_INDEX_HNSW_EF_CONSTRUCTION" => {
                    self.vector_index.hnsw_ef_construction = parse(&key, &value)?;
                }
                "VECTOR_INDEX_HNSW_EF_SEARCH" => {
                    self.vector_index.hnsw_ef_search = parse(&key, &value)?;
                }
                "VECTOR_INDEX_SAVE_PATH" => self.vector_index.save_path = value,
                "FEATURES_CDC" => self.features.cdc = parse_bool(&key, &value)?,
                "FEATURES_SEMANTIC_CACHE" => {
                    self.features.semantic_cache = parse_bool(&key, &value)?;
                }
                "FEATURES_TIMESERIES" => {
                    self.features.timeseries = parse_bool(&key, &value)?;
                }
                "FEATURES_UPDATE_CHECKER" => {
                    self.features.update_checker = parse_bool(&key, &value)?;
                }
                "FEATURES_HOT_RELOAD" => {
                    self.features.hot_reload = parse_bool(&key, &value)?;
                }
                "TRACING_ENABLED" => self.tracing.enabled = parse_bool(&key, &value)?,
                "TRACING_OTLP_ENDPOINT" => self.tracing.otlp_endpoint = value,
                "SSE_MAX_EVENTS_PER_SECOND" => {
                    self.sse.max_events_per_second = parse(&key, &value)?;
                }
                other => {
                    warn!(key = other, "unknown THEMIS_ override ignored");
                }
            }
        }
        self.validate()
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigInvalid`] on an impossible option set.
    pub fn validate(&self) -> CoreResult<()> {
        if self.vector_index.engine != "hnsw" {
            return Err(CoreError::config_invalid(format!(
                "unsupported vector_index.engine: {}",
                self.vector_index.engine
            )));
        }
        if self.vector_index.hnsw_m < 2 {
            return Err(CoreError::config_invalid("vector_index.hnsw_m must be >= 2"));
        }
        if self.vector_index.hnsw_ef_construction < self.vector_index.hnsw_m {
            return Err(CoreError::config_invalid(
                "vector_index.hnsw_ef_construction must be >= hnsw_m",
            ));
        }
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(CoreError::config_invalid(format!(
                    "unknown logging.level: {other}"
                )));
            }
        }
        if self.sse.buffer_size == 0 {
            return Err(CoreError::config_invalid("sse.buffer_size must be > 0"));
        }
        Ok(())
    }

    /// Returns the storage directory, if configured for persistence.
    #[must_use]
    pub fn storage_path(&self) -> Option<PathBuf> {
        if self.storage.path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.storage.path))
        }
    }

    /// Returns the vector index save directory, if persistence is enabled.
    #[must_use]
    pub fn vector_save_path(&self) -> Option<PathBuf> {
        if self.vector_index.save_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.vector_index.save_path))
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> CoreResult<T> {
    value
        .parse()
        .map_err(|_| CoreError::config_invalid(format!("cannot parse {key}={value}")))
}

fn parse_bool(key: &str, value: &str) -> CoreResult<bool> {
    match value {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(CoreError::config_invalid(format!(
            "cannot parse {key}={value} as bool"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.features.cdc);
        assert!(config.storage_path().is_none());
    }

    #[test]
    fn parses_partial_json() {
        let config = Config::from_json(
            r#"{"server": {"port": 9000}, "features": {"cdc": false}}"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert!(!config.features.cdc);
        // Unspecified sections keep defaults.
        assert_eq!(config.vector_index.hnsw_m, 16);
    }

    #[test]
    fn rejects_bad_engine() {
        let err = Config::from_json(r#"{"vector_index": {"engine": "faiss"}}"#)
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        config
            .apply_env_from(vec![
                ("THEMIS_SERVER_PORT".to_string(), "1234".to_string()),
                ("THEMIS_FEATURES_CDC".to_string(), "off".to_string()),
                ("THEMIS_STORAGE_PATH".to_string(), "/tmp/db".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ])
            .unwrap();
        assert_eq!(config.server.port, 1234);
        assert!(!config.features.cdc);
        assert_eq!(config.storage_path().unwrap(), PathBuf::from("/tmp/db"));
    }

    #[test]
    fn env_parse_failure_is_config_invalid() {
        let mut config = Config::default();
        let err = config
            .apply_env_from(vec![(
                "THEMIS_SERVER_PORT".to_string(),
                "not-a-port".to_string(),
            )])
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }

    #[test]
    fn validate_rejects_bad_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }
}
