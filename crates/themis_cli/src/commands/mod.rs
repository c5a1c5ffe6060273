//! Command implementations.

pub mod backup;
pub mod changefeed;
pub mod inspect;
pub mod verify;

use std::path::PathBuf;
use themis_core::{Config, CoreError, CoreResult, Database};

/// Opens the database from `--config` and/or `--path`, with environment
/// overrides applied.
pub fn open_database(path: Option<PathBuf>, config: Option<PathBuf>) -> CoreResult<Database> {
    let mut config = match config {
        Some(file) => Config::load(&file)?,
        None => Config::default(),
    };
    config.apply_env()?;
    if let Some(path) = path {
        config.storage.path = path.to_string_lossy().to_string();
    }
    if config.storage.path.is_empty() {
        return Err(CoreError::config_invalid(
            "a database path is required (--path or storage.path)",
        ));
    }
    Database::open(config)
}
