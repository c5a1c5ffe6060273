//! `backup restore` command.

use std::path::Path;
use themis_core::{CoreError, CoreResult};
use themis_storage::{KvStore, KvStoreOptions};

/// Restores a checkpoint into a fresh database directory.
///
/// A checkpoint is itself an openable database directory; restore opens
/// it read-only and writes a compacted copy to the destination.
pub fn restore(input: &Path, output: &Path) -> CoreResult<()> {
    if output.exists() && output.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false) {
        return Err(CoreError::invalid_operation(format!(
            "destination {} is not empty",
            output.display()
        )));
    }
    let source = KvStore::open(input, KvStoreOptions::default())?;
    source.checkpoint(output)?;
    source.close()?;
    Ok(())
}
