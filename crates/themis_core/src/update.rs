//! Manifest-driven atomic update and hot reload.
//!
//! A manifest lists staged files with their hashes and carries a
//! manifest-level signature over the canonical manifest hash. Apply order:
//! verify version compatibility, verify every staged file, verify the
//! manifest signature, snapshot the files being replaced into a rollback
//! directory, then rename everything into place. Any failure restores
//! from the rollback snapshot.

use crate::audit::Signer;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One file listed in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Path relative to the install root.
    pub path: String,
    /// File role (`binary`, `config`, `resource`).
    #[serde(rename = "type")]
    pub file_type: String,
    /// Hex SHA-256 of the staged file.
    pub sha256: String,
    /// Expected size in bytes.
    pub size: u64,
    /// Target platform (`linux`, `darwin`, `windows`, `any`).
    #[serde(default = "any_string")]
    pub platform: String,
    /// Target architecture (`x86_64`, `aarch64`, `any`).
    #[serde(default = "any_string")]
    pub arch: String,
    /// Source URL (informational; download happens before apply).
    #[serde(default)]
    pub download_url: String,
}

fn any_string() -> String {
    "any".to_string()
}

/// An update manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Version being installed.
    pub version: String,
    /// Oldest version this update can upgrade from.
    #[serde(default)]
    pub min_upgrade_from: String,
    /// Files in the update.
    pub files: Vec<ManifestFile>,
    /// Base64 signature over the canonical manifest hash.
    #[serde(default)]
    pub signature: String,
}

impl Manifest {
    /// The canonical hash the signature covers: the manifest JSON with an
    /// empty signature field.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn canonical_hash(&self) -> CoreResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        let value = serde_json::to_value(&unsigned)
            .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
        let canonical = themis_codec::canonical_json(&value);
        Ok(Sha256::digest(canonical.as_bytes()).to_vec())
    }
}

/// Outcome of an applied update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    /// Files renamed into place.
    pub replaced: Vec<String>,
    /// Location of the pre-update snapshot.
    pub rollback_dir: PathBuf,
}

/// The update manager.
pub struct UpdateManager {
    /// Install root receiving files.
    target_dir: PathBuf,
    /// Pre-update snapshots live here.
    rollback_root: PathBuf,
    /// Verifies manifest signatures when installed.
    verifier: Option<Box<dyn Signer>>,
}

impl UpdateManager {
    /// Creates a manager for an install root.
    pub fn new(target_dir: PathBuf, rollback_root: PathBuf) -> Self {
        Self {
            target_dir,
            rollback_root,
            verifier: None,
        }
    }

    /// Installs a signature verifier; unsigned manifests are then
    /// rejected.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Box<dyn Signer>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Compares dotted version strings segment-wise.
    fn version_at_least(version: &str, minimum: &str) -> bool {
        if minimum.is_empty() {
            return true;
        }
        let parse = |v: &str| -> Vec<u64> {
            v.split('.').map(|s| s.parse().unwrap_or(0)).collect()
        };
        let version = parse(version);
        let minimum = parse(minimum);
        for i in 0..version.len().max(minimum.len()) {
            let a = version.get(i).copied().unwrap_or(0);
            let b = minimum.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                std::cmp::Ordering::Greater => return true,
                std::cmp::Ordering::Less => return false,
                std::cmp::Ordering::Equal => {}
            }
        }
        true
    }

    /// Applies an update from `staged_dir` (already-downloaded files).
    ///
    /// # Errors
    ///
    /// Fails before any rename on incompatible versions, hash or size
    /// mismatches, or an invalid manifest signature. Failures after
    /// renames restore from the rollback snapshot before returning.
    pub fn apply(
        &self,
        manifest: &Manifest,
        staged_dir: &Path,
        current_version: &str,
    ) -> CoreResult<ApplyResult> {
        // Incompatible upgrades fail before any rename.
        if !Self::version_at_least(current_version, &manifest.min_upgrade_from) {
            return Err(CoreError::invalid_operation(format!(
                "cannot upgrade from {current_version}: requires at least {}",
                manifest.min_upgrade_from
            )));
        }

        // Per-file verification.
        for file in &manifest.files {
            let staged = staged_dir.join(&file.path);
            let bytes = fs::read(&staged).map_err(|e| {
                CoreError::invalid_operation(format!("staged file {} missing: {e}", file.path))
            })?;
            if bytes.len() as u64 != file.size {
                return Err(CoreError::auth_failure(format!(
                    "size mismatch for {}",
                    file.path
                )));
            }
            let hash = format!("{:x}", Sha256::digest(&bytes));
            if hash != file.sha256 {
                return Err(CoreError::auth_failure(format!(
                    "hash mismatch for {}",
                    file.path
                )));
            }
        }

        // Manifest signature.
        if let Some(verifier) = &self.verifier {
            use base64::engine::general_purpose::STANDARD as BASE64;
            use base64::Engine;
            let signature = BASE64
                .decode(&manifest.signature)
                .map_err(|_| CoreError::auth_failure("malformed manifest signature"))?;
            let digest = manifest.canonical_hash()?;
            if !verifier.verify(&digest, &signature)? {
                return Err(CoreError::auth_failure("manifest signature invalid"));
            }
        }

        // Snapshot existing files.
        let rollback_dir = self
            .rollback_root
            .join(format!("rollback-{}", manifest.version));
        fs::create_dir_all(&rollback_dir)?;
        for file in &manifest.files {
            let current = self.target_dir.join(&file.path);
            if current.exists() {
                let backup = rollback_dir.join(&file.path);
                if let Some(parent) = backup.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&current, &backup)?;
            }
        }

        // Atomic renames into place; restore everything on failure.
        let mut replaced = Vec::new();
        for file in &manifest.files {
            let staged = staged_dir.join(&file.path);
            let target = self.target_dir.join(&file.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if let Err(err) = fs::rename(&staged, &target) {
                warn!(file = %file.path, error = %err, "rename failed, rolling back");
                self.restore(&rollback_dir, &replaced)?;
                return Err(CoreError::Io(err));
            }
            replaced.push(file.path.clone());
        }

        info!(version = %manifest.version, files = replaced.len(), "update applied");
        Ok(ApplyResult {
            replaced,
            rollback_dir,
        })
    }

    /// Restores previously replaced files from a rollback snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a restore copy fails.
    pub fn restore(&self, rollback_dir: &Path, files: &[String]) -> CoreResult<()> {
        for path in files {
            let backup = rollback_dir.join(path);
            let target = self.target_dir.join(path);
            if backup.exists() {
                fs::copy(&backup, &target)?;
            } else {
                // The file did not exist before the update.
                let _ = fs::remove_file(&target);
            }
        }
        info!(files = files.len(), "rollback restored");
        Ok(())
    }
}

impl std::fmt::Debug for UpdateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateManager")
            .field("target_dir", &self.target_dir)
            .finish_non_exhaustive()
    }
}
