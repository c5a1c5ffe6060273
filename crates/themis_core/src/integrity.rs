//! Integrity verifier: signature registry for critical resource files.
//!
//! Each protected resource has a record at `security_sig:<resource_id>`
//! in the `security_signatures` column family. On load, the resource's
//! canonical SHA-256 is compared to the stored hash; the policy decides
//! whether a missing or mismatching signature warns or rejects.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use themis_storage::{ColumnFamily, KvStore};
use tracing::warn;

/// Behavior on a missing or mismatching signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyBehavior {
    /// Log a warning and continue.
    Warn,
    /// Fail the load.
    Reject,
}

/// The verifier policy. Read-only after initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityPolicy {
    /// Behavior when no signature is registered.
    pub missing: PolicyBehavior,
    /// Behavior when the hash does not match.
    pub mismatch: PolicyBehavior,
}

impl Default for IntegrityPolicy {
    fn default() -> Self {
        Self {
            missing: PolicyBehavior::Warn,
            mismatch: PolicyBehavior::Reject,
        }
    }
}

/// A registered signature record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Normalized resource id.
    pub resource_id: String,
    /// Hex SHA-256 of the resource content.
    pub hash: String,
    /// Hash algorithm (always `sha256`).
    pub algorithm: String,
    /// Registration time (ms since epoch).
    pub created_at: u64,
    /// Registering principal.
    pub created_by: String,
    /// Free-form comment.
    #[serde(default)]
    pub comment: String,
}

/// Outcome of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Hash matches the registered signature.
    Verified,
    /// No signature registered; policy allowed continuing.
    MissingTolerated,
    /// Hash mismatch; policy allowed continuing.
    MismatchTolerated,
}

/// The integrity verifier.
pub struct IntegrityVerifier {
    store: Arc<KvStore>,
    policy: IntegrityPolicy,
}

impl IntegrityVerifier {
    /// Creates a verifier with a policy.
    pub fn new(store: Arc<KvStore>, policy: IntegrityPolicy) -> Self {
        Self { store, policy }
    }

    /// Normalizes a resource id: collapses separators, strips `./`
    /// segments, and restricts the alphabet to `[A-Za-z0-9_./-]`.
    ///
    /// # Errors
    ///
    /// Returns an error for ids with `..` segments or forbidden
    /// characters.
    pub fn normalize_resource_id(raw: &str) -> CoreResult<String> {
        if raw.is_empty() {
            return Err(CoreError::invalid_operation("empty resource id"));
        }
        let ok = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-'));
        if !ok {
            return Err(CoreError::invalid_operation(format!(
                "resource id '{raw}' contains forbidden characters"
            )));
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    return Err(CoreError::invalid_operation(
                        "resource id must not contain '..'",
                    ));
                }
                other => segments.push(other),
            }
        }
        if segments.is_empty() {
            return Err(CoreError::invalid_operation("empty resource id"));
        }
        Ok(segments.join("/"))
    }

    fn record_key(resource_id: &str) -> Vec<u8> {
        format!("security_sig:{resource_id}").into_bytes()
    }

    /// Hex SHA-256 of resource content.
    #[must_use]
    pub fn canonical_hash(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        format!("{:x}", hasher.finalize())
    }

    /// Registers (or replaces) a resource signature.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid resource id or write failure.
    pub fn register(
        &self,
        resource_id: &str,
        content: &[u8],
        created_by: &str,
        comment: &str,
    ) -> CoreResult<SignatureRecord> {
        let resource_id = Self::normalize_resource_id(resource_id)?;
        let record = SignatureRecord {
            resource_id: resource_id.clone(),
            hash: Self::canonical_hash(content),
            algorithm: "sha256".to_string(),
            created_at: now_ms(),
            created_by: created_by.to_string(),
            comment: comment.to_string(),
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
        self.store.put(
            ColumnFamily::SecuritySignatures,
            Self::record_key(&resource_id),
            bytes,
        )?;
        Ok(record)
    }

    /// Fetches a registered record.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid id or read failure.
    pub fn get(&self, resource_id: &str) -> CoreResult<Option<SignatureRecord>> {
        let resource_id = Self::normalize_resource_id(resource_id)?;
        match self
            .store
            .get(ColumnFamily::SecuritySignatures, &Self::record_key(&resource_id))?
        {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                CoreError::invalid_operation(format!("corrupt signature record: {e}"))
            })?)),
        }
    }

    /// Removes a registered record. Returns false if absent.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid id or write failure.
    pub fn remove(&self, resource_id: &str) -> CoreResult<bool> {
        let resource_id = Self::normalize_resource_id(resource_id)?;
        let key = Self::record_key(&resource_id);
        let existed = self
            .store
            .get(ColumnFamily::SecuritySignatures, &key)?
            .is_some();
        if existed {
            self.store.delete(ColumnFamily::SecuritySignatures, key)?;
        }
        Ok(existed)
    }

    /// Lists every registered record.
    ///
    /// # Errors
    ///
    /// Returns an error on a scan failure.
    pub fn list(&self) -> CoreResult<Vec<SignatureRecord>> {
        let entries = self.store.scan_prefix(
            ColumnFamily::SecuritySignatures,
            b"security_sig:",
            None,
            false,
        )?;
        entries
            .iter()
            .map(|(_, bytes)| {
                serde_json::from_slice(bytes).map_err(|e| {
                    CoreError::invalid_operation(format!("corrupt signature record: {e}"))
                })
            })
            .collect()
    }

    /// Verifies resource content against its registered signature under
    /// the policy.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuthFailure`] when the policy rejects.
    pub fn verify(&self, resource_id: &str, content: &[u8]) -> CoreResult<VerifyOutcome> {
        let normalized = Self::normalize_resource_id(resource_id)?;
        let Some(record) = self.get(&normalized)? else {
            return match self.policy.missing {
                PolicyBehavior::Warn => {
                    warn!(resource = %normalized, "no signature registered");
                    Ok(VerifyOutcome::MissingTolerated)
                }
                PolicyBehavior::Reject => Err(CoreError::auth_failure(format!(
                    "no signature registered for '{normalized}'"
                ))),
            };
        };

        if Self::canonical_hash(content) == record.hash {
            return Ok(VerifyOutcome::Verified);
        }
        match self.policy.mismatch {
            PolicyBehavior::Warn => {
                warn!(resource = %normalized, "signature mismatch");
                Ok(VerifyOutcome::MismatchTolerated)
            }
            PolicyBehavior::Reject => Err(CoreError::auth_failure(format!(
                "signature mismatch for '{normalized}'"
            ))),
        }
    }
}

impl std::fmt::Debug for IntegrityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityVerifier")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
