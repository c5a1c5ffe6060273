//! Content blob store with upload policy enforcement.
//!
//! Blobs live at `content_blob:<id>` in the default column family. When
//! encryption is enabled the payload is sealed under a per-user derived
//! key (context salt = user id or `"anonymous"`) and stored as the usual
//! `{iv, ciphertext, tag, key_id, key_version}` envelope; reads lazily
//! re-encrypt to the latest key version.
//!
//! Upload validation is a total function of `(mime, size, policy)` with
//! precedence `denied > allowed (with size cap) > category rule > default`.

use crate::crypto::{EncryptedBlob, EncryptionContext, KeyHierarchy};
use crate::error::{CoreError, CoreResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use themis_storage::{ColumnFamily, KvStore};
use tracing::{debug, warn};

/// Allow/deny decision in policy rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    /// Accept the upload.
    Allow,
    /// Reject the upload.
    Deny,
}

/// A MIME type explicitly allowed, optionally size-capped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedRule {
    /// Exact MIME type.
    pub mime: String,
    /// Size cap in bytes; falls back to `default_max_size`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u64>,
}

/// A MIME type explicitly denied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeniedRule {
    /// Exact MIME type.
    pub mime: String,
    /// Reason reported to the caller.
    pub reason: String,
}

/// A per-category rule (`text`, `image`, `video`, `audio`, `application`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    /// Allow or deny the category.
    pub action: PolicyAction,
    /// Size cap for allowed categories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u64>,
    /// Reason for denied categories.
    #[serde(default)]
    pub reason: String,
}

/// The upload policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPolicy {
    /// Fallback size cap.
    pub default_max_size: u64,
    /// Fallback decision for unmatched MIME types.
    pub default_action: PolicyAction,
    /// Explicit allows.
    #[serde(default)]
    pub allowed: Vec<AllowedRule>,
    /// Explicit denies.
    #[serde(default)]
    pub denied: Vec<DeniedRule>,
    /// Category rules.
    #[serde(default)]
    pub category_rules: HashMap<String, CategoryRule>,
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self {
            default_max_size: 25 * 1024 * 1024,
            default_action: PolicyAction::Deny,
            allowed: [
                "text/plain",
                "text/markdown",
                "text/csv",
                "application/json",
                "application/pdf",
                "image/png",
                "image/jpeg",
            ]
            .into_iter()
            .map(|mime| AllowedRule {
                mime: mime.to_string(),
                max_size: None,
            })
            .collect(),
            denied: vec![DeniedRule {
                mime: "application/x-msdownload".to_string(),
                reason: "executables are not accepted".to_string(),
            }],
            category_rules: HashMap::new(),
        }
    }
}

/// Maps a filename extension to a MIME type.
#[must_use]
pub fn mime_from_extension(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "exe" => "application/x-msdownload",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

fn category_of(mime: &str) -> &str {
    mime.split_once('/').map_or("application", |(cat, _)| cat)
}

/// Stored blob record.
#[derive(Debug, Serialize, Deserialize)]
struct BlobRecord {
    mime: String,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    envelope: Option<EncryptedBlob>,
    /// Plaintext payload (base64) when encryption is disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

/// The content manager.
pub struct ContentManager {
    store: Arc<KvStore>,
    policy: ContentPolicy,
    /// Encrypts blobs when present; plaintext storage otherwise.
    keys: Option<Arc<KeyHierarchy>>,
}

impl ContentManager {
    /// Creates a manager with a policy and optional encryption.
    pub fn new(
        store: Arc<KvStore>,
        policy: ContentPolicy,
        keys: Option<Arc<KeyHierarchy>>,
    ) -> Self {
        Self { store, policy, keys }
    }

    fn blob_key(id: &str) -> Vec<u8> {
        format!("content_blob:{id}").into_bytes()
    }

    fn blob_context(user_id: Option<&str>) -> EncryptionContext {
        EncryptionContext::user(user_id.unwrap_or("anonymous"))
    }

    /// Validates an upload against the policy.
    ///
    /// The decision depends only on `(mime_from_extension(filename), size,
    /// policy)`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PolicyDenied`] with structured flags on any
    /// rejection.
    pub fn validate_upload(&self, filename: &str, size: u64) -> CoreResult<()> {
        let mime = mime_from_extension(filename);

        // 1. Explicit denies win.
        if let Some(rule) = self.policy.denied.iter().find(|r| r.mime == mime) {
            return Err(CoreError::policy_denied(
                rule.reason.clone(),
                true,
                false,
                false,
            ));
        }

        // 2. Explicit allows, with their size cap.
        if let Some(rule) = self.policy.allowed.iter().find(|r| r.mime == mime) {
            let cap = rule.max_size.unwrap_or(self.policy.default_max_size);
            if size > cap {
                return Err(CoreError::policy_denied(
                    format!("{mime} uploads are capped at {cap} bytes"),
                    false,
                    true,
                    false,
                ));
            }
            return Ok(());
        }

        // 3. Category rules.
        if let Some(rule) = self.policy.category_rules.get(category_of(mime)) {
            match rule.action {
                PolicyAction::Deny => {
                    return Err(CoreError::policy_denied(
                        rule.reason.clone(),
                        true,
                        false,
                        false,
                    ));
                }
                PolicyAction::Allow => {
                    let cap = rule.max_size.unwrap_or(self.policy.default_max_size);
                    if size > cap {
                        return Err(CoreError::policy_denied(
                            format!("{mime} uploads are capped at {cap} bytes"),
                            false,
                            true,
                            false,
                        ));
                    }
                    return Ok(());
                }
            }
        }

        // 4. Default.
        match self.policy.default_action {
            PolicyAction::Deny => Err(CoreError::policy_denied(
                format!("{mime} is not on the allow list"),
                false,
                false,
                true,
            )),
            PolicyAction::Allow => {
                if size > self.policy.default_max_size {
                    return Err(CoreError::policy_denied(
                        format!("uploads are capped at {} bytes", self.policy.default_max_size),
                        false,
                        true,
                        false,
                    ));
                }
                Ok(())
            }
        }
    }

    /// Imports a blob after policy validation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PolicyDenied`] on rejection and crypto errors
    /// when encryption is enabled.
    pub fn import(
        &self,
        id: &str,
        filename: &str,
        bytes: &[u8],
        user_id: Option<&str>,
    ) -> CoreResult<()> {
        self.validate_upload(filename, bytes.len() as u64)?;
        let mime = mime_from_extension(filename).to_string();
        self.store_record(id, mime, bytes, user_id)
    }

    /// Persists a blob record, encrypting under the caller's derived key
    /// when encryption is enabled. Policy validation happens in
    /// [`ContentManager::import`]; the lazy re-encryption path reuses this
    /// directly.
    fn store_record(
        &self,
        id: &str,
        mime: String,
        bytes: &[u8],
        user_id: Option<&str>,
    ) -> CoreResult<()> {
        let record = match &self.keys {
            Some(keys) => {
                let ctx = Self::blob_context(user_id);
                let version = keys.latest_version(&ctx)?;
                let key = keys.derive_field_key(&ctx, "content_blob", version)?;
                let sealed = crate::crypto::seal_bytes(&key, bytes)?;
                BlobRecord {
                    mime,
                    size: bytes.len() as u64,
                    envelope: Some(EncryptedBlob::from_sealed_bytes(
                        &sealed,
                        keys.key_id(&ctx),
                        version,
                    )?),
                    payload: None,
                }
            }
            None => BlobRecord {
                mime,
                size: bytes.len() as u64,
                envelope: None,
                payload: Some(BASE64.encode(bytes)),
            },
        };

        let value = serde_json::to_vec(&record)
            .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
        self.store
            .put(ColumnFamily::Default, Self::blob_key(id), value)?;
        debug!(id, "content blob imported");
        Ok(())
    }

    /// Reads a blob, decrypting under the caller's identity.
    ///
    /// When the stored envelope predates the latest key version, the blob
    /// is re-encrypted with the latest key before returning (the
    /// lazy-rewrite policy).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and `AuthFailure` on tag
    /// mismatch.
    pub fn get(&self, id: &str, user_id: Option<&str>) -> CoreResult<Vec<u8>> {
        let raw = self
            .store
            .get(ColumnFamily::Default, &Self::blob_key(id))?
            .ok_or_else(|| CoreError::not_found(format!("content_blob:{id}")))?;
        let record: BlobRecord = serde_json::from_slice(&raw)
            .map_err(|e| CoreError::invalid_operation(format!("corrupt blob record: {e}")))?;

        match (&record.envelope, &record.payload, &self.keys) {
            (Some(envelope), _, Some(keys)) => {
                let ctx = Self::blob_context(user_id);
                let key = keys.derive_field_key(&ctx, "content_blob", envelope.key_version)?;
                let bytes = crate::crypto::open_bytes(&key, &envelope.to_sealed_bytes()?)?;

                let latest = keys.latest_version(&ctx)?;
                if envelope.key_version < latest {
                    if let Err(err) =
                        self.store_record(id, record.mime.clone(), &bytes, user_id)
                    {
                        warn!(id, error = %err, "lazy blob re-encryption failed");
                    }
                }
                Ok(bytes)
            }
            (None, Some(payload), _) => BASE64
                .decode(payload)
                .map_err(|_| CoreError::invalid_operation("corrupt blob payload")),
            (Some(_), _, None) => Err(CoreError::key_unavailable(
                "blob is encrypted but encryption is disabled",
            )),
            (None, None, _) => Err(CoreError::invalid_operation("empty blob record")),
        }
    }

    /// Returns a blob's MIME type and size without decrypting.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids.
    pub fn metadata(&self, id: &str) -> CoreResult<(String, u64)> {
        let raw = self
            .store
            .get(ColumnFamily::Default, &Self::blob_key(id))?
            .ok_or_else(|| CoreError::not_found(format!("content_blob:{id}")))?;
        let record: BlobRecord = serde_json::from_slice(&raw)
            .map_err(|e| CoreError::invalid_operation(format!("corrupt blob record: {e}")))?;
        Ok((record.mime, record.size))
    }
}

impl std::fmt::Debug for ContentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentManager")
            .field("encrypted", &self.keys.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ContentPolicy {
        ContentPolicy {
            default_max_size: 25 * 1024 * 1024,
            default_action: PolicyAction::Deny,
            allowed: vec![AllowedRule {
                mime: "text/plain".to_string(),
                max_size: Some(10 * 1024 * 1024),
            }],
            denied: vec![DeniedRule {
                mime: "application/x-msdownload".to_string(),
                reason: "executables are not accepted".to_string(),
            }],
            category_rules: HashMap::from([(
                "image".to_string(),
                CategoryRule {
                    action: PolicyAction::Allow,
                    max_size: Some(5 * 1024 * 1024),
                    reason: String::new(),
                },
            )]),
        }
    }

    fn plain_manager() -> ContentManager {
        ContentManager::new(
            Arc::new(KvStore::open_in_memory().unwrap()),
            policy(),
            None,
        )
    }

    fn flags(err: &CoreError) -> (bool, bool, bool) {
        match err {
            CoreError::PolicyDenied {
                blacklisted,
                size_exceeded,
                not_whitelisted,
                ..
            } => (*blacklisted, *size_exceeded, *not_whitelisted),
            other => panic!("expected PolicyDenied, got {other:?}"),
        }
    }

    #[test]
    fn allowed_mime_within_cap() {
        let manager = plain_manager();
        assert!(manager.validate_upload("doc.txt", 1024 * 1024).is_ok());
    }

    #[test]
    fn allowed_mime_over_cap_is_size_exceeded() {
        let manager = plain_manager();
        let err = manager
            .validate_upload("doc.txt", 20 * 1024 * 1024)
            .unwrap_err();
        assert_eq!(flags(&err), (false, true, false));
    }

    #[test]
    fn denied_mime_is_blacklisted() {
        let manager = plain_manager();
        let err = manager.validate_upload("a.exe", 1024).unwrap_err();
        assert_eq!(flags(&err), (true, false, false));
    }

    #[test]
    fn category_rule_applies() {
        let manager = plain_manager();
        assert!(manager.validate_upload("photo.png", 1024).is_ok());
        let err = manager
            .validate_upload("photo.png", 6 * 1024 * 1024)
            .unwrap_err();
        assert_eq!(flags(&err), (false, true, false));
    }

    #[test]
    fn unmatched_mime_is_not_whitelisted() {
        let manager = plain_manager();
        let err = manager.validate_upload("movie.mp4", 1024).unwrap_err();
        assert_eq!(flags(&err), (false, false, true));
    }

    #[test]
    fn decision_is_stateless() {
        let manager = plain_manager();
        for _ in 0..3 {
            assert!(manager.validate_upload("doc.txt", 100).is_ok());
            assert!(manager.validate_upload("a.exe", 100).is_err());
        }
    }

    #[test]
    fn plaintext_roundtrip() {
        let manager = plain_manager();
        manager.import("b1", "doc.txt", b"hello", None).unwrap();
        assert_eq!(manager.get("b1", None).unwrap(), b"hello");
        let (mime, size) = manager.metadata("b1").unwrap();
        assert_eq!(mime, "text/plain");
        assert_eq!(size, 5);
    }

    #[test]
    fn missing_blob_is_not_found() {
        let manager = plain_manager();
        assert_eq!(manager.get("nope", None).unwrap_err().kind(), "NotFound");
    }

    fn encrypted_manager() -> ContentManager {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let keys = Arc::new(KeyHierarchy::new(Arc::clone(&store), "themis"));
        keys.ensure_kek().unwrap();
        keys.ensure_dek().unwrap();
        ContentManager::new(store, policy(), Some(keys))
    }

    #[test]
    fn encrypted_roundtrip_per_user() {
        let manager = encrypted_manager();
        manager
            .import("b1", "doc.txt", b"secret", Some("alice"))
            .unwrap();
        assert_eq!(manager.get("b1", Some("alice")).unwrap(), b"secret");

        // Another user's derived key cannot open the blob.
        let err = manager.get("b1", Some("bob")).unwrap_err();
        assert_eq!(err.kind(), "AuthFailure");
    }

    #[test]
    fn anonymous_context_default() {
        let manager = encrypted_manager();
        manager.import("b1", "doc.txt", b"public", None).unwrap();
        assert_eq!(manager.get("b1", None).unwrap(), b"public");
    }

    #[test]
    fn lazy_reencryption_after_rotation() {
        let manager = encrypted_manager();
        manager
            .import("b1", "doc.txt", b"secret", Some("alice"))
            .unwrap();

        manager.keys.as_ref().unwrap().rotate_dek().unwrap();

        // Read triggers the rewrite; content unchanged.
        assert_eq!(manager.get("b1", Some("alice")).unwrap(), b"secret");

        // The stored envelope now carries the latest version.
        let raw = manager
            .store
            .get(ColumnFamily::Default, b"content_blob:b1")
            .unwrap()
            .unwrap();
        let record: BlobRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record.envelope.unwrap().key_version, 2);
    }
}
