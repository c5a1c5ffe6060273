//! Field encryption: blob envelope and entity helpers.

use crate::crypto::keys::{open, seal, KeyHierarchy, NONCE_SIZE, TAG_SIZE};
use crate::crypto::EncryptionContext;
use crate::error::{CoreError, CoreResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use themis_codec::{
    decode_fields, encode_fields, Entity, Value, ENC_BLOB_SUFFIX, ENC_FLAG_SUFFIX,
    ENC_GROUP_SUFFIX,
};
use tracing::warn;

/// Companion field recording a tolerated decrypt failure on read.
pub const DECRYPT_FAILED_SUFFIX: &str = "_decrypt_failed";

/// The JSON envelope stored in a field's `<name>_encrypted` companion.
///
/// Byte fields are base64 text; `iv` is 12 bytes and `tag` 16 bytes once
/// decoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedBlob {
    /// GCM nonce, base64.
    pub iv: String,
    /// Ciphertext without the tag, base64.
    pub ciphertext: String,
    /// GCM authentication tag, base64.
    pub tag: String,
    /// Identifier of the key source (service id or `group:<g>`).
    pub key_id: String,
    /// Version of the DEK or group DEK the field key derived from.
    pub key_version: u32,
}

impl EncryptedBlob {
    /// Splits a `iv || ct || tag` sealed payload into the envelope.
    pub(crate) fn from_sealed_bytes(
        sealed: &[u8],
        key_id: String,
        key_version: u32,
    ) -> CoreResult<Self> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CoreError::auth_failure("sealed payload too short"));
        }
        let tag_start = sealed.len() - TAG_SIZE;
        Ok(Self {
            iv: BASE64.encode(&sealed[..NONCE_SIZE]),
            ciphertext: BASE64.encode(&sealed[NONCE_SIZE..tag_start]),
            tag: BASE64.encode(&sealed[tag_start..]),
            key_id,
            key_version,
        })
    }

    /// Reassembles the `iv || ct || tag` sealed payload.
    pub(crate) fn to_sealed_bytes(&self) -> CoreResult<Vec<u8>> {
        let iv = BASE64
            .decode(&self.iv)
            .map_err(|_| CoreError::auth_failure("invalid iv encoding"))?;
        let ct = BASE64
            .decode(&self.ciphertext)
            .map_err(|_| CoreError::auth_failure("invalid ciphertext encoding"))?;
        let tag = BASE64
            .decode(&self.tag)
            .map_err(|_| CoreError::auth_failure("invalid tag encoding"))?;
        if iv.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
            return Err(CoreError::auth_failure("invalid iv or tag length"));
        }
        let mut sealed = Vec::with_capacity(iv.len() + ct.len() + tag.len());
        sealed.extend(iv);
        sealed.extend(ct);
        sealed.extend(tag);
        Ok(sealed)
    }
}

/// Report of a best-effort entity decryption pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecryptReport {
    /// Fields restored to plaintext.
    pub decrypted: Vec<String>,
    /// Fields left encrypted with a `<name>_decrypt_failed` marker.
    pub failed: Vec<String>,
}

/// Encrypts and decrypts entity fields under the key hierarchy.
pub struct FieldCipher {
    hierarchy: Arc<KeyHierarchy>,
}

impl FieldCipher {
    /// Creates a cipher over the hierarchy.
    pub fn new(hierarchy: Arc<KeyHierarchy>) -> Self {
        Self { hierarchy }
    }

    /// Returns the underlying key hierarchy.
    #[must_use]
    pub fn hierarchy(&self) -> &Arc<KeyHierarchy> {
        &self.hierarchy
    }

    /// Encrypts `field` in place with the latest key for `ctx`.
    ///
    /// The plaintext slot is cleared and the companions
    /// `<field>_enc = true`, `<field>_encrypted = blob` (and
    /// `<field>_group` under a group context) are set in the same mutation,
    /// so the entity never holds both forms.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the field is missing and
    /// [`CoreError::KeyUnavailable`] if the hierarchy is uninitialized.
    pub fn encrypt_field(
        &self,
        entity: &mut Entity,
        field: &str,
        ctx: &EncryptionContext,
    ) -> CoreResult<()> {
        let value = entity.get_field(field).cloned().ok_or_else(|| {
            CoreError::invalid_operation(format!("field '{field}' not present"))
        })?;

        let version = self.hierarchy.latest_version(ctx)?;
        let key = self.hierarchy.derive_field_key(ctx, field, version)?;

        let payload = encode_value_payload(field, &value)?;
        let sealed = seal(&key, &payload)?;
        let blob =
            EncryptedBlob::from_sealed_bytes(&sealed, self.hierarchy.key_id(ctx), version)?;
        let blob_json = serde_json::to_value(&blob)
            .map_err(|e| CoreError::invalid_operation(e.to_string()))?;

        entity.set_field(field, Value::Absent);
        entity.set_field(format!("{field}{ENC_FLAG_SUFFIX}"), Value::Bool(true));
        entity.set_field(format!("{field}{ENC_BLOB_SUFFIX}"), Value::Json(blob_json));
        if let Some(group) = &ctx.group {
            entity.set_field(
                format!("{field}{ENC_GROUP_SUFFIX}"),
                Value::Str(group.clone()),
            );
        }
        Ok(())
    }

    /// Decrypts `field`, returning the plaintext value.
    ///
    /// The entity is not modified; use [`FieldCipher::decrypt_entity`] to
    /// restore plaintext in place.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyUnavailable`] if no blob exists,
    /// [`CoreError::AuthFailure`] on tag mismatch, and
    /// [`CoreError::PolicyDenied`] if the caller's group context conflicts
    /// with the entity's recorded group.
    pub fn decrypt_field(
        &self,
        entity: &Entity,
        field: &str,
        ctx: &EncryptionContext,
    ) -> CoreResult<Value> {
        let (blob, effective_ctx) = self.read_blob(entity, field, ctx)?;
        let key =
            self.hierarchy
                .derive_field_key(&effective_ctx, field, blob.key_version)?;
        let payload = open(&key, &blob.to_sealed_bytes()?)?;
        decode_value_payload(field, &payload)
    }

    fn read_blob(
        &self,
        entity: &Entity,
        field: &str,
        ctx: &EncryptionContext,
    ) -> CoreResult<(EncryptedBlob, EncryptionContext)> {
        let blob_value = entity
            .get_field(&format!("{field}{ENC_BLOB_SUFFIX}"))
            .ok_or_else(|| {
                CoreError::key_unavailable(format!("field '{field}' has no encrypted blob"))
            })?;
        let blob_json = blob_value.as_json().ok_or_else(|| {
            CoreError::auth_failure(format!("field '{field}' blob is not JSON"))
        })?;
        let blob: EncryptedBlob = serde_json::from_value(blob_json.clone())
            .map_err(|e| CoreError::auth_failure(format!("malformed blob: {e}")))?;

        let recorded_group = entity
            .get_field(&format!("{field}{ENC_GROUP_SUFFIX}"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let effective_ctx = match (&recorded_group, &ctx.group) {
            (Some(recorded), Some(requested)) if recorded != requested => {
                return Err(CoreError::policy_denied(
                    format!(
                        "field '{field}' belongs to group '{recorded}', not '{requested}'"
                    ),
                    false,
                    false,
                    false,
                ));
            }
            (Some(recorded), _) => EncryptionContext {
                user_id: ctx.user_id.clone(),
                group: Some(recorded.clone()),
            },
            (None, _) => EncryptionContext {
                user_id: ctx.user_id.clone(),
                group: None,
            },
        };
        Ok((blob, effective_ctx))
    }

    /// Decrypts every encrypted field in place, best-effort.
    ///
    /// Failures do not abort the read: the field stays encrypted and gains
    /// a `<name>_decrypt_failed` marker (spec policy for read-path
    /// decryption failures).
    pub fn decrypt_entity(&self, entity: &mut Entity, ctx: &EncryptionContext) -> DecryptReport {
        let mut report = DecryptReport::default();
        for field in encrypted_field_names(entity) {
            match self.decrypt_field(entity, &field, ctx) {
                Ok(value) => {
                    entity.set_field(field.clone(), value);
                    entity.remove_field(&format!("{field}{ENC_FLAG_SUFFIX}"));
                    entity.remove_field(&format!("{field}{ENC_BLOB_SUFFIX}"));
                    entity.remove_field(&format!("{field}{ENC_GROUP_SUFFIX}"));
                    report.decrypted.push(field);
                }
                Err(err) => {
                    warn!(field = %field, error = %err, "field decrypt failed, returning encrypted form");
                    entity.set_field(
                        format!("{field}{DECRYPT_FAILED_SUFFIX}"),
                        Value::Bool(true),
                    );
                    report.failed.push(field);
                }
            }
        }
        report
    }

    /// Re-encrypts any field whose blob predates the latest key version.
    ///
    /// Returns the names of upgraded fields; when non-empty the caller
    /// persists the entity (the lazy-rewrite policy).
    ///
    /// # Errors
    ///
    /// Returns an error if decryption of a stale field fails; up-to-date
    /// fields are left untouched.
    pub fn upgrade_stale_fields(
        &self,
        entity: &mut Entity,
        ctx: &EncryptionContext,
    ) -> CoreResult<Vec<String>> {
        let mut upgraded = Vec::new();
        for field in encrypted_field_names(entity) {
            let (blob, effective_ctx) = self.read_blob(entity, &field, ctx)?;
            let latest = self.hierarchy.latest_version(&effective_ctx)?;
            if blob.key_version >= latest {
                continue;
            }
            let value = self.decrypt_field(entity, &field, ctx)?;
            entity.set_field(field.clone(), value);
            entity.remove_field(&format!("{field}{ENC_BLOB_SUFFIX}"));
            self.encrypt_field(entity, &field, &effective_ctx)?;
            upgraded.push(field);
        }
        Ok(upgraded)
    }
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

/// Decrypts all encrypted fields of an entity with a shared cipher.
///
/// Convenience wrapper used by read paths that hold a cipher reference.
pub fn decrypt_entity_fields(
    cipher: &FieldCipher,
    entity: &mut Entity,
    ctx: &EncryptionContext,
) -> DecryptReport {
    cipher.decrypt_entity(entity, ctx)
}

fn encrypted_field_names(entity: &Entity) -> Vec<String> {
    entity
        .fields()
        .iter()
        .filter_map(|(name, value)| {
            let base = name.strip_suffix(ENC_FLAG_SUFFIX)?;
            if value.as_bool() == Some(true) {
                Some(base.to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Serializes a single field value as a one-field canonical record, making
/// the encrypted payload self-describing.
fn encode_value_payload(field: &str, value: &Value) -> CoreResult<Vec<u8>> {
    let mut map = BTreeMap::new();
    map.insert(field.to_string(), value.clone());
    Ok(encode_fields(&map, false)?)
}

fn decode_value_payload(field: &str, payload: &[u8]) -> CoreResult<Value> {
    let (mut fields, _) = decode_fields(payload)?;
    fields.remove(field).ok_or_else(|| {
        CoreError::auth_failure(format!("payload does not contain field '{field}'"))
    })
}
