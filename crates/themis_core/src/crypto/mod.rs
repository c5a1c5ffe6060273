//! Field-level encryption for ThemisDB.
//!
//! Implements a three-tier key hierarchy:
//!
//! 1. **KEK** — derived by HKDF-SHA256 from a 32-byte IKM persisted at
//!    `kek:ikm:<service>`; the IKM is generated once from a secure random
//!    source.
//! 2. **DEK** (and per-group DEKs) — 32 random bytes, stored encrypted
//!    under the KEK at `dek:encrypted:v<n>` / `key:group:<g>:v<n>` as
//!    `iv || ct || tag`.
//! 3. **Field keys** — derived per `(context, field)` as
//!    `HKDF(SHA-256, key = DEK_or_GroupDEK, salt = user_id_or_empty,
//!    info = "field:<name>")`.
//!
//! Field payloads are encrypted with AES-256-GCM into a JSON blob
//! `{iv, ciphertext, tag, key_id, key_version}` stored in the entity's
//! `<name>_encrypted` companion; the plaintext slot is cleared in the same
//! mutation. Key material is zeroized on drop.

mod field;
mod keys;

pub use field::{decrypt_entity_fields, DecryptReport, EncryptedBlob, FieldCipher};
pub use keys::{KeyHierarchy, SecretKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

pub(crate) use keys::{open as open_bytes, seal as seal_bytes};

/// Caller identity driving key derivation.
///
/// A `user` context salts field keys with the user id, so two users'
/// ciphertexts for the same field are not interchangeable. A `group`
/// context replaces the DEK with the group's DEK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionContext {
    /// Salting user id. `None` salts with the empty string.
    pub user_id: Option<String>,
    /// Group whose DEK replaces the database DEK.
    pub group: Option<String>,
}

impl EncryptionContext {
    /// Context for a specific user.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            group: None,
        }
    }

    /// Context for a group; field keys derive from the group DEK.
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            user_id: None,
            group: Some(group.into()),
        }
    }

    /// Context for a user acting within a group.
    pub fn user_in_group(user_id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            group: Some(group.into()),
        }
    }

    /// Anonymous context: empty salt, database DEK.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Returns the HKDF salt for this context.
    #[must_use]
    pub fn salt(&self) -> &[u8] {
        self.user_id.as_deref().map_or(b"", str::as_bytes)
    }
}
