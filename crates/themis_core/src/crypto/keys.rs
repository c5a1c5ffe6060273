//! Key hierarchy: KEK, DEK, group DEKs, and field key derivation.

use crate::crypto::EncryptionContext;
use crate::error::{CoreError, CoreResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use themis_storage::{ColumnFamily, KvStore};
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of every key in the hierarchy, in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// A 256-bit secret key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CoreError::key_unavailable(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Returns the raw key bytes. Do not log or persist the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Which second-tier key a cached entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeySource {
    Dek,
    Group(String),
}

/// The key hierarchy manager.
///
/// Owns all key material. The KEK never leaves this struct; DEKs are cached
/// decrypted behind a read-write lock with write-through on rotation.
pub struct KeyHierarchy {
    store: Arc<KvStore>,
    service_id: String,
    kek: RwLock<Option<SecretKey>>,
    // (source, version) -> decrypted key
    cache: RwLock<HashMap<(KeySource, u32), SecretKey>>,
    // source -> latest version
    latest: RwLock<HashMap<KeySource, u32>>,
}

impl KeyHierarchy {
    /// Creates a hierarchy bound to a service id.
    pub fn new(store: Arc<KvStore>, service_id: impl Into<String>) -> Self {
        Self {
            store,
            service_id: service_id.into(),
            kek: RwLock::new(None),
            cache: RwLock::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
        }
    }

    fn ikm_key(&self) -> Vec<u8> {
        format!("kek:ikm:{}", self.service_id).into_bytes()
    }

    fn dek_key(version: u32) -> Vec<u8> {
        format!("dek:encrypted:v{version}").into_bytes()
    }

    fn group_key(group: &str, version: u32) -> Vec<u8> {
        format!("key:group:{group}:v{version}").into_bytes()
    }

    /// Ensures the KEK exists, generating and persisting the IKM on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the IKM cannot be read or persisted.
    pub fn ensure_kek(&self) -> CoreResult<()> {
        if self.kek.read().is_some() {
            return Ok(());
        }

        let ikm = match self.store.get(ColumnFamily::Default, &self.ikm_key())? {
            Some(bytes) => SecretKey::from_bytes(&bytes)?,
            None => {
                let ikm = SecretKey::generate();
                self.store.put(
                    ColumnFamily::Default,
                    self.ikm_key(),
                    ikm.as_bytes().to_vec(),
                )?;
                info!(service = %self.service_id, "generated key-encryption IKM");
                ikm
            }
        };

        let kek = hkdf_expand(
            ikm.as_bytes(),
            b"themis-kek",
            format!("kek:{}", self.service_id).as_bytes(),
        )?;
        *self.kek.write() = Some(kek);
        Ok(())
    }

    fn kek(&self) -> CoreResult<SecretKey> {
        self.kek
            .read()
            .clone()
            .ok_or_else(|| CoreError::key_unavailable("KEK not initialized"))
    }

    /// Ensures a DEK exists, creating version 1 on first use, and loads the
    /// latest version into the cache.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyUnavailable`] if the KEK is missing.
    pub fn ensure_dek(&self) -> CoreResult<u32> {
        self.ensure_source(&KeySource::Dek)
    }

    /// Ensures a group DEK exists for `group`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyUnavailable`] if the KEK is missing.
    pub fn ensure_group_dek(&self, group: &str) -> CoreResult<u32> {
        self.ensure_source(&KeySource::Group(group.to_string()))
    }

    fn ensure_source(&self, source: &KeySource) -> CoreResult<u32> {
        if let Some(version) = self.latest.read().get(source) {
            return Ok(*version);
        }

        let latest_stored = self.scan_latest_version(source)?;
        let version = match latest_stored {
            Some(version) => {
                // Warm the cache with the decrypted key.
                self.load_key(source, version)?;
                version
            }
            None => {
                self.persist_new_version(source, 1)?;
                1
            }
        };
        self.latest.write().insert(source.clone(), version);
        Ok(version)
    }

    fn scan_latest_version(&self, source: &KeySource) -> CoreResult<Option<u32>> {
        let prefix = match source {
            KeySource::Dek => b"dek:encrypted:v".to_vec(),
            KeySource::Group(group) => format!("key:group:{group}:v").into_bytes(),
        };
        let entries = self
            .store
            .scan_prefix(ColumnFamily::Default, &prefix, None, false)?;
        let mut max = None;
        for (key, _) in entries {
            let suffix = &key[prefix.len()..];
            if let Ok(text) = std::str::from_utf8(suffix) {
                if let Ok(version) = text.parse::<u32>() {
                    max = Some(max.map_or(version, |m: u32| m.max(version)));
                }
            }
        }
        Ok(max)
    }

    fn persist_new_version(&self, source: &KeySource, version: u32) -> CoreResult<()> {
        let kek = self.kek()?;
        let key = SecretKey::generate();
        let sealed = seal(&kek, key.as_bytes())?;

        let storage_key = match source {
            KeySource::Dek => Self::dek_key(version),
            KeySource::Group(group) => Self::group_key(group, version),
        };
        self.store
            .put(ColumnFamily::Default, storage_key, sealed)?;
        self.cache
            .write()
            .insert((source.clone(), version), key);
        info!(?version, "persisted new data-encryption key version");
        Ok(())
    }

    fn load_key(&self, source: &KeySource, version: u32) -> CoreResult<SecretKey> {
        if let Some(key) = self.cache.read().get(&(source.clone(), version)) {
            return Ok(key.clone());
        }

        let storage_key = match source {
            KeySource::Dek => Self::dek_key(version),
            KeySource::Group(group) => Self::group_key(group, version),
        };
        let sealed = self
            .store
            .get(ColumnFamily::Default, &storage_key)?
            .ok_or_else(|| {
                CoreError::key_unavailable(format!("no key material at version {version}"))
            })?;

        let kek = self.kek()?;
        let bytes = open(&kek, &sealed)?;
        let key = SecretKey::from_bytes(&bytes)?;
        self.cache
            .write()
            .insert((source.clone(), version), key.clone());
        Ok(key)
    }

    /// Returns the current DEK version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyUnavailable`] if no DEK exists yet.
    pub fn dek_version(&self) -> CoreResult<u32> {
        self.latest
            .read()
            .get(&KeySource::Dek)
            .copied()
            .ok_or_else(|| CoreError::key_unavailable("DEK not initialized"))
    }

    /// Returns the current group DEK version for `group`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyUnavailable`] if the group has no DEK.
    pub fn group_dek_version(&self, group: &str) -> CoreResult<u32> {
        self.latest
            .read()
            .get(&KeySource::Group(group.to_string()))
            .copied()
            .ok_or_else(|| {
                CoreError::key_unavailable(format!("group '{group}' has no DEK"))
            })
    }

    /// Rotates the DEK to a new version. Existing blobs stay readable
    /// through their recorded version; re-encryption is lazy.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyUnavailable`] if the KEK is missing.
    pub fn rotate_dek(&self) -> CoreResult<u32> {
        self.rotate(&KeySource::Dek)
    }

    /// Rotates a group DEK to a new version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyUnavailable`] if the KEK is missing.
    pub fn rotate_group_dek(&self, group: &str) -> CoreResult<u32> {
        self.rotate(&KeySource::Group(group.to_string()))
    }

    fn rotate(&self, source: &KeySource) -> CoreResult<u32> {
        let current = self.ensure_source(source)?;
        let next = current + 1;
        self.persist_new_version(source, next)?;
        self.latest.write().insert(source.clone(), next);
        Ok(next)
    }

    /// Derives the field key for `(ctx, field)` at a specific key version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyUnavailable`] if the version's key material
    /// is missing.
    pub fn derive_field_key(
        &self,
        ctx: &EncryptionContext,
        field: &str,
        version: u32,
    ) -> CoreResult<SecretKey> {
        let source = match &ctx.group {
            Some(group) => KeySource::Group(group.clone()),
            None => KeySource::Dek,
        };
        let base = self.load_key(&source, version)?;
        hkdf_expand(base.as_bytes(), ctx.salt(), format!("field:{field}").as_bytes())
    }

    /// Returns the latest key version applicable to a context.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyUnavailable`] if the context's key source is
    /// uninitialized.
    pub fn latest_version(&self, ctx: &EncryptionContext) -> CoreResult<u32> {
        match &ctx.group {
            Some(group) => self.ensure_group_dek(group),
            None => self.ensure_dek(),
        }
    }

    /// Returns the key id recorded in blobs for this context.
    #[must_use]
    pub fn key_id(&self, ctx: &EncryptionContext) -> String {
        match &ctx.group {
            Some(group) => format!("group:{group}"),
            None => self.service_id.clone(),
        }
    }
}

impl std::fmt::Debug for KeyHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHierarchy")
            .field("service_id", &self.service_id)
            .finish_non_exhaustive()
    }
}

/// HKDF-SHA256 expansion to a 32-byte key.
fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8]) -> CoreResult<SecretKey> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut bytes = [0u8; KEY_SIZE];
    hk.expand(info, &mut bytes)
        .map_err(|_| CoreError::key_unavailable("HKDF expand failed"))?;
    Ok(SecretKey { bytes })
}

/// Encrypts `plaintext` under `key`, producing `iv || ct || tag`.
pub(crate) fn seal(key: &SecretKey, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CoreError::auth_failure("encryption error"))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend(ciphertext);
    Ok(out)
}

/// Decrypts `iv || ct || tag` under `key`.
pub(crate) fn open(key: &SecretKey, sealed: &[u8]) -> CoreResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CoreError::auth_failure("ciphertext too short"));
    }
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
    cipher
        .decrypt(nonce, &sealed[NONCE_SIZE..])
        .map_err(|_| CoreError::auth_failure("authentication tag mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy() -> KeyHierarchy {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let h = KeyHierarchy::new(store, "themis");
        h.ensure_kek().unwrap();
        h
    }

    #[test]
    fn kek_is_stable_across_instances() {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let h1 = KeyHierarchy::new(Arc::clone(&store), "themis");
        h1.ensure_kek().unwrap();
        h1.ensure_dek().unwrap();

        let h2 = KeyHierarchy::new(store, "themis");
        h2.ensure_kek().unwrap();
        h2.ensure_dek().unwrap();

        // Same persisted IKM and DEK: derived field keys must agree.
        let ctx = EncryptionContext::user("alice");
        let k1 = h1.derive_field_key(&ctx, "ssn", 1).unwrap();
        let k2 = h2.derive_field_key(&ctx, "ssn", 1).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn dek_versions_start_at_one() {
        let h = hierarchy();
        assert_eq!(h.ensure_dek().unwrap(), 1);
        assert_eq!(h.dek_version().unwrap(), 1);
    }

    #[test]
    fn rotation_bumps_version_and_keeps_old_keys() {
        let h = hierarchy();
        h.ensure_dek().unwrap();
        let ctx = EncryptionContext::anonymous();
        let old = h.derive_field_key(&ctx, "f", 1).unwrap();

        let v2 = h.rotate_dek().unwrap();
        assert_eq!(v2, 2);

        // Old version still derivable for lazy decryption.
        let old_again = h.derive_field_key(&ctx, "f", 1).unwrap();
        assert_eq!(old.as_bytes(), old_again.as_bytes());

        // New version differs.
        let new = h.derive_field_key(&ctx, "f", 2).unwrap();
        assert_ne!(old.as_bytes(), new.as_bytes());
    }

    #[test]
    fn group_deks_are_independent() {
        let h = hierarchy();
        h.ensure_dek().unwrap();
        h.ensure_group_dek("medical").unwrap();

        let dek_key = h
            .derive_field_key(&EncryptionContext::anonymous(), "f", 1)
            .unwrap();
        let group_key = h
            .derive_field_key(&EncryptionContext::group("medical"), "f", 1)
            .unwrap();
        assert_ne!(dek_key.as_bytes(), group_key.as_bytes());

        assert_eq!(h.rotate_group_dek("medical").unwrap(), 2);
        assert_eq!(h.group_dek_version("medical").unwrap(), 2);
        // Database DEK version unchanged.
        assert_eq!(h.dek_version().unwrap(), 1);
    }

    #[test]
    fn user_salt_changes_field_key() {
        let h = hierarchy();
        h.ensure_dek().unwrap();
        let alice = h
            .derive_field_key(&EncryptionContext::user("alice"), "ssn", 1)
            .unwrap();
        let bob = h
            .derive_field_key(&EncryptionContext::user("bob"), "ssn", 1)
            .unwrap();
        assert_ne!(alice.as_bytes(), bob.as_bytes());
    }

    #[test]
    fn field_name_changes_field_key() {
        let h = hierarchy();
        h.ensure_dek().unwrap();
        let ctx = EncryptionContext::user("alice");
        let a = h.derive_field_key(&ctx, "ssn", 1).unwrap();
        let b = h.derive_field_key(&ctx, "email", 1).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = SecretKey::generate();
        let sealed = seal(&key, b"payload").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"payload");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let sealed = seal(&SecretKey::generate(), b"payload").unwrap();
        let err = open(&SecretKey::generate(), &sealed).unwrap_err();
        assert_eq!(err.kind(), "AuthFailure");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = SecretKey::generate();
        let mut sealed = seal(&key, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert_eq!(open(&key, &sealed).unwrap_err().kind(), "AuthFailure");
    }
}
