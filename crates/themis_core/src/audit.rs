//! Audit log with hash-chain linkage.
//!
//! Events are JSON records at `audit:<seq20>` in the default column
//! family, chained by `hash = SHA-256(prev_hash || canonical_json(event
//! without hash))`. Startup verifies the chain end-to-end; a break emits
//! `ChainViolation` and the policy decides between failing and degraded
//! mode. Events in policy-listed categories (default `SAGA`, `AUDIT`) are
//! wrapped in an encrypt-then-sign envelope before persistence when a key
//! hierarchy and signer are installed.

use crate::crypto::{EncryptionContext, KeyHierarchy};
use crate::error::{CoreError, CoreResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use themis_storage::{ColumnFamily, KvStore};
use tracing::{error, warn};

const SEQ_WIDTH: usize = 20;

/// External signer collaborator (PKI/HSM custody is out of core).
pub trait Signer: Send + Sync {
    /// Signs a digest, returning the signature bytes.
    fn sign(&self, digest: &[u8]) -> CoreResult<Vec<u8>>;
    /// Verifies a digest/signature pair.
    fn verify(&self, digest: &[u8], signature: &[u8]) -> CoreResult<bool>;
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// Suspicious or degraded.
    Warning,
    /// Security-relevant failure.
    Critical,
}

/// One audit event as persisted (hash fields included).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event time (ms since epoch).
    pub timestamp_ms: u64,
    /// Event category (`AUTH`, `SAGA`, `AUDIT`, ...).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Acting principal.
    pub user_id: String,
    /// Affected resource.
    pub resource: String,
    /// Structured details.
    pub details: serde_json::Value,
    /// Severity.
    pub severity: Severity,
    /// Hex hash of the previous entry (zeros for genesis).
    pub prev_hash: String,
    /// Chain position (sequence of this entry).
    pub chain_entry: u64,
    /// This entry's hash.
    #[serde(default)]
    pub hash: String,
}

impl AuditEvent {
    /// The canonical digest input: the event without its own hash.
    fn canonical_without_hash(&self) -> CoreResult<String> {
        let mut clone = self.clone();
        clone.hash = String::new();
        let value = serde_json::to_value(&clone)
            .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
        Ok(themis_codec::canonical_json(&value))
    }

    fn compute_hash(&self) -> CoreResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.canonical_without_hash()?.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// On-disk wrapper: plain or encrypt-then-sign.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum StoredEvent {
    /// Plain JSON event.
    Plain {
        /// The event.
        event: AuditEvent,
    },
    /// Sealed canonical JSON plus a detached signature.
    Sealed {
        /// Base64 `iv || ct || tag` of the canonical event JSON.
        sealed: String,
        /// Base64 signature over the ciphertext digest.
        signature: String,
        /// Key version used for the seal.
        key_version: u32,
    },
}

/// Policy for the audit log.
#[derive(Debug, Clone)]
pub struct AuditPolicy {
    /// Categories wrapped in the encrypt-then-sign envelope.
    pub sealed_categories: Vec<String>,
    /// Continue in degraded mode after a chain violation instead of
    /// failing startup.
    pub degrade_on_violation: bool,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self {
            sealed_categories: vec!["SAGA".to_string(), "AUDIT".to_string()],
            degrade_on_violation: false,
        }
    }
}

/// The append-only audit log.
pub struct AuditLog {
    store: Arc<KvStore>,
    policy: AuditPolicy,
    keys: Option<Arc<KeyHierarchy>>,
    signer: Option<Box<dyn Signer>>,
    next_entry: parking_lot::Mutex<u64>,
    last_hash: parking_lot::Mutex<String>,
}

impl AuditLog {
    /// Genesis hash: 64 zero hex digits.
    #[must_use]
    pub fn genesis_hash() -> String {
        "0".repeat(64)
    }

    fn entry_key(sequence: u64) -> Vec<u8> {
        format!("audit:{sequence:0SEQ_WIDTH$}").into_bytes()
    }

    /// Opens the log and verifies the chain end-to-end.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ChainViolation`] when the chain is broken and
    /// the policy does not degrade.
    pub fn open(
        store: Arc<KvStore>,
        policy: AuditPolicy,
        keys: Option<Arc<KeyHierarchy>>,
        signer: Option<Box<dyn Signer>>,
    ) -> CoreResult<Self> {
        let log = Self {
            store,
            policy,
            keys,
            signer,
            next_entry: parking_lot::Mutex::new(1),
            last_hash: parking_lot::Mutex::new(Self::genesis_hash()),
        };

        match log.verify_chain() {
            Ok(tail) => {
                if let Some((entry, hash)) = tail {
                    *log.next_entry.lock() = entry + 1;
                    *log.last_hash.lock() = hash;
                }
                Ok(log)
            }
            Err(err) => {
                if log.policy.degrade_on_violation {
                    error!(error = %err, "audit chain violation, continuing degraded");
                    // Degraded mode restarts the chain from the tail that
                    // did verify.
                    Ok(log)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Appends an event, computing its chain linkage.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing or the write fails.
    pub fn append(
        &self,
        event_type: &str,
        user_id: &str,
        resource: &str,
        details: serde_json::Value,
        severity: Severity,
    ) -> CoreResult<AuditEvent> {
        let mut next_entry = self.next_entry.lock();
        let mut last_hash = self.last_hash.lock();

        let mut event = AuditEvent {
            timestamp_ms: now_ms(),
            event_type: event_type.to_string(),
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            details,
            severity,
            prev_hash: last_hash.clone(),
            chain_entry: *next_entry,
            hash: String::new(),
        };
        event.hash = event.compute_hash()?;

        let stored = if self.policy.sealed_categories.contains(&event.event_type) {
            self.seal_event(&event)?
        } else {
            StoredEvent::Plain {
                event: event.clone(),
            }
        };
        let bytes = serde_json::to_vec(&stored)
            .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
        self.store
            .put(ColumnFamily::Default, Self::entry_key(event.chain_entry), bytes)?;

        *last_hash = event.hash.clone();
        *next_entry += 1;
        Ok(event)
    }

    fn seal_event(&self, event: &AuditEvent) -> CoreResult<StoredEvent> {
        let (Some(keys), Some(signer)) = (&self.keys, &self.signer) else {
            warn!(category = %event.event_type, "sealed category without key or signer, storing plain");
            return Ok(StoredEvent::Plain {
                event: event.clone(),
            });
        };

        let ctx = EncryptionContext::anonymous();
        let version = keys.latest_version(&ctx)?;
        let key = keys.derive_field_key(&ctx, "audit", version)?;
        let canonical = serde_json::to_value(event)
            .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
        let plaintext = themis_codec::canonical_json(&canonical);
        let sealed = crate::crypto::seal_bytes(&key, plaintext.as_bytes())?;

        let digest = Sha256::digest(&sealed);
        let signature = signer.sign(&digest)?;
        Ok(StoredEvent::Sealed {
            sealed: BASE64.encode(&sealed),
            signature: BASE64.encode(signature),
            key_version: version,
        })
    }

    fn load_event(&self, bytes: &[u8], index: usize) -> CoreResult<AuditEvent> {
        let stored: StoredEvent = serde_json::from_slice(bytes).map_err(|e| {
            CoreError::chain_violation(index, format!("undecodable entry: {e}"))
        })?;
        match stored {
            StoredEvent::Plain { event } => Ok(event),
            StoredEvent::Sealed {
                sealed,
                signature,
                key_version,
            } => {
                let (Some(keys), Some(signer)) = (&self.keys, &self.signer) else {
                    return Err(CoreError::chain_violation(
                        index,
                        "sealed entry but no key or signer installed",
                    ));
                };
                let sealed = BASE64
                    .decode(&sealed)
                    .map_err(|_| CoreError::chain_violation(index, "bad seal encoding"))?;
                let signature = BASE64
                    .decode(&signature)
                    .map_err(|_| CoreError::chain_violation(index, "bad signature encoding"))?;

                let digest = Sha256::digest(&sealed);
                if !signer.verify(&digest, &signature)? {
                    return Err(CoreError::chain_violation(index, "signature invalid"));
                }
                let ctx = EncryptionContext::anonymous();
                let key = keys.derive_field_key(&ctx, "audit", key_version)?;
                let plaintext = crate::crypto::open_bytes(&key, &sealed)
                    .map_err(|_| CoreError::chain_violation(index, "seal does not open"))?;
                serde_json::from_slice(&plaintext).map_err(|e| {
                    CoreError::chain_violation(index, format!("sealed entry undecodable: {e}"))
                })
            }
        }
    }

    /// Recomputes the chain from genesis. Returns the tail `(entry,
    /// hash)` when the log is non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ChainViolation`] at the first broken entry.
    pub fn verify_chain(&self) -> CoreResult<Option<(u64, String)>> {
        let entries = self
            .store
            .scan_prefix(ColumnFamily::Default, b"audit:", None, false)?;
        let mut prev_hash = Self::genesis_hash();
        let mut tail = None;

        for (index, (_, bytes)) in entries.iter().enumerate() {
            let event = self.load_event(bytes, index)?;
            if event.prev_hash != prev_hash {
                return Err(CoreError::chain_violation(
                    index,
                    "prev_hash does not link to the preceding entry",
                ));
            }
            let recomputed = event.compute_hash()?;
            if recomputed != event.hash {
                return Err(CoreError::chain_violation(index, "stored hash mismatch"));
            }
            prev_hash = event.hash.clone();
            tail = Some((event.chain_entry, event.hash.clone()));
        }
        Ok(tail)
    }

    /// Reads events in chain order.
    ///
    /// # Errors
    ///
    /// Returns an error if entries fail to decode.
    pub fn events(&self) -> CoreResult<Vec<AuditEvent>> {
        let entries = self
            .store
            .scan_prefix(ColumnFamily::Default, b"audit:", None, false)?;
        entries
            .iter()
            .enumerate()
            .map(|(index, (_, bytes))| self.load_event(bytes, index))
            .collect()
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("next_entry", &*self.next_entry.lock())
            .finish_non_exhaustive()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;
    use hkdf::Hkdf;

    fn open_plain(store: Arc<KvStore>) -> AuditLog {
        AuditLog::open(store, AuditPolicy::default(), None, None).unwrap()
    }

    #[test]
    fn chain_links_and_verifies() {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let log = open_plain(Arc::clone(&store));

        let first = log
            .append("AUTH", "alice", "login", serde_json::json!({}), Severity::Info)
            .unwrap();
        let second = log
            .append("AUTH", "bob", "login", serde_json::json!({}), Severity::Info)
            .unwrap();

        assert_eq!(first.prev_hash, AuditLog::genesis_hash());
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(second.chain_entry, 2);

        let tail = log.verify_chain().unwrap().unwrap();
        assert_eq!(tail.0, 2);
        assert_eq!(tail.1, second.hash);
    }

    #[test]
    fn chain_survives_reopen() {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        {
            let log = open_plain(Arc::clone(&store));
            log.append("AUTH", "alice", "r", serde_json::json!({}), Severity::Info)
                .unwrap();
        }
        let log = open_plain(Arc::clone(&store));
        let event = log
            .append("AUTH", "bob", "r", serde_json::json!({}), Severity::Info)
            .unwrap();
        assert_eq!(event.chain_entry, 2);
        assert!(log.verify_chain().is_ok());
    }

    #[test]
    fn tampering_breaks_verification() {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let log = open_plain(Arc::clone(&store));
        log.append("AUTH", "alice", "r", serde_json::json!({"n": 1}), Severity::Info)
            .unwrap();
        log.append("AUTH", "bob", "r", serde_json::json!({"n": 2}), Severity::Info)
            .unwrap();

        // Mutate the first entry's details in place.
        let key = AuditLog::entry_key(1);
        let bytes = store.get(ColumnFamily::Default, &key).unwrap().unwrap();
        let mutated = String::from_utf8(bytes).unwrap().replace("\"n\":1", "\"n\":9");
        store
            .put(ColumnFamily::Default, key, mutated.into_bytes())
            .unwrap();

        let err = log.verify_chain().unwrap_err();
        match err {
            CoreError::ChainViolation { index, .. } => assert_eq!(index, 0),
            other => panic!("expected chain violation, got {other:?}"),
        }

        // Reopen without degradation fails.
        assert!(AuditLog::open(store, AuditPolicy::default(), None, None).is_err());
    }

    #[test]
    fn degraded_mode_continues() {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let log = open_plain(Arc::clone(&store));
        log.append("AUTH", "alice", "r", serde_json::json!({}), Severity::Info)
            .unwrap();

        let key = AuditLog::entry_key(1);
        store
            .put(ColumnFamily::Default, key, b"{\"kind\":\"plain\"".to_vec())
            .unwrap();

        let policy = AuditPolicy {
            degrade_on_violation: true,
            ..AuditPolicy::default()
        };
        let log = AuditLog::open(store, policy, None, None).unwrap();
        // Still usable.
        log.append("AUTH", "bob", "r", serde_json::json!({}), Severity::Warning)
            .unwrap();
    }

    /// HMAC-style test signer: sign = HKDF(key, digest).
    struct TestSigner(SecretKey);
    impl Signer for TestSigner {
        fn sign(&self, digest: &[u8]) -> CoreResult<Vec<u8>> {
            let hk = Hkdf::<Sha256>::new(None, self.0.as_bytes());
            let mut out = [0u8; 32];
            hk.expand(digest, &mut out)
                .map_err(|_| CoreError::auth_failure("sign failed"))?;
            Ok(out.to_vec())
        }
        fn verify(&self, digest: &[u8], signature: &[u8]) -> CoreResult<bool> {
            Ok(self.sign(digest)? == signature)
        }
    }

    fn open_sealing(store: Arc<KvStore>) -> AuditLog {
        let keys = Arc::new(KeyHierarchy::new(Arc::clone(&store), "themis"));
        keys.ensure_kek().unwrap();
        keys.ensure_dek().unwrap();
        let signer = TestSigner(SecretKey::from_bytes(&[7u8; 32]).unwrap());
        AuditLog::open(store, AuditPolicy::default(), Some(keys), Some(Box::new(signer)))
            .unwrap()
    }

    #[test]
    fn sealed_categories_roundtrip() {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let log = open_sealing(Arc::clone(&store));

        log.append("SAGA", "system", "order-1", serde_json::json!({"step": 1}), Severity::Info)
            .unwrap();
        log.append("AUTH", "alice", "login", serde_json::json!({}), Severity::Info)
            .unwrap();

        // SAGA entry is sealed on disk; AUTH is plain.
        let sealed_bytes = store
            .get(ColumnFamily::Default, &AuditLog::entry_key(1))
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&sealed_bytes).contains("\"sealed\""));
        let plain_bytes = store
            .get(ColumnFamily::Default, &AuditLog::entry_key(2))
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&plain_bytes).contains("\"plain\""));

        // Both decode and verify through the chain.
        let events = log.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "SAGA");
        assert!(log.verify_chain().is_ok());
    }

    #[test]
    fn sealed_entry_tamper_is_violation() {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let log = open_sealing(Arc::clone(&store));
        log.append("SAGA", "system", "order-1", serde_json::json!({}), Severity::Info)
            .unwrap();

        let key = AuditLog::entry_key(1);
        let bytes = store.get(ColumnFamily::Default, &key).unwrap().unwrap();
        let mut stored: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        // Flip a character in the signature.
        let signature = stored["signature"].as_str().unwrap().to_string();
        let flipped = if signature.starts_with('A') { "B" } else { "A" };
        stored["signature"] = serde_json::json!(format!("{flipped}{}", &signature[1..]));
        store
            .put(ColumnFamily::Default, key, serde_json::to_vec(&stored).unwrap())
            .unwrap();

        assert!(matches!(
            log.verify_chain(),
            Err(CoreError::ChainViolation { .. })
        ));
    }
}
