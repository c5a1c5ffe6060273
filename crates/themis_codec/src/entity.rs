//! Entity record over the canonical field codec.

use crate::decoder::decode_fields;
use crate::encoder::encode_fields;
use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use std::collections::BTreeMap;

/// Suffix marking a field's encryption flag companion.
pub const ENC_FLAG_SUFFIX: &str = "_enc";
/// Suffix marking a field's encrypted blob companion.
pub const ENC_BLOB_SUFFIX: &str = "_encrypted";
/// Suffix marking a field's group context companion.
pub const ENC_GROUP_SUFFIX: &str = "_group";

/// A typed record keyed by `<table>:<pk>`.
///
/// Fields map names to tagged values. Serialization is canonical: two
/// entities with equal fields always produce identical bytes, so structural
/// equality coincides with canonical-bytes equality.
///
/// A field is stored in exactly one of two forms: plaintext under its own
/// name, or encrypted under `<name>_encrypted` with `<name>_enc = true`.
/// Decoding rejects records violating that invariant.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    key: String,
    fields: BTreeMap<String, Value>,
    tombstone: bool,
}

impl Entity {
    /// Creates an empty entity with the given key.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
            tombstone: false,
        }
    }

    /// Creates a tombstone entity marking a deletion.
    pub fn tombstone(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
            tombstone: true,
        }
    }

    /// Decodes an entity from canonical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BadEncoding`] on malformed input and
    /// [`CodecError::DualForm`] if any field carries both plaintext and
    /// encrypted forms.
    pub fn from_bytes(key: impl Into<String>, bytes: &[u8]) -> CodecResult<Self> {
        let (fields, tombstone) = decode_fields(bytes)?;
        let entity = Self {
            key: key.into(),
            fields,
            tombstone,
        };
        entity.check_single_form()?;
        Ok(entity)
    }

    /// Encodes the entity to canonical bytes.
    ///
    /// # Errors
    ///
    /// Returns a codec error on NaN doubles or oversized payloads.
    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        encode_fields(&self.fields, self.tombstone)
    }

    /// Returns the full `<table>:<pk>` key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the table portion of the key, if the key is well-formed.
    #[must_use]
    pub fn table(&self) -> Option<&str> {
        self.key.split_once(':').map(|(table, _)| table)
    }

    /// Returns the primary-key portion of the key, if well-formed.
    #[must_use]
    pub fn pk(&self) -> Option<&str> {
        self.key.split_once(':').map(|(_, pk)| pk)
    }

    /// Gets a field value. Absent markers read as missing.
    #[must_use]
    pub fn get_field(&self, name: &str) -> Option<&Value> {
        match self.fields.get(name) {
            Some(Value::Absent) | None => None,
            Some(v) => Some(v),
        }
    }

    /// Sets a field value, replacing any previous value.
    ///
    /// Setting [`Value::Absent`] removes the field from the map.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if value.is_absent() {
            self.fields.remove(&name);
        } else {
            self.fields.insert(name, value);
        }
    }

    /// Removes a field, returning its previous value.
    pub fn remove_field(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Returns the full field map in canonical (ascending name) order.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Returns true if this entity marks a deletion.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// Returns true if the named field is stored encrypted.
    #[must_use]
    pub fn is_field_encrypted(&self, name: &str) -> bool {
        self.fields
            .get(&format!("{name}{ENC_FLAG_SUFFIX}"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Verifies the single-form invariant for every encrypted field.
    fn check_single_form(&self) -> CodecResult<()> {
        for (name, value) in &self.fields {
            let Some(base) = name.strip_suffix(ENC_FLAG_SUFFIX) else {
                continue;
            };
            if value.as_bool() != Some(true) {
                continue;
            }
            let has_blob = self
                .fields
                .contains_key(&format!("{base}{ENC_BLOB_SUFFIX}"));
            let has_plaintext = self
                .fields
                .get(base)
                .is_some_and(|v| !v.is_absent());
            if has_blob && has_plaintext {
                return Err(CodecError::dual_form(base));
            }
        }
        Ok(())
    }
}
