//! # ThemisDB Codec
//!
//! Tagged value model and canonical binary serialization for ThemisDB
//! entities.
//!
//! This crate provides deterministic encoding that ensures:
//! - Identical entities produce identical bytes
//! - Field names are serialized in ascending order
//! - Every value payload is length-prefixed and tagged
//! - Stable hashing across platforms
//!
//! ## Canonical Rules
//!
//! - Fields are sorted by name (bytewise ascending)
//! - Doubles must be finite; NaN is rejected at encode time
//! - JSON payloads are serialized with sorted object keys
//! - No indefinite-length items; every length is explicit
//!
//! ## Usage
//!
//! ```
//! use themis_codec::{Entity, Value};
//!
//! let mut entity = Entity::new("users:alice");
//! entity.set_field("email", Value::from("a@example.com"));
//! entity.set_field("age", Value::from(30i64));
//!
//! let bytes = entity.to_bytes().unwrap();
//! let decoded = Entity::from_bytes("users:alice", &bytes).unwrap();
//! assert_eq!(entity, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod entity;
mod error;
mod value;

pub use decoder::decode_fields;
pub use encoder::encode_fields;
pub use entity::{Entity, ENC_BLOB_SUFFIX, ENC_FLAG_SUFFIX, ENC_GROUP_SUFFIX};
pub use error::{CodecError, CodecResult};
pub use value::{canonical_json, Value, ValueTag};

/// Current entity wire-format version.
pub const FORMAT_VERSION: u8 = 1;
