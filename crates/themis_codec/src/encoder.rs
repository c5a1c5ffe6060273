//! Canonical entity field encoder.

use crate::error::{CodecError, CodecResult};
use crate::value::{canonical_json, Value};
use crate::FORMAT_VERSION;
use std::collections::BTreeMap;

/// Header flag bit marking a tombstone record.
pub(crate) const FLAG_TOMBSTONE: u8 = 0b0000_0001;

/// Encodes a sorted field map to canonical bytes.
///
/// Layout: `version (1) || flags (1) || field_count (u32 BE)` followed by
/// each field as `name_len (u16 BE) || name || tag (1) || payload_len
/// (u32 BE) || payload`. Iterating a `BTreeMap` yields names in ascending
/// order, which is exactly the canonical field order.
///
/// # Errors
///
/// Returns [`CodecError::NaNForbidden`] if any double is NaN, and
/// [`CodecError::BadEncoding`] if a name or payload exceeds its length
/// field.
pub fn encode_fields(
    fields: &BTreeMap<String, Value>,
    tombstone: bool,
) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(16 + fields.len() * 32);
    buf.push(FORMAT_VERSION);
    buf.push(if tombstone { FLAG_TOMBSTONE } else { 0 });
    let count = u32::try_from(fields.len())
        .map_err(|_| CodecError::bad_encoding("too many fields"))?;
    buf.extend_from_slice(&count.to_be_bytes());

    for (name, value) in fields {
        let name_len = u16::try_from(name.len())
            .map_err(|_| CodecError::bad_encoding(format!("field name too long: {name}")))?;
        buf.extend_from_slice(&name_len.to_be_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.push(value.tag().as_byte());
        let payload = encode_payload(value)?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| CodecError::bad_encoding("payload too large"))?;
        buf.extend_from_slice(&payload_len.to_be_bytes());
        buf.extend_from_slice(&payload);
    }

    Ok(buf)
}

fn encode_payload(value: &Value) -> CodecResult<Vec<u8>> {
    match value {
        Value::Str(s) => Ok(s.as_bytes().to_vec()),
        Value::Int(n) => Ok(n.to_be_bytes().to_vec()),
        Value::Float(f) => {
            if f.is_nan() {
                return Err(CodecError::NaNForbidden);
            }
            Ok(f.to_be_bytes().to_vec())
        }
        Value::Bool(b) => Ok(vec![u8::from(*b)]),
        Value::FloatVec(v) => {
            let mut out = Vec::with_capacity(v.len() * 4);
            for f in v {
                if f.is_nan() {
                    return Err(CodecError::NaNForbidden);
                }
                out.extend_from_slice(&f.to_be_bytes());
            }
            Ok(out)
        }
        Value::Bytes(b) => Ok(b.clone()),
        Value::Json(j) => Ok(canonical_json(j).into_bytes()),
        Value::Absent => Ok(Vec::new()),
    }
}
