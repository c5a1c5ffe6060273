//! Canonical entity field decoder.

use crate::encoder::FLAG_TOMBSTONE;
use crate::error::{CodecError, CodecResult};
use crate::value::{Value, ValueTag};
use crate::FORMAT_VERSION;
use std::collections::BTreeMap;

/// Decodes canonical bytes back into a field map.
///
/// Returns the fields and the tombstone flag. Rejects out-of-order or
/// duplicate field names, truncated payloads, and unknown tags, so any
/// accepted input re-encodes to exactly the same bytes.
///
/// # Errors
///
/// Returns [`CodecError::BadEncoding`] (or a more specific variant) on any
/// malformed input.
pub fn decode_fields(bytes: &[u8]) -> CodecResult<(BTreeMap<String, Value>, bool)> {
    let mut cursor = Cursor::new(bytes);

    let version = cursor.read_u8()?;
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion { version });
    }
    let flags = cursor.read_u8()?;
    let tombstone = flags & FLAG_TOMBSTONE != 0;
    let count = cursor.read_u32()? as usize;

    let mut fields = BTreeMap::new();
    let mut prev_name: Option<String> = None;

    for _ in 0..count {
        let name_len = cursor.read_u16()? as usize;
        let name_bytes = cursor.read_slice(name_len)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| CodecError::InvalidUtf8)?
            .to_string();

        if let Some(prev) = &prev_name {
            if *prev >= name {
                return Err(CodecError::bad_encoding(format!(
                    "field '{name}' out of canonical order"
                )));
            }
        }
        prev_name = Some(name.clone());

        let tag = ValueTag::from_byte(cursor.read_u8()?)?;
        let payload_len = cursor.read_u32()? as usize;
        let payload = cursor.read_slice(payload_len)?;
        fields.insert(name, decode_payload(tag, payload)?);
    }

    if !cursor.is_empty() {
        return Err(CodecError::bad_encoding("trailing bytes after last field"));
    }

    Ok((fields, tombstone))
}

fn decode_payload(tag: ValueTag, payload: &[u8]) -> CodecResult<Value> {
    match tag {
        ValueTag::Str => {
            let s = std::str::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8)?;
            Ok(Value::Str(s.to_string()))
        }
        ValueTag::Int => {
            let arr: [u8; 8] = payload
                .try_into()
                .map_err(|_| CodecError::bad_encoding("int payload must be 8 bytes"))?;
            Ok(Value::Int(i64::from_be_bytes(arr)))
        }
        ValueTag::Float => {
            let arr: [u8; 8] = payload
                .try_into()
                .map_err(|_| CodecError::bad_encoding("float payload must be 8 bytes"))?;
            let f = f64::from_be_bytes(arr);
            if f.is_nan() {
                return Err(CodecError::NaNForbidden);
            }
            Ok(Value::Float(f))
        }
        ValueTag::Bool => match payload {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(CodecError::bad_encoding("bool payload must be 0 or 1")),
        },
        ValueTag::FloatVec => {
            if payload.len() % 4 != 0 {
                return Err(CodecError::bad_encoding(
                    "float vector payload must be a multiple of 4 bytes",
                ));
            }
            let mut v = Vec::with_capacity(payload.len() / 4);
            for chunk in payload.chunks_exact(4) {
                let arr: [u8; 4] = chunk.try_into().expect("chunks_exact yields 4 bytes");
                let f = f32::from_be_bytes(arr);
                if f.is_nan() {
                    return Err(CodecError::NaNForbidden);
                }
                v.push(f);
            }
            Ok(Value::FloatVec(v))
        }
        ValueTag::Bytes => Ok(Value::Bytes(payload.to_vec())),
        ValueTag::Json => {
            let s = std::str::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8)?;
            let j = serde_json::from_str(s)
                .map_err(|e| CodecError::invalid_json(e.to_string()))?;
            Ok(Value::Json(j))
        }
        ValueTag::Absent => {
            if !payload.is_empty() {
                return Err(CodecError::bad_encoding("absent payload must be empty"));
            }
            Ok(Value::Absent)
        }
    }
}

/// Bounds-checked read cursor over the input bytes.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn read_slice(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(CodecError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.read_slice(1)?[0])
    }

    fn read_u16(&mut self) -> CodecResult<u16> {
        let s = self.read_slice(2)?;
        Ok(u16::from_be_bytes([s[0], s[1]]))
    }

    fn read_u32(&mut self) -> CodecResult<u32> {
        let s = self.read_slice(4)?;
        Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::encode_fields;

    fn fields(pairs: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn roundtrip_all_types() {
        let f = fields(vec![
            ("s", Value::from("hello")),
            ("i", Value::from(-42i64)),
            ("f", Value::from(1.25f64)),
            ("b", Value::from(true)),
            ("v", Value::FloatVec(vec![0.5, -0.5])),
            ("raw", Value::Bytes(vec![0, 255, 7])),
            ("j", Value::Json(serde_json::json!({"k": [1, 2]}))),
            ("gone", Value::Absent),
        ]);
        let bytes = encode_fields(&f, false).unwrap();
        let (decoded, tombstone) = decode_fields(&bytes).unwrap();
        assert!(!tombstone);
        assert_eq!(decoded, f);
    }

    #[test]
    fn roundtrip_tombstone() {
        let bytes = encode_fields(&BTreeMap::new(), true).unwrap();
        let (decoded, tombstone) = decode_fields(&bytes).unwrap();
        assert!(tombstone);
        assert!(decoded.is_empty());
    }

    #[test]
    fn truncated_input() {
        let f = fields(vec![("s", Value::from("hello"))]);
        let bytes = encode_fields(&f, false).unwrap();
        for cut in 0..bytes.len() {
            assert!(decode_fields(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let f = fields(vec![("s", Value::from("x"))]);
        let mut bytes = encode_fields(&f, false).unwrap();
        bytes.push(0);
        assert!(decode_fields(&bytes).is_err());
    }

    #[test]
    fn bad_version_rejected() {
        let f = fields(vec![("s", Value::from("x"))]);
        let mut bytes = encode_fields(&f, false).unwrap();
        bytes[0] = 99;
        assert!(matches!(
            decode_fields(&bytes),
            Err(CodecError::UnsupportedVersion { version: 99 })
        ));
    }

    #[test]
    fn out_of_order_fields_rejected() {
        // Hand-build a record with fields in descending order.
        let mut bytes = vec![1, 0, 0, 0, 0, 2];
        for name in ["b", "a"] {
            bytes.extend_from_slice(&1u16.to_be_bytes());
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(ValueTag::Int.as_byte());
            bytes.extend_from_slice(&8u32.to_be_bytes());
            bytes.extend_from_slice(&1i64.to_be_bytes());
        }
        assert!(decode_fields(&bytes).is_err());
    }

    #[test]
    fn nan_payload_rejected() {
        let mut bytes = vec![1, 0, 0, 0, 0, 1];
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(b"f");
        bytes.push(ValueTag::Float.as_byte());
        bytes.extend_from_slice(&8u32.to_be_bytes());
        bytes.extend_from_slice(&f64::NAN.to_be_bytes());
        assert_eq!(decode_fields(&bytes).unwrap_err(), CodecError::NaNForbidden);
    }

    #[test]
    fn reencode_is_identity() {
        let f = fields(vec![
            ("alpha", Value::from("a")),
            ("beta", Value::from(2i64)),
            ("gamma", Value::Json(serde_json::json!({"z": 1, "a": 2}))),
        ]);
        let bytes = encode_fields(&f, false).unwrap();
        let (decoded, tombstone) = decode_fields(&bytes).unwrap();
        let bytes2 = encode_fields(&decoded, tombstone).unwrap();
        assert_eq!(bytes, bytes2);
    }
}
