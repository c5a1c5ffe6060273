//! Index key layouts and order-preserving value encodings.
//!
//! Every index entry is a key in the default column family whose prefix
//! selects the index kind:
//!
//! | Prefix | Kind |
//! |--------|------|
//! | `idx:<table>:<col>:<value>:<pk>` | equality / composite |
//! | `ridx:<table>:<col>:<value>:<pk>` | range (lex-safe value) |
//! | `sidx:<table>:<col>:<value>:<pk>` | sparse |
//! | `gidx:<table>:<col>:<morton>:<pk>` | geo bucket |
//! | `ttlidx:<table>:<col>:<expiry20>:<pk>` | TTL schedule |
//! | `ftidx:<table>:<col>:<token>:<pk>` | fulltext postings |
//!
//! The trailing `<pk>` segment is the bare primary key (no table prefix,
//! no `:`), so the owning entity key is always `<table>:<pk>`.

use crate::error::{CoreError, CoreResult};
use themis_codec::Value;

/// Zero-padded width of TTL expiry and CDC sequence segments.
pub const SEQ_WIDTH: usize = 20;

/// Builds an equality/composite index entry key.
#[must_use]
pub fn eq_key(table: &str, column: &str, value: &str, pk: &str) -> Vec<u8> {
    format!("idx:{table}:{column}:{value}:{pk}").into_bytes()
}

/// Prefix selecting all entries for one equality value.
#[must_use]
pub fn eq_prefix(table: &str, column: &str, value: &str) -> Vec<u8> {
    format!("idx:{table}:{column}:{value}:").into_bytes()
}

/// Builds a range index entry key. `value` must already be lex-safe.
#[must_use]
pub fn range_key(table: &str, column: &str, value: &str, pk: &str) -> Vec<u8> {
    format!("ridx:{table}:{column}:{value}:{pk}").into_bytes()
}

/// Prefix selecting a whole range index.
#[must_use]
pub fn range_prefix(table: &str, column: &str) -> Vec<u8> {
    format!("ridx:{table}:{column}:").into_bytes()
}

/// Builds a sparse index entry key.
#[must_use]
pub fn sparse_key(table: &str, column: &str, value: &str, pk: &str) -> Vec<u8> {
    format!("sidx:{table}:{column}:{value}:{pk}").into_bytes()
}

/// Prefix selecting all entries for one sparse value.
#[must_use]
pub fn sparse_prefix(table: &str, column: &str, value: &str) -> Vec<u8> {
    format!("sidx:{table}:{column}:{value}:").into_bytes()
}

/// Builds a geo bucket entry key.
#[must_use]
pub fn geo_key(table: &str, column: &str, morton: &str, pk: &str) -> Vec<u8> {
    format!("gidx:{table}:{column}:{morton}:{pk}").into_bytes()
}

/// Prefix selecting a whole geo index.
#[must_use]
pub fn geo_prefix(table: &str, column: &str) -> Vec<u8> {
    format!("gidx:{table}:{column}:").into_bytes()
}

/// Builds a TTL schedule entry key.
#[must_use]
pub fn ttl_key(table: &str, column: &str, expiry_ms: u64, pk: &str) -> Vec<u8> {
    format!("ttlidx:{table}:{column}:{expiry_ms:0SEQ_WIDTH$}:{pk}").into_bytes()
}

/// Prefix selecting a whole TTL index.
#[must_use]
pub fn ttl_prefix(table: &str, column: &str) -> Vec<u8> {
    format!("ttlidx:{table}:{column}:").into_bytes()
}

/// Builds a fulltext posting entry key.
#[must_use]
pub fn fulltext_key(table: &str, column: &str, token: &str, pk: &str) -> Vec<u8> {
    format!("ftidx:{table}:{column}:{token}:{pk}").into_bytes()
}

/// Prefix selecting all postings for one token.
#[must_use]
pub fn fulltext_prefix(table: &str, column: &str, token: &str) -> Vec<u8> {
    format!("ftidx:{table}:{column}:{token}:").into_bytes()
}

/// Extracts the trailing `<pk>` segment of an index entry key.
///
/// # Errors
///
/// Returns an error if the key has no `:` separator.
pub fn pk_of_entry(key: &[u8]) -> CoreResult<String> {
    let text = std::str::from_utf8(key)
        .map_err(|_| CoreError::invalid_operation("index key is not UTF-8"))?;
    text.rsplit_once(':')
        .map(|(_, pk)| pk.to_string())
        .ok_or_else(|| CoreError::invalid_operation("index key has no pk segment"))
}

/// Encodes an `i64` so that byte order equals numeric order.
///
/// Flips the sign bit and renders fixed-width hex.
#[must_use]
pub fn lex_i64(n: i64) -> String {
    #[allow(clippy::cast_sign_loss)]
    let biased = (n as u64) ^ (1u64 << 63);
    format!("{biased:016x}")
}

/// Encodes an `f64` so that byte order equals numeric order.
///
/// Standard IEEE-754 total-order trick: flip all bits of negatives, flip
/// only the sign bit of non-negatives.
#[must_use]
pub fn lex_f64(f: f64) -> String {
    let bits = f.to_bits();
    let ordered = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    };
    format!("{ordered:016x}")
}

/// Renders a value as a lex-safe range key segment.
///
/// Integers and doubles use order-preserving encodings; strings are used
/// directly (bytewise order); other types are not range-indexable.
#[must_use]
pub fn range_value(value: &Value) -> Option<String> {
    match value {
        Value::Int(n) => Some(lex_i64(*n)),
        Value::Float(f) => Some(lex_f64(*f)),
        Value::Str(s) => Some(s.clone()),
        _ => None,
    }
}

/// Joins composite column names into the registry column key (`a+b`).
#[must_use]
pub fn composite_column(columns: &[String]) -> String {
    columns.join("+")
}

/// Joins composite values into the index value segment (`a:b`).
#[must_use]
pub fn composite_value(values: &[String]) -> String {
    values.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(
            eq_key("users", "email", "a@x", "alice"),
            b"idx:users:email:a@x:alice"
        );
        assert_eq!(
            ttl_key("sessions", "expires", 42, "s1"),
            b"ttlidx:sessions:expires:00000000000000000042:s1"
        );
        assert_eq!(
            fulltext_key("docs", "body", "hello", "d1"),
            b"ftidx:docs:body:hello:d1"
        );
    }

    #[test]
    fn pk_extraction() {
        assert_eq!(
            pk_of_entry(b"idx:users:email:a@x:alice").unwrap(),
            "alice"
        );
        // Values may contain colons; the pk is always the last segment.
        assert_eq!(
            pk_of_entry(b"idx:users:email:a:b:c:alice").unwrap(),
            "alice"
        );
    }

    #[test]
    fn lex_i64_orders() {
        let values = [i64::MIN, -100, -1, 0, 1, 100, i64::MAX];
        let encoded: Vec<String> = values.iter().map(|&n| lex_i64(n)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn lex_f64_orders() {
        let values = [
            f64::NEG_INFINITY,
            -1000.5,
            -1.0,
            -0.001,
            0.0,
            0.001,
            1.0,
            1000.5,
            f64::INFINITY,
        ];
        let encoded: Vec<String> = values.iter().map(|&f| lex_f64(f)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn composite_join() {
        let cols = vec!["city".to_string(), "zip".to_string()];
        assert_eq!(composite_column(&cols), "city+zip");
        assert_eq!(
            composite_value(&["berlin".to_string(), "10115".to_string()]),
            "berlin:10115"
        );
    }

    #[test]
    fn range_value_kinds() {
        assert_eq!(range_value(&Value::Str("abc".into())), Some("abc".to_string()));
        assert!(range_value(&Value::Int(5)).is_some());
        assert!(range_value(&Value::Float(2.5)).is_some());
        assert!(range_value(&Value::Bool(true)).is_none());
        assert!(range_value(&Value::Absent).is_none());
    }
}
