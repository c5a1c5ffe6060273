//! Property-based laws for the canonical codec.

use proptest::prelude::*;
use std::collections::BTreeMap;
use themis_codec::{decode_fields, encode_fields, Entity, Value};

fn field_name() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("valid regex")
}

fn scalar_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Int),
        any::<bool>().prop_map(Value::Bool),
        "[ -~]{0,32}".prop_map(Value::Str),
        prop::num::f64::NORMAL.prop_map(Value::Float),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
        prop::collection::vec(prop::num::f32::NORMAL, 0..16).prop_map(Value::FloatVec),
    ]
}

fn field_map() -> impl Strategy<Value = BTreeMap<String, Value>> {
    prop::collection::btree_map(field_name(), scalar_value(), 0..8)
}

proptest! {
    #[test]
    fn encode_decode_roundtrip(fields in field_map(), tombstone in any::<bool>()) {
        let bytes = encode_fields(&fields, tombstone).unwrap();
        let (decoded, decoded_tombstone) = decode_fields(&bytes).unwrap();
        prop_assert_eq!(&decoded, &fields);
        prop_assert_eq!(decoded_tombstone, tombstone);
    }

    #[test]
    fn encoding_is_deterministic(fields in field_map()) {
        let a = encode_fields(&fields, false).unwrap();
        let b = encode_fields(&fields, false).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn decode_reencode_identity(fields in field_map()) {
        let bytes = encode_fields(&fields, false).unwrap();
        let (decoded, tombstone) = decode_fields(&bytes).unwrap();
        let bytes2 = encode_fields(&decoded, tombstone).unwrap();
        prop_assert_eq!(bytes, bytes2);
    }

    #[test]
    fn entity_equality_matches_bytes(fields in field_map()) {
        let mut a = Entity::new("t:1");
        let mut b = Entity::new("t:1");
        for (name, value) in &fields {
            a.set_field(name.clone(), value.clone());
            b.set_field(name.clone(), value.clone());
        }
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
    }

    #[test]
    fn truncation_never_panics(fields in field_map(), cut in 0usize..64) {
        let bytes = encode_fields(&fields, false).unwrap();
        let cut = cut.min(bytes.len());
        // Any strict prefix must be rejected, never accepted or panic.
        if cut < bytes.len() {
            prop_assert!(decode_fields(&bytes[..cut]).is_err());
        }
    }
}
