//! Hand-written fixtures matching the documented end-to-end scenarios.

use themis_codec::{Entity, Value};
use themis_core::spatial::ewkb::polygon_ewkb;
use themis_core::spatial::GEOMETRY_FIELD;

/// Three users with distinct emails.
#[must_use]
pub fn user_fixtures() -> Vec<Entity> {
    [("alice", "a@x"), ("bob", "b@x"), ("carol", "c@x")]
        .into_iter()
        .map(|(pk, email)| {
            let mut entity = Entity::new(format!("users:{pk}"));
            entity.set_field("email", Value::from(email));
            entity
        })
        .collect()
}

/// The COLLECT/AGGREGATE scenario: orders for customers X and Y.
#[must_use]
pub fn order_fixtures() -> Vec<Entity> {
    [("1", "X", 10i64), ("2", "X", 30), ("3", "Y", 5)]
        .into_iter()
        .map(|(pk, customer, amount)| {
            let mut entity = Entity::new(format!("orders:{pk}"));
            entity.set_field("c", Value::from(customer));
            entity.set_field("amt", Value::from(amount));
            entity
        })
        .collect()
}

/// Hotels with polygon geometry and 4-dimensional embeddings: two inside
/// the Berlin box, one in Tokyo.
#[must_use]
pub fn hotel_fixtures() -> Vec<Entity> {
    let make = |pk: &str, center: (f64, f64), emb: [f32; 4]| {
        let ring = [
            (center.0 - 0.01, center.1 - 0.01),
            (center.0 + 0.01, center.1 - 0.01),
            (center.0 + 0.01, center.1 + 0.01),
            (center.0 - 0.01, center.1 + 0.01),
        ];
        let mut entity = Entity::new(format!("hotels:{pk}"));
        entity.set_field(GEOMETRY_FIELD, Value::Bytes(polygon_ewkb(&ring)));
        entity.set_field("emb", Value::FloatVec(emb.to_vec()));
        entity
    };
    vec![
        make("adlon", (13.38, 52.51), [1.0, 0.0, 0.0, 0.0]),
        make("orania", (13.42, 52.50), [0.8, 0.6, 0.0, 0.0]),
        make("okura", (139.74, 35.67), [0.0, 0.0, 1.0, 0.0]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_have_expected_shapes() {
        assert_eq!(user_fixtures().len(), 3);
        let orders = order_fixtures();
        assert_eq!(orders.len(), 3);
        assert_eq!(orders[0].get_field("amt").and_then(Value::as_int), Some(10));

        let hotels = hotel_fixtures();
        assert_eq!(hotels.len(), 3);
        assert!(hotels[0].get_field(GEOMETRY_FIELD).is_some());
        assert_eq!(
            hotels[0]
                .get_field("emb")
                .and_then(Value::as_float_vec)
                .map(<[f32]>::len),
            Some(4)
        );
    }
}
