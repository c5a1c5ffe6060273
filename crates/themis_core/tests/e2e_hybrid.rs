//! Hybrid query scenarios: vector+geo, content+geo, graph traversal.

use themis_core::index::IndexKind;
use themis_core::query::QueryOptions;
use themis_core::vector::VectorMetric;
use themis_core::{Database, Entity, Value};
use themis_testkit::hotel_fixtures;

fn db_with_hotels() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.ensure_vector_index("hotels", "emb", 4, VectorMetric::Cosine)
        .unwrap();
    for entity in hotel_fixtures() {
        db.put(&entity).unwrap();
    }
    db
}

#[test]
fn vector_geo_scenario() {
    let db = db_with_hotels();

    let mut options = QueryOptions::default();
    options
        .params
        .insert("bbox".to_string(), serde_json::json!([13.0, 52.0, 14.0, 53.0]));
    options
        .params
        .insert("q".to_string(), serde_json::json!([1.0, 0.0, 0.0, 0.0]));

    let output = db
        .query(
            "FOR h IN hotels FILTER ST_Within(h.geometry, @bbox) \
             SORT SIMILARITY(h.emb, @q) DESC LIMIT 3 RETURN h._key",
            &options,
        )
        .unwrap();

    // Only the two Berlin hotels qualify spatially; ordered by cosine
    // similarity to the query, descending.
    assert_eq!(
        output.rows,
        vec![
            serde_json::json!("hotels:adlon"),
            serde_json::json!("hotels:orania")
        ]
    );
    assert_eq!(output.trace.strategy, "vector+geo");
    assert!(output.trace.spatial_first_cost.is_some());
    assert!(output.trace.vector_first_cost.is_some());
}

#[test]
fn vector_only_ordering() {
    let db = db_with_hotels();
    let mut options = QueryOptions::default();
    options
        .params
        .insert("q".to_string(), serde_json::json!([0.0, 0.0, 1.0, 0.0]));

    let output = db
        .query(
            "FOR h IN hotels SORT SIMILARITY(h.emb, @q) DESC LIMIT 1 RETURN h._key",
            &options,
        )
        .unwrap();
    assert_eq!(output.rows, vec![serde_json::json!("hotels:okura")]);
}

#[test]
fn content_geo_scenario() {
    let db = Database::open_in_memory().unwrap();
    db.indexes()
        .create_index(IndexKind::Fulltext, "places", &["name".to_string()], false)
        .unwrap();
    db.indexes()
        .create_index(IndexKind::Geo, "places", &["loc".to_string()], false)
        .unwrap();

    for (pk, name, lat, lon) in [
        ("1", "Grand Hotel Berlin", "52.52", "13.40"),
        ("2", "Grand Hotel Tokyo", "35.68", "139.69"),
        ("3", "Hostel Berlin", "52.50", "13.42"),
    ] {
        let mut entity = Entity::new(format!("places:{pk}"));
        entity.set_field("name", Value::from(name));
        entity.set_field("loc_lat", Value::from(lat));
        entity.set_field("loc_lon", Value::from(lon));
        db.put(&entity).unwrap();
    }

    // Fulltext AND spatial candidates intersect to the Berlin grand
    // hotel only.
    let hits = db
        .indexes()
        .scan_fulltext("places", "name", "grand hotel", None)
        .unwrap();
    assert_eq!(hits.len(), 2);
    let geo = db
        .indexes()
        .scan_geo_bbox("places", "loc", 13.0, 52.0, 14.0, 53.0, None)
        .unwrap();
    assert_eq!(geo.len(), 2);
    let both: Vec<&String> = hits.iter().filter(|k| geo.contains(k)).collect();
    assert_eq!(both, vec![&"places:1".to_string()]);
}

fn add_edge(db: &Database, pk: &str, from: &str, to: &str, weight: f64) {
    let mut entity = Entity::new(format!("roads:{pk}"));
    entity.set_field("from", Value::from(from));
    entity.set_field("to", Value::from(to));
    entity.set_field("weight", Value::from(weight));
    db.put(&entity).unwrap();
}

fn add_city(db: &Database, pk: &str, lat: f64, lon: f64) {
    use themis_core::spatial::ewkb::point_ewkb;
    let mut entity = Entity::new(format!("cities:{pk}"));
    entity.set_field(
        themis_core::spatial::GEOMETRY_FIELD,
        Value::Bytes(point_ewkb(lon, lat)),
    );
    db.put(&entity).unwrap();
}

#[test]
fn graph_traversal_in_aql() {
    let db = Database::open_in_memory().unwrap();
    for pk in ["berlin", "hamburg", "munich"] {
        db.put(&Entity::new(format!("cities:{pk}"))).unwrap();
    }
    add_edge(&db, "e1", "cities:berlin", "cities:hamburg", 290.0);
    add_edge(&db, "e2", "cities:berlin", "cities:munich", 585.0);

    let output = db
        .query(
            "FOR v IN OUTBOUND 'cities:berlin' roads SORT v._key RETURN v._key",
            &QueryOptions::default(),
        )
        .unwrap();
    assert_eq!(
        output.rows,
        vec![
            serde_json::json!("cities:hamburg"),
            serde_json::json!("cities:munich")
        ]
    );
}

#[test]
fn shortest_path_in_aql() {
    let db = Database::open_in_memory().unwrap();
    for pk in ["a", "b", "c", "d"] {
        db.put(&Entity::new(format!("cities:{pk}"))).unwrap();
    }
    // a->b->d costs 2, a->c->d costs 1.2.
    add_edge(&db, "e1", "cities:a", "cities:b", 1.0);
    add_edge(&db, "e2", "cities:b", "cities:d", 1.0);
    add_edge(&db, "e3", "cities:a", "cities:c", 0.2);
    add_edge(&db, "e4", "cities:c", "cities:d", 1.0);

    let output = db
        .query(
            "FOR v IN OUTBOUND SHORTEST_PATH 'cities:a' TO 'cities:d' roads RETURN v._key",
            &QueryOptions::default(),
        )
        .unwrap();
    assert_eq!(
        output.rows,
        vec![
            serde_json::json!("cities:a"),
            serde_json::json!("cities:c"),
            serde_json::json!("cities:d")
        ]
    );
    assert!(output.trace.branching_estimate.is_some());
}

#[test]
fn graph_geo_constrains_path() {
    let db = Database::open_in_memory().unwrap();
    // Northern route through hamburg, southern through munich.
    add_city(&db, "berlin", 52.5, 13.4);
    add_city(&db, "hamburg", 53.6, 10.0);
    add_city(&db, "munich", 48.1, 11.6);
    add_city(&db, "frankfurt", 50.1, 8.7);
    add_edge(&db, "e1", "cities:berlin", "cities:hamburg", 1.0);
    add_edge(&db, "e2", "cities:hamburg", "cities:frankfurt", 1.0);
    add_edge(&db, "e3", "cities:berlin", "cities:munich", 0.5);
    add_edge(&db, "e4", "cities:munich", "cities:frankfurt", 0.5);

    let mut options = QueryOptions::default();
    // A box covering only the northern half of Germany: munich (48.1) is
    // outside and gets pruned, forcing the more expensive route.
    options.params.insert(
        "bbox".to_string(),
        serde_json::json!([5.0, 50.0, 15.0, 55.0]),
    );

    let output = db
        .query(
            "FOR v IN OUTBOUND SHORTEST_PATH 'cities:berlin' TO 'cities:frankfurt' roads \
             FILTER ST_Within(v.geometry, @bbox) RETURN v._key",
            &options,
        )
        .unwrap();
    assert_eq!(
        output.rows,
        vec![
            serde_json::json!("cities:berlin"),
            serde_json::json!("cities:hamburg"),
            serde_json::json!("cities:frankfurt")
        ]
    );
    assert_eq!(output.trace.strategy, "graph+geo");
}

#[test]
fn vector_whitelist_contract_through_db() {
    let db = db_with_hotels();
    let index = db.vector_indexes().get("hotels", "emb").unwrap();

    let whitelist: std::collections::HashSet<String> =
        ["hotels:okura".to_string()].into();
    let hits = index
        .read()
        .search_knn(&[1.0, 0.0, 0.0, 0.0], 3, Some(&whitelist))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, "hotels:okura");

    let empty: std::collections::HashSet<String> = std::collections::HashSet::new();
    assert!(index
        .read()
        .search_knn(&[1.0, 0.0, 0.0, 0.0], 3, Some(&empty))
        .unwrap()
        .is_empty());
}
