//! Spatial index: EWKB geometry, Morton buckets, broadphase queries.
//!
//! Entities carry geometry in their `geometry` field as EWKB bytes. Writes
//! compute a sidecar `{mbr, centroid, z_min, z_max}` and file the entity
//! into the bucket `spatial:<table>:<morton>` keyed by the centroid's
//! Morton code. Queries run a broadphase over the bucket range derived
//! from the query box, then refine using sidecar MBR tests; exact geometry
//! checks are delegated to an [`ExactGeometryBackend`] when one is
//! installed, with MBR-only refinement as the fallback.

pub mod ewkb;
pub mod morton;

use crate::error::{CoreError, CoreResult};
use ewkb::{parse_ewkb, Geometry, Mbr};
use morton::WorldBounds;
use serde::{Deserialize, Serialize};
use std::ops::Bound;
use std::sync::Arc;
use themis_codec::{Entity, Value};
use themis_storage::{ColumnFamily, KvStore, WriteBatch};
use tracing::warn;

/// Entity field holding EWKB geometry bytes.
pub const GEOMETRY_FIELD: &str = "geometry";

/// Precomputed spatial metadata attached to a geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    /// Minimum bounding rectangle.
    pub mbr: Mbr,
    /// Arithmetic centroid.
    pub centroid: (f64, f64),
    /// Minimum elevation, if the geometry has Z.
    pub z_min: Option<f64>,
    /// Maximum elevation, if the geometry has Z.
    pub z_max: Option<f64>,
}

impl Sidecar {
    /// Computes the sidecar of a geometry.
    ///
    /// # Errors
    ///
    /// Returns `BadGeometry` for an empty geometry.
    pub fn of(geometry: &Geometry) -> CoreResult<Self> {
        let z = geometry.z_range();
        Ok(Self {
            mbr: geometry.mbr()?,
            centroid: geometry.centroid()?,
            z_min: z.map(|(min, _)| min),
            z_max: z.map(|(_, max)| max),
        })
    }
}

/// One entity's entry inside a spatial bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BucketEntry {
    pk: String,
    sidecar: Sidecar,
}

/// Exact-geometry refinement backend.
///
/// The core ships MBR-only refinement; a backend with real geometry math
/// (point-in-polygon, segment intersection) can be installed to sharpen
/// results.
pub trait ExactGeometryBackend: Send + Sync {
    /// Returns true if the geometry intersects the box.
    fn intersects(&self, geometry: &Geometry, bbox: &Mbr) -> bool;
    /// Returns true if the geometry lies within the box.
    fn within(&self, geometry: &Geometry, bbox: &Mbr) -> bool;
}

/// The Morton-bucketed spatial index.
pub struct SpatialIndex {
    store: Arc<KvStore>,
    bounds: WorldBounds,
    exact: Option<Box<dyn ExactGeometryBackend>>,
}

impl SpatialIndex {
    /// Creates an index over the store with MBR-only refinement.
    pub fn new(store: Arc<KvStore>) -> Self {
        Self {
            store,
            bounds: WorldBounds::default(),
            exact: None,
        }
    }

    /// Installs an exact-geometry backend.
    #[must_use]
    pub fn with_exact_backend(mut self, backend: Box<dyn ExactGeometryBackend>) -> Self {
        self.exact = Some(backend);
        self
    }

    fn bucket_key(table: &str, code: u32) -> Vec<u8> {
        format!("spatial:{table}:{}", morton::code_to_key(code)).into_bytes()
    }

    fn bucket_prefix(table: &str) -> Vec<u8> {
        format!("spatial:{table}:").into_bytes()
    }

    /// Parses the entity's geometry slot, if present.
    ///
    /// # Errors
    ///
    /// Returns `BadGeometry` if the slot holds non-EWKB bytes.
    pub fn entity_geometry(entity: &Entity) -> CoreResult<Option<Geometry>> {
        match entity.get_field(GEOMETRY_FIELD) {
            Some(Value::Bytes(bytes)) => Ok(Some(parse_ewkb(bytes)?)),
            Some(_) => Err(CoreError::bad_geometry(
                "geometry field must hold EWKB bytes",
            )),
            None => Ok(None),
        }
    }

    /// Builds the bucket co-updates for an entity put.
    ///
    /// Sidecar computation failures log a warning and leave the batch
    /// empty: entity writes never fail for geo reasons.
    #[must_use]
    pub fn ops_for_put(&self, pk: &str, entity: &Entity, prior: Option<&Entity>) -> WriteBatch {
        let mut batch = WriteBatch::new();
        let Some(table) = entity.table() else {
            return batch;
        };

        let new_entry = match Self::entity_geometry(entity) {
            Ok(Some(geometry)) => match Sidecar::of(&geometry) {
                Ok(sidecar) => Some(sidecar),
                Err(err) => {
                    warn!(key = entity.key(), error = %err, "sidecar computation failed, skipping spatial index");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key = entity.key(), error = %err, "geometry parse failed, skipping spatial index");
                None
            }
        };

        let prior_code = prior.and_then(|p| {
            Self::entity_geometry(p)
                .ok()
                .flatten()
                .and_then(|g| Sidecar::of(&g).ok())
                .map(|s| morton::encode(&self.bounds, s.centroid.0, s.centroid.1))
        });
        let new_code = new_entry
            .as_ref()
            .map(|s| morton::encode(&self.bounds, s.centroid.0, s.centroid.1));

        // Remove from the prior bucket when the entity moved or lost its
        // geometry.
        if let Some(code) = prior_code {
            if Some(code) != new_code {
                self.remove_from_bucket(&mut batch, table, code, pk);
            }
        }

        if let (Some(sidecar), Some(code)) = (new_entry, new_code) {
            self.upsert_into_bucket(&mut batch, table, code, pk, sidecar);
        }
        batch
    }

    /// Builds the bucket co-updates removing a deleted entity.
    #[must_use]
    pub fn ops_for_delete(&self, pk: &str, prior: &Entity) -> WriteBatch {
        let mut batch = WriteBatch::new();
        let Some(table) = prior.table() else {
            return batch;
        };
        if let Ok(Some(geometry)) = Self::entity_geometry(prior) {
            if let Ok(sidecar) = Sidecar::of(&geometry) {
                let code = morton::encode(&self.bounds, sidecar.centroid.0, sidecar.centroid.1);
                self.remove_from_bucket(&mut batch, table, code, pk);
            }
        }
        batch
    }

    fn load_bucket(&self, key: &[u8]) -> Vec<BucketEntry> {
        match self.store.get(ColumnFamily::Default, key) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(error = %err, "corrupt spatial bucket, resetting");
                Vec::new()
            }),
            _ => Vec::new(),
        }
    }

    fn upsert_into_bucket(
        &self,
        batch: &mut WriteBatch,
        table: &str,
        code: u32,
        pk: &str,
        sidecar: Sidecar,
    ) {
        let key = Self::bucket_key(table, code);
        let mut entries = self.load_bucket(&key);
        entries.retain(|e| e.pk != pk);
        entries.push(BucketEntry {
            pk: pk.to_string(),
            sidecar,
        });
        if let Ok(bytes) = serde_json::to_vec(&entries) {
            batch.put(ColumnFamily::Default, key, bytes);
        }
    }

    fn remove_from_bucket(&self, batch: &mut WriteBatch, table: &str, code: u32, pk: &str) {
        let key = Self::bucket_key(table, code);
        let mut entries = self.load_bucket(&key);
        let before = entries.len();
        entries.retain(|e| e.pk != pk);
        if entries.len() == before {
            return;
        }
        if entries.is_empty() {
            batch.delete(ColumnFamily::Default, key);
        } else if let Ok(bytes) = serde_json::to_vec(&entries) {
            batch.put(ColumnFamily::Default, key, bytes);
        }
    }

    /// Broadphase: bucket entries whose Morton code falls in the box's
    /// Z-range.
    fn broadphase(&self, table: &str, bbox: &Mbr) -> CoreResult<Vec<BucketEntry>> {
        let (z_lo, z_hi) =
            morton::bbox_range(&self.bounds, bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y);
        let prefix = Self::bucket_prefix(table);
        let mut lo_key = prefix.clone();
        lo_key.extend_from_slice(morton::code_to_key(z_lo).as_bytes());
        let mut hi_key = prefix;
        hi_key.extend_from_slice(morton::code_to_key(z_hi).as_bytes());
        hi_key.push(0xff);

        let buckets = self.store.scan_range(
            ColumnFamily::Default,
            Bound::Included(lo_key),
            Bound::Excluded(hi_key),
            None,
            false,
        )?;

        let mut entries = Vec::new();
        for (_, bytes) in buckets {
            let bucket: Vec<BucketEntry> = serde_json::from_slice(&bytes).map_err(|e| {
                CoreError::index_corrupt(format!("spatial bucket decode failed: {e}"))
            })?;
            entries.extend(bucket);
        }
        Ok(entries)
    }

    /// Entities whose MBR intersects the box.
    ///
    /// # Errors
    ///
    /// Returns an error if bucket data fails to decode.
    pub fn search_intersects(&self, table: &str, bbox: &Mbr) -> CoreResult<Vec<String>> {
        let mut out: Vec<String> = self
            .broadphase(table, bbox)?
            .into_iter()
            .filter(|entry| entry.sidecar.mbr.intersects(bbox))
            .map(|entry| format!("{table}:{}", entry.pk))
            .collect();
        out.sort();
        Ok(out)
    }

    /// Entities whose MBR lies within the box, optionally constrained to an
    /// elevation range.
    ///
    /// # Errors
    ///
    /// Returns an error if bucket data fails to decode.
    pub fn search_within(
        &self,
        table: &str,
        bbox: &Mbr,
        z: Option<(f64, f64)>,
    ) -> CoreResult<Vec<String>> {
        let mut out: Vec<String> = self
            .broadphase(table, bbox)?
            .into_iter()
            .filter(|entry| {
                if !entry.sidecar.mbr.within(bbox) {
                    return false;
                }
                match z {
                    Some((z_lo, z_hi)) => match (entry.sidecar.z_min, entry.sidecar.z_max) {
                        (Some(min), Some(max)) => min >= z_lo && max <= z_hi,
                        _ => false,
                    },
                    None => true,
                }
            })
            .map(|entry| format!("{table}:{}", entry.pk))
            .collect();
        out.sort();
        Ok(out)
    }

    /// Entities whose centroid lies within `distance` of `(x, y)`.
    ///
    /// # Errors
    ///
    /// Returns an error if bucket data fails to decode.
    pub fn search_nearby(
        &self,
        table: &str,
        x: f64,
        y: f64,
        distance: f64,
    ) -> CoreResult<Vec<String>> {
        let bbox = Mbr {
            min_x: x - distance,
            min_y: y - distance,
            max_x: x + distance,
            max_y: y + distance,
        };
        let mut out: Vec<String> = self
            .broadphase(table, &bbox)?
            .into_iter()
            .filter(|entry| {
                let (cx, cy) = entry.sidecar.centroid;
                let dx = cx - x;
                let dy = cy - y;
                (dx * dx + dy * dy).sqrt() <= distance
            })
            .map(|entry| format!("{table}:{}", entry.pk))
            .collect();
        out.sort();
        Ok(out)
    }

    /// The `k` entities with centroids nearest to `(x, y)`.
    ///
    /// Runs an expanding-radius broadphase so small `k` stays cheap on
    /// large tables.
    ///
    /// # Errors
    ///
    /// Returns an error if bucket data fails to decode.
    pub fn search_knn(&self, table: &str, x: f64, y: f64, k: usize) -> CoreResult<Vec<String>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let world_span = (self.bounds.max_x - self.bounds.min_x)
            .max(self.bounds.max_y - self.bounds.min_y);
        let mut radius = world_span / 1024.0;
        let mut entries;
        loop {
            let bbox = Mbr {
                min_x: x - radius,
                min_y: y - radius,
                max_x: x + radius,
                max_y: y + radius,
            };
            entries = self.broadphase(table, &bbox)?;
            if entries.len() >= k || radius >= world_span {
                break;
            }
            radius *= 2.0;
        }

        let mut scored: Vec<(f64, String)> = entries
            .into_iter()
            .map(|entry| {
                let (cx, cy) = entry.sidecar.centroid;
                let dx = cx - x;
                let dy = cy - y;
                ((dx * dx + dy * dy).sqrt(), entry.pk)
            })
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.dedup_by(|a, b| a.1 == b.1);
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(_, pk)| format!("{table}:{pk}"))
            .collect())
    }

    /// Refines candidates with the exact backend when one is installed.
    ///
    /// Loads each candidate's geometry and applies the exact predicate;
    /// without a backend this is the identity (MBR-only fallback).
    ///
    /// # Errors
    ///
    /// Returns an error if an entity fails to load.
    pub fn refine_exact(
        &self,
        candidates: Vec<String>,
        bbox: &Mbr,
        within: bool,
    ) -> CoreResult<Vec<String>> {
        let Some(backend) = &self.exact else {
            return Ok(candidates);
        };

        let mut out = Vec::with_capacity(candidates.len());
        for key in candidates {
            let Some(bytes) = self.store.get(ColumnFamily::Default, key.as_bytes())? else {
                continue;
            };
            let entity = Entity::from_bytes(key.clone(), &bytes)?;
            let Some(geometry) = Self::entity_geometry(&entity)? else {
                continue;
            };
            let keep = if within {
                backend.within(&geometry, bbox)
            } else {
                backend.intersects(&geometry, bbox)
            };
            if keep {
                out.push(key);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("exact", &self.exact.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::ewkb::{point_ewkb, polygon_ewkb};

    fn setup() -> (Arc<KvStore>, SpatialIndex) {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let index = SpatialIndex::new(Arc::clone(&store));
        (store, index)
    }

    fn put_place(store: &KvStore, index: &SpatialIndex, pk: &str, ewkb: Vec<u8>) {
        let mut entity = Entity::new(format!("hotels:{pk}"));
        entity.set_field(GEOMETRY_FIELD, Value::Bytes(ewkb));
        let prior = store
            .get(ColumnFamily::Default, entity.key().as_bytes())
            .unwrap()
            .map(|bytes| Entity::from_bytes(entity.key(), &bytes).unwrap());
        let mut batch = index.ops_for_put(pk, &entity, prior.as_ref());
        batch.put(
            ColumnFamily::Default,
            entity.key().as_bytes().to_vec(),
            entity.to_bytes().unwrap(),
        );
        store.write_batch(batch).unwrap();
    }

    #[test]
    fn sidecar_of_polygon() {
        let geometry =
            parse_ewkb(&polygon_ewkb(&[(0.0, 0.0), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0)]))
                .unwrap();
        let sidecar = Sidecar::of(&geometry).unwrap();
        assert_eq!(sidecar.mbr.max_x, 2.0);
        assert!(sidecar.z_min.is_none());
    }

    #[test]
    fn intersects_and_within() {
        let (store, index) = setup();
        put_place(&store, &index, "berlin", point_ewkb(13.4, 52.5));
        put_place(&store, &index, "munich", point_ewkb(11.6, 48.1));
        put_place(&store, &index, "tokyo", point_ewkb(139.7, 35.7));

        let germany = Mbr {
            min_x: 5.0,
            min_y: 47.0,
            max_x: 15.0,
            max_y: 55.0,
        };
        let hits = index.search_intersects("hotels", &germany).unwrap();
        assert_eq!(hits, vec!["hotels:berlin".to_string(), "hotels:munich".to_string()]);

        let hits = index.search_within("hotels", &germany, None).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn nearby_and_knn() {
        let (store, index) = setup();
        put_place(&store, &index, "a", point_ewkb(0.0, 0.0));
        put_place(&store, &index, "b", point_ewkb(1.0, 0.0));
        put_place(&store, &index, "c", point_ewkb(10.0, 0.0));

        let hits = index.search_nearby("hotels", 0.0, 0.0, 2.0).unwrap();
        assert_eq!(hits, vec!["hotels:a".to_string(), "hotels:b".to_string()]);

        let hits = index.search_knn("hotels", 0.1, 0.0, 2).unwrap();
        assert_eq!(hits, vec!["hotels:a".to_string(), "hotels:b".to_string()]);
    }

    #[test]
    fn update_moves_bucket() {
        let (store, index) = setup();
        put_place(&store, &index, "mover", point_ewkb(13.4, 52.5));
        put_place(&store, &index, "mover", point_ewkb(139.7, 35.7));

        let germany = Mbr {
            min_x: 5.0,
            min_y: 47.0,
            max_x: 15.0,
            max_y: 55.0,
        };
        assert!(index.search_intersects("hotels", &germany).unwrap().is_empty());

        let japan = Mbr {
            min_x: 135.0,
            min_y: 30.0,
            max_x: 145.0,
            max_y: 40.0,
        };
        assert_eq!(
            index.search_intersects("hotels", &japan).unwrap(),
            vec!["hotels:mover".to_string()]
        );
    }

    #[test]
    fn delete_removes_from_bucket() {
        let (store, index) = setup();
        put_place(&store, &index, "gone", point_ewkb(13.4, 52.5));

        let mut entity = Entity::new("hotels:gone");
        entity.set_field(GEOMETRY_FIELD, Value::Bytes(point_ewkb(13.4, 52.5)));
        let batch = index.ops_for_delete("gone", &entity);
        store.write_batch(batch).unwrap();

        let world = Mbr {
            min_x: -180.0,
            min_y: -90.0,
            max_x: 180.0,
            max_y: 90.0,
        };
        assert!(index.search_intersects("hotels", &world).unwrap().is_empty());
    }

    #[test]
    fn bad_geometry_skips_but_write_proceeds() {
        let (store, index) = setup();
        let mut entity = Entity::new("hotels:bad");
        entity.set_field(GEOMETRY_FIELD, Value::Bytes(b"junk".to_vec()));
        let batch = index.ops_for_put("bad", &entity, None);
        // No spatial ops, but nothing failed.
        assert!(batch.is_empty());
        store
            .put(
                ColumnFamily::Default,
                entity.key().as_bytes().to_vec(),
                entity.to_bytes().unwrap(),
            )
            .unwrap();
    }

    struct RejectAll;
    impl ExactGeometryBackend for RejectAll {
        fn intersects(&self, _: &Geometry, _: &Mbr) -> bool {
            false
        }
        fn within(&self, _: &Geometry, _: &Mbr) -> bool {
            false
        }
    }

    #[test]
    fn exact_backend_refines() {
        let (store, _) = setup();
        let index = SpatialIndex::new(Arc::clone(&store)).with_exact_backend(Box::new(RejectAll));
        put_place(&store, &index, "berlin", point_ewkb(13.4, 52.5));

        let world = Mbr {
            min_x: -180.0,
            min_y: -90.0,
            max_x: 180.0,
            max_y: 90.0,
        };
        let broad = index.search_intersects("hotels", &world).unwrap();
        assert_eq!(broad.len(), 1);
        let refined = index.refine_exact(broad, &world, false).unwrap();
        assert!(refined.is_empty());
    }
}
