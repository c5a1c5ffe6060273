//! Vector (ANN) index: an HNSW graph with persistence.
//!
//! One index per `(table, field)`. Cosine queries and inserts normalize
//! vectors, so cosine distance reduces to `1 - dot`. Deletes tombstone the
//! node: links stay navigable, results exclude it, and a rebuild drops it.
//!
//! Whitelist-filtered search traverses the full graph but only collects
//! whitelisted labels; an empty whitelist short-circuits to an empty
//! result.

pub mod persistence;

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

/// Distance metric of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorMetric {
    /// Cosine distance (`1 - cos`), with normalized vectors.
    Cosine,
    /// Euclidean (L2) distance.
    L2,
}

/// Construction and search parameters of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Vector dimensionality.
    pub dim: usize,
    /// Distance metric.
    pub metric: VectorMetric,
    /// Maximum neighbors per node on upper layers (2M on layer 0).
    pub m: usize,
    /// Beam width during construction.
    pub ef_construction: usize,
    /// Default beam width during search.
    pub ef_search: usize,
}

impl HnswParams {
    /// Creates parameters with conventional defaults for a dimensionality
    /// and metric.
    #[must_use]
    pub fn new(dim: usize, metric: VectorMetric) -> Self {
        Self {
            dim,
            metric,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Node {
    pub(crate) label: String,
    pub(crate) vector: Vec<f32>,
    /// Neighbor lists, one per layer the node participates in.
    pub(crate) neighbors: Vec<Vec<usize>>,
    pub(crate) deleted: bool,
}

/// Max-heap entry ordered by distance (largest on top).
#[derive(PartialEq)]
struct FarEntry(f32, usize);
impl Eq for FarEntry {}
impl Ord for FarEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}
impl PartialOrd for FarEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap entry ordered by distance (smallest on top).
#[derive(PartialEq)]
struct NearEntry(f32, usize);
impl Eq for NearEntry {}
impl Ord for NearEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.total_cmp(&self.0)
    }
}
impl PartialOrd for NearEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An HNSW graph over labeled vectors.
pub struct HnswIndex {
    params: HnswParams,
    pub(crate) nodes: Vec<Node>,
    pub(crate) label_map: HashMap<String, usize>,
    pub(crate) entry_point: Option<usize>,
    pub(crate) max_layer: usize,
    /// 1 / ln(M), the layer assignment multiplier.
    level_mult: f64,
}

impl HnswIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(params: HnswParams) -> Self {
        let level_mult = 1.0 / (params.m.max(2) as f64).ln();
        Self {
            params,
            nodes: Vec::new(),
            label_map: HashMap::new(),
            entry_point: None,
            max_layer: 0,
            level_mult,
        }
    }

    /// Returns the index parameters.
    #[must_use]
    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Number of live (non-deleted) vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| !n.deleted).count()
    }

    /// Returns true if the index holds no live vectors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if a label is indexed and live.
    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.label_map
            .get(label)
            .is_some_and(|&id| !self.nodes[id].deleted)
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.params.metric {
            VectorMetric::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                1.0 - dot
            }
            VectorMetric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }

    fn prepare(&self, vector: &[f32]) -> CoreResult<Vec<f32>> {
        if vector.len() != self.params.dim {
            return Err(CoreError::invalid_operation(format!(
                "vector has dimension {}, index expects {}",
                vector.len(),
                self.params.dim
            )));
        }
        let mut v = vector.to_vec();
        if self.params.metric == VectorMetric::Cosine {
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in &mut v {
                    *x /= norm;
                }
            }
        }
        Ok(v)
    }

    fn random_level(&self) -> usize {
        let uniform: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let level = (-uniform.ln() * self.level_mult) as usize;
        level.min(31)
    }

    /// Inserts or replaces a labeled vector.
    ///
    /// # Errors
    ///
    /// Returns an error on a dimension mismatch.
    pub fn add(&mut self, label: &str, vector: &[f32]) -> CoreResult<()> {
        let vector = self.prepare(vector)?;

        // Replacing an existing label tombstones the old node.
        if let Some(&old) = self.label_map.get(label) {
            self.nodes[old].deleted = true;
        }

        let level = self.random_level();
        let id = self.nodes.len();
        self.nodes.push(Node {
            label: label.to_string(),
            vector: vector.clone(),
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.label_map.insert(label.to_string(), id);

        let Some(mut ep) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_layer = level;
            return Ok(());
        };

        // Greedy descent through layers above the new node's level.
        for layer in ((level + 1)..=self.max_layer).rev() {
            ep = self.greedy_closest(&vector, ep, layer);
        }

        // Connect on each shared layer.
        for layer in (0..=level.min(self.max_layer)).rev() {
            let candidates =
                self.search_layer(&vector, ep, self.params.ef_construction, layer);
            let max_links = if layer == 0 {
                self.params.m * 2
            } else {
                self.params.m
            };
            let selected: Vec<usize> = candidates
                .iter()
                .take(self.params.m)
                .map(|&(_, node)| node)
                .collect();

            for &neighbor in &selected {
                self.nodes[id].neighbors[layer].push(neighbor);
                self.nodes[neighbor].neighbors[layer].push(id);
                self.prune_neighbors(neighbor, layer, max_links);
            }
            if let Some(&(_, closest)) = candidates.first() {
                ep = closest;
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(id);
        }
        Ok(())
    }

    fn prune_neighbors(&mut self, node: usize, layer: usize, max_links: usize) {
        if self.nodes[node].neighbors[layer].len() <= max_links {
            return;
        }
        let origin = self.nodes[node].vector.clone();
        let mut scored: Vec<(f32, usize)> = self.nodes[node].neighbors[layer]
            .iter()
            .map(|&n| (self.distance(&origin, &self.nodes[n].vector), n))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.truncate(max_links);
        self.nodes[node].neighbors[layer] = scored.into_iter().map(|(_, n)| n).collect();
    }

    fn greedy_closest(&self, query: &[f32], start: usize, layer: usize) -> usize {
        let mut current = start;
        let mut current_dist = self.distance(query, &self.nodes[current].vector);
        loop {
            let mut improved = false;
            let neighbors = match self.nodes[current].neighbors.get(layer) {
                Some(n) => n.clone(),
                None => return current,
            };
            for neighbor in neighbors {
                let dist = self.distance(query, &self.nodes[neighbor].vector);
                if dist < current_dist {
                    current = neighbor;
                    current_dist = dist;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one layer. Returns `(distance, node)` ascending.
    fn search_layer(
        &self,
        query: &[f32],
        entry: usize,
        ef: usize,
        layer: usize,
    ) -> Vec<(f32, usize)> {
        let entry_dist = self.distance(query, &self.nodes[entry].vector);
        let mut visited: HashSet<usize> = HashSet::from([entry]);
        let mut candidates: BinaryHeap<NearEntry> = BinaryHeap::from([NearEntry(entry_dist, entry)]);
        let mut found: BinaryHeap<FarEntry> = BinaryHeap::from([FarEntry(entry_dist, entry)]);

        while let Some(NearEntry(dist, node)) = candidates.pop() {
            let worst = found.peek().map_or(f32::INFINITY, |f| f.0);
            if dist > worst && found.len() >= ef {
                break;
            }
            let neighbors = match self.nodes[node].neighbors.get(layer) {
                Some(n) => n.clone(),
                None => continue,
            };
            for neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let neighbor_dist = self.distance(query, &self.nodes[neighbor].vector);
                let worst = found.peek().map_or(f32::INFINITY, |f| f.0);
                if found.len() < ef || neighbor_dist < worst {
                    candidates.push(NearEntry(neighbor_dist, neighbor));
                    found.push(FarEntry(neighbor_dist, neighbor));
                    if found.len() > ef {
                        found.pop();
                    }
                }
            }
        }

        let mut out: Vec<(f32, usize)> = found.into_iter().map(|FarEntry(d, n)| (d, n)).collect();
        out.sort_by(|a, b| a.0.total_cmp(&b.0));
        out
    }

    /// Tombstones a label. Returns true if it was present and live.
    pub fn delete(&mut self, label: &str) -> bool {
        match self.label_map.get(label) {
            Some(&id) if !self.nodes[id].deleted => {
                self.nodes[id].deleted = true;
                true
            }
            _ => false,
        }
    }

    /// Nearest-neighbor search.
    ///
    /// With a whitelist, only whitelisted labels are collected (the graph
    /// is still traversed through other nodes); an empty whitelist returns
    /// empty. Results are `(label, distance)` ascending, at most `k`.
    ///
    /// # Errors
    ///
    /// Returns an error on a dimension mismatch.
    pub fn search_knn(
        &self,
        query: &[f32],
        k: usize,
        whitelist: Option<&HashSet<String>>,
    ) -> CoreResult<Vec<(String, f32)>> {
        if k == 0 || self.nodes.is_empty() {
            return Ok(Vec::new());
        }
        if whitelist.is_some_and(HashSet::is_empty) {
            return Ok(Vec::new());
        }
        let query = self.prepare(query)?;
        let Some(mut ep) = self.entry_point else {
            return Ok(Vec::new());
        };

        for layer in (1..=self.max_layer).rev() {
            ep = self.greedy_closest(&query, ep, layer);
        }

        // Widen the beam when filtering so enough allowed labels surface.
        let mut ef = self.params.ef_search.max(k);
        if whitelist.is_some() {
            ef = ef.max(k * 4);
        }

        let mut results = self.collect(
            self.search_layer(&query, ep, ef, 0),
            k,
            whitelist,
        );

        // A highly selective whitelist can defeat the beam; fall back to an
        // exhaustive pass so the contract (min(k, |W ∩ indexed|)) holds.
        if let Some(whitelist) = whitelist {
            if results.len() < k && results.len() < self.live_whitelisted(whitelist) {
                let mut scored: Vec<(f32, usize)> = self
                    .nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| !n.deleted && whitelist.contains(&n.label))
                    .map(|(i, n)| (self.distance(&query, &n.vector), i))
                    .collect();
                scored.sort_by(|a, b| a.0.total_cmp(&b.0));
                results = self.collect(scored, k, Some(whitelist));
            }
        }
        Ok(results)
    }

    fn live_whitelisted(&self, whitelist: &HashSet<String>) -> usize {
        whitelist
            .iter()
            .filter(|label| self.contains(label))
            .count()
    }

    fn collect(
        &self,
        scored: Vec<(f32, usize)>,
        k: usize,
        whitelist: Option<&HashSet<String>>,
    ) -> Vec<(String, f32)> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(k);
        for (dist, node) in scored {
            let node = &self.nodes[node];
            if node.deleted {
                continue;
            }
            if whitelist.is_some_and(|w| !w.contains(&node.label)) {
                continue;
            }
            if !seen.insert(node.label.clone()) {
                continue;
            }
            out.push((node.label.clone(), dist));
            if out.len() >= k {
                break;
            }
        }
        out
    }

    /// All labels within distance `eps`, nearest first, truncated at `max`.
    ///
    /// Exhaustive over live nodes, so the radius contract is exact.
    ///
    /// # Errors
    ///
    /// Returns an error on a dimension mismatch.
    pub fn search_radius(
        &self,
        query: &[f32],
        eps: f32,
        max: Option<usize>,
    ) -> CoreResult<Vec<(String, f32)>> {
        let query = self.prepare(query)?;
        let mut scored: Vec<(String, f32)> = self
            .nodes
            .iter()
            .filter(|n| !n.deleted)
            .filter_map(|n| {
                let dist = self.distance(&query, &n.vector);
                (dist <= eps).then(|| (n.label.clone(), dist))
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        if let Some(max) = max {
            scored.truncate(max);
        }
        Ok(scored)
    }

    /// All live `(label, vector)` pairs, for rebuilds and persistence.
    #[must_use]
    pub fn live_vectors(&self) -> Vec<(String, Vec<f32>)> {
        self.nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| (n.label.clone(), n.vector.clone()))
            .collect()
    }
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dim", &self.params.dim)
            .field("metric", &self.params.metric)
            .field("live", &self.len())
            .finish_non_exhaustive()
    }
}

/// Registry of vector indexes keyed by `(table, field)`.
///
/// Mutation is serialized per index by its write lock; searches share the
/// read lock.
#[derive(Debug, Default)]
pub struct VectorIndexManager {
    indexes: RwLock<HashMap<(String, String), Arc<RwLock<HnswIndex>>>>,
}

impl VectorIndexManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index for `(table, field)`, creating it with `params`
    /// if absent.
    pub fn get_or_create(
        &self,
        table: &str,
        field: &str,
        params: HnswParams,
    ) -> Arc<RwLock<HnswIndex>> {
        let key = (table.to_string(), field.to_string());
        if let Some(index) = self.indexes.read().get(&key) {
            return Arc::clone(index);
        }
        let mut indexes = self.indexes.write();
        Arc::clone(
            indexes
                .entry(key)
                .or_insert_with(|| Arc::new(RwLock::new(HnswIndex::new(params)))),
        )
    }

    /// Returns the index for `(table, field)` if it exists.
    #[must_use]
    pub fn get(&self, table: &str, field: &str) -> Option<Arc<RwLock<HnswIndex>>> {
        self.indexes
            .read()
            .get(&(table.to_string(), field.to_string()))
            .cloned()
    }

    /// Installs a loaded index, replacing any existing one.
    pub fn install(&self, table: &str, field: &str, index: HnswIndex) {
        self.indexes.write().insert(
            (table.to_string(), field.to_string()),
            Arc::new(RwLock::new(index)),
        );
    }

    /// All `(table, field)` pairs with an index.
    #[must_use]
    pub fn keys(&self) -> Vec<(String, String)> {
        self.indexes.read().keys().cloned().collect()
    }
}
