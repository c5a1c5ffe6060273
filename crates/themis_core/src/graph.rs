//! Graph adjacency index and traversal.
//!
//! Edges are plain entities with `from` and `to` fields holding vertex
//! entity keys. The adjacency index mirrors each edge on both endpoints in
//! the `graph` column family (`graph:out:<from>:<edge_id>` and
//! `graph:in:<to>:<edge_id>`), so traversal in either direction is a
//! prefix scan. Cycles are handled with explicit visited sets.

use crate::aql::Direction;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use themis_codec::{Entity, Value};
use themis_storage::{ColumnFamily, KvStore, WriteBatch};

/// Hard cap on estimated traversal expansion.
pub const MAX_EXPANSION: u64 = 1_000_000;

/// One adjacency record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjacencyEntry {
    /// The edge entity's key.
    pub edge_key: String,
    /// Edge table name.
    pub edge_table: String,
    /// Source vertex key.
    pub from: String,
    /// Target vertex key.
    pub to: String,
    /// Optional edge weight (defaults to 1.0 in Dijkstra).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

/// A computed shortest path.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    /// Vertex keys from start to target, inclusive.
    pub vertices: Vec<String>,
    /// Edge keys along the path.
    pub edges: Vec<String>,
    /// Total weight.
    pub cost: f64,
}

/// The graph adjacency index.
pub struct GraphIndex {
    store: Arc<KvStore>,
}

impl GraphIndex {
    /// Creates an index over the substrate.
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    fn out_key(from: &str, edge_pk: &str) -> Vec<u8> {
        format!("graph:out:{from}:{edge_pk}").into_bytes()
    }

    fn in_key(to: &str, edge_pk: &str) -> Vec<u8> {
        format!("graph:in:{to}:{edge_pk}").into_bytes()
    }

    /// Reads an edge entity's endpoints, if it has them.
    fn edge_endpoints(entity: &Entity) -> Option<(String, String, Option<f64>)> {
        let from = entity.get_field("from")?.as_str()?.to_string();
        let to = entity.get_field("to")?.as_str()?.to_string();
        let weight = entity.get_field("weight").and_then(Value::as_float);
        Some((from, to, weight))
    }

    /// Builds the adjacency co-updates for an edge entity put.
    ///
    /// Entities without `from`/`to` produce no adjacency (they are plain
    /// records, not edges).
    #[must_use]
    pub fn ops_for_put(&self, pk: &str, entity: &Entity, prior: Option<&Entity>) -> WriteBatch {
        let mut batch = WriteBatch::new();
        let Some(table) = entity.table() else {
            return batch;
        };

        if let Some(prior) = prior {
            if let Some((from, to, _)) = Self::edge_endpoints(prior) {
                batch.delete(ColumnFamily::Graph, Self::out_key(&from, pk));
                batch.delete(ColumnFamily::Graph, Self::in_key(&to, pk));
            }
        }

        if let Some((from, to, weight)) = Self::edge_endpoints(entity) {
            let entry = AdjacencyEntry {
                edge_key: entity.key().to_string(),
                edge_table: table.to_string(),
                from: from.clone(),
                to: to.clone(),
                weight,
            };
            if let Ok(bytes) = serde_json::to_vec(&entry) {
                batch.put(ColumnFamily::Graph, Self::out_key(&from, pk), bytes.clone());
                batch.put(ColumnFamily::Graph, Self::in_key(&to, pk), bytes);
            }
        }
        batch
    }

    /// Builds the adjacency co-updates removing a deleted edge.
    #[must_use]
    pub fn ops_for_delete(&self, pk: &str, prior: &Entity) -> WriteBatch {
        let mut batch = WriteBatch::new();
        if let Some((from, to, _)) = Self::edge_endpoints(prior) {
            batch.delete(ColumnFamily::Graph, Self::out_key(&from, pk));
            batch.delete(ColumnFamily::Graph, Self::in_key(&to, pk));
        }
        batch
    }

    /// Adjacency entries leaving (or entering, for `Inbound`) a vertex,
    /// restricted to one edge table.
    ///
    /// # Errors
    ///
    /// Returns an error if adjacency data fails to decode.
    pub fn neighbors(
        &self,
        vertex: &str,
        direction: Direction,
        edge_table: &str,
    ) -> CoreResult<Vec<AdjacencyEntry>> {
        let prefix = match direction {
            Direction::Outbound => format!("graph:out:{vertex}:"),
            Direction::Inbound => format!("graph:in:{vertex}:"),
        };
        let entries = self
            .store
            .scan_prefix(ColumnFamily::Graph, prefix.as_bytes(), None, false)?;
        let mut out = Vec::with_capacity(entries.len());
        for (_, bytes) in entries {
            let entry: AdjacencyEntry = serde_json::from_slice(&bytes).map_err(|e| {
                CoreError::index_corrupt(format!("adjacency decode failed: {e}"))
            })?;
            if entry.edge_table == edge_table {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn step_target(entry: &AdjacencyEntry, direction: Direction) -> &str {
        match direction {
            Direction::Outbound => &entry.to,
            Direction::Inbound => &entry.from,
        }
    }

    /// Breadth-first traversal collecting vertices at depth
    /// `[min_depth, max_depth]` from `start`.
    ///
    /// An optional `allowed` set prunes vertices during expansion (spatial
    /// constraint pushdown). Cycles are cut by the visited set.
    ///
    /// # Errors
    ///
    /// Returns a `Plan` error if the estimated expansion exceeds
    /// [`MAX_EXPANSION`].
    pub fn bfs(
        &self,
        start: &str,
        direction: Direction,
        edge_table: &str,
        min_depth: u32,
        max_depth: u32,
        allowed: Option<&HashSet<String>>,
    ) -> CoreResult<Vec<String>> {
        self.check_expansion(start, direction, edge_table, max_depth)?;

        let mut visited: HashSet<String> = HashSet::from([start.to_string()]);
        let mut frontier: VecDeque<(String, u32)> = VecDeque::from([(start.to_string(), 0)]);
        let mut out = Vec::new();

        while let Some((vertex, depth)) = frontier.pop_front() {
            if depth >= min_depth && depth > 0 {
                out.push(vertex.clone());
            }
            if depth >= max_depth {
                continue;
            }
            for entry in self.neighbors(&vertex, direction, edge_table)? {
                let next = Self::step_target(&entry, direction);
                if allowed.is_some_and(|set| !set.contains(next)) {
                    continue;
                }
                if visited.insert(next.to_string()) {
                    frontier.push_back((next.to_string(), depth + 1));
                }
            }
        }
        Ok(out)
    }

    /// Samples the first two expansion layers and returns the estimated
    /// branching factor and first-layer fanout.
    ///
    /// # Errors
    ///
    /// Returns an error if adjacency data fails to decode.
    pub fn estimate_branching(
        &self,
        start: &str,
        direction: Direction,
        edge_table: &str,
    ) -> CoreResult<(f64, usize)> {
        let first = self.neighbors(start, direction, edge_table)?;
        if first.is_empty() {
            return Ok((0.0, 0));
        }
        let mut second_total = 0usize;
        for entry in first.iter().take(8) {
            second_total += self
                .neighbors(Self::step_target(entry, direction), direction, edge_table)?
                .len();
        }
        let sampled = first.len().min(8).max(1);
        #[allow(clippy::cast_precision_loss)]
        Ok((second_total as f64 / sampled as f64, first.len()))
    }

    /// Estimates the branching factor by sampling the first two expansion
    /// layers, then rejects traversals whose projected expansion exceeds
    /// [`MAX_EXPANSION`].
    fn check_expansion(
        &self,
        start: &str,
        direction: Direction,
        edge_table: &str,
        max_depth: u32,
    ) -> CoreResult<()> {
        let first = self.neighbors(start, direction, edge_table)?;
        if first.is_empty() {
            return Ok(());
        }
        let mut second_total = 0usize;
        for entry in first.iter().take(8) {
            second_total += self
                .neighbors(Self::step_target(entry, direction), direction, edge_table)?
                .len();
        }
        let sampled = first.len().min(8).max(1);
        let branching = (second_total / sampled).max(1) as u64;

        let mut estimate: u64 = first.len() as u64;
        for _ in 1..max_depth {
            estimate = estimate.saturating_mul(branching);
            if estimate > MAX_EXPANSION {
                return Err(CoreError::plan(format!(
                    "estimated traversal expansion exceeds {MAX_EXPANSION}"
                )));
            }
        }
        Ok(())
    }

    /// Dijkstra shortest path from `start` to `target`.
    ///
    /// Edge weights default to 1.0, so unweighted graphs reduce to BFS
    /// distances. An optional `allowed` set prunes vertices (the target
    /// and start are always allowed).
    ///
    /// # Errors
    ///
    /// Returns a `Plan` error on excessive expansion; `Ok(None)` when no
    /// path exists.
    pub fn shortest_path(
        &self,
        start: &str,
        target: &str,
        direction: Direction,
        edge_table: &str,
        allowed: Option<&HashSet<String>>,
    ) -> CoreResult<Option<Path>> {
        #[derive(PartialEq)]
        struct QueueEntry(f64, String);
        impl Eq for QueueEntry {}
        impl Ord for QueueEntry {
            fn cmp(&self, other: &Self) -> Ordering {
                // Min-heap on cost.
                other.0.total_cmp(&self.0)
            }
        }
        impl PartialOrd for QueueEntry {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        if start == target {
            return Ok(Some(Path {
                vertices: vec![start.to_string()],
                edges: Vec::new(),
                cost: 0.0,
            }));
        }

        let mut dist: HashMap<String, f64> = HashMap::from([(start.to_string(), 0.0)]);
        let mut prev: HashMap<String, (String, String)> = HashMap::new();
        let mut queue = BinaryHeap::from([QueueEntry(0.0, start.to_string())]);
        let mut expanded: u64 = 0;

        while let Some(QueueEntry(cost, vertex)) = queue.pop() {
            if vertex == target {
                break;
            }
            if dist.get(&vertex).is_some_and(|&d| cost > d) {
                continue;
            }
            expanded += 1;
            if expanded > MAX_EXPANSION {
                return Err(CoreError::plan(format!(
                    "traversal expansion exceeded {MAX_EXPANSION}"
                )));
            }

            for entry in self.neighbors(&vertex, direction, edge_table)? {
                let next = Self::step_target(&entry, direction).to_string();
                if next != target && allowed.is_some_and(|set| !set.contains(&next)) {
                    continue;
                }
                let weight = entry.weight.unwrap_or(1.0);
                if weight < 0.0 {
                    return Err(CoreError::invalid_operation(
                        "negative edge weights are not supported",
                    ));
                }
                let next_cost = cost + weight;
                if dist.get(&next).map_or(true, |&d| next_cost < d) {
                    dist.insert(next.clone(), next_cost);
                    prev.insert(next.clone(), (vertex.clone(), entry.edge_key.clone()));
                    queue.push(QueueEntry(next_cost, next));
                }
            }
        }

        let Some(&cost) = dist.get(target) else {
            return Ok(None);
        };

        let mut vertices = vec![target.to_string()];
        let mut edges = Vec::new();
        let mut current = target.to_string();
        while let Some((parent, edge)) = prev.get(&current) {
            vertices.push(parent.clone());
            edges.push(edge.clone());
            current = parent.clone();
        }
        vertices.reverse();
        edges.reverse();
        Ok(Some(Path {
            vertices,
            edges,
            cost,
        }))
    }
}

impl std::fmt::Debug for GraphIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphIndex").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<KvStore>, GraphIndex) {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let graph = GraphIndex::new(Arc::clone(&store));
        (store, graph)
    }

    fn add_edge(
        store: &KvStore,
        graph: &GraphIndex,
        pk: &str,
        from: &str,
        to: &str,
        weight: Option<f64>,
    ) {
        let mut entity = Entity::new(format!("follows:{pk}"));
        entity.set_field("from", Value::from(from));
        entity.set_field("to", Value::from(to));
        if let Some(weight) = weight {
            entity.set_field("weight", Value::from(weight));
        }
        let mut batch = graph.ops_for_put(pk, &entity, None);
        batch.put(
            ColumnFamily::Default,
            entity.key().as_bytes().to_vec(),
            entity.to_bytes().unwrap(),
        );
        store.write_batch(batch).unwrap();
    }

    #[test]
    fn neighbors_both_directions() {
        let (store, graph) = setup();
        add_edge(&store, &graph, "e1", "users:a", "users:b", None);
        add_edge(&store, &graph, "e2", "users:a", "users:c", None);

        let out = graph
            .neighbors("users:a", Direction::Outbound, "follows")
            .unwrap();
        assert_eq!(out.len(), 2);

        let inbound = graph
            .neighbors("users:b", Direction::Inbound, "follows")
            .unwrap();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].from, "users:a");
    }

    #[test]
    fn edge_table_filter() {
        let (store, graph) = setup();
        add_edge(&store, &graph, "e1", "users:a", "users:b", None);

        // Same endpoints, different edge table.
        let mut entity = Entity::new("likes:l1");
        entity.set_field("from", Value::from("users:a"));
        entity.set_field("to", Value::from("users:b"));
        let batch = graph.ops_for_put("l1", &entity, None);
        store.write_batch(batch).unwrap();

        let follows = graph
            .neighbors("users:a", Direction::Outbound, "follows")
            .unwrap();
        assert_eq!(follows.len(), 1);
        let likes = graph
            .neighbors("users:a", Direction::Outbound, "likes")
            .unwrap();
        assert_eq!(likes.len(), 1);
    }

    #[test]
    fn bfs_depth_window_and_cycles() {
        let (store, graph) = setup();
        // a -> b -> c -> a (cycle), b -> d
        add_edge(&store, &graph, "e1", "users:a", "users:b", None);
        add_edge(&store, &graph, "e2", "users:b", "users:c", None);
        add_edge(&store, &graph, "e3", "users:c", "users:a", None);
        add_edge(&store, &graph, "e4", "users:b", "users:d", None);

        let depth1 = graph
            .bfs("users:a", Direction::Outbound, "follows", 1, 1, None)
            .unwrap();
        assert_eq!(depth1, vec!["users:b".to_string()]);

        let mut depth2 = graph
            .bfs("users:a", Direction::Outbound, "follows", 2, 2, None)
            .unwrap();
        depth2.sort();
        assert_eq!(depth2, vec!["users:c".to_string(), "users:d".to_string()]);

        // Cycle terminates; depth 1..10 visits each vertex once.
        let all = graph
            .bfs("users:a", Direction::Outbound, "follows", 1, 10, None)
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn bfs_respects_allowed_set() {
        let (store, graph) = setup();
        add_edge(&store, &graph, "e1", "users:a", "users:b", None);
        add_edge(&store, &graph, "e2", "users:b", "users:c", None);

        let allowed: HashSet<String> = ["users:c".to_string()].into();
        // b is pruned, so c is unreachable.
        let hits = graph
            .bfs("users:a", Direction::Outbound, "follows", 1, 3, Some(&allowed))
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn shortest_path_weighted() {
        let (store, graph) = setup();
        // a -> b -> d costs 2; a -> c -> d costs 1.5.
        add_edge(&store, &graph, "e1", "users:a", "users:b", Some(1.0));
        add_edge(&store, &graph, "e2", "users:b", "users:d", Some(1.0));
        add_edge(&store, &graph, "e3", "users:a", "users:c", Some(0.5));
        add_edge(&store, &graph, "e4", "users:c", "users:d", Some(1.0));

        let path = graph
            .shortest_path("users:a", "users:d", Direction::Outbound, "follows", None)
            .unwrap()
            .unwrap();
        assert_eq!(
            path.vertices,
            vec!["users:a".to_string(), "users:c".to_string(), "users:d".to_string()]
        );
        assert_eq!(path.edges, vec!["follows:e3".to_string(), "follows:e4".to_string()]);
        assert!((path.cost - 1.5).abs() < 1e-9);
    }

    #[test]
    fn shortest_path_absent() {
        let (store, graph) = setup();
        add_edge(&store, &graph, "e1", "users:a", "users:b", None);
        let path = graph
            .shortest_path("users:b", "users:a", Direction::Outbound, "follows", None)
            .unwrap();
        assert!(path.is_none());
    }

    #[test]
    fn shortest_path_trivial() {
        let (_, graph) = setup();
        let path = graph
            .shortest_path("users:a", "users:a", Direction::Outbound, "follows", None)
            .unwrap()
            .unwrap();
        assert_eq!(path.vertices, vec!["users:a".to_string()]);
        assert_eq!(path.cost, 0.0);
    }

    #[test]
    fn edge_update_moves_adjacency() {
        let (store, graph) = setup();
        add_edge(&store, &graph, "e1", "users:a", "users:b", None);

        let mut prior = Entity::new("follows:e1");
        prior.set_field("from", Value::from("users:a"));
        prior.set_field("to", Value::from("users:b"));

        let mut updated = Entity::new("follows:e1");
        updated.set_field("from", Value::from("users:a"));
        updated.set_field("to", Value::from("users:c"));

        let batch = graph.ops_for_put("e1", &updated, Some(&prior));
        store.write_batch(batch).unwrap();

        assert!(graph
            .neighbors("users:b", Direction::Inbound, "follows")
            .unwrap()
            .is_empty());
        assert_eq!(
            graph
                .neighbors("users:c", Direction::Inbound, "follows")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn delete_removes_adjacency() {
        let (store, graph) = setup();
        add_edge(&store, &graph, "e1", "users:a", "users:b", None);

        let mut prior = Entity::new("follows:e1");
        prior.set_field("from", Value::from("users:a"));
        prior.set_field("to", Value::from("users:b"));
        store.write_batch(graph.ops_for_delete("e1", &prior)).unwrap();

        assert!(graph
            .neighbors("users:a", Direction::Outbound, "follows")
            .unwrap()
            .is_empty());
    }
}
