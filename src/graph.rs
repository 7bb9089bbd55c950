//! # Graph overlay
//!
//! Typed nodes and weighted directed edges layered over the same SQLite
//! substrate as the records. Nodes carry an optional vector and a JSON
//! properties bag; edges are `(from, to, type, weight ≥ 0)` with
//! foreign-key integrity, so deleting either endpoint deletes the edge —
//! cycles live in the tables, never as pointers.
//!
//! The hybrid node query blends three normalized signals: vector
//! similarity over the node subset, a breadth-first traversal score (max
//! over paths of the product of edge weights, from an optional start
//! node), and the sum of incident edge weights.

use std::collections::{HashMap, VecDeque};

use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::vector::{decode_vector, encode_vector, validate_vector};

/// A typed node. `properties` is free-form JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub node_type: String,
    pub vector: Option<Vec<f32>>,
    pub content: String,
    pub properties: HashMap<String, Value>,
    pub created_at: i64,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            vector: None,
            content: String::new(),
            properties: HashMap::new(),
            created_at: 0,
        }
    }
}

/// A typed, weighted, directed edge between two existing nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub from_id: String,
    pub to_id: String,
    pub edge_type: String,
    pub weight: f32,
    pub properties: HashMap<String, Value>,
    pub created_at: i64,
}

impl GraphEdge {
    pub fn new(
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        edge_type: impl Into<String>,
        weight: f32,
    ) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            edge_type: edge_type.into(),
            weight,
            properties: HashMap::new(),
            created_at: 0,
        }
    }
}

/// Which incident edges `list_edges` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    Both,
}

/// Channel weights for [`Store::graph_query`].
#[derive(Debug, Clone, Copy)]
pub struct GraphWeights {
    pub vector: f32,
    pub graph: f32,
    pub edge: f32,
}

impl Default for GraphWeights {
    fn default() -> Self {
        Self {
            vector: 0.5,
            graph: 0.3,
            edge: 0.2,
        }
    }
}

/// A traversal-weighted hybrid node query.
#[derive(Debug, Clone)]
pub struct GraphQuery {
    pub q_vec: Vec<f32>,
    pub start_node: Option<String>,
    pub top_k: usize,
    pub weights: GraphWeights,
    pub max_depth: usize,
}

impl Default for GraphQuery {
    fn default() -> Self {
        Self {
            q_vec: Vec::new(),
            start_node: None,
            top_k: 10,
            weights: GraphWeights::default(),
            max_depth: 2,
        }
    }
}

/// A scored node from [`Store::graph_query`].
#[derive(Debug, Clone)]
pub struct GraphHit {
    pub node: GraphNode,
    pub score: f32,
    pub vector_score: f32,
    pub graph_score: f32,
    pub edge_score: f32,
}

impl Store {
    /// Insert or replace a node, mirroring its content into the node
    /// keyword index.
    pub fn upsert_node(&self, mut node: GraphNode) -> Result<GraphNode> {
        const OP: &str = "upsert_node";
        self.check_open(OP)?;
        if node.id.is_empty() || node.node_type.is_empty() {
            return Err(Error::invalid_config(OP, "node id and type must not be empty"));
        }
        if let Some(v) = &node.vector {
            validate_vector(OP, v)?;
        }
        if node.created_at == 0 {
            node.created_at = Self::now();
        }
        let blob = node.vector.as_ref().map(|v| encode_vector(v));
        let properties = serde_json::to_string(&node.properties)
            .map_err(|e| Error::invalid_config(OP, e.to_string()))?;

        self.with_txn(OP, |tx| {
            tx.execute(
                "INSERT INTO graph_nodes (id, node_type, vector, content, properties, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    node_type = excluded.node_type,
                    vector = excluded.vector,
                    content = excluded.content,
                    properties = excluded.properties",
                params![node.id, node.node_type, blob, node.content, properties, node.created_at],
            )?;
            tx.execute("DELETE FROM graph_nodes_fts WHERE id = ?1", params![node.id])?;
            if !node.content.is_empty() {
                tx.execute(
                    "INSERT INTO graph_nodes_fts (id, content) VALUES (?1, ?2)",
                    params![node.id, node.content],
                )?;
            }
            Ok(())
        })?;
        Ok(node)
    }

    /// Fetch a node by id.
    pub fn get_node(&self, id: &str) -> Result<GraphNode> {
        const OP: &str = "get_node";
        self.check_open(OP)?;
        let node = self.with_conn(OP, |conn| {
            conn.query_row(
                "SELECT id, node_type, vector, content, properties, created_at
                 FROM graph_nodes WHERE id = ?1",
                params![id],
                row_to_node,
            )
            .optional()
        })?;
        node.ok_or_else(|| Error::not_found(OP, id))
    }

    /// Delete a node; incident edges cascade with it.
    pub fn delete_node(&self, id: &str) -> Result<()> {
        const OP: &str = "delete_node";
        self.check_open(OP)?;
        let deleted = self.with_txn(OP, |tx| {
            tx.execute("DELETE FROM graph_nodes_fts WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM graph_nodes WHERE id = ?1", params![id])
        })?;
        if deleted == 0 {
            return Err(Error::not_found(OP, id));
        }
        Ok(())
    }

    /// Insert or replace an edge. Both endpoints must exist.
    pub fn upsert_edge(&self, mut edge: GraphEdge) -> Result<GraphEdge> {
        const OP: &str = "upsert_edge";
        self.check_open(OP)?;
        if !edge.weight.is_finite() || edge.weight < 0.0 {
            return Err(Error::invalid_config(
                OP,
                "edge weight must be finite and non-negative",
            ));
        }
        if edge.created_at == 0 {
            edge.created_at = Self::now();
        }
        let properties = serde_json::to_string(&edge.properties)
            .map_err(|e| Error::invalid_config(OP, e.to_string()))?;

        self.with_txn(OP, |tx| {
            for endpoint in [&edge.from_id, &edge.to_id] {
                let exists: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM graph_nodes WHERE id = ?1",
                        params![endpoint],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    // Signalled through the error mapping below.
                    return Err(rusqlite::Error::QueryReturnedNoRows);
                }
            }
            tx.execute(
                "INSERT INTO graph_edges (from_id, to_id, edge_type, weight, properties, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(from_id, to_id, edge_type) DO UPDATE SET
                    weight = excluded.weight,
                    properties = excluded.properties",
                params![
                    edge.from_id,
                    edge.to_id,
                    edge.edge_type,
                    edge.weight as f64,
                    properties,
                    edge.created_at
                ],
            )?;
            Ok(())
        })
        .map_err(|e| match e {
            Error::Storage {
                source: rusqlite::Error::QueryReturnedNoRows,
                ..
            } => Error::not_found(OP, format!("{} -> {}", edge.from_id, edge.to_id)),
            other => other,
        })?;
        Ok(edge)
    }

    /// Edges incident to a node, filtered by direction.
    pub fn list_edges(&self, node_id: &str, direction: Direction) -> Result<Vec<GraphEdge>> {
        const OP: &str = "list_edges";
        self.check_open(OP)?;
        let predicate = match direction {
            Direction::Out => "from_id = ?1",
            Direction::In => "to_id = ?1",
            Direction::Both => "from_id = ?1 OR to_id = ?1",
        };
        self.with_conn(OP, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT from_id, to_id, edge_type, weight, properties, created_at
                 FROM graph_edges WHERE {predicate} ORDER BY from_id, to_id, edge_type"
            ))?;
            let rows = stmt.query_map(params![node_id], row_to_edge)?;
            rows.collect()
        })
    }

    /// Remove one edge.
    pub fn delete_edge(&self, from_id: &str, to_id: &str, edge_type: &str) -> Result<()> {
        const OP: &str = "delete_edge";
        self.check_open(OP)?;
        let deleted = self.with_conn(OP, |conn| {
            conn.execute(
                "DELETE FROM graph_edges WHERE from_id = ?1 AND to_id = ?2 AND edge_type = ?3",
                params![from_id, to_id, edge_type],
            )
        })?;
        if deleted == 0 {
            return Err(Error::not_found(
                OP,
                format!("{from_id} -[{edge_type}]-> {to_id}"),
            ));
        }
        Ok(())
    }

    /// Traversal-weighted hybrid query over the node set. See the module
    /// docs for the three channels; each is normalized to [0, 1] before
    /// blending.
    pub fn graph_query(&self, query: &GraphQuery, cancel: &CancelToken) -> Result<Vec<GraphHit>> {
        const OP: &str = "graph_query";
        self.check_open(OP)?;
        cancel.check(OP)?;

        let nodes = self.load_nodes(OP)?;
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        // Channel 1: vector similarity over vector-bearing nodes.
        let mut vector_scores: HashMap<String, f32> = HashMap::new();
        if !query.q_vec.is_empty() {
            validate_vector(OP, &query.q_vec)?;
            let q = self.adapt_for_query(OP, &query.q_vec, self.store_dims())?;
            let metric = self.config.similarity;
            for batch in nodes.chunks(self.config.batch_size.max(1)) {
                cancel.check(OP)?;
                for node in batch {
                    if let Some(v) = &node.vector {
                        if v.len() == q.len() {
                            let sim = metric.distance_to_similarity(metric.distance(&q, v));
                            vector_scores.insert(node.id.clone(), sim);
                        }
                    }
                }
            }
        }

        // Channel 2: max-product path weight from the start node.
        let graph_scores = match &query.start_node {
            Some(start) => self.traverse_scores(OP, start, query.max_depth)?,
            None => HashMap::new(),
        };

        // Channel 3: incident edge-weight sums.
        let edge_scores: HashMap<String, f32> = self.with_conn(OP, |conn| {
            let mut stmt = conn.prepare(
                "SELECT node_id, SUM(weight) FROM (
                     SELECT from_id AS node_id, weight FROM graph_edges
                     UNION ALL
                     SELECT to_id AS node_id, weight FROM graph_edges
                 ) GROUP BY node_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)? as f32))
            })?;
            rows.collect()
        })?;

        let norm = |scores: &HashMap<String, f32>| {
            scores
                .values()
                .copied()
                .fold(0.0f32, f32::max)
                .max(f32::EPSILON)
        };
        let v_max = norm(&vector_scores);
        let g_max = norm(&graph_scores);
        let e_max = norm(&edge_scores);

        let w = query.weights;
        let mut hits: Vec<GraphHit> = nodes
            .into_iter()
            .filter_map(|node| {
                let v = vector_scores.get(&node.id).copied();
                let g = graph_scores.get(&node.id).copied();
                // Nodes reached by neither scoring channel are not
                // candidates; edge degree alone doesn't nominate.
                if v.is_none() && g.is_none() {
                    return None;
                }
                let v = (v.unwrap_or(0.0) / v_max).clamp(0.0, 1.0);
                let g = (g.unwrap_or(0.0) / g_max).clamp(0.0, 1.0);
                let e = (edge_scores.get(&node.id).copied().unwrap_or(0.0) / e_max)
                    .clamp(0.0, 1.0);
                Some(GraphHit {
                    score: w.vector * v + w.graph * g + w.edge * e,
                    vector_score: v,
                    graph_score: g,
                    edge_score: e,
                    node,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        if query.top_k > 0 {
            hits.truncate(query.top_k);
        }
        Ok(hits)
    }

    /// Breadth-first max-product propagation along outgoing edges.
    fn traverse_scores(
        &self,
        op: &'static str,
        start: &str,
        max_depth: usize,
    ) -> Result<HashMap<String, f32>> {
        // Adjacency snapshot under one short lock.
        let adjacency: HashMap<String, Vec<(String, f32)>> = self.with_conn(op, |conn| {
            let mut stmt =
                conn.prepare("SELECT from_id, to_id, weight FROM graph_edges")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)? as f32,
                ))
            })?;
            let mut adj: HashMap<String, Vec<(String, f32)>> = HashMap::new();
            for row in rows {
                let (from, to, weight) = row?;
                adj.entry(from).or_default().push((to, weight));
            }
            Ok(adj)
        })?;

        let mut scores: HashMap<String, f32> = HashMap::new();
        scores.insert(start.to_string(), 1.0);
        let mut frontier: VecDeque<(String, f32, usize)> = VecDeque::new();
        frontier.push_back((start.to_string(), 1.0, 0));

        while let Some((node, score, depth)) = frontier.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(neighbors) = adjacency.get(&node) else {
                continue;
            };
            for (next, weight) in neighbors {
                let candidate = score * weight;
                let best = scores.get(next).copied().unwrap_or(0.0);
                // Monotone path weight: only a strictly better product
                // re-expands a node.
                if candidate > best {
                    scores.insert(next.clone(), candidate);
                    frontier.push_back((next.clone(), candidate, depth + 1));
                }
            }
        }
        Ok(scores)
    }

    fn load_nodes(&self, op: &'static str) -> Result<Vec<GraphNode>> {
        self.with_conn(op, |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, node_type, vector, content, properties, created_at
                 FROM graph_nodes ORDER BY id",
            )?;
            let rows = stmt.query_map([], row_to_node)?;
            rows.collect()
        })
    }
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphNode> {
    let blob: Option<Vec<u8>> = row.get(2)?;
    let vector = match blob {
        Some(b) => Some(decode_vector("get_node", &b).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Blob, Box::new(e))
        })?),
        None => None,
    };
    let properties: HashMap<String, Value> = row
        .get::<_, String>(4)
        .map(|s| serde_json::from_str(&s).unwrap_or_default())?;
    Ok(GraphNode {
        id: row.get(0)?,
        node_type: row.get(1)?,
        vector,
        content: row.get(3)?,
        properties,
        created_at: row.get(5)?,
    })
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphEdge> {
    let properties: HashMap<String, Value> = row
        .get::<_, String>(4)
        .map(|s| serde_json::from_str(&s).unwrap_or_default())?;
    Ok(GraphEdge {
        from_id: row.get(0)?,
        to_id: row.get(1)?,
        edge_type: row.get(2)?,
        weight: row.get::<_, f64>(3)? as f32,
        properties,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn store() -> std::sync::Arc<Store> {
        let mut config = StoreConfig::new(":memory:");
        config.rng_seed = Some(3);
        Store::open_in_memory(config).unwrap()
    }

    fn node_with_vec(id: &str, angle: f32) -> GraphNode {
        let mut n = GraphNode::new(id, "concept");
        n.vector = Some(vec![angle.cos(), angle.sin()]);
        n
    }

    #[test]
    fn test_node_roundtrip() {
        let store = store();
        let mut n = GraphNode::new("n1", "person");
        n.content = "Ada Lovelace".into();
        n.properties.insert("born".into(), Value::from(1815));
        store.upsert_node(n.clone()).unwrap();

        let got = store.get_node("n1").unwrap();
        assert_eq!(got.node_type, "person");
        assert_eq!(got.properties["born"], Value::from(1815));
        assert!(got.created_at > 0);
    }

    #[test]
    fn test_edge_requires_both_endpoints() {
        let store = store();
        store.upsert_node(GraphNode::new("a", "t")).unwrap();
        let err = store
            .upsert_edge(GraphEdge::new("a", "ghost", "knows", 1.0))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let store = store();
        store.upsert_node(GraphNode::new("a", "t")).unwrap();
        store.upsert_node(GraphNode::new("b", "t")).unwrap();
        assert!(store.upsert_edge(GraphEdge::new("a", "b", "knows", -1.0)).is_err());
        assert!(store.upsert_edge(GraphEdge::new("a", "b", "knows", f32::NAN)).is_err());
    }

    #[test]
    fn test_delete_node_cascades_edges() {
        let store = store();
        store.upsert_node(GraphNode::new("a", "t")).unwrap();
        store.upsert_node(GraphNode::new("b", "t")).unwrap();
        store.upsert_edge(GraphEdge::new("a", "b", "knows", 0.9)).unwrap();
        assert_eq!(store.list_edges("b", Direction::Both).unwrap().len(), 1);

        store.delete_node("a").unwrap();
        assert!(store.list_edges("b", Direction::Both).unwrap().is_empty());
        assert!(store.get_node("a").unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_edges_directions() {
        let store = store();
        for id in ["a", "b", "c"] {
            store.upsert_node(GraphNode::new(id, "t")).unwrap();
        }
        store.upsert_edge(GraphEdge::new("a", "b", "x", 1.0)).unwrap();
        store.upsert_edge(GraphEdge::new("c", "a", "y", 1.0)).unwrap();

        assert_eq!(store.list_edges("a", Direction::Out).unwrap().len(), 1);
        assert_eq!(store.list_edges("a", Direction::In).unwrap().len(), 1);
        assert_eq!(store.list_edges("a", Direction::Both).unwrap().len(), 2);
    }

    #[test]
    fn test_delete_edge() {
        let store = store();
        store.upsert_node(GraphNode::new("a", "t")).unwrap();
        store.upsert_node(GraphNode::new("b", "t")).unwrap();
        store.upsert_edge(GraphEdge::new("a", "b", "x", 1.0)).unwrap();
        store.delete_edge("a", "b", "x").unwrap();
        assert!(store.delete_edge("a", "b", "x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_graph_query_blends_channels() {
        let store = store();
        let cancel = CancelToken::new();
        // Establish the store dimension for query adaptation.
        store
            .upsert(crate::store::Record::new("seed", vec![1.0, 0.0]), &cancel)
            .unwrap();

        store.upsert_node(node_with_vec("close", 0.05)).unwrap();
        store.upsert_node(node_with_vec("far", 2.5)).unwrap();
        store.upsert_node(node_with_vec("hub", 1.2)).unwrap();
        store.upsert_edge(GraphEdge::new("close", "hub", "rel", 0.9)).unwrap();
        store.upsert_edge(GraphEdge::new("hub", "far", "rel", 0.5)).unwrap();

        let query = GraphQuery {
            q_vec: vec![1.0, 0.0],
            start_node: Some("close".into()),
            max_depth: 2,
            ..GraphQuery::default()
        };
        let hits = store.graph_query(&query, &cancel).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].node.id, "close");
        // Traversal scores decay with the product of weights.
        let hub = hits.iter().find(|h| h.node.id == "hub").unwrap();
        let far = hits.iter().find(|h| h.node.id == "far").unwrap();
        assert!(hub.graph_score > far.graph_score);
        for w in hits.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
    }

    #[test]
    fn test_graph_query_without_start_is_vector_only() {
        let store = store();
        let cancel = CancelToken::new();
        store
            .upsert(crate::store::Record::new("seed", vec![1.0, 0.0]), &cancel)
            .unwrap();
        store.upsert_node(node_with_vec("close", 0.1)).unwrap();
        store.upsert_node(node_with_vec("far", 2.0)).unwrap();

        let query = GraphQuery {
            q_vec: vec![1.0, 0.0],
            ..GraphQuery::default()
        };
        let hits = store.graph_query(&query, &cancel).unwrap();
        assert_eq!(hits[0].node.id, "close");
        assert!(hits.iter().all(|h| h.graph_score == 0.0));
    }
}
