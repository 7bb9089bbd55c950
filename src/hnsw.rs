//! # HNSW index
//!
//! An in-memory Hierarchical Navigable Small World graph providing
//! approximate nearest-neighbor search over the record table.
//!
//! ## Structure
//!
//! ```text
//! layer 2:        e ───────────────── n
//!                 │                   │
//! layer 1:        e ──── a ───── b ── n
//!                 │      │       │    │
//! layer 0:   c ── e ─ a ─┴─ d ── b ── n ── f     (2·M neighbors max)
//! ```
//!
//! Each node holds its vector and one adjacency list per layer it appears
//! on. Lists are bounded by `M` (and `2·M` at the base layer); a new node's
//! top layer is drawn from the exponential distribution
//! `⌊−ln(U(0,1))·mL⌋` with `mL = 1/ln(M)`, so upper layers thin out
//! geometrically and the entry point sits at the top.
//!
//! ## Durability
//!
//! The graph itself is never persisted. The store keeps a durable
//! key↔record-id bijection (the `hnsw_keymap` table) and replays inserts
//! from the record table on open; deletes are tombstones in the key map so
//! adjacency never gets rewired under concurrent readers.
//!
//! Keys are assigned by the store. Inserting a key that is already present
//! is a bijection violation and panics — that is a programmer error, not a
//! runtime condition.
//!
//! Determinism: layer draws come from a seeded rng handed in by the store,
//! and every ordering ties off by key, so a fixed seed and insert order
//! reproduce the same graph and the same search results.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::Rng;
use rand::rngs::StdRng;

use crate::config::{HnswConfig, SimilarityMetric};
use crate::error::{Error, Result};

/// Hard cap on the layer draw; ⌊−ln(U)·mL⌋ virtually never reaches it.
const MAX_LAYER: usize = 32;

/// (distance, key) with total ordering: by distance, ties by key.
#[derive(Debug, Clone, Copy, PartialEq)]
struct DistKey {
    dist: f32,
    key: u32,
}

impl Eq for DistKey {}

impl Ord for DistKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for DistKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Node {
    vector: Vec<f32>,
    /// Adjacency per layer, index 0 = base. Length = node's top layer + 1.
    layers: Vec<Vec<u32>>,
}

/// The in-memory graph. Writers take the store's write lock; searches run
/// under read locks and never mutate.
pub(crate) struct HnswIndex {
    m: usize,
    m0: usize,
    ef_construction: usize,
    ml: f64,
    metric: SimilarityMetric,
    nodes: HashMap<u32, Node>,
    entry: Option<u32>,
    top_layer: usize,
    tombstones: HashSet<u32>,
}

impl HnswIndex {
    pub(crate) fn new(config: &HnswConfig, metric: SimilarityMetric) -> Self {
        Self {
            m: config.m,
            m0: config.m * 2,
            ef_construction: config.ef_construction,
            ml: 1.0 / (config.m as f64).ln(),
            metric,
            nodes: HashMap::new(),
            entry: None,
            top_layer: 0,
            tombstones: HashSet::new(),
        }
    }

    /// Active (non-tombstoned) node count.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len() - self.tombstones.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dimension of the indexed vectors; `None` while empty.
    pub(crate) fn dim(&self) -> Option<usize> {
        self.entry.map(|e| self.nodes[&e].vector.len())
    }

    fn max_neighbors(&self, layer: usize) -> usize {
        if layer == 0 { self.m0 } else { self.m }
    }

    fn dist(&self, a: &[f32], b: &[f32]) -> f32 {
        self.metric.distance(a, b)
    }

    /// Insert a vector under a fresh key. Returns `true` when the node was
    /// promoted to be the new entry point.
    ///
    /// # Panics
    /// If `key` is already present — the store's key map guarantees
    /// bijectivity, so a duplicate key means the invariant broke upstream.
    pub(crate) fn insert(&mut self, key: u32, vector: Vec<f32>, rng: &mut StdRng) -> bool {
        assert!(
            !self.nodes.contains_key(&key),
            "hnsw key {key} inserted twice: key map bijection violated"
        );

        let level = self.draw_level(rng);
        let node = Node {
            vector,
            layers: vec![Vec::new(); level + 1],
        };

        let Some(entry) = self.entry else {
            // First node: it is the entire graph.
            self.nodes.insert(key, node);
            self.entry = Some(key);
            self.top_layer = level;
            return true;
        };

        let q = node.vector.clone();
        self.nodes.insert(key, node);

        // Greedy descent through layers above the new node's level.
        let mut ep = entry;
        let mut layer = self.top_layer;
        while layer > level {
            ep = self.greedy_closest(&q, ep, layer);
            layer -= 1;
        }

        // Connect on every layer from min(level, top) down to 0.
        let mut eps = vec![ep];
        for lc in (0..=level.min(self.top_layer)).rev() {
            let candidates = self.search_layer(&q, &eps, self.ef_construction, lc);
            let max_n = self.max_neighbors(lc);
            let selected = self.select_neighbors(&candidates, self.m);

            for &DistKey { key: nkey, .. } in &selected {
                self.nodes.get_mut(&key).unwrap().layers[lc].push(nkey);
                let neighbor = self.nodes.get_mut(&nkey).unwrap();
                if lc < neighbor.layers.len() {
                    neighbor.layers[lc].push(key);
                    if neighbor.layers[lc].len() > max_n {
                        self.prune_neighbors(nkey, lc);
                    }
                }
            }

            eps = candidates.iter().map(|c| c.key).collect();
            if eps.is_empty() {
                eps = vec![ep];
            }
        }

        if level > self.top_layer {
            self.entry = Some(key);
            self.top_layer = level;
            return true;
        }
        false
    }

    fn draw_level(&self, rng: &mut StdRng) -> usize {
        let u: f64 = rng.gen_range(f64::EPSILON..1.0);
        ((-u.ln() * self.ml).floor() as usize).min(MAX_LAYER)
    }

    /// Single-step greedy walk at `layer`: keep moving to the closest
    /// neighbor until no neighbor improves on the current position.
    fn greedy_closest(&self, q: &[f32], start: u32, layer: usize) -> u32 {
        let mut current = start;
        let mut current_dist = self.dist(q, &self.nodes[&current].vector);
        loop {
            let mut improved = false;
            let neighbors = self.nodes[&current]
                .layers
                .get(layer)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            for &n in neighbors {
                let d = self.dist(q, &self.nodes[&n].vector);
                if d < current_dist || (d == current_dist && n < current) {
                    current = n;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Best-first search at one layer with a candidate list bounded by
    /// `ef`. Returns up to `ef` closest nodes, ascending by distance.
    /// Tombstoned nodes participate in traversal (their edges still route)
    /// and are filtered by [`search`](Self::search) at the end.
    fn search_layer(&self, q: &[f32], entry_points: &[u32], ef: usize, layer: usize) -> Vec<DistKey> {
        let mut visited: HashSet<u32> = HashSet::with_capacity(ef * 4);
        // Min-heap of frontier candidates, max-heap of current best.
        let mut frontier: BinaryHeap<std::cmp::Reverse<DistKey>> = BinaryHeap::new();
        let mut best: BinaryHeap<DistKey> = BinaryHeap::new();

        for &ep in entry_points {
            if !visited.insert(ep) {
                continue;
            }
            let d = DistKey {
                dist: self.dist(q, &self.nodes[&ep].vector),
                key: ep,
            };
            frontier.push(std::cmp::Reverse(d));
            best.push(d);
        }

        while let Some(std::cmp::Reverse(candidate)) = frontier.pop() {
            let worst = best.peek().copied();
            if best.len() >= ef {
                if let Some(w) = worst {
                    if candidate.dist > w.dist {
                        break;
                    }
                }
            }
            let neighbors = self.nodes[&candidate.key]
                .layers
                .get(layer)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            for &n in neighbors {
                if !visited.insert(n) {
                    continue;
                }
                let d = DistKey {
                    dist: self.dist(q, &self.nodes[&n].vector),
                    key: n,
                };
                if best.len() < ef || d < *best.peek().unwrap() {
                    frontier.push(std::cmp::Reverse(d));
                    best.push(d);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        let mut out = best.into_vec();
        out.sort();
        out
    }

    /// Distance-based diversity heuristic: walking candidates closest
    /// first, keep one only if it is closer to the query than to every
    /// neighbor already kept (each `DistKey` carries its distance to the
    /// query). Rejected candidates backfill when fewer than `m` survive.
    fn select_neighbors(&self, candidates: &[DistKey], m: usize) -> Vec<DistKey> {
        let mut selected: Vec<DistKey> = Vec::with_capacity(m);
        let mut rejected: Vec<DistKey> = Vec::new();

        for &c in candidates {
            if selected.len() >= m {
                break;
            }
            let cv = &self.nodes[&c.key].vector;
            let diverse = selected.iter().all(|s| {
                let sv = &self.nodes[&s.key].vector;
                c.dist < self.dist(cv, sv)
            });
            if diverse {
                selected.push(c);
            } else {
                rejected.push(c);
            }
        }

        for r in rejected {
            if selected.len() >= m {
                break;
            }
            selected.push(r);
        }
        selected
    }

    /// Re-run neighbor selection for `key` at `layer` after its list grew
    /// past the bound.
    fn prune_neighbors(&mut self, key: u32, layer: usize) {
        let max_n = self.max_neighbors(layer);
        let base = self.nodes[&key].vector.clone();
        let mut candidates: Vec<DistKey> = self.nodes[&key].layers[layer]
            .iter()
            .map(|&n| DistKey {
                dist: self.dist(&base, &self.nodes[&n].vector),
                key: n,
            })
            .collect();
        candidates.sort();
        candidates.dedup_by_key(|c| c.key);
        let kept = self.select_neighbors(&candidates, max_n);
        self.nodes.get_mut(&key).unwrap().layers[layer] = kept.into_iter().map(|c| c.key).collect();
    }

    /// Logical delete: the node stays in the graph but queries skip it.
    /// Returns `false` when the key is unknown or already tombstoned.
    pub(crate) fn tombstone(&mut self, key: u32) -> bool {
        if !self.nodes.contains_key(&key) {
            return false;
        }
        self.tombstones.insert(key)
    }

    /// k-nearest search with a candidate list of size `ef` (raised to `k`
    /// when smaller). Returns `(key, distance)` ascending; ties break by
    /// key. An empty index yields an empty list.
    ///
    /// # Errors
    /// `InvalidDimension` when the query disagrees with the indexed
    /// vectors — adaptation belongs to the caller.
    pub(crate) fn search(&self, q: &[f32], k: usize, ef: usize) -> Result<Vec<(u32, f32)>> {
        let Some(entry) = self.entry else {
            return Ok(Vec::new());
        };
        let dim = self.nodes[&entry].vector.len();
        if q.len() != dim {
            return Err(Error::dimension("hnsw_search", dim, q.len()));
        }

        let mut ep = entry;
        for layer in (1..=self.top_layer).rev() {
            ep = self.greedy_closest(q, ep, layer);
        }

        // Over-fetch so tombstoned hits can be dropped without starving k.
        let ef_eff = ef.max(k) + self.tombstones.len().min(ef.max(k));
        let found = self.search_layer(q, &[ep], ef_eff, 0);
        Ok(found
            .into_iter()
            .filter(|c| !self.tombstones.contains(&c.key))
            .take(k)
            .map(|c| (c.key, c.dist))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn index() -> HnswIndex {
        HnswIndex::new(
            &HnswConfig {
                m: 8,
                ef_construction: 64,
                ef_search: 32,
            },
            SimilarityMetric::Cosine,
        )
    }

    fn deterministic_vec(seed: u64, dim: usize) -> Vec<f32> {
        (0..dim)
            .map(|i| ((seed as f32) * 0.17 + i as f32 * 0.31).sin())
            .collect()
    }

    #[test]
    fn test_empty_index_returns_empty() {
        let idx = index();
        assert!(idx.search(&[1.0, 0.0], 5, 16).unwrap().is_empty());
        assert!(idx.is_empty());
    }

    #[test]
    fn test_first_insert_becomes_entry() {
        let mut idx = index();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(idx.insert(0, vec![1.0, 0.0], &mut rng));
        assert_eq!(idx.entry, Some(0));
    }

    #[test]
    fn test_search_finds_exact_match_first() {
        let mut idx = index();
        let mut rng = StdRng::seed_from_u64(2);
        for key in 0..100u32 {
            idx.insert(key, deterministic_vec(key as u64, 16), &mut rng);
        }
        let q = deterministic_vec(42, 16);
        let hits = idx.search(&q, 5, 32).unwrap();
        assert_eq!(hits[0].0, 42);
        assert!(hits[0].1.abs() < 1e-5);
        for w in hits.windows(2) {
            assert!(w[0].1 <= w[1].1, "results not ascending by distance");
        }
    }

    #[test]
    fn test_search_is_deterministic_under_fixed_seed() {
        let build = || {
            let mut idx = index();
            let mut rng = StdRng::seed_from_u64(99);
            for key in 0..1000u32 {
                idx.insert(key, deterministic_vec(key as u64, 32), &mut rng);
            }
            idx
        };
        let a = build();
        let b = build();
        let q = deterministic_vec(777, 32);
        let ha = a.search(&q, 10, 50).unwrap();
        let hb = b.search(&q, 10, 50).unwrap();
        assert_eq!(ha, hb);
        // Repeat queries against the same graph are stable too.
        assert_eq!(ha, a.search(&q, 10, 50).unwrap());
    }

    #[test]
    fn test_tombstoned_key_skipped_by_search() {
        let mut idx = index();
        let mut rng = StdRng::seed_from_u64(3);
        for key in 0..50u32 {
            idx.insert(key, deterministic_vec(key as u64, 8), &mut rng);
        }
        let q = deterministic_vec(7, 8);
        assert_eq!(idx.search(&q, 1, 16).unwrap()[0].0, 7);

        assert!(idx.tombstone(7));
        assert!(!idx.tombstone(7)); // idempotent signal
        let hits = idx.search(&q, 10, 16).unwrap();
        assert!(hits.iter().all(|(k, _)| *k != 7));
        assert_eq!(idx.len(), 49);
    }

    #[test]
    fn test_base_layer_respects_2m_bound() {
        let mut idx = index();
        let mut rng = StdRng::seed_from_u64(4);
        for key in 0..300u32 {
            idx.insert(key, deterministic_vec(key as u64, 8), &mut rng);
        }
        for node in idx.nodes.values() {
            assert!(node.layers[0].len() <= idx.m0);
            for layer in &node.layers[1..] {
                assert!(layer.len() <= idx.m);
            }
        }
    }

    #[test]
    #[should_panic(expected = "bijection")]
    fn test_duplicate_key_panics() {
        let mut idx = index();
        let mut rng = StdRng::seed_from_u64(5);
        idx.insert(1, vec![0.0, 1.0], &mut rng);
        idx.insert(1, vec![1.0, 0.0], &mut rng);
    }

    #[test]
    fn test_dimension_mismatch_rejected_at_query() {
        let mut idx = index();
        let mut rng = StdRng::seed_from_u64(6);
        idx.insert(0, vec![1.0, 0.0, 0.0], &mut rng);
        assert!(idx.search(&[1.0, 0.0], 1, 8).is_err());
    }

    #[test]
    fn test_recall_against_exhaustive_scan() {
        let mut idx = index();
        let mut rng = StdRng::seed_from_u64(8);
        let dim = 24;
        let vectors: Vec<Vec<f32>> = (0..500).map(|i| deterministic_vec(i, dim)).collect();
        for (key, v) in vectors.iter().enumerate() {
            idx.insert(key as u32, v.clone(), &mut rng);
        }
        let q = deterministic_vec(10_000, dim);

        let mut exact: Vec<(u32, f32)> = vectors
            .iter()
            .enumerate()
            .map(|(k, v)| (k as u32, SimilarityMetric::Cosine.distance(&q, v)))
            .collect();
        exact.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        let exact_top: HashSet<u32> = exact.iter().take(10).map(|(k, _)| *k).collect();

        let approx = idx.search(&q, 10, 100).unwrap();
        let hit = approx.iter().filter(|(k, _)| exact_top.contains(k)).count();
        assert!(hit >= 8, "recall too low: {hit}/10");
    }
}
