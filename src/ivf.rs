//! # IVF index
//!
//! A trainable inverted-file index: k-means centroids partition the vector
//! space, each centroid owns an inverted list of record keys, and a query
//! probes only the `n_probe` nearest lists. Before training the index has no
//! partitions and falls back to exhaustively scoring everything it holds.
//!
//! Training runs k-means++ seeding followed by Lloyd iterations on a
//! uniformly sampled subset (all vectors when the population is under the
//! sample cap), stopping when the largest centroid movement drops below a
//! small epsilon or after a fixed iteration budget. Afterwards every known
//! vector is assigned to its nearest centroid.
//!
//! Inserts after training are appended to their centroid's list; once the
//! post-training insert count outgrows a configured fraction of the trained
//! population, the index reports retrain pressure. Retraining is never
//! implicit — the event is advisory and `train` must be called again.

use std::collections::HashMap;

use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rayon::prelude::*;

use crate::config::{IvfConfig, QuantizationConfig, SimilarityMetric};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::vector::QuantizedVector;

/// Lloyd iteration stops once the largest centroid shift is below this.
const KMEANS_EPSILON: f32 = 1e-4;
const KMEANS_MAX_ITERS: usize = 50;

enum Stored {
    Exact(Vec<f32>),
    Quantized(QuantizedVector),
}

impl Stored {
    fn materialize(&self) -> Vec<f32> {
        match self {
            Stored::Exact(v) => v.clone(),
            Stored::Quantized(q) => q.dequantize(),
        }
    }
}

pub(crate) struct IvfIndex {
    config: IvfConfig,
    metric: SimilarityMetric,
    quantization: Option<QuantizationConfig>,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<u32>>,
    vectors: HashMap<u32, Stored>,
    assignments: HashMap<u32, usize>,
    /// Keys awaiting assignment (only grows while untrained).
    pending: Vec<u32>,
    /// Inserts since the last training pass, against the population trained
    /// over. Drives the retrain-recommended event.
    since_train: usize,
    trained_population: usize,
}

impl IvfIndex {
    pub(crate) fn new(
        config: &IvfConfig,
        metric: SimilarityMetric,
        quantization: Option<QuantizationConfig>,
    ) -> Self {
        Self {
            config: config.clone(),
            metric,
            quantization,
            centroids: Vec::new(),
            lists: Vec::new(),
            vectors: HashMap::new(),
            assignments: HashMap::new(),
            pending: Vec::new(),
            since_train: 0,
            trained_population: 0,
        }
    }

    pub(crate) fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Dimension of the indexed vectors; `None` while empty.
    pub(crate) fn dim(&self) -> Option<usize> {
        self.vectors.values().next().map(|s| s.materialize().len())
    }

    fn store_form(&self, v: Vec<f32>) -> Stored {
        match &self.quantization {
            Some(q) if q.enabled => Stored::Quantized(QuantizedVector::quantize(q, &v)),
            _ => Stored::Exact(v),
        }
    }

    fn nearest_centroid(&self, v: &[f32]) -> usize {
        let mut best = 0usize;
        let mut best_d = f32::INFINITY;
        for (i, c) in self.centroids.iter().enumerate() {
            let d = self.metric.distance(v, c);
            if d < best_d {
                best_d = d;
                best = i;
            }
        }
        best
    }

    /// Add a vector. Untrained: buffered for the next training pass.
    /// Trained: assigned immediately; may return a retrain-pressure event.
    pub(crate) fn add(&mut self, key: u32, v: Vec<f32>) -> Option<Event> {
        assert!(
            !self.vectors.contains_key(&key),
            "ivf key {key} inserted twice: key map bijection violated"
        );
        if !self.is_trained() {
            self.vectors.insert(key, self.store_form(v));
            self.pending.push(key);
            return None;
        }

        let list = self.nearest_centroid(&v);
        self.vectors.insert(key, self.store_form(v));
        self.lists[list].push(key);
        self.assignments.insert(key, list);
        self.since_train += 1;

        let threshold =
            (self.trained_population as f32 * self.config.retrain_pending_ratio).ceil() as usize;
        if self.trained_population > 0 && self.since_train == threshold.max(1) {
            return Some(Event::IvfRetrainRecommended {
                pending: self.since_train,
                assigned: self.trained_population,
            });
        }
        None
    }

    pub(crate) fn remove(&mut self, key: u32) -> bool {
        if self.vectors.remove(&key).is_none() {
            return false;
        }
        if let Some(list) = self.assignments.remove(&key) {
            self.lists[list].retain(|k| *k != key);
        } else {
            self.pending.retain(|k| *k != key);
        }
        true
    }

    /// Train `n_centroids` (capped at the population) and assign every
    /// known vector. A no-op on an empty index.
    pub(crate) fn train(&mut self, n_centroids: usize, rng: &mut StdRng) {
        if self.vectors.is_empty() {
            return;
        }

        // Deterministic sample order: sort keys first.
        let mut keys: Vec<u32> = self.vectors.keys().copied().collect();
        keys.sort_unstable();

        let cap = self.config.training_sample_cap;
        let sampled: Vec<Vec<f32>> = if keys.len() <= cap {
            keys.iter().map(|k| self.vectors[k].materialize()).collect()
        } else {
            sample(rng, keys.len(), cap)
                .into_iter()
                .map(|i| self.vectors[&keys[i]].materialize())
                .collect()
        };

        let k = n_centroids.min(sampled.len());
        self.centroids = self.kmeans(&sampled, k, rng);
        self.lists = vec![Vec::new(); self.centroids.len()];
        self.assignments.clear();
        self.pending.clear();

        for key in keys {
            let v = self.vectors[&key].materialize();
            let list = self.nearest_centroid(&v);
            self.lists[list].push(key);
            self.assignments.insert(key, list);
        }
        self.since_train = 0;
        self.trained_population = self.vectors.len();
        tracing::info!(
            centroids = self.centroids.len(),
            population = self.trained_population,
            "ivf index trained"
        );
    }

    /// k-means++ seeding then Lloyd iterations over the sample.
    fn kmeans(&self, samples: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
        let dim = samples[0].len();
        let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
        centroids.push(samples[rng.gen_range(0..samples.len())].clone());

        // k-means++: pick each next seed with probability proportional to
        // squared distance from the nearest existing seed.
        let mut d2: Vec<f32> = samples
            .iter()
            .map(|s| {
                let d = self.metric.distance(s, &centroids[0]);
                d * d
            })
            .collect();
        while centroids.len() < k {
            let total: f32 = d2.iter().sum();
            let next = if total <= 0.0 {
                rng.gen_range(0..samples.len())
            } else {
                let mut target = rng.gen_range(0.0..total);
                let mut chosen = samples.len() - 1;
                for (i, w) in d2.iter().enumerate() {
                    if target < *w {
                        chosen = i;
                        break;
                    }
                    target -= w;
                }
                chosen
            };
            let seed = samples[next].clone();
            for (s, d) in samples.iter().zip(d2.iter_mut()) {
                let nd = self.metric.distance(s, &seed);
                *d = d.min(nd * nd);
            }
            centroids.push(seed);
        }

        for _ in 0..KMEANS_MAX_ITERS {
            // Assign.
            let metric = self.metric;
            let cref = &centroids;
            let assignment: Vec<usize> = samples
                .par_iter()
                .map(|s| {
                    let mut best = 0usize;
                    let mut best_d = f32::INFINITY;
                    for (i, c) in cref.iter().enumerate() {
                        let d = metric.distance(s, c);
                        if d < best_d {
                            best_d = d;
                            best = i;
                        }
                    }
                    best
                })
                .collect();

            // Recompute means.
            let mut sums = vec![vec![0.0f32; dim]; centroids.len()];
            let mut counts = vec![0usize; centroids.len()];
            for (s, &a) in samples.iter().zip(&assignment) {
                counts[a] += 1;
                for (acc, x) in sums[a].iter_mut().zip(s) {
                    *acc += x;
                }
            }

            let mut movement = 0.0f32;
            for (i, sum) in sums.into_iter().enumerate() {
                if counts[i] == 0 {
                    continue; // empty cluster keeps its old centroid
                }
                let mean: Vec<f32> = sum.into_iter().map(|x| x / counts[i] as f32).collect();
                let shift = crate::vector::euclidean_distance("train", &centroids[i], &mean)
                    .unwrap_or(f32::INFINITY);
                movement = movement.max(shift);
                centroids[i] = mean;
            }
            if movement < KMEANS_EPSILON {
                break;
            }
        }
        centroids
    }

    /// Probe the `n_probe` nearest centroid lists and exhaustively score
    /// their union. Untrained indexes score everything they hold. Returns
    /// `(key, distance)` ascending, ties by key.
    pub(crate) fn search(&self, q: &[f32], k: usize, n_probe: usize) -> Result<Vec<(u32, f32)>> {
        if self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        let dim = self
            .vectors
            .values()
            .next()
            .map(|s| s.materialize().len())
            .unwrap_or(0);
        if q.len() != dim {
            return Err(Error::dimension("ivf_search", dim, q.len()));
        }

        let candidate_keys: Vec<u32> = if self.is_trained() {
            let mut ranked: Vec<(usize, f32)> = self
                .centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (i, self.metric.distance(q, c)))
                .collect();
            ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            ranked
                .iter()
                .take(n_probe.max(1))
                .flat_map(|(i, _)| self.lists[*i].iter().copied())
                .collect()
        } else {
            let mut keys: Vec<u32> = self.vectors.keys().copied().collect();
            keys.sort_unstable();
            keys
        };

        let metric = self.metric;
        let mut scored: Vec<(u32, f32)> = candidate_keys
            .par_iter()
            .map(|key| {
                let v = self.vectors[key].materialize();
                (*key, metric.distance(q, &v))
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn config() -> IvfConfig {
        IvfConfig {
            n_centroids: 4,
            n_probe: 2,
            training_sample_cap: 10_000,
            retrain_pending_ratio: 0.25,
        }
    }

    fn index() -> IvfIndex {
        IvfIndex::new(&config(), SimilarityMetric::Euclidean, None)
    }

    /// Four well-separated clusters on the axes of a 4-d space.
    fn clustered_vec(cluster: usize, jitter: u64) -> Vec<f32> {
        let mut v = vec![0.0f32; 4];
        v[cluster] = 10.0;
        v[(cluster + 1) % 4] = (jitter as f32 * 0.13).sin() * 0.2;
        v
    }

    #[test]
    fn test_untrained_search_scans_everything() {
        let mut idx = index();
        for key in 0..20u32 {
            idx.add(key, clustered_vec((key % 4) as usize, key as u64));
        }
        assert!(!idx.is_trained());
        let hits = idx.search(&clustered_vec(2, 999), 5, 2).unwrap();
        assert_eq!(hits.len(), 5);
        assert!(hits.iter().all(|(k, _)| k % 4 == 2));
    }

    #[test]
    fn test_train_assigns_all_and_probes_lists() {
        let mut idx = index();
        for key in 0..80u32 {
            idx.add(key, clustered_vec((key % 4) as usize, key as u64));
        }
        let mut rng = StdRng::seed_from_u64(11);
        idx.train(4, &mut rng);
        assert!(idx.is_trained());
        assert_eq!(idx.assignments.len(), 80);
        assert_eq!(idx.lists.iter().map(Vec::len).sum::<usize>(), 80);

        let hits = idx.search(&clustered_vec(1, 5), 10, 1).unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|(k, _)| k % 4 == 1));
    }

    #[test]
    fn test_add_after_training_appends_to_list() {
        let mut idx = index();
        for key in 0..40u32 {
            idx.add(key, clustered_vec((key % 4) as usize, key as u64));
        }
        let mut rng = StdRng::seed_from_u64(12);
        idx.train(4, &mut rng);

        idx.add(1000, clustered_vec(3, 7));
        let hits = idx.search(&clustered_vec(3, 8), 40, 1).unwrap();
        assert!(hits.iter().any(|(k, _)| *k == 1000));
    }

    #[test]
    fn test_retrain_recommended_under_insert_pressure() {
        let mut idx = index();
        for key in 0..40u32 {
            idx.add(key, clustered_vec((key % 4) as usize, key as u64));
        }
        let mut rng = StdRng::seed_from_u64(13);
        idx.train(4, &mut rng);

        let mut recommended = false;
        for key in 100..120u32 {
            if let Some(Event::IvfRetrainRecommended { .. }) =
                idx.add(key, clustered_vec(0, key as u64))
            {
                recommended = true;
            }
        }
        assert!(recommended, "insert pressure never recommended a retrain");
    }

    #[test]
    fn test_training_is_deterministic_with_seed() {
        let build = || {
            let mut idx = index();
            for key in 0..60u32 {
                idx.add(key, clustered_vec((key % 4) as usize, key as u64));
            }
            let mut rng = StdRng::seed_from_u64(21);
            idx.train(4, &mut rng);
            idx.search(&clustered_vec(0, 3), 10, 2).unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_remove_drops_from_lists() {
        let mut idx = index();
        for key in 0..20u32 {
            idx.add(key, clustered_vec((key % 4) as usize, key as u64));
        }
        let mut rng = StdRng::seed_from_u64(14);
        idx.train(4, &mut rng);
        assert!(idx.remove(8));
        assert!(!idx.remove(8));
        let hits = idx.search(&clustered_vec(0, 1), 20, 4).unwrap();
        assert!(hits.iter().all(|(k, _)| *k != 8));
    }

    #[test]
    fn test_quantized_lists_still_find_clusters() {
        let q = QuantizationConfig {
            enabled: true,
            ..QuantizationConfig::default()
        };
        let mut idx = IvfIndex::new(&config(), SimilarityMetric::Euclidean, Some(q));
        for key in 0..40u32 {
            idx.add(key, clustered_vec((key % 4) as usize, key as u64));
        }
        let mut rng = StdRng::seed_from_u64(15);
        idx.train(4, &mut rng);
        let hits = idx.search(&clustered_vec(2, 50), 5, 1).unwrap();
        assert!(hits.iter().all(|(k, _)| k % 4 == 2));
    }

    #[test]
    fn test_query_dimension_checked() {
        let mut idx = index();
        idx.add(0, vec![1.0, 0.0, 0.0, 0.0]);
        assert!(idx.search(&[1.0, 0.0], 1, 1).is_err());
    }
}
