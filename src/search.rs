//! # Query planner & hybrid search
//!
//! The read path. A query is routed to the active index when one can serve
//! it (matching dimension, non-empty), and otherwise falls back to
//! exhaustively scoring candidates fetched under SQL-level pushdown filters
//! (collection, doc id, ACL-tag overlap). Keyword hits come from the BM25
//! mirror. The two channels fuse by reciprocal-rank fusion — or, when the
//! caller sets a non-zero `text_weight` and the text scorer is enabled, by
//! the weighted blend `(1 − w)·vec_sim + w·text_sim`.
//!
//! Everything downstream of candidate generation is deterministic: scores
//! sort descending with ties broken by id, so a repeated query returns an
//! identical list.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::store::{AnyIndex, Record, SqlFilters, Store};
use crate::vector::validate_vector;

/// Options accepted by every search entry point.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Restrict to one named collection.
    pub collection: Option<String>,
    /// Result cap; 0 means unlimited (useful for range search).
    pub top_k: usize,
    /// Drop hits scoring below this (applied to the final fused score).
    pub threshold: f32,
    /// Equality filters over string metadata, applied in memory.
    pub filter: HashMap<String, String>,
    /// Visibility tags; a record with an ACL is returned only when at
    /// least one tag overlaps. Records without an ACL are always visible.
    pub acl_tags: Option<Vec<String>>,
    /// Pushdown filter on the parent document.
    pub doc_id: Option<String>,
    /// Weight of the text-similarity channel in the hybrid blend; `None`
    /// or 0 selects reciprocal-rank fusion instead.
    pub text_weight: Option<f32>,
    /// RRF constant; 60 per the original formulation.
    pub rrf_k: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            collection: None,
            top_k: 10,
            threshold: 0.0,
            filter: HashMap::new(),
            acl_tags: None,
            doc_id: None,
            text_weight: None,
            rrf_k: 60.0,
        }
    }
}

/// A scored search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: Record,
    pub score: f32,
}

impl Store {
    /// Vector-only search: route to the index (or exhaustive scan), apply
    /// filters, threshold, and top-k.
    pub fn search(
        &self,
        q_vec: &[f32],
        opts: &SearchOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchHit>> {
        const OP: &str = "search";
        self.check_open(OP)?;
        cancel.check(OP)?;
        self.run_query(OP, q_vec, None, opts, cancel)
    }

    /// Hybrid search: vector channel + BM25 keyword channel, fused by RRF
    /// or the weighted text blend (see [`SearchOptions::text_weight`]).
    pub fn hybrid_search(
        &self,
        q_vec: &[f32],
        q_text: &str,
        opts: &SearchOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchHit>> {
        const OP: &str = "hybrid_search";
        self.check_open(OP)?;
        cancel.check(OP)?;
        if q_vec.is_empty() && q_text.trim().is_empty() {
            return Err(Error::EmptyQuery { op: OP });
        }
        self.run_query(OP, q_vec, Some(q_text), opts, cancel)
    }

    /// Every record whose similarity is at least `1 − radius`, most
    /// similar first. `opts.top_k` of 0 returns them all.
    pub fn range_search(
        &self,
        q_vec: &[f32],
        radius: f32,
        opts: &SearchOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchHit>> {
        const OP: &str = "range_search";
        self.check_open(OP)?;
        cancel.check(OP)?;
        let mut opts = opts.clone();
        opts.threshold = opts.threshold.max(1.0 - radius);
        opts.text_weight = None;
        // Range semantics need exact coverage, so score exhaustively.
        let q = self.adapt_query(OP, q_vec, &opts)?;
        let filters = self.build_filters(OP, &opts)?;
        let candidates = self.load_candidates(OP, &filters)?;
        let scored = self.score_records(OP, &q, candidates, cancel)?;
        let mut hits: Vec<SearchHit> = scored
            .into_iter()
            .filter(|(record, _)| self.passes_memory_filters(record, &opts))
            .map(|(record, score)| SearchHit { record, score })
            .collect();
        finalize(&mut hits, &opts);
        Ok(hits)
    }

    fn run_query(
        &self,
        op: &'static str,
        q_vec: &[f32],
        q_text: Option<&str>,
        opts: &SearchOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchHit>> {
        if q_vec.is_empty() {
            return Err(Error::EmptyQuery { op });
        }
        validate_vector(op, q_vec)?;

        let q = self.adapt_query(op, q_vec, opts)?;
        let filters = self.build_filters(op, opts)?;
        let k_prime = (2 * opts.top_k).max(50);

        // Vector channel.
        let vec_channel = self.vector_candidates(op, &q, &filters, k_prime, cancel)?;

        // Keyword channel.
        let text = q_text.map(str::trim).filter(|t| !t.is_empty());
        let keyword_channel: Vec<(String, f32)> = match text {
            Some(t) => self.keyword_search(op, t, &filters, k_prime)?,
            None => Vec::new(),
        };
        cancel.check(op)?;

        // Assemble the candidate set: records from the vector channel plus
        // keyword-only hits fetched by id.
        let mut by_id: HashMap<String, (Record, Option<f32>)> = vec_channel
            .into_iter()
            .map(|(record, sim)| (record.id.clone(), (record, Some(sim))))
            .collect();
        let missing: Vec<String> = keyword_channel
            .iter()
            .filter(|(id, _)| !by_id.contains_key(id))
            .map(|(id, _)| id.clone())
            .collect();
        for record in self.fetch_by_ids(op, &missing)? {
            // Late score: keyword-only candidates still get a vector
            // similarity so blending and thresholds see both signals.
            let sim = (record.vector.len() == q.len())
                .then(|| self.config.similarity.score(op, &q, &record.vector))
                .transpose()?
                .unwrap_or(0.0);
            by_id.insert(record.id.clone(), (record, Some(sim)));
        }

        let use_blend = text.is_some()
            && self.matcher.is_some()
            && opts.text_weight.unwrap_or(self.default_text_weight()) > 0.0;

        let mut hits: Vec<SearchHit> = if let Some(t) = text {
            if use_blend {
                let w = opts
                    .text_weight
                    .unwrap_or(self.default_text_weight())
                    .clamp(0.0, 1.0);
                let matcher = self.matcher.as_ref().unwrap();
                by_id
                    .into_values()
                    .map(|(record, sim)| {
                        let text_sim = matcher.score(t, &record.content);
                        let score = (1.0 - w) * sim.unwrap_or(0.0) + w * text_sim;
                        SearchHit { record, score }
                    })
                    .collect()
            } else {
                rrf_fuse(by_id, &keyword_channel, opts.rrf_k)
            }
        } else {
            by_id
                .into_values()
                .map(|(record, sim)| SearchHit {
                    record,
                    score: sim.unwrap_or(0.0),
                })
                .collect()
        };

        // Non-pushdown filters run after fusion, on the assembled hits.
        hits.retain(|h| self.passes_memory_filters(&h.record, opts));
        finalize(&mut hits, opts);
        Ok(hits)
    }

    /// Adapt the query vector exactly the way the write path adapts
    /// records.
    fn adapt_query(
        &self,
        op: &'static str,
        q_vec: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<f32>> {
        let target = self.query_target_dim(op, opts)?;
        self.adapt_for_query(op, q_vec, target)
    }

    fn vector_candidates(
        &self,
        op: &'static str,
        q: &[f32],
        filters: &SqlFilters,
        k_prime: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<(Record, f32)>> {
        let cid = filters.collection_id.unwrap_or(crate::store::DEFAULT_COLLECTION);

        // Try the index first; fall through to the exhaustive scan when it
        // cannot serve this query.
        let keyed: Option<Vec<(u32, f32)>> = {
            let indexes = self.indexes.read();
            match indexes.get(&cid) {
                Some(AnyIndex::Hnsw(h)) if !h.is_empty() => {
                    Some(h.search(q, k_prime, self.config.hnsw.ef_search.max(k_prime))?)
                }
                Some(AnyIndex::Ivf(i)) if i.is_trained() && !i.is_empty() => {
                    Some(i.search(q, k_prime, self.config.ivf.n_probe)?)
                }
                _ => None,
            }
            // read guard drops here, before any connection use
        };

        match keyed {
            Some(pairs) => {
                let dists: HashMap<String, f32> = {
                    let keymap = self.keymap.read();
                    pairs
                        .iter()
                        .filter_map(|(key, d)| keymap.id_for(*key).map(|id| (id.to_string(), *d)))
                        .collect()
                };
                let ids: Vec<String> = dists.keys().cloned().collect();
                let records = self.fetch_by_ids(op, &ids)?;
                cancel.check(op)?;
                let metric = self.config.similarity;
                Ok(records
                    .into_iter()
                    .filter_map(|record| {
                        dists
                            .get(&record.id)
                            .map(|d| metric.distance_to_similarity(*d))
                            .map(|sim| (record, sim))
                    })
                    .collect())
            }
            None => {
                let candidates = self.load_candidates(op, filters)?;
                let mut scored = self.score_records(op, q, candidates, cancel)?;
                scored.sort_by(|a, b| {
                    b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id))
                });
                scored.truncate(k_prime);
                Ok(scored)
            }
        }
    }

    /// Exhaustively score records against `q` in cancellable batches.
    pub(crate) fn score_records(
        &self,
        op: &'static str,
        q: &[f32],
        candidates: Vec<Record>,
        cancel: &CancelToken,
    ) -> Result<Vec<(Record, f32)>> {
        let metric = self.config.similarity;
        let mut out = Vec::with_capacity(candidates.len());
        for batch in candidates.chunks(self.config.batch_size.max(1)) {
            cancel.check(op)?;
            let scored: Vec<(Record, f32)> = batch
                .par_iter()
                .filter(|record| record.vector.len() == q.len())
                .map(|record| (record.clone(), metric.distance_to_similarity(metric.distance(q, &record.vector))))
                .collect();
            out.extend(scored);
        }
        Ok(out)
    }

    /// Equality metadata filters and ACL-overlap visibility.
    pub(crate) fn passes_memory_filters(&self, record: &Record, opts: &SearchOptions) -> bool {
        for (k, v) in &opts.filter {
            if record.metadata.get(k) != Some(v) {
                return false;
            }
        }
        if let (Some(query_tags), Some(record_tags)) = (&opts.acl_tags, &record.acl) {
            if !record_tags.iter().any(|t| query_tags.contains(t)) {
                return false;
            }
        }
        true
    }

    pub(crate) fn build_filters(&self, op: &'static str, opts: &SearchOptions) -> Result<SqlFilters> {
        let collection_id = match &opts.collection {
            None => None,
            Some(name) => Some(self.collection_id(op, name)?.0),
        };
        Ok(SqlFilters {
            collection_id,
            doc_id: opts.doc_id.clone(),
            acl_tags: opts.acl_tags.clone(),
        })
    }

    pub(crate) fn query_target_dim(&self, op: &'static str, opts: &SearchOptions) -> Result<usize> {
        match &opts.collection {
            None => Ok(self.store_dims()),
            Some(name) => Ok(self.collection_id(op, name)?.1),
        }
    }

    fn default_text_weight(&self) -> f32 {
        self.config.text_similarity.default_weight
    }
}

/// Reciprocal-rank fusion of the vector and keyword channels.
///
/// Candidates are ranked 1..n within each channel (vector by similarity,
/// keyword by its BM25 order); each contributes `1 / (k + rank)` and the
/// contributions sum per id.
fn rrf_fuse(
    by_id: HashMap<String, (Record, Option<f32>)>,
    keyword_channel: &[(String, f32)],
    rrf_k: f32,
) -> Vec<SearchHit> {
    // Vector ranks: similarity descending, ties by id.
    let mut vec_ranked: Vec<(&String, f32)> = by_id
        .iter()
        .filter_map(|(id, (_, sim))| sim.map(|s| (id, s)))
        .collect();
    vec_ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut scores: HashMap<String, f32> = HashMap::new();
    for (rank, (id, _)) in vec_ranked.iter().enumerate() {
        *scores.entry((*id).clone()).or_insert(0.0) += 1.0 / (rrf_k + (rank + 1) as f32);
    }
    for (rank, (id, _)) in keyword_channel.iter().enumerate() {
        if by_id.contains_key(id) {
            *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (rrf_k + (rank + 1) as f32);
        }
    }

    by_id
        .into_values()
        .map(|(record, _)| {
            let score = scores.get(&record.id).copied().unwrap_or(0.0);
            SearchHit { record, score }
        })
        .collect()
}

/// Threshold, deterministic ordering, top-k trim.
fn finalize(hits: &mut Vec<SearchHit>, opts: &SearchOptions) {
    hits.retain(|h| h.score >= opts.threshold);
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    if opts.top_k > 0 {
        hits.truncate(opts.top_k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdaptPolicy, IndexType, StoreConfig};
    use crate::store::Record;

    fn store_with(mutate: impl FnOnce(&mut StoreConfig)) -> std::sync::Arc<Store> {
        let mut config = StoreConfig::new(":memory:");
        config.rng_seed = Some(7);
        mutate(&mut config);
        Store::open_in_memory(config).unwrap()
    }

    fn rec(id: &str, vector: Vec<f32>, content: &str) -> Record {
        let mut r = Record::new(id, vector);
        r.content = content.to_string();
        r
    }

    fn unit(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin()]
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let store = store_with(|_| {});
        let cancel = CancelToken::new();
        store.upsert(rec("near", unit(0.1), ""), &cancel).unwrap();
        store.upsert(rec("mid", unit(0.8), ""), &cancel).unwrap();
        store.upsert(rec("far", unit(2.5), ""), &cancel).unwrap();

        let hits = store
            .search(&unit(0.0), &SearchOptions::default(), &cancel)
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, ["near", "mid", "far"]);
    }

    #[test]
    fn test_empty_query_rejected() {
        let store = store_with(|_| {});
        let cancel = CancelToken::new();
        let err = store
            .search(&[], &SearchOptions::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::EmptyQuery { .. }));
    }

    #[test]
    fn test_search_on_empty_store_is_empty() {
        let store = store_with(|_| {});
        let cancel = CancelToken::new();
        // Dimension unknown yet; seed it with one record then delete.
        store.upsert(rec("a", unit(0.0), ""), &cancel).unwrap();
        store.delete("a").unwrap();
        let hits = store
            .search(&unit(0.0), &SearchOptions::default(), &cancel)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_hybrid_rrf_fuses_both_channels() {
        let store = store_with(|_| {});
        let cancel = CancelToken::new();
        store
            .upsert(rec("R1", unit(1.2), "apple orange banana"), &cancel)
            .unwrap();
        store
            .upsert(rec("R2", unit(0.05), "banana split"), &cancel)
            .unwrap();

        // Vector nearest R2, text matches only R1.
        let hits = store
            .hybrid_search(&unit(0.0), "apple", &SearchOptions::default(), &cancel)
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert!(ids.contains(&"R1") && ids.contains(&"R2"));

        // Expected RRF arithmetic: R2 is vector rank 1 (1/61), R1 is
        // vector rank 2 + text rank 1 (1/62 + 1/61).
        let score = |id: &str| hits.iter().find(|h| h.record.id == id).unwrap().score;
        assert!((score("R1") - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-6);
        assert!((score("R2") - 1.0 / 61.0).abs() < 1e-6);
        assert_eq!(ids[0], "R1");
    }

    #[test]
    fn test_rrf_single_channel_preserves_order() {
        let store = store_with(|_| {});
        let cancel = CancelToken::new();
        store.upsert(rec("a", unit(0.1), "nothing"), &cancel).unwrap();
        store.upsert(rec("b", unit(0.4), "nothing"), &cancel).unwrap();
        store.upsert(rec("c", unit(0.9), "nothing"), &cancel).unwrap();

        // Keyword channel returns nothing for this query, so the fused
        // order must equal the vector order.
        let hits = store
            .hybrid_search(&unit(0.0), "zzz", &SearchOptions::default(), &cancel)
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_acl_filtering() {
        let store = store_with(|_| {});
        let cancel = CancelToken::new();
        let mut secret = rec("R_secret", unit(0.0), "classified");
        secret.acl = Some(vec!["group:admin".into()]);
        store.upsert(secret, &cancel).unwrap();

        let mut opts = SearchOptions {
            acl_tags: Some(vec!["user:bob".into()]),
            ..SearchOptions::default()
        };
        let hits = store.search(&unit(0.0), &opts, &cancel).unwrap();
        assert!(hits.is_empty());

        opts.acl_tags = Some(vec!["group:admin".into()]);
        let hits = store.search(&unit(0.0), &opts, &cancel).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "R_secret");
    }

    #[test]
    fn test_metadata_filter_applied_in_memory() {
        let store = store_with(|_| {});
        let cancel = CancelToken::new();
        let mut a = rec("a", unit(0.0), "");
        a.metadata.insert("lang".into(), "en".into());
        let mut b = rec("b", unit(0.1), "");
        b.metadata.insert("lang".into(), "de".into());
        store.upsert(a, &cancel).unwrap();
        store.upsert(b, &cancel).unwrap();

        let opts = SearchOptions {
            filter: [("lang".to_string(), "de".to_string())].into(),
            ..SearchOptions::default()
        };
        let hits = store.search(&unit(0.0), &opts, &cancel).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "b");
    }

    #[test]
    fn test_threshold_and_top_k() {
        let store = store_with(|_| {});
        let cancel = CancelToken::new();
        for i in 0..10 {
            store
                .upsert(rec(&format!("r{i}"), unit(i as f32 * 0.2), ""), &cancel)
                .unwrap();
        }
        let opts = SearchOptions {
            top_k: 3,
            threshold: 0.5,
            ..SearchOptions::default()
        };
        let hits = store.search(&unit(0.0), &opts, &cancel).unwrap();
        assert!(hits.len() <= 3);
        assert!(hits.iter().all(|h| h.score >= 0.5));
    }

    #[test]
    fn test_weighted_blend_prefers_text_match() {
        let store = store_with(|c| {
            c.text_similarity.enabled = true;
            c.text_similarity.default_weight = 0.0;
        });
        let cancel = CancelToken::new();
        store
            .upsert(rec("vec_close", unit(0.01), "unrelated words"), &cancel)
            .unwrap();
        store
            .upsert(rec("text_close", unit(1.4), "exact phrase match"), &cancel)
            .unwrap();

        let opts = SearchOptions {
            text_weight: Some(0.9),
            ..SearchOptions::default()
        };
        let hits = store
            .hybrid_search(&unit(0.0), "exact phrase match", &opts, &cancel)
            .unwrap();
        assert_eq!(hits[0].record.id, "text_close");
    }

    #[test]
    fn test_range_search_honors_radius() {
        let store = store_with(|_| {});
        let cancel = CancelToken::new();
        store.upsert(rec("close", unit(0.05), ""), &cancel).unwrap();
        store.upsert(rec("distant", unit(2.0), ""), &cancel).unwrap();

        let opts = SearchOptions {
            top_k: 0,
            ..SearchOptions::default()
        };
        let hits = store
            .range_search(&unit(0.0), 0.1, &opts, &cancel)
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, ["close"]);
        assert!(hits[0].score >= 0.9);
    }

    #[test]
    fn test_results_stable_across_runs_with_ivf() {
        let run = || {
            let store = store_with(|c| {
                c.index = IndexType::Ivf;
                c.ivf.n_centroids = 4;
                c.ivf.n_probe = 4;
            });
            let cancel = CancelToken::new();
            let records: Vec<Record> = (0..200)
                .map(|i| rec(&format!("r{i:03}"), unit(i as f32 * 0.031), ""))
                .collect();
            store.upsert_batch(records, &cancel).unwrap();
            store
                .search(&unit(0.0), &SearchOptions::default(), &cancel)
                .unwrap()
                .into_iter()
                .map(|h| h.record.id)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_strict_policy_rejects_mismatched_query() {
        let store = store_with(|c| c.adapt_policy = AdaptPolicy::Strict);
        let cancel = CancelToken::new();
        store.upsert(rec("a", vec![1.0, 0.0, 0.0], ""), &cancel).unwrap();
        let err = store
            .search(&[1.0, 0.0], &SearchOptions::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDimension { .. }));
    }

    #[test]
    fn test_unknown_collection_is_not_found() {
        let store = store_with(|_| {});
        let cancel = CancelToken::new();
        store.upsert(rec("a", unit(0.0), ""), &cancel).unwrap();
        let opts = SearchOptions {
            collection: Some("ghost".into()),
            ..SearchOptions::default()
        };
        let err = store.search(&unit(0.0), &opts, &cancel).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_cancellation_stops_scan() {
        let store = store_with(|c| c.batch_size = 1);
        let cancel = CancelToken::new();
        for i in 0..20 {
            store
                .upsert(rec(&format!("r{i}"), unit(i as f32 * 0.1), ""), &cancel)
                .unwrap();
        }
        cancel.cancel();
        let err = store
            .search(&unit(0.0), &SearchOptions::default(), &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
