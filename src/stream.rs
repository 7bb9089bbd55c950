//! # Streaming & range search
//!
//! Lazy, batched search: candidates are snapshotted up front (one read of
//! the record table under the pushdown filters) and scored `batch_size` at
//! a time as the caller pulls. Between batches the stream checks its
//! cancellation token, reports progress, and — when early termination is
//! on — stops as soon as a batch's best score falls below the quality
//! threshold while the accumulated top-k is stable.
//!
//! [`Store::parallel_stream_search`] shares one snapshot across several
//! query vectors; [`merge_stream_results`] fair-interleaves streams;
//! [`collect_top_k`] drains a stream into the k best hits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::cancel::CancelToken;
use crate::config::SimilarityMetric;
use crate::error::Result;
use crate::search::SearchOptions;
use crate::store::Store;

/// Progress callback: `(candidates processed, total candidates)`.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Options for [`Store::stream_search`].
#[derive(Clone, Default)]
pub struct StreamOptions {
    /// Filters, collection, and top-k tracking for early termination.
    pub search: SearchOptions,
    /// Candidates scored per pull; 0 uses the store's configured batch
    /// size.
    pub batch_size: usize,
    /// Soft wall-clock budget; the stream ends (cleanly) at the first
    /// batch boundary past it.
    pub max_latency: Option<Duration>,
    /// Stop once a batch's best score drops under `quality_threshold`
    /// while the accumulated top-k is stable.
    pub early_terminate: bool,
    pub quality_threshold: f32,
    pub progress: Option<ProgressFn>,
}

/// One scored hit, tagged with the (monotonically increasing) batch that
/// produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHit {
    pub id: String,
    pub score: f32,
    pub batch: usize,
}

/// Immutable candidate snapshot shared by parallel streams.
struct Snapshot {
    candidates: Vec<(String, Vec<f32>)>,
    metric: SimilarityMetric,
}

/// A lazy scored stream; see the module docs.
pub struct SearchStream {
    snapshot: Arc<Snapshot>,
    query: Vec<f32>,
    opts: StreamOptions,
    cancel: CancelToken,
    started: Instant,
    pos: usize,
    batch: usize,
    buffer: VecDeque<StreamHit>,
    /// Accumulated top-k ids, used for the early-termination stability
    /// check.
    top_k: Vec<(String, f32)>,
    done: bool,
    cancelled: bool,
}

impl SearchStream {
    fn batch_size(&self) -> usize {
        self.opts.batch_size.max(1)
    }

    /// Score the next batch into the buffer. Returns false when the
    /// stream is exhausted or terminated.
    fn fill(&mut self) -> bool {
        if self.done || self.pos >= self.snapshot.candidates.len() {
            self.done = true;
            return false;
        }
        if let Some(budget) = self.opts.max_latency {
            if self.started.elapsed() > budget {
                tracing::debug!("stream ended by latency budget");
                self.done = true;
                return false;
            }
        }

        let end = (self.pos + self.batch_size()).min(self.snapshot.candidates.len());
        let metric = self.snapshot.metric;
        let query = &self.query;
        let mut scored: Vec<StreamHit> = self.snapshot.candidates[self.pos..end]
            .par_iter()
            .filter(|(_, v)| v.len() == query.len())
            .map(|(id, v)| StreamHit {
                id: id.clone(),
                score: metric.distance_to_similarity(metric.distance(query, v)),
                batch: self.batch,
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        self.pos = end;
        self.batch += 1;

        if let Some(progress) = &self.opts.progress {
            progress(self.pos, self.snapshot.candidates.len());
        }

        // Fold the batch into the accumulated top-k and decide on early
        // termination before handing the batch out.
        let k = self.opts.search.top_k.max(1);
        let before: Vec<&String> = self.top_k.iter().map(|(id, _)| id).collect();
        let stable = {
            let mut merged = self.top_k.clone();
            merged.extend(scored.iter().map(|h| (h.id.clone(), h.score)));
            merged.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            merged.truncate(k);
            let unchanged = merged.iter().map(|(id, _)| id).eq(before.iter().copied());
            self.top_k = merged;
            unchanged
        };
        let batch_best = scored.first().map(|h| h.score).unwrap_or(f32::NEG_INFINITY);
        if self.opts.early_terminate && stable && batch_best < self.opts.quality_threshold {
            tracing::debug!(batch = self.batch, batch_best, "stream early-terminated");
            self.done = true;
        }

        self.buffer.extend(scored);
        !self.buffer.is_empty()
    }
}

impl Iterator for SearchStream {
    type Item = Result<StreamHit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancelled {
            return None;
        }
        loop {
            if let Some(hit) = self.buffer.pop_front() {
                return Some(Ok(hit));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.cancel.check("stream_search") {
                // Surface the cancellation once, then behave like a closed
                // channel.
                self.cancelled = true;
                self.done = true;
                return Some(Err(e));
            }
            if !self.fill() && self.buffer.is_empty() && self.done {
                return None;
            }
        }
    }
}

impl Store {
    /// Begin a lazy scored stream over the records matching
    /// `opts.search`'s filters.
    pub fn stream_search(
        &self,
        q_vec: &[f32],
        opts: StreamOptions,
        cancel: &CancelToken,
    ) -> Result<SearchStream> {
        let streams = self.parallel_stream_search(std::slice::from_ref(&q_vec.to_vec()), opts, cancel)?;
        Ok(streams.into_iter().next().unwrap())
    }

    /// Independent streams for several queries over a single candidate
    /// snapshot.
    pub fn parallel_stream_search(
        &self,
        queries: &[Vec<f32>],
        opts: StreamOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchStream>> {
        const OP: &str = "stream_search";
        self.check_open(OP)?;
        cancel.check(OP)?;

        let filters = self.build_filters(OP, &opts.search)?;
        let records = self.load_candidates(OP, &filters)?;
        let candidates: Vec<(String, Vec<f32>)> = records
            .into_iter()
            .filter(|r| self.passes_memory_filters(r, &opts.search))
            .map(|r| (r.id, r.vector))
            .collect();
        let snapshot = Arc::new(Snapshot {
            candidates,
            metric: self.config.similarity,
        });

        let mut opts = opts;
        if opts.batch_size == 0 {
            opts.batch_size = self.config.batch_size;
        }

        let target = self.query_target_dim(OP, &opts.search)?;
        queries
            .iter()
            .map(|q| {
                let adapted = self.adapt_for_query(OP, q, target)?;
                Ok(SearchStream {
                    snapshot: Arc::clone(&snapshot),
                    query: adapted,
                    opts: opts.clone(),
                    cancel: cancel.clone(),
                    started: Instant::now(),
                    pos: 0,
                    batch: 0,
                    buffer: VecDeque::new(),
                    top_k: Vec::new(),
                    done: false,
                    cancelled: false,
                })
            })
            .collect()
    }
}

/// Fair round-robin interleave of several streams. Exhausted streams drop
/// out; the merge ends when all inputs do.
pub fn merge_stream_results(streams: Vec<SearchStream>) -> impl Iterator<Item = Result<StreamHit>> {
    MergedStream {
        streams,
        next_idx: 0,
    }
}

struct MergedStream {
    streams: Vec<SearchStream>,
    next_idx: usize,
}

impl Iterator for MergedStream {
    type Item = Result<StreamHit>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.streams.is_empty() {
            let idx = self.next_idx % self.streams.len();
            match self.streams[idx].next() {
                Some(item) => {
                    self.next_idx = idx + 1;
                    return Some(item);
                }
                None => {
                    self.streams.remove(idx);
                    self.next_idx = idx;
                }
            }
        }
        None
    }
}

/// Drain a stream and keep the `k` highest-scored hits, descending.
pub fn collect_top_k(
    stream: impl Iterator<Item = Result<StreamHit>>,
    k: usize,
) -> Result<Vec<StreamHit>> {
    let mut hits: Vec<StreamHit> = stream.collect::<Result<Vec<_>>>()?;
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(k);
    Ok(hits)
}
