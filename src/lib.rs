//! # Quiver (library root)
//!
//! Quiver is an **embeddable vector database kernel**: all durable state
//! lives in a single SQLite file, and one handle gives you
//! - approximate nearest-neighbor search over float vectors (`hnsw`, `ivf`),
//! - exact keyword search over the same records (FTS5/BM25),
//! - a hybrid ranker fusing both channels (`search`),
//! - a typed knowledge-graph overlay on the same substrate (`graph`),
//! - and a long-term memory layer with four-channel recall (`memory`).
//!
//! ## Quick start
//!
//! ```no_run
//! use quiver::cancel::CancelToken;
//! use quiver::config::StoreConfig;
//! use quiver::search::SearchOptions;
//! use quiver::store::{Record, Store};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::open(StoreConfig::new("vectors.db"))?;
//! let cancel = CancelToken::new();
//!
//! let mut rec = Record::new("doc-1", vec![0.1, 0.7, 0.2]);
//! rec.content = "the quick brown fox".to_string();
//! store.upsert(rec, &cancel)?;
//!
//! let hits = store.hybrid_search(
//!     &[0.1, 0.7, 0.2],
//!     "quick fox",
//!     &SearchOptions::default(),
//!     &cancel,
//! )?;
//! for hit in hits {
//!     println!("{} {:.3}", hit.record.id, hit.score);
//! }
//! store.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The record table is the source of truth; the HNSW/IVF indexes are
//! in-memory derived state rebuilt from it on open (only the key↔id
//! bijection persists). See the `store` module docs for the write/read
//! paths and the concurrency model.
//!
//! ## Modules
//! - [`config`] — the closed option record and YAML loader.
//! - [`error`] — the typed error taxonomy.
//! - [`cancel`] — cooperative cancellation tokens.
//! - [`events`] — the observable event stream.
//! - [`vector`] — blob codec, similarity kernels, quantization.
//! - [`adapter`] — dimension reconciliation policies.
//! - [`store`] — records, collections, documents, lifecycle.
//! - [`search`] — the query planner and hybrid fusion.
//! - [`stream`] — batched lazy result streams.
//! - [`graph`] — typed nodes and weighted edges.
//! - [`session`] — chat sessions and messages.
//! - [`memory`] — banks, TEMPR recall, reflection, observations.
//! - [`text_match`] — the fuzzy/phonetic text scorer.

pub mod adapter;
pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
mod hnsw;
mod ivf;
pub mod memory;
mod schema;
pub mod search;
pub mod session;
pub mod store;
pub mod stream;
pub mod text_match;
pub mod vector;

pub use cancel::CancelToken;
pub use config::{StoreConfig, load_config};
pub use error::{Error, Result};
pub use events::Event;
pub use search::{SearchHit, SearchOptions};
pub use store::{Record, Store, StoreStats};
