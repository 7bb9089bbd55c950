//! # Record store
//!
//! [`Store`] is the engine facade: one SQLite file of durable truth plus the
//! in-memory indexes derived from it.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Store                             │
//! │                                                            │
//! │  ┌──────────────┐   ┌─────────────┐   ┌────────────────┐  │
//! │  │ SQLite file  │   │  key map    │   │ per-collection │  │
//! │  │ records      │◄──┤  id ↔ key   ├──►│ HNSW / IVF     │  │
//! │  │ FTS mirrors  │   │  (durable)  │   │ (rebuilt)      │  │
//! │  │ graph, chat  │   └─────────────┘   └────────────────┘  │
//! │  └──────────────┘                                          │
//! │         ▲                                                  │
//! │   write path: validate → adapt → encode → txn → index      │
//! │   read path:  planner → index/FTS → fuse → filter → top-k  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership and lifecycle
//!
//! The record table owns the truth. Both indexes are derived state: on open
//! the store reloads the durable key↔id bijection, discards map entries
//! whose record vanished, assigns fresh keys to records that lost theirs,
//! and replays every vector into the configured index. A record's lifetime
//! bounds its keyword-mirror row, its index entries, and any graph node
//! sharing its id.
//!
//! ## Concurrency
//!
//! The SQLite connection sits behind a mutex held only for the duration of
//! each transaction (and the index install that immediately follows a
//! commit — that pairing is the serialization boundary: a record becomes
//! queryable only once its index entry is installed, in commit order).
//! The indexes themselves sit behind `RwLock`s, so searches proceed in
//! parallel and only structural mutation is exclusive.
//!
//! `close()` flips the closed flag, cancels and drains background
//! auto-retain tasks, and releases the connection last. Double-close is a
//! no-op; every operation on a closed store fails with `StoreClosed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, OnceLock, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusqlite::{Connection, OptionalExtension, params};

use crate::adapter::DimensionAdapter;
use crate::cancel::CancelToken;
use crate::config::{IndexType, StoreConfig};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::hnsw::HnswIndex;
use crate::ivf::IvfIndex;
use crate::memory::Hooks;
use crate::schema::{SCHEMA, SCHEMA_VERSION};
use crate::text_match::TextMatcher;
use crate::vector::{decode_vector, encode_vector, validate_vector};

/// Collection id used for records stored outside any named collection.
pub(crate) const DEFAULT_COLLECTION: i64 = 0;

/// A stored vector record — the base unit of the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Stable, caller-chosen, non-empty id; unique across the store.
    pub id: String,
    /// Optional named collection.
    pub collection: Option<String>,
    /// Finite f32 embedding; adapted to the active dimension on write.
    pub vector: Vec<f32>,
    /// Free-form content, mirrored into the keyword index.
    pub content: String,
    /// Optional parent document.
    pub doc_id: Option<String>,
    /// String→string metadata, filterable by equality.
    pub metadata: HashMap<String, String>,
    /// Opaque ACL tags; `None` means visible to every caller.
    pub acl: Option<Vec<String>>,
    /// Epoch seconds; 0 means "set on write".
    pub created_at: i64,
    pub updated_at: i64,
}

impl Record {
    /// A record with just an id and vector; everything else defaulted.
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            collection: None,
            vector,
            content: String::new(),
            doc_id: None,
            metadata: HashMap::new(),
            acl: None,
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// Store-level statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub count: usize,
    pub dimensions: usize,
    pub size_bytes: u64,
}

/// A named collection and its counters.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub dimensions: usize,
    pub created_at: i64,
    pub count: usize,
    pub last_inserted_at: Option<i64>,
}

/// Per-document summary from `list_documents_with_info`.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub doc_id: String,
    pub count: usize,
    pub first_created_at: i64,
    pub last_created_at: i64,
}

/// Durable key↔id bijection kept in lockstep with `hnsw_keymap`.
#[derive(Default)]
pub(crate) struct KeyMap {
    id_to_key: HashMap<String, u32>,
    key_to_id: HashMap<u32, String>,
    next_key: u32,
}

impl KeyMap {
    fn assign(&mut self, id: &str) -> u32 {
        let key = self.next_key;
        self.next_key += 1;
        let prior = self.id_to_key.insert(id.to_string(), key);
        assert!(prior.is_none(), "key map already held id {id:?}");
        self.key_to_id.insert(key, id.to_string());
        key
    }

    fn restore(&mut self, key: u32, id: &str) {
        self.id_to_key.insert(id.to_string(), key);
        self.key_to_id.insert(key, id.to_string());
        self.next_key = self.next_key.max(key + 1);
    }

    fn release(&mut self, id: &str) -> Option<u32> {
        let key = self.id_to_key.remove(id)?;
        self.key_to_id.remove(&key);
        Some(key)
    }

    pub(crate) fn key_for(&self, id: &str) -> Option<u32> {
        self.id_to_key.get(id).copied()
    }

    pub(crate) fn id_for(&self, key: u32) -> Option<&str> {
        self.key_to_id.get(&key).map(String::as_str)
    }
}

/// The active index for one collection.
pub(crate) enum AnyIndex {
    /// No in-memory structure; queries scan the record table.
    Flat,
    Hnsw(HnswIndex),
    Ivf(IvfIndex),
}

impl AnyIndex {
    fn add(&mut self, key: u32, vector: Vec<f32>, rng: &mut StdRng) -> Result<Vec<Event>> {
        // A mismatched vector (possible under warn_only) must not enter the
        // graph; it would corrupt every distance computed against it.
        let dim = match self {
            AnyIndex::Flat => None,
            AnyIndex::Hnsw(h) => h.dim(),
            AnyIndex::Ivf(i) => i.dim(),
        };
        if let Some(d) = dim {
            if vector.len() != d {
                return Err(Error::dimension("index_add", d, vector.len()));
            }
        }
        match self {
            AnyIndex::Flat => Ok(Vec::new()),
            AnyIndex::Hnsw(h) => {
                let mut events = Vec::new();
                if h.insert(key, vector, rng) {
                    events.push(Event::HnswEntryChanged { key, layer: 0 });
                }
                Ok(events)
            }
            AnyIndex::Ivf(i) => Ok(i.add(key, vector).into_iter().collect()),
        }
    }

    fn remove(&mut self, key: u32) {
        match self {
            AnyIndex::Flat => {}
            AnyIndex::Hnsw(h) => {
                h.tombstone(key);
            }
            AnyIndex::Ivf(i) => {
                i.remove(key);
            }
        }
    }
}

/// Pushdown predicates the planner hands to SQL-level candidate fetches.
#[derive(Debug, Clone, Default)]
pub(crate) struct SqlFilters {
    pub collection_id: Option<i64>,
    pub doc_id: Option<String>,
    pub acl_tags: Option<Vec<String>>,
}

impl SqlFilters {
    /// Append `AND ...` fragments over table alias `e` and collect their
    /// bound parameters.
    fn push_sql(&self, sql: &mut String, args: &mut Vec<Box<dyn rusqlite::ToSql>>) {
        if let Some(cid) = self.collection_id {
            if cid == DEFAULT_COLLECTION {
                sql.push_str(" AND e.collection_id IS NULL");
            } else {
                sql.push_str(" AND e.collection_id = ?");
                args.push(Box::new(cid));
            }
        }
        if let Some(doc) = &self.doc_id {
            sql.push_str(" AND e.doc_id = ?");
            args.push(Box::new(doc.clone()));
        }
        if let Some(tags) = &self.acl_tags {
            sql.push_str(" AND (e.acl IS NULL OR EXISTS (SELECT 1 FROM json_each(e.acl) WHERE json_each.value IN (");
            for (i, tag) in tags.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                sql.push('?');
                args.push(Box::new(tag.clone()));
            }
            sql.push_str(")))");
        }
    }
}

/// The engine facade. See the module docs for the big picture.
pub struct Store {
    pub(crate) config: StoreConfig,
    conn: Mutex<Connection>,
    adapter: DimensionAdapter,
    pub(crate) matcher: Option<TextMatcher>,
    pub(crate) events: EventBus,
    closed: AtomicBool,
    needs_rebuild: AtomicBool,
    /// Store-level dimension (declared or auto-detected; 0 = not yet known).
    dims: AtomicUsize,
    pub(crate) indexes: RwLock<HashMap<i64, AnyIndex>>,
    pub(crate) keymap: RwLock<KeyMap>,
    rng: Mutex<StdRng>,
    pub(crate) hooks: RwLock<Hooks>,
    pub(crate) retain_counters: Mutex<HashMap<String, usize>>,
    rt: tokio::runtime::Runtime,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    pub(crate) shutdown: CancelToken,
    /// Weak self-handle for background tasks (set once at open).
    weak: OnceLock<Weak<Store>>,
}

impl Store {
    /// Open (or create) the store at `config.path`.
    ///
    /// Creates the schema when absent, reconciles the persisted key map
    /// against the record table, and rebuilds the configured index from the
    /// stored vectors. Returns an `Arc` because background auto-retain
    /// tasks hold (weak) handles of their own.
    ///
    /// # Errors
    /// `InvalidConfig` for a bad configuration, `Storage` for SQLite
    /// failures.
    pub fn open(config: StoreConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let conn = Connection::open(&config.path).map_err(|e| Error::storage("open", e))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| Error::storage("open", e))?;
        Self::bootstrap(config, conn)
    }

    /// An in-memory store, handy in tests and ephemeral pipelines.
    pub fn open_in_memory(mut config: StoreConfig) -> Result<Arc<Self>> {
        if config.path.is_empty() {
            config.path = ":memory:".to_string();
        }
        config.validate()?;
        let conn = Connection::open_in_memory().map_err(|e| Error::storage("open", e))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| Error::storage("open", e))?;
        Self::bootstrap(config, conn)
    }

    fn bootstrap(config: StoreConfig, conn: Connection) -> Result<Arc<Self>> {
        const OP: &str = "open";
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::storage(OP, e))?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )
        .map_err(|e| Error::storage(OP, e))?;

        // Store dimension: an explicit config wins; otherwise whatever a
        // previous run auto-detected.
        let persisted: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'dimensions'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::storage(OP, e))?;
        let dims = if config.dimensions > 0 {
            config.dimensions
        } else {
            persisted.and_then(|s| s.parse().ok()).unwrap_or(0)
        };
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('dimensions', ?1)",
            params![dims.to_string()],
        )
        .map_err(|e| Error::storage(OP, e))?;

        let seed = config.rng_seed.unwrap_or_else(|| rand::thread_rng().r#gen());
        let matcher = config
            .text_similarity
            .enabled
            .then(|| TextMatcher::new(&config.text_similarity));
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| Error::invalid_config(OP, format!("runtime: {e}")))?;

        let store = Self {
            adapter: DimensionAdapter::new(config.adapt_policy, config.adapt_window),
            matcher,
            events: EventBus::new(),
            closed: AtomicBool::new(false),
            needs_rebuild: AtomicBool::new(false),
            dims: AtomicUsize::new(dims),
            indexes: RwLock::new(HashMap::new()),
            keymap: RwLock::new(KeyMap::default()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            hooks: RwLock::new(Hooks::default()),
            retain_counters: Mutex::new(HashMap::new()),
            rt,
            tasks: Mutex::new(Vec::new()),
            shutdown: CancelToken::new(),
            weak: OnceLock::new(),
            conn: Mutex::new(conn),
            config,
        };
        let store = Arc::new(store);
        let _ = store.weak.set(Arc::downgrade(&store));
        store.rebuild_from_records()?;
        Ok(store)
    }

    /// A strong self-handle, if the store is still alive.
    pub(crate) fn shared(&self) -> Option<Arc<Store>> {
        self.weak.get().and_then(Weak::upgrade)
    }

    /// Reconcile the key map and replay every stored vector into fresh
    /// indexes. Called on open and by [`rebuild_index`](Self::rebuild_index).
    fn rebuild_from_records(&self) -> Result<()> {
        const OP: &str = "open";
        let conn = self.conn.lock();

        // Tombstoned map rows are garbage once the graph is rebuilt, and
        // map rows without a record are stale.
        conn.execute("DELETE FROM hnsw_keymap WHERE tombstoned = 1", [])
            .map_err(|e| Error::storage(OP, e))?;
        conn.execute(
            "DELETE FROM hnsw_keymap WHERE id NOT IN (SELECT id FROM embeddings)",
            [],
        )
        .map_err(|e| Error::storage(OP, e))?;

        let mut keymap = KeyMap::default();
        {
            let mut stmt = conn
                .prepare("SELECT key, id FROM hnsw_keymap ORDER BY key")
                .map_err(|e| Error::storage(OP, e))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)? as u32, row.get::<_, String>(1)?)))
                .map_err(|e| Error::storage(OP, e))?;
            for row in rows {
                let (key, id) = row.map_err(|e| Error::storage(OP, e))?;
                keymap.restore(key, &id);
            }
        }

        // Records that lost their map entry get fresh keys.
        let mut fresh: Vec<(u32, String)> = Vec::new();
        let mut members: Vec<(i64, String, Vec<u8>)> = Vec::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT COALESCE(collection_id, 0), id, vector FROM embeddings ORDER BY id",
                )
                .map_err(|e| Error::storage(OP, e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })
                .map_err(|e| Error::storage(OP, e))?;
            for row in rows {
                let (cid, id, blob) = row.map_err(|e| Error::storage(OP, e))?;
                if keymap.key_for(&id).is_none() {
                    fresh.push((keymap.assign(&id), id.clone()));
                }
                members.push((cid, id, blob));
            }
        }
        for (key, id) in &fresh {
            conn.execute(
                "INSERT INTO hnsw_keymap (key, id) VALUES (?1, ?2)",
                params![*key as i64, id],
            )
            .map_err(|e| Error::storage(OP, e))?;
        }

        // Replay vectors, grouped by collection, in key order for a
        // reproducible graph.
        let mut indexes: HashMap<i64, AnyIndex> = HashMap::new();
        let mut by_key: Vec<(u32, i64, Vec<u8>)> = members
            .into_iter()
            .map(|(cid, id, blob)| (keymap.key_for(&id).unwrap(), cid, blob))
            .collect();
        by_key.sort_by_key(|(key, _, _)| *key);

        let mut rng = self.rng.lock();
        for (key, cid, blob) in by_key {
            let vector = decode_vector(OP, &blob)?;
            let index = indexes.entry(cid).or_insert_with(|| self.fresh_index());
            if let Err(e) = index.add(key, vector, &mut rng) {
                tracing::error!(error = %e, key, "index rebuild failed; store flagged");
                self.needs_rebuild.store(true, Ordering::Release);
            }
        }
        drop(rng);
        drop(conn);

        // IVF indexes come back untrained; train them from the replayed
        // population so search quality survives a restart.
        if self.config.index == IndexType::Ivf {
            let mut rng = self.rng.lock();
            for index in indexes.values_mut() {
                if let AnyIndex::Ivf(ivf) = index {
                    if !ivf.is_empty() {
                        ivf.train(self.config.ivf.n_centroids, &mut rng);
                    }
                }
            }
        }

        *self.keymap.write() = keymap;
        *self.indexes.write() = indexes;
        tracing::info!(path = %self.config.path, "store opened");
        Ok(())
    }

    fn fresh_index(&self) -> AnyIndex {
        match self.config.index {
            IndexType::Flat => AnyIndex::Flat,
            IndexType::Hnsw => AnyIndex::Hnsw(HnswIndex::new(
                &self.config.hnsw,
                self.config.similarity,
            )),
            IndexType::Ivf => AnyIndex::Ivf(IvfIndex::new(
                &self.config.ivf,
                self.config.similarity,
                Some(self.config.quantization.clone()),
            )),
        }
    }

    /// Subscribe to the store's event stream.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.events.subscribe()
    }

    /// Whether an index-side failure has been recorded; a full
    /// [`rebuild_index`](Self::rebuild_index) clears it.
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::Acquire)
    }

    /// Drop and rebuild every in-memory index from the record table.
    pub fn rebuild_index(&self) -> Result<()> {
        self.check_open("rebuild_index")?;
        self.rebuild_from_records()?;
        self.needs_rebuild.store(false, Ordering::Release);
        Ok(())
    }

    pub(crate) fn check_open(&self, op: &'static str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::StoreClosed { op })
        } else {
            Ok(())
        }
    }

    /// Close the store: refuse new work, drain background tasks, release
    /// the connection. Safe to call twice.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        // Draining blocks; skip it when close() runs on one of our own
        // runtime threads (an abandoned handle dropped inside a task).
        if tokio::runtime::Handle::try_current().is_err() {
            let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
            for handle in handles {
                if let Err(e) = self.rt.block_on(handle) {
                    tracing::warn!(error = %e, "background task failed during close");
                }
            }
        } else {
            tracing::debug!("close() inside async context; background tasks abandoned");
        }
        // Checkpoint so the WAL doesn't linger after a clean shutdown.
        let conn = self.conn.lock();
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            tracing::debug!(error = %e, "wal checkpoint on close failed");
        }
        tracing::info!(path = %self.config.path, "store closed");
    }

    pub(crate) fn spawn_task<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(self.rt.spawn(fut));
    }

    pub(crate) fn store_dims(&self) -> usize {
        self.dims.load(Ordering::Acquire)
    }

    /// Run a query vector through the adapter (symmetric with the write
    /// path). Adaptation events are emitted; auto-detection is not — a
    /// query never establishes the store dimension.
    pub(crate) fn adapt_for_query(
        &self,
        op: &'static str,
        v: &[f32],
        target: usize,
    ) -> Result<Vec<f32>> {
        let outcome = {
            let mut rng = self.rng.lock();
            self.adapter.adapt(op, "<query>", v.to_vec(), target, &mut rng)?
        };
        for event in outcome.events {
            self.events.emit(event);
        }
        Ok(outcome.vector)
    }

    pub(crate) fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Resolve `(collection rowid, declared dimension)` for a record or
    /// query target. `None` collection maps to the default slot and the
    /// store-level dimension.
    pub(crate) fn resolve_collection(
        &self,
        op: &'static str,
        conn: &Connection,
        collection: Option<&str>,
    ) -> Result<(i64, usize)> {
        match collection {
            None => Ok((DEFAULT_COLLECTION, self.store_dims())),
            Some(name) => {
                let row: Option<(i64, i64)> = conn
                    .query_row(
                        "SELECT id, dimensions FROM collections WHERE name = ?1",
                        params![name],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .map_err(|e| Error::storage(op, e))?;
                row.map(|(id, d)| (id, d as usize))
                    .ok_or_else(|| Error::not_found(op, name))
            }
        }
    }

    // ------------------------------------------------------------------
    // Record operations
    // ------------------------------------------------------------------

    /// Insert or replace a record by id, returning the canonical stored
    /// form (vector adapted, timestamps set).
    ///
    /// The row, its keyword-mirror entry, and the key-map bookkeeping
    /// commit in one transaction; the vector lands in the in-memory index
    /// immediately after, before the write lock is released.
    pub fn upsert(&self, record: Record, cancel: &CancelToken) -> Result<Record> {
        const OP: &str = "upsert";
        self.check_open(OP)?;
        cancel.check(OP)?;
        let mut out = self.upsert_all(OP, vec![record], cancel)?;
        Ok(out.pop().unwrap())
    }

    /// Upsert many records in a single transaction. Any per-record failure
    /// aborts the entire batch; index updates happen after the commit, in
    /// insertion order.
    pub fn upsert_batch(&self, records: Vec<Record>, cancel: &CancelToken) -> Result<Vec<Record>> {
        const OP: &str = "upsert_batch";
        self.check_open(OP)?;
        cancel.check(OP)?;
        self.upsert_all(OP, records, cancel)
    }

    fn upsert_all(
        &self,
        op: &'static str,
        records: Vec<Record>,
        cancel: &CancelToken,
    ) -> Result<Vec<Record>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.lock();
        let mut events: Vec<Event> = Vec::new();
        let mut detected: Option<usize> = None;
        // (collection slot, fresh key, old key to drop, adapted vector)
        let mut index_ops: Vec<(i64, u32, Option<u32>, Vec<f32>)> = Vec::new();
        let mut stored: Vec<Record> = Vec::with_capacity(records.len());
        // Key assignments are planned locally and applied to the shared map
        // only after the commit succeeds; the connection mutex serializes
        // writers, so no other thread can hand out the same keys meanwhile.
        let mut planned: Vec<(String, u32)> = Vec::new();
        let mut local_next = self.keymap.read().next_key;
        let mut local_keys: HashMap<String, u32> = HashMap::new();

        let tx = conn
            .transaction()
            .map_err(|e| Error::storage(op, e))?;
        {
            for mut record in records {
                cancel.check(op)?;
                if record.id.is_empty() {
                    return Err(Error::invalid_vector(op, "record id must not be empty"));
                }
                if record.vector.is_empty() {
                    return Err(Error::invalid_vector(op, "record vector must not be empty"));
                }
                validate_vector(op, &record.vector)?;

                let (cid, declared) =
                    self.resolve_collection(op, &tx, record.collection.as_deref())?;
                let target_dim = if cid == DEFAULT_COLLECTION {
                    detected.unwrap_or(declared)
                } else {
                    declared
                };

                let outcome = {
                    let mut rng = self.rng.lock();
                    self.adapter
                        .adapt(op, &record.id, record.vector, target_dim, &mut rng)?
                };
                if let Some(d) = outcome.detected {
                    detected = Some(d);
                }
                events.extend(outcome.events);
                record.vector = outcome.vector;

                let now = Self::now();
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT created_at FROM embeddings WHERE id = ?1",
                        params![record.id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| Error::storage(op, e))?;
                record.created_at = match existing {
                    Some(at) if record.created_at == 0 => at,
                    _ if record.created_at == 0 => now,
                    _ => record.created_at,
                };
                record.updated_at = now;

                let metadata = serde_json::to_string(&record.metadata)
                    .map_err(|e| Error::invalid_vector(op, e.to_string()))?;
                let acl = record
                    .acl
                    .as_ref()
                    .map(|tags| serde_json::to_string(tags))
                    .transpose()
                    .map_err(|e| Error::invalid_vector(op, e.to_string()))?;
                let blob = encode_vector(&record.vector);
                let coll_param = (cid != DEFAULT_COLLECTION).then_some(cid);

                tx.execute(
                    "INSERT INTO embeddings (id, collection_id, vector, content, doc_id, metadata, acl, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO UPDATE SET
                        collection_id = excluded.collection_id,
                        vector = excluded.vector,
                        content = excluded.content,
                        doc_id = excluded.doc_id,
                        metadata = excluded.metadata,
                        acl = excluded.acl,
                        updated_at = excluded.updated_at",
                    params![
                        record.id,
                        coll_param,
                        blob,
                        record.content,
                        record.doc_id,
                        metadata,
                        acl,
                        record.created_at,
                        record.updated_at,
                    ],
                )
                .map_err(|e| Error::storage(op, e))?;

                tx.execute(
                    "DELETE FROM chunks_fts WHERE id = ?1",
                    params![record.id],
                )
                .map_err(|e| Error::storage(op, e))?;
                if !record.content.is_empty() {
                    tx.execute(
                        "INSERT INTO chunks_fts (id, content) VALUES (?1, ?2)",
                        params![record.id, record.content],
                    )
                    .map_err(|e| Error::storage(op, e))?;
                }

                if cid != DEFAULT_COLLECTION {
                    if existing.is_none() {
                        tx.execute(
                            "UPDATE collections SET count = count + 1, last_inserted_at = ?2 WHERE id = ?1",
                            params![cid, now],
                        )
                        .map_err(|e| Error::storage(op, e))?;
                    } else {
                        tx.execute(
                            "UPDATE collections SET last_inserted_at = ?2 WHERE id = ?1",
                            params![cid, now],
                        )
                        .map_err(|e| Error::storage(op, e))?;
                    }
                }

                // Replacing a vector means a fresh graph key; the old one
                // is tombstoned rather than rewired.
                let old_key = local_keys
                    .get(&record.id)
                    .copied()
                    .or_else(|| self.keymap.read().key_for(&record.id));
                if let Some(old) = old_key {
                    tx.execute(
                        "UPDATE hnsw_keymap SET tombstoned = 1 WHERE key = ?1",
                        params![old as i64],
                    )
                    .map_err(|e| Error::storage(op, e))?;
                }
                let key = local_next;
                local_next += 1;
                tx.execute(
                    "INSERT INTO hnsw_keymap (key, id) VALUES (?1, ?2)",
                    params![key as i64, record.id],
                )
                .map_err(|e| Error::storage(op, e))?;
                local_keys.insert(record.id.clone(), key);
                planned.push((record.id.clone(), key));

                index_ops.push((cid, key, old_key, record.vector.clone()));
                stored.push(record);
            }

            if let Some(d) = detected {
                tx.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('dimensions', ?1)",
                    params![d.to_string()],
                )
                .map_err(|e| Error::storage(op, e))?;
            }
        }
        tx.commit().map_err(|e| Error::storage(op, e))?;

        {
            let mut keymap = self.keymap.write();
            for (id, key) in &planned {
                keymap.release(id);
                keymap.restore(*key, id);
            }
        }
        if let Some(d) = detected {
            self.dims.store(d, Ordering::Release);
        }

        // Index installs, still under the connection lock so entries land
        // in commit order. An index failure never rolls back the record —
        // the store is flagged for rebuild instead.
        {
            let mut indexes = self.indexes.write();
            let mut rng = self.rng.lock();
            for (cid, key, old_key, vector) in index_ops {
                let index = indexes.entry(cid).or_insert_with(|| self.fresh_index());
                if let Some(old) = old_key {
                    index.remove(old);
                }
                match index.add(key, vector, &mut rng) {
                    Ok(evs) => events.extend(evs),
                    Err(e) => {
                        tracing::error!(error = %e, key, "index install failed; store flagged");
                        self.needs_rebuild.store(true, Ordering::Release);
                    }
                }
            }
        }
        drop(conn);

        for event in events {
            self.events.emit(event);
        }
        Ok(stored)
    }

    /// Fetch one record by id.
    ///
    /// # Errors
    /// `NotFound` when no such record exists.
    pub fn get_by_id(&self, id: &str) -> Result<Record> {
        const OP: &str = "get_by_id";
        self.check_open(OP)?;
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("{RECORD_SELECT} WHERE e.id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()
            .map_err(|e| Error::storage(OP, e))?;
        record.ok_or_else(|| Error::not_found(OP, id))
    }

    /// All records belonging to a document, ordered by id.
    pub fn get_by_doc_id(&self, doc_id: &str) -> Result<Vec<Record>> {
        const OP: &str = "get_by_doc_id";
        self.check_open(OP)?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!("{RECORD_SELECT} WHERE e.doc_id = ?1 ORDER BY e.id"))
            .map_err(|e| Error::storage(OP, e))?;
        let rows = stmt
            .query_map(params![doc_id], row_to_record)
            .map_err(|e| Error::storage(OP, e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(OP, e))
    }

    /// Delete one record. Removing a missing id is an error; the keyword
    /// mirror row and index entries go with it.
    pub fn delete(&self, id: &str) -> Result<()> {
        const OP: &str = "delete";
        self.check_open(OP)?;
        let deleted = self.delete_where(OP, "e.id = ?1", params![id])?;
        if deleted == 0 {
            return Err(Error::not_found(OP, id));
        }
        Ok(())
    }

    /// Delete every record of a document. Deleting a document with no
    /// records is not an error. Returns the number of records removed.
    pub fn delete_by_doc_id(&self, doc_id: &str) -> Result<usize> {
        const OP: &str = "delete_by_doc_id";
        self.check_open(OP)?;
        let n = self.delete_where(OP, "e.doc_id = ?1", params![doc_id])?;
        let conn = self.conn.lock();
        conn.execute("DELETE FROM documents WHERE id = ?1", params![doc_id])
            .map_err(|e| Error::storage(OP, e))?;
        Ok(n)
    }

    fn delete_where(
        &self,
        op: &'static str,
        predicate: &str,
        args: impl rusqlite::Params + Copy,
    ) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| Error::storage(op, e))?;
        let ids: Vec<(String, Option<i64>)> = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT e.id, e.collection_id FROM embeddings e WHERE {predicate}"
                ))
                .map_err(|e| Error::storage(op, e))?;
            let rows = stmt
                .query_map(args, |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| Error::storage(op, e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::storage(op, e))?
        };

        let mut removed_keys: Vec<(String, i64, u32)> = Vec::new();
        for (id, cid) in &ids {
            tx.execute("DELETE FROM embeddings WHERE id = ?1", params![id])
                .map_err(|e| Error::storage(op, e))?;
            tx.execute("DELETE FROM chunks_fts WHERE id = ?1", params![id])
                .map_err(|e| Error::storage(op, e))?;
            if let Some(key) = self.keymap.read().key_for(id) {
                tx.execute(
                    "UPDATE hnsw_keymap SET tombstoned = 1 WHERE key = ?1",
                    params![key as i64],
                )
                .map_err(|e| Error::storage(op, e))?;
                removed_keys.push((id.clone(), cid.unwrap_or(DEFAULT_COLLECTION), key));
            }
            if let Some(cid) = cid {
                tx.execute(
                    "UPDATE collections SET count = count - 1 WHERE id = ?1 AND count > 0",
                    params![cid],
                )
                .map_err(|e| Error::storage(op, e))?;
            }
        }
        tx.commit().map_err(|e| Error::storage(op, e))?;

        {
            let mut keymap = self.keymap.write();
            let mut indexes = self.indexes.write();
            for (id, cid, key) in removed_keys {
                keymap.release(&id);
                if let Some(index) = indexes.get_mut(&cid) {
                    index.remove(key);
                }
            }
        }
        drop(conn);
        Ok(ids.len())
    }

    /// Distinct document ids, ascending.
    pub fn list_documents(&self) -> Result<Vec<String>> {
        const OP: &str = "list_documents";
        self.check_open(OP)?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT doc_id FROM embeddings WHERE doc_id IS NOT NULL ORDER BY doc_id",
            )
            .map_err(|e| Error::storage(OP, e))?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| Error::storage(OP, e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(OP, e))
    }

    /// Documents with chunk counts and first/last creation timestamps.
    pub fn list_documents_with_info(&self) -> Result<Vec<DocumentInfo>> {
        const OP: &str = "list_documents_with_info";
        self.check_open(OP)?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT doc_id, COUNT(*), MIN(created_at), MAX(created_at)
                 FROM embeddings WHERE doc_id IS NOT NULL
                 GROUP BY doc_id ORDER BY doc_id",
            )
            .map_err(|e| Error::storage(OP, e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DocumentInfo {
                    doc_id: row.get(0)?,
                    count: row.get::<_, i64>(1)? as usize,
                    first_created_at: row.get(2)?,
                    last_created_at: row.get(3)?,
                })
            })
            .map_err(|e| Error::storage(OP, e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(OP, e))
    }

    /// Attach (or update) metadata for a document id. Records reference
    /// documents by `doc_id` whether or not metadata was registered.
    pub fn upsert_document(
        &self,
        id: &str,
        title: Option<&str>,
        url: Option<&str>,
        version: Option<&str>,
    ) -> Result<()> {
        const OP: &str = "upsert_document";
        self.check_open(OP)?;
        if id.is_empty() {
            return Err(Error::invalid_config(OP, "document id must not be empty"));
        }
        let now = Self::now();
        self.with_conn(OP, |conn| {
            conn.execute(
                "INSERT INTO documents (id, title, url, version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    url = excluded.url,
                    version = excluded.version",
                params![id, title, url, version, now],
            )
        })?;
        Ok(())
    }

    /// Registered metadata for a document: `(title, url, version)`.
    pub fn get_document(&self, id: &str) -> Result<(Option<String>, Option<String>, Option<String>)> {
        const OP: &str = "get_document";
        self.check_open(OP)?;
        let row = self.with_conn(OP, |conn| {
            conn.query_row(
                "SELECT title, url, version FROM documents WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })?;
        row.ok_or_else(|| Error::not_found(OP, id))
    }

    /// Remove every record (all collections included).
    pub fn clear(&self) -> Result<usize> {
        const OP: &str = "clear";
        self.check_open(OP)?;
        self.delete_where(OP, "1 = 1", params![])
    }

    /// Remove the records of several documents at once.
    pub fn clear_by_doc_ids(&self, doc_ids: &[&str]) -> Result<usize> {
        const OP: &str = "clear_by_doc_ids";
        self.check_open(OP)?;
        let mut total = 0;
        for doc_id in doc_ids {
            total += self.delete_by_doc_id(doc_id)?;
        }
        Ok(total)
    }

    /// Record count, active dimension, and on-disk size.
    pub fn stats(&self) -> Result<StoreStats> {
        const OP: &str = "stats";
        self.check_open(OP)?;
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
            .map_err(|e| Error::storage(OP, e))?;
        let size: i64 = conn
            .query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )
            .map_err(|e| Error::storage(OP, e))?;
        Ok(StoreStats {
            count: count as usize,
            dimensions: self.store_dims(),
            size_bytes: size as u64,
        })
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    /// Create a named collection with a fixed, positive dimension.
    pub fn create_collection(&self, name: &str, dimensions: usize) -> Result<CollectionInfo> {
        const OP: &str = "create_collection";
        self.check_open(OP)?;
        if name.is_empty() {
            return Err(Error::invalid_config(OP, "collection name must not be empty"));
        }
        if dimensions == 0 {
            return Err(Error::invalid_config(OP, "collection dimension must be positive"));
        }
        let conn = self.conn.lock();
        let now = Self::now();
        conn.execute(
            "INSERT INTO collections (name, dimensions, created_at) VALUES (?1, ?2, ?3)",
            params![name, dimensions as i64, now],
        )
        .map_err(|e| Error::storage(OP, e))?;
        Ok(CollectionInfo {
            name: name.to_string(),
            dimensions,
            created_at: now,
            count: 0,
            last_inserted_at: None,
        })
    }

    /// Look up a collection by name.
    pub fn get_collection(&self, name: &str) -> Result<CollectionInfo> {
        const OP: &str = "get_collection";
        self.check_open(OP)?;
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, dimensions, created_at, count, last_inserted_at
             FROM collections WHERE name = ?1",
            params![name],
            row_to_collection,
        )
        .optional()
        .map_err(|e| Error::storage(OP, e))?
        .ok_or_else(|| Error::not_found(OP, name))
    }

    /// All collections, by name.
    pub fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        const OP: &str = "list_collections";
        self.check_open(OP)?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT name, dimensions, created_at, count, last_inserted_at
                 FROM collections ORDER BY name",
            )
            .map_err(|e| Error::storage(OP, e))?;
        let rows = stmt
            .query_map([], row_to_collection)
            .map_err(|e| Error::storage(OP, e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(OP, e))
    }

    /// Same as [`get_collection`](Self::get_collection) with counters
    /// recomputed from the record table.
    pub fn collection_stats(&self, name: &str) -> Result<CollectionInfo> {
        let mut info = self.get_collection(name)?;
        const OP: &str = "collection_stats";
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM embeddings e JOIN collections c ON e.collection_id = c.id WHERE c.name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(|e| Error::storage(OP, e))?;
        info.count = count as usize;
        Ok(info)
    }

    /// Delete a collection and everything it owns: records, keyword-mirror
    /// rows, key-map entries, and the in-memory index.
    pub fn delete_collection(&self, name: &str) -> Result<()> {
        const OP: &str = "delete_collection";
        self.check_open(OP)?;
        let mut conn = self.conn.lock();
        let cid: Option<i64> = conn
            .query_row(
                "SELECT id FROM collections WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::storage(OP, e))?;
        let Some(cid) = cid else {
            return Err(Error::not_found(OP, name));
        };

        let tx = conn.transaction().map_err(|e| Error::storage(OP, e))?;
        let ids: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT id FROM embeddings WHERE collection_id = ?1")
                .map_err(|e| Error::storage(OP, e))?;
            let rows = stmt
                .query_map(params![cid], |row| row.get(0))
                .map_err(|e| Error::storage(OP, e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::storage(OP, e))?
        };
        for id in &ids {
            tx.execute("DELETE FROM chunks_fts WHERE id = ?1", params![id])
                .map_err(|e| Error::storage(OP, e))?;
            if let Some(key) = self.keymap.read().key_for(id) {
                tx.execute(
                    "UPDATE hnsw_keymap SET tombstoned = 1 WHERE key = ?1",
                    params![key as i64],
                )
                .map_err(|e| Error::storage(OP, e))?;
            }
        }
        // FK cascade removes the member records.
        tx.execute("DELETE FROM collections WHERE id = ?1", params![cid])
            .map_err(|e| Error::storage(OP, e))?;
        tx.commit().map_err(|e| Error::storage(OP, e))?;

        {
            let mut keymap = self.keymap.write();
            for id in &ids {
                keymap.release(id);
            }
        }
        self.indexes.write().remove(&cid);
        drop(conn);
        tracing::info!(collection = name, records = ids.len(), "collection deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Keyword channel
    // ------------------------------------------------------------------

    /// BM25 keyword search over the record mirror, with pushdown filters.
    /// Scores are normalized to (0, 1] via `1 / (1 + (−bm25))`.
    pub(crate) fn keyword_search(
        &self,
        op: &'static str,
        text: &str,
        filters: &SqlFilters,
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        let match_expr = fts_match_expr(text);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let mut sql = String::from(
            "SELECT f.id, bm25(chunks_fts) FROM chunks_fts f
             JOIN embeddings e ON e.id = f.id
             WHERE chunks_fts MATCH ?",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(match_expr)];
        filters.push_sql(&mut sql, &mut args);
        sql.push_str(" ORDER BY bm25(chunks_fts) LIMIT ?");
        args.push(Box::new(limit as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(|e| Error::storage(op, e))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(|e| Error::storage(op, e))?;
        let mut out = Vec::new();
        for row in rows {
            let (id, bm25) = row.map_err(|e| Error::storage(op, e))?;
            // FTS5's bm25() is negative for relevant rows.
            out.push((id, 1.0 / (1.0 + (-bm25).max(0.0)) as f32));
        }
        Ok(out)
    }

    /// Load full records matching the pushdown filters (exhaustive-scan
    /// candidate source for the planner and the streams).
    pub(crate) fn load_candidates(
        &self,
        op: &'static str,
        filters: &SqlFilters,
    ) -> Result<Vec<Record>> {
        let mut sql = format!("{RECORD_SELECT} WHERE 1 = 1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        filters.push_sql(&mut sql, &mut args);
        sql.push_str(" ORDER BY e.id");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(|e| Error::storage(op, e))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                row_to_record,
            )
            .map_err(|e| Error::storage(op, e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(op, e))
    }

    /// Fetch records for a set of ids, preserving no particular order.
    pub(crate) fn fetch_by_ids(&self, op: &'static str, ids: &[String]) -> Result<Vec<Record>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("{RECORD_SELECT} WHERE e.id IN ({placeholders})");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(|e| Error::storage(op, e))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), row_to_record)
            .map_err(|e| Error::storage(op, e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(op, e))
    }

    /// `(rowid, dimensions)` of a named collection, under a short
    /// connection lock.
    pub(crate) fn collection_id(&self, op: &'static str, name: &str) -> Result<(i64, usize)> {
        let conn = self.conn.lock();
        self.resolve_collection(op, &conn, Some(name))
    }

    /// Run `f` with the raw connection. Graph/session/memory modules use
    /// this instead of holding their own handles.
    pub(crate) fn with_conn<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(|e| Error::storage(op, e))
    }

    /// Run `f` inside a transaction.
    pub(crate) fn with_txn<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| Error::storage(op, e))?;
        let out = f(&tx).map_err(|e| Error::storage(op, e))?;
        tx.commit().map_err(|e| Error::storage(op, e))?;
        Ok(out)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.close();
    }
}

const RECORD_SELECT: &str = "SELECT e.id, c.name, e.vector, e.content, e.doc_id, e.metadata, e.acl, e.created_at, e.updated_at
     FROM embeddings e LEFT JOIN collections c ON e.collection_id = c.id";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let blob: Vec<u8> = row.get(2)?;
    let vector = decode_vector("get", &blob).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Blob, Box::new(e))
    })?;
    let metadata: HashMap<String, String> = row
        .get::<_, String>(5)
        .map(|s| serde_json::from_str(&s).unwrap_or_default())?;
    let acl: Option<Vec<String>> = row
        .get::<_, Option<String>>(6)?
        .and_then(|s| serde_json::from_str(&s).ok());
    Ok(Record {
        id: row.get(0)?,
        collection: row.get(1)?,
        vector,
        content: row.get(3)?,
        doc_id: row.get(4)?,
        metadata,
        acl,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_collection(row: &rusqlite::Row<'_>) -> rusqlite::Result<CollectionInfo> {
    Ok(CollectionInfo {
        name: row.get(0)?,
        dimensions: row.get::<_, i64>(1)? as usize,
        created_at: row.get(2)?,
        count: row.get::<_, i64>(3)? as usize,
        last_inserted_at: row.get(4)?,
    })
}

/// Quote user text into an FTS5 MATCH expression: tokens OR-ed together,
/// each quoted so FTS operators in the input stay inert.
pub(crate) fn fts_match_expr(text: &str) -> String {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    tokens.join(" OR ")
}
