//! SQL schema executed on open.
//!
//! All durable truth lives in these tables; the in-memory indexes are
//! derived state rebuilt from `embeddings` + `hnsw_keymap`. FTS5 mirrors are
//! maintained explicitly inside the same transaction as their base rows (no
//! triggers), so a rolled-back write never leaves a stray mirror row.

pub(crate) const SCHEMA_VERSION: i32 = 1;

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS collections (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    name             TEXT NOT NULL UNIQUE,
    dimensions       INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,
    count            INTEGER NOT NULL DEFAULT 0,
    last_inserted_at INTEGER
);

CREATE TABLE IF NOT EXISTS embeddings (
    id            TEXT PRIMARY KEY,
    collection_id INTEGER REFERENCES collections(id) ON DELETE CASCADE,
    vector        BLOB NOT NULL,
    content       TEXT NOT NULL DEFAULT '',
    doc_id        TEXT,
    metadata      TEXT NOT NULL DEFAULT '{}',
    acl           TEXT,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_doc_id ON embeddings(doc_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_created_at ON embeddings(created_at);
CREATE INDEX IF NOT EXISTS idx_embeddings_collection ON embeddings(collection_id);

CREATE TABLE IF NOT EXISTS documents (
    id         TEXT PRIMARY KEY,
    title      TEXT,
    url        TEXT,
    version    TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id         TEXT PRIMARY KEY,
    user_id    TEXT,
    metadata   TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    role       TEXT NOT NULL,
    content    TEXT NOT NULL,
    vector     BLOB,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    content
);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    id UNINDEXED,
    content
);

CREATE TABLE IF NOT EXISTS graph_nodes (
    id         TEXT PRIMARY KEY,
    node_type  TEXT NOT NULL,
    vector     BLOB,
    content    TEXT NOT NULL DEFAULT '',
    properties TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_graph_nodes_type ON graph_nodes(node_type);

CREATE TABLE IF NOT EXISTS graph_edges (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    from_id    TEXT NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
    to_id      TEXT NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
    edge_type  TEXT NOT NULL,
    weight     REAL NOT NULL CHECK(weight >= 0),
    properties TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    UNIQUE(from_id, to_id, edge_type)
);
CREATE INDEX IF NOT EXISTS idx_graph_edges_from ON graph_edges(from_id);
CREATE INDEX IF NOT EXISTS idx_graph_edges_to ON graph_edges(to_id);

CREATE VIRTUAL TABLE IF NOT EXISTS graph_nodes_fts USING fts5(
    id UNINDEXED,
    content
);

CREATE TABLE IF NOT EXISTS hnsw_keymap (
    key        INTEGER PRIMARY KEY,
    id         TEXT NOT NULL,
    tombstoned INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_hnsw_keymap_id
    ON hnsw_keymap(id) WHERE tombstoned = 0;
"#;
