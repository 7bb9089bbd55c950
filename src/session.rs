//! # Sessions & messages
//!
//! Chat persistence: sessions own messages, messages carry an optional
//! vector and a monotonic rank (their autoincrement rowid), and message
//! content is mirrored into an FTS5 table for content-level BM25 retrieval.
//! Deleting a session cascades to its messages and their mirror rows.
//!
//! [`Store::add_message`] is also the auto-retain trigger point: counted
//! roles accumulate per session, and when the configured threshold is
//! reached the memory subsystem extracts facts from the trailing window in
//! the background (see the memory module). Extraction failures never
//! surface here.

use std::collections::HashMap;

use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::vector::{decode_vector, encode_vector, validate_vector};

/// A conversation scope owning messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub user_id: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub created_at: i64,
}

/// One chat message. `rank` is monotonic within the session.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub rank: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub vector: Option<Vec<f32>>,
    pub created_at: i64,
}

impl Store {
    /// Create a session. Creating an existing id is an error.
    pub fn create_session(
        &self,
        id: &str,
        user_id: Option<&str>,
        metadata: HashMap<String, Value>,
    ) -> Result<Session> {
        const OP: &str = "create_session";
        self.check_open(OP)?;
        if id.is_empty() {
            return Err(Error::invalid_config(OP, "session id must not be empty"));
        }
        let created_at = Self::now();
        let meta_json = serde_json::to_string(&metadata)
            .map_err(|e| Error::invalid_config(OP, e.to_string()))?;
        self.with_conn(OP, |conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, metadata, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, user_id, meta_json, created_at],
            )
        })?;
        Ok(Session {
            id: id.to_string(),
            user_id: user_id.map(str::to_string),
            metadata,
            created_at,
        })
    }

    /// Fetch a session by id.
    pub fn get_session(&self, id: &str) -> Result<Session> {
        const OP: &str = "get_session";
        self.check_open(OP)?;
        let session = self.with_conn(OP, |conn| {
            conn.query_row(
                "SELECT id, user_id, metadata, created_at FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Session {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        metadata: serde_json::from_str(&row.get::<_, String>(2)?)
                            .unwrap_or_default(),
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
        })?;
        session.ok_or_else(|| Error::not_found(OP, id))
    }

    /// Delete a session; messages and their keyword-mirror rows go too.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        const OP: &str = "delete_session";
        self.check_open(OP)?;
        let deleted = self.with_txn(OP, |tx| {
            tx.execute(
                "DELETE FROM messages_fts WHERE rowid IN
                     (SELECT id FROM messages WHERE session_id = ?1)",
                params![id],
            )?;
            tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])
        })?;
        if deleted == 0 {
            return Err(Error::not_found(OP, id));
        }
        self.retain_counters.lock().remove(id);
        Ok(())
    }

    /// Append a message to a session, mirror it for keyword retrieval, and
    /// bump the auto-retain trigger.
    pub fn add_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        vector: Option<Vec<f32>>,
        cancel: &CancelToken,
    ) -> Result<ChatMessage> {
        const OP: &str = "add_message";
        self.check_open(OP)?;
        cancel.check(OP)?;
        if let Some(v) = &vector {
            validate_vector(OP, v)?;
        }
        // Verify the session exists before writing.
        self.get_session(session_id).map_err(|e| match e {
            Error::NotFound { .. } => Error::not_found(OP, session_id),
            other => other,
        })?;

        let created_at = Self::now();
        let blob = vector.as_ref().map(|v| encode_vector(v));
        let rank = self.with_txn(OP, |tx| {
            tx.execute(
                "INSERT INTO messages (session_id, role, content, vector, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, role, content, blob, created_at],
            )?;
            let rank = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO messages_fts (rowid, content) VALUES (?1, ?2)",
                params![rank, content],
            )?;
            Ok(rank)
        })?;

        self.bump_auto_retain(session_id, role);

        Ok(ChatMessage {
            rank,
            session_id: session_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            vector,
            created_at,
        })
    }

    /// The auto-retain counter: counted roles accumulate per session, and
    /// hitting the threshold fires a background extraction. Never fails.
    fn bump_auto_retain(&self, session_id: &str, role: &str) {
        let config = &self.config.auto_retain;
        if !config.enabled || !config.roles.iter().any(|r| r == role) {
            return;
        }
        let fire = {
            let mut counters = self.retain_counters.lock();
            let counter = counters.entry(session_id.to_string()).or_insert(0);
            *counter += 1;
            if *counter >= config.trigger_every {
                *counter = 0;
                true
            } else {
                false
            }
        };
        if fire {
            // The extraction task needs its own handle to the store.
            if let Some(shared) = self.shared() {
                crate::memory::spawn_auto_retain(&shared, session_id.to_string());
            }
        }
    }

    /// Messages of a session in rank order; `limit` of 0 returns all.
    pub fn list_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        const OP: &str = "list_messages";
        self.check_open(OP)?;
        let sql = if limit > 0 {
            // Trailing window, restored to ascending rank.
            "SELECT * FROM (
                 SELECT id, session_id, role, content, vector, created_at
                 FROM messages WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id"
        } else {
            "SELECT id, session_id, role, content, vector, created_at
             FROM messages WHERE session_id = ?1 AND ?2 >= 0 ORDER BY id"
        };
        self.with_conn(OP, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![session_id, limit as i64], row_to_message)?;
            rows.collect()
        })
    }

    /// BM25 search over message content, optionally scoped to a session.
    /// Scores are normalized like the record keyword channel.
    pub fn search_messages(
        &self,
        session_id: Option<&str>,
        text: &str,
        limit: usize,
    ) -> Result<Vec<(ChatMessage, f32)>> {
        const OP: &str = "search_messages";
        self.check_open(OP)?;
        let match_expr = crate::store::fts_match_expr(text);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(OP, |conn| {
            let sql = "SELECT m.id, m.session_id, m.role, m.content, m.vector, m.created_at,
                              bm25(messages_fts)
                       FROM messages_fts f
                       JOIN messages m ON m.id = f.rowid
                       WHERE messages_fts MATCH ?1
                         AND (?2 IS NULL OR m.session_id = ?2)
                       ORDER BY bm25(messages_fts) LIMIT ?3";
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![match_expr, session_id, limit as i64], |row| {
                let message = row_to_message(row)?;
                let bm25: f64 = row.get(6)?;
                Ok((message, 1.0 / (1.0 + (-bm25).max(0.0)) as f32))
            })?;
            rows.collect()
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let blob: Option<Vec<u8>> = row.get(4)?;
    let vector = match blob {
        Some(b) => Some(decode_vector("list_messages", &b).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Blob, Box::new(e))
        })?),
        None => None,
    };
    Ok(ChatMessage {
        rank: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        vector,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use std::sync::Arc;

    fn store() -> Arc<Store> {
        let mut config = StoreConfig::new(":memory:");
        config.rng_seed = Some(9);
        Store::open_in_memory(config).unwrap()
    }

    #[test]
    fn test_session_and_message_roundtrip() {
        let store = store();
        let cancel = CancelToken::new();
        store.create_session("s1", Some("u1"), HashMap::new()).unwrap();
        assert!(store.create_session("s1", None, HashMap::new()).is_err());

        let m1 = store
            .add_message("s1", "user", "hello there", None, &cancel)
            .unwrap();
        let m2 = store
            .add_message("s1", "assistant", "hi!", Some(vec![0.1, 0.2]), &cancel)
            .unwrap();
        assert!(m2.rank > m1.rank);

        let messages = store.list_messages("s1", 0).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello there");
        assert_eq!(messages[1].vector, Some(vec![0.1, 0.2]));
    }

    #[test]
    fn test_message_to_unknown_session_fails() {
        let store = store();
        let err = store
            .add_message("ghost", "user", "hi", None, &CancelToken::new())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_session_cascades() {
        let store = store();
        let cancel = CancelToken::new();
        store.create_session("s1", None, HashMap::new()).unwrap();
        store.add_message("s1", "user", "findable words", None, &cancel).unwrap();
        store.delete_session("s1").unwrap();

        assert!(store.get_session("s1").unwrap_err().is_not_found());
        assert!(store.list_messages("s1", 0).unwrap().is_empty());
        assert!(store.search_messages(None, "findable", 10).unwrap().is_empty());
    }

    #[test]
    fn test_search_messages_scoped_to_session() {
        let store = store();
        let cancel = CancelToken::new();
        for sid in ["s1", "s2"] {
            store.create_session(sid, None, HashMap::new()).unwrap();
            store
                .add_message(sid, "user", &format!("topic alpha in {sid}"), None, &cancel)
                .unwrap();
        }
        let all = store.search_messages(None, "alpha", 10).unwrap();
        assert_eq!(all.len(), 2);
        let scoped = store.search_messages(Some("s1"), "alpha", 10).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].0.session_id, "s1");
        assert!(scoped[0].1 > 0.0 && scoped[0].1 <= 1.0);
    }

    #[test]
    fn test_trailing_window_limit() {
        let store = store();
        let cancel = CancelToken::new();
        store.create_session("s1", None, HashMap::new()).unwrap();
        for i in 0..5 {
            store
                .add_message("s1", "user", &format!("m{i}"), None, &cancel)
                .unwrap();
        }
        let tail = store.list_messages("s1", 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m3");
        assert_eq!(tail[1].content, "m4");
    }
}
