// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use serde_json::Value;

use crate::{HistoryEntry, MemoryError};

/// Persistence backend for session memory.  Calls are synchronous; the
/// manager runs them on the blocking pool.
pub trait MemoryStore: Send + Sync {
    /// Upsert one KV entry; `None` deletes the key.
    fn put_kv(&self, session: &str, key: &str, value: Option<&Value>) -> Result<(), MemoryError>;
    /// Append rows to the audit log.  Rows are never updated or deleted.
    fn append_history(&self, session: &str, rows: &[HistoryEntry]) -> Result<(), MemoryError>;
}

/// SQLite-backed store: one KV table and one append-only history table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, MemoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, MemoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                 session TEXT NOT NULL,
                 key     TEXT NOT NULL,
                 value   TEXT NOT NULL,
                 PRIMARY KEY (session, key)
             );
             CREATE TABLE IF NOT EXISTS history (
                 id      INTEGER PRIMARY KEY AUTOINCREMENT,
                 session TEXT NOT NULL,
                 agent   TEXT NOT NULL,
                 role    TEXT NOT NULL,
                 content TEXT NOT NULL,
                 ts      TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_history_session ON history(session);",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Read one KV value back (audit / tests).
    pub fn read_kv(&self, session: &str, key: &str) -> Result<Option<Value>, MemoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE session = ?1 AND key = ?2")?;
        let mut rows = stmt.query(params![session, key])?;
        match rows.next()? {
            Some(row) => {
                let text: String = row.get(0)?;
                serde_json::from_str(&text)
                    .map(Some)
                    .map_err(|e| MemoryError::Store(format!("corrupt kv json: {e}")))
            }
            None => Ok(None),
        }
    }

    pub fn history_count(&self, session: &str) -> Result<u64, MemoryError> {
        let conn = self.conn.lock().unwrap();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM history WHERE session = ?1",
            params![session],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl MemoryStore for SqliteStore {
    fn put_kv(&self, session: &str, key: &str, value: Option<&Value>) -> Result<(), MemoryError> {
        let conn = self.conn.lock().unwrap();
        match value {
            Some(v) => {
                conn.execute(
                    "INSERT INTO kv (session, key, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(session, key) DO UPDATE SET value = excluded.value",
                    params![session, key, v.to_string()],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM kv WHERE session = ?1 AND key = ?2",
                    params![session, key],
                )?;
            }
        }
        Ok(())
    }

    fn append_history(&self, session: &str, rows: &[HistoryEntry]) -> Result<(), MemoryError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO history (session, agent, role, content, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                stmt.execute(params![
                    session,
                    row.agent,
                    row.role,
                    row.content,
                    row.ts.to_rfc3339()
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn entry(content: &str) -> HistoryEntry {
        HistoryEntry {
            agent: "A".into(),
            role: "user".into(),
            content: content.into(),
            ts: Utc::now(),
        }
    }

    #[test]
    fn kv_upsert_and_read_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_kv("s1", "k", Some(&json!({ "x": 1 }))).unwrap();
        assert_eq!(store.read_kv("s1", "k").unwrap(), Some(json!({ "x": 1 })));
        store.put_kv("s1", "k", Some(&json!(2))).unwrap();
        assert_eq!(store.read_kv("s1", "k").unwrap(), Some(json!(2)));
    }

    #[test]
    fn kv_delete_via_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_kv("s1", "k", Some(&json!(1))).unwrap();
        store.put_kv("s1", "k", None).unwrap();
        assert_eq!(store.read_kv("s1", "k").unwrap(), None);
    }

    #[test]
    fn kv_isolated_per_session() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_kv("s1", "k", Some(&json!("one"))).unwrap();
        store.put_kv("s2", "k", Some(&json!("two"))).unwrap();
        assert_eq!(store.read_kv("s1", "k").unwrap(), Some(json!("one")));
        assert_eq!(store.read_kv("s2", "k").unwrap(), Some(json!("two")));
    }

    #[test]
    fn history_appends_batch() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .append_history("s1", &[entry("a"), entry("b"), entry("c")])
            .unwrap();
        assert_eq!(store.history_count("s1").unwrap(), 3);
        assert_eq!(store.history_count("other").unwrap(), 0);
    }

    #[test]
    fn open_on_disk_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("mem.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put_kv("s1", "k", Some(&json!(42))).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.read_kv("s1", "k").unwrap(), Some(json!(42)));
    }
}
