// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{MemoryError, MemoryStore};

/// One row of the append-only conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub agent: String,
    /// "user" | "assistant" | "tool"
    pub role: String,
    pub content: String,
    pub ts: DateTime<Utc>,
}

struct Inner {
    kv: HashMap<String, Value>,
    dirty: HashSet<String>,
    /// Append-only conversation log across all agents.  Bounded windows for
    /// prompt construction are computed per agent; this log itself is never
    /// truncated in-session.
    log: Vec<HistoryEntry>,
    /// Index of the first log row not yet persisted.
    flushed_to: usize,
    /// Agents that have been active at least once this session.
    visited: HashSet<String>,
}

/// Session-scoped memory shared between the session handler and the
/// orchestrator.  Cloning shares the same underlying state.
#[derive(Clone)]
pub struct MemoryManager {
    session_id: String,
    window: usize,
    inner: Arc<Mutex<Inner>>,
    store: Option<Arc<dyn MemoryStore>>,
}

impl MemoryManager {
    pub fn new(session_id: impl Into<String>, window: usize) -> Self {
        Self {
            session_id: session_id.into(),
            window,
            inner: Arc::new(Mutex::new(Inner {
                kv: HashMap::new(),
                dirty: HashSet::new(),
                log: Vec::new(),
                flushed_to: 0,
                visited: HashSet::new(),
            })),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ── KV ───────────────────────────────────────────────────────────────────

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap();
        inner.dirty.insert(key.clone());
        inner.kv.insert(key, value);
    }

    /// Copy-on-read: the caller owns the returned value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().kv.get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().unwrap();
        inner.dirty.insert(key.to_string());
        inner.kv.remove(key)
    }

    // ── History ──────────────────────────────────────────────────────────────

    pub fn append_history(
        &self,
        agent: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
    ) {
        let entry = HistoryEntry {
            agent: agent.into(),
            role: role.into(),
            content: content.into(),
            ts: Utc::now(),
        };
        self.inner.lock().unwrap().log.push(entry);
    }

    /// The last `window` entries for one agent, oldest first.
    pub fn history_window(&self, agent: &str) -> Vec<HistoryEntry> {
        let inner = self.inner.lock().unwrap();
        let matching: Vec<&HistoryEntry> =
            inner.log.iter().filter(|e| e.agent == agent).collect();
        let skip = matching.len().saturating_sub(self.window);
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// The entire session log, all agents, append order.
    pub fn full_history(&self) -> Vec<HistoryEntry> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn history_len(&self) -> usize {
        self.inner.lock().unwrap().log.len()
    }

    // ── Visit tracking ───────────────────────────────────────────────────────

    pub fn mark_visited(&self, agent: &str) {
        self.inner.lock().unwrap().visited.insert(agent.to_string());
    }

    pub fn visited(&self, agent: &str) -> bool {
        self.inner.lock().unwrap().visited.contains(agent)
    }

    // ── Write-behind ─────────────────────────────────────────────────────────

    /// Flush dirty KV entries and unpersisted history rows to the store.
    /// A no-op without a store.
    pub async fn flush(&self) -> Result<(), MemoryError> {
        let store = match &self.store {
            Some(s) => Arc::clone(s),
            None => return Ok(()),
        };

        // Snapshot under the lock, write outside it.
        let (kv_batch, history_batch, new_watermark) = {
            let mut inner = self.inner.lock().unwrap();
            let kv_batch: Vec<(String, Option<Value>)> = inner
                .dirty
                .iter()
                .map(|k| (k.clone(), inner.kv.get(k).cloned()))
                .collect();
            inner.dirty.clear();
            let history_batch: Vec<HistoryEntry> =
                inner.log[inner.flushed_to..].to_vec();
            let new_watermark = inner.log.len();
            (kv_batch, history_batch, new_watermark)
        };

        if kv_batch.is_empty() && history_batch.is_empty() {
            return Ok(());
        }

        let session = self.session_id.clone();
        let result = tokio::task::spawn_blocking(move || {
            for (key, value) in &kv_batch {
                store.put_kv(&session, key, value.as_ref())?;
            }
            if !history_batch.is_empty() {
                store.append_history(&session, &history_batch)?;
            }
            Ok::<_, MemoryError>(())
        })
        .await
        .map_err(|e| MemoryError::Store(format!("flush task failed: {e}")))?;

        match result {
            Ok(()) => {
                self.inner.lock().unwrap().flushed_to = new_watermark;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Flush with a deadline: on timeout the in-memory state is still correct
    /// for downstream reads, so the error is logged and swallowed.
    pub async fn final_flush(&self, deadline: Duration) {
        match tokio::time::timeout(deadline, self.flush()).await {
            Ok(Ok(())) => debug!(session_id = %self.session_id, "final memory flush complete"),
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "final memory flush failed")
            }
            Err(_) => {
                warn!(session_id = %self.session_id, "final memory flush timed out")
            }
        }
    }

    /// Start the write-behind loop.  Flushes every `interval` until the
    /// returned handle is aborted (session end runs `final_flush` instead).
    pub fn spawn_flusher(&self, interval: Duration) -> JoinHandle<()> {
        let mgr = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(e) = mgr.flush().await {
                    warn!(session_id = %mgr.session_id, error = %e, "write-behind flush failed");
                }
            }
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteStore;
    use serde_json::json;

    #[test]
    fn set_then_get_returns_value() {
        let m = MemoryManager::new("s1", 64);
        m.set("caller_name", json!("Ada"));
        assert_eq!(m.get("caller_name"), Some(json!("Ada")));
    }

    #[test]
    fn get_returns_a_clone() {
        let m = MemoryManager::new("s1", 64);
        m.set("k", json!({ "a": 1 }));
        let mut v = m.get("k").unwrap();
        v["a"] = json!(2);
        assert_eq!(m.get("k").unwrap()["a"], json!(1), "reader mutation must not leak back");
    }

    #[test]
    fn remove_deletes_key() {
        let m = MemoryManager::new("s1", 64);
        m.set("k", json!(1));
        assert_eq!(m.remove("k"), Some(json!(1)));
        assert!(m.get("k").is_none());
    }

    #[test]
    fn history_appends_in_order() {
        let m = MemoryManager::new("s1", 64);
        m.append_history("A", "user", "one");
        m.append_history("A", "assistant", "two");
        m.append_history("B", "user", "three");
        let all = m.full_history();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].content, "one");
        assert_eq!(all[2].agent, "B");
    }

    #[test]
    fn history_window_is_bounded_per_agent() {
        let m = MemoryManager::new("s1", 3);
        for i in 0..10 {
            m.append_history("A", "user", format!("a{i}"));
            m.append_history("B", "user", format!("b{i}"));
        }
        let w = m.history_window("A");
        assert_eq!(w.len(), 3);
        assert_eq!(w[0].content, "a7");
        assert_eq!(w[2].content, "a9");
        // The full log retains everything.
        assert_eq!(m.history_len(), 20);
    }

    #[test]
    fn visited_tracking() {
        let m = MemoryManager::new("s1", 64);
        assert!(!m.visited("FraudAgent"));
        m.mark_visited("FraudAgent");
        assert!(m.visited("FraudAgent"));
    }

    #[tokio::test]
    async fn flush_without_store_is_noop() {
        let m = MemoryManager::new("s1", 64);
        m.set("k", json!(1));
        m.flush().await.unwrap();
    }

    #[tokio::test]
    async fn set_flush_read_back_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(tmp.path().join("mem.db")).unwrap());
        let m = MemoryManager::new("s1", 64).with_store(Arc::clone(&store) as _);
        m.set("k", json!({ "v": 7 }));
        m.append_history("A", "user", "hello");
        m.flush().await.unwrap();

        assert_eq!(store.read_kv("s1", "k").unwrap(), Some(json!({ "v": 7 })));
        assert_eq!(store.history_count("s1").unwrap(), 1);
    }

    #[tokio::test]
    async fn flush_is_incremental() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(tmp.path().join("mem.db")).unwrap());
        let m = MemoryManager::new("s1", 64).with_store(Arc::clone(&store) as _);
        m.append_history("A", "user", "one");
        m.flush().await.unwrap();
        m.append_history("A", "user", "two");
        m.flush().await.unwrap();
        // Two rows total, not three: the first row is not re-written.
        assert_eq!(store.history_count("s1").unwrap(), 2);
    }

    #[tokio::test]
    async fn removed_key_is_deleted_from_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(tmp.path().join("mem.db")).unwrap());
        let m = MemoryManager::new("s1", 64).with_store(Arc::clone(&store) as _);
        m.set("k", json!(1));
        m.flush().await.unwrap();
        m.remove("k");
        m.flush().await.unwrap();
        assert_eq!(store.read_kv("s1", "k").unwrap(), None);
    }

    #[tokio::test]
    async fn final_flush_swallows_timeout() {
        let m = MemoryManager::new("s1", 64);
        // No store, instant flush; just exercise the deadline path.
        m.final_flush(Duration::from_millis(10)).await;
    }
}
