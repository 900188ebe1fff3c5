// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session memory: a KV map and the chat history, with write-behind
//! persistence.
//!
//! The in-memory view is authoritative for the session's lifetime;
//! persistence is best-effort durability, not correctness.  Values returned
//! to callers are clones so concurrent readers in the same session never
//! share mutable collections.

mod manager;
mod store;

pub use manager::{HistoryEntry, MemoryManager};
pub use store::{MemoryStore, SqliteStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory store fault: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        MemoryError::Store(e.to_string())
    }
}
