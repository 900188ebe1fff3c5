// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use voxa_pool::PoolError;

/// Session-level faults.  Turn-level recovery (retries, tool errors,
/// apologies) happens inside the orchestrator; what escapes here terminates
/// the session cleanly, never the process.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Pool exhausted at session connect; the session is rejected with a
    /// client-visible code.
    #[error("session rejected: {0}")]
    PoolExhausted(#[from] PoolError),
    /// The peer disconnected mid-turn.
    #[error("transport closed")]
    TransportClosed,
    /// Unrecoverable upstream/internal fault.
    #[error("session failed: {0}")]
    Fatal(String),
    /// Internal cancellation (shutdown); silent — not an error in logs.
    #[error("cancelled")]
    Cancelled,
}

impl SessionError {
    /// Client-visible rejection code for the connect reply.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::PoolExhausted(_) => "pool_exhausted",
            SessionError::TransportClosed => "transport_closed",
            SessionError::Fatal(_) => "internal_error",
            SessionError::Cancelled => "cancelled",
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_maps_to_client_code() {
        let e = SessionError::PoolExhausted(PoolError::Exhausted { pool: "llm".into() });
        assert_eq!(e.code(), "pool_exhausted");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(SessionError::TransportClosed.code(), "transport_closed");
        assert_eq!(SessionError::Fatal("x".into()).code(), "internal_error");
        assert_eq!(SessionError::Cancelled.code(), "cancelled");
    }
}
