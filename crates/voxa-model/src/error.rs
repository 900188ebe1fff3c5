// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Upstream fault classification.
///
/// The orchestrator's recovery policy keys off the kind, not the payload:
/// `Transient` is retried with backoff, `Fatal` ends the turn with the fixed
/// apology, `Cancelled` is silent (barge-in, shutdown).
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection faults, 5xx, rate-limits — worth retrying.
    #[error("transient upstream fault: {0}")]
    Transient(String),
    /// Auth failure, schema incompatibility, quota exhausted — retrying is
    /// pointless.
    #[error("fatal upstream fault: {0}")]
    Fatal(String),
    /// Internal cancellation; never surfaced to the caller as a failure.
    #[error("cancelled")]
    Cancelled,
}

impl UpstreamError {
    /// Classify an HTTP status + body into the taxonomy.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 | 500..=599 => Self::Transient(format!("status {status}: {body}")),
            401 | 403 => Self::Fatal(format!("auth rejected ({status}): {body}")),
            _ => Self::Fatal(format!("status {status}: {body}")),
        }
    }

    /// Connection-level reqwest faults are transient; everything else that
    /// reaches this path (body decode, invalid request) is fatal.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
