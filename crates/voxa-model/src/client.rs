// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::{CompletionRequest, ResponseEvent, UpstreamError};

pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<ResponseEvent, UpstreamError>> + Send>>;

/// One LLM endpoint the orchestrator can drive a turn against.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Endpoint shape identifier ("chat" | "responses" | test doubles).
    fn name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, UpstreamError>;
}

/// Which endpoint shape a turn is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Chat,
    Responses,
}

/// Per-agent endpoint preference from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointPreference {
    Chat,
    Responses,
    #[default]
    Auto,
}

/// Resolve the endpoint for a turn.  An explicit preference always wins;
/// `Auto` uses chat for streaming turns and the responses endpoint for
/// non-streaming reasoning turns.
pub fn select_endpoint(pref: EndpointPreference, streaming: bool) -> Endpoint {
    match pref {
        EndpointPreference::Chat => Endpoint::Chat,
        EndpointPreference::Responses => Endpoint::Responses,
        EndpointPreference::Auto => {
            if streaming {
                Endpoint::Chat
            } else {
                Endpoint::Responses
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_chat_wins_even_for_non_streaming() {
        assert_eq!(select_endpoint(EndpointPreference::Chat, false), Endpoint::Chat);
    }

    #[test]
    fn explicit_responses_wins_even_for_streaming() {
        assert_eq!(
            select_endpoint(EndpointPreference::Responses, true),
            Endpoint::Responses
        );
    }

    #[test]
    fn auto_streaming_uses_chat() {
        assert_eq!(select_endpoint(EndpointPreference::Auto, true), Endpoint::Chat);
    }

    #[test]
    fn auto_non_streaming_uses_responses() {
        assert_eq!(
            select_endpoint(EndpointPreference::Auto, false),
            Endpoint::Responses
        );
    }

    #[test]
    fn endpoint_preference_yaml_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wrap {
            pref: EndpointPreference,
        }
        let w = Wrap { pref: EndpointPreference::Responses };
        let s = serde_json::to_string(&w).unwrap();
        assert!(s.contains("responses"));
        let back: Wrap = serde_json::from_str(&s).unwrap();
        assert_eq!(back.pref, EndpointPreference::Responses);
    }
}
