// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod chat;
mod client;
mod error;
mod mock;
mod responses;
pub mod retry;
mod types;

pub use chat::ChatCompletionsClient;
pub use client::{select_endpoint, Endpoint, EndpointPreference, LlmClient, ResponseStream};
pub use error::UpstreamError;
pub use mock::ScriptedLlm;
pub use responses::ResponsesClient;
pub use types::*;

use std::sync::Arc;

use voxa_config::LlmConfig;

/// Construct the chat and responses clients from configuration.
///
/// Both clients share the credential resolution; the responses endpoint
/// falls back to the chat base URL when not configured separately.
pub fn clients_from_config(
    cfg: &LlmConfig,
) -> anyhow::Result<(Arc<dyn LlmClient>, Arc<dyn LlmClient>)> {
    let key = resolve_api_key(cfg);
    let chat: Arc<dyn LlmClient> = Arc::new(ChatCompletionsClient::new(
        &cfg.base_url,
        cfg.deployment.clone(),
        key.clone(),
        cfg.max_tokens,
        cfg.temperature,
    ));
    let responses_base = cfg.responses_base_url.as_deref().unwrap_or(&cfg.base_url);
    let responses: Arc<dyn LlmClient> = Arc::new(ResponsesClient::new(
        responses_base,
        cfg.deployment.clone(),
        key,
        cfg.max_tokens,
    ));
    Ok((chat, responses))
}

fn resolve_api_key(cfg: &LlmConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
