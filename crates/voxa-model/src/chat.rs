// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming chat-completions client.
//!
//! Speaks the `/chat/completions` SSE wire format: text deltas and structured
//! tool-call fragments arrive interleaved, terminated by `data: [DONE]`.
//! SSE events can be split across TCP packets, so a line buffer is kept
//! across chunks and only complete lines are parsed.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    client::ResponseStream, CompletionRequest, LlmClient, Message, MessageContent, ResponseEvent,
    Role, UpstreamError,
};

pub struct ChatCompletionsClient {
    chat_url: String,
    deployment: String,
    api_key: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl ChatCompletionsClient {
    pub fn new(
        base_url: &str,
        deployment: String,
        api_key: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            chat_url: format!("{base}/chat/completions"),
            deployment,
            api_key,
            max_tokens,
            temperature,
            client: reqwest::Client::new(),
        }
    }

    /// Override the deployment for a single agent's model prefs.
    pub fn with_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = deployment.into();
        self
    }
}

#[async_trait]
impl LlmClient for ChatCompletionsClient {
    fn name(&self) -> &str {
        "chat"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, UpstreamError> {
        // The chat endpoint has no native additional-instructions channel:
        // splice the payload in as a trailing system message so it applies to
        // this turn only and never replaces the agent's system prompt.
        let mut messages = req.messages.clone();
        if let Some(extra) = &req.additional_instructions {
            messages.push(Message::system(extra.clone()));
        }
        let wire_messages = build_wire_messages(&messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.deployment,
            "messages": wire_messages,
            "stream": req.stream,
            "stream_options": { "include_usage": true },
        });
        if let Some(mt) = self.max_tokens {
            body["max_tokens"] = json!(mt);
        }
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            deployment = %self.deployment,
            tool_count = tools.len(),
            message_count = wire_messages.len(),
            "sending chat completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req.send().await.map_err(UpstreamError::from_transport)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, &text));
        }

        let byte_stream = resp.bytes_stream();
        // Maintain a line buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<ResponseEvent, UpstreamError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(UpstreamError::Transient(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Serialize the conversation window into the chat wire shape, including
/// the assistant tool-call / tool-result pairing the API requires.
fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(t) => json!({ "role": role_str(m.role), "content": t }),
            MessageContent::ToolCall { tool_call_id, function } => json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": [{
                    "id": tool_call_id,
                    "type": "function",
                    "function": {
                        "name": function.name,
                        "arguments": function.arguments,
                    }
                }]
            }),
            MessageContent::ToolResult { tool_call_id, content } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }),
        })
        .collect()
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
fn drain_complete_sse_lines(buf: &mut String) -> Vec<Result<ResponseEvent, UpstreamError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<Result<ResponseEvent, UpstreamError>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v)
}

fn parse_sse_chunk(v: &Value) -> Option<Result<ResponseEvent, UpstreamError>> {
    // Usage-only chunks have an empty choices array.
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        if v["choices"].as_array().map(|c| c.is_empty()).unwrap_or(true) {
            return Some(Ok(ResponseEvent::Usage {
                input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            }));
        }
    }

    let delta = &v["choices"][0]["delta"];
    if let Some(tcs) = delta["tool_calls"].as_array() {
        let tc = tcs.first()?;
        return Some(Ok(ResponseEvent::ToolCall {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
        }));
    }
    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            return Some(Ok(ResponseEvent::TextDelta(text.to_string())));
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
