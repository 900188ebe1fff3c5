// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Responses-endpoint client.
//!
//! The second LLM endpoint shape: non-streaming, stateful.  The server keeps
//! the conversation under a `conversation` id, so a request carries only the
//! new input plus optional `additional_instructions` applied on top of the
//! standing system prompt.  The reply is adapted into the same
//! [`ResponseEvent`] stream the chat endpoint produces so the orchestrator
//! consumes both shapes identically.

use async_trait::async_trait;
use futures::stream;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    client::ResponseStream, CompletionRequest, LlmClient, MessageContent, ResponseEvent, Role,
    UpstreamError,
};

pub struct ResponsesClient {
    url: String,
    deployment: String,
    api_key: Option<String>,
    max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl ResponsesClient {
    pub fn new(
        base_url: &str,
        deployment: String,
        api_key: Option<String>,
        max_tokens: Option<u32>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            url: format!("{base}/responses"),
            deployment,
            api_key,
            max_tokens,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmClient for ResponsesClient {
    fn name(&self) -> &str {
        "responses"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, UpstreamError> {
        // With a conversation id only the latest user input travels; without
        // one the whole window is sent to seed the server-side conversation.
        let input: Vec<Value> = if req.conversation_id.is_some() {
            req.messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(wire_item)
                .into_iter()
                .collect()
        } else {
            req.messages.iter().map(wire_item).collect()
        };

        let mut body = json!({
            "model": self.deployment,
            "input": input,
        });
        if let Some(cid) = &req.conversation_id {
            body["conversation"] = json!(cid);
        }
        if let Some(extra) = &req.additional_instructions {
            body["additional_instructions"] = json!(extra);
        }
        if let Some(mt) = self.max_tokens {
            body["max_output_tokens"] = json!(mt);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        debug!(
            deployment = %self.deployment,
            continued = req.conversation_id.is_some(),
            "sending responses request"
        );

        let mut http_req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req.send().await.map_err(UpstreamError::from_transport)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, &text));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Fatal(format!("responses body decode: {e}")))?;

        Ok(Box::pin(stream::iter(parse_response_body(&v))))
    }
}

fn wire_item(m: &crate::Message) -> Value {
    match &m.content {
        MessageContent::Text(t) => json!({ "role": m.role.to_string(), "content": t }),
        MessageContent::ToolCall { tool_call_id, function } => json!({
            "type": "function_call",
            "call_id": tool_call_id,
            "name": function.name,
            "arguments": function.arguments,
        }),
        MessageContent::ToolResult { tool_call_id, content } => json!({
            "type": "function_call_output",
            "call_id": tool_call_id,
            "output": content,
        }),
    }
}

/// Adapt one completed response body into the streamed event shape.
fn parse_response_body(v: &Value) -> Vec<Result<ResponseEvent, UpstreamError>> {
    let mut events = Vec::new();
    if let Some(items) = v["output"].as_array() {
        for (i, item) in items.iter().enumerate() {
            match item["type"].as_str() {
                Some("message") => {
                    if let Some(parts) = item["content"].as_array() {
                        for part in parts {
                            if let Some(text) = part["text"].as_str() {
                                events.push(Ok(ResponseEvent::TextDelta(text.to_string())));
                            }
                        }
                    }
                }
                Some("function_call") => {
                    events.push(Ok(ResponseEvent::ToolCall {
                        index: i as u32,
                        id: item["call_id"].as_str().unwrap_or("").to_string(),
                        name: item["name"].as_str().unwrap_or("").to_string(),
                        arguments: item["arguments"].as_str().unwrap_or("{}").to_string(),
                    }));
                }
                _ => {}
            }
        }
    }
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        events.push(Ok(ResponseEvent::Usage {
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
        }));
    }
    events.push(Ok(ResponseEvent::Done));
    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    #[test]
    fn wire_item_text_message() {
        let v = wire_item(&Message::user("hello"));
        assert_eq!(v["role"], "user");
        assert_eq!(v["content"], "hello");
    }

    #[test]
    fn wire_item_function_call_output() {
        let v = wire_item(&Message::tool_result("c3", r#"{"ok":false,"error":"timeout"}"#));
        assert_eq!(v["type"], "function_call_output");
        assert_eq!(v["call_id"], "c3");
    }

    #[test]
    fn parse_body_message_and_usage() {
        let body = json!({
            "output": [
                { "type": "message", "content": [ { "type": "output_text", "text": "hi there" } ] }
            ],
            "usage": { "input_tokens": 7, "output_tokens": 2 }
        });
        let events = parse_response_body(&body);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            ResponseEvent::TextDelta(t) if t == "hi there"
        ));
        assert!(matches!(
            events[1].as_ref().unwrap(),
            ResponseEvent::Usage { input_tokens: 7, output_tokens: 2 }
        ));
        assert!(matches!(events.last().unwrap().as_ref().unwrap(), ResponseEvent::Done));
    }

    #[test]
    fn parse_body_function_call() {
        let body = json!({
            "output": [
                { "type": "function_call", "call_id": "c1", "name": "lookup", "arguments": "{}" }
            ]
        });
        let events = parse_response_body(&body);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            ResponseEvent::ToolCall { name, .. } if name == "lookup"
        ));
    }

    #[test]
    fn parse_body_empty_output_still_ends_with_done() {
        let events = parse_response_body(&json!({}));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].as_ref().unwrap(), ResponseEvent::Done));
    }
}
