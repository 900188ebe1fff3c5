// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{client::ResponseStream, CompletionRequest, LlmClient, ResponseEvent, UpstreamError};

/// A pre-scripted LLM for tests.  Each call to `complete` pops the next
/// response script from the front of the queue, so tests can specify exact
/// event sequences — including tool calls — without network access.
///
/// Every request is recorded so tests can inspect what the orchestrator
/// actually sent (prompt contents, additional instructions, tool schemas).
pub struct ScriptedLlm {
    scripts: Mutex<Vec<Vec<ResponseEvent>>>,
    /// Number of leading `complete` calls that fail with a transient fault
    /// before any script is served.  Used by retry tests.
    fail_first: Mutex<u32>,
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedLlm {
    /// Build from an ordered list of per-call event scripts.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            fail_first: Mutex::new(0),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: always reply with a single text message.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            ResponseEvent::TextDelta(reply.into()),
            ResponseEvent::Done,
        ]])
    }

    /// Convenience: one tool call, then (after the tool result comes back)
    /// a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Done,
            ],
            vec![ResponseEvent::TextDelta(final_text.into()), ResponseEvent::Done],
        ])
    }

    /// Fail the first `n` calls with a transient fault before serving scripts.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = Mutex::new(n);
        self
    }

    /// The most recent request seen, if any.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    /// Number of `complete` calls observed (including failed ones).
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, UpstreamError> {
        self.requests.lock().unwrap().push(req);

        {
            let mut fails = self.fail_first.lock().unwrap();
            if *fails > 0 {
                *fails -= 1;
                return Err(UpstreamError::Transient("scripted transient fault".into()));
            }
        }

        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Done,
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<ResponseEvent, UpstreamError>> =
            events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::Message;

    fn req() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("hi")],
            stream: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scripted_single_text_reply() {
        let p = ScriptedLlm::always_text("hello world");
        let mut stream = p.complete(req()).await.unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "hello world"));
    }

    #[tokio::test]
    async fn scripted_tool_then_text_two_rounds() {
        let p = ScriptedLlm::tool_then_text("call-1", "get_balance", "{}", "done");

        let mut events = Vec::new();
        let mut stream = p.complete(req()).await.unwrap();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, ResponseEvent::ToolCall { name, .. } if name == "get_balance")));

        let mut events2 = Vec::new();
        let mut stream2 = p.complete(req()).await.unwrap();
        while let Some(ev) = stream2.next().await {
            events2.push(ev.unwrap());
        }
        assert!(events2
            .iter()
            .any(|e| matches!(e, ResponseEvent::TextDelta(t) if t == "done")));
    }

    #[tokio::test]
    async fn scripted_records_requests() {
        let p = ScriptedLlm::always_text("ok");
        let mut r = req();
        r.additional_instructions = Some("carried context".into());
        let _ = p.complete(r).await.unwrap();
        let last = p.last_request().unwrap();
        assert_eq!(last.additional_instructions.as_deref(), Some("carried context"));
        assert_eq!(p.call_count(), 1);
    }

    #[tokio::test]
    async fn scripted_failing_first_emits_transient_errors() {
        let p = ScriptedLlm::always_text("recovered").failing_first(2);
        assert!(p.complete(req()).await.is_err());
        assert!(p.complete(req()).await.is_err());
        let mut stream = p.complete(req()).await.unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "recovered"));
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let p = ScriptedLlm::new(vec![]);
        let mut stream = p.complete(req()).await.unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t.contains("no more scripts")));
    }
}
