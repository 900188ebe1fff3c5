// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::warn;

use crate::{Tool, ToolCall, ToolCtx, ToolOutcome, ToolResult};

/// A tool schema projected for the model — mirrors the model crate's shape
/// but keeps this crate independent from it.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Builder phase of the registry: tools are registered once at startup.
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    pub fn register_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    /// Freeze into the read-only runtime registry.
    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

/// Central read-only registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Project schemas for an agent's declared tool list, preserving the
    /// agent's declaration order.  Unknown names are skipped with a warning —
    /// a misconfigured agent must not take the session down.
    pub fn schemas_for(&self, tool_names: &[String]) -> Vec<ToolSchema> {
        tool_names
            .iter()
            .filter_map(|name| match self.tools.get(name) {
                Some(t) => Some(ToolSchema {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: t.parameters_schema(),
                }),
                None => {
                    warn!(tool = %name, "agent references unregistered tool; skipping");
                    None
                }
            })
            .collect()
    }

    /// Execute one call with a deadline.
    ///
    /// All failure paths produce a structured result the model can read:
    /// unknown tool, executor fault, and deadline exceeded.  On timeout the
    /// executor task is orphaned — its cancellation token is fired and its
    /// eventual result discarded.
    pub async fn execute(
        &self,
        call: &ToolCall,
        ctx: &ToolCtx,
        default_deadline: Duration,
    ) -> ToolResult {
        let tool = match self.tools.get(&call.name) {
            Some(t) => Arc::clone(t),
            None => {
                warn!(session_id = %ctx.session_id, tool = %call.name, "unknown tool");
                return ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    json: json!({
                        "ok": false,
                        "error": "unknown_tool",
                        "message": format!("no tool named {:?} is registered", call.name),
                    }),
                    is_error: true,
                };
            }
        };

        let deadline = tool.deadline().unwrap_or(default_deadline);
        let call_owned = call.clone();
        let ctx_owned = ctx.clone();
        // Executors run in their own task so a panic is contained and a
        // laggard can be left behind after the deadline.
        let handle =
            tokio::spawn(async move { tool.execute(&call_owned, &ctx_owned).await });

        let outcome = match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => {
                warn!(session_id = %ctx.session_id, tool = %call.name, error = %join_err,
                      "tool executor panicked");
                ToolOutcome::failure("tool_execution", format!("executor panicked: {join_err}"))
            }
            Err(_) => {
                warn!(session_id = %ctx.session_id, tool = %call.name,
                      deadline_ms = deadline.as_millis() as u64,
                      "tool deadline exceeded; orphaning executor");
                ctx.cancel.cancel();
                ToolOutcome::timeout()
            }
        };

        let is_error = outcome.is_error();
        ToolResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            json: outcome.to_json(),
            is_error,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;

    /// Minimal echo tool for registry tests.
    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutcome {
            ToolOutcome::success(json!({ "echo": call.args }))
        }
    }

    /// Sleeps past any reasonable deadline.
    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn deadline(&self) -> Option<Duration> {
            Some(Duration::from_millis(100))
        }
        async fn execute(&self, _call: &ToolCall, _ctx: &ToolCtx) -> ToolOutcome {
            tokio::time::sleep(Duration::from_millis(500)).await;
            ToolOutcome::success(json!({ "too": "late" }))
        }
    }

    struct PanickyTool;

    #[async_trait]
    impl Tool for PanickyTool {
        fn name(&self) -> &str {
            "panicky"
        }
        fn description(&self) -> &str {
            "panics"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _call: &ToolCall, _ctx: &ToolCtx) -> ToolOutcome {
            panic!("executor bug")
        }
    }

    fn call(name: &str) -> ToolCall {
        ToolCall { id: "call-1".into(), name: name.into(), args: json!({ "x": 1 }) }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::builder()
            .register(EchoTool { name: "echo" })
            .register(SlowTool)
            .register(PanickyTool)
            .build()
    }

    #[test]
    fn lookup_finds_registered_tool() {
        let reg = registry();
        assert!(reg.lookup("echo").is_some());
        assert!(reg.lookup("nope").is_none());
    }

    #[test]
    fn schemas_for_preserves_agent_order_and_skips_unknown() {
        let reg = registry();
        let names = vec!["slow".to_string(), "missing".to_string(), "echo".to_string()];
        let schemas = reg.schemas_for(&names);
        assert_eq!(schemas.len(), 2);
        assert_eq!(schemas[0].name, "slow");
        assert_eq!(schemas[1].name, "echo");
    }

    #[tokio::test]
    async fn execute_known_tool_succeeds() {
        let reg = registry();
        let ctx = ToolCtx::new("s");
        let r = reg.execute(&call("echo"), &ctx, Duration::from_secs(1)).await;
        assert!(!r.is_error);
        assert_eq!(r.json["ok"], json!(true));
        assert_eq!(r.json["echo"]["x"], json!(1));
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_structured_error() {
        let reg = registry();
        let ctx = ToolCtx::new("s");
        let r = reg.execute(&call("missing"), &ctx, Duration::from_secs(1)).await;
        assert!(r.is_error);
        assert_eq!(r.json["error"], json!("unknown_tool"));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_slow_tool_times_out_with_timeout_kind() {
        let reg = registry();
        let ctx = ToolCtx::new("s");
        let r = reg.execute(&call("slow"), &ctx, Duration::from_secs(10)).await;
        assert!(r.is_error);
        assert_eq!(r.json["error"], json!("timeout"));
        // The per-tool deadline (100ms) beat the 10s default.
        assert!(ctx.cancel.is_cancelled(), "orphaned executor must be signalled");
    }

    #[tokio::test]
    async fn execute_panicking_tool_is_contained() {
        let reg = registry();
        let ctx = ToolCtx::new("s");
        let r = reg.execute(&call("panicky"), &ctx, Duration::from_secs(1)).await;
        assert!(r.is_error);
        assert_eq!(r.json["error"], json!("tool_execution"));
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let reg = ToolRegistry::builder()
            .register(EchoTool { name: "t" })
            .register(EchoTool { name: "t" })
            .build();
        assert_eq!(reg.names().len(), 1);
    }
}
