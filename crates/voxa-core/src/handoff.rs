// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Handoff resolution and greeting selection.
//!
//! Given the active agent, the triggering tool and the session's scenario
//! resolution, this module decides: which agent takes over, whether the
//! switch is announced or discrete, what context is carried, and which
//! greeting (if any) is spoken.  Both pipelines use this single authority.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use voxa_agents::{
    Agent, AgentCatalog, HandoffKind, ScenarioResolution, SessionOverrides,
};
use voxa_tools::Tool;

/// Keys reserved for handoff control flow.  They are stripped from carried
/// context so the next agent never sees routing internals as conversation
/// facts.
const RESERVED_CONTEXT_KEYS: &[&str] = &["success", "target_agent", "handoff_summary", "handoff"];

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("handoff tool {tool:?} resolves to no valid target agent")]
    UnresolvedTarget { tool: String },
}

/// What the new agent says on arrival.
#[derive(Debug, Clone, PartialEq)]
pub enum GreetingPlan {
    /// Scenario-provided text, spoken as-is.
    Verbatim(String),
    /// Rendered from the target agent's greeting templates.
    Rendered(String),
    /// Nothing is spoken; the agent responds to the carried context directly.
    Suppress,
}

#[derive(Debug, Clone)]
pub struct HandoffResolution {
    pub target_agent: String,
    pub kind: HandoffKind,
    pub share_context: bool,
    /// Sanitized context object carried to the new agent.
    pub carried_context: Value,
    pub greeting: GreetingPlan,
}

impl HandoffResolution {
    pub fn is_discrete(&self) -> bool {
        self.kind == HandoffKind::Discrete
    }

    /// The `additional_instructions` payload for the new agent's first
    /// response.  The agent's system prompt is not replaced; this rides on
    /// top of it for one turn.
    pub fn additional_instructions(&self) -> Option<String> {
        let utterance = self.carried_context.get("user_last_utterance")?.as_str()?;
        let mut text = format!(
            "The caller has just been transferred to you mid-conversation. \
             Their last words were: \"{utterance}\". \
             Respond to them directly; do not re-introduce yourself."
        );
        let extra: Value = {
            let mut ctx = self.carried_context.clone();
            if let Some(map) = ctx.as_object_mut() {
                map.remove("user_last_utterance");
            }
            ctx
        };
        if extra.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
            text.push_str(&format!("\nCarried context: {extra}"));
        }
        Some(text)
    }
}

/// Session-scoped handoff resolver.
pub struct HandoffService {
    catalog: Arc<AgentCatalog>,
    resolution: Arc<ScenarioResolution>,
}

impl HandoffService {
    pub fn new(catalog: Arc<AgentCatalog>, resolution: Arc<ScenarioResolution>) -> Self {
        Self { catalog, resolution }
    }

    /// Resolve a handoff per the priority order: scenario edge first, then
    /// the tool's registered default target.  The target must be in the
    /// session's effective agent set.
    ///
    /// `visited` reports whether an agent has been active before in this
    /// session; it is sampled for the resolved target before the switch is
    /// applied and drives the first-vs-return greeting split.
    pub fn resolve(
        &self,
        active_agent: &str,
        tool: &dyn Tool,
        tool_args: &Value,
        user_last_utterance: Option<&str>,
        visited: impl Fn(&str) -> bool,
        overrides: &SessionOverrides,
    ) -> Result<HandoffResolution, HandoffError> {
        let edge = self.resolution.edge(active_agent, tool.name());

        let (target, kind, share_context, greeting_override, greet_on_switch) = match edge {
            Some(e) => (
                e.to.clone(),
                e.kind,
                e.share_context,
                e.greeting_override.clone(),
                e.greet_on_switch,
            ),
            // Fallback edge: target from tool metadata, announced, shared.
            None => match tool.default_target() {
                Some(t) => (t.to_string(), HandoffKind::Announced, true, None, true),
                None => {
                    return Err(HandoffError::UnresolvedTarget { tool: tool.name().to_string() })
                }
            },
        };

        let target_agent = match self.resolution.contains_agent(&target) {
            true => self.catalog.get(&target),
            false => None,
        };
        let target_agent = match target_agent {
            Some(a) => a,
            None => return Err(HandoffError::UnresolvedTarget { tool: tool.name().to_string() }),
        };

        let carried_context =
            build_carried_context(tool_args, user_last_utterance, share_context);

        let greeting = self.select_greeting(
            target_agent,
            kind,
            visited(&target),
            greeting_override.as_deref(),
            greet_on_switch,
            overrides,
        );

        Ok(HandoffResolution {
            target_agent: target,
            kind,
            share_context,
            carried_context,
            greeting,
        })
    }

    /// The single authoritative greeting rule (used by both pipelines):
    /// - discrete → suppress, first visit or not;
    /// - scenario `greeting_override` → verbatim;
    /// - announced + first visit → rendered first-contact template;
    /// - announced + return visit → rendered return-contact template
    ///   (falling back to first-contact when empty);
    /// - `greet_on_switch: false` or an empty template → suppress.
    pub fn select_greeting(
        &self,
        target: &Agent,
        kind: HandoffKind,
        visited_before: bool,
        greeting_override: Option<&str>,
        greet_on_switch: bool,
        overrides: &SessionOverrides,
    ) -> GreetingPlan {
        if kind == HandoffKind::Discrete {
            return GreetingPlan::Suppress;
        }
        if !greet_on_switch {
            return GreetingPlan::Suppress;
        }
        if let Some(text) = greeting_override {
            return GreetingPlan::Verbatim(text.to_string());
        }
        // Session-start override beats every catalog value.
        if let Some(text) = &overrides.greeting {
            return GreetingPlan::Verbatim(text.clone());
        }

        let mut vars = self.resolution.prompt_vars_for(&target.name);
        for (k, v) in &overrides.prompt_vars {
            vars.insert(k.clone(), v.clone());
        }
        match target.render_greeting(!visited_before, &vars) {
            Some(text) => GreetingPlan::Rendered(text),
            None => GreetingPlan::Suppress,
        }
    }
}

/// Build the sanitized context object carried across the switch.
///
/// The caller's last utterance always travels (the new agent must answer
/// it); tool-argument fields travel only when the edge shares context.
fn build_carried_context(
    tool_args: &Value,
    user_last_utterance: Option<&str>,
    share_context: bool,
) -> Value {
    let mut ctx = if share_context {
        sanitize_context(tool_args.clone())
    } else {
        json!({})
    };
    if let (Some(utterance), Some(map)) = (user_last_utterance, ctx.as_object_mut()) {
        map.insert("user_last_utterance".into(), json!(utterance));
    }
    ctx
}

/// Strip reserved handoff-control keys from a context object.
///
/// Idempotent: `sanitize(sanitize(x)) == sanitize(x)`.  Non-object values
/// are replaced by an empty object so downstream code can always treat the
/// context as a map.
pub fn sanitize_context(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            for key in RESERVED_CONTEXT_KEYS {
                map.remove(*key);
            }
            Value::Object(map)
        }
        _ => json!({}),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
