// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-session orchestrator: drives one turn at a time through the
//! model ↔ tool loop, applies handoffs, and keeps the session state
//! (active agent, history, last utterance) consistent.
//!
//! Ordering guarantees within a turn: text deltas reach the event channel
//! in model order; tool calls execute sequentially in the order the model
//! emitted them; a resolved handoff ends further iteration on behalf of the
//! outgoing agent.  Every suspension point observes the turn's cancellation
//! token, and a cancelled turn appends nothing more to history.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxa_agents::{
    Agent, AgentCatalog, ScenarioResolution, SessionOverrides,
};
use voxa_config::{OrchestratorConfig, TimeoutsConfig};
use voxa_memory::MemoryManager;
use voxa_model::{
    retry, select_endpoint, CompletionRequest, Endpoint, LlmClient, Message, ResponseEvent,
    ToolSchema, UpstreamError,
};
use voxa_tools::{ToolCall, ToolCtx, ToolRegistry};

use crate::{
    GreetingPlan, HandoffResolution, HandoffService, RuntimeMetrics, SessionError, SessionEvent,
    SharedPhase, TurnPhase,
};

/// Everything a session wires into its orchestrator.
pub struct OrchestratorDeps {
    pub catalog: Arc<AgentCatalog>,
    pub resolution: Arc<ScenarioResolution>,
    pub overrides: SessionOverrides,
    pub registry: Arc<ToolRegistry>,
    pub chat_client: Arc<dyn LlmClient>,
    pub responses_client: Arc<dyn LlmClient>,
    pub memory: MemoryManager,
    pub metrics: Arc<RuntimeMetrics>,
    pub phase: SharedPhase,
    pub cfg: OrchestratorConfig,
    pub timeouts: TimeoutsConfig,
}

/// Why the turn loop stopped iterating.
enum TurnOutcome {
    /// Final response streamed; nothing left to do.
    Complete,
    /// Cancelled mid-flight (barge-in, shutdown); nothing was appended after
    /// the cancellation point.
    Cancelled,
    /// Unrecoverable fault or exhausted budget; the apology was spoken.
    Apologized,
}

pub struct Orchestrator {
    session_id: String,
    catalog: Arc<AgentCatalog>,
    resolution: Arc<ScenarioResolution>,
    overrides: SessionOverrides,
    registry: Arc<ToolRegistry>,
    chat_client: Arc<dyn LlmClient>,
    responses_client: Arc<dyn LlmClient>,
    memory: MemoryManager,
    metrics: Arc<RuntimeMetrics>,
    phase: SharedPhase,
    cfg: OrchestratorConfig,
    timeouts: TimeoutsConfig,
    handoffs: HandoffService,
    max_tool_hops: u32,

    active_agent: String,
    /// Short continuity slot; cleared on discrete handoffs so the outgoing
    /// agent's words never bleed into the next agent's context.
    last_assistant: Option<String>,
    /// Set while a resolved handoff is being applied; cleared atomically
    /// with the switch.
    pending_handoff: Option<HandoffResolution>,
}

impl Orchestrator {
    pub fn new(session_id: impl Into<String>, deps: OrchestratorDeps) -> Self {
        let session_id = session_id.into();
        let handoffs = HandoffService::new(Arc::clone(&deps.catalog), Arc::clone(&deps.resolution));
        let max_tool_hops = deps.resolution.max_tool_hops.unwrap_or(deps.cfg.max_tool_hops);
        let active_agent = deps.resolution.start_agent.clone();
        deps.memory.mark_visited(&active_agent);
        Self {
            session_id,
            catalog: deps.catalog,
            resolution: deps.resolution,
            overrides: deps.overrides,
            registry: deps.registry,
            chat_client: deps.chat_client,
            responses_client: deps.responses_client,
            memory: deps.memory,
            metrics: deps.metrics,
            phase: deps.phase,
            cfg: deps.cfg,
            timeouts: deps.timeouts,
            handoffs,
            max_tool_hops,
            active_agent,
            last_assistant: None,
            pending_handoff: None,
        }
    }

    pub fn active_agent(&self) -> &str {
        &self.active_agent
    }

    pub fn last_assistant(&self) -> Option<&str> {
        self.last_assistant.as_deref()
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase.get()
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// The handoff currently being applied, if the turn is mid-switch.
    pub fn pending_handoff(&self) -> Option<&HandoffResolution> {
        self.pending_handoff.as_ref()
    }

    /// The session-start greeting of the start agent, already rendered.
    /// Session-start overrides win over the catalog template.
    pub fn initial_greeting(&self) -> Option<String> {
        if let Some(text) = &self.overrides.greeting {
            return Some(text.clone());
        }
        let agent = self.catalog.get(&self.active_agent)?;
        agent.render_greeting(true, &self.prompt_vars())
    }

    /// Speak the session-start greeting through the event channel and record
    /// it in history.
    pub async fn speak_initial_greeting(&mut self, tx: &mpsc::Sender<SessionEvent>) {
        if let Some(text) = self.initial_greeting() {
            self.memory.append_history(&self.active_agent, "assistant", &text);
            self.last_assistant = Some(text.clone());
            let _ = tx.send(SessionEvent::TextDelta(text)).await;
            let _ = tx.send(SessionEvent::TurnComplete).await;
        }
    }

    /// Drive one turn: append the user utterance, stream the model response
    /// (with tool hops and handoffs) and emit [`SessionEvent`]s.
    ///
    /// Cancelling `cancel` at any suspension point stops the turn without
    /// further history appends.
    pub async fn run_turn(
        &mut self,
        user_text: &str,
        tx: &mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        let turn_start = Instant::now();
        self.phase.transition(TurnPhase::Thinking);
        self.memory.append_history(&self.active_agent, "user", user_text);

        let outcome = self
            .turn_loop(user_text, tx, &cancel, turn_start)
            .await?;

        match outcome {
            TurnOutcome::Complete | TurnOutcome::Apologized => {
                self.phase.transition(TurnPhase::Idle);
            }
            TurnOutcome::Cancelled => {
                // Barge-in left the phase Interrupted — the pipeline moves it
                // to ReceivingUser; a plain shutdown goes straight to Idle.
                if self.phase.get() != TurnPhase::Interrupted {
                    self.phase.transition(TurnPhase::Idle);
                }
            }
        }
        let _ = tx.send(SessionEvent::TurnComplete).await;
        self.metrics.turn_latency.record(turn_start.elapsed());

        // Write-behind sync happens on the flusher cadence; the turn only
        // needs the in-memory state, which is already current.
        Ok(())
    }

    async fn turn_loop(
        &mut self,
        user_text: &str,
        tx: &mpsc::Sender<SessionEvent>,
        cancel: &CancellationToken,
        turn_start: Instant,
    ) -> Result<TurnOutcome, SessionError> {
        let turn_budget = Duration::from_millis(self.timeouts.turn_ms);
        let last_user = user_text.to_string();
        let mut pending_instructions: Option<String> = None;
        let mut hops = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(TurnOutcome::Cancelled);
            }
            if turn_start.elapsed() > turn_budget {
                warn!(session_id = %self.session_id, "turn budget exhausted");
                return Ok(self.apologize(tx).await);
            }

            let agent = match self.catalog.get(&self.active_agent) {
                Some(a) => a.clone(),
                None => {
                    return Err(SessionError::Fatal(format!(
                        "active agent {:?} missing from catalog",
                        self.active_agent
                    )))
                }
            };

            let req = self.build_request(&agent, pending_instructions.take());
            let client = self.client_for(&agent);

            let attempts = self.cfg.retry_attempts;
            let base = Duration::from_millis(self.cfg.retry_base_ms);
            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TurnOutcome::Cancelled),
                r = retry::with_backoff(attempts, base, || client.complete(req.clone())) => r,
            };
            let stream = match stream {
                Ok(s) => s,
                Err(UpstreamError::Cancelled) => return Ok(TurnOutcome::Cancelled),
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "model call failed");
                    return Ok(self.apologize(tx).await);
                }
            };

            let (text, tool_calls) = match self.consume_stream(stream, tx, cancel).await {
                StreamResult::Cancelled => return Ok(TurnOutcome::Cancelled),
                StreamResult::Stalled => {
                    warn!(session_id = %self.session_id, "model stream stalled");
                    return Ok(self.apologize(tx).await);
                }
                StreamResult::Finished { text, tool_calls } => (text, tool_calls),
            };

            if !text.is_empty() {
                self.memory.append_history(&self.active_agent, "assistant", &text);
                self.last_assistant = Some(text);
            }

            if tool_calls.is_empty() {
                return Ok(TurnOutcome::Complete);
            }

            hops += 1;
            if hops > self.max_tool_hops {
                warn!(
                    session_id = %self.session_id,
                    hops,
                    max = self.max_tool_hops,
                    "tool hop budget exceeded"
                );
                return Ok(self.apologize(tx).await);
            }

            // Tool calls execute sequentially, in model emission order; no
            // fan-out, so history replays deterministically.
            for call in tool_calls {
                if cancel.is_cancelled() {
                    return Ok(TurnOutcome::Cancelled);
                }
                let is_handoff = self
                    .registry
                    .lookup(&call.name)
                    .map(|t| t.is_handoff())
                    .unwrap_or(false);

                if is_handoff {
                    match self.apply_handoff(&call, &last_user, tx, cancel).await? {
                        HandoffStep::Switched { continuation } => {
                            pending_instructions = continuation;
                            // The outgoing agent gets no further hops.
                            break;
                        }
                        HandoffStep::TurnEnded(outcome) => return Ok(outcome),
                    }
                } else if let CallStep::Cancelled = self.run_tool_call(&call, tx, cancel).await {
                    return Ok(TurnOutcome::Cancelled);
                }
            }
        }
    }

    /// Execute one regular tool call and append the call + structured result
    /// to the active agent's history.  A result arriving after cancellation
    /// is discarded, not appended.
    async fn run_tool_call(
        &mut self,
        call: &ToolCall,
        tx: &mpsc::Sender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> CallStep {
        let _ = tx
            .send(SessionEvent::ToolCallStarted { call_id: call.id.clone(), name: call.name.clone() })
            .await;

        let ctx = ToolCtx { session_id: self.session_id.clone(), cancel: cancel.child_token() };
        let started = Instant::now();
        let default_deadline = Duration::from_millis(self.timeouts.tool_ms);
        // Barge-in mid-execution orphans the executor: its eventual result
        // is dropped on the floor, never appended.
        let exec = self.registry.execute(call, &ctx, default_deadline);
        tokio::pin!(exec);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(session_id = %self.session_id, tool = %call.name,
                       "orphaning tool execution after cancel");
                ctx.cancel.cancel();
                return CallStep::Cancelled;
            }
            r = &mut exec => r,
        };
        self.metrics.tool_execution.record(started.elapsed());

        self.append_tool_exchange(call, &result.content());
        let _ = tx
            .send(SessionEvent::ToolCallFinished {
                call_id: call.id.clone(),
                name: call.name.clone(),
                is_error: result.is_error,
            })
            .await;
        CallStep::Done
    }

    /// Handle a handoff-flagged tool call: resolve first, then run the
    /// executor (its effects are subordinate to the resolution), then apply
    /// the switch as a synchronous continuation of this turn.
    async fn apply_handoff(
        &mut self,
        call: &ToolCall,
        last_user: &str,
        tx: &mpsc::Sender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> Result<HandoffStep, SessionError> {
        let _ = tx
            .send(SessionEvent::ToolCallStarted { call_id: call.id.clone(), name: call.name.clone() })
            .await;

        let tool = match self.registry.lookup(&call.name) {
            Some(t) => t,
            None => {
                self.append_tool_exchange(
                    call,
                    &json!({ "ok": false, "error": "unknown_tool" }).to_string(),
                );
                return Ok(HandoffStep::TurnEnded(self.apologize(tx).await));
            }
        };

        let resolution = self.handoffs.resolve(
            &self.active_agent,
            tool.as_ref(),
            &call.args,
            Some(last_user),
            |agent| self.memory.visited(agent),
            &self.overrides,
        );

        let resolution = match resolution {
            Ok(r) => r,
            Err(e) => {
                warn!(session_id = %self.session_id, tool = %call.name, error = %e, "handoff unresolved");
                // History records the attempt as a failed tool call; the
                // active agent does not change.
                self.append_tool_exchange(
                    call,
                    &json!({
                        "ok": false,
                        "error": "handoff_unresolved",
                        "message": e.to_string(),
                    })
                    .to_string(),
                );
                let _ = tx
                    .send(SessionEvent::ToolCallFinished {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        is_error: true,
                    })
                    .await;
                return Ok(HandoffStep::TurnEnded(self.apologize(tx).await));
            }
        };

        // The switch is now committed; the slot holds it until the agent
        // swap below completes.
        self.pending_handoff = Some(resolution.clone());

        // The executor still runs to produce its summary, but the switch
        // happens regardless of what it returns.
        let ctx = ToolCtx { session_id: self.session_id.clone(), cancel: cancel.child_token() };
        let default_deadline = Duration::from_millis(self.timeouts.tool_ms);
        let exec = self.registry.execute(call, &ctx, default_deadline);
        tokio::pin!(exec);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                ctx.cancel.cancel();
                self.pending_handoff = None;
                return Ok(HandoffStep::TurnEnded(TurnOutcome::Cancelled));
            }
            r = &mut exec => r,
        };
        // The exchange is recorded under the OUTGOING agent: the new agent's
        // visible history must not contain the handoff tool's output.
        self.append_tool_exchange(call, &result.content());
        let _ = tx
            .send(SessionEvent::ToolCallFinished {
                call_id: call.id.clone(),
                name: call.name.clone(),
                is_error: result.is_error,
            })
            .await;

        self.phase.transition(TurnPhase::Switching);
        self.metrics.record_handoff();

        // Apply the switch and clear the pending slot in one step.
        let from = std::mem::replace(&mut self.active_agent, resolution.target_agent.clone());
        if resolution.is_discrete() {
            self.last_assistant = None;
        }
        self.memory.mark_visited(&self.active_agent);
        self.pending_handoff = None;

        let _ = tx
            .send(SessionEvent::AgentSwitched {
                from,
                to: self.active_agent.clone(),
                kind: resolution.kind,
            })
            .await;

        match &resolution.greeting {
            GreetingPlan::Verbatim(text) | GreetingPlan::Rendered(text) => {
                // Announced: the greeting is the turn's response.
                self.phase.transition(TurnPhase::Speaking);
                self.memory.append_history(&self.active_agent, "assistant", text);
                self.last_assistant = Some(text.clone());
                let _ = tx.send(SessionEvent::TextDelta(text.clone())).await;
                Ok(HandoffStep::TurnEnded(TurnOutcome::Complete))
            }
            GreetingPlan::Suppress => {
                if resolution.is_discrete() {
                    // Discrete: the new agent answers the carried utterance
                    // directly, as a synchronous continuation of this turn.
                    self.phase.transition(TurnPhase::Thinking);
                    Ok(HandoffStep::Switched {
                        continuation: resolution.additional_instructions(),
                    })
                } else {
                    // Announced but suppressed: switch silently and wait for
                    // the caller's next utterance.
                    self.phase.transition(TurnPhase::Idle);
                    Ok(HandoffStep::TurnEnded(TurnOutcome::Complete))
                }
            }
        }
    }

    /// Consume one response stream, forwarding text deltas in order and
    /// accumulating tool-call fragments keyed by their parallel-call index.
    async fn consume_stream(
        &mut self,
        mut stream: voxa_model::ResponseStream,
        tx: &mpsc::Sender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> StreamResult {
        let mut full_text = String::new();
        let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
        let mut first_token_timer: Option<Instant> = Some(Instant::now());

        loop {
            let idle_limit = if first_token_timer.is_some() {
                Duration::from_millis(self.timeouts.llm_first_token_ms)
            } else {
                Duration::from_millis(self.timeouts.llm_inter_token_ms)
            };

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamResult::Cancelled,
                ev = tokio::time::timeout(idle_limit, stream.next()) => ev,
            };

            let event = match event {
                Err(_) => return StreamResult::Stalled,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(session_id = %self.session_id, error = %e, "model stream error");
                    return StreamResult::Stalled;
                }
                Ok(Some(Ok(ev))) => ev,
            };

            match event {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    if let Some(t0) = first_token_timer.take() {
                        self.metrics.llm_first_token.record(t0.elapsed());
                        self.phase.transition(TurnPhase::Speaking);
                    }
                    full_text.push_str(&delta);
                    let _ = tx.send(SessionEvent::TextDelta(delta)).await;
                }
                ResponseEvent::ToolCall { index, id, name, arguments } => {
                    first_token_timer.take();
                    let slot = pending.entry(index).or_insert_with(PendingToolCall::default);
                    if !id.is_empty() {
                        slot.id = id;
                    }
                    if !name.is_empty() {
                        slot.name = name;
                    }
                    slot.args_buf.push_str(&arguments);
                }
                ResponseEvent::Usage { input_tokens, output_tokens } => {
                    debug!(session_id = %self.session_id, input_tokens, output_tokens, "turn usage");
                }
                ResponseEvent::Done => break,
                ResponseEvent::Error(e) => {
                    warn!(session_id = %self.session_id, "model stream warning: {e}");
                }
                ResponseEvent::TextDelta(_) => {}
            }
        }

        // Flush accumulated tool calls ordered by index.  Calls without a
        // name cannot be dispatched and are dropped; an empty id gets a
        // synthetic fallback so the exchange can still be recorded.
        let mut tool_calls = Vec::new();
        for (i, (_, slot)) in pending.into_iter().enumerate() {
            if slot.name.is_empty() {
                warn!(session_id = %self.session_id, "dropping tool call with empty name");
                continue;
            }
            tool_calls.push(slot.finish(i));
        }

        StreamResult::Finished { text: full_text, tool_calls }
    }

    /// Speak the fixed apology and record it; the session continues.
    async fn apologize(&mut self, tx: &mpsc::Sender<SessionEvent>) -> TurnOutcome {
        let text = self.cfg.apology_phrase.clone();
        self.memory.append_history(&self.active_agent, "assistant", &text);
        self.last_assistant = Some(text.clone());
        self.phase.transition(TurnPhase::Speaking);
        let _ = tx.send(SessionEvent::TextDelta(text)).await;
        TurnOutcome::Apologized
    }

    fn client_for(&self, agent: &Agent) -> Arc<dyn LlmClient> {
        match select_endpoint(agent.model.endpoint, true) {
            Endpoint::Chat => Arc::clone(&self.chat_client),
            Endpoint::Responses => Arc::clone(&self.responses_client),
        }
    }

    /// Prompt variables for the active agent: scenario overrides overlaid
    /// with session-start overrides (which always win).
    fn prompt_vars(&self) -> std::collections::HashMap<String, String> {
        let mut vars = self.resolution.prompt_vars_for(&self.active_agent);
        for (k, v) in &self.overrides.prompt_vars {
            vars.insert(k.clone(), v.clone());
        }
        vars
    }

    fn build_request(&self, agent: &Agent, additional_instructions: Option<String>) -> CompletionRequest {
        let system = agent.render_prompt(&self.prompt_vars());
        let mut messages = vec![Message::system(system)];
        messages.extend(self.window_messages());

        let tools: Vec<ToolSchema> = self
            .registry
            .schemas_for(&agent.tools)
            .into_iter()
            .map(|s| ToolSchema { name: s.name, description: s.description, parameters: s.parameters })
            .collect();

        let conversation_id = match select_endpoint(agent.model.endpoint, true) {
            // The responses endpoint keeps server-side state per
            // session+agent; a handoff therefore starts a fresh conversation.
            Endpoint::Responses => Some(format!("{}:{}", self.session_id, agent.name)),
            Endpoint::Chat => None,
        };

        CompletionRequest {
            messages,
            tools,
            stream: true,
            additional_instructions,
            conversation_id,
        }
    }

    /// The active agent's bounded history window mapped into model messages.
    fn window_messages(&self) -> Vec<Message> {
        self.memory
            .history_window(&self.active_agent)
            .into_iter()
            .filter_map(|entry| match entry.role.as_str() {
                "user" => Some(Message::user(entry.content)),
                "assistant" => Some(Message::assistant(entry.content)),
                "tool_call" => {
                    let v: Value = serde_json::from_str(&entry.content).ok()?;
                    Some(Message::tool_call(
                        v["id"].as_str()?,
                        v["name"].as_str()?,
                        v["arguments"].as_str().unwrap_or("{}"),
                    ))
                }
                "tool" => {
                    let v: Value = serde_json::from_str(&entry.content).ok()?;
                    Some(Message::tool_result(
                        v["id"].as_str()?,
                        v["content"].as_str().unwrap_or(""),
                    ))
                }
                other => {
                    warn!(role = %other, "unknown history role; skipping");
                    None
                }
            })
            .collect()
    }

    /// Record a tool call + its structured result under the active agent.
    fn append_tool_exchange(&self, call: &ToolCall, result_json: &str) {
        self.memory.append_history(
            &self.active_agent,
            "tool_call",
            json!({
                "id": call.id,
                "name": call.name,
                "arguments": call.args.to_string(),
            })
            .to_string(),
        );
        self.memory.append_history(
            &self.active_agent,
            "tool",
            json!({ "id": call.id, "content": result_json }).to_string(),
        );
    }
}

enum CallStep {
    Done,
    Cancelled,
}

enum HandoffStep {
    /// The switch happened; a discrete continuation may carry instructions
    /// for the new agent's first response.
    Switched { continuation: Option<String> },
    TurnEnded(TurnOutcome),
}

enum StreamResult {
    Finished { text: String, tool_calls: Vec<ToolCall> },
    Cancelled,
    Stalled,
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Resolve the accumulated fragments into a dispatchable call.  The
    /// arguments always resolve to a JSON object; invalid or empty buffers
    /// fall back to `{}` so the exchange stays well-formed.
    fn finish(self, ordinal: usize) -> ToolCall {
        let args = if self.args_buf.is_empty() {
            json!({})
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(tool = %self.name, error = %e, "invalid tool-call arguments; substituting {{}}");
                    json!({})
                }
            }
        };
        let id = if self.id.is_empty() {
            warn!(tool = %self.name, "tool call had empty id; generating synthetic id");
            format!("call_synthetic_{ordinal}")
        } else {
            self.id
        };
        ToolCall { id, name: self.name, args }
    }
}
