// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The realtime pipeline: an event-driven adapter to a bidirectional
//! speech-LLM service.
//!
//! The service does STT, LLM and TTS on its side; this pipeline translates
//! its events into the same turn/tool/handoff model the cascade uses:
//!
//! | service event                  | action                                  |
//! |--------------------------------|-----------------------------------------|
//! | `SessionUpdated`               | flush the pending response, if any      |
//! | `InputTranscriptCompleted`     | append user turn to history             |
//! | `ResponseTextDelta`            | accumulate assistant text               |
//! | `ResponseAudioDelta`           | forward audio to the transport          |
//! | `FunctionCallCompleted`        | execute tool / resolve handoff          |
//! | `ResponseDone`                 | commit assistant turn, back to idle     |
//! | `SpeechStarted`                | barge-in: cancel response, stop playback|
//!
//! Handoffs follow the session-update gate: the new agent's response is not
//! requested until the service acknowledges the new configuration with
//! `SessionUpdated`, so the response always runs under the new agent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxa_agents::{Agent, AgentCatalog, ScenarioResolution, SessionOverrides};
use voxa_config::{OrchestratorConfig, TimeoutsConfig};
use voxa_core::{
    GreetingPlan, HandoffService, RuntimeMetrics, SessionError, SharedPhase, TurnPhase,
};
use voxa_memory::MemoryManager;
use voxa_speech::{AudioFrame, ClientEvent, RealtimeClient, RealtimeEvent};
use voxa_tools::{ToolCall, ToolCtx, ToolRegistry};

use crate::transport::{TransportFrame, TransportSink, TransportSource};

const B64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;

/// One iteration of the event loop.
enum Step {
    Transport(Option<TransportFrame>),
    Service(Option<RealtimeEvent>),
}

/// What to ask the service for once the pending session update is applied.
enum PendingResponse {
    /// Speak this exact greeting.
    Greeting(String),
    /// Continue the conversation, optionally with carried instructions.
    Continuation(Option<String>),
}

pub struct RealtimePipeline {
    session_id: String,
    registry: Arc<ToolRegistry>,
    catalog: Arc<AgentCatalog>,
    resolution: Arc<ScenarioResolution>,
    overrides: SessionOverrides,
    handoffs: HandoffService,
    memory: MemoryManager,
    metrics: Arc<RuntimeMetrics>,
    phase: SharedPhase,
    cfg: OrchestratorConfig,
    timeouts: TimeoutsConfig,
    session_cancel: CancellationToken,

    active_agent: String,
    last_assistant: Option<String>,
    last_user: Option<String>,
    assistant_buf: String,
    pending_response: Option<PendingResponse>,
    turn_t0: Option<Instant>,
}

impl RealtimePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        registry: Arc<ToolRegistry>,
        catalog: Arc<AgentCatalog>,
        resolution: Arc<ScenarioResolution>,
        overrides: SessionOverrides,
        memory: MemoryManager,
        metrics: Arc<RuntimeMetrics>,
        phase: SharedPhase,
        cfg: OrchestratorConfig,
        timeouts: TimeoutsConfig,
        session_cancel: CancellationToken,
    ) -> Self {
        let handoffs = HandoffService::new(Arc::clone(&catalog), Arc::clone(&resolution));
        let active_agent = resolution.start_agent.clone();
        memory.mark_visited(&active_agent);
        Self {
            session_id: session_id.into(),
            registry,
            catalog,
            resolution,
            overrides,
            handoffs,
            memory,
            metrics,
            phase,
            cfg,
            timeouts,
            session_cancel,
            active_agent,
            last_assistant: None,
            last_user: None,
            assistant_buf: String::new(),
            pending_response: None,
            turn_t0: None,
        }
    }

    pub fn active_agent(&self) -> &str {
        &self.active_agent
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.session_cancel.clone()
    }

    /// Run until the transport or the service disconnects.
    pub async fn run(
        mut self,
        mut client: Box<dyn RealtimeClient>,
        mut sink: Box<dyn TransportSink>,
        mut source: Box<dyn TransportSource>,
    ) -> Result<(), SessionError> {
        // Configure the service for the start agent; the greeting (if any)
        // is flushed when the service confirms the configuration.
        let projection = self.project(&self.active_agent_entry()?);
        client
            .send(ClientEvent::SessionUpdate { session: projection })
            .await
            .map_err(|e| SessionError::Fatal(format!("realtime session update: {e}")))?;
        if let Some(greeting) = self.initial_greeting() {
            self.pending_response = Some(PendingResponse::Greeting(greeting));
        }

        loop {
            // The service-event future borrows the client mutably, so the
            // select only *picks* a step; the step runs after the other
            // branch future is dropped.
            let step = tokio::select! {
                biased;
                _ = self.session_cancel.cancelled() => break,
                frame = source.recv() => Step::Transport(frame),
                event = client.next_event() => Step::Service(event),
            };
            match step {
                Step::Transport(None) => {
                    debug!(session_id = %self.session_id, "transport closed");
                    break;
                }
                Step::Transport(Some(TransportFrame::Audio(audio))) => {
                    let payload = B64.encode(&audio.bytes);
                    if client
                        .send(ClientEvent::InputAudioAppend { audio: payload })
                        .await
                        .is_err()
                    {
                        warn!(session_id = %self.session_id, "realtime service rejected audio");
                    }
                }
                Step::Transport(Some(TransportFrame::Control(v))) => {
                    debug!(session_id = %self.session_id, control = %v, "ignoring control frame");
                }
                Step::Service(None) => {
                    debug!(session_id = %self.session_id, "realtime service disconnected");
                    break;
                }
                Step::Service(Some(ev)) => self.handle_event(ev, &mut client, &mut sink).await?,
            }
        }
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: RealtimeEvent,
        client: &mut Box<dyn RealtimeClient>,
        sink: &mut Box<dyn TransportSink>,
    ) -> Result<(), SessionError> {
        match event {
            RealtimeEvent::SessionUpdated => {
                if let Some(pending) = self.pending_response.take() {
                    let instructions = match pending {
                        PendingResponse::Greeting(text) => {
                            self.memory.append_history(&self.active_agent, "assistant", &text);
                            self.last_assistant = Some(text.clone());
                            Some(format!("Greet the caller by saying exactly: \"{text}\""))
                        }
                        PendingResponse::Continuation(extra) => extra,
                    };
                    let _ = client
                        .send(ClientEvent::ResponseCreate { additional_instructions: instructions })
                        .await;
                    self.phase.transition(TurnPhase::Thinking);
                }
            }
            RealtimeEvent::InputTranscriptCompleted { text } => {
                self.memory.append_history(&self.active_agent, "user", &text);
                self.last_user = Some(text);
                self.turn_t0 = Some(Instant::now());
                self.phase.transition(TurnPhase::Thinking);
            }
            RealtimeEvent::ResponseTextDelta { text } => {
                self.assistant_buf.push_str(&text);
            }
            RealtimeEvent::ResponseAudioDelta { audio } => {
                self.phase.transition(TurnPhase::Speaking);
                match B64.decode(audio.as_bytes()) {
                    Ok(bytes) => {
                        let _ = sink.send(TransportFrame::Audio(AudioFrame::pcm16k(bytes))).await;
                    }
                    Err(e) => warn!(session_id = %self.session_id, error = %e, "bad audio payload"),
                }
            }
            RealtimeEvent::FunctionCallCompleted { call_id, name, arguments } => {
                self.handle_function_call(call_id, name, arguments, client).await?;
            }
            RealtimeEvent::ResponseDone => {
                if !self.assistant_buf.is_empty() {
                    let text = std::mem::take(&mut self.assistant_buf);
                    self.memory.append_history(&self.active_agent, "assistant", &text);
                    self.last_assistant = Some(text);
                }
                if let Some(t0) = self.turn_t0.take() {
                    self.metrics.turn_latency.record(t0.elapsed());
                }
                self.phase.transition(TurnPhase::Idle);
            }
            RealtimeEvent::SpeechStarted => {
                // Barge-in: cancel the in-flight response and silence the
                // line.  The discarded buffer never reaches history.
                if matches!(self.phase.get(), TurnPhase::Thinking | TurnPhase::Speaking) {
                    let _ = client.send(ClientEvent::ResponseCancel).await;
                    let _ = sink.send(TransportFrame::stop_playback()).await;
                    self.assistant_buf.clear();
                    self.phase.transition(TurnPhase::Interrupted);
                    self.phase.transition(TurnPhase::ReceivingUser);
                }
            }
            RealtimeEvent::Error { message } => {
                warn!(session_id = %self.session_id, "realtime service error: {message}");
            }
        }
        Ok(())
    }

    /// Execute a completed function call.  Handoffs cancel the current
    /// response, reconfigure the session for the new agent and (after the
    /// service confirms) trigger the new agent's first response.  The
    /// handoff tool's output is NOT posted back — it belongs to the
    /// outgoing agent's bookkeeping only.
    async fn handle_function_call(
        &mut self,
        call_id: String,
        name: String,
        arguments: String,
        client: &mut Box<dyn RealtimeClient>,
    ) -> Result<(), SessionError> {
        let args: serde_json::Value = serde_json::from_str(&arguments).unwrap_or_else(|e| {
            warn!(session_id = %self.session_id, tool = %name, error = %e,
                  "invalid function-call arguments; substituting {{}}");
            json!({})
        });
        let call = ToolCall { id: call_id.clone(), name: name.clone(), args };

        let is_handoff = self
            .registry
            .lookup(&name)
            .map(|t| t.is_handoff())
            .unwrap_or(false);

        if !is_handoff {
            let ctx = ToolCtx {
                session_id: self.session_id.clone(),
                cancel: self.session_cancel.child_token(),
            };
            let started = Instant::now();
            let default_deadline = Duration::from_millis(self.timeouts.tool_ms);
            let result = self.registry.execute(&call, &ctx, default_deadline).await;
            self.metrics.tool_execution.record(started.elapsed());
            self.append_tool_exchange(&call, &result.content());
            let _ = client
                .send(ClientEvent::FunctionCallOutput { call_id, output: result.content() })
                .await;
            let _ = client
                .send(ClientEvent::ResponseCreate { additional_instructions: None })
                .await;
            return Ok(());
        }

        // 1. Cancel whatever the old agent's response was still doing.
        let _ = client.send(ClientEvent::ResponseCancel).await;
        self.assistant_buf.clear();

        let tool = match self.registry.lookup(&name) {
            Some(t) => t,
            None => return Ok(()),
        };
        let resolution = self.handoffs.resolve(
            &self.active_agent,
            tool.as_ref(),
            &call.args,
            self.last_user.as_deref(),
            |agent| self.memory.visited(agent),
            &self.overrides,
        );

        let resolution = match resolution {
            Ok(r) => r,
            Err(e) => {
                warn!(session_id = %self.session_id, tool = %name, error = %e, "handoff unresolved");
                self.append_tool_exchange(
                    &call,
                    &json!({ "ok": false, "error": "handoff_unresolved", "message": e.to_string() })
                        .to_string(),
                );
                let apology = self.cfg.apology_phrase.clone();
                let _ = client
                    .send(ClientEvent::ResponseCreate {
                        additional_instructions: Some(format!(
                            "Say exactly: \"{apology}\""
                        )),
                    })
                    .await;
                return Ok(());
            }
        };

        // The executor still runs for its summary; its output stays with the
        // outgoing agent.
        let ctx = ToolCtx {
            session_id: self.session_id.clone(),
            cancel: self.session_cancel.child_token(),
        };
        let default_deadline = Duration::from_millis(self.timeouts.tool_ms);
        let result = self.registry.execute(&call, &ctx, default_deadline).await;
        self.append_tool_exchange(&call, &result.content());

        // 2. Apply the switch and reconfigure the service.
        self.phase.transition(TurnPhase::Switching);
        self.metrics.record_handoff();
        let from = std::mem::replace(&mut self.active_agent, resolution.target_agent.clone());
        if resolution.is_discrete() {
            self.last_assistant = None;
        }
        self.memory.mark_visited(&self.active_agent);
        debug!(session_id = %self.session_id, %from, to = %self.active_agent, "realtime handoff");

        let projection = self.project(&self.active_agent_entry()?);
        let _ = client.send(ClientEvent::SessionUpdate { session: projection }).await;

        // 3/4. The new response is requested only after SessionUpdated, so
        // it uses the NEW agent's configuration.
        self.pending_response = Some(match &resolution.greeting {
            GreetingPlan::Verbatim(text) | GreetingPlan::Rendered(text) => {
                PendingResponse::Greeting(text.clone())
            }
            GreetingPlan::Suppress => {
                PendingResponse::Continuation(resolution.additional_instructions())
            }
        });
        Ok(())
    }

    fn active_agent_entry(&self) -> Result<Agent, SessionError> {
        self.catalog
            .get(&self.active_agent)
            .cloned()
            .ok_or_else(|| {
                SessionError::Fatal(format!("agent {:?} missing from catalog", self.active_agent))
            })
    }

    /// Project an agent into the service's session shape, with its tool
    /// schemas in function-tool form.
    fn project(&self, agent: &Agent) -> voxa_speech::RealtimeSessionConfig {
        let tools: Vec<serde_json::Value> = self
            .registry
            .schemas_for(&agent.tools)
            .into_iter()
            .map(|s| {
                json!({
                    "type": "function",
                    "name": s.name,
                    "description": s.description,
                    "parameters": s.parameters,
                })
            })
            .collect();
        let mut vars = self.resolution.prompt_vars_for(&agent.name);
        for (k, v) in &self.overrides.prompt_vars {
            vars.insert(k.clone(), v.clone());
        }
        agent.realtime_projection(&vars, tools)
    }

    fn initial_greeting(&self) -> Option<String> {
        if let Some(text) = &self.overrides.greeting {
            return Some(text.clone());
        }
        let agent = self.catalog.get(&self.active_agent)?;
        let mut vars = self.resolution.prompt_vars_for(&agent.name);
        for (k, v) in &self.overrides.prompt_vars {
            vars.insert(k.clone(), v.clone());
        }
        agent.render_greeting(true, &vars)
    }

    fn append_tool_exchange(&self, call: &ToolCall, result_json: &str) {
        self.memory.append_history(
            &self.active_agent,
            "tool_call",
            json!({ "id": call.id, "name": call.name, "arguments": call.args.to_string() })
                .to_string(),
        );
        self.memory.append_history(
            &self.active_agent,
            "tool",
            json!({ "id": call.id, "content": result_json }).to_string(),
        );
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
