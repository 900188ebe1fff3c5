// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end call tests: scripted caller audio in, synthesized audio out,
//! everything in between real.  The LLM, recognizer and synthesizer are the
//! scripted in-process doubles; no test touches the network.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use voxa_agents::{Agent, AgentCatalog, HandoffEdge, HandoffKind, Scenario, ScenarioResolution, SessionOverrides};
use voxa_config::Config;
use voxa_core::{sanitize_context, Orchestrator, OrchestratorDeps, RuntimeMetrics, SharedPhase};
use voxa_memory::{MemoryManager, SqliteStore};
use voxa_model::{LlmClient, ResponseEvent, ScriptedLlm};
use voxa_session::{CascadePipeline, ChannelTransport, ChannelTransportHandle, TransportFrame};
use voxa_speech::{ChannelStt, ChannelSttHandle, CollectingTtsClient, TtsClient};
use voxa_tools::{Tool, ToolCall, ToolCtx, ToolOutcome, ToolRegistry};

// ── Tools ────────────────────────────────────────────────────────────────────

struct BalanceTool {
    delay: Duration,
    deadline: Option<Duration>,
}

#[async_trait::async_trait]
impl Tool for BalanceTool {
    fn name(&self) -> &str {
        "get_balance"
    }
    fn description(&self) -> &str {
        "returns the account balance"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    fn deadline(&self) -> Option<Duration> {
        self.deadline
    }
    async fn execute(&self, _call: &ToolCall, _ctx: &ToolCtx) -> ToolOutcome {
        tokio::time::sleep(self.delay).await;
        ToolOutcome::success(json!({ "balance": 2040.00 }))
    }
}

struct HandoffTool {
    name: &'static str,
    target: Option<&'static str>,
}

#[async_trait::async_trait]
impl Tool for HandoffTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "transfers the caller"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    fn is_handoff(&self) -> bool {
        true
    }
    fn default_target(&self) -> Option<&str> {
        self.target
    }
    async fn execute(&self, _call: &ToolCall, _ctx: &ToolCtx) -> ToolOutcome {
        ToolOutcome::success(json!({ "handoff_summary": "transferring" }))
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

fn catalog() -> Arc<AgentCatalog> {
    let concierge: Agent = serde_yaml::from_str(
        "name: BankingConcierge\n\
         prompt: You are the banking concierge.\n\
         greeting: \"Thanks for calling!\"\n\
         tools: [get_balance, handoff_card_recommendation, handoff_fraud, handoff_to_agent]\n\
         voice:\n  voice: en-US-jenny\n",
    )
    .unwrap();
    let cards: Agent = serde_yaml::from_str(
        "name: CardRecommendation\n\
         prompt: You recommend cards.\n\
         greeting: \"Let's find you the right card.\"\n\
         voice:\n  voice: en-US-aria\n",
    )
    .unwrap();
    let fraud: Agent = serde_yaml::from_str(
        "name: FraudAgent\nprompt: You investigate fraud.\nvoice:\n  voice: en-US-guy\n",
    )
    .unwrap();
    Arc::new(AgentCatalog::from_agents(vec![concierge, cards, fraud]))
}

fn banking_scenario() -> Scenario {
    let mut s = Scenario::default_all();
    s.name = "banking".into();
    s.start_agent = Some("BankingConcierge".into());
    s.edges.push(HandoffEdge {
        from: "BankingConcierge".into(),
        to: "CardRecommendation".into(),
        tool: "handoff_card_recommendation".into(),
        kind: HandoffKind::Announced,
        share_context: true,
        greeting_override: None,
        greet_on_switch: true,
    });
    s.edges.push(HandoffEdge {
        from: "BankingConcierge".into(),
        to: "FraudAgent".into(),
        tool: "handoff_fraud".into(),
        kind: HandoffKind::Discrete,
        share_context: true,
        greeting_override: None,
        greet_on_switch: true,
    });
    s.edges.push(HandoffEdge {
        from: "FraudAgent".into(),
        to: "BankingConcierge".into(),
        tool: "handoff_to_agent".into(),
        kind: HandoffKind::Discrete,
        share_context: true,
        greeting_override: None,
        greet_on_switch: true,
    });
    s
}

struct Call {
    stt: ChannelSttHandle,
    transport: ChannelTransportHandle,
    tts: Arc<CollectingTtsClient>,
    llm: Arc<ScriptedLlm>,
    memory: MemoryManager,
    cancel: CancellationToken,
    session: tokio::task::JoinHandle<Result<(), voxa_core::SessionError>>,
}

fn start_call(scripts: Vec<Vec<ResponseEvent>>, balance: BalanceTool) -> Call {
    let config = Config::default();
    let catalog = catalog();
    let scenario = banking_scenario();
    let resolution =
        Arc::new(ScenarioResolution::resolve(&catalog, &scenario, None, None).unwrap());
    let registry = Arc::new(
        ToolRegistry::builder()
            .register(balance)
            .register(HandoffTool { name: "handoff_card_recommendation", target: None })
            .register(HandoffTool { name: "handoff_fraud", target: None })
            .register(HandoffTool { name: "handoff_to_agent", target: None })
            .build(),
    );
    let llm = Arc::new(ScriptedLlm::new(scripts));
    let memory = MemoryManager::new("call-1", config.orchestrator.history_window);
    let metrics = Arc::new(RuntimeMetrics::new());
    let phase = SharedPhase::new();
    let cancel = CancellationToken::new();

    let orchestrator = Orchestrator::new(
        "call-1",
        OrchestratorDeps {
            catalog: Arc::clone(&catalog),
            resolution,
            overrides: SessionOverrides::default(),
            registry,
            chat_client: Arc::clone(&llm) as Arc<dyn LlmClient>,
            responses_client: Arc::clone(&llm) as Arc<dyn LlmClient>,
            memory: memory.clone(),
            metrics: Arc::clone(&metrics),
            phase: phase.clone(),
            cfg: config.orchestrator.clone(),
            timeouts: config.timeouts.clone(),
        },
    );

    let pipeline = CascadePipeline::new(
        "call-1",
        orchestrator,
        phase,
        metrics,
        config.orchestrator.clone(),
        config.timeouts.clone(),
        catalog,
        cancel.clone(),
    );

    let (t_handle, sink, source) = ChannelTransport::open();
    let (stt_handle, stt_stream) = ChannelStt::pair();
    let tts = Arc::new(CollectingTtsClient::new());
    let tts_for_run: Arc<dyn TtsClient> = Arc::clone(&tts) as _;

    let session = tokio::spawn(async move {
        pipeline.run(Box::new(sink), Box::new(source), Box::new(stt_stream), tts_for_run).await
    });

    Call { stt: stt_handle, transport: t_handle, tts, llm, memory, cancel, session }
}

impl Call {
    /// Wait until the synthesizer has spoken `n` chunks (bounded).
    async fn wait_for_spoken(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.tts.spoken().len() < n {
            assert!(Instant::now() < deadline, "timed out waiting for {n} spoken chunks; got {:?}", self.tts.spoken());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn finish(self) -> Vec<TransportFrame> {
        self.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.session).await;
        let mut transport = self.transport;
        transport.drain_outbound()
    }
}

fn tool_call_round(id: &str, name: &str, args: &str) -> Vec<ResponseEvent> {
    vec![
        ResponseEvent::ToolCall { index: 0, id: id.into(), name: name.into(), arguments: args.into() },
        ResponseEvent::Done,
    ]
}

fn text_round(text: &str) -> Vec<ResponseEvent> {
    vec![ResponseEvent::TextDelta(text.into()), ResponseEvent::Done]
}

fn default_balance() -> BalanceTool {
    BalanceTool { delay: Duration::from_millis(1), deadline: None }
}

// ── Scenario A: announced handoff, first visit ───────────────────────────────

#[tokio::test]
async fn scenario_a_announced_handoff_greets_first_visit() {
    let call = start_call(
        vec![tool_call_round("c1", "handoff_card_recommendation", r#"{"reason":"cards"}"#)],
        default_balance(),
    );

    call.wait_for_spoken(1).await; // the session greeting
    call.stt.final_transcript("Show me credit card options");
    call.wait_for_spoken(2).await;

    let spoken = call.tts.spoken();
    assert_eq!(spoken[0], "Thanks for calling!");
    assert_eq!(spoken[1], "Let's find you the right card.");

    // The new agent's voice was used for the greeting stream.
    let voices = call.tts.voices();
    assert_eq!(voices.last().unwrap().voice, "en-US-aria");

    // History: user turn, the tool call, and the new agent's greeting.
    let history = call.memory.full_history();
    let roles: Vec<&str> = history.iter().map(|e| e.role.as_str()).collect();
    assert_eq!(roles, vec!["assistant", "user", "tool_call", "tool", "assistant"]);
    assert_eq!(history.last().unwrap().agent, "CardRecommendation");

    call.finish().await;
}

// ── Scenario B: discrete handoff, return visit ───────────────────────────────

#[tokio::test]
async fn scenario_b_discrete_return_visit_answers_directly() {
    // Concierge → Fraud (discrete) → Concierge → Fraud again: the second
    // arrival must also be silent and address the carried utterance.
    let call = start_call(
        vec![
            tool_call_round("c1", "handoff_fraud", r#"{"reason":"stolen"}"#),
            text_round("I've locked your card."),
            tool_call_round("c2", "handoff_to_agent", "{}"),
            text_round("What else can I help with?"),
            tool_call_round("c3", "handoff_fraud", r#"{"reason":"stolen again"}"#),
            text_round("Checking the repeat report now."),
        ],
        default_balance(),
    );

    call.wait_for_spoken(1).await;
    call.stt.final_transcript("my card was stolen");
    call.wait_for_spoken(2).await;
    call.stt.final_transcript("take me back to the concierge");
    call.wait_for_spoken(3).await;
    call.stt.final_transcript("I think my card was stolen again");
    call.wait_for_spoken(4).await;

    let spoken = call.tts.spoken();
    // Neither arrival at the fraud agent produced a greeting.
    assert_eq!(spoken[1], "I've locked your card.");
    assert_eq!(spoken[3], "Checking the repeat report now.");

    // The second continuation ran under the fraud agent with the utterance
    // carried verbatim, and without the concierge's assistant text anywhere
    // in its context.
    let req = call.llm.last_request().unwrap();
    let instructions = req.additional_instructions.expect("carried instructions");
    assert!(instructions.contains("I think my card was stolen again"));
    assert!(req.messages[0].as_text().unwrap().contains("investigate fraud"));
    for m in &req.messages {
        if let Some(text) = m.as_text() {
            assert!(!text.contains("Thanks for calling!"), "concierge text leaked: {text}");
            assert!(!text.contains("What else can I help with?"), "concierge text leaked: {text}");
        }
    }

    call.finish().await;
}

// ── Scenario C: tool timeout mid-turn ────────────────────────────────────────

#[tokio::test]
async fn scenario_c_tool_timeout_recovers_within_bounds() {
    let call = start_call(
        vec![
            tool_call_round("c1", "get_balance", "{}"),
            text_round("The balance service is slow, please try again."),
        ],
        BalanceTool { delay: Duration::from_millis(500), deadline: Some(Duration::from_millis(100)) },
    );

    call.wait_for_spoken(1).await;
    let t0 = Instant::now();
    call.stt.final_transcript("what's my balance");
    call.wait_for_spoken(2).await;
    assert!(t0.elapsed() < Duration::from_secs(2), "turn must finish within 2s");

    assert_eq!(call.tts.spoken()[1], "The balance service is slow, please try again.");
    let history = call.memory.full_history();
    assert!(history
        .iter()
        .any(|e| e.role == "tool" && e.content.contains("timeout")));

    call.finish().await;
}

// ── Scenario D: barge-in ─────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_d_barge_in_silences_within_bound() {
    // The reply stalls in a slow tool, leaving the turn in flight when the
    // caller starts speaking.
    let call = start_call(
        vec![
            vec![
                ResponseEvent::TextDelta("Here is the first part of a long reply".into()),
                ResponseEvent::ToolCall { index: 0, id: "c1".into(), name: "get_balance".into(), arguments: "{}".into() },
                ResponseEvent::Done,
            ],
            text_round("this text must never be spoken"),
        ],
        BalanceTool { delay: Duration::from_millis(800), deadline: None },
    );

    call.wait_for_spoken(1).await;
    call.stt.final_transcript("tell me everything");
    call.wait_for_spoken(2).await; // the first part is being spoken

    call.stt.speech_started();

    // Within 250ms the synthesizer is silenced and the transport told to stop.
    let deadline = Instant::now() + Duration::from_millis(250);
    let mut stopped = false;
    let mut transport = call.transport;
    while Instant::now() < deadline {
        if call.tts.was_cancelled() {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(stopped, "TTS must be silenced within 250ms of speech start");

    // The stop signal reached the transport.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let frames = transport.drain_outbound();
    assert!(frames.iter().any(|f| matches!(f, TransportFrame::Control(v) if v["type"] == "stop_playback")));

    // No token of the interrupted remainder reached history.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let history = call.memory.full_history();
    assert!(history.iter().all(|e| !e.content.contains("never be spoken")));

    call.cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), call.session).await;
}

// ── Scenario E: unknown handoff target ───────────────────────────────────────

#[tokio::test]
async fn scenario_e_unknown_target_apologizes_without_switch() {
    let call = start_call(
        vec![
            tool_call_round("c1", "handoff_to_agent", r#"{"target":"Nonexistent"}"#),
            text_round("still the concierge"),
        ],
        default_balance(),
    );

    call.wait_for_spoken(1).await;
    call.stt.final_transcript("transfer me somewhere strange");
    call.wait_for_spoken(2).await;

    let apology = Config::default().orchestrator.apology_phrase;
    assert_eq!(call.tts.spoken()[1], apology);

    // History records the failed attempt; the next turn still runs under the
    // concierge.
    let history = call.memory.full_history();
    assert!(history.iter().any(|e| e.role == "tool" && e.content.contains("handoff_unresolved")));

    call.stt.final_transcript("ok never mind");
    call.wait_for_spoken(3).await;
    let req = call.llm.last_request().unwrap();
    assert!(req.messages[0].as_text().unwrap().contains("banking concierge"));

    call.finish().await;
}

// ── Round-trip properties ────────────────────────────────────────────────────

#[test]
fn sanitize_is_idempotent_and_strips_reserved_keys() {
    let noisy = json!({
        "success": true,
        "target_agent": "X",
        "handoff_summary": "s",
        "handoff": { "nested": true },
        "reason": "kept",
    });
    let once = sanitize_context(noisy);
    let twice = sanitize_context(once.clone());
    assert_eq!(once, twice);
    for key in ["success", "target_agent", "handoff_summary", "handoff"] {
        assert!(once.get(key).is_none(), "{key} must be stripped");
    }
    assert_eq!(once["reason"], json!("kept"));
}

#[tokio::test]
async fn memory_write_behind_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(tmp.path().join("mem.db")).unwrap());
    let memory = MemoryManager::new("s-wb", 64).with_store(Arc::clone(&store) as _);
    memory.set("caller_tier", json!("gold"));
    memory.flush().await.unwrap();
    assert_eq!(store.read_kv("s-wb", "caller_tier").unwrap(), Some(json!("gold")));
    assert_eq!(memory.get("caller_tier"), Some(json!("gold")));
}
