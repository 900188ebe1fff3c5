// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted call simulation.
//!
//! Drives the orchestration core from a YAML script: the caller's turns and
//! the model's responses are both scripted, so a full multi-agent call —
//! tool hops and handoffs included — runs deterministically with no network
//! access.  Doubles as executable documentation for scenario authors.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voxa_agents::{AgentCatalog, ScenarioCatalog, ScenarioResolution, SessionOverrides};
use voxa_config::Config;
use voxa_core::{Orchestrator, OrchestratorDeps, RuntimeMetrics, SessionEvent, SharedPhase};
use voxa_model::{LlmClient, ResponseEvent, ScriptedLlm};
use voxa_tools::{Tool, ToolCall, ToolCtx, ToolOutcome, ToolRegistry};

/// One scripted model response round.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScriptedRound {
    Text { text: String },
    Tool { tool: ScriptedToolCall },
}

#[derive(Debug, Deserialize)]
struct ScriptedToolCall {
    id: String,
    name: String,
    /// JSON-encoded arguments object.
    #[serde(default)]
    args: String,
}

#[derive(Debug, Deserialize)]
struct SimulationScript {
    #[serde(default)]
    scenario: Option<String>,
    /// Caller utterances, one turn each.
    caller: Vec<String>,
    /// Model responses, consumed one per LLM round (tool hops included).
    responses: Vec<ScriptedRound>,
}

/// Stand-in executor for every tool the catalog references.  Handoff tools
/// are recognized by the `handoff_` prefix; scenario edges supply their
/// targets.
struct SimTool {
    name: String,
}

#[async_trait::async_trait]
impl Tool for SimTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "simulation stand-in"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    fn is_handoff(&self) -> bool {
        self.name.starts_with("handoff_")
    }
    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutcome {
        ToolOutcome::success(json!({ "simulated": true, "args": call.args }))
    }
}

pub async fn run(config: &Config, script_path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(script_path)
        .with_context(|| format!("reading {}", script_path.display()))?;
    let script: SimulationScript =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", script_path.display()))?;

    let catalog = Arc::new(AgentCatalog::load_dir(Path::new(&config.catalog.agents_dir))?);
    if catalog.is_empty() {
        anyhow::bail!("no agents loaded from {:?}", config.catalog.agents_dir);
    }
    let scenarios = ScenarioCatalog::load_dir(Path::new(&config.catalog.scenarios_dir))?;
    let scenario_name = script.scenario.as_deref().or(config.catalog.default_scenario.as_deref());
    let scenario = scenarios.get_or_default(scenario_name);
    let resolution = Arc::new(ScenarioResolution::resolve(
        &catalog,
        &scenario,
        std::env::var(&config.catalog.start_agent_env).ok().as_deref(),
        config.catalog.default_agent.as_deref(),
    )?);

    // Every tool any agent references gets a stand-in executor.
    let mut builder = ToolRegistry::builder();
    let mut seen = std::collections::BTreeSet::new();
    for name in catalog.names() {
        if let Some(agent) = catalog.get(&name) {
            for tool in &agent.tools {
                if seen.insert(tool.clone()) {
                    builder = builder.register(SimTool { name: tool.clone() });
                }
            }
        }
    }
    let registry = Arc::new(builder.build());

    let rounds: Vec<Vec<ResponseEvent>> = script
        .responses
        .iter()
        .map(|round| match round {
            ScriptedRound::Text { text } => {
                vec![ResponseEvent::TextDelta(text.clone()), ResponseEvent::Done]
            }
            ScriptedRound::Tool { tool } => vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: tool.id.clone(),
                    name: tool.name.clone(),
                    arguments: if tool.args.is_empty() { "{}".into() } else { tool.args.clone() },
                },
                ResponseEvent::Done,
            ],
        })
        .collect();
    let llm: Arc<ScriptedLlm> = Arc::new(ScriptedLlm::new(rounds));

    let metrics = Arc::new(RuntimeMetrics::new());
    let memory = voxa_memory::MemoryManager::new("simulation", config.orchestrator.history_window);
    let mut orchestrator = Orchestrator::new(
        "simulation",
        OrchestratorDeps {
            catalog,
            resolution: Arc::clone(&resolution),
            overrides: SessionOverrides::default(),
            registry,
            chat_client: Arc::clone(&llm) as Arc<dyn LlmClient>,
            responses_client: Arc::clone(&llm) as Arc<dyn LlmClient>,
            memory,
            metrics: Arc::clone(&metrics),
            phase: SharedPhase::new(),
            cfg: config.orchestrator.clone(),
            timeouts: config.timeouts.clone(),
        },
    );

    println!(
        "simulating scenario {:?} starting with {}",
        resolution.scenario_name, resolution.start_agent
    );

    let (tx, mut rx) = mpsc::channel::<SessionEvent>(256);
    orchestrator.speak_initial_greeting(&tx).await;
    print_events(&mut rx, orchestrator.active_agent());

    for utterance in &script.caller {
        println!("caller> {utterance}");
        let t0 = Instant::now();
        orchestrator
            .run_turn(utterance, &tx, CancellationToken::new())
            .await
            .map_err(|e| anyhow::anyhow!("turn failed: {e}"))?;
        print_events(&mut rx, orchestrator.active_agent());
        println!("        (turn {} ms)", t0.elapsed().as_millis());
    }

    println!(
        "call finished: {} turns, {} handoffs, mean turn {} ms",
        metrics.turn_latency.count(),
        metrics.handoff_count(),
        metrics.turn_latency.mean_ms(),
    );
    Ok(())
}

fn print_events(rx: &mut mpsc::Receiver<SessionEvent>, active_agent: &str) {
    let mut speech = String::new();
    let mut speaker = active_agent.to_string();
    while let Ok(ev) = rx.try_recv() {
        match ev {
            SessionEvent::TextDelta(t) => speech.push_str(&t),
            SessionEvent::ToolCallStarted { name, .. } => {
                println!("        [{speaker}] calls {name}");
            }
            SessionEvent::ToolCallFinished { name, is_error, .. } => {
                let status = if is_error { "failed" } else { "ok" };
                println!("        [{speaker}] {name} {status}");
            }
            SessionEvent::AgentSwitched { from, to, kind } => {
                if !speech.is_empty() {
                    println!("[{from}] {}", speech.trim());
                    speech.clear();
                }
                println!("        ── handoff ({kind:?}) {from} → {to}");
                speaker = to;
            }
            SessionEvent::TurnComplete => {}
            SessionEvent::Error(e) => println!("        error: {e}"),
        }
    }
    if !speech.is_empty() {
        println!("[{speaker}] {}", speech.trim());
    }
}
