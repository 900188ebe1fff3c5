// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scenarios: which agents participate in a deployment and the handoff
//! edges between them.
//!
//! A scenario is resolved once at session start into a
//! [`ScenarioResolution`] — the effective agent set, the start agent and an
//! edge table keyed by `(from_agent, trigger_tool)`.  The resolution never
//! changes mid-session; swapping scenarios requires a new session.

use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::catalog::AgentCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffKind {
    /// The new agent speaks a greeting before handling the carried context.
    Announced,
    /// The new agent silently assumes the conversation.
    Discrete,
}

/// One handoff edge in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffEdge {
    pub from: String,
    pub to: String,
    /// Tool whose invocation triggers this edge.
    pub tool: String,
    pub kind: HandoffKind,
    #[serde(default = "default_true")]
    pub share_context: bool,
    /// Spoken verbatim instead of the target's greeting templates.
    #[serde(default)]
    pub greeting_override: Option<String>,
    #[serde(default = "default_true")]
    pub greet_on_switch: bool,
}

fn default_true() -> bool {
    true
}

/// Which agents a scenario includes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScenarioAgents {
    /// The literal string "all".
    All(String),
    List(Vec<String>),
}

impl Default for ScenarioAgents {
    fn default() -> Self {
        ScenarioAgents::All("all".into())
    }
}

/// Per-agent overrides a scenario may declare.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOverride {
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub prompt_vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub start_agent: Option<String>,
    #[serde(default)]
    pub agents: ScenarioAgents,
    #[serde(default)]
    pub edges: Vec<HandoffEdge>,
    #[serde(default)]
    pub agent_overrides: HashMap<String, AgentOverride>,
    /// Optional scenario-level override of the global tool-hop ceiling.
    #[serde(default)]
    pub max_tool_hops: Option<u32>,
}

impl Scenario {
    /// The built-in fallback: every catalog agent, no special edges.
    pub fn default_all() -> Self {
        Self {
            name: "default".into(),
            start_agent: None,
            agents: ScenarioAgents::default(),
            edges: Vec::new(),
            agent_overrides: HashMap::new(),
            max_tool_hops: None,
        }
    }
}

/// Overrides provided when a session starts.  These always win over catalog
/// and scenario values — catalog values are fallbacks.
#[derive(Debug, Clone, Default)]
pub struct SessionOverrides {
    pub greeting: Option<String>,
    pub prompt_vars: HashMap<String, String>,
}

/// A scenario resolved against the loaded catalog for one session.
#[derive(Debug, Clone)]
pub struct ScenarioResolution {
    pub scenario_name: String,
    /// Effective agent set: scenario ∩ catalog.
    pub agents: BTreeSet<String>,
    pub start_agent: String,
    /// Handoff edges keyed by `(from_agent, trigger_tool)`.
    edges: HashMap<(String, String), HandoffEdge>,
    pub agent_overrides: HashMap<String, AgentOverride>,
    pub max_tool_hops: Option<u32>,
}

impl ScenarioResolution {
    /// Resolve at session start.
    ///
    /// Start-agent precedence: scenario override → `env_start` → registry
    /// default.  The chosen start agent must be in the effective set.
    pub fn resolve(
        catalog: &AgentCatalog,
        scenario: &Scenario,
        env_start: Option<&str>,
        registry_default: Option<&str>,
    ) -> anyhow::Result<Self> {
        let effective: BTreeSet<String> = match &scenario.agents {
            ScenarioAgents::All(_) => catalog.names().into_iter().collect(),
            ScenarioAgents::List(names) => names
                .iter()
                .filter(|n| catalog.get(n).is_some())
                .cloned()
                .collect(),
        };
        if effective.is_empty() {
            bail!("scenario {:?} resolves to an empty agent set", scenario.name);
        }

        let start = scenario
            .start_agent
            .as_deref()
            .or(env_start)
            .or(registry_default)
            .map(str::to_string)
            .or_else(|| effective.iter().next().cloned())
            .context("no start agent could be determined")?;
        if !effective.contains(&start) {
            bail!(
                "start agent {:?} is not in scenario {:?}'s agent set",
                start,
                scenario.name
            );
        }

        let mut edges = HashMap::new();
        for edge in &scenario.edges {
            edges.insert((edge.from.clone(), edge.tool.clone()), edge.clone());
        }

        Ok(Self {
            scenario_name: scenario.name.clone(),
            agents: effective,
            start_agent: start,
            edges,
            agent_overrides: scenario.agent_overrides.clone(),
            max_tool_hops: scenario.max_tool_hops,
        })
    }

    /// Look up the edge for `(active_agent, tool)`.
    pub fn edge(&self, from: &str, tool: &str) -> Option<&HandoffEdge> {
        self.edges.get(&(from.to_string(), tool.to_string()))
    }

    pub fn contains_agent(&self, name: &str) -> bool {
        self.agents.contains(name)
    }

    /// Prompt-variable overlay for an agent: scenario overrides only (session
    /// overrides are applied on top by the caller).
    pub fn prompt_vars_for(&self, agent: &str) -> HashMap<String, String> {
        self.agent_overrides
            .get(agent)
            .map(|o| o.prompt_vars.clone())
            .unwrap_or_default()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Agent;

    fn catalog() -> AgentCatalog {
        AgentCatalog::from_agents(vec![
            Agent { name: "Concierge".into(), prompt: "c".into(), ..minimal() },
            Agent { name: "FraudAgent".into(), prompt: "f".into(), ..minimal() },
            Agent { name: "CardRecommendation".into(), prompt: "r".into(), ..minimal() },
        ])
    }

    fn minimal() -> Agent {
        serde_yaml::from_str("name: X\nprompt: p\n").unwrap()
    }

    fn edge(from: &str, to: &str, tool: &str, kind: HandoffKind) -> HandoffEdge {
        HandoffEdge {
            from: from.into(),
            to: to.into(),
            tool: tool.into(),
            kind,
            share_context: true,
            greeting_override: None,
            greet_on_switch: true,
        }
    }

    #[test]
    fn all_agents_resolves_full_catalog() {
        let r =
            ScenarioResolution::resolve(&catalog(), &Scenario::default_all(), None, None).unwrap();
        assert_eq!(r.agents.len(), 3);
        assert!(r.contains_agent("FraudAgent"));
    }

    #[test]
    fn list_agents_intersects_with_catalog() {
        let mut s = Scenario::default_all();
        s.agents = ScenarioAgents::List(vec![
            "Concierge".into(),
            "NotLoaded".into(),
            "FraudAgent".into(),
        ]);
        let r = ScenarioResolution::resolve(&catalog(), &s, None, None).unwrap();
        assert_eq!(r.agents.len(), 2);
        assert!(!r.contains_agent("NotLoaded"));
    }

    #[test]
    fn start_agent_precedence_scenario_wins() {
        let mut s = Scenario::default_all();
        s.start_agent = Some("FraudAgent".into());
        let r = ScenarioResolution::resolve(&catalog(), &s, Some("Concierge"), Some("CardRecommendation"))
            .unwrap();
        assert_eq!(r.start_agent, "FraudAgent");
    }

    #[test]
    fn start_agent_precedence_env_beats_registry_default() {
        let s = Scenario::default_all();
        let r = ScenarioResolution::resolve(&catalog(), &s, Some("Concierge"), Some("FraudAgent"))
            .unwrap();
        assert_eq!(r.start_agent, "Concierge");
    }

    #[test]
    fn start_agent_falls_back_to_registry_default() {
        let s = Scenario::default_all();
        let r = ScenarioResolution::resolve(&catalog(), &s, None, Some("FraudAgent")).unwrap();
        assert_eq!(r.start_agent, "FraudAgent");
    }

    #[test]
    fn start_agent_outside_set_is_rejected() {
        let mut s = Scenario::default_all();
        s.agents = ScenarioAgents::List(vec!["Concierge".into()]);
        s.start_agent = Some("FraudAgent".into());
        assert!(ScenarioResolution::resolve(&catalog(), &s, None, None).is_err());
    }

    #[test]
    fn empty_effective_set_is_rejected() {
        let mut s = Scenario::default_all();
        s.agents = ScenarioAgents::List(vec!["Ghost".into()]);
        assert!(ScenarioResolution::resolve(&catalog(), &s, None, None).is_err());
    }

    #[test]
    fn edge_lookup_by_from_and_tool() {
        let mut s = Scenario::default_all();
        s.edges.push(edge(
            "Concierge",
            "FraudAgent",
            "handoff_fraud",
            HandoffKind::Discrete,
        ));
        let r = ScenarioResolution::resolve(&catalog(), &s, None, None).unwrap();
        let e = r.edge("Concierge", "handoff_fraud").unwrap();
        assert_eq!(e.to, "FraudAgent");
        assert_eq!(e.kind, HandoffKind::Discrete);
        assert!(r.edge("FraudAgent", "handoff_fraud").is_none());
    }

    #[test]
    fn scenario_yaml_round_trip() {
        let yaml = r#"
name: banking
start_agent: Concierge
agents: [Concierge, FraudAgent]
max_tool_hops: 4
edges:
  - from: Concierge
    to: FraudAgent
    tool: handoff_fraud
    kind: discrete
    share_context: true
agent_overrides:
  FraudAgent:
    greeting: "Fraud team here."
    prompt_vars:
      department: fraud
"#;
        let s: Scenario = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(s.name, "banking");
        assert_eq!(s.edges.len(), 1);
        assert_eq!(s.edges[0].kind, HandoffKind::Discrete);
        assert_eq!(s.max_tool_hops, Some(4));
        assert_eq!(
            s.agent_overrides["FraudAgent"].prompt_vars["department"],
            "fraud"
        );
        let back = serde_yaml::to_string(&s).unwrap();
        let s2: Scenario = serde_yaml::from_str(&back).unwrap();
        assert_eq!(s2.edges[0].to, "FraudAgent");
    }

    #[test]
    fn edge_defaults_share_context_and_greet() {
        let yaml = "from: A\nto: B\ntool: t\nkind: announced\n";
        let e: HandoffEdge = serde_yaml::from_str(yaml).unwrap();
        assert!(e.share_context);
        assert!(e.greet_on_switch);
        assert!(e.greeting_override.is_none());
    }
}
