// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Read-only agent and scenario catalogs.
//!
//! Loaded once from YAML directories at startup; indexed by name.  A broken
//! file is skipped with a warning rather than taking the process down —
//! catalog authoring errors must degrade, not crash.  Mutation requires a
//! process restart.

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

use crate::{Agent, Scenario};

pub struct AgentCatalog {
    agents: HashMap<String, Agent>,
}

impl AgentCatalog {
    /// Load every `*.yaml` / `*.yml` file in `dir` as one agent.
    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut agents = HashMap::new();
        for agent in load_yaml_dir::<Agent>(dir) {
            agents.insert(agent.name.clone(), agent);
        }
        Ok(Self { agents })
    }

    /// Build directly from values (tests, simulator).
    pub fn from_agents(list: Vec<Agent>) -> Self {
        let agents = list.into_iter().map(|a| (a.name.clone(), a)).collect();
        Self { agents }
    }

    pub fn get(&self, name: &str) -> Option<&Agent> {
        self.agents.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

pub struct ScenarioCatalog {
    scenarios: HashMap<String, Scenario>,
}

impl ScenarioCatalog {
    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut scenarios = HashMap::new();
        for s in load_yaml_dir::<Scenario>(dir) {
            scenarios.insert(s.name.clone(), s);
        }
        Ok(Self { scenarios })
    }

    pub fn from_scenarios(list: Vec<Scenario>) -> Self {
        let scenarios = list.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self { scenarios }
    }

    /// Look up by name, falling back to the all-agents default scenario.
    pub fn get_or_default(&self, name: Option<&str>) -> Scenario {
        match name {
            Some(n) => match self.scenarios.get(n) {
                Some(s) => s.clone(),
                None => {
                    warn!(scenario = %n, "unknown scenario; using default");
                    Scenario::default_all()
                }
            },
            None => Scenario::default_all(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scenarios.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Parse every YAML file in a directory; unparseable files are skipped with
/// a warning.  A missing directory yields an empty list.
fn load_yaml_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Vec<T> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => {
            warn!(dir = %dir.display(), "catalog directory missing; loading nothing");
            return Vec::new();
        }
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read catalog file");
                continue;
            }
        };
        match serde_yaml::from_str::<T>(&text) {
            Ok(v) => out.push(v),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse catalog file — skipping");
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
