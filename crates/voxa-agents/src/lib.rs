// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod catalog;
mod scenario;
mod template;

pub use agent::{Agent, ModelPrefs, SessionDefaults};
pub use catalog::{AgentCatalog, ScenarioCatalog};
pub use scenario::{
    HandoffEdge, HandoffKind, Scenario, ScenarioAgents, ScenarioResolution, SessionOverrides,
};
pub use template::render_template;
