// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod bargein;
mod error;
mod events;
mod handoff;
mod metrics;
mod orchestrator;
mod state;

pub use bargein::BargeInController;
pub use error::SessionError;
pub use events::SessionEvent;
pub use handoff::{sanitize_context, GreetingPlan, HandoffResolution, HandoffService};
pub use metrics::{Histogram, RuntimeMetrics};
pub use orchestrator::{Orchestrator, OrchestratorDeps};
pub use state::{SharedPhase, TurnPhase};
