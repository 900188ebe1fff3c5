// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use voxa_agents::HandoffKind;

/// Events emitted by the orchestrator during a turn.  The pipelines consume
/// these to drive synthesis and transport output.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A text chunk streamed from the model, in model order.
    TextDelta(String),
    /// The model requested a tool call.
    ToolCallStarted { call_id: String, name: String },
    /// A tool call finished; its structured result is already in history.
    ToolCallFinished { call_id: String, name: String, is_error: bool },
    /// The active agent changed.  The pipeline clears the synthesis buffer
    /// and reopens it with the new agent's voice before any greeting text.
    AgentSwitched { from: String, to: String, kind: HandoffKind },
    /// The turn finished (response complete, apology spoken, or cancelled).
    TurnComplete,
    /// A recoverable error the front-end may want to display.
    Error(String),
}
