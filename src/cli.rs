// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "voxa",
    about = "Real-time multi-agent voice orchestration runtime",
    version
)]
pub struct Cli {
    /// Explicit config file (merged on top of the standard search paths).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load config and catalogs, validate scenario wiring, print the
    /// resolved start agent.
    Check {
        /// Scenario to validate (defaults to the configured default).
        #[arg(long)]
        scenario: Option<String>,
    },

    /// List the loaded agent catalog.
    ListAgents,

    /// List the loaded scenario catalog.
    ListScenarios,

    /// Drive a scripted call through the orchestration core and print the
    /// transcript with per-turn latencies.  No network access: the LLM
    /// responses come from the script.
    Simulate {
        /// Path to the simulation script (YAML).
        script: PathBuf,
    },
}
