// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod simulate;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use voxa_agents::{AgentCatalog, ScenarioCatalog, ScenarioResolution};
use voxa_config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(voxa_config::load(cli.config.as_deref())?);

    match &cli.command {
        Commands::Check { scenario } => check(&config, scenario.as_deref()),
        Commands::ListAgents => list_agents(&config),
        Commands::ListScenarios => list_scenarios(&config),
        Commands::Simulate { script } => simulate::run(&config, script).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_catalogs(config: &Config) -> anyhow::Result<(AgentCatalog, ScenarioCatalog)> {
    let agents = AgentCatalog::load_dir(Path::new(&config.catalog.agents_dir))
        .context("loading agent catalog")?;
    let scenarios = ScenarioCatalog::load_dir(Path::new(&config.catalog.scenarios_dir))
        .context("loading scenario catalog")?;
    Ok((agents, scenarios))
}

/// Validate config + catalogs and print the resolved session wiring.
fn check(config: &Config, scenario: Option<&str>) -> anyhow::Result<()> {
    let (agents, scenarios) = load_catalogs(config)?;
    if agents.is_empty() {
        anyhow::bail!(
            "no agents found in {:?} — nothing to serve",
            config.catalog.agents_dir
        );
    }

    let name = scenario.or(config.catalog.default_scenario.as_deref());
    let scenario = scenarios.get_or_default(name);
    let resolution = ScenarioResolution::resolve(
        &agents,
        &scenario,
        std::env::var(&config.catalog.start_agent_env).ok().as_deref(),
        config.catalog.default_agent.as_deref(),
    )?;

    println!("scenario:     {}", resolution.scenario_name);
    println!("start agent:  {}", resolution.start_agent);
    println!("agents:       {}", resolution.agents.iter().cloned().collect::<Vec<_>>().join(", "));

    // Edges that reference agents outside the effective set are dead wiring.
    let mut problems = 0usize;
    for edge in &scenario.edges {
        for (role, agent) in [("source", &edge.from), ("target", &edge.to)] {
            if !resolution.contains_agent(agent) {
                println!(
                    "  WARN edge {} --{}--> {}: {role} not in agent set",
                    edge.from, edge.tool, edge.to
                );
                problems += 1;
            }
        }
    }

    if problems == 0 {
        println!("ok: {} edges validated", scenario.edges.len());
    } else {
        anyhow::bail!("{problems} scenario wiring problem(s)");
    }
    Ok(())
}

fn list_agents(config: &Config) -> anyhow::Result<()> {
    let (agents, _) = load_catalogs(config)?;
    for name in agents.names() {
        if let Some(a) = agents.get(&name) {
            let tools = if a.tools.is_empty() { "-".to_string() } else { a.tools.join(", ") };
            println!("{name:<24} voice={:<16} tools: {tools}", a.voice.voice);
        }
    }
    Ok(())
}

fn list_scenarios(config: &Config) -> anyhow::Result<()> {
    let (_, scenarios) = load_catalogs(config)?;
    for name in scenarios.names() {
        if let Some(s) = scenarios.get(&name) {
            let start = s.start_agent.as_deref().unwrap_or("(default)");
            println!("{name:<24} start={start:<20} edges={}", s.edges.len());
        }
    }
    Ok(())
}
