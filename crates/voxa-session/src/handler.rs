// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session lifecycle: one handler instance serves the whole process, one
//! session per caller connection.
//!
//! Connect: resolve the scenario, lease pooled clients (failure here rejects
//! the connect with a client-visible code — existing sessions are never
//! affected), build the orchestrator and the selected pipeline.  Disconnect:
//! cancel the turn, bounded drains (in-flight tools, final memory flush),
//! release the leases, log the session metrics.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};
use uuid::Uuid;

use voxa_agents::{AgentCatalog, ScenarioCatalog, ScenarioResolution, SessionOverrides};
use voxa_config::Config;
use voxa_core::{
    Orchestrator, OrchestratorDeps, RuntimeMetrics, SessionError, SharedPhase,
};
use voxa_memory::{MemoryManager, MemoryStore};
use voxa_model::LlmClient;
use voxa_pool::ResourcePool;
use voxa_speech::{RealtimeClient, SttClient, TtsClient};
use voxa_tools::ToolRegistry;

use crate::{
    cascade::CascadePipeline,
    realtime::RealtimePipeline,
    transport::{TransportSink, TransportSource},
};

/// Which wire format the caller connected with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    BrowserPcm,
    TelephonyUlaw,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::BrowserPcm => write!(f, "browser_pcm"),
            TransportKind::TelephonyUlaw => write!(f, "telephony_ulaw"),
        }
    }
}

/// Per-session parameters supplied by the front door at connect time.
#[derive(Default)]
pub struct SessionSpec {
    pub scenario: Option<String>,
    /// Session-start greeting/prompt overrides; these always win over
    /// catalog values.
    pub overrides: SessionOverrides,
    pub transport: Option<TransportKind>,
}

/// Both LLM endpoint shapes, leased together.
pub struct LlmHandles {
    pub chat: Arc<dyn LlmClient>,
    pub responses: Arc<dyn LlmClient>,
}

pub struct SessionHandler {
    config: Arc<Config>,
    catalog: Arc<AgentCatalog>,
    scenarios: Arc<ScenarioCatalog>,
    registry: Arc<ToolRegistry>,
    llm_pool: ResourcePool<Arc<LlmHandles>>,
    stt_pool: ResourcePool<Arc<dyn SttClient>>,
    tts_pool: ResourcePool<Arc<dyn TtsClient>>,
    store: Option<Arc<dyn MemoryStore>>,
}

impl SessionHandler {
    pub fn new(
        config: Arc<Config>,
        catalog: Arc<AgentCatalog>,
        scenarios: Arc<ScenarioCatalog>,
        registry: Arc<ToolRegistry>,
        llm_factory: impl Fn() -> Arc<LlmHandles> + Send + Sync + 'static,
        stt_factory: impl Fn() -> Arc<dyn SttClient> + Send + Sync + 'static,
        tts_factory: impl Fn() -> Arc<dyn TtsClient> + Send + Sync + 'static,
        store: Option<Arc<dyn MemoryStore>>,
    ) -> Self {
        let llm_pool = ResourcePool::new("llm", &config.pools.llm, llm_factory);
        let stt_pool = ResourcePool::new("stt", &config.pools.stt, stt_factory);
        let tts_pool = ResourcePool::new("tts", &config.pools.tts, tts_factory);
        Self {
            config,
            catalog,
            scenarios,
            registry,
            llm_pool,
            stt_pool,
            tts_pool,
            store,
        }
    }

    pub fn catalog(&self) -> &Arc<AgentCatalog> {
        &self.catalog
    }

    /// Resolve the scenario for a new session (also used by `voxa check`).
    pub fn resolve_scenario(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<ScenarioResolution>, SessionError> {
        let scenario = self.scenarios.get_or_default(name);
        let env_start = std::env::var(&self.config.catalog.start_agent_env).ok();
        ScenarioResolution::resolve(
            &self.catalog,
            &scenario,
            env_start.as_deref(),
            self.config.catalog.default_agent.as_deref(),
        )
        .map(Arc::new)
        .map_err(|e| SessionError::Fatal(format!("scenario resolution: {e}")))
    }

    /// Serve one cascade-mode session to completion.  Returns the session id
    /// for correlation with logs.
    pub async fn run_cascade(
        &self,
        spec: SessionSpec,
        sink: Box<dyn TransportSink>,
        source: Box<dyn TransportSource>,
    ) -> Result<String, SessionError> {
        let session_id = Uuid::new_v4().to_string();
        let correlation_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "session",
            session_id = %session_id,
            correlation_id = %correlation_id,
            transport = %spec.transport.unwrap_or(TransportKind::BrowserPcm),
            mode = "cascade",
        );

        async {
            let resolution = self.resolve_scenario(spec.scenario.as_deref())?;
            info!(scenario = %resolution.scenario_name, start_agent = %resolution.start_agent,
                  "session connected");

            // Lease pooled clients; exhaustion rejects the connect.
            let llm = self.llm_pool.acquire(&session_id).await?;
            let stt_client = self.stt_pool.acquire(&session_id).await?;
            let tts_client = self.tts_pool.acquire(&session_id).await?;

            let stt_stream = stt_client
                .open_stream()
                .await
                .map_err(|e| SessionError::Fatal(format!("recognizer stream: {e}")))?;

            let memory = self.build_memory(&session_id);
            let flusher = self.store.as_ref().map(|_| {
                memory.spawn_flusher(Duration::from_millis(
                    self.config.orchestrator.memory_flush_ms,
                ))
            });

            let metrics = Arc::new(RuntimeMetrics::new());
            let phase = SharedPhase::new();
            let orchestrator = Orchestrator::new(
                session_id.clone(),
                OrchestratorDeps {
                    catalog: Arc::clone(&self.catalog),
                    resolution: Arc::clone(&resolution),
                    overrides: spec.overrides,
                    registry: Arc::clone(&self.registry),
                    chat_client: Arc::clone(&llm.chat),
                    responses_client: Arc::clone(&llm.responses),
                    memory: memory.clone(),
                    metrics: Arc::clone(&metrics),
                    phase: phase.clone(),
                    cfg: self.config.orchestrator.clone(),
                    timeouts: self.config.timeouts.clone(),
                },
            );

            let pipeline = CascadePipeline::new(
                session_id.clone(),
                orchestrator,
                phase,
                Arc::clone(&metrics),
                self.config.orchestrator.clone(),
                self.config.timeouts.clone(),
                Arc::clone(&self.catalog),
                CancellationToken::new(),
            );

            let tts_for_run: Arc<dyn TtsClient> = Arc::clone(&*tts_client);
            let result = pipeline.run(sink, source, stt_stream, tts_for_run).await;

            // Teardown: stop the write-behind loop, force a final bounded
            // flush, report metrics, release leases (by drop).
            if let Some(f) = flusher {
                f.abort();
            }
            memory
                .final_flush(Duration::from_millis(self.config.timeouts.drain_memory_ms))
                .await;
            metrics.log_summary(&session_id);
            info!("session ended");

            result.map(|_| session_id.clone())
        }
        .instrument(span)
        .await
    }

    /// Serve one realtime-mode session over an established service
    /// connection.
    pub async fn run_realtime(
        &self,
        spec: SessionSpec,
        client: Box<dyn RealtimeClient>,
        sink: Box<dyn TransportSink>,
        source: Box<dyn TransportSource>,
    ) -> Result<String, SessionError> {
        let session_id = Uuid::new_v4().to_string();
        let correlation_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "session",
            session_id = %session_id,
            correlation_id = %correlation_id,
            transport = %spec.transport.unwrap_or(TransportKind::BrowserPcm),
            mode = "realtime",
        );

        async {
            let resolution = self.resolve_scenario(spec.scenario.as_deref())?;
            info!(scenario = %resolution.scenario_name, start_agent = %resolution.start_agent,
                  "session connected");

            let memory = self.build_memory(&session_id);
            let flusher = self.store.as_ref().map(|_| {
                memory.spawn_flusher(Duration::from_millis(
                    self.config.orchestrator.memory_flush_ms,
                ))
            });
            let metrics = Arc::new(RuntimeMetrics::new());

            let pipeline = RealtimePipeline::new(
                session_id.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.catalog),
                resolution,
                spec.overrides,
                memory.clone(),
                Arc::clone(&metrics),
                SharedPhase::new(),
                self.config.orchestrator.clone(),
                self.config.timeouts.clone(),
                CancellationToken::new(),
            );

            let result = pipeline.run(client, sink, source).await;

            if let Some(f) = flusher {
                f.abort();
            }
            memory
                .final_flush(Duration::from_millis(self.config.timeouts.drain_memory_ms))
                .await;
            metrics.log_summary(&session_id);
            info!("session ended");

            result.map(|_| session_id.clone())
        }
        .instrument(span)
        .await
    }

    fn build_memory(&self, session_id: &str) -> MemoryManager {
        let memory = MemoryManager::new(session_id, self.config.orchestrator.history_window);
        match &self.store {
            Some(store) => memory.with_store(Arc::clone(store)),
            None => memory,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
