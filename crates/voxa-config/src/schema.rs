// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub pools: PoolsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the chat-completions endpoint (without `/chat/completions`).
    pub base_url: String,
    /// Base URL of the responses endpoint.  Defaults to `base_url` when empty.
    #[serde(default)]
    pub responses_base_url: Option<String>,
    /// Default deployment/model id; agents may override per their model prefs.
    pub deployment: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Use the scripted in-process backend instead of HTTP ("mock" | "http").
    #[serde(default = "default_http")]
    pub backend: String,
}

fn default_http() -> String {
    "http".into()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            responses_base_url: None,
            deployment: "gpt-4o".into(),
            api_key_env: None,
            api_key: None,
            max_tokens: Some(4096),
            temperature: Some(0.3),
            backend: "http".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    pub endpoint: String,
    pub api_key_env: Option<String>,
    /// Language hint forwarded to the recognizer.
    #[serde(default = "default_language")]
    pub language: String,
    /// Milliseconds of trailing silence before a transcript is finalized.
    #[serde(default = "default_vad_hang_ms")]
    pub vad_hang_ms: u64,
    #[serde(default = "default_http")]
    pub backend: String,
}

fn default_language() -> String {
    "en-US".into()
}
fn default_vad_hang_ms() -> u64 {
    700
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key_env: None,
            language: default_language(),
            vad_hang_ms: default_vad_hang_ms(),
            backend: "http".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub endpoint: String,
    pub api_key_env: Option<String>,
    /// Default voice id used when the active agent declares none.
    #[serde(default = "default_voice")]
    pub default_voice: String,
    #[serde(default = "default_http")]
    pub backend: String,
}

fn default_voice() -> String {
    "en-US-standard-1".into()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key_env: None,
            default_voice: default_voice(),
            backend: "http".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// WebSocket URL of the bidirectional speech-LLM service.
    pub endpoint: String,
    pub api_key_env: Option<String>,
    /// Deployment id of the realtime model.
    #[serde(default)]
    pub deployment: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key_env: None,
            deployment: String::new(),
        }
    }
}

/// Sizing for one pre-warmed client pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Clients built eagerly at startup.
    #[serde(default = "default_warm")]
    pub warm: usize,
    /// Hard ceiling on concurrently leased + warm clients.
    #[serde(default = "default_max")]
    pub max: usize,
    /// How long `acquire` waits for a free handle before failing the connect.
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,
    /// Warm handles idle longer than this are dropped.
    #[serde(default = "default_idle_evict_secs")]
    pub idle_evict_secs: u64,
}

fn default_warm() -> usize {
    2
}
fn default_max() -> usize {
    16
}
fn default_lease_timeout_ms() -> u64 {
    1_000
}
fn default_idle_evict_secs() -> u64 {
    300
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            warm: default_warm(),
            max: default_max(),
            lease_timeout_ms: default_lease_timeout_ms(),
            idle_evict_secs: default_idle_evict_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolsConfig {
    #[serde(default)]
    pub llm: PoolConfig,
    #[serde(default)]
    pub stt: PoolConfig,
    #[serde(default)]
    pub tts: PoolConfig,
}

/// All wall-clock bounds in one place.  Every value is overridable from YAML;
/// the defaults are the contract numbers the pipelines are tested against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_llm_connect_ms")]
    pub llm_connect_ms: u64,
    #[serde(default = "default_llm_first_token_ms")]
    pub llm_first_token_ms: u64,
    #[serde(default = "default_llm_inter_token_ms")]
    pub llm_inter_token_ms: u64,
    /// Full-turn ceiling including all tool hops.
    #[serde(default = "default_turn_ms")]
    pub turn_ms: u64,
    /// Per-tool-call deadline; individual tools may declare a tighter one.
    #[serde(default = "default_tool_ms")]
    pub tool_ms: u64,
    #[serde(default = "default_tts_chunk_ms")]
    pub tts_chunk_ms: u64,
    /// Session-end bound on the final memory flush.
    #[serde(default = "default_drain_memory_ms")]
    pub drain_memory_ms: u64,
    /// Session-end bound on in-flight tool executions.
    #[serde(default = "default_drain_tools_ms")]
    pub drain_tools_ms: u64,
    /// How long a FINAL transcript enqueue may block when the speech-event
    /// queue is full before the turn is dropped.
    #[serde(default = "default_final_enqueue_ms")]
    pub final_enqueue_ms: u64,
}

fn default_llm_connect_ms() -> u64 {
    5_000
}
fn default_llm_first_token_ms() -> u64 {
    3_000
}
fn default_llm_inter_token_ms() -> u64 {
    8_000
}
fn default_turn_ms() -> u64 {
    60_000
}
fn default_tool_ms() -> u64 {
    10_000
}
fn default_tts_chunk_ms() -> u64 {
    2_000
}
fn default_drain_memory_ms() -> u64 {
    2_000
}
fn default_drain_tools_ms() -> u64 {
    5_000
}
fn default_final_enqueue_ms() -> u64 {
    5_000
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            llm_connect_ms: default_llm_connect_ms(),
            llm_first_token_ms: default_llm_first_token_ms(),
            llm_inter_token_ms: default_llm_inter_token_ms(),
            turn_ms: default_turn_ms(),
            tool_ms: default_tool_ms(),
            tts_chunk_ms: default_tts_chunk_ms(),
            drain_memory_ms: default_drain_memory_ms(),
            drain_tools_ms: default_drain_tools_ms(),
            final_enqueue_ms: default_final_enqueue_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum call-execute-feedback cycles within a single turn.  Exceeding
    /// this yields a synthesized apology and ends the turn.
    #[serde(default = "default_max_tool_hops")]
    pub max_tool_hops: u32,
    /// Milliseconds of tool execution before the filler phrase is spoken so
    /// the line is not silent.
    #[serde(default = "default_filler_delay_ms")]
    pub filler_delay_ms: u64,
    /// Phrase synthesized while a slow tool runs.
    #[serde(default = "default_filler_phrase")]
    pub filler_phrase: String,
    /// Fixed phrase spoken when a turn fails unrecoverably.
    #[serde(default = "default_apology_phrase")]
    pub apology_phrase: String,
    /// Messages per agent retained for prompt construction.  The append-only
    /// audit log is unbounded regardless.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Transient upstream faults are retried this many times.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base backoff for retry attempt n: base × 2^n, plus jitter.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Interval between write-behind memory flushes.
    #[serde(default = "default_memory_flush_ms")]
    pub memory_flush_ms: u64,
    /// Capacity of the cascade speech-event queue.
    #[serde(default = "default_speech_queue_capacity")]
    pub speech_queue_capacity: usize,
}

fn default_max_tool_hops() -> u32 {
    6
}
fn default_filler_delay_ms() -> u64 {
    800
}
fn default_filler_phrase() -> String {
    "One moment, please.".into()
}
fn default_apology_phrase() -> String {
    "I'm sorry, something went wrong on my end. Could you say that again?".into()
}
fn default_history_window() -> usize {
    64
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    100
}
fn default_memory_flush_ms() -> u64 {
    500
}
fn default_speech_queue_capacity() -> usize {
    32
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_hops: default_max_tool_hops(),
            filler_delay_ms: default_filler_delay_ms(),
            filler_phrase: default_filler_phrase(),
            apology_phrase: default_apology_phrase(),
            history_window: default_history_window(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
            memory_flush_ms: default_memory_flush_ms(),
            speech_queue_capacity: default_speech_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Directory of agent YAML files.
    #[serde(default = "default_agents_dir")]
    pub agents_dir: String,
    /// Directory of scenario YAML files.
    #[serde(default = "default_scenarios_dir")]
    pub scenarios_dir: String,
    /// Scenario used when a session names none.
    #[serde(default)]
    pub default_scenario: Option<String>,
    /// Registry-level default start agent (lowest precedence).
    #[serde(default)]
    pub default_agent: Option<String>,
    /// Environment variable consulted for a start-agent override
    /// (precedence: scenario > env > this registry default).
    #[serde(default = "default_start_agent_env")]
    pub start_agent_env: String,
    /// Path of the SQLite memory/audit store.  Empty string keeps memory
    /// in-process only (tests, simulation).
    #[serde(default = "default_memory_db")]
    pub memory_db: String,
}

fn default_agents_dir() -> String {
    "catalog/agents".into()
}
fn default_scenarios_dir() -> String {
    "catalog/scenarios".into()
}
fn default_start_agent_env() -> String {
    "VOXA_START_AGENT".into()
}
fn default_memory_db() -> String {
    "voxa-memory.db".into()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            agents_dir: default_agents_dir(),
            scenarios_dir: default_scenarios_dir(),
            default_scenario: None,
            default_agent: None,
            start_agent_env: default_start_agent_env(),
            memory_db: default_memory_db(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
