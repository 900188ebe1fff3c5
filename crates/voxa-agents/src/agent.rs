// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use voxa_model::EndpointPreference;
use voxa_speech::{RealtimeSessionConfig, TurnDetection, VoiceSelection};

use crate::template::render_template;

/// Model parameters for one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPrefs {
    /// Deployment/model id; empty inherits the runtime default.
    #[serde(default)]
    pub deployment: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub endpoint: EndpointPreference,
}

/// Realtime-session defaults for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefaults {
    #[serde(default = "default_modalities")]
    pub modalities: Vec<String>,
    #[serde(default = "default_audio_format")]
    pub input_audio_format: String,
    #[serde(default = "default_audio_format")]
    pub output_audio_format: String,
    #[serde(default)]
    pub turn_detection: Option<TurnDetection>,
    #[serde(default)]
    pub transcription_model: Option<String>,
}

fn default_modalities() -> Vec<String> {
    vec!["audio".into(), "text".into()]
}
fn default_audio_format() -> String {
    "pcm16".into()
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            modalities: default_modalities(),
            input_audio_format: default_audio_format(),
            output_audio_format: default_audio_format(),
            turn_detection: Some(TurnDetection::default()),
            transcription_model: None,
        }
    }
}

/// A named, immutable bundle of prompt template, tool list, voice and model
/// config.  Loaded from the catalog at startup; mutations create a new value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Prompt template with `{{ var }}` placeholders.
    pub prompt: String,
    /// First-contact greeting template; empty means no greeting.
    #[serde(default)]
    pub greeting: String,
    /// Return-contact greeting template; falls back to `greeting` when empty.
    #[serde(default)]
    pub return_greeting: String,
    /// References into the tool registry.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: ModelPrefs,
    #[serde(default)]
    pub voice: VoiceSelection,
    #[serde(default)]
    pub session: SessionDefaults,
    /// Default prompt variables; session-start overrides win over these.
    #[serde(default)]
    pub prompt_defaults: HashMap<String, String>,
}

impl Agent {
    /// Render the system prompt against defaults overlaid with `vars`.
    pub fn render_prompt(&self, vars: &HashMap<String, String>) -> String {
        let merged = self.merged_vars(vars);
        render_template(&self.prompt, &merged)
    }

    /// Render the greeting for a first or return visit.  Returns `None` when
    /// the relevant template is empty (the agent greets silently).
    pub fn render_greeting(
        &self,
        first_visit: bool,
        vars: &HashMap<String, String>,
    ) -> Option<String> {
        let template = if first_visit {
            &self.greeting
        } else if self.return_greeting.is_empty() {
            // Return-contact falls back to first-contact if empty.
            &self.greeting
        } else {
            &self.return_greeting
        };
        if template.is_empty() {
            return None;
        }
        let merged = self.merged_vars(vars);
        Some(render_template(template, &merged))
    }

    /// Project this agent into the realtime session-update shape.
    ///
    /// `tool_schemas` is the registry projection of `self.tools` in the
    /// service's function-tool JSON format.
    pub fn realtime_projection(
        &self,
        vars: &HashMap<String, String>,
        tool_schemas: Vec<serde_json::Value>,
    ) -> RealtimeSessionConfig {
        RealtimeSessionConfig {
            instructions: self.render_prompt(vars),
            voice: self.voice.voice.clone(),
            modalities: self.session.modalities.clone(),
            input_audio_format: self.session.input_audio_format.clone(),
            output_audio_format: self.session.output_audio_format.clone(),
            turn_detection: self.session.turn_detection.clone(),
            transcription_model: self.session.transcription_model.clone(),
            tools: tool_schemas,
        }
    }

    fn merged_vars(&self, vars: &HashMap<String, String>) -> HashMap<String, String> {
        let mut merged = self.prompt_defaults.clone();
        for (k, v) in vars {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        Agent {
            name: "BankingConcierge".into(),
            description: "General banking assistant".into(),
            prompt: "You are {{ persona }} for {{ bank }}.".into(),
            greeting: "Welcome to {{ bank }}! How can I help?".into(),
            return_greeting: "Welcome back to {{ bank }}.".into(),
            tools: vec!["get_balance".into()],
            model: ModelPrefs::default(),
            voice: VoiceSelection { voice: "en-US-calm".into(), ..Default::default() },
            session: SessionDefaults::default(),
            prompt_defaults: [("persona".to_string(), "a concierge".to_string())]
                .into_iter()
                .collect(),
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn render_prompt_merges_defaults_and_overrides() {
        let a = agent();
        let p = a.render_prompt(&vars(&[("bank", "Acme Bank")]));
        assert_eq!(p, "You are a concierge for Acme Bank.");
    }

    #[test]
    fn session_vars_override_catalog_defaults() {
        let a = agent();
        let p = a.render_prompt(&vars(&[("persona", "a fraud specialist"), ("bank", "B")]));
        assert!(p.contains("a fraud specialist"));
        assert!(!p.contains("a concierge"));
    }

    #[test]
    fn first_visit_uses_first_contact_greeting() {
        let a = agent();
        let g = a.render_greeting(true, &vars(&[("bank", "Acme")])).unwrap();
        assert_eq!(g, "Welcome to Acme! How can I help?");
    }

    #[test]
    fn return_visit_uses_return_greeting() {
        let a = agent();
        let g = a.render_greeting(false, &vars(&[("bank", "Acme")])).unwrap();
        assert_eq!(g, "Welcome back to Acme.");
    }

    #[test]
    fn return_greeting_falls_back_to_first_contact_when_empty() {
        let mut a = agent();
        a.return_greeting = String::new();
        let g = a.render_greeting(false, &vars(&[("bank", "Acme")])).unwrap();
        assert!(g.starts_with("Welcome to Acme"));
    }

    #[test]
    fn empty_greeting_renders_none() {
        let mut a = agent();
        a.greeting = String::new();
        a.return_greeting = String::new();
        assert!(a.render_greeting(true, &HashMap::new()).is_none());
        assert!(a.render_greeting(false, &HashMap::new()).is_none());
    }

    #[test]
    fn realtime_projection_carries_voice_and_instructions() {
        let a = agent();
        let proj = a.realtime_projection(
            &vars(&[("bank", "Acme")]),
            vec![serde_json::json!({ "type": "function", "name": "get_balance" })],
        );
        assert_eq!(proj.voice, "en-US-calm");
        assert!(proj.instructions.contains("Acme"));
        assert_eq!(proj.tools.len(), 1);
        assert!(proj.turn_detection.is_some());
    }

    #[test]
    fn agent_yaml_round_trip() {
        let a = agent();
        let y = serde_yaml::to_string(&a).unwrap();
        let back: Agent = serde_yaml::from_str(&y).unwrap();
        assert_eq!(back.name, a.name);
        assert_eq!(back.tools, a.tools);
        assert_eq!(back.voice.voice, "en-US-calm");
    }

    #[test]
    fn minimal_agent_yaml_uses_defaults() {
        let y = "name: Min\nprompt: Hello.\n";
        let a: Agent = serde_yaml::from_str(y).unwrap();
        assert!(a.greeting.is_empty());
        assert!(a.tools.is_empty());
        assert_eq!(a.session.modalities, vec!["audio", "text"]);
        assert_eq!(a.model.endpoint, EndpointPreference::Auto);
    }
}
