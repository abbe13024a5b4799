//! Typed configuration schema.
//!
//! Serialized as camelCase JSON; every section has defaults so a partial
//! (or missing) config file still yields a working runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub agents: AgentsConfig,
    pub providers: ProvidersConfig,
    pub lanes: LanesConfig,
    pub subagents: SubagentsConfig,
}

// ─────────────────────────────────────────────
// Agents
// ─────────────────────────────────────────────

/// Agent roster and routing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentsConfig {
    /// Defaults applied to every agent unless overridden per instance.
    pub defaults: AgentDefaults,
    /// Named agents. The roster always implicitly contains `defaultAgent`.
    pub instances: Vec<AgentInstance>,
    /// (channel, account) → agent routing table.
    pub bindings: Vec<ChannelBinding>,
    /// Agent that receives unmatched inbound traffic.
    pub default_agent: String,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            defaults: AgentDefaults::default(),
            instances: Vec::new(),
            bindings: Vec::new(),
            default_agent: "main".to_string(),
        }
    }
}

/// Per-agent defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentDefaults {
    /// Model identifier passed to the provider layer.
    pub model: String,
    /// Maximum tokens to generate per call.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Max LLM ↔ tool iterations per run.
    pub max_tool_iterations: usize,
    /// Context window budget in tokens; 0 means "use the profile's window".
    pub context_window_tokens: u32,
    /// Keep only the last N user turns of history (None = unlimited).
    pub max_history_turns: Option<usize>,
    /// Hard deadline for a single run, in seconds (None = unlimited).
    pub run_timeout_seconds: Option<u64>,
    /// Minimum interval between consecutive LLM calls, in milliseconds.
    pub min_call_interval_ms: u64,
    /// Workspace root for prompts and skills.
    pub workspace: String,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: 20,
            context_window_tokens: 0,
            max_history_turns: None,
            run_timeout_seconds: None,
            min_call_interval_ms: 0,
            workspace: "~/.hivebot/workspace".to_string(),
        }
    }
}

/// One named agent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentInstance {
    pub id: String,
    /// Model override for this agent.
    pub model: Option<String>,
}

/// Routes inbound messages from (channel, account) to an agent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelBinding {
    pub channel: String,
    /// None matches any account on the channel.
    pub account: Option<String>,
    pub agent_id: String,
}

// ─────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────

/// Provider profiles and rotation policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProvidersConfig {
    /// Priority-ordered provider profiles.
    pub profiles: Vec<ProfileConfig>,
    /// Rotation + retry tuning.
    pub rotation: RotationConfig,
    /// Process-wide cap on concurrent LLM calls (None = unlimited).
    pub max_concurrent_calls: Option<usize>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            rotation: RotationConfig::default(),
            max_concurrent_calls: None,
        }
    }
}

/// One provider profile (credentials + endpoint + priority).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfileConfig {
    pub name: String,
    pub api_key: String,
    /// Base URL; None means the standard OpenAI endpoint.
    pub api_base: Option<String>,
    /// Model override when this profile is selected.
    pub model: Option<String>,
    /// Lower numbers are tried first.
    pub priority: u32,
    /// Extra headers sent with each request.
    pub extra_headers: Option<HashMap<String, String>>,
    /// This profile's context window, in tokens; 0 means unspecified.
    pub context_window_tokens: u32,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            api_key: String::new(),
            api_base: None,
            model: None,
            priority: 100,
            extra_headers: None,
            context_window_tokens: 0,
        }
    }
}

impl ProfileConfig {
    /// Whether the profile has credentials.
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Rotation strategy and retry/backoff tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RotationConfig {
    /// "roundRobin", "leastUsed", or "random".
    pub strategy: String,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            strategy: "roundRobin".to_string(),
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

// ─────────────────────────────────────────────
// Lanes
// ─────────────────────────────────────────────

/// Lane scheduler tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LanesConfig {
    /// Width of the shared `subagent` lane.
    pub subagent_concurrency: usize,
    /// Queue-wait threshold before telemetry fires, in milliseconds.
    pub warn_after_ms: u64,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            subagent_concurrency: 8,
            warn_after_ms: 5_000,
        }
    }
}

// ─────────────────────────────────────────────
// Sub-agents
// ─────────────────────────────────────────────

/// Sub-agent run overrides and lifecycle policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubagentsConfig {
    /// Model override for delegated runs (often a cheaper model).
    pub model: Option<String>,
    /// Iteration cap override for delegated runs.
    pub max_iterations: Option<usize>,
    /// Stale threshold for crash recovery, in minutes.
    pub archive_after_minutes: i64,
    /// Default cleanup policy: "keep" or "delete".
    pub cleanup: String,
}

impl Default for SubagentsConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_iterations: Some(15),
            archive_after_minutes: 60,
            cleanup: "keep".to_string(),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
