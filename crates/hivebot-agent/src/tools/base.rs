//! Tool trait — the interface every agent tool implements.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use hivebot_core::types::{ToolDefinition, ToolOutput};

/// Callback for partial tool results. Implementations that cannot stream
/// simply never call it; the final result travels in the return value.
pub type PartialFn = Arc<dyn Fn(ToolOutput) + Send + Sync>;

/// Ambient context handed to each tool execution.
#[derive(Clone)]
pub struct ToolContext {
    /// Session the run is bound to.
    pub session_key: String,
    /// The run executing this call.
    pub run_id: String,
    /// Agent the session belongs to.
    pub agent_id: String,
    /// Channel that originated the run.
    pub origin_channel: String,
    /// Chat/conversation within the channel.
    pub origin_chat_id: String,
    /// Channel account, when the adapter set one.
    pub origin_account: Option<String>,
    /// Thread within the chat, when the adapter set one.
    pub origin_thread: Option<String>,
    /// Cancelled when the run is aborted; tools must honor it.
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// A bare context for tests and internal invocations.
    pub fn internal(session_key: impl Into<String>, agent_id: impl Into<String>) -> Self {
        ToolContext {
            session_key: session_key.into(),
            run_id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            origin_channel: "internal".to_string(),
            origin_chat_id: String::new(),
            origin_account: None,
            origin_thread: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Every agent tool implements this trait.
///
/// The orchestrator discovers tools via `name()`, sends their schemas to
/// the LLM via `to_definition()`, and dispatches calls via `execute()`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used by the LLM to call this tool.
    fn name(&self) -> &str;

    /// Human-readable description shown to the LLM.
    fn description(&self) -> &str;

    /// JSON Schema describing the parameters.
    ///
    /// Must be `{"type": "object", "properties": {...}, "required": [...]}`.
    fn parameters(&self) -> Value;

    /// Execute the tool with the given arguments.
    ///
    /// `on_partial` streams intermediate results when provided. Errors are
    /// folded into a tool-result message by the orchestrator; the loop
    /// always continues.
    async fn execute(
        &self,
        ctx: ToolContext,
        params: HashMap<String, Value>,
        on_partial: Option<PartialFn>,
    ) -> anyhow::Result<ToolOutput>;

    /// Build the `ToolDefinition` sent to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }
}

// ─────────────────────────────────────────────
// Param helpers
// ─────────────────────────────────────────────

/// Extract a required `String` param, returning a user-friendly error.
pub fn require_string(params: &HashMap<String, Value>, key: &str) -> anyhow::Result<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {key}"))
}

/// Extract an optional `String` param.
pub fn optional_string(params: &HashMap<String, Value>, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Extract an optional integer param.
pub fn optional_i64(params: &HashMap<String, Value>, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}
