//! `sessions_spawn` — delegate a task to a fresh sub-agent session.
//!
//! The tool registers the run, creates the child session, and publishes
//! an internal inbound message; the sub-run then travels the normal
//! manager pathway on the `subagent` lane. The tool returns immediately —
//! the requester hears back via the completion announcement.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use hivebot_core::bus::types::InboundMessage;
use hivebot_core::config::ConfigGetter;
use hivebot_core::session::{SessionKey, SessionStore};
use hivebot_core::types::ToolOutput;

use super::base::{optional_string, require_string, PartialFn, Tool, ToolContext};
use crate::subagent::{
    CleanupPolicy, RequesterOrigin, SubagentRegistry, SubagentRunRecord,
};

/// Tool that spawns delegated sub-agent runs.
pub struct SessionsSpawnTool {
    registry: Arc<SubagentRegistry>,
    sessions: Arc<SessionStore>,
    inbound: mpsc::Sender<InboundMessage>,
    config: ConfigGetter,
}

impl SessionsSpawnTool {
    pub fn new(
        registry: Arc<SubagentRegistry>,
        sessions: Arc<SessionStore>,
        inbound: mpsc::Sender<InboundMessage>,
        config: ConfigGetter,
    ) -> Self {
        SessionsSpawnTool {
            registry,
            sessions,
            inbound,
            config,
        }
    }
}

#[async_trait]
impl Tool for SessionsSpawnTool {
    fn name(&self) -> &str {
        "sessions_spawn"
    }

    fn description(&self) -> &str {
        "Delegate a task to a sub-agent running in its own fresh session. \
         Use this for complex or long-running work that can proceed \
         independently; you'll receive the findings when it completes."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task for the sub-agent to complete"
                },
                "label": {
                    "type": "string",
                    "description": "Optional short label for the task (for display)"
                },
                "cleanup": {
                    "type": "string",
                    "enum": ["keep", "delete"],
                    "description": "Whether to keep or delete the child session after the result is announced"
                },
                "agent_id": {
                    "type": "string",
                    "description": "Run the task as a different agent (defaults to the current one)"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(
        &self,
        ctx: ToolContext,
        params: HashMap<String, Value>,
        _on_partial: Option<PartialFn>,
    ) -> anyhow::Result<ToolOutput> {
        let task = require_string(&params, "task")?;
        let label = optional_string(&params, "label");
        let config = (self.config)();

        let cleanup = optional_string(&params, "cleanup")
            .map(|s| CleanupPolicy::parse(&s))
            .unwrap_or_else(|| CleanupPolicy::parse(&config.subagents.cleanup));
        let agent_id = optional_string(&params, "agent_id").unwrap_or_else(|| ctx.agent_id.clone());

        let run_id = uuid::Uuid::new_v4().to_string();
        let child_session_key = SessionKey::subagent(&agent_id, &run_id).to_string();

        let record = SubagentRunRecord {
            run_id: run_id.clone(),
            child_session_key: child_session_key.clone(),
            requester_session_key: ctx.session_key.clone(),
            requester_origin: RequesterOrigin {
                channel: ctx.origin_channel.clone(),
                account: ctx.origin_account.clone(),
                to: ctx.origin_chat_id.clone(),
                thread: ctx.origin_thread.clone(),
            },
            requester_display_key: ctx.session_key.clone(),
            task: task.clone(),
            label: label.clone(),
            cleanup,
            archive_after_minutes: config.subagents.archive_after_minutes,
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            announced: false,
        };
        self.registry.register(record);

        // Child session carries its provenance in metadata.
        let mut metadata = HashMap::new();
        metadata.insert("spawnedBy".to_string(), ctx.session_key.clone());
        if let Some(label) = &label {
            metadata.insert("label".to_string(), label.clone());
        }
        self.sessions.patch_metadata(&child_session_key, metadata);

        self.inbound
            .send(InboundMessage::internal(&run_id, &child_session_key, task))
            .await
            .map_err(|_| anyhow::anyhow!("inbound queue closed, cannot dispatch sub-agent"))?;

        info!(
            run_id = %run_id,
            child = %child_session_key,
            requester = %ctx.session_key,
            "sub-agent spawned"
        );

        let mut output = ToolOutput::text(format!(
            "Sub-agent started (run {run_id}). You'll be notified with its findings when it completes."
        ));
        output
            .details
            .insert("run_id".to_string(), json!(run_id));
        output
            .details
            .insert("child_session_key".to_string(), json!(child_session_key));
        Ok(output)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
