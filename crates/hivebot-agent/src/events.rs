//! Per-run agent events and the bounded event channel.
//!
//! Each orchestrator owns a fresh channel so events never bleed across
//! runs. Emits are non-blocking: a full buffer drops the event (counted
//! and debug-logged) rather than stalling the run for a slow subscriber.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use hivebot_core::bus::types::EventStream;
use hivebot_core::types::{Message, ToolOutput};

/// Buffer size of a run's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Structured lifecycle events emitted by one agent run.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    AgentStart,
    TurnStart {
        iteration: usize,
    },
    MessageStart,
    MessageDelta {
        content: String,
    },
    MessageEnd {
        message: Message,
    },
    ToolExecutionStart {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolExecutionUpdate {
        id: String,
        name: String,
        partial: ToolOutput,
    },
    ToolExecutionEnd {
        id: String,
        name: String,
        result: ToolOutput,
    },
    TurnEnd {
        stop_reason: Option<String>,
    },
    AgentEnd {
        final_messages: Vec<Message>,
    },
}

impl AgentEvent {
    /// Which bus stream this event belongs to when translated outward.
    pub fn stream(&self) -> EventStream {
        match self {
            AgentEvent::MessageStart
            | AgentEvent::MessageDelta { .. }
            | AgentEvent::MessageEnd { .. } => EventStream::Assistant,
            AgentEvent::ToolExecutionStart { .. }
            | AgentEvent::ToolExecutionUpdate { .. }
            | AgentEvent::ToolExecutionEnd { .. } => EventStream::Tool,
            AgentEvent::AgentStart
            | AgentEvent::TurnStart { .. }
            | AgentEvent::TurnEnd { .. }
            | AgentEvent::AgentEnd { .. } => EventStream::Lifecycle,
        }
    }

    /// Serialize into the bus event payload.
    pub fn to_payload(&self) -> serde_json::Value {
        match self {
            AgentEvent::AgentStart => json!({"kind": "agent_start"}),
            AgentEvent::TurnStart { iteration } => {
                json!({"kind": "turn_start", "iteration": iteration})
            }
            AgentEvent::MessageStart => json!({"kind": "message_start"}),
            AgentEvent::MessageDelta { content } => {
                json!({"kind": "message_delta", "content": content})
            }
            AgentEvent::MessageEnd { message } => {
                json!({"kind": "message_end", "role": message.role(), "content": message.text()})
            }
            AgentEvent::ToolExecutionStart { id, name, args } => {
                json!({"kind": "tool_start", "id": id, "name": name, "args": args})
            }
            AgentEvent::ToolExecutionUpdate { id, name, partial } => {
                json!({"kind": "tool_update", "id": id, "name": name, "partial": partial.content})
            }
            AgentEvent::ToolExecutionEnd { id, name, result } => {
                json!({
                    "kind": "tool_end",
                    "id": id,
                    "name": name,
                    "result": result.content,
                    "error": result.error_message(),
                })
            }
            AgentEvent::TurnEnd { stop_reason } => {
                json!({"kind": "turn_end", "stop_reason": stop_reason})
            }
            AgentEvent::AgentEnd { final_messages } => {
                json!({"kind": "agent_end", "messages": final_messages.len()})
            }
        }
    }
}

/// Non-blocking sender half of a run's event channel.
#[derive(Clone)]
pub struct EventChannel {
    tx: mpsc::Sender<AgentEvent>,
    dropped: Arc<AtomicUsize>,
}

/// Create a fresh per-run event channel.
pub fn event_channel() -> (EventChannel, mpsc::Receiver<AgentEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (
        EventChannel {
            tx,
            dropped: Arc::new(AtomicUsize::new(0)),
        },
        rx,
    )
}

impl EventChannel {
    /// Emit an event. Never blocks; a full or closed channel drops the
    /// event and bumps the counter.
    pub fn emit(&self, event: AgentEvent) {
        if let Err(e) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(reason = %e, "agent event dropped");
        }
    }

    /// Number of events dropped so far.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
