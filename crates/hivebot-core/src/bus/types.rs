//! Bus record types — messages and events flowing between channels, the
//! agent manager, and subscribers (gateway/UI).

use crate::types::MediaAttachment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The reserved channel name used for runtime-internal messages
/// (sub-agent task dispatch). For this channel, `chat_id` is a child
/// session key and `id` is the sub-run's run ID.
pub const INTERNAL_CHANNEL: &str = "internal";

/// An inbound message from a channel to the agent manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Message/run identifier. For `internal` messages this is the run ID.
    pub id: String,
    /// Channel name (e.g. "websocket", "internal", "telegram").
    pub channel: String,
    /// Sender identifier within the channel.
    pub sender_id: String,
    /// Chat/conversation identifier; interpretation varies by channel.
    pub chat_id: String,
    /// Text content of the message.
    pub content: String,
    /// When the message was received.
    pub timestamp: DateTime<Utc>,
    /// Attached media (photos, voice, documents).
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata (e.g. message_id, thread, account).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InboundMessage {
    /// Create a new inbound message with minimal required fields.
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        InboundMessage {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Create an `internal` inbound message targeting a session key.
    pub fn internal(run_id: impl Into<String>, session_key: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = InboundMessage::new(INTERNAL_CHANNEL, "runtime", session_key, content);
        msg.id = run_id.into();
        msg
    }

    /// Whether this message came from the internal channel.
    pub fn is_internal(&self) -> bool {
        self.channel == INTERNAL_CHANNEL
    }

    /// The account identifier within the channel, when the adapter set one.
    pub fn account(&self) -> Option<&str> {
        self.metadata.get("account").map(|s| s.as_str())
    }
}

/// Delivery state of an outbound message.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    /// Terminal message of a run; the client can close its spinner.
    Final,
    /// The run failed; `content` carries a user-friendly message.
    Error,
}

/// An outbound message from the agent manager to a channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// The run ID that produced this message.
    pub id: String,
    /// Target channel name.
    pub channel: String,
    /// Target chat/conversation identifier.
    pub chat_id: String,
    /// Text content to send.
    pub content: String,
    /// Whether this is a streaming partial (accumulated text so far).
    #[serde(default)]
    pub is_stream: bool,
    /// Terminal state, set only on the last record of a run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_state: Option<ChatState>,
    /// When the message was produced.
    pub timestamp: DateTime<Utc>,
    /// Channel-specific metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl OutboundMessage {
    /// Create a new outbound message.
    pub fn new(
        id: impl Into<String>,
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        OutboundMessage {
            id: id.into(),
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            is_stream: false,
            chat_state: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Mark as a streaming partial.
    pub fn streaming(mut self) -> Self {
        self.is_stream = true;
        self
    }

    /// Mark with a terminal chat state.
    pub fn with_state(mut self, state: ChatState) -> Self {
        self.chat_state = Some(state);
        self
    }
}

/// Which orchestrator stream an agent event record belongs to.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventStream {
    /// Assistant text production (deltas, message boundaries).
    Assistant,
    /// Tool execution progress.
    Tool,
    /// Run lifecycle (start/end/error).
    Lifecycle,
}

/// A structured agent event published on the bus for subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentEventRecord {
    /// The run that produced the event.
    pub run_id: String,
    /// Monotonically increasing per-run sequence number.
    pub seq: u64,
    /// When the event was published.
    pub ts: DateTime<Utc>,
    /// Session the run is bound to, so subscribers can filter.
    pub session_key: String,
    /// Stream tag.
    pub stream: EventStream,
    /// Event payload.
    pub data: serde_json::Value,
}
