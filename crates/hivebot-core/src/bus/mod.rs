//! In-process pub/sub: bounded inbound queue + fan-out for outbound
//! messages and agent events.

pub mod queue;
pub mod types;

pub use queue::{MessageBus, Subscription};
pub use types::{
    AgentEventRecord, ChatState, EventStream, InboundMessage, OutboundMessage, INTERNAL_CHANNEL,
};
