//! Async message bus — the central nervous system of Hivebot.
//!
//! Inbound is a bounded single-consumer queue drained by the agent
//! manager's loop. Outbound and agent events fan out to every active
//! subscriber; a slow subscriber never blocks the publisher — when its
//! buffer is full the record is dropped for that subscriber only and a
//! per-subscriber drop counter is incremented.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{AgentEventRecord, InboundMessage, OutboundMessage};

/// Default capacity of the inbound queue.
pub const INBOUND_CAPACITY: usize = 1024;

/// Default capacity of each subscriber's buffer.
pub const SUBSCRIBER_CAPACITY: usize = 256;

// ─────────────────────────────────────────────
// Fan-out channel
// ─────────────────────────────────────────────

struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicUsize>,
}

/// A multi-subscriber fan-out channel with non-blocking publish.
struct FanOut<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl<T: Clone> FanOut<T> {
    fn new(capacity: usize) -> Self {
        FanOut {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            capacity,
        }
    }

    fn subscribe(&self) -> (mpsc::Receiver<T>, Subscription) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut subs = self.subscribers.lock().unwrap();
        subs.push(Subscriber {
            id,
            tx,
            dropped: dropped.clone(),
        });
        (rx, Subscription { id, dropped })
    }

    fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|s| s.id != id);
    }

    /// Publish to every subscriber. Full buffers drop; closed receivers
    /// are pruned.
    fn publish(&self, value: &T) {
        let mut closed: Vec<u64> = Vec::new();
        {
            let subs = self.subscribers.lock().unwrap();
            for sub in subs.iter() {
                match sub.tx.try_send(value.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        sub.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(subscriber = sub.id, "subscriber buffer full, record dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(sub.id);
                    }
                }
            }
        }
        if !closed.is_empty() {
            let mut subs = self.subscribers.lock().unwrap();
            subs.retain(|s| !closed.contains(&s.id));
        }
    }

    fn len(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

/// Handle identifying one subscription. Exposes the subscriber's drop
/// counter; pass it back to `unsubscribe_*` to detach explicitly.
pub struct Subscription {
    id: u64,
    dropped: Arc<AtomicUsize>,
}

impl Subscription {
    /// Number of records dropped for this subscriber because its buffer
    /// was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Opaque subscriber id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

// ─────────────────────────────────────────────
// MessageBus
// ─────────────────────────────────────────────

/// The message bus connecting channels, the agent manager, and subscribers.
///
/// - Channels publish to `inbound` (user messages arriving)
/// - The agent manager consumes `inbound`, processes, publishes `outbound`
/// - Gateways/UIs subscribe to `outbound` and to structured agent events
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
    outbound: FanOut<OutboundMessage>,
    events: FanOut<AgentEventRecord>,
}

impl MessageBus {
    /// Create a new message bus with the default capacities.
    pub fn new() -> Self {
        Self::with_capacity(INBOUND_CAPACITY, SUBSCRIBER_CAPACITY)
    }

    /// Create a new message bus with explicit capacities.
    pub fn with_capacity(inbound: usize, subscriber: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound);
        MessageBus {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound: FanOut::new(subscriber),
            events: FanOut::new(subscriber),
        }
    }

    /// Publish a message from a channel to the agent manager (inbound).
    pub async fn publish_inbound(&self, msg: InboundMessage) -> anyhow::Result<()> {
        self.inbound_tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("inbound queue closed"))
    }

    /// Consume the next inbound message (blocks until available).
    /// Returns None if all senders are dropped.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }

    /// Get a clone of the inbound sender (for channels to use).
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Fan an outbound message out to every subscriber. Never blocks.
    pub fn publish_outbound(&self, msg: OutboundMessage) {
        if self.outbound.len() == 0 {
            warn!(run_id = %msg.id, "outbound published with no subscribers");
        }
        self.outbound.publish(&msg);
    }

    /// Fan a structured agent event out to every subscriber. Never blocks.
    pub fn publish_agent_event(&self, evt: AgentEventRecord) {
        self.events.publish(&evt);
    }

    /// Subscribe to outbound messages.
    pub fn subscribe_outbound(&self) -> (mpsc::Receiver<OutboundMessage>, Subscription) {
        self.outbound.subscribe()
    }

    /// Subscribe to agent events.
    pub fn subscribe_events(&self) -> (mpsc::Receiver<AgentEventRecord>, Subscription) {
        self.events.subscribe()
    }

    /// Detach an outbound subscriber.
    pub fn unsubscribe_outbound(&self, sub: &Subscription) {
        self.outbound.unsubscribe(sub.id);
    }

    /// Detach an event subscriber.
    pub fn unsubscribe_events(&self, sub: &Subscription) {
        self.events.unsubscribe(sub.id);
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::types::{ChatState, EventStream};

    #[tokio::test]
    async fn test_inbound_message_flow() {
        let bus = MessageBus::new();

        let msg = InboundMessage::new("websocket", "user_1", "agent:main:main", "Hello!");
        bus.publish_inbound(msg).await.unwrap();

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.channel, "websocket");
        assert_eq!(received.content, "Hello!");
    }

    #[tokio::test]
    async fn test_inbound_ordering() {
        let bus = MessageBus::new();

        for i in 1..=3 {
            let msg = InboundMessage::new("websocket", "local", "agent:main:main", format!("msg-{}", i));
            bus.publish_inbound(msg).await.unwrap();
        }

        let m1 = bus.consume_inbound().await.unwrap();
        let m2 = bus.consume_inbound().await.unwrap();
        let m3 = bus.consume_inbound().await.unwrap();

        assert_eq!(m1.content, "msg-1");
        assert_eq!(m2.content, "msg-2");
        assert_eq!(m3.content, "msg-3");
    }

    #[tokio::test]
    async fn test_outbound_fan_out() {
        let bus = MessageBus::new();

        let (mut rx1, _sub1) = bus.subscribe_outbound();
        let (mut rx2, _sub2) = bus.subscribe_outbound();

        let msg = OutboundMessage::new("r1", "websocket", "agent:main:main", "hi")
            .with_state(ChatState::Final);
        bus.publish_outbound(msg);

        let got1 = rx1.recv().await.unwrap();
        let got2 = rx2.recv().await.unwrap();
        assert_eq!(got1.content, "hi");
        assert_eq!(got2.content, "hi");
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let bus = MessageBus::with_capacity(16, 4);

        // Subscriber 0 never reads; its buffer (4) overflows.
        let (_stuck_rx, stuck_sub) = bus.subscribe_outbound();
        let (mut live_rx, live_sub) = bus.subscribe_outbound();

        for i in 0..10 {
            let msg = OutboundMessage::new("r", "websocket", "c", format!("m{}", i));
            bus.publish_outbound(msg);
        }

        // The live subscriber sees records up to its own capacity; drain it.
        let mut live_count = 0;
        while let Ok(m) = live_rx.try_recv() {
            assert_eq!(m.content, format!("m{}", live_count));
            live_count += 1;
        }
        assert_eq!(live_count, 4);
        assert_eq!(live_sub.dropped(), 6);

        // The stuck subscriber dropped everything past its buffer.
        assert_eq!(stuck_sub.dropped(), 6);
    }

    #[tokio::test]
    async fn test_per_subscriber_ordering_preserved() {
        let bus = MessageBus::new();
        let (mut rx, _sub) = bus.subscribe_outbound();

        for i in 0..20 {
            bus.publish_outbound(OutboundMessage::new("r", "websocket", "c", format!("{}", i)));
        }

        for i in 0..20 {
            let m = rx.recv().await.unwrap();
            assert_eq!(m.content, format!("{}", i));
        }
    }

    #[tokio::test]
    async fn test_closed_subscriber_pruned() {
        let bus = MessageBus::new();
        {
            let (_rx, _sub) = bus.subscribe_outbound();
            // rx dropped here
        }
        // Publishing after the receiver is gone prunes it without error.
        bus.publish_outbound(OutboundMessage::new("r", "websocket", "c", "x"));
        bus.publish_outbound(OutboundMessage::new("r", "websocket", "c", "y"));
        assert_eq!(bus.outbound.len(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = MessageBus::new();
        let (_rx, sub) = bus.subscribe_events();
        assert_eq!(bus.events.len(), 1);
        bus.unsubscribe_events(&sub);
        assert_eq!(bus.events.len(), 0);
    }

    #[tokio::test]
    async fn test_agent_event_fan_out() {
        let bus = MessageBus::new();
        let (mut rx, _sub) = bus.subscribe_events();

        bus.publish_agent_event(AgentEventRecord {
            run_id: "r1".into(),
            seq: 0,
            ts: chrono::Utc::now(),
            session_key: "agent:main:main".into(),
            stream: EventStream::Lifecycle,
            data: serde_json::json!({"phase": "start"}),
        });

        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.run_id, "r1");
        assert_eq!(evt.data["phase"], "start");
    }

    #[tokio::test]
    async fn test_multiple_producers() {
        let bus = std::sync::Arc::new(MessageBus::new());

        let bus1 = bus.clone();
        let bus2 = bus.clone();

        let h1 = tokio::spawn(async move {
            let msg = InboundMessage::new("telegram", "u1", "c1", "from telegram");
            bus1.publish_inbound(msg).await.unwrap();
        });

        let h2 = tokio::spawn(async move {
            let msg = InboundMessage::new("websocket", "u2", "c2", "from websocket");
            bus2.publish_inbound(msg).await.unwrap();
        });

        h1.await.unwrap();
        h2.await.unwrap();

        let r1 = bus.consume_inbound().await.unwrap();
        let r2 = bus.consume_inbound().await.unwrap();

        let channels: Vec<&str> = vec![r1.channel.as_str(), r2.channel.as_str()];
        assert!(channels.contains(&"telegram"));
        assert!(channels.contains(&"websocket"));
    }
}
