//! Message bus for async channel-agent communication.
//!
//! Provides a thread-safe [`MessageBus`] with two bounded FIFO queues:
//! inbound (connectors → agent loop) and outbound (agent loop →
//! connectors).
//!
//! Publish never blocks the producer: when a queue is full or the bus is
//! stopped, the message is dropped with a warning. A slow agent must not
//! stall a connector's receive loop. Consumers block until a message is
//! available or the bus is stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, info, warn};

use spanbot_types::event::{InboundMessage, OutboundMessage};

use crate::recorder::BusRecorder;

/// Default queue capacity for each direction.
pub const DEFAULT_BUS_CAPACITY: usize = 100;

/// Two bounded FIFO queues decoupling connectors from the agent loop.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
    running: AtomicBool,
    stop_notify: Notify,
    recorder: Option<Arc<dyn BusRecorder>>,
}

impl MessageBus {
    /// Create a new message bus with the default capacity (100).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a new message bus with a custom per-direction capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

        debug!(capacity, "message bus created");

        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            running: AtomicBool::new(true),
            stop_notify: Notify::new(),
            recorder: None,
        }
    }

    /// Attach a recorder invoked synchronously on every accepted publish.
    pub fn with_recorder(mut self, recorder: Arc<dyn BusRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Whether the bus is accepting messages.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Publish an inbound message (from a connector).
    ///
    /// Never blocks: drops the message with a warning when the queue is
    /// full or the bus is stopped.
    pub fn publish_inbound(&self, msg: InboundMessage) {
        if !self.is_running() {
            warn!(
                channel = %msg.channel,
                chat_id = %msg.chat_id,
                "bus is stopped, dropping inbound message"
            );
            return;
        }

        // Recorders only see messages the queue accepted.
        let copy = self.recorder.as_ref().map(|_| msg.clone());
        match self.inbound_tx.try_send(msg) {
            Ok(()) => {
                if let (Some(recorder), Some(msg)) = (&self.recorder, copy) {
                    recorder.record_inbound(&msg);
                }
            }
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(
                    channel = %msg.channel,
                    chat_id = %msg.chat_id,
                    "inbound queue full, dropping message"
                );
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                warn!(
                    channel = %msg.channel,
                    chat_id = %msg.chat_id,
                    "inbound queue closed, dropping message"
                );
            }
        }
    }

    /// Publish an outbound message (from the agent loop).
    ///
    /// Never blocks: drops the message with a warning when the queue is
    /// full or the bus is stopped.
    pub fn publish_outbound(&self, msg: OutboundMessage) {
        if !self.is_running() {
            warn!(
                channel = %msg.channel,
                chat_id = %msg.chat_id,
                "bus is stopped, dropping outbound message"
            );
            return;
        }

        let copy = self.recorder.as_ref().map(|_| msg.clone());
        match self.outbound_tx.try_send(msg) {
            Ok(()) => {
                if let (Some(recorder), Some(msg)) = (&self.recorder, copy) {
                    recorder.record_outbound(&msg);
                }
            }
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(
                    channel = %msg.channel,
                    chat_id = %msg.chat_id,
                    "outbound queue full, dropping message"
                );
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                warn!(
                    channel = %msg.channel,
                    chat_id = %msg.chat_id,
                    "outbound queue closed, dropping message"
                );
            }
        }
    }

    /// Consume the next inbound message.
    ///
    /// Blocks until a message is available; returns `None` once the bus is
    /// stopped or the queue is closed.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            if !self.is_running() {
                return None;
            }
            tokio::select! {
                msg = rx.recv() => return msg,
                _ = self.stop_notify.notified() => continue,
            }
        }
    }

    /// Consume the next outbound message.
    ///
    /// Blocks until a message is available; returns `None` once the bus is
    /// stopped or the queue is closed.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        loop {
            if !self.is_running() {
                return None;
            }
            tokio::select! {
                msg = rx.recv() => return msg,
                _ = self.stop_notify.notified() => continue,
            }
        }
    }

    /// Stop the bus: reject new publishes and wake blocked consumers.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        info!("message bus stopped");
    }

    /// Start the bus again after a [`stop`](Self::stop).
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("message bus started");
    }

    /// Drain all pending messages from both queues.
    ///
    /// Waits for the receiver locks, so call [`stop`](Self::stop) first
    /// when consumers may be blocked in `consume_*`.
    pub async fn clear(&self) {
        let mut drained = 0usize;
        {
            let mut rx = self.inbound_rx.lock().await;
            while rx.try_recv().is_ok() {
                drained += 1;
            }
        }
        {
            let mut rx = self.outbound_rx.lock().await;
            while rx.try_recv().is_ok() {
                drained += 1;
            }
        }
        info!(drained, "message bus cleared");
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn make_inbound(content: &str) -> InboundMessage {
        InboundMessage::new("test", "user1", "chat1", content)
    }

    fn make_outbound(content: &str) -> OutboundMessage {
        OutboundMessage::new("test", "chat1", content)
    }

    #[tokio::test]
    async fn publish_and_consume_inbound() {
        let bus = MessageBus::new();
        bus.publish_inbound(make_inbound("hello"));

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.content, "hello");
        assert_eq!(received.channel, "test");
    }

    #[tokio::test]
    async fn publish_and_consume_outbound() {
        let bus = MessageBus::new();
        bus.publish_outbound(make_outbound("reply"));

        let received = bus.consume_outbound().await.unwrap();
        assert_eq!(received.content, "reply");
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let bus = MessageBus::new();
        for i in 0..5 {
            bus.publish_inbound(make_inbound(&format!("msg-{i}")));
        }
        for i in 0..5 {
            let msg = bus.consume_inbound().await.unwrap();
            assert_eq!(msg.content, format!("msg-{i}"));
        }
    }

    #[tokio::test]
    async fn inbound_and_outbound_are_independent() {
        let bus = MessageBus::new();
        bus.publish_inbound(make_inbound("in"));
        bus.publish_outbound(make_outbound("out"));

        assert_eq!(bus.consume_inbound().await.unwrap().content, "in");
        assert_eq!(bus.consume_outbound().await.unwrap().content, "out");
    }

    #[tokio::test]
    async fn publish_at_capacity_drops_without_blocking() {
        let bus = MessageBus::with_capacity(4);
        for i in 0..4 {
            bus.publish_inbound(make_inbound(&format!("msg-{i}")));
        }

        // The overflowing publish returns immediately and drops.
        bus.publish_inbound(make_inbound("overflow"));

        // Existing consumers are unaffected and see exactly the first four.
        for i in 0..4 {
            let msg = bus.consume_inbound().await.unwrap();
            assert_eq!(msg.content, format!("msg-{i}"));
        }
    }

    #[tokio::test]
    async fn stopped_bus_drops_publishes() {
        let bus = MessageBus::new();
        bus.stop();
        bus.publish_inbound(make_inbound("late"));
        bus.start();
        bus.publish_inbound(make_inbound("ok"));

        let msg = bus.consume_inbound().await.unwrap();
        assert_eq!(msg.content, "ok");
    }

    #[tokio::test]
    async fn stop_wakes_blocked_consumer() {
        let bus = Arc::new(MessageBus::new());
        let consumer_bus = bus.clone();

        let consumer = tokio::spawn(async move { consumer_bus.consume_inbound().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.stop();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake on stop")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn clear_drains_both_queues() {
        let bus = MessageBus::new();
        bus.publish_inbound(make_inbound("a"));
        bus.publish_outbound(make_outbound("b"));
        bus.clear().await;

        bus.publish_inbound(make_inbound("after"));
        let msg = bus.consume_inbound().await.unwrap();
        assert_eq!(msg.content, "after");
    }

    #[tokio::test]
    async fn payload_survives_roundtrip_unchanged() {
        let bus = MessageBus::new();
        let mut original = make_inbound("payload");
        original.media.push("/tmp/a.png".into());
        original
            .metadata
            .insert("message_id".into(), serde_json::json!(7));

        bus.publish_inbound(original.clone());
        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received, original);
    }

    struct CountingRecorder {
        outbound: AtomicUsize,
    }

    impl BusRecorder for CountingRecorder {
        fn record_inbound(&self, _msg: &InboundMessage) {}

        fn record_outbound(&self, _msg: &OutboundMessage) {
            self.outbound.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn recorder_sees_outbound_publishes() {
        let recorder = Arc::new(CountingRecorder {
            outbound: AtomicUsize::new(0),
        });
        let bus = MessageBus::new().with_recorder(recorder.clone());

        bus.publish_outbound(make_outbound("one"));
        bus.publish_outbound(make_outbound("two"));

        assert_eq!(recorder.outbound.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn message_bus_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MessageBus>();
    }

    #[tokio::test]
    async fn concurrent_publish_and_consume() {
        let bus = Arc::new(MessageBus::new());
        let producer_bus = bus.clone();

        let producer = tokio::spawn(async move {
            for i in 0..50 {
                producer_bus.publish_inbound(make_inbound(&format!("concurrent-{i}")));
                tokio::task::yield_now().await;
            }
        });

        let consumer = tokio::spawn(async move {
            let mut received = Vec::new();
            for _ in 0..50 {
                if let Some(msg) = bus.consume_inbound().await {
                    received.push(msg.content);
                }
            }
            received
        });

        producer.await.unwrap();
        let results = consumer.await.unwrap();
        assert_eq!(results.len(), 50);
    }
}
