//! Named-channel, multi-subscriber publish/subscribe transport with
//! optional reliable delivery.
//!
//! Channels are backed by [`tokio::sync::broadcast`], which gives
//! per-channel FIFO fan-out to every current subscriber for free and, true
//! to the delivery semantics this module implements, never blocks
//! `publish` on subscriber work: a `send` on a broadcast channel only
//! pushes into each receiver's ring buffer. A subscriber task that panics
//! only ever takes down its own receiver loop, never the broker or its
//! peers — there is no shared callback list to corrupt.
//!
//! Reliable delivery (ACK + retry) is layered on top: `publish` with
//! `reliable=true` records the envelope in a pending-ACK table, a
//! background tick retransmits anything that has gone unacknowledged past
//! `ack_timeout`, and an internal subscriber on the `acks` channel removes
//! entries as acknowledgments arrive.

pub mod metrics;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::message::{Envelope, MessageType, Payload};

pub use metrics::{BrokerMetrics, BrokerMetricsSnapshot};

const ACKS_CHANNEL: &str = "acks";

struct PendingAck {
    channel: String,
    message: Envelope,
    sent_at: Instant,
    retries: u32,
}

struct Inner {
    channels: RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
    pending_acks: Mutex<HashMap<String, PendingAck>>,
    config: BrokerConfig,
    metrics: BrokerMetrics,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A cheaply-cloneable handle to the broker. Every clone shares the same
/// channel registry, pending-ACK table, and metrics.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    pub fn new(config: BrokerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: RwLock::new(HashMap::new()),
                pending_acks: Mutex::new(HashMap::new()),
                config,
                metrics: BrokerMetrics::new(),
                clock,
                running: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.inner.metrics
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    async fn sender_for(&self, channel: &str) -> broadcast::Sender<Envelope> {
        if let Some(tx) = self.inner.channels.read().await.get(channel) {
            return tx.clone();
        }
        let mut channels = self.inner.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.config.buffer_size()).0)
            .clone()
    }

    /// Subscribes to `channel`, creating it if this is the first subscriber.
    /// The returned receiver sees every message published from this point
    /// on, in publication order.
    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<Envelope> {
        self.sender_for(channel).await.subscribe()
    }

    /// Publishes `message` to `channel`. Never blocks on subscriber work:
    /// delivery to each subscriber happens independently, asynchronously,
    /// on their own receive loop.
    ///
    /// If `reliable` and `message.requires_ack`, the message is tracked in
    /// the pending-ACK table for retransmission until an ACK with matching
    /// `ack_for` arrives, or `max_retries` is exhausted.
    pub async fn publish(&self, channel: &str, message: Envelope, reliable: bool) -> BrokerResult<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        if reliable && message.requires_ack {
            let mut pending = self.inner.pending_acks.lock().await;
            pending.insert(
                message.msg_id.clone(),
                PendingAck {
                    channel: channel.to_string(),
                    message: message.clone(),
                    sent_at: self.inner.clock.now_instant(),
                    retries: 0,
                },
            );
            debug!(msg_id = %message.msg_id, channel, "tracking reliable message for ack");
        }

        let tx = self.sender_for(channel).await;
        self.inner.metrics.record_publish();
        // send() only fails when there are no subscribers; that's a normal
        // transient condition (e.g. a channel created before any agent has
        // subscribed yet), not a broker fault, so it's logged and reported
        // to the caller rather than panicking or retrying here.
        if tx.send(message).is_err() {
            self.inner.metrics.record_send_error();
            debug!(channel, "publish with no active subscribers");
            return Err(BrokerError::SendFailed {
                channel: channel.to_string(),
                reason: "no active subscribers".to_string(),
            });
        }
        Ok(())
    }

    /// Starts the retransmission timer and the internal ACK listener.
    /// Must be called before `publish` has any effect.
    pub async fn listen(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let ack_rx = self.subscribe(ACKS_CHANNEL).await;
        let ack_broker = self.clone();
        let ack_task = tokio::spawn(async move {
            ack_broker.run_ack_listener(ack_rx).await;
        });

        let retrans_broker = self.clone();
        let retrans_task = tokio::spawn(async move {
            retrans_broker.run_retransmission_loop().await;
        });

        let mut workers = self.inner.workers.lock().await;
        workers.push(ack_task);
        workers.push(retrans_task);
        info!("broker listening");
    }

    /// Quiesces the broker: stops accepting new publications and aborts
    /// its background workers. In-flight pending ACKs are abandoned, not
    /// drained — matching the no-persistence-across-restart contract.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.inner.workers.lock().await;
        for handle in workers.drain(..) {
            handle.abort();
        }
        info!("broker stopped");
    }

    async fn run_ack_listener(&self, mut rx: broadcast::Receiver<Envelope>) {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if let Payload::Ack { ack_for } = &envelope.payload {
                        self.handle_ack(ack_for).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "ack listener lagged, continuing");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_ack(&self, ack_for: &str) {
        let mut pending = self.inner.pending_acks.lock().await;
        if pending.remove(ack_for).is_some() {
            self.inner.metrics.record_ack();
            debug!(msg_id = ack_for, "ack received, entry cleared");
        }
        // Unknown ack_for is silently ignored, per protocol-misuse policy.
    }

    async fn run_retransmission_loop(&self) {
        let mut ticker = tokio::time::interval(self.inner.config.retransmission_tick());
        loop {
            ticker.tick().await;
            self.check_timeouts().await;
        }
    }

    async fn check_timeouts(&self) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        let now = self.inner.clock.now_instant();
        let ack_timeout = self.inner.config.ack_timeout();
        let max_retries = self.inner.config.max_retries();

        let mut to_retransmit = Vec::new();
        let mut to_drop = Vec::new();

        {
            let mut pending = self.inner.pending_acks.lock().await;
            for (msg_id, entry) in pending.iter_mut() {
                if now.saturating_duration_since(entry.sent_at) <= ack_timeout {
                    continue;
                }
                if entry.retries < max_retries {
                    entry.retries += 1;
                    entry.sent_at = now;
                    to_retransmit.push((entry.channel.clone(), entry.message.clone()));
                } else {
                    to_drop.push(msg_id.clone());
                }
            }
            for msg_id in &to_drop {
                pending.remove(msg_id);
            }
        }

        for msg_id in &to_drop {
            error!(msg_id, "message failed after max retries, dropping");
            self.inner.metrics.record_dropped();
        }

        for (channel, message) in to_retransmit {
            warn!(msg_id = %message.msg_id, channel = %channel, "ack timeout, retransmitting");
            self.inner.metrics.record_retransmission();
            let tx = self.sender_for(&channel).await;
            let _ = tx.send(message);
            self.inner.metrics.record_publish();
        }
    }

    /// Number of entries still awaiting acknowledgment. Exposed for tests.
    pub async fn pending_ack_count(&self) -> usize {
        self.inner.pending_acks.lock().await.len()
    }
}

/// The canonical channel name for a given message type, per the external
/// channel contract.
pub fn channel_for(msg_type: MessageType) -> &'static str {
    match msg_type {
        MessageType::TaskBroadcast => "tasks",
        MessageType::Bid => "bids",
        MessageType::TaskAllocation => "allocations",
        MessageType::Acknowledgment => ACKS_CHANNEL,
        MessageType::Heartbeat => "heartbeats",
        MessageType::AgentEvent => "agent_events",
        MessageType::HeartbeatRequest => "heartbeat_request",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::message::Payload;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn test_broker() -> Broker {
        Broker::new(BrokerConfig::default(), Arc::new(SystemClock))
    }

    fn test_envelope(requires_ack: bool) -> Envelope {
        Envelope::new(
            MessageType::TaskBroadcast,
            "coordinator",
            Payload::Ack {
                ack_for: "unused".into(),
            },
            0.0,
            requires_ack,
        )
    }

    #[tokio::test]
    async fn publish_before_listen_has_no_effect() {
        let broker = test_broker();
        let mut rx = broker.subscribe("tasks").await;
        broker.publish("tasks", test_envelope(false), false).await.unwrap();
        let result = timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(result.is_err(), "message should not have been delivered before listen()");
    }

    #[tokio::test]
    async fn publish_after_listen_delivers_to_subscriber() {
        let broker = test_broker();
        broker.listen().await;
        let mut rx = broker.subscribe("tasks").await;
        broker.publish("tasks", test_envelope(false), false).await.unwrap();
        let received = timeout(Duration::from_millis(50), rx.recv())
            .await
            .expect("should receive within timeout")
            .unwrap();
        assert_eq!(received.msg_type, MessageType::TaskBroadcast);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_in_fifo_order() {
        let broker = test_broker();
        broker.listen().await;
        let mut rx1 = broker.subscribe("tasks").await;
        let mut rx2 = broker.subscribe("tasks").await;

        for i in 0..3 {
            let mut env = test_envelope(false);
            env.timestamp = i as f64;
            broker.publish("tasks", env, false).await.unwrap();
        }

        for expected in 0..3 {
            assert_eq!(rx1.recv().await.unwrap().timestamp, expected as f64);
            assert_eq!(rx2.recv().await.unwrap().timestamp, expected as f64);
        }
    }

    #[tokio::test]
    async fn reliable_publish_tracks_pending_ack() {
        let broker = test_broker();
        broker.listen().await;
        let _rx = broker.subscribe("tasks").await;
        broker.publish("tasks", test_envelope(true), true).await.unwrap();
        assert_eq!(broker.pending_ack_count().await, 1);
    }

    #[tokio::test]
    async fn ack_clears_pending_entry() {
        let broker = test_broker();
        broker.listen().await;
        let _rx = broker.subscribe("tasks").await;
        let msg = test_envelope(true);
        let msg_id = msg.msg_id.clone();
        broker.publish("tasks", msg, true).await.unwrap();
        assert_eq!(broker.pending_ack_count().await, 1);

        let ack = Envelope::ack("agent-1", &msg_id, 0.0);
        broker.publish(ACKS_CHANNEL, ack, false).await.unwrap();

        // give the internal ack listener a tick to run
        sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.pending_ack_count().await, 0);
        assert_eq!(broker.metrics().acks_received(), 1);
    }

    #[tokio::test]
    async fn ack_for_unknown_msg_id_is_ignored() {
        let broker = test_broker();
        broker.listen().await;
        let ack = Envelope::ack("agent-1", "does-not-exist", 0.0);
        broker.publish(ACKS_CHANNEL, ack, false).await.unwrap();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.pending_ack_count().await, 0);
        assert_eq!(broker.metrics().acks_received(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_is_retransmitted_then_dropped_after_max_retries() {
        let config = BrokerConfig::default()
            .with_ack_timeout(Duration::from_millis(100))
            .with_max_retries(2)
            .with_retransmission_tick(Duration::from_millis(50));
        let broker = Broker::new(config, Arc::new(SystemClock));
        broker.listen().await;
        let mut rx = broker.subscribe("tasks").await;

        broker.publish("tasks", test_envelope(true), true).await.unwrap();
        let _first = rx.recv().await.unwrap();

        tokio::time::advance(Duration::from_millis(120)).await;
        let retransmit_1 = timeout(Duration::from_millis(200), rx.recv()).await.unwrap().unwrap();
        assert_eq!(retransmit_1.msg_type, MessageType::TaskBroadcast);

        tokio::time::advance(Duration::from_millis(120)).await;
        let _retransmit_2 = timeout(Duration::from_millis(200), rx.recv()).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_millis(120)).await;
        // third timeout exceeds max_retries(2): dropped, not retransmitted
        let result = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "should not retransmit a third time");
        assert_eq!(broker.pending_ack_count().await, 0);
        assert_eq!(broker.metrics().dropped_after_max_retries(), 1);
    }

    #[tokio::test]
    async fn stop_prevents_further_delivery() {
        let broker = test_broker();
        broker.listen().await;
        let mut rx = broker.subscribe("tasks").await;
        broker.stop().await;
        broker.publish("tasks", test_envelope(false), false).await.unwrap();
        let result = timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(result.is_err());
    }

    #[test]
    fn channel_for_matches_external_channel_table() {
        assert_eq!(channel_for(MessageType::TaskBroadcast), "tasks");
        assert_eq!(channel_for(MessageType::Bid), "bids");
        assert_eq!(channel_for(MessageType::TaskAllocation), "allocations");
        assert_eq!(channel_for(MessageType::Heartbeat), "heartbeats");
        assert_eq!(channel_for(MessageType::AgentEvent), "agent_events");
    }
}
