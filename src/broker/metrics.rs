//! Lock-free counters for the broker's publish/ack/retry activity.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

const ORD: Ordering = Ordering::Relaxed;

#[derive(Debug, Default)]
pub struct BrokerMetrics {
    messages_published: AtomicU64,
    acks_received: AtomicU64,
    retransmissions: AtomicU64,
    dropped_after_max_retries: AtomicU64,
    send_errors: AtomicU64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_publish(&self) {
        self.messages_published.fetch_add(1, ORD);
    }

    pub(crate) fn record_ack(&self) {
        self.acks_received.fetch_add(1, ORD);
    }

    pub(crate) fn record_retransmission(&self) {
        self.retransmissions.fetch_add(1, ORD);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped_after_max_retries.fetch_add(1, ORD);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, ORD);
    }

    #[inline]
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(ORD)
    }

    #[inline]
    pub fn acks_received(&self) -> u64 {
        self.acks_received.load(ORD)
    }

    #[inline]
    pub fn retransmissions(&self) -> u64 {
        self.retransmissions.load(ORD)
    }

    #[inline]
    pub fn dropped_after_max_retries(&self) -> u64 {
        self.dropped_after_max_retries.load(ORD)
    }

    #[inline]
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(ORD)
    }

    pub fn snapshot(&self) -> BrokerMetricsSnapshot {
        BrokerMetricsSnapshot {
            messages_published: self.messages_published(),
            acks_received: self.acks_received(),
            retransmissions: self.retransmissions(),
            dropped_after_max_retries: self.dropped_after_max_retries(),
            send_errors: self.send_errors(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMetricsSnapshot {
    pub messages_published: u64,
    pub acks_received: u64,
    pub retransmissions: u64,
    pub dropped_after_max_retries: u64,
    pub send_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_start_at_zero() {
        let m = BrokerMetrics::new();
        let s = m.snapshot();
        assert_eq!(s.messages_published, 0);
        assert_eq!(s.acks_received, 0);
    }

    #[test]
    fn record_and_read() {
        let m = BrokerMetrics::new();
        m.record_publish();
        m.record_publish();
        m.record_ack();
        m.record_retransmission();
        m.record_dropped();
        m.record_send_error();

        assert_eq!(m.messages_published(), 2);
        assert_eq!(m.acks_received(), 1);
        assert_eq!(m.retransmissions(), 1);
        assert_eq!(m.dropped_after_max_retries(), 1);
        assert_eq!(m.send_errors(), 1);
    }

    #[test]
    fn snapshot_serialization_round_trips() {
        let m = BrokerMetrics::new();
        m.record_publish();
        let snap = m.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: BrokerMetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);
    }
}
