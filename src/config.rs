//! Typed, builder-style configuration for each component.
//!
//! # Design Rationale
//!
//! Every timer mentioned by the rest of this crate (auction window, ACK
//! timeout, heartbeat interval, ...) is a field here rather than a literal
//! sprinkled through the code, and every field has a default matching the
//! system's reference numbers. Builder methods are `#[must_use]` so a
//! dropped `with_*` call (a common copy-paste mistake with consuming
//! builders) is a compiler warning, not a silent no-op.

use std::time::Duration;

/// Broker-wide tuning: channel buffer depth and the reliable-delivery
/// retry envelope.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    buffer_size: usize,
    ack_timeout: Duration,
    max_retries: u32,
    retransmission_tick: Duration,
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be nonzero");
        self.buffer_size = buffer_size;
        self
    }

    #[must_use]
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_retransmission_tick(mut self, tick: Duration) -> Self {
        self.retransmission_tick = tick;
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retransmission_tick(&self) -> Duration {
        self.retransmission_tick
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            ack_timeout: Duration::from_secs(5),
            max_retries: 3,
            retransmission_tick: Duration::from_secs(1),
        }
    }
}

/// Per-agent tuning: capacity and the telemetry/liveness cadence.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    max_load: u32,
    heartbeat_interval: Duration,
    stream_interval: Duration,
    auto_recover_delay: Duration,
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_load(mut self, max_load: u32) -> Self {
        self.max_load = max_load;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_stream_interval(mut self, interval: Duration) -> Self {
        self.stream_interval = interval;
        self
    }

    #[must_use]
    pub fn with_auto_recover_delay(mut self, delay: Duration) -> Self {
        self.auto_recover_delay = delay;
        self
    }

    pub fn max_load(&self) -> u32 {
        self.max_load
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn stream_interval(&self) -> Duration {
        self.stream_interval
    }

    pub fn auto_recover_delay(&self) -> Duration {
        self.auto_recover_delay
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_load: 5,
            heartbeat_interval: Duration::from_secs(2),
            stream_interval: Duration::from_secs(1),
            auto_recover_delay: Duration::from_secs(10),
        }
    }
}

/// Coordinator-wide tuning: auction/failure-detection timers and the
/// bounded-memory limits for the activity log and event dedup set.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    auction_window: Duration,
    heartbeat_timeout: Duration,
    failure_check_interval: Duration,
    activity_log_capacity: usize,
    processed_events_capacity: usize,
    rebroadcast_delay_min: Duration,
    rebroadcast_delay_max: Duration,
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_auction_window(mut self, window: Duration) -> Self {
        self.auction_window = window;
        self
    }

    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_failure_check_interval(mut self, interval: Duration) -> Self {
        self.failure_check_interval = interval;
        self
    }

    #[must_use]
    pub fn with_activity_log_capacity(mut self, capacity: usize) -> Self {
        self.activity_log_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_processed_events_capacity(mut self, capacity: usize) -> Self {
        self.processed_events_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_rebroadcast_delay_range(mut self, min: Duration, max: Duration) -> Self {
        assert!(min <= max, "rebroadcast delay range must be non-empty");
        self.rebroadcast_delay_min = min;
        self.rebroadcast_delay_max = max;
        self
    }

    pub fn auction_window(&self) -> Duration {
        self.auction_window
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn failure_check_interval(&self) -> Duration {
        self.failure_check_interval
    }

    pub fn activity_log_capacity(&self) -> usize {
        self.activity_log_capacity
    }

    pub fn processed_events_capacity(&self) -> usize {
        self.processed_events_capacity
    }

    pub fn rebroadcast_delay_range(&self) -> (Duration, Duration) {
        (self.rebroadcast_delay_min, self.rebroadcast_delay_max)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            auction_window: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(6),
            failure_check_interval: Duration::from_secs(1),
            activity_log_capacity: 100,
            processed_events_capacity: 1000,
            rebroadcast_delay_min: Duration::from_secs(5),
            rebroadcast_delay_max: Duration::from_secs(10),
        }
    }
}
