//! Monotonic and wall-clock time source, injectable so timer-driven logic
//! (auction windows, heartbeat timeouts, retransmission) is deterministic
//! under test.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// A single time source used by every timer in the crate.
///
/// `now_secs` feeds wall-clock timestamps into message envelopes;
/// `now_instant` feeds the monotonic comparisons timers actually schedule
/// against. The two are never mixed for the same comparison: wall-clock can
/// jump (NTP, leap seconds), which would corrupt timeout arithmetic.
pub trait Clock: Send + Sync {
    /// Wall-clock time in seconds since the Unix epoch.
    fn now_secs(&self) -> f64;

    /// Monotonic instant, compatible with `tokio::time::sleep`/`timeout`.
    ///
    /// Backed by `tokio::time::Instant::now()`, which advances with
    /// `tokio::time::advance()` under `#[tokio::test(start_paused = true)]`,
    /// making timeout-driven logic deterministic in tests.
    fn now_instant(&self) -> Instant;
}

/// Production clock: real wall time, real monotonic time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    fn now_instant(&self) -> Instant {
        Instant::now()
    }
}
