//! The coordinator's maintained state and the activity/event-dedup records.
//!
//! All of it sits behind one `tokio::sync::Mutex`. Per-channel handler
//! tasks (bids, heartbeats, streams, events) run concurrently with each
//! other and with the auction-timer and failure-detector workers, so a
//! single coarse lock is what actually makes "the broker serializes
//! per-channel handlers" true here — in the original design each channel
//! got its own thread with no cross-channel lock; a systems-language
//! rewrite with several concurrent consumer tasks needs an explicit one.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::collections::{ClearOnOverflowSet, RingLog};
use crate::types::{AgentDataStream, Bid, Task};

/// A task still inside its auction window (or waiting on a fallback bid).
pub(super) struct PendingTask {
    pub(super) task: Task,
    pub(super) bids: Vec<Bid>,
    #[allow(dead_code)]
    pub(super) broadcast_at: Instant,
}

/// One completed allocation, retained for reassignment bookkeeping and for
/// `get_stats`.
#[derive(Debug, Clone)]
pub(super) struct AllocationRecord {
    pub(super) task_id: String,
    pub(super) agent_id: String,
}

/// A structured activity-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEntry {
    TaskBroadcast { task_id: String, timestamp: f64 },
    TaskAllocated { task_id: String, agent_id: String, timestamp: f64 },
    TaskReassignment { task_id: String, from_agent: String, to_agent: String, timestamp: f64 },
    AgentFailed { agent_id: String, timestamp: f64 },
    AgentRecovered { agent_id: String, timestamp: f64 },
    RebroadcastScheduled { task_id: String, delay_secs: f64, timestamp: f64 },
}

pub(super) struct CoordinatorState {
    pub(super) tasks: Vec<Task>,
    pub(super) pending_tasks: HashMap<String, PendingTask>,
    pub(super) task_bids: HashMap<String, Vec<Bid>>,
    pub(super) allocated_tasks: Vec<AllocationRecord>,
    pub(super) agent_tasks: HashMap<String, Vec<String>>,
    pub(super) agent_heartbeats: HashMap<String, (f64, Instant)>,
    pub(super) agent_streams: HashMap<String, AgentDataStream>,
    pub(super) failed_agents: std::collections::HashSet<String>,
    pub(super) completed_task_ids: std::collections::HashSet<String>,
    pub(super) cancelled_task_ids: std::collections::HashSet<String>,
    pub(super) activity_log: RingLog<ActivityEntry>,
    pub(super) processed_events: ClearOnOverflowSet<String>,
}

impl CoordinatorState {
    pub(super) fn new(activity_log_capacity: usize, processed_events_capacity: usize) -> Self {
        Self {
            tasks: Vec::new(),
            pending_tasks: HashMap::new(),
            task_bids: HashMap::new(),
            allocated_tasks: Vec::new(),
            agent_tasks: HashMap::new(),
            agent_heartbeats: HashMap::new(),
            agent_streams: HashMap::new(),
            failed_agents: std::collections::HashSet::new(),
            completed_task_ids: std::collections::HashSet::new(),
            cancelled_task_ids: std::collections::HashSet::new(),
            activity_log: RingLog::new(activity_log_capacity),
            processed_events: ClearOnOverflowSet::new(processed_events_capacity),
        }
    }
}

/// Snapshot returned by `get_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub total_tasks: usize,
    pub pending: usize,
    pub allocated_not_completed: usize,
    pub completed: usize,
    pub active_agents: usize,
    pub failed_agents: usize,
    pub total_known_agents: usize,
}

/// Per-agent snapshot returned by `get_agent_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusView {
    pub agent_id: String,
    pub is_failed: bool,
    pub last_heartbeat: Option<f64>,
    pub active_task_count: usize,
    pub latest_stream: Option<AgentDataStream>,
}

/// Computes a heartbeat "freshness" gap using the monotonic clock.
pub(super) fn heartbeat_gap(last_seen: Instant, now: Instant) -> Duration {
    now.saturating_duration_since(last_seen)
}
