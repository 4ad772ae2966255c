//! Domain value types: `Task`, `Bid`, `Heartbeat`, and telemetry snapshots.
//!
//! These are plain, serde-friendly data (no behavior beyond constructors),
//! mirroring the bus's own value types in shape even though the transport
//! here is typed Rust enums rather than JSON dictionaries.

use serde::{Deserialize, Serialize};

/// A unit of work broadcast by the coordinator. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// 1-10, higher is more important. Currently informational only.
    pub priority: u8,
    pub estimated_time: f64,
    pub description: String,
    pub created_at: f64,
}

impl Task {
    pub fn new(
        task_id: impl Into<String>,
        priority: u8,
        estimated_time: f64,
        description: impl Into<String>,
        created_at: f64,
    ) -> Self {
        assert!(estimated_time > 0.0, "estimated_time must be strictly positive");
        Self {
            task_id: task_id.into(),
            priority,
            estimated_time,
            description: description.into(),
            created_at,
        }
    }
}

/// A sealed bid submitted by an agent for a specific task. Derived purely
/// from the agent's state at bid time and never mutated afterward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub agent_id: String,
    pub task_id: String,
    /// Lower is better.
    pub bid_value: f64,
    pub current_load: u32,
    pub estimated_completion_time: f64,
}

/// Liveness status an agent self-reports alongside its heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Overloaded,
}

/// A periodic liveness frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: String,
    pub timestamp: f64,
    pub status: AgentStatus,
    pub current_load: u32,
    pub max_load: u32,
}

/// A point-in-time telemetry sample published on the agent-streams channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDataStream {
    pub agent_id: String,
    pub timestamp: f64,
    pub cpu_utilization: f64,
    pub memory_usage_mb: f64,
    pub active_tasks: u32,
    pub completed_tasks_count: u32,
    pub avg_task_time: f64,
    pub running_tasks: Vec<String>,
    pub queue_length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_new_accepts_positive_estimated_time() {
        let t = Task::new("t0", 5, 1.0, "demo", 0.0);
        assert_eq!(t.task_id, "t0");
        assert_eq!(t.priority, 5);
    }

    #[test]
    #[should_panic(expected = "strictly positive")]
    fn task_new_rejects_nonpositive_estimated_time() {
        let _ = Task::new("t0", 5, 0.0, "demo", 0.0);
    }

    #[test]
    fn bid_round_trips_through_json() {
        let bid = Bid {
            agent_id: "a1".into(),
            task_id: "t0".into(),
            bid_value: 12.5,
            current_load: 1,
            estimated_completion_time: 1.0,
        };
        let json = serde_json::to_string(&bid).unwrap();
        let back: Bid = serde_json::from_str(&json).unwrap();
        assert_eq!(bid, back);
    }
}
