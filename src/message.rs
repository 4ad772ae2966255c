//! The message envelope, its wire-level type tag, and the event vocabulary
//! carried on `agent_events`.
//!
//! The source system this crate's channels model carries untyped JSON
//! dictionaries tagged with a `msg_type` string. Per the recommendation to
//! prefer typed channels/streams per logical topic, every payload here is a
//! genuine Rust enum variant rather than a `serde_json::Value` — the
//! `msg_type` string still exists (`MessageType`, `Display`-able to the
//! exact wire strings) for logging and for any boundary that needs the
//! wire-format name, but dispatch never re-parses it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AgentDataStream, Bid, Heartbeat, Task};

/// Wire-level type tag, string-encoded per the external channel contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskBroadcast,
    Bid,
    TaskAllocation,
    Acknowledgment,
    Heartbeat,
    AgentEvent,
    HeartbeatRequest,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskBroadcast => "task_broadcast",
            MessageType::Bid => "bid",
            MessageType::TaskAllocation => "task_allocation",
            MessageType::Acknowledgment => "acknowledgment",
            MessageType::Heartbeat => "heartbeat",
            MessageType::AgentEvent => "agent_event",
            MessageType::HeartbeatRequest => "heartbeat_request",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event vocabulary emitted on the `agent_events` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStarted,
    AgentCrashed {
        crash_time: f64,
        interrupted_tasks: Vec<String>,
    },
    AgentRecovered {
        recovered_at: f64,
    },
    TaskCompleted {
        task_id: String,
        execution_time: f64,
    },
    TaskCancelled {
        task_id: String,
        elapsed: f64,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
}

/// The payload carried by an [`Envelope`], one variant per channel's
/// content shape (see the channel table this crate implements).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Task(Task),
    Bid(Bid),
    Allocation {
        task: Task,
        agent_id: String,
        winning_bid: Bid,
    },
    Ack {
        ack_for: String,
    },
    Heartbeat(Heartbeat),
    Stream(AgentDataStream),
    Event(AgentEvent),
    HeartbeatRequest {
        agent_id: Option<String>,
    },
}

/// The envelope every message travels in. `msg_id` is the sole basis for
/// deduplication and acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: String,
    pub msg_type: MessageType,
    pub sender_id: String,
    pub payload: Payload,
    pub timestamp: f64,
    pub requires_ack: bool,
}

impl Envelope {
    pub fn new(
        msg_type: MessageType,
        sender_id: impl Into<String>,
        payload: Payload,
        timestamp: f64,
        requires_ack: bool,
    ) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type,
            sender_id: sender_id.into(),
            payload,
            timestamp,
            requires_ack,
        }
    }

    /// Builds the envelope for an ACK of `original_msg_id`, as published on
    /// the `acks` channel.
    pub fn ack(sender_id: impl Into<String>, original_msg_id: impl Into<String>, timestamp: f64) -> Self {
        Self::new(
            MessageType::Acknowledgment,
            sender_id,
            Payload::Ack {
                ack_for: original_msg_id.into(),
            },
            timestamp,
            false,
        )
    }
}
