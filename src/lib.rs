//! Simulated multi-agent auction-style task dispatch.
//!
//! A coordinator broadcasts work items to a pool of worker agents over a
//! named-channel broker, collects sealed bids, allocates each item to the
//! lowest bidder, and reassigns or rebroadcasts when an agent's heartbeat
//! goes stale. See [`broker`], [`agent`], and [`coordinator`] for the three
//! subsystems.

pub mod agent;
pub mod broker;
pub mod clock;
pub mod collections;
pub mod config;
mod dispatch;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod types;

pub use agent::{AgentHandle, AgentStatusSnapshot};
pub use broker::{Broker, BrokerMetrics, BrokerMetricsSnapshot};
pub use clock::{Clock, SystemClock};
pub use config::{AgentConfig, BrokerConfig, CoordinatorConfig};
pub use coordinator::{ActivityEntry, AgentStatusView, CoordinatorHandle, Stats};
pub use error::{AgentError, BrokerError, CoordinatorError, DispatchError, DispatchResult};
pub use message::{AgentEvent, Envelope, MessageType, Payload};
pub use types::{AgentDataStream, AgentStatus, Bid, Heartbeat, Task};
