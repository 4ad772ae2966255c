//! Crate-wide error types.
//!
//! Per the error-handling policy of the system this crate implements, no
//! error here is meant to surface to a user boundary: transport failures,
//! protocol misuse, and capacity limits are all handled by logging and
//! dropping, not propagating. These types exist for the internal seams
//! (broker send paths, agent execution, coordinator bookkeeping) where a
//! `Result` is still the clearest way to express "this specific call did
//! not do what it was asked."

use thiserror::Error;

/// Errors raised by the broker's publish/subscribe/ack machinery.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    #[error("send failed on channel {channel}: {reason}")]
    SendFailed { channel: String, reason: String },
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by agent-side handling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    #[error("task {0} is already allocated to this agent")]
    DuplicateAllocation(String),

    #[error("agent is crashed")]
    Crashed,
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Errors raised by coordinator-side handling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinatorError {
    #[error("task {0} is unknown to the coordinator")]
    UnknownTask(String),

    #[error("no bidders available for task {0}")]
    NoBidders(String),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Top-level error aggregating all subsystem errors, for callers that span
/// more than one component (integration tests, the out-of-scope driver).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
