//! The bidder and executor: evaluates task broadcasts, bids when capacity
//! allows, executes allocated work, and streams liveness/telemetry.
//!
//! All mutable per-agent state lives behind a single `tokio::sync::Mutex`,
//! acquired for the critical region of every public operation
//! (`handle_task_broadcast`, `handle_task_allocation`, `execute_task`,
//! `crash`, `recover`, `status`) — mirroring the single per-agent-mutex
//! policy this component follows, just with an async-aware lock instead of
//! a thread lock, since every holder here is itself async.

mod execution;
mod telemetry;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::clock::Clock;
use crate::collections::BoundedSet;
use crate::config::AgentConfig;
use crate::dispatch::run_subscriber;
use crate::error::{AgentError, AgentResult};
use crate::message::{AgentEvent, Envelope, MessageType, Payload};
use crate::types::{AgentDataStream, Bid, Heartbeat, Task};

const PROCESSED_MESSAGE_CAPACITY: usize = 1000;

struct RunningTaskHandle {
    #[allow(dead_code)]
    start: Instant,
    cancel: CancellationToken,
}

struct AgentState {
    current_load: u32,
    assigned_tasks: Vec<Task>,
    completed_tasks: Vec<Task>,
    running_tasks: HashMap<String, RunningTaskHandle>,
    allocated_task_ids: HashSet<String>,
    bid_task_ids: HashSet<String>,
    processed_message_ids: BoundedSet<String>,
    is_crashed: bool,
    crash_time: Option<f64>,
    auto_recover_enabled: bool,
    auto_recover_delay: std::time::Duration,
    total_execution_time: f64,
}

impl AgentState {
    fn new(default_auto_recover_delay: std::time::Duration) -> Self {
        Self {
            current_load: 0,
            assigned_tasks: Vec::new(),
            completed_tasks: Vec::new(),
            running_tasks: HashMap::new(),
            allocated_task_ids: HashSet::new(),
            bid_task_ids: HashSet::new(),
            processed_message_ids: BoundedSet::new(PROCESSED_MESSAGE_CAPACITY),
            is_crashed: false,
            crash_time: None,
            auto_recover_enabled: true,
            auto_recover_delay: default_auto_recover_delay,
            total_execution_time: 0.0,
        }
    }
}

struct Inner {
    agent_id: String,
    broker: Broker,
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<AgentState>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A cheaply-cloneable handle to a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<Inner>,
}

/// A point-in-time view of an agent's liveness and load, returned by
/// [`AgentHandle::status`].
#[derive(Debug, Clone)]
pub struct AgentStatusSnapshot {
    pub agent_id: String,
    pub current_load: u32,
    pub max_load: u32,
    pub is_crashed: bool,
    pub assigned_count: usize,
    pub completed_count: usize,
    pub running_task_ids: Vec<String>,
}

impl AgentHandle {
    /// Spawns a new agent: subscribes to `tasks`, `allocations`, and
    /// `heartbeat_request`, starts the heartbeat and telemetry workers, and
    /// emits `agent_started`.
    pub async fn spawn(
        agent_id: impl Into<String>,
        broker: Broker,
        config: AgentConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let agent_id = agent_id.into();
        let default_delay = config.auto_recover_delay();
        let agent = AgentHandle {
            inner: Arc::new(Inner {
                agent_id,
                broker,
                config,
                clock,
                state: Mutex::new(AgentState::new(default_delay)),
                running: AtomicBool::new(true),
                workers: Mutex::new(Vec::new()),
            }),
        };

        let mut workers = Vec::new();

        let tasks_rx = agent.inner.broker.subscribe("tasks").await;
        let allocations_rx = agent.inner.broker.subscribe("allocations").await;
        let heartbeat_req_rx = agent.inner.broker.subscribe("heartbeat_request").await;

        workers.push(tokio::spawn(run_subscriber(agent.clone(), tasks_rx, dispatch_task_broadcast)));
        workers.push(tokio::spawn(run_subscriber(
            agent.clone(),
            allocations_rx,
            dispatch_task_allocation,
        )));
        workers.push(tokio::spawn(run_subscriber(
            agent.clone(),
            heartbeat_req_rx,
            dispatch_heartbeat_request,
        )));
        workers.push(tokio::spawn(telemetry::heartbeat_loop(agent.clone())));
        workers.push(tokio::spawn(telemetry::stream_loop(agent.clone())));

        *agent.inner.workers.lock().await = workers;

        agent.publish_event(AgentEvent::AgentStarted).await;
        info!(agent_id = %agent.agent_id(), "agent started");
        agent
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub(crate) fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub(crate) fn state(&self) -> &Mutex<AgentState> {
        &self.inner.state
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Simulates a crash: cancels every in-flight task and suppresses
    /// heartbeats. `auto_recover_after`: `None` keeps the existing delay,
    /// `Some(Duration::ZERO)` disables auto-recovery, any other value sets
    /// a new delay (auto-recovery stays enabled/disabled as it already was).
    pub async fn crash(&self, auto_recover_after: Option<std::time::Duration>) {
        let mut state = self.inner.state.lock().await;
        state.is_crashed = true;
        state.crash_time = Some(self.inner.clock.now_secs());
        match auto_recover_after {
            None => {}
            Some(d) if d.is_zero() => state.auto_recover_enabled = false,
            Some(d) => state.auto_recover_delay = d,
        }
        let interrupted: Vec<String> = state.running_tasks.keys().cloned().collect();
        for handle in state.running_tasks.values() {
            handle.cancel.cancel();
        }
        let crash_time = state.crash_time.unwrap();
        drop(state);

        info!(agent_id = %self.agent_id(), "agent crashed");
        self.publish_event(AgentEvent::AgentCrashed {
            crash_time,
            interrupted_tasks: interrupted,
        })
        .await;
    }

    /// Clears crash state, re-enables bidding on previously-seen tasks, and
    /// sends an immediate heartbeat. Returns `false` if the agent was not
    /// crashed (a no-op).
    pub async fn recover(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        if !state.is_crashed {
            return false;
        }
        state.is_crashed = false;
        state.crash_time = None;
        state.bid_task_ids.clear();
        drop(state);

        info!(agent_id = %self.agent_id(), "agent recovered");
        self.send_heartbeat_if_alive().await;
        self.publish_event(AgentEvent::AgentRecovered {
            recovered_at: self.inner.clock.now_secs(),
        })
        .await;
        true
    }

    pub async fn status(&self) -> AgentStatusSnapshot {
        let state = self.inner.state.lock().await;
        AgentStatusSnapshot {
            agent_id: self.agent_id().to_string(),
            current_load: state.current_load,
            max_load: self.inner.config.max_load(),
            is_crashed: state.is_crashed,
            assigned_count: state.assigned_tasks.len(),
            completed_count: state.completed_tasks.len(),
            running_task_ids: state.running_tasks.keys().cloned().collect(),
        }
    }

    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let mut workers = self.inner.workers.lock().await;
        for handle in workers.drain(..) {
            handle.abort();
        }
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    async fn handle_task_broadcast(&self, envelope: Envelope) {
        let Payload::Task(task) = &envelope.payload else {
            return;
        };
        let task = task.clone();

        let mut state = self.inner.state.lock().await;
        if !state.processed_message_ids.insert(envelope.msg_id.clone()) {
            // Exact duplicate delivery of an already-processed message: the
            // first delivery already acked and decided whether to bid.
            return;
        }

        let is_crashed = state.is_crashed;
        let already_seen = state.allocated_task_ids.contains(&task.task_id)
            || state.bid_task_ids.contains(&task.task_id);

        let mut should_bid = false;
        let mut current_load = state.current_load;
        if !is_crashed && !already_seen {
            state.bid_task_ids.insert(task.task_id.clone());
            current_load = state.current_load;
            should_bid = current_load < self.inner.config.max_load();
        }
        drop(state);

        if envelope.requires_ack {
            self.send_ack(&envelope).await;
        }
        if should_bid {
            self.send_bid(&task, current_load).await;
        }
    }

    async fn handle_task_allocation(&self, envelope: Envelope) {
        let Payload::Allocation { task, agent_id, .. } = &envelope.payload else {
            return;
        };
        if agent_id != self.agent_id() {
            return;
        }
        let task = task.clone();

        let mut state = self.inner.state.lock().await;
        if !state.processed_message_ids.insert(envelope.msg_id.clone()) {
            return;
        }
        let now = self.inner.clock.now_instant();
        let accepted = accept_allocation(&mut state, &task, now);
        drop(state);

        if envelope.requires_ack {
            self.send_ack(&envelope).await;
        }

        match accepted {
            Ok(cancel) => {
                let agent = self.clone();
                let exec_task = task.clone();
                tokio::spawn(async move {
                    execution::run_execution(agent, exec_task, cancel).await;
                });
            }
            Err(err) => {
                debug!(task_id = %task.task_id, %err, "allocation not accepted");
            }
        }
    }

    async fn handle_heartbeat_request(&self, envelope: Envelope) {
        let Payload::HeartbeatRequest { agent_id } = &envelope.payload else {
            return;
        };
        if let Some(target) = agent_id {
            if target != self.agent_id() {
                return;
            }
        }
        self.send_heartbeat_if_alive().await;
    }

    // ------------------------------------------------------------------
    // Execution outcomes (called from `execution::run_execution`)
    // ------------------------------------------------------------------

    pub(crate) async fn finish_completed(&self, task: &Task, start: Instant) {
        let elapsed = self.inner.clock.now_instant().saturating_duration_since(start);
        let mut state = self.inner.state.lock().await;
        state.running_tasks.remove(&task.task_id);
        state.allocated_task_ids.remove(&task.task_id);
        state.current_load = state.current_load.saturating_sub(1);
        state.completed_tasks.push(task.clone());
        state.total_execution_time += elapsed.as_secs_f64();
        drop(state);

        debug!(task_id = %task.task_id, "task completed");
        self.publish_event(AgentEvent::TaskCompleted {
            task_id: task.task_id.clone(),
            execution_time: elapsed.as_secs_f64(),
        })
        .await;
    }

    pub(crate) async fn finish_cancelled(&self, task: &Task, start: Instant) {
        let elapsed = self.inner.clock.now_instant().saturating_duration_since(start);
        let mut state = self.inner.state.lock().await;
        state.running_tasks.remove(&task.task_id);
        state.allocated_task_ids.remove(&task.task_id);
        state.bid_task_ids.remove(&task.task_id);
        state.current_load = state.current_load.saturating_sub(1);
        drop(state);

        debug!(task_id = %task.task_id, "task cancelled");
        self.publish_event(AgentEvent::TaskCancelled {
            task_id: task.task_id.clone(),
            elapsed: elapsed.as_secs_f64(),
        })
        .await;
    }

    pub(crate) async fn average_task_time(&self) -> f64 {
        let state = self.inner.state.lock().await;
        let count = state.completed_tasks.len();
        if count == 0 {
            0.0
        } else {
            state.total_execution_time / count as f64
        }
    }

    // ------------------------------------------------------------------
    // Outbound publishing
    // ------------------------------------------------------------------

    async fn send_bid(&self, task: &Task, current_load: u32) {
        let bid_value = current_load as f64 * 10.0 + rand::thread_rng().gen_range(0.0..5.0);
        let bid = Bid {
            agent_id: self.agent_id().to_string(),
            task_id: task.task_id.clone(),
            bid_value,
            current_load,
            estimated_completion_time: self.inner.clock.now_secs() + task.estimated_time,
        };
        let envelope = Envelope::new(
            MessageType::Bid,
            self.agent_id(),
            Payload::Bid(bid),
            self.inner.clock.now_secs(),
            false,
        );
        let _ = self.inner.broker.publish("bids", envelope, false).await;
    }

    async fn send_ack(&self, original: &Envelope) {
        let ack = Envelope::ack(self.agent_id(), original.msg_id.clone(), self.inner.clock.now_secs());
        let _ = self.inner.broker.publish("acks", ack, false).await;
    }

    async fn publish_heartbeat(&self, heartbeat: Heartbeat) {
        let envelope = Envelope::new(
            MessageType::Heartbeat,
            self.agent_id(),
            Payload::Heartbeat(heartbeat),
            self.inner.clock.now_secs(),
            false,
        );
        let _ = self.inner.broker.publish("heartbeats", envelope, false).await;
    }

    async fn publish_stream(&self, sample: AgentDataStream) {
        let envelope = Envelope::new(
            MessageType::Heartbeat,
            self.agent_id(),
            Payload::Stream(sample),
            self.inner.clock.now_secs(),
            false,
        );
        let _ = self.inner.broker.publish("agent_streams", envelope, false).await;
    }

    async fn publish_event(&self, event: AgentEvent) {
        let envelope = Envelope::new(
            MessageType::AgentEvent,
            self.agent_id(),
            Payload::Event(event),
            self.inner.clock.now_secs(),
            false,
        );
        let _ = self.inner.broker.publish("agent_events", envelope, false).await;
    }
}

/// Applies an accepted allocation to `state`, or reports why it wasn't
/// accepted. Split out of `handle_task_allocation` so the crash/duplicate
/// checks and the state mutation they guard share one `Result`.
fn accept_allocation(state: &mut AgentState, task: &Task, now: Instant) -> AgentResult<CancellationToken> {
    if state.is_crashed {
        return Err(AgentError::Crashed);
    }
    if state.allocated_task_ids.contains(&task.task_id) {
        return Err(AgentError::DuplicateAllocation(task.task_id.clone()));
    }

    state.allocated_task_ids.insert(task.task_id.clone());
    state.assigned_tasks.push(task.clone());
    state.current_load += 1;
    let cancel = CancellationToken::new();
    state.running_tasks.insert(
        task.task_id.clone(),
        RunningTaskHandle {
            start: now,
            cancel: cancel.clone(),
        },
    );
    Ok(cancel)
}

// `run_subscriber` is generic over a by-value async fn; these trampolines
// let it drive each of `AgentHandle`'s `&self` handlers, which otherwise
// can't be named as a plain `Fn(AgentHandle, Envelope) -> Fut`.
async fn dispatch_task_broadcast(agent: AgentHandle, envelope: Envelope) {
    agent.handle_task_broadcast(envelope).await;
}

async fn dispatch_task_allocation(agent: AgentHandle, envelope: Envelope) {
    agent.handle_task_allocation(envelope).await;
}

async fn dispatch_heartbeat_request(agent: AgentHandle, envelope: Envelope) {
    agent.handle_heartbeat_request(envelope).await;
}
