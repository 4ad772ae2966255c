//! The auction state machine, failure detector, and reassignment engine.
//!
//! Every channel this component listens on (`bids`, `heartbeats`,
//! `agent_streams`, `agent_events`) gets its own consumer task, same as the
//! agent side; all of them, plus the auction-timer and failure-detector
//! workers, share one `tokio::sync::Mutex<CoordinatorState>` rather than the
//! per-field locks a thread-per-channel model could get away with, since
//! here several handler tasks genuinely run at once.

mod state;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::dispatch::run_subscriber;
use crate::error::CoordinatorError;
use crate::message::{AgentEvent, Envelope, MessageType, Payload};
use crate::types::{Bid, Task};

pub use state::{ActivityEntry, AgentStatusView, Stats};
use state::{AllocationRecord, CoordinatorState, PendingTask};

struct Inner {
    broker: Broker,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<CoordinatorState>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A cheaply-cloneable handle to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    inner: Arc<Inner>,
}

impl CoordinatorHandle {
    /// Spawns the coordinator: subscribes to `bids`, `heartbeats`,
    /// `agent_streams`, and `agent_events`, and starts the failure detector.
    pub async fn spawn(broker: Broker, config: CoordinatorConfig, clock: Arc<dyn Clock>) -> Self {
        let state = CoordinatorState::new(config.activity_log_capacity(), config.processed_events_capacity());
        let coordinator = CoordinatorHandle {
            inner: Arc::new(Inner {
                broker,
                config,
                clock,
                state: Mutex::new(state),
                running: AtomicBool::new(true),
                workers: Mutex::new(Vec::new()),
            }),
        };

        let bids_rx = coordinator.inner.broker.subscribe("bids").await;
        let heartbeats_rx = coordinator.inner.broker.subscribe("heartbeats").await;
        let streams_rx = coordinator.inner.broker.subscribe("agent_streams").await;
        let events_rx = coordinator.inner.broker.subscribe("agent_events").await;

        let mut workers = Vec::new();
        workers.push(tokio::spawn(run_subscriber(coordinator.clone(), bids_rx, dispatch_bid)));
        workers.push(tokio::spawn(run_subscriber(
            coordinator.clone(),
            heartbeats_rx,
            dispatch_heartbeat,
        )));
        workers.push(tokio::spawn(run_subscriber(coordinator.clone(), streams_rx, dispatch_stream)));
        workers.push(tokio::spawn(run_subscriber(coordinator.clone(), events_rx, dispatch_event)));
        workers.push(tokio::spawn(failure_detector_loop(coordinator.clone())));
        *coordinator.inner.workers.lock().await = workers;

        info!("coordinator started");
        coordinator
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let mut workers = self.inner.workers.lock().await;
        for handle in workers.drain(..) {
            handle.abort();
        }
    }

    // ------------------------------------------------------------------
    // Auction lifecycle
    // ------------------------------------------------------------------

    /// Registers `task` as pending, publishes the broadcast, and schedules
    /// its allocation to fire after `auction_window`.
    pub async fn broadcast_task(&self, task: Task, reliable: bool) {
        let task_id = task.task_id.clone();
        let timestamp = self.inner.clock.now_secs();

        {
            let mut state = self.inner.state.lock().await;
            if !state.tasks.iter().any(|t| t.task_id == task_id) {
                state.tasks.push(task.clone());
            }
            state.pending_tasks.insert(
                task_id.clone(),
                PendingTask {
                    task: task.clone(),
                    bids: Vec::new(),
                    broadcast_at: self.inner.clock.now_instant(),
                },
            );
            state.activity_log.push(ActivityEntry::TaskBroadcast {
                task_id: task_id.clone(),
                timestamp,
            });
        }

        let envelope = Envelope::new(MessageType::TaskBroadcast, "coordinator", Payload::Task(task), timestamp, reliable);
        let _ = self.inner.broker.publish("tasks", envelope, reliable).await;

        let coordinator = self.clone();
        let auction_window = self.inner.config.auction_window();
        tokio::spawn(async move {
            tokio::time::sleep(auction_window).await;
            coordinator.allocate_task(&task_id).await;
        });
    }

    async fn handle_bid(&self, envelope: Envelope) {
        let Payload::Bid(bid) = envelope.payload else {
            return;
        };
        let mut state = self.inner.state.lock().await;
        let Some(pending) = state.pending_tasks.get_mut(&bid.task_id) else {
            return; // auction already closed, or unknown task
        };
        if pending.bids.iter().any(|existing| existing.agent_id == bid.agent_id) {
            debug!(agent_id = %bid.agent_id, task_id = %bid.task_id, "duplicate bid dropped");
            return;
        }
        pending.bids.push(bid);
    }

    /// Closes the auction window for `task_id`: picks the lowest bidder
    /// among currently-live agents, or falls back to a rebroadcast.
    async fn allocate_task(&self, task_id: &str) {
        let mut state = self.inner.state.lock().await;

        if state.completed_task_ids.contains(task_id) || state.cancelled_task_ids.contains(task_id) {
            state.pending_tasks.remove(task_id);
            return;
        }

        let Some(pending) = state.pending_tasks.remove(task_id) else {
            let err = CoordinatorError::UnknownTask(task_id.to_string());
            debug!(task_id, %err, "allocate_task fired for a task no longer pending");
            return;
        };

        let raw = pending.bids;
        let filtered: Vec<Bid> = raw
            .iter()
            .filter(|b| !state.failed_agents.contains(&b.agent_id))
            .cloned()
            .collect();

        if filtered.is_empty() {
            if raw.is_empty() {
                let err = CoordinatorError::NoBidders(task_id.to_string());
                debug!(task_id, %err, "auction closed with no bidders");
                return;
            }
            // All bidders are currently marked failed. The heartbeat path
            // would eventually reassign if we had allocated, but nothing
            // was allocated here, so nothing will ever revisit this task
            // unless we act: enqueue a rebroadcast now instead of leaving
            // it stuck.
            drop(state);
            self.rebroadcast_with_delay(task_id).await;
            return;
        }

        let mut sorted = filtered;
        sorted.sort_by(|a, b| a.bid_value.total_cmp(&b.bid_value));
        state.task_bids.insert(task_id.to_string(), sorted.clone());

        let winner = sorted.into_iter().next().unwrap();
        state.allocated_tasks.push(AllocationRecord {
            task_id: task_id.to_string(),
            agent_id: winner.agent_id.clone(),
        });
        state
            .agent_tasks
            .entry(winner.agent_id.clone())
            .or_default()
            .push(task_id.to_string());
        state.activity_log.push(ActivityEntry::TaskAllocated {
            task_id: task_id.to_string(),
            agent_id: winner.agent_id.clone(),
            timestamp: self.inner.clock.now_secs(),
        });
        drop(state);

        self.publish_allocation(pending.task, winner).await;
    }

    async fn publish_allocation(&self, task: Task, winning_bid: Bid) {
        let envelope = Envelope::new(
            MessageType::TaskAllocation,
            "coordinator",
            Payload::Allocation {
                task,
                agent_id: winning_bid.agent_id.clone(),
                winning_bid,
            },
            self.inner.clock.now_secs(),
            true,
        );
        let _ = self.inner.broker.publish("allocations", envelope, true).await;
    }

    // ------------------------------------------------------------------
    // Heartbeats, telemetry, events
    // ------------------------------------------------------------------

    async fn handle_heartbeat(&self, envelope: Envelope) {
        let Payload::Heartbeat(heartbeat) = envelope.payload else {
            return;
        };
        let mut state = self.inner.state.lock().await;
        state
            .agent_heartbeats
            .insert(heartbeat.agent_id.clone(), (heartbeat.timestamp, self.inner.clock.now_instant()));

        if state.failed_agents.remove(&heartbeat.agent_id) {
            info!(agent_id = %heartbeat.agent_id, "agent recovered");
            state.activity_log.push(ActivityEntry::AgentRecovered {
                agent_id: heartbeat.agent_id,
                timestamp: self.inner.clock.now_secs(),
            });
        }
    }

    async fn handle_agent_stream(&self, envelope: Envelope) {
        let Payload::Stream(sample) = envelope.payload else {
            return;
        };
        let mut state = self.inner.state.lock().await;
        state.agent_streams.insert(sample.agent_id.clone(), sample);
    }

    async fn handle_agent_event(&self, envelope: Envelope) {
        let Payload::Event(event) = envelope.payload else {
            return;
        };
        let (tag, task_id) = event_key_parts(&event);
        let millis = (envelope.timestamp * 1000.0).floor() as i64;
        let key = format!("{}:{}:{}:{}", envelope.sender_id, tag, task_id.as_deref().unwrap_or(""), millis);

        let mut state = self.inner.state.lock().await;
        if !state.processed_events.insert(key) {
            return;
        }

        match event {
            AgentEvent::TaskCompleted { task_id, .. } => {
                state.completed_task_ids.insert(task_id.clone());
                state.cancelled_task_ids.remove(&task_id);
            }
            AgentEvent::TaskFailed { task_id, error } => {
                warn!(task_id, error, "agent reported task failure");
            }
            AgentEvent::TaskCancelled { task_id, .. } => {
                // Marks the task as settled so a reassignment landing in the
                // same narrow window doesn't race a late allocate_task into
                // reviving it; allocate_task and handle_agent_failure both
                // check this set before acting on a task_id.
                state.cancelled_task_ids.insert(task_id.clone());
            }
            AgentEvent::AgentStarted | AgentEvent::AgentCrashed { .. } | AgentEvent::AgentRecovered { .. } => {
                // Liveness transitions are driven by the heartbeat path;
                // these are logged for visibility only.
            }
        }
    }

    // ------------------------------------------------------------------
    // Failure detection & reassignment
    // ------------------------------------------------------------------

    async fn check_failures(&self) {
        let now = self.inner.clock.now_instant();
        let timeout = self.inner.config.heartbeat_timeout();

        let newly_failed: Vec<String> = {
            let state = self.inner.state.lock().await;
            state
                .agent_heartbeats
                .iter()
                .filter(|(agent_id, (_, last_seen))| {
                    state::heartbeat_gap(*last_seen, now) > timeout && !state.failed_agents.contains(agent_id.as_str())
                })
                .map(|(agent_id, _)| agent_id.clone())
                .collect()
        };

        for agent_id in newly_failed {
            {
                let mut state = self.inner.state.lock().await;
                if !state.failed_agents.insert(agent_id.clone()) {
                    continue;
                }
                state.activity_log.push(ActivityEntry::AgentFailed {
                    agent_id: agent_id.clone(),
                    timestamp: self.inner.clock.now_secs(),
                });
            }
            error!(agent_id = %agent_id, "agent failure detected");
            self.handle_agent_failure(&agent_id).await;
        }
    }

    async fn handle_agent_failure(&self, failed: &str) {
        let to_reassign: Vec<String> = {
            let mut state = self.inner.state.lock().await;
            let assigned = state.agent_tasks.get(failed).cloned().unwrap_or_default();
            let mut reassign = Vec::new();
            for task_id in assigned {
                if state.completed_task_ids.contains(&task_id) {
                    continue;
                }
                state.cancelled_task_ids.remove(&task_id);
                reassign.push(task_id);
            }
            state
                .allocated_tasks
                .retain(|record| !(record.agent_id == failed && reassign.contains(&record.task_id)));
            reassign
        };

        for task_id in to_reassign {
            self.reassign_to_next_bidder(&task_id, failed).await;
        }
    }

    async fn reassign_to_next_bidder(&self, task_id: &str, failed: &str) {
        let candidate = {
            let state = self.inner.state.lock().await;
            state
                .task_bids
                .get(task_id)
                .and_then(|bids| bids.iter().find(|b| !state.failed_agents.contains(&b.agent_id)))
                .cloned()
        };

        let Some(winner) = candidate else {
            self.rebroadcast_with_delay(task_id).await;
            return;
        };

        let task = {
            let mut state = self.inner.state.lock().await;
            let Some(task) = state.tasks.iter().find(|t| t.task_id == task_id).cloned() else {
                return;
            };
            state.allocated_tasks.push(AllocationRecord {
                task_id: task_id.to_string(),
                agent_id: winner.agent_id.clone(),
            });
            state.agent_tasks.entry(winner.agent_id.clone()).or_default().push(task_id.to_string());
            state.activity_log.push(ActivityEntry::TaskReassignment {
                task_id: task_id.to_string(),
                from_agent: failed.to_string(),
                to_agent: winner.agent_id.clone(),
                timestamp: self.inner.clock.now_secs(),
            });
            task
        };

        info!(task_id, from = failed, to = %winner.agent_id, "task reassigned to fallback bidder");
        self.publish_allocation(task, winner).await;
    }

    async fn rebroadcast_with_delay(&self, task_id: &str) {
        let (min, max) = self.inner.config.rebroadcast_delay_range();
        let delay_secs = rand::thread_rng().gen_range(min.as_secs_f64()..=max.as_secs_f64());
        let delay = std::time::Duration::from_secs_f64(delay_secs);

        let task = {
            let mut state = self.inner.state.lock().await;
            state.task_bids.remove(task_id);
            let task = state.tasks.iter().find(|t| t.task_id == task_id).cloned();
            state.activity_log.push(ActivityEntry::RebroadcastScheduled {
                task_id: task_id.to_string(),
                delay_secs,
                timestamp: self.inner.clock.now_secs(),
            });
            task
        };
        let Some(task) = task else {
            warn!(task_id, "cannot rebroadcast an unknown task");
            return;
        };

        let coordinator = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_pending = {
                let state = coordinator.inner.state.lock().await;
                !state.completed_task_ids.contains(&task_id)
            };
            if still_pending {
                coordinator.broadcast_task(task, true).await;
            }
        });
    }

    pub async fn request_heartbeat(&self, agent_id: Option<String>) {
        let envelope = Envelope::new(
            MessageType::HeartbeatRequest,
            "coordinator",
            Payload::HeartbeatRequest { agent_id },
            self.inner.clock.now_secs(),
            false,
        );
        let _ = self.inner.broker.publish("heartbeat_request", envelope, false).await;
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_stats(&self) -> Stats {
        let state = self.inner.state.lock().await;
        let allocated_not_completed = state
            .allocated_tasks
            .iter()
            .filter(|r| !state.completed_task_ids.contains(&r.task_id))
            .count();
        let known_agents: HashSet<&String> = state
            .agent_heartbeats
            .keys()
            .chain(state.failed_agents.iter())
            .collect();
        Stats {
            total_tasks: state.tasks.len(),
            pending: state.pending_tasks.len(),
            allocated_not_completed,
            completed: state.completed_task_ids.len(),
            active_agents: state.agent_heartbeats.keys().filter(|a| !state.failed_agents.contains(*a)).count(),
            failed_agents: state.failed_agents.len(),
            total_known_agents: known_agents.len(),
        }
    }

    pub async fn get_agent_status(&self) -> Vec<AgentStatusView> {
        let state = self.inner.state.lock().await;
        let known: HashSet<&String> = state
            .agent_heartbeats
            .keys()
            .chain(state.failed_agents.iter())
            .chain(state.agent_tasks.keys())
            .collect();

        known
            .into_iter()
            .map(|agent_id| AgentStatusView {
                agent_id: agent_id.clone(),
                is_failed: state.failed_agents.contains(agent_id),
                last_heartbeat: state.agent_heartbeats.get(agent_id).map(|(ts, _)| *ts),
                active_task_count: state
                    .agent_tasks
                    .get(agent_id)
                    .map(|tasks| tasks.iter().filter(|t| !state.completed_task_ids.contains(*t)).count())
                    .unwrap_or(0),
                latest_stream: state.agent_streams.get(agent_id).cloned(),
            })
            .collect()
    }

    pub async fn get_recent_activity(&self, limit: usize) -> Vec<ActivityEntry> {
        let state = self.inner.state.lock().await;
        state.activity_log.recent(limit).into_iter().cloned().collect()
    }
}

fn event_key_parts(event: &AgentEvent) -> (&'static str, Option<String>) {
    match event {
        AgentEvent::AgentStarted => ("agent_started", None),
        AgentEvent::AgentCrashed { .. } => ("agent_crashed", None),
        AgentEvent::AgentRecovered { .. } => ("agent_recovered", None),
        AgentEvent::TaskCompleted { task_id, .. } => ("task_completed", Some(task_id.clone())),
        AgentEvent::TaskCancelled { task_id, .. } => ("task_cancelled", Some(task_id.clone())),
        AgentEvent::TaskFailed { task_id, .. } => ("task_failed", Some(task_id.clone())),
    }
}

async fn failure_detector_loop(coordinator: CoordinatorHandle) {
    let mut ticker = tokio::time::interval(coordinator.inner.config.failure_check_interval());
    loop {
        ticker.tick().await;
        if !coordinator.is_running() {
            return;
        }
        coordinator.check_failures().await;
    }
}

// `run_subscriber` drives a by-value async fn; these trampolines let it
// call `CoordinatorHandle`'s `&self` handlers.
async fn dispatch_bid(coordinator: CoordinatorHandle, envelope: Envelope) {
    coordinator.handle_bid(envelope).await;
}

async fn dispatch_heartbeat(coordinator: CoordinatorHandle, envelope: Envelope) {
    coordinator.handle_heartbeat(envelope).await;
}

async fn dispatch_stream(coordinator: CoordinatorHandle, envelope: Envelope) {
    coordinator.handle_agent_stream(envelope).await;
}

async fn dispatch_event(coordinator: CoordinatorHandle, envelope: Envelope) {
    coordinator.handle_agent_event(envelope).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::BrokerConfig;
    use std::time::Duration;

    async fn new_broker() -> Broker {
        let broker = Broker::new(BrokerConfig::default(), Arc::new(SystemClock));
        broker.listen().await;
        broker
    }

    fn bid(agent_id: &str, task_id: &str, value: f64) -> Bid {
        Bid {
            agent_id: agent_id.into(),
            task_id: task_id.into(),
            bid_value: value,
            current_load: 0,
            estimated_completion_time: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_task_registers_pending_and_allocates_after_window() {
        let broker = new_broker().await;
        let mut tasks_rx = broker.subscribe("tasks").await;
        let mut allocations_rx = broker.subscribe("allocations").await;
        let coordinator =
            CoordinatorHandle::spawn(broker.clone(), CoordinatorConfig::default(), Arc::new(SystemClock)).await;

        let task = Task::new("t0", 5, 1.0, "demo", 0.0);
        coordinator.broadcast_task(task, true).await;

        let broadcast = tokio::time::timeout(Duration::from_millis(100), tasks_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broadcast.msg_type, MessageType::TaskBroadcast);

        let bid_envelope = Envelope::new(MessageType::Bid, "a1", Payload::Bid(bid("a1", "t0", 3.0)), 0.0, false);
        broker.publish("bids", bid_envelope, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::advance(Duration::from_secs(3)).await;
        let allocation = tokio::time::timeout(Duration::from_millis(200), allocations_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match allocation.payload {
            Payload::Allocation { agent_id, task, .. } => {
                assert_eq!(agent_id, "a1");
                assert_eq!(task.task_id, "t0");
            }
            other => panic!("expected Allocation, got {other:?}"),
        }
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn duplicate_agent_bid_is_dropped() {
        let broker = new_broker().await;
        let coordinator =
            CoordinatorHandle::spawn(broker.clone(), CoordinatorConfig::default(), Arc::new(SystemClock)).await;
        coordinator.broadcast_task(Task::new("t0", 5, 1.0, "demo", 0.0), true).await;

        coordinator
            .handle_bid(Envelope::new(MessageType::Bid, "a1", Payload::Bid(bid("a1", "t0", 1.0)), 0.0, false))
            .await;
        coordinator
            .handle_bid(Envelope::new(MessageType::Bid, "a1", Payload::Bid(bid("a1", "t0", 2.0)), 0.0, false))
            .await;

        let state = coordinator.inner.state.lock().await;
        assert_eq!(state.pending_tasks.get("t0").unwrap().bids.len(), 1);
        drop(state);
        coordinator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn allocate_task_with_all_bidders_failed_triggers_rebroadcast() {
        let broker = new_broker().await;
        let mut tasks_rx = broker.subscribe("tasks").await;
        let coordinator =
            CoordinatorHandle::spawn(broker.clone(), CoordinatorConfig::default(), Arc::new(SystemClock)).await;

        let task = Task::new("t0", 5, 1.0, "demo", 0.0);
        coordinator.broadcast_task(task, true).await;
        let _first_broadcast = tasks_rx.recv().await.unwrap();

        coordinator
            .handle_bid(Envelope::new(MessageType::Bid, "a1", Payload::Bid(bid("a1", "t0", 1.0)), 0.0, false))
            .await;
        {
            let mut state = coordinator.inner.state.lock().await;
            state.failed_agents.insert("a1".to_string());
        }

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;

        // no bidder survives filtering: rebroadcast is scheduled within [5, 10] s
        tokio::time::advance(Duration::from_secs(11)).await;
        let rebroadcast = tokio::time::timeout(Duration::from_millis(500), tasks_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rebroadcast.msg_type, MessageType::TaskBroadcast);
        coordinator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn agent_failure_reassigns_task_to_fallback_bidder() {
        let broker = new_broker().await;
        let mut allocations_rx = broker.subscribe("allocations").await;
        let coordinator =
            CoordinatorHandle::spawn(broker.clone(), CoordinatorConfig::default(), Arc::new(SystemClock)).await;

        let task_id = "t0".to_string();
        {
            let mut state = coordinator.inner.state.lock().await;
            state.tasks.push(Task::new(&task_id, 5, 3.0, "demo", 0.0));
            state.task_bids.insert(task_id.clone(), vec![bid("a1", &task_id, 1.0), bid("a2", &task_id, 2.0)]);
            state.allocated_tasks.push(AllocationRecord {
                task_id: task_id.clone(),
                agent_id: "a1".into(),
            });
            state.agent_tasks.entry("a1".to_string()).or_default().push(task_id.clone());
            state.agent_heartbeats.insert("a1".to_string(), (0.0, coordinator.inner.clock.now_instant()));
        }

        coordinator.handle_agent_failure("a1").await;

        let allocation = tokio::time::timeout(Duration::from_millis(200), allocations_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match allocation.payload {
            Payload::Allocation { agent_id, .. } => assert_eq!(agent_id, "a2"),
            other => panic!("expected Allocation, got {other:?}"),
        }
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn task_completed_event_marks_completed_and_dedups() {
        let broker = new_broker().await;
        let coordinator =
            CoordinatorHandle::spawn(broker.clone(), CoordinatorConfig::default(), Arc::new(SystemClock)).await;

        let event = AgentEvent::TaskCompleted {
            task_id: "t0".into(),
            execution_time: 1.0,
        };
        let envelope = Envelope::new(MessageType::AgentEvent, "a1", Payload::Event(event.clone()), 1.0, false);
        coordinator.handle_agent_event(envelope.clone()).await;
        coordinator.handle_agent_event(envelope).await;

        let state = coordinator.inner.state.lock().await;
        assert!(state.completed_task_ids.contains("t0"));
        assert_eq!(state.processed_events.len(), 1);
        drop(state);
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn heartbeat_from_failed_agent_clears_failure() {
        let broker = new_broker().await;
        let coordinator =
            CoordinatorHandle::spawn(broker.clone(), CoordinatorConfig::default(), Arc::new(SystemClock)).await;
        {
            let mut state = coordinator.inner.state.lock().await;
            state.failed_agents.insert("a1".to_string());
        }

        let heartbeat = crate::types::Heartbeat {
            agent_id: "a1".into(),
            timestamp: 1.0,
            status: crate::types::AgentStatus::Idle,
            current_load: 0,
            max_load: 5,
        };
        coordinator
            .handle_heartbeat(Envelope::new(MessageType::Heartbeat, "a1", Payload::Heartbeat(heartbeat), 1.0, false))
            .await;

        let state = coordinator.inner.state.lock().await;
        assert!(!state.failed_agents.contains("a1"));
        drop(state);
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn get_stats_reflects_known_and_failed_agents() {
        let broker = new_broker().await;
        let coordinator =
            CoordinatorHandle::spawn(broker.clone(), CoordinatorConfig::default(), Arc::new(SystemClock)).await;
        {
            let mut state = coordinator.inner.state.lock().await;
            state.tasks.push(Task::new("t0", 5, 1.0, "demo", 0.0));
            state.agent_heartbeats.insert("a1".to_string(), (0.0, coordinator.inner.clock.now_instant()));
            state.agent_heartbeats.insert("a2".to_string(), (0.0, coordinator.inner.clock.now_instant()));
            state.failed_agents.insert("a2".to_string());
        }

        let stats = coordinator.get_stats().await;
        assert_eq!(stats.total_tasks, 1);
        assert_eq!(stats.active_agents, 1);
        assert_eq!(stats.failed_agents, 1);
        assert_eq!(stats.total_known_agents, 2);
        coordinator.stop().await;
    }
}
