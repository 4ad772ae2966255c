//! The heartbeat and telemetry-stream background workers.
//!
//! The heartbeat worker also owns auto-recovery: per the worker inventory
//! an agent owns (one heartbeat worker, one telemetry worker, one ephemeral
//! worker per executing task), there is no separate recovery worker, so
//! elapsed-time-since-crash is polled on the same cadence as heartbeats.

use rand::Rng;
use tracing::debug;

use crate::types::{AgentDataStream, AgentStatus, Heartbeat};

use super::AgentHandle;

pub(super) async fn heartbeat_loop(agent: AgentHandle) {
    let mut ticker = tokio::time::interval(agent.config().heartbeat_interval());
    loop {
        ticker.tick().await;
        if !agent.is_running() {
            return;
        }
        agent.check_auto_recover().await;
        agent.send_heartbeat_if_alive().await;
    }
}

pub(super) async fn stream_loop(agent: AgentHandle) {
    let mut ticker = tokio::time::interval(agent.config().stream_interval());
    loop {
        ticker.tick().await;
        if !agent.is_running() {
            return;
        }
        agent.send_data_stream().await;
    }
}

impl AgentHandle {
    pub(super) async fn check_auto_recover(&self) {
        let (is_crashed, enabled, crash_time, delay) = {
            let state = self.state().lock().await;
            (
                state.is_crashed,
                state.auto_recover_enabled,
                state.crash_time,
                state.auto_recover_delay,
            )
        };
        if !is_crashed || !enabled {
            return;
        }
        let Some(crash_time) = crash_time else { return };
        let elapsed = self.clock().now_secs() - crash_time;
        if elapsed >= delay.as_secs_f64() {
            debug!(agent_id = %self.agent_id(), "auto-recover delay elapsed");
            self.recover().await;
        }
    }

    pub(super) async fn send_heartbeat_if_alive(&self) {
        let (is_crashed, current_load, max_load) = {
            let state = self.state().lock().await;
            (state.is_crashed, state.current_load, self.config().max_load())
        };
        if is_crashed {
            return; // heartbeat loop suppresses heartbeats while crashed
        }
        let status = if current_load == 0 {
            AgentStatus::Idle
        } else if current_load >= max_load {
            AgentStatus::Overloaded
        } else {
            AgentStatus::Busy
        };
        let heartbeat = Heartbeat {
            agent_id: self.agent_id().to_string(),
            timestamp: self.clock().now_secs(),
            status,
            current_load,
            max_load,
        };
        self.publish_heartbeat(heartbeat).await;
    }

    pub(super) async fn send_data_stream(&self) {
        let (current_load, completed_count, running_ids, assigned_count) = {
            let state = self.state().lock().await;
            (
                state.current_load,
                state.completed_tasks.len() as u32,
                state.running_tasks.keys().cloned().collect::<Vec<_>>(),
                state.assigned_tasks.len() as i64,
            )
        };
        let max_load = self.config().max_load();
        let mut rng = rand::thread_rng();
        let sample = AgentDataStream {
            agent_id: self.agent_id().to_string(),
            timestamp: self.clock().now_secs(),
            cpu_utilization: if max_load == 0 {
                0.0
            } else {
                (current_load as f64 / max_load as f64) * 100.0
            },
            memory_usage_mb: rng.gen_range(100.0..500.0) + current_load as f64 * 50.0,
            active_tasks: current_load,
            completed_tasks_count: completed_count,
            avg_task_time: self.average_task_time().await,
            running_tasks: running_ids,
            queue_length: assigned_count - current_load as i64,
        };
        self.publish_stream(sample).await;
    }
}
