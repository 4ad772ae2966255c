//! The task execution loop: discrete 100 ms slices, cancellation checked
//! every slice, matching the execution state machine
//! `RUNNING -> {COMPLETED, CANCELLED}`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::Task;

use super::AgentHandle;

const SLICE: Duration = Duration::from_millis(100);

/// Runs `task` to completion or cancellation. Spawned once per accepted
/// allocation; the `cancel` token is fired by `crash()` or is otherwise
/// never triggered.
pub(super) async fn run_execution(agent: AgentHandle, task: Task, cancel: CancellationToken) {
    let total = Duration::from_secs_f64(task.estimated_time);
    let start = agent.clock().now_instant();

    loop {
        if cancel.is_cancelled() {
            agent.finish_cancelled(&task, start).await;
            return;
        }

        let elapsed = agent.clock().now_instant().saturating_duration_since(start);
        if elapsed >= total {
            break;
        }

        let remaining = total - elapsed;
        let step = remaining.min(SLICE);
        tokio::select! {
            _ = cancel.cancelled() => {
                agent.finish_cancelled(&task, start).await;
                return;
            }
            _ = tokio::time::sleep(step) => {}
        }
    }

    // Re-check immediately before declaring victory: a crash fired on the
    // final slice races with the elapsed-time check above.
    if cancel.is_cancelled() {
        agent.finish_cancelled(&task, start).await;
    } else {
        debug!(task_id = %task.task_id, "execution slice loop finished");
        agent.finish_completed(&task, start).await;
    }
}
