//! A single generic subscriber-loop driver shared by the agent and the
//! coordinator: each channel a component listens on gets its own task
//! reading a `broadcast::Receiver<Envelope>`, so a slow handler on one
//! channel never blocks delivery on another — there is no shared callback
//! list to protect. A handler call is additionally wrapped in
//! `catch_unwind` so a panicking handler logs and the loop keeps consuming
//! that same channel rather than taking the whole subscriber task down.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::broadcast;

use crate::message::Envelope;

pub(crate) async fn run_subscriber<A, F, Fut>(actor: A, mut rx: broadcast::Receiver<Envelope>, handler: F)
where
    A: Clone,
    F: Fn(A, Envelope) -> Fut + Copy,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                let msg_id = envelope.msg_id.clone();
                if let Err(panic) = AssertUnwindSafe(handler(actor.clone(), envelope)).catch_unwind().await {
                    tracing::error!(msg_id, panic = %panic_message(&panic), "subscriber handler panicked, continuing");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "subscriber lagged, continuing");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
