use std::{any::Any, future::Future, panic::AssertUnwindSafe, time::Duration};

use futures_util::FutureExt;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Spawner for detached side effects (enforcement, notifications).
///
/// Every task gets its own timeout, has panics contained, and is counted in
/// `node_hub_background_tasks_total`. Nothing is propagated to the spawner.
#[derive(Debug, Clone)]
pub struct BackgroundTasks {
    timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    TimedOut,
    Panicked,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Failed => "failed",
            TaskOutcome::TimedOut => "timed_out",
            TaskOutcome::Panicked => "panicked",
        }
    }
}

impl BackgroundTasks {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn spawn<F>(&self, task: &'static str, fut: F) -> JoinHandle<TaskOutcome>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let timeout = self.timeout;
        tokio::spawn(async move {
            let guarded = AssertUnwindSafe(fut).catch_unwind();
            let outcome = match tokio::time::timeout(timeout, guarded).await {
                Err(_) => {
                    warn!(task, timeout_secs = timeout.as_secs(), "background task timed out");
                    TaskOutcome::TimedOut
                }
                Ok(Err(payload)) => {
                    error!(task, panic = %panic_message(payload.as_ref()), "background task panicked");
                    TaskOutcome::Panicked
                }
                Ok(Ok(Err(err))) => {
                    warn!(task, error = ?err, "background task failed");
                    TaskOutcome::Failed
                }
                Ok(Ok(Ok(()))) => {
                    debug!(task, "background task completed");
                    TaskOutcome::Completed
                }
            };
            counter!(
                "node_hub_background_tasks_total",
                "task" => task,
                "result" => outcome.as_str()
            )
            .increment(1);
            outcome
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
