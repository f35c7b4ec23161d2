use crate::api::DubApi;
use crate::state::{TaskSnapshot, TaskStatus};
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// The one thing a poll loop needs from the outside world. Every
/// `DubApi` provides it; tests provide it directly.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn task_status(&self, task_id: &str) -> Result<TaskSnapshot>;
}

#[async_trait]
impl TaskSource for dyn DubApi {
    async fn task_status(&self, task_id: &str) -> Result<TaskSnapshot> {
        self.get_task_status(task_id).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(Value),
    Failed(String),
}

/// Polls `task_id` until terminal: an immediate first query, then one
/// query per interval tick. Queries are sequential awaits, so at most
/// one is in flight. Generation jobs are bounded and the user stays
/// on-screen, so the interval is a flat constant rather than a backoff.
/// A transport error is reported as failure without retrying the query.
pub async fn run<A>(api: &A, task_id: &str, interval: Duration) -> TaskOutcome
where
    A: TaskSource + ?Sized,
{
    loop {
        match api.task_status(task_id).await {
            Ok(task) => match task.status {
                TaskStatus::Success => {
                    debug!("task {} succeeded", task_id);
                    return TaskOutcome::Success(task.result.unwrap_or(Value::Null));
                }
                TaskStatus::Failed => {
                    return TaskOutcome::Failed(
                        task.error.unwrap_or_else(|| "task failed".to_string()),
                    );
                }
                TaskStatus::Pending | TaskStatus::Processing => {}
            },
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Handle to a spawned poll loop. Dropping it does NOT cancel the loop;
/// a poller outlives navigation and is only cancelled by its owner's
/// teardown.
#[derive(Debug)]
pub struct PollHandle {
    handle: JoinHandle<()>,
}

impl PollHandle {
    /// Wraps a custom spawned loop (used when terminal handling itself
    /// needs awaits, e.g. a reconciling re-fetch after a batch job).
    pub fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Stops polling without invoking either callback. Idempotent, and
    /// safe after the loop already terminated naturally.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawns a poll loop that invokes exactly one of `on_success` /
/// `on_failure`, exactly once. If the task id is already terminal the
/// single initial query resolves it.
pub fn start<A, S, F>(
    api: Arc<A>,
    task_id: String,
    interval: Duration,
    on_success: S,
    on_failure: F,
) -> PollHandle
where
    A: TaskSource + ?Sized + 'static,
    S: FnOnce(Value) + Send + 'static,
    F: FnOnce(String) + Send + 'static,
{
    let handle = tokio::spawn(async move {
        match run(api.as_ref(), &task_id, interval).await {
            TaskOutcome::Success(result) => on_success(result),
            TaskOutcome::Failed(err) => {
                warn!("task {} failed: {}", task_id, err);
                on_failure(err);
            }
        }
    });
    PollHandle { handle }
}
