//! The runner loop: one task at a time, in submission order.

use super::retry::RetryDecision;
use super::state::GenerationStatus;
use super::task::{GenerationResult, GenerationTask};
use super::{CurrentTask, Inner};
use crate::generation::{ErrorKind, ExecutionError, GenerationError};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Drain the queue, then mark the exchange idle and exit.
pub(super) async fn run(inner: Arc<Inner>) {
    loop {
        let (task, snapshot) = {
            let mut queue = inner.queue();
            queue.current = None;
            match queue.pending.pop_front() {
                Some(task) => {
                    queue.current = Some(CurrentTask {
                        id: task.id,
                        cancel: task.cancel.clone(),
                    });
                    let depth = queue.depth();
                    let snapshot = inner.state.apply(|s| {
                        s.status = GenerationStatus::Generating;
                        s.queue_length = depth;
                        s.error = None;
                    });
                    (task, snapshot)
                }
                None => {
                    queue.running = false;
                    let snapshot = inner.state.apply(|s| {
                        s.status = GenerationStatus::Idle;
                        s.queue_length = 0;
                    });
                    drop(queue);
                    inner.state.publish(&snapshot);
                    debug!("Generation queue empty; runner idle");
                    return;
                }
            }
        };
        inner.state.publish(&snapshot);

        info!("Starting task {}", task.id);
        let result = match AssertUnwindSafe(execute(&inner, &task)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!("Task {} panicked outside the execution service", task.id);
                inner.gate.reset(&inner.state);
                Err(GenerationError::Fatal("Generation task panicked".into()))
            }
        };
        settle(&inner, task, result);
    }
}

/// Budget check, execution and retries for one task.
async fn execute(inner: &Inner, task: &GenerationTask) -> GenerationResult {
    let policy = inner.retry.for_task(task.params.max_retries);
    let threshold = task.params.budget_threshold();
    let mut attempts = 0u32;

    loop {
        if task.cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        inner
            .gate
            .ensure_budget(threshold, &task.cancel, &inner.state)
            .await?;
        if task.cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        let attempt = AssertUnwindSafe(inner.executor.execute(task.execution_request()))
            .catch_unwind()
            .await;
        let err = match attempt {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(err)) => err,
            Err(_) => {
                error!("Execution service panicked on task {}", task.id);
                ExecutionError::fatal("Execution service panicked")
            }
        };
        if task.cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        if err.kind() == ErrorKind::Transient {
            attempts += 1;
        }
        match policy.decide(&err, attempts) {
            RetryDecision::Retry(delay) => {
                warn!(
                    "{}, retrying task {} in {}s (attempt {}/{})",
                    err,
                    task.id,
                    delay.as_secs(),
                    attempts,
                    policy.max_retries
                );
                tokio::select! {
                    () = task.cancel.cancelled() => return Err(GenerationError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            RetryDecision::Exhausted => {
                return Err(GenerationError::RetriesExhausted {
                    attempts,
                    message: err.message().to_string(),
                });
            }
            RetryDecision::Fatal => return Err(GenerationError::Fatal(err.message().to_string())),
            RetryDecision::Cancelled => return Err(GenerationError::Cancelled),
        }
    }
}

/// Publish the outcome, then hand it to the caller. Consumes the task.
fn settle(inner: &Inner, task: GenerationTask, result: GenerationResult) {
    match &result {
        Ok(_) => {
            info!("Task {} completed", task.id);
            inner
                .state
                .update(|s| s.status = GenerationStatus::Completed);
        }
        Err(GenerationError::Cancelled) => {
            info!("Task {} cancelled", task.id);
        }
        Err(err) => {
            error!("Task {} failed: {}", task.id, err);
            let message = err.to_string();
            inner.state.update(|s| {
                s.status = GenerationStatus::Failed;
                s.error = Some(message);
            });
        }
    }
    task.settle(result);
}
