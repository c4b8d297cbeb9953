//! The generation exchange: a single-consumer FIFO scheduler for generation
//! requests.
//!
//! Exactly one task runs at a time. Each task passes the budget gate, then
//! the execution service, retrying transient failures with backoff. Progress
//! is published through a [`GenerationState`] record that observers read as
//! snapshots.
//!
//! # Example
//!
//! ```ignore
//! use storyloom::exchange::{Exchange, GenerationRequest};
//!
//! let exchange = Exchange::new(executor, budget, &intent_hook, config.exchange);
//! let pending = exchange.submit(GenerationRequest::new(messages, params));
//! let response = pending.await?;
//! ```

mod budget;
mod retry;
mod runner;
mod state;
mod task;


pub use budget::BudgetOracle;
pub use state::{BudgetState, GenerationState, GenerationStatus, Subscription};
pub use task::{GenerationRequest, GenerationResult, PendingGeneration, TaskId};

use crate::config::ExchangeConfig;
use crate::generation::{ExecutionService, GenerationError};
use crate::hook::IntentHook;
use crate::util::lock_or_recover;
use budget::BudgetGate;
use retry::RetryPolicy;
use state::StateStore;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use task::GenerationTask;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct CurrentTask {
    id: TaskId,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<GenerationTask>,
    current: Option<CurrentTask>,
    /// A runner is spawned and has not yet found the queue empty.
    running: bool,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.pending.len() + usize::from(self.current.is_some())
    }
}

struct Inner {
    queue: Mutex<QueueState>,
    state: Arc<StateStore>,
    executor: Arc<dyn ExecutionService>,
    gate: BudgetGate,
    retry: RetryPolicy,
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, QueueState> {
        lock_or_recover(&self.queue, "generation queue")
    }
}

/// Handle to a generation exchange. Clones share the same queue and state.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<Inner>,
}

impl Exchange {
    /// Create an exchange and register its budget gate with `intent_hook`.
    pub fn new(
        executor: Arc<dyn ExecutionService>,
        budget: Arc<dyn BudgetOracle>,
        intent_hook: &IntentHook,
        config: ExchangeConfig,
    ) -> Self {
        let gate = BudgetGate::new(budget, config.countdown_tick());
        intent_hook.register(gate.intent_handler());
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(QueueState::default()),
                state: StateStore::new(),
                executor,
                gate,
                retry: RetryPolicy::from_config(&config),
            }),
        }
    }

    /// Queue a request behind everything already submitted.
    ///
    /// Must be called within a tokio runtime; the runner is spawned on it.
    pub fn submit(&self, request: GenerationRequest) -> PendingGeneration {
        let (task, pending) = GenerationTask::new(request);
        let id = task.id;

        let (snapshot, start_runner) = {
            let mut queue = self.inner.queue();
            queue.pending.push_back(task);
            let idle = queue.current.is_none();
            let depth = queue.depth();
            let snapshot = self.inner.state.apply(|s| {
                s.queue_length = depth;
                if idle {
                    s.status = GenerationStatus::Queued;
                }
            });
            let start_runner = !queue.running;
            queue.running = true;
            (snapshot, start_runner)
        };
        self.inner.state.publish(&snapshot);
        debug!("Task {id} queued (queue length {})", snapshot.queue_length);

        if start_runner {
            tokio::spawn(runner::run(self.inner.clone()));
        }
        pending
    }

    /// Cancel the running task, if any. Returns whether one was running.
    pub fn cancel_current(&self) -> bool {
        let queue = self.inner.queue();
        match &queue.current {
            Some(current) => {
                info!("Cancelling current task {}", current.id);
                current.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel one task: the running one via its token, a queued one by
    /// removing it from the queue. Returns whether the task was found.
    pub fn cancel(&self, id: TaskId) -> bool {
        let (removed, snapshot) = {
            let mut queue = self.inner.queue();
            if let Some(current) = &queue.current
                && current.id == id
            {
                info!("Cancelling current task {id}");
                current.cancel.cancel();
                return true;
            }
            let Some(pos) = queue.pending.iter().position(|t| t.id == id) else {
                return false;
            };
            let removed = queue.pending.remove(pos);
            let depth = queue.depth();
            let snapshot = self.inner.state.apply(|s| s.queue_length = depth);
            (removed, snapshot)
        };
        if let Some(task) = removed {
            info!("Removed queued task {id}");
            task.cancel.cancel();
            task.settle(Err(GenerationError::Cancelled));
        }
        self.inner.state.publish(&snapshot);
        true
    }

    /// Cancel the running task and reject everything queued.
    /// Returns the number of tasks affected.
    pub fn cancel_all(&self) -> usize {
        let (drained, had_current, snapshot) = {
            let mut queue = self.inner.queue();
            let drained: Vec<_> = queue.pending.drain(..).collect();
            let had_current = if let Some(current) = &queue.current {
                current.cancel.cancel();
                true
            } else {
                false
            };
            let depth = queue.depth();
            let snapshot = self.inner.state.apply(|s| s.queue_length = depth);
            (drained, had_current, snapshot)
        };
        let count = drained.len() + usize::from(had_current);
        for task in drained {
            task.cancel.cancel();
            task.settle(Err(GenerationError::Cancelled));
        }
        self.inner.state.publish(&snapshot);
        if count > 0 {
            info!("Cancelled {count} task(s)");
        }
        count
    }

    /// Ids of tasks waiting to run, in the order they will run.
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<TaskId> {
        self.inner.queue().pending.iter().map(|t| t.id).collect()
    }

    /// Id of the running task.
    #[must_use]
    pub fn current_task(&self) -> Option<TaskId> {
        self.inner.queue().current.as_ref().map(|c| c.id)
    }

    /// Register a state observer. It is called immediately with the
    /// current snapshot, then after every change.
    pub fn subscribe(
        &self,
        listener: impl Fn(&GenerationState) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.state.subscribe(Arc::new(listener))
    }

    #[must_use]
    pub fn state(&self) -> GenerationState {
        self.inner.state.snapshot()
    }

    /// Async view of the state for observers that poll in a loop.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<GenerationState> {
        self.inner.state.watch()
    }
}
