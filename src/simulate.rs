//! Stand-in collaborators for running the exchange without a host editor.
//!
//! `storyloom simulate` drives the exchange with these, and the test suites
//! use them to script failures, latency and budget shortages.

use crate::exchange::{BudgetOracle, TaskId};
use crate::generation::{
    Choice, ExecutionError, ExecutionRequest, ExecutionService, GenerationResponse,
};
use crate::util::lock_or_recover;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: u64 = 2048;

/// Output allowance that refills to `capacity` after a cooldown.
pub struct SimulatedBudget {
    allowed: AtomicU64,
    capacity: u64,
    cooldown: Duration,
    ready_at: Mutex<Option<Instant>>,
}

impl SimulatedBudget {
    pub fn new(allowed: u64, cooldown: Duration) -> Self {
        Self {
            allowed: AtomicU64::new(allowed),
            capacity: DEFAULT_CAPACITY.max(allowed),
            cooldown,
            ready_at: Mutex::new(None),
        }
    }

    /// Amount restored when the cooldown ends. Must cover the largest request.
    #[must_use]
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Consume output, as a finished generation would.
    pub fn spend(&self, amount: u64) {
        let _ = self
            .allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |a| {
                Some(a.saturating_sub(amount))
            });
    }

    pub fn allowed(&self) -> u64 {
        self.refill_if_ready();
        self.allowed.load(Ordering::SeqCst)
    }

    fn refill_if_ready(&self) {
        let mut ready_at = lock_or_recover(&self.ready_at, "simulated budget");
        if let Some(at) = *ready_at
            && Instant::now() >= at
        {
            self.allowed.store(self.capacity, Ordering::SeqCst);
            *ready_at = None;
            debug!("Simulated budget refilled to {}", self.capacity);
        }
    }

    /// Start the cooldown if it is not running, and return when it ends.
    fn refill_deadline(&self) -> Instant {
        *lock_or_recover(&self.ready_at, "simulated budget")
            .get_or_insert_with(|| Instant::now() + self.cooldown)
    }
}

#[async_trait]
impl BudgetOracle for SimulatedBudget {
    async fn allowed_output(&self) -> u64 {
        self.allowed()
    }

    async fn time_until_allowed_output(&self, requested: u64) -> Duration {
        if self.allowed() >= requested {
            return Duration::ZERO;
        }
        self.refill_deadline()
            .saturating_duration_since(Instant::now())
    }

    async fn wait_for_allowed_output(&self, requested: u64) {
        if self.allowed() >= requested {
            return;
        }
        if requested > self.capacity {
            // No refill can cover it; stay pending until the caller cancels.
            warn!(
                "Requested output {requested} exceeds simulated capacity {}",
                self.capacity
            );
            std::future::pending::<()>().await;
        }
        while self.allowed() < requested {
            let at = self.refill_deadline();
            tokio::time::sleep_until(at).await;
        }
    }
}

/// One scripted outcome of an execution call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Succeed(String),
    /// Fail with a message; its kind follows the transient marker rule.
    Fail(String),
    /// Simulate a crashing backend.
    Panic,
}

/// Execution service that plays back a script, one step per call.
///
/// When the script runs out every call succeeds with the fallback text.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<ScriptStep>>,
    fallback: String,
    latency: Duration,
    budget: Option<Arc<SimulatedBudget>>,
    calls: Mutex<Vec<TaskId>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            latency: Duration::ZERO,
            budget: None,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_script(self, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        lock_or_recover(&self.script, "executor script").extend(steps);
        self
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Spend `max_tokens` from this budget after every successful call.
    #[must_use]
    pub fn with_budget(mut self, budget: Arc<SimulatedBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Number of execute calls so far.
    pub fn calls(&self) -> usize {
        lock_or_recover(&self.calls, "executor calls").len()
    }

    /// Task ids in the order execute was called (one entry per attempt).
    pub fn call_log(&self) -> Vec<TaskId> {
        lock_or_recover(&self.calls, "executor calls").clone()
    }

    /// Highest number of overlapping execute calls observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionService for ScriptedExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<GenerationResponse, ExecutionError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        lock_or_recover(&self.calls, "executor calls").push(request.task_id);

        let step = lock_or_recover(&self.script, "executor script")
            .pop_front()
            .unwrap_or_else(|| ScriptStep::Succeed(self.fallback.clone()));

        tokio::select! {
            () = request.cancel.cancelled() => return Err(ExecutionError::cancelled()),
            () = tokio::time::sleep(self.latency) => {}
        }

        let text = match step {
            ScriptStep::Succeed(text) => text,
            ScriptStep::Fail(message) => return Err(ExecutionError::from_message(message)),
            ScriptStep::Panic => panic!("scripted backend crash"),
        };

        let chunks: Vec<&str> = text.split_inclusive(' ').collect();
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            request
                .progress
                .emit(vec![Choice::text(*chunk)], i == last);
        }

        if let Some(budget) = &self.budget {
            budget.spend(u64::from(request.params.max_tokens));
        }

        Ok(GenerationResponse {
            choices: vec![Choice {
                index: 0,
                text,
                finish_reason: Some("stop".into()),
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_budget_refills_after_cooldown() {
        let budget = SimulatedBudget::new(10, Duration::from_secs(4)).with_capacity(100);
        assert_eq!(budget.allowed_output().await, 10);
        assert_eq!(budget.time_until_allowed_output(5).await, Duration::ZERO);
        assert_eq!(
            budget.time_until_allowed_output(50).await,
            Duration::from_secs(4)
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            budget.time_until_allowed_output(50).await,
            Duration::from_secs(3)
        );

        budget.wait_for_allowed_output(50).await;
        assert_eq!(budget.allowed_output().await, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_beyond_capacity_stays_pending() {
        let budget = SimulatedBudget::new(0, Duration::ZERO).with_capacity(10);
        let waited =
            tokio::time::timeout(Duration::from_secs(5), budget.wait_for_allowed_output(50)).await;
        assert!(waited.is_err());
        assert_eq!(budget.allowed_output().await, 0);
    }

    #[tokio::test]
    async fn test_spend_saturates() {
        let budget = SimulatedBudget::new(30, Duration::ZERO);
        budget.spend(50);
        assert_eq!(budget.allowed_output().await, 0);
    }
}
