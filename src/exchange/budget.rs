//! Budget gate: hold a task until the platform allows its output volume.
//!
//! Waiting has two phases with different UI affordances. First the user must
//! actively choose to continue (a Continue button); then a cooldown is
//! counted down (a timer). The platform's own wait call has the last word.

use super::state::{BudgetState, GenerationState, GenerationStatus, StateStore};
use crate::generation::GenerationError;
use crate::hook::{IntentEvent, IntentHandler};
use crate::util::lock_or_recover;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The platform's output allowance.
#[async_trait]
pub trait BudgetOracle: Send + Sync {
    /// Output volume allowed right now.
    async fn allowed_output(&self) -> u64;

    /// Estimated wait until `requested` would be allowed.
    async fn time_until_allowed_output(&self, requested: u64) -> Duration;

    /// Suspend until the platform's bookkeeping allows `requested`.
    async fn wait_for_allowed_output(&self, requested: u64);
}

/// The parked user-wait gate. Only a human intent event resolves it.
#[derive(Default)]
pub(crate) struct UserWait {
    resolver: Mutex<Option<oneshot::Sender<()>>>,
}

impl UserWait {
    fn park(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *lock_or_recover(&self.resolver, "budget resolver") = Some(tx);
        rx
    }

    fn clear(&self) {
        lock_or_recover(&self.resolver, "budget resolver").take();
    }

    pub fn is_parked(&self) -> bool {
        lock_or_recover(&self.resolver, "budget resolver").is_some()
    }
}

impl IntentHandler for UserWait {
    fn on_intent(&self, event: &IntentEvent) {
        if !event.is_human() {
            debug!("Ignoring scripted generation intent during budget wait");
            return;
        }
        if let Some(resolver) = lock_or_recover(&self.resolver, "budget resolver").take() {
            info!("User chose to continue; leaving budget user wait");
            let _ = resolver.send(());
        }
    }

    fn name(&self) -> &'static str {
        "budget_user_wait"
    }
}

pub(crate) struct BudgetGate {
    oracle: Arc<dyn BudgetOracle>,
    user_wait: Arc<UserWait>,
    tick: Duration,
}

impl BudgetGate {
    pub fn new(oracle: Arc<dyn BudgetOracle>, tick: Duration) -> Self {
        Self {
            oracle,
            user_wait: Arc::new(UserWait::default()),
            tick,
        }
    }

    /// Handler to register with the host's intent hook.
    pub fn intent_handler(&self) -> Arc<UserWait> {
        self.user_wait.clone()
    }

    /// Return once `threshold` output is permitted; reject on cancellation.
    pub async fn ensure_budget(
        &self,
        threshold: u64,
        token: &CancellationToken,
        state: &StateStore,
    ) -> Result<(), GenerationError> {
        let allowed = self.oracle.allowed_output().await;
        if allowed >= threshold {
            return Ok(());
        }
        debug!("Budget allows {allowed}, task needs {threshold}; waiting");

        let result = self.wait_for_budget(threshold, token, state).await;
        if result.is_err() {
            self.reset(state);
        }
        result
    }

    /// Drop any parked user wait and return the budget fields to normal.
    pub fn reset(&self, state: &StateStore) {
        self.user_wait.clear();
        state.update(GenerationState::clear_budget);
    }

    async fn wait_for_budget(
        &self,
        threshold: u64,
        token: &CancellationToken,
        state: &StateStore,
    ) -> Result<(), GenerationError> {
        self.wait_for_user(threshold, token, state).await?;

        let remaining = self.oracle.time_until_allowed_output(threshold).await;
        if !remaining.is_zero() {
            self.count_down(remaining, token, state).await?;
        }

        tokio::select! {
            () = token.cancelled() => return Err(GenerationError::Cancelled),
            () = self.oracle.wait_for_allowed_output(threshold) => {}
        }

        state.update(|s| {
            s.status = GenerationStatus::Generating;
            s.clear_budget();
        });
        Ok(())
    }

    async fn wait_for_user(
        &self,
        threshold: u64,
        token: &CancellationToken,
        state: &StateStore,
    ) -> Result<(), GenerationError> {
        let estimate = self.oracle.time_until_allowed_output(threshold).await;
        // Install the resolver before announcing the wait, so a listener
        // reacting to the status change can already release it.
        let released = self.user_wait.park();
        state.update(|s| {
            s.status = GenerationStatus::WaitingForUser;
            s.budget_state = BudgetState::WaitingForUser;
            s.budget_wait_time = Some(estimate);
            s.budget_time_remaining = None;
            s.budget_wait_end_time = chrono::Duration::from_std(estimate)
                .ok()
                .map(|d| Utc::now() + d);
        });
        info!(
            "Waiting for user to continue (budget estimate {}s)",
            estimate.as_secs()
        );

        tokio::select! {
            () = token.cancelled() => Err(GenerationError::Cancelled),
            result = released => {
                if result.is_err() {
                    warn!("Budget user wait dropped without confirmation");
                    return Err(GenerationError::Cancelled);
                }
                Ok(())
            }
        }
    }

    async fn count_down(
        &self,
        duration: Duration,
        token: &CancellationToken,
        state: &StateStore,
    ) -> Result<(), GenerationError> {
        let deadline = Instant::now() + duration;
        let wall_deadline = chrono::Duration::from_std(duration)
            .ok()
            .map(|d| Utc::now() + d);
        info!("Budget cooldown of {}s", duration.as_secs());

        state.update(|s| {
            s.status = GenerationStatus::WaitingForBudget;
            s.budget_state = BudgetState::WaitingForTimer;
            s.budget_time_remaining = Some(duration);
            s.budget_wait_end_time = wall_deadline;
        });

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            tokio::select! {
                () = token.cancelled() => return Err(GenerationError::Cancelled),
                () = tokio::time::sleep(left.min(self.tick)) => {}
            }
            let left = deadline.saturating_duration_since(Instant::now());
            state.update(|s| s.budget_time_remaining = Some(left));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::IntentHook;
    use crate::simulate::SimulatedBudget;

    fn gate(budget: Arc<SimulatedBudget>) -> (BudgetGate, IntentHook, Arc<StateStore>) {
        let gate = BudgetGate::new(budget, Duration::from_secs(1));
        let hook = IntentHook::new();
        hook.register(gate.intent_handler());
        (gate, hook, StateStore::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_enough_budget_changes_nothing() {
        let (gate, _hook, state) = gate(Arc::new(SimulatedBudget::new(100, Duration::from_secs(5))));
        let before = state.snapshot();
        gate.ensure_budget(80, &CancellationToken::new(), &state)
            .await
            .unwrap();
        assert_eq!(state.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_human_intent_releases_then_counts_down() {
        let budget = Arc::new(SimulatedBudget::new(0, Duration::from_secs(3)).with_capacity(100));
        let (gate, hook, state) = gate(budget);
        let gate = Arc::new(gate);

        let remaining = Arc::new(Mutex::new(Vec::new()));
        let sink = remaining.clone();
        let _sub = state.subscribe(Arc::new(move |s: &GenerationState| {
            if s.budget_state == BudgetState::WaitingForTimer {
                sink.lock().unwrap().push(s.budget_time_remaining);
            }
        }));

        let mut rx = state.watch();
        let handle = {
            let gate = gate.clone();
            let state = state.clone();
            tokio::spawn(async move {
                gate.ensure_budget(50, &CancellationToken::new(), &state)
                    .await
            })
        };

        rx.wait_for(|s| s.status == GenerationStatus::WaitingForUser)
            .await
            .unwrap();
        let waiting = state.snapshot();
        assert_eq!(waiting.budget_state, BudgetState::WaitingForUser);
        assert_eq!(waiting.budget_wait_time, Some(Duration::from_secs(3)));
        assert!(waiting.budget_wait_end_time.is_some());

        hook.fire(&IntentEvent::script());
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(state.snapshot().status, GenerationStatus::WaitingForUser);
        assert!(gate.user_wait.is_parked());

        hook.fire(&IntentEvent::human());
        handle.await.unwrap().unwrap();

        let done = state.snapshot();
        assert_eq!(done.status, GenerationStatus::Generating);
        assert_eq!(done.budget_state, BudgetState::Normal);
        assert_eq!(done.budget_time_remaining, None);

        let remaining = remaining.lock().unwrap();
        assert!(remaining.len() >= 2);
        assert!(remaining.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(remaining.last(), Some(&Some(Duration::ZERO)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_user_wait() {
        let budget = Arc::new(SimulatedBudget::new(0, Duration::from_secs(3)));
        let (gate, _hook, state) = gate(budget);
        let gate = Arc::new(gate);
        let token = CancellationToken::new();

        let mut rx = state.watch();
        let handle = {
            let (gate, state, token) = (gate.clone(), state.clone(), token.clone());
            tokio::spawn(async move { gate.ensure_budget(10, &token, &state).await })
        };
        rx.wait_for(|s| s.status == GenerationStatus::WaitingForUser)
            .await
            .unwrap();

        token.cancel();
        assert_eq!(handle.await.unwrap(), Err(GenerationError::Cancelled));
        assert_eq!(state.snapshot().budget_state, BudgetState::Normal);
        assert!(!gate.user_wait.is_parked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_countdown() {
        let budget = Arc::new(SimulatedBudget::new(0, Duration::from_secs(30)));
        let (gate, hook, state) = gate(budget);
        let gate = Arc::new(gate);
        let token = CancellationToken::new();

        let mut rx = state.watch();
        let handle = {
            let (gate, state, token) = (gate.clone(), state.clone(), token.clone());
            tokio::spawn(async move { gate.ensure_budget(10, &token, &state).await })
        };
        rx.wait_for(|s| s.status == GenerationStatus::WaitingForUser)
            .await
            .unwrap();
        hook.fire(&IntentEvent::human());
        rx.wait_for(|s| s.status == GenerationStatus::WaitingForBudget)
            .await
            .unwrap();

        token.cancel();
        assert_eq!(handle.await.unwrap(), Err(GenerationError::Cancelled));
        let after = state.snapshot();
        assert_eq!(after.budget_state, BudgetState::Normal);
        assert_eq!(after.budget_time_remaining, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_countdown_when_budget_ready_after_release() {
        // Zero cooldown: the refill is due by the time the user continues.
        let budget = Arc::new(SimulatedBudget::new(0, Duration::ZERO).with_capacity(100));
        let (gate, hook, state) = gate(budget);
        let gate = Arc::new(gate);

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        let _sub = state.subscribe(Arc::new(move |s: &GenerationState| {
            sink.lock().unwrap().push(s.status);
        }));

        let mut rx = state.watch();
        let handle = {
            let (gate, state) = (gate.clone(), state.clone());
            tokio::spawn(async move {
                gate.ensure_budget(50, &CancellationToken::new(), &state)
                    .await
            })
        };
        rx.wait_for(|s| s.status == GenerationStatus::WaitingForUser)
            .await
            .unwrap();
        hook.fire(&IntentEvent::human());
        handle.await.unwrap().unwrap();

        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                GenerationStatus::Idle,
                GenerationStatus::WaitingForUser,
                GenerationStatus::Generating,
            ]
        );
        assert_eq!(state.snapshot().budget_state, BudgetState::Normal);
    }

    /// Reports no wait left, but its own bookkeeping never catches up.
    #[derive(Default)]
    struct StuckOracle {
        entered: tokio::sync::Notify,
    }

    #[async_trait]
    impl BudgetOracle for StuckOracle {
        async fn allowed_output(&self) -> u64 {
            0
        }

        async fn time_until_allowed_output(&self, _requested: u64) -> Duration {
            Duration::ZERO
        }

        async fn wait_for_allowed_output(&self, _requested: u64) {
            self.entered.notify_one();
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_platform_wait() {
        let oracle = Arc::new(StuckOracle::default());
        let gate = Arc::new(BudgetGate::new(oracle.clone(), Duration::from_secs(1)));
        let hook = IntentHook::new();
        hook.register(gate.intent_handler());
        let state = StateStore::new();
        let token = CancellationToken::new();

        let mut rx = state.watch();
        let handle = {
            let (gate, state, token) = (gate.clone(), state.clone(), token.clone());
            tokio::spawn(async move { gate.ensure_budget(10, &token, &state).await })
        };
        rx.wait_for(|s| s.status == GenerationStatus::WaitingForUser)
            .await
            .unwrap();
        hook.fire(&IntentEvent::human());
        oracle.entered.notified().await;

        token.cancel();
        assert_eq!(handle.await.unwrap(), Err(GenerationError::Cancelled));
        let after = state.snapshot();
        assert_eq!(after.budget_state, BudgetState::Normal);
        assert_eq!(after.budget_wait_time, None);
        assert_eq!(after.budget_wait_end_time, None);
        assert!(!gate.user_wait.is_parked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_intent_outside_wait_is_noop() {
        let (gate, hook, _state) = gate(Arc::new(SimulatedBudget::new(0, Duration::ZERO)));
        hook.fire(&IntentEvent::human());
        assert!(!gate.user_wait.is_parked());
    }
}
