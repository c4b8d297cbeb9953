//! Observable exchange state and its broadcaster.

use crate::util::lock_or_recover;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    #[default]
    Idle,
    Queued,
    Generating,
    WaitingForBudget,
    WaitingForUser,
    Completed,
    Failed,
}

impl GenerationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Generating => "generating",
            Self::WaitingForBudget => "waiting_for_budget",
            Self::WaitingForUser => "waiting_for_user",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Which budget wait affordance the UI should show.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    #[default]
    Normal,
    /// Waiting for the user to choose to continue.
    WaitingForUser,
    /// Counting down a cooldown.
    WaitingForTimer,
}

/// Snapshot of everything observers may know about the exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationState {
    pub status: GenerationStatus,
    pub error: Option<String>,
    /// Pending tasks plus the current one.
    pub queue_length: usize,
    pub budget_state: BudgetState,
    /// Estimate recorded when the user wait started.
    #[serde(with = "duration_ms")]
    pub budget_wait_time: Option<Duration>,
    #[serde(with = "duration_ms")]
    pub budget_time_remaining: Option<Duration>,
    pub budget_wait_end_time: Option<DateTime<Utc>>,
}

impl GenerationState {
    pub(crate) fn clear_budget(&mut self) {
        self.budget_state = BudgetState::Normal;
        self.budget_wait_time = None;
        self.budget_time_remaining = None;
        self.budget_wait_end_time = None;
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }
}

pub type Listener = Arc<dyn Fn(&GenerationState) + Send + Sync>;

/// A state snapshot stamped with its position in the change history.
pub(crate) struct Revision {
    seq: u64,
    state: GenerationState,
}

impl Deref for Revision {
    type Target = GenerationState;

    fn deref(&self) -> &GenerationState {
        &self.state
    }
}

struct Versioned {
    seq: u64,
    state: GenerationState,
}

/// Per-listener delivery queue.
///
/// Only one thread delivers to a listener at a time, in revision order.
/// A revision older than the last one delivered is dropped, so the final
/// call a listener sees is always the latest state.
#[derive(Default)]
struct Mailbox {
    pending: BTreeMap<u64, GenerationState>,
    delivered: Option<u64>,
    delivering: bool,
}

impl Mailbox {
    fn is_stale(&self, seq: u64) -> bool {
        self.delivered.is_some_and(|last| seq <= last)
    }
}

struct Subscriber {
    id: u64,
    listener: Listener,
    mailbox: Mutex<Mailbox>,
}

impl Subscriber {
    fn deliver(&self, seq: u64, snapshot: &GenerationState) {
        {
            let mut mailbox = lock_or_recover(&self.mailbox, "listener mailbox");
            if mailbox.is_stale(seq) {
                return;
            }
            mailbox.pending.insert(seq, snapshot.clone());
            // Another call (possibly this one, re-entered from the listener)
            // is already draining the queue and will pick this revision up.
            if mailbox.delivering {
                return;
            }
            mailbox.delivering = true;
        }
        loop {
            let next = {
                let mut mailbox = lock_or_recover(&self.mailbox, "listener mailbox");
                loop {
                    let popped = mailbox.pending.pop_first();
                    match popped {
                        Some((seq, _)) if mailbox.is_stale(seq) => {}
                        Some((seq, state)) => {
                            mailbox.delivered = Some(seq);
                            break Some(state);
                        }
                        None => {
                            mailbox.delivering = false;
                            break None;
                        }
                    }
                }
            };
            match next {
                Some(state) => notify(&self.listener, &state),
                None => return,
            }
        }
    }
}

/// Owns the state record and pushes snapshots to subscribers.
///
/// `apply` mutates under the lock, stamps a revision and feeds the watch
/// channel; `publish` runs the callback listeners afterwards, outside the
/// state lock, so a listener may call back into the exchange. Revisions
/// published concurrently reach each listener in order.
pub struct StateStore {
    state: Mutex<Versioned>,
    listeners: Mutex<Vec<Arc<Subscriber>>>,
    next_listener: AtomicU64,
    watch: watch::Sender<GenerationState>,
}

impl StateStore {
    pub fn new() -> Arc<Self> {
        let (watch, _) = watch::channel(GenerationState::default());
        Arc::new(Self {
            state: Mutex::new(Versioned {
                seq: 0,
                state: GenerationState::default(),
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            watch,
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> GenerationState {
        lock_or_recover(&self.state, "generation state").state.clone()
    }

    fn revision(&self) -> Revision {
        let current = lock_or_recover(&self.state, "generation state");
        Revision {
            seq: current.seq,
            state: current.state.clone(),
        }
    }

    /// Apply a change and notify every subscriber.
    pub fn update(&self, change: impl FnOnce(&mut GenerationState)) {
        let revision = self.apply(change);
        self.publish(&revision);
    }

    /// Apply a change without running callback listeners yet.
    pub(crate) fn apply(&self, change: impl FnOnce(&mut GenerationState)) -> Revision {
        let mut current = lock_or_recover(&self.state, "generation state");
        change(&mut current.state);
        current.seq += 1;
        let state = current.state.clone();
        self.watch.send_replace(state.clone());
        Revision {
            seq: current.seq,
            state,
        }
    }

    pub(crate) fn publish(&self, revision: &Revision) {
        let subscribers = lock_or_recover(&self.listeners, "state listeners").clone();
        for subscriber in subscribers {
            subscriber.deliver(revision.seq, &revision.state);
        }
    }

    /// Register a listener; it is called right away with the current state.
    pub fn subscribe(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            listener,
            mailbox: Mutex::new(Mailbox::default()),
        });
        lock_or_recover(&self.listeners, "state listeners").push(subscriber.clone());
        // Taken after registering: any later change is either included here
        // or delivered as a newer revision.
        let revision = self.revision();
        subscriber.deliver(revision.seq, &revision.state);
        Subscription {
            id,
            store: Arc::downgrade(self),
        }
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<GenerationState> {
        self.watch.subscribe()
    }

    fn remove(&self, id: u64) {
        lock_or_recover(&self.listeners, "state listeners").retain(|s| s.id != id);
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock_or_recover(&self.listeners, "state listeners").len()
    }
}

fn notify(listener: &Listener, snapshot: &GenerationState) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(snapshot)));
    if result.is_err() {
        warn!("State listener panicked; continuing broadcast");
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the listener registered.
#[must_use = "call unsubscribe() to stop receiving state updates"]
pub struct Subscription {
    id: u64,
    store: Weak<StateStore>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(store) = self.store.upgrade() {
            store.remove(self.id);
        }
    }
}
