//! User-intent hook: the host reports "the user started a generation action".
//!
//! The host editor fires an [`IntentEvent`] whenever a generate action is
//! triggered, tagging whether a person did it or a script did. Handlers
//! registered here (the exchange's budget gate among them) decide what to do
//! with it.

use crate::util::lock_or_recover;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Who triggered the generation action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentOrigin {
    /// A person pressed a button or key.
    Human,
    /// Script-driven automation.
    Script,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentEvent {
    pub origin: IntentOrigin,
    /// Free-form label of what fired the event (button id, script name).
    pub source: Option<String>,
}

impl IntentEvent {
    #[must_use]
    pub fn human() -> Self {
        Self {
            origin: IntentOrigin::Human,
            source: None,
        }
    }

    #[must_use]
    pub fn script() -> Self {
        Self {
            origin: IntentOrigin::Script,
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn is_human(&self) -> bool {
        self.origin == IntentOrigin::Human
    }
}

/// Trait for reacting to user-intent events.
pub trait IntentHandler: Send + Sync {
    fn on_intent(&self, event: &IntentEvent);

    /// Optional name for debugging/logging.
    fn name(&self) -> &'static str {
        "unnamed_intent_handler"
    }
}

/// Registration point shared between the host and the exchange.
///
/// Cloning yields another handle to the same set of handlers.
#[derive(Clone, Default)]
pub struct IntentHook {
    handlers: Arc<Mutex<Vec<Arc<dyn IntentHandler>>>>,
}

impl IntentHook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Handlers run in registration order.
    pub fn register(&self, handler: Arc<dyn IntentHandler>) {
        lock_or_recover(&self.handlers, "intent hook").push(handler);
    }

    /// Deliver an event to every registered handler.
    pub fn fire(&self, event: &IntentEvent) {
        // Snapshot so a handler may register another without deadlocking.
        let handlers = lock_or_recover(&self.handlers, "intent hook").clone();
        debug!(
            "Intent event {:?} from {} delivered to {} handler(s)",
            event.origin,
            event.source.as_deref().unwrap_or("unknown"),
            handlers.len()
        );
        for handler in handlers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler.on_intent(event);
            }));
            if result.is_err() {
                warn!("Intent handler {} panicked", handler.name());
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock_or_recover(&self.handlers, "intent hook").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        label: &'static str,
        seen: Arc<Mutex<Vec<(&'static str, IntentOrigin)>>>,
    }

    impl IntentHandler for Recorder {
        fn on_intent(&self, event: &IntentEvent) {
            self.seen.lock().unwrap().push((self.label, event.origin));
        }
    }

    struct Exploding;

    impl IntentHandler for Exploding {
        fn on_intent(&self, _event: &IntentEvent) {
            panic!("boom");
        }

        fn name(&self) -> &'static str {
            "exploding"
        }
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook = IntentHook::new();
        hook.register(Arc::new(Recorder {
            label: "first",
            seen: seen.clone(),
        }));
        hook.register(Arc::new(Recorder {
            label: "second",
            seen: seen.clone(),
        }));

        hook.fire(&IntentEvent::human().with_source("generate-button"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", IntentOrigin::Human), ("second", IntentOrigin::Human)]
        );
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook = IntentHook::new();
        hook.register(Arc::new(Exploding));
        hook.register(Arc::new(Recorder {
            label: "after",
            seen: seen.clone(),
        }));

        hook.fire(&IntentEvent::script());

        assert_eq!(*seen.lock().unwrap(), vec![("after", IntentOrigin::Script)]);
        assert_eq!(hook.len(), 2);
    }

    #[test]
    fn test_clones_share_handlers() {
        let hook = IntentHook::new();
        let other = hook.clone();
        assert!(other.is_empty());
        hook.register(Arc::new(Exploding));
        assert_eq!(other.len(), 1);
    }
}
