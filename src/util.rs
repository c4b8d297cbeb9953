use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Lock a mutex, recovering the inner data if a previous holder panicked.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("{what} lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
