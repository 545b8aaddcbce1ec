//! Shared in-process state.
//!
//! The config store is the only value shared across tasks: the reconciler writes report
//! tokens into it and the reporter reads them back.

use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Clones the current value out so the lock is never held across an `.await`.
pub fn snapshot<T: Clone>(state: &Shared<T>) -> T {
    state.lock().clone()
}
