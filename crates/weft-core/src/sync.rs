use std::sync::{Mutex, MutexGuard};

/// Acquires a mutex, recovering the guard if a callback panicked while
/// holding it. Poisoning must not take the whole runtime down.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
