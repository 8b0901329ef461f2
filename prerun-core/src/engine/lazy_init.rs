//! Per-unit lazy initialization
//!
//! A [`UnitHolder`] is the cache entry for one executable unit.  It starts
//! out empty and is filled at most once with the unit's ready state.  The
//! hot path is a single atomic load; only callers that find the holder empty
//! take the holder's own lock, so units never serialize each other.
//!
//! # Double-checked initialization:
//! - `OnceLock` publishes the ready state with happens-before semantics
//! - a per-holder `Mutex` elects the single thread that runs the initializer
//! - a failed initializer leaves the holder empty so the next caller retries

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::debug;

/// Lazily-filled slot for a unit's ready state.
///
/// Unlike a bare `OnceLock`, the initializer may fail.  A failure is handed
/// back to the caller that ran it and the slot stays empty, which makes the
/// next call retry.
///
/// ```rust,no_run
/// # use prerun_core::engine::lazy_init::UnitHolder;
/// let holder = UnitHolder::<String>::new();
/// let ready = holder.get_or_try_init(|| Ok::<_, std::io::Error>("ready".to_string()));
/// ```
pub struct UnitHolder<T> {
    ready: OnceLock<Arc<T>>,
    init_lock: Mutex<()>,
}

impl<T> UnitHolder<T> {
    /// Create an empty holder.
    pub fn new() -> Self {
        Self {
            ready: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    /// The ready state, if initialization has completed.
    pub fn get(&self) -> Option<Arc<T>> {
        self.ready.get().cloned()
    }

    /// Return the ready state, running `init` if the holder is still empty.
    ///
    /// Concurrent callers block on this holder's lock while one of them runs
    /// `init`; afterwards they observe the published value.  When `init`
    /// fails, waiters re-check, find the holder still empty and try again
    /// themselves.
    pub fn get_or_try_init<F, E>(&self, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(ready) = self.ready.get() {
            return Ok(Arc::clone(ready));
        }

        // A panicking initializer poisons the lock but never publishes, so
        // the slot is still consistent.
        let _guard = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ready) = self.ready.get() {
            debug!("UnitHolder initialized by a concurrent caller");
            return Ok(Arc::clone(ready));
        }

        let value = Arc::new(init()?);
        Ok(Arc::clone(self.ready.get_or_init(|| value)))
    }

    /// Returns `true` once the ready state has been published.
    pub fn is_initialized(&self) -> bool {
        self.ready.get().is_some()
    }
}

impl<T> Default for UnitHolder<T> {
    fn default() -> Self {
        Self::new()
    }
}
