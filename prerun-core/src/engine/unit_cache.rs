//! Identity-keyed cache of initialized executable units
//!
//! Every precompiled unit is initialized the first time it is requested and
//! then reused for the lifetime of the runner.  The cache maps the unit's
//! *instance identity* to a [`UnitHolder`]; two structurally identical unit
//! instances are still two different entries.
//!
//! # Concurrency:
//! - entry creation is an insert-if-absent under the map's write lock, so
//!   concurrent first callers converge on one holder
//! - initialization runs under the holder's lock, never the map's
//! - teardown drains the whole map in one step before destroying anything

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::engine::lazy_init::UnitHolder;
use crate::error::{Result, RunnerError, TeardownFailure};

/// Map key comparing units by the address of their allocation.
pub struct UnitKey<U: ?Sized>(Arc<U>);

impl<U: ?Sized> UnitKey<U> {
    pub fn new(unit: &Arc<U>) -> Self {
        Self(Arc::clone(unit))
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl<U: ?Sized> PartialEq for UnitKey<U> {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl<U: ?Sized> Eq for UnitKey<U> {}

impl<U: ?Sized> Hash for UnitKey<U> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl<U: ?Sized> fmt::Debug for UnitKey<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitKey({:p})", self.addr())
    }
}

/// Runtime statistics for a [`UnitCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found the unit already initialized.
    pub hits: usize,
    /// Lookups that had to run (or wait for) an initializer.
    pub misses: usize,
    /// Entries currently in the map, ready or not.
    pub cached_count: usize,
}

/// Lazily-initialized ready states keyed by unit identity.
///
/// `U` is the unit type (usually `dyn ExecutableUnit`), `R` the ready state
/// built from it.
pub struct UnitCache<U: ?Sized, R> {
    entries: RwLock<HashMap<UnitKey<U>, Arc<UnitHolder<R>>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl<U: ?Sized, R> UnitCache<U, R> {
    /// Create a new, empty cache.
    pub fn new() -> Self {
        debug!("Creating UnitCache");
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Return the ready state for `unit`, running `init` if it has none yet.
    ///
    /// Returns `Ok(None)` when `init` reports a missing capability: the
    /// entry is left unset and the next call tries again.  Every other
    /// failure is returned as-is and likewise leaves the entry retryable.
    pub fn get_or_init<F>(&self, unit: &Arc<U>, init: F) -> Result<Option<Arc<R>>>
    where
        F: FnOnce() -> Result<R>,
    {
        let holder = self.holder_for(unit);
        if let Some(ready) = holder.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(ready));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match holder.get_or_try_init(init) {
            Ok(ready) => Ok(Some(ready)),
            Err(err) if err.is_missing_capability() => {
                warn!(error = %err, "Precompiled unit support unavailable, leaving entry unset");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Find or atomically insert the holder for `unit`.
    fn holder_for(&self, unit: &Arc<U>) -> Arc<UnitHolder<R>> {
        let key = UnitKey::new(unit);
        if let Some(holder) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Arc::clone(holder);
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(key).or_insert_with_key(|key| {
            debug!(unit = ?key, "Unit cache miss, inserting empty holder");
            Arc::new(UnitHolder::new())
        }))
    }

    /// Returns `true` if `unit` has a published ready state.
    pub fn is_ready(&self, unit: &Arc<U>) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&UnitKey::new(unit))
            .map_or(false, |h| h.is_initialized())
    }

    /// Snapshot of every ready state currently in the cache.
    pub fn ready_units(&self) -> Vec<Arc<R>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|h| h.get())
            .collect()
    }

    /// Remove every entry, then call `destroy` once per ready state.
    ///
    /// The map is swapped out under a single write lock, so no caller can
    /// pick up an entry that is about to be destroyed.  Entries that never
    /// became ready are dropped without a destroy call.  A failing or
    /// panicking destroy does not stop the remaining ones; all failures are
    /// reported together.
    ///
    /// Returns the number of ready states handed to `destroy`.
    pub fn remove_and_destroy_all<F>(&self, mut destroy: F) -> Result<usize>
    where
        F: FnMut(&R) -> std::result::Result<(), TeardownFailure>,
    {
        let drained = std::mem::take(
            &mut *self.entries.write().unwrap_or_else(PoisonError::into_inner),
        );
        if drained.is_empty() {
            return Ok(0);
        }
        info!(entries = drained.len(), "Destroying cached units");

        let mut destroyed = 0;
        let mut failures = Vec::new();
        for (key, holder) in drained {
            let Some(ready) = holder.get() else {
                debug!(unit = ?key, "Skipping unit that never became ready");
                continue;
            };
            destroyed += 1;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| destroy(&ready)))
                .unwrap_or_else(|payload| {
                    Err(TeardownFailure::new(
                        format!("{key:?}"),
                        anyhow::anyhow!("destroy panicked: {}", panic_message(payload.as_ref())),
                    ))
                });
            if let Err(failure) = outcome {
                warn!(unit = %failure.unit, error = %failure.message, "Unit destroy failed");
                failures.push(failure);
            }
        }

        if failures.is_empty() {
            Ok(destroyed)
        } else {
            Err(RunnerError::Teardown { failures })
        }
    }

    /// Snapshot the cache's runtime statistics.
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cached_count: self.len(),
        }
    }

    /// Number of entries, including ones that are not ready.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl<U: ?Sized, R> Default for UnitCache<U, R> {
    fn default() -> Self {
        Self::new()
    }
}
