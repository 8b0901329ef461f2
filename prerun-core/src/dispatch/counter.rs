//! Usage counter protocol
//!
//! The hosting engine tracks how many times it has been entered on the
//! current request.  A [`CounterHolder`] may or may not expose that count;
//! callers probe for it with [`CounterHolder::usage_counter`] and fall back
//! to doing nothing when it is absent.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Per-thread usage counts, keyed by tracker id.
    static USAGE: RefCell<HashMap<u64, u32>> = RefCell::new(HashMap::new());
}

/// Narrow read/reset/restore interface over the reentrancy counter.
pub trait UsageCounter: Send + Sync {
    fn current_value(&self) -> u32;

    /// Back to the baseline (0).
    fn reset(&self);

    fn set_value(&self, value: u32);
}

/// The engine-side object that may own a usage counter.
pub trait CounterHolder: Send + Sync {
    /// Capability probe: `Some` only if this holder supports usage tracking.
    fn usage_counter(&self) -> Option<&dyn UsageCounter> {
        None
    }
}

/// Request-scoped usage counter.
///
/// A request is served on one thread, so each thread sees its own count for
/// a given tracker.  Two trackers never share counts.  Only non-zero counts
/// occupy a slot; dropping the tracker frees the dropping thread's slot, and
/// a slot left non-zero on another thread lives until that thread exits.
#[derive(Debug)]
pub struct UsageTracker {
    id: u64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self {
            id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UsageTracker {
    fn drop(&mut self) {
        // Thread-local storage may already be gone during thread exit.
        let _ = USAGE.try_with(|usage| {
            if let Ok(mut usage) = usage.try_borrow_mut() {
                usage.remove(&self.id);
            }
        });
    }
}

impl UsageCounter for UsageTracker {
    fn current_value(&self) -> u32 {
        USAGE.with(|usage| usage.borrow().get(&self.id).copied().unwrap_or(0))
    }

    fn reset(&self) {
        self.set_value(0);
    }

    fn set_value(&self, value: u32) {
        USAGE.with(|usage| {
            let mut usage = usage.borrow_mut();
            if value == 0 {
                usage.remove(&self.id);
            } else {
                usage.insert(self.id, value);
            }
        });
    }
}

impl CounterHolder for UsageTracker {
    fn usage_counter(&self) -> Option<&dyn UsageCounter> {
        Some(self)
    }
}

/// Holder for engines that do not track usage.
#[derive(Debug, Default, Clone, Copy)]
pub struct UntrackedHolder;

impl CounterHolder for UntrackedHolder {}

/// Scoped change of the usage counter, undone on drop.
///
/// The captured value is written back on every exit path, including early
/// returns and unwinding.  Scopes nest: each one restores what it captured.
pub struct UsageScope<'a> {
    counter: &'a dyn UsageCounter,
    saved: u32,
}

impl<'a> UsageScope<'a> {
    /// Capture the counter and reset it, so nested execution starts at 0.
    pub fn isolate(counter: &'a dyn UsageCounter) -> Self {
        let saved = counter.current_value();
        counter.reset();
        trace!(saved, "Usage counter isolated");
        Self { counter, saved }
    }

    /// Capture the counter and count one more entry into the engine.
    pub fn enter(counter: &'a dyn UsageCounter) -> Self {
        let saved = counter.current_value();
        counter.set_value(saved.saturating_add(1));
        Self { counter, saved }
    }

    /// The value that will be restored.
    pub fn saved(&self) -> u32 {
        self.saved
    }

    /// The counter's value right now.
    pub fn depth(&self) -> u32 {
        self.counter.current_value()
    }
}

impl Drop for UsageScope<'_> {
    fn drop(&mut self) {
        self.counter.set_value(self.saved);
        trace!(restored = self.saved, "Usage counter restored");
    }
}
