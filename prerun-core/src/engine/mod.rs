//! Engine module - unit initialization core
//!
//! Building blocks the runner composes: a per-unit lazily-filled holder and
//! the identity-keyed cache of those holders.

pub mod lazy_init;
pub mod unit_cache;

pub use lazy_init::UnitHolder;
pub use unit_cache::{CacheStats, UnitCache, UnitKey};
