//! Prerun Core - Runner for Precompiled Page Units
//!
//! Hosts compiled page handlers inside a shared execution engine:
//!
//! - every unit is started exactly once, on first use, however many worker
//!   threads race for it, and torn down exactly once on cleanup
//! - the engine's re-entry counter is saved, reset and restored around every
//!   forward/include into another context, so nested pages are counted
//!   against their own budget rather than their caller's
//!
//! The compiler, dependency injection and the request/response model are
//! supplied by the host through the traits in [`unit`] and [`dispatch`].

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod perf;
pub mod runner;
pub mod unit;

pub use config::RunnerOptions;
pub use dispatch::{
    BufferedOutput, CounterHolder, ExternalContext, HostContext, PageOutput, RequestDispatcher,
    TrackingDispatcher, UntrackedHolder, UsageCounter, UsageScope, UsageTracker,
};
pub use engine::{CacheStats, UnitCache, UnitHolder};
pub use error::{DispatchError, MissingCapability, RunnerError};
pub use runner::{HostServices, PrecompiledRunner};
pub use unit::{Bindings, DependencyProcessor, DeploymentUnit, ExecutableUnit, RenderUnit, UnitConfig, UnitWrapper};

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Honours `RUST_LOG`, defaulting to `info`. Fails if a subscriber is
/// already installed.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    info!("Initializing Prerun v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
