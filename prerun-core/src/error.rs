//! Error types shared across the runner.
//!
//! Units and collaborators report failures with `anyhow`; everything that
//! crosses the public API of this crate is folded into [`RunnerError`] so
//! callers can tell a retryable initialization failure apart from a unit
//! that is simply unavailable in this deployment.

use thiserror::Error;

/// Boxed error used as the `source` of wrapped failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Raised by a unit (or its dependency processor) when the runtime lacks an
/// optional capability needed to host precompiled units.
///
/// The unit cache swallows this condition: the entry stays unset and every
/// later request for the same unit retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("missing optional capability '{capability}'")]
pub struct MissingCapability {
    pub capability: String,
}

impl MissingCapability {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
        }
    }
}

/// A single destroy call that failed during cache teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    /// Display name of the unit whose destroy step failed.
    pub unit: String,
    /// Rendered error chain.
    pub message: String,
}

impl TeardownFailure {
    pub fn new(unit: impl Into<String>, err: anyhow::Error) -> Self {
        Self {
            unit: unit.into(),
            message: format!("{err:#}"),
        }
    }
}

/// Failure of a forward/include delegation.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no resource is mapped to '{0}'")]
    NotFound(String),

    #[error("I/O failure while dispatching: {0}")]
    Io(#[from] std::io::Error),

    #[error("dispatched resource failed: {0}")]
    Resource(#[source] BoxError),
}

/// Errors surfaced by the unit cache and the precompiled runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The unit's startup hook failed. The entry stays unset; a later call
    /// retries.
    #[error("failed to initialize unit {unit}: {source}")]
    Initialization {
        unit: String,
        #[source]
        source: BoxError,
    },

    /// Dependency injection or a lifecycle hook failed before the unit
    /// could start.
    #[error("unable to process dependencies for unit type {unit_type}")]
    DependencyProcessing {
        unit_type: String,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    MissingCapability(#[from] MissingCapability),

    /// The unit never became ready because of a missing capability.
    #[error("precompiled unit at {path} is unavailable in this deployment")]
    Unavailable { path: String },

    #[error("unit {unit} failed while servicing a request: {source}")]
    Service {
        unit: String,
        #[source]
        source: BoxError,
    },

    #[error("unit {unit} has already been destroyed")]
    Destroyed { unit: String },

    #[error("nesting depth {depth} exceeds the configured limit of {limit}")]
    NestingLimit { depth: u32, limit: u32 },

    #[error("{} unit(s) failed to shut down", .failures.len())]
    Teardown { failures: Vec<TeardownFailure> },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl RunnerError {
    /// Returns `true` for the one failure class the unit cache swallows.
    pub fn is_missing_capability(&self) -> bool {
        matches!(self, RunnerError::MissingCapability(_))
    }
}

/// Classify a collaborator failure: a [`MissingCapability`] anywhere at the
/// top of the chain keeps its identity, anything else becomes `fatal`.
pub(crate) fn classify<F>(err: anyhow::Error, fatal: F) -> RunnerError
where
    F: FnOnce(BoxError) -> RunnerError,
{
    match err.downcast::<MissingCapability>() {
        Ok(missing) => RunnerError::MissingCapability(missing),
        Err(err) => fatal(err.into()),
    }
}
