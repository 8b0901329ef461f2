//! Delegation across host-context boundaries
//!
//! A unit may hand control to another resource in the same request, either
//! replacing the response (`forward`) or resuming its own output afterwards
//! (`include`).  The hosting engine counts how deeply it has been entered;
//! this module keeps that count honest across such delegations.
//!
//! # Layout:
//! - [`counter`]: the usage counter protocol and its RAII bracket
//! - [`boundary`]: the dispatcher decorator and the host-context proxy

pub mod boundary;
pub mod counter;

pub use boundary::{ExternalContext, TrackingDispatcher};
pub use counter::{CounterHolder, UntrackedHolder, UsageCounter, UsageScope, UsageTracker};

use std::io;
use std::sync::{Mutex, PoisonError};

use crate::error::DispatchError;

/// Which delegation is being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Forward,
    Include,
}

/// Forward/include primitive exposed by a hosting context.
///
/// Request and response are opaque to this crate; the host picks them.
pub trait RequestDispatcher<Req, Resp> {
    /// Transfer control to the target resource; the caller's output is
    /// normally discarded.
    fn forward(&self, request: &mut Req, response: &mut Resp) -> Result<(), DispatchError>;

    /// Run the target resource and resume the caller's output afterwards.
    fn include(&self, request: &mut Req, response: &mut Resp) -> Result<(), DispatchError>;
}

/// Dispatcher lookup surface of a hosting context.
///
/// Only the two lookups that hand out dispatchers are part of this trait.
/// Everything else a host offers is reached on the host type itself.
pub trait HostContext {
    type Request: 'static;
    type Response: 'static;

    /// Dispatcher for the resource at `path`, if the host maps one.
    fn request_dispatcher(
        &self,
        path: &str,
    ) -> Option<Box<dyn RequestDispatcher<Self::Request, Self::Response>>>;

    /// Dispatcher for a resource registered under `name`.
    fn named_dispatcher(
        &self,
        name: &str,
    ) -> Option<Box<dyn RequestDispatcher<Self::Request, Self::Response>>>;
}

/// Buffered output of the page currently executing.
pub trait PageOutput: Send + Sync {
    /// Push everything buffered so far to the underlying response.
    fn flush(&self) -> io::Result<()>;
}

/// In-memory [`PageOutput`]: writes accumulate in a buffer until flushed.
#[derive(Debug, Default)]
pub struct BufferedOutput {
    pending: Mutex<String>,
    committed: Mutex<String>,
}

impl BufferedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the pending buffer.
    pub fn write(&self, text: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }

    /// Text written but not yet flushed.
    pub fn pending(&self) -> String {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Text already flushed.
    pub fn committed(&self) -> String {
        self.committed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl PageOutput for BufferedOutput {
    /// Both buffers stay locked while moving text, so concurrent flushes
    /// commit in write order.
    fn flush(&self) -> io::Result<()> {
        let mut committed = self.committed.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        committed.push_str(&pending);
        pending.clear();
        Ok(())
    }
}
