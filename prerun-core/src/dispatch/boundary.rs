//! Usage-preserving dispatch
//!
//! [`TrackingDispatcher`] decorates a host's forward/include so the nested
//! resource starts with a fresh usage count and the caller gets its own
//! count back afterwards.  [`ExternalContext`] hands such dispatchers out in
//! place of the host's, and derefs to the host for everything else.

use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

use super::counter::{CounterHolder, UsageScope};
use super::{DispatchKind, HostContext, PageOutput, RequestDispatcher};
use crate::error::DispatchError;

/// Dispatcher that brackets each delegation with a usage-counter scope.
pub struct TrackingDispatcher<Req, Resp> {
    delegate: Box<dyn RequestDispatcher<Req, Resp>>,
    holder: Arc<dyn CounterHolder>,
    page_out: Arc<dyn PageOutput>,
}

impl<Req, Resp> TrackingDispatcher<Req, Resp> {
    pub fn new(
        delegate: Box<dyn RequestDispatcher<Req, Resp>>,
        holder: Arc<dyn CounterHolder>,
        page_out: Arc<dyn PageOutput>,
    ) -> Self {
        Self {
            delegate,
            holder,
            page_out,
        }
    }

    fn dispatch<F>(&self, kind: DispatchKind, call: F) -> Result<(), DispatchError>
    where
        F: FnOnce(&dyn RequestDispatcher<Req, Resp>) -> Result<(), DispatchError>,
    {
        let Some(counter) = self.holder.usage_counter() else {
            return call(self.delegate.as_ref());
        };

        // The target must start from a clean output boundary.
        self.page_out.flush()?;
        let scope = UsageScope::isolate(counter);
        debug!(?kind, saved = scope.saved(), "Dispatching with isolated usage count");
        call(self.delegate.as_ref())
    }
}

impl<Req, Resp> RequestDispatcher<Req, Resp> for TrackingDispatcher<Req, Resp> {
    fn forward(&self, request: &mut Req, response: &mut Resp) -> Result<(), DispatchError> {
        self.dispatch(DispatchKind::Forward, |d| d.forward(request, response))
    }

    fn include(&self, request: &mut Req, response: &mut Resp) -> Result<(), DispatchError> {
        self.dispatch(DispatchKind::Include, |d| d.include(request, response))
    }
}

/// Proxy over a foreign host context.
///
/// Dispatcher lookups come back wrapped in a [`TrackingDispatcher`]; every
/// other host method is reached through `Deref`.
pub struct ExternalContext<C> {
    inner: C,
    holder: Arc<dyn CounterHolder>,
    page_out: Arc<dyn PageOutput>,
}

impl<C: HostContext> ExternalContext<C> {
    pub fn new(inner: C, holder: Arc<dyn CounterHolder>, page_out: Arc<dyn PageOutput>) -> Self {
        Self {
            inner,
            holder,
            page_out,
        }
    }

    fn track(
        &self,
        delegate: Box<dyn RequestDispatcher<C::Request, C::Response>>,
    ) -> Box<dyn RequestDispatcher<C::Request, C::Response>> {
        Box::new(TrackingDispatcher::new(
            delegate,
            Arc::clone(&self.holder),
            Arc::clone(&self.page_out),
        ))
    }
}

impl<C: HostContext> HostContext for ExternalContext<C> {
    type Request = C::Request;
    type Response = C::Response;

    fn request_dispatcher(
        &self,
        path: &str,
    ) -> Option<Box<dyn RequestDispatcher<Self::Request, Self::Response>>> {
        self.inner.request_dispatcher(path).map(|d| self.track(d))
    }

    fn named_dispatcher(
        &self,
        name: &str,
    ) -> Option<Box<dyn RequestDispatcher<Self::Request, Self::Response>>> {
        self.inner.named_dispatcher(name).map(|d| self.track(d))
    }
}

impl<C> Deref for ExternalContext<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::counter::{UntrackedHolder, UsageCounter, UsageTracker};
    use crate::dispatch::BufferedOutput;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Mutex;

    /// Records the usage count observed inside the delegated call.
    struct Probe {
        tracker: Arc<UsageTracker>,
        seen: Arc<Mutex<Vec<u32>>>,
        fail: bool,
    }

    impl RequestDispatcher<(), ()> for Probe {
        fn forward(&self, _: &mut (), _: &mut ()) -> Result<(), DispatchError> {
            self.seen.lock().unwrap().push(self.tracker.current_value());
            self.tracker.set_value(11);
            if self.fail {
                return Err(DispatchError::NotFound("/missing".into()));
            }
            Ok(())
        }

        fn include(&self, request: &mut (), response: &mut ()) -> Result<(), DispatchError> {
            self.forward(request, response)
        }
    }

    fn tracked(fail: bool) -> (TrackingDispatcher<(), ()>, Arc<UsageTracker>, Arc<Mutex<Vec<u32>>>) {
        let tracker = Arc::new(UsageTracker::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let probe = Probe {
            tracker: Arc::clone(&tracker),
            seen: Arc::clone(&seen),
            fail,
        };
        let dispatcher = TrackingDispatcher::new(
            Box::new(probe),
            tracker.clone(),
            Arc::new(BufferedOutput::new()),
        );
        (dispatcher, tracker, seen)
    }

    #[test]
    fn test_forward_restores_on_success() {
        let (dispatcher, tracker, seen) = tracked(false);
        tracker.set_value(3);
        dispatcher.forward(&mut (), &mut ()).unwrap();
        assert_eq!(tracker.current_value(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[test]
    fn test_include_restores_on_error() {
        let (dispatcher, tracker, seen) = tracked(true);
        tracker.set_value(7);
        let err = dispatcher.include(&mut (), &mut ()).unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
        assert_eq!(tracker.current_value(), 7);
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[test]
    fn test_untracked_holder_passes_through() {
        let tracker = Arc::new(UsageTracker::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let probe = Probe {
            tracker: Arc::clone(&tracker),
            seen: Arc::clone(&seen),
            fail: false,
        };
        let out = Arc::new(BufferedOutput::new());
        out.write("kept");
        let dispatcher =
            TrackingDispatcher::new(Box::new(probe), Arc::new(UntrackedHolder), out.clone());

        tracker.set_value(2);
        dispatcher.forward(&mut (), &mut ()).unwrap();

        // No reset before, no restore after, no flush.
        assert_eq!(*seen.lock().unwrap(), vec![2]);
        assert_eq!(tracker.current_value(), 11);
        assert_eq!(out.pending(), "kept");
    }

    #[test]
    fn test_flushes_before_delegating() {
        struct AssertFlushed(Arc<BufferedOutput>);
        impl RequestDispatcher<(), ()> for AssertFlushed {
            fn forward(&self, _: &mut (), _: &mut ()) -> Result<(), DispatchError> {
                assert_eq!(self.0.pending(), "");
                assert_eq!(self.0.committed(), "header");
                Ok(())
            }
            fn include(&self, r: &mut (), s: &mut ()) -> Result<(), DispatchError> {
                self.forward(r, s)
            }
        }

        let out = Arc::new(BufferedOutput::new());
        out.write("header");
        let dispatcher = TrackingDispatcher::new(
            Box::new(AssertFlushed(out.clone())),
            Arc::new(UsageTracker::new()),
            out.clone(),
        );
        dispatcher.include(&mut (), &mut ()).unwrap();
    }

    #[test]
    fn test_forward_restores_on_panic() {
        struct Exploding(Arc<UsageTracker>);
        impl RequestDispatcher<(), ()> for Exploding {
            fn forward(&self, _: &mut (), _: &mut ()) -> Result<(), DispatchError> {
                self.0.set_value(40);
                panic!("target resource crashed");
            }
            fn include(&self, r: &mut (), s: &mut ()) -> Result<(), DispatchError> {
                self.forward(r, s)
            }
        }

        let tracker = Arc::new(UsageTracker::new());
        let dispatcher = TrackingDispatcher::new(
            Box::new(Exploding(tracker.clone())),
            tracker.clone(),
            Arc::new(BufferedOutput::new()),
        );
        tracker.set_value(3);

        let result = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.forward(&mut (), &mut ())));
        assert!(result.is_err());
        assert_eq!(tracker.current_value(), 3);
    }

    struct Host;

    impl HostContext for Host {
        type Request = ();
        type Response = ();

        fn request_dispatcher(&self, path: &str) -> Option<Box<dyn RequestDispatcher<(), ()>>> {
            (path == "/known").then(|| {
                Box::new(Probe {
                    tracker: Arc::new(UsageTracker::new()),
                    seen: Arc::new(Mutex::new(Vec::new())),
                    fail: false,
                }) as Box<dyn RequestDispatcher<(), ()>>
            })
        }

        fn named_dispatcher(&self, _name: &str) -> Option<Box<dyn RequestDispatcher<(), ()>>> {
            None
        }
    }

    impl Host {
        fn server_info(&self) -> &'static str {
            "test-host/1.0"
        }
    }

    #[test]
    fn test_external_context_wraps_lookups() {
        let ctx = ExternalContext::new(
            Host,
            Arc::new(UsageTracker::new()),
            Arc::new(BufferedOutput::new()),
        );
        assert!(ctx.request_dispatcher("/known").is_some());
        assert!(ctx.request_dispatcher("/unknown").is_none());
        assert!(ctx.named_dispatcher("anything").is_none());
        // Unrelated host methods go straight through.
        assert_eq!(ctx.server_info(), "test-host/1.0");
    }
}
