use crate::server::{Request, Response};

/// Outcome of a middleware phase.
///
/// `Abort` stops the chain: the middleware has already shaped the response
/// it wants sent, and nothing after it in the current phase runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareResult {
    Abort,
    Proceed,
}

/// Middleware intercepts requests before the handler (`pre_handle`) and
/// responses after it (`post_handle`).
///
/// Both phases default to `Proceed`, so an implementation overrides only
/// the phases it cares about; the chain treats an un-overridden phase as a
/// skip. Middleware runs on the connection's coroutine and may block it
/// cooperatively (timers, outgoing calls), which normalizes synchronous and
/// suspending middleware to a single code path.
///
/// # Example
///
/// ```rust,ignore
/// struct RequireAuth;
///
/// impl Middleware for RequireAuth {
///     fn pre_handle(&self, req: &mut Request, resp: &mut Response) -> MiddlewareResult {
///         if req.headers().contains_key("authorization") {
///             MiddlewareResult::Proceed
///         } else {
///             resp.set_status(http::StatusCode::UNAUTHORIZED);
///             MiddlewareResult::Abort
///         }
///     }
/// }
/// ```
pub trait Middleware: Send + Sync {
    fn pre_handle(&self, _req: &mut Request, _resp: &mut Response) -> MiddlewareResult {
        MiddlewareResult::Proceed
    }

    fn post_handle(&self, _req: &mut Request, _resp: &mut Response) -> MiddlewareResult {
        MiddlewareResult::Proceed
    }
}

/// An ordered, type-erased set of middleware.
///
/// Registration is move-only; once a middleware is pushed the chain owns it
/// for good. Pre-handle runs in registration order, post-handle in reverse,
/// and the first `Abort` in either phase short-circuits the rest.
#[derive(Default)]
pub struct MiddlewareChain {
    entries: Vec<Box<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(entries: Vec<Box<dyn Middleware>>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, middleware: impl Middleware + 'static) {
        self.entries.push(Box::new(middleware));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pre_handle(&self, req: &mut Request, resp: &mut Response) -> MiddlewareResult {
        for mw in &self.entries {
            if mw.pre_handle(req, resp) == MiddlewareResult::Abort {
                return MiddlewareResult::Abort;
            }
        }
        MiddlewareResult::Proceed
    }

    pub fn post_handle(&self, req: &mut Request, resp: &mut Response) -> MiddlewareResult {
        for mw in self.entries.iter().rev() {
            if mw.post_handle(req, resp) == MiddlewareResult::Abort {
                return MiddlewareResult::Abort;
            }
        }
        MiddlewareResult::Proceed
    }
}
