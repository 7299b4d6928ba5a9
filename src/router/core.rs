use std::collections::HashMap;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use http::{Method, StatusCode};
use tracing::{debug, error};

use crate::error::{error_body, HandlerError, HandlerResult, RouteError};
use crate::middleware::{Middleware, MiddlewareChain, MiddlewareResult};
use crate::router::params::PathParams;
use crate::router::tree::Node;
use crate::server::{Request, Response};

/// A route handler. Receives the request read-only and mutates the
/// response; failures are reported through the returned result, and a
/// panicking handler is recovered into a 500 response. Handlers run on the
/// connection's coroutine and may block it cooperatively.
pub type Handler = Box<dyn Fn(&Request, &mut Response) -> HandlerResult + Send + Sync>;

/// A registered route: its per-route middleware and the user handler.
pub(crate) struct RouteEntry {
    middlewares: MiddlewareChain,
    handler: Handler,
}

impl RouteEntry {
    /// Run per-route middleware around the user handler.
    ///
    /// A failing handler does not abort either middleware chain; the
    /// failure boundary rewrites the response and post-handle still runs.
    /// Aborting from a middleware short-circuits as usual.
    pub(crate) fn run(&self, req: &mut Request, resp: &mut Response) -> MiddlewareResult {
        if self.middlewares.pre_handle(req, resp) == MiddlewareResult::Abort {
            return MiddlewareResult::Abort;
        }

        match catch_unwind(AssertUnwindSafe(|| (self.handler)(&*req, resp))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => render_handler_error(&err, resp),
            Err(payload) => render_handler_panic(payload, resp),
        }

        self.middlewares.post_handle(req, resp)
    }
}

/// Map a handler panic to a 500 response.
///
/// A coroutine cancellation (serve-timeout watchdog, shutdown) also
/// arrives as an unwind, but with an opaque payload; only ordinary panics
/// carry a message. Anything unrecognized is re-raised so cancellation
/// still tears the connection down.
fn render_handler_panic(payload: Box<dyn std::any::Any + Send>, resp: &mut Response) {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        resume_unwind(payload)
    };

    error!(panic_message = %message, "handler panicked");
    resp.json(
        StatusCode::INTERNAL_SERVER_ERROR,
        error_body(&message, None),
    );
}

/// The only place a handler failure becomes a structured response body.
fn render_handler_error(err: &HandlerError, resp: &mut Response) {
    match err {
        HandlerError::Http(err) => {
            debug!(status = err.status().as_u16(), message = %err.message(), "handler signalled http error");
            resp.json(err.status(), error_body(err.message(), err.code()));
        }
        HandlerError::Other(err) => {
            debug!(error = %err, "handler failed");
            resp.json(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body(&err.to_string(), None),
            );
        }
    }
}

/// Routes requests to handlers through one tree per HTTP method, wrapping
/// every dispatch with the router-wide middleware chain.
///
/// Built before the server starts serving and immutable afterwards, so it
/// is shared across connection coroutines without synchronization.
#[derive(Default)]
pub struct Router {
    routes: HashMap<Method, Node<RouteEntry>>,
    middlewares: MiddlewareChain,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `method` + `path`.
    pub fn add_route<H>(&mut self, method: Method, path: &str, handler: H) -> Result<(), RouteError>
    where
        H: Fn(&Request, &mut Response) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_route_with(method, path, Vec::new(), handler)
    }

    /// Register a handler with per-route middleware. The middleware runs
    /// pre-handle in the given order and post-handle in reverse, inside the
    /// router-wide chain.
    pub fn add_route_with<H>(
        &mut self,
        method: Method,
        path: &str,
        middlewares: Vec<Box<dyn Middleware>>,
        handler: H,
    ) -> Result<(), RouteError>
    where
        H: Fn(&Request, &mut Response) -> HandlerResult + Send + Sync + 'static,
    {
        let entry = RouteEntry {
            middlewares: MiddlewareChain::with(middlewares),
            handler: Box::new(handler),
        };
        self.routes
            .entry(method)
            .or_insert_with(Node::new)
            .insert(path, entry)
    }

    /// Router-wide middleware, applied to all routes.
    pub fn use_middleware(&mut self, middleware: impl Middleware + 'static) {
        self.middlewares.push(middleware);
    }

    pub(crate) fn locate_route(
        &self,
        method: &Method,
        path: &str,
        params: &mut PathParams,
    ) -> Option<&RouteEntry> {
        self.routes.get(method)?.locate(path, params)
    }

    /// Drive one request through lookup, the middleware pipeline and the
    /// handler, producing the response.
    pub fn dispatch(&self, req: &mut Request) -> Response {
        let mut resp = Response::for_request(req);

        // Locating the route completes path params for the request, so they
        // are available to router-wide middleware as well.
        let method = req.method().clone();
        let mut params = PathParams::new();
        let entry = self.locate_route(&method, req.path(), &mut params);
        let found = entry.is_some();
        req.set_params(params);

        debug!(method = %req.method(), path = %req.path(), found, "dispatching request");

        if self.middlewares.pre_handle(req, &mut resp) == MiddlewareResult::Abort {
            return resp;
        }

        // An unknown resource is not an unexpected error and does not abort
        // router-level middleware.
        let Some(entry) = entry else {
            resp.json(
                StatusCode::NOT_FOUND,
                error_body("Unknown resource", None),
            );
            let _ = self.middlewares.post_handle(req, &mut resp);
            return resp;
        };

        // Aborted by a per-route middleware: the early response is
        // intentional, router-wide post-handle is skipped.
        if entry.run(req, &mut resp) == MiddlewareResult::Abort {
            return resp;
        }

        let _ = self.middlewares.post_handle(req, &mut resp);
        resp
    }
}
