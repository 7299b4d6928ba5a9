use tracing::info;

use crate::middleware::{Middleware, MiddlewareResult};
use crate::server::{Request, Response};

/// Logs every request on the way in and its status on the way out.
///
/// Registered router-wide, the post-handle side observes the final
/// response for every route, including handler failures turned into error
/// bodies.
pub struct AccessLog;

impl Middleware for AccessLog {
    fn pre_handle(&self, req: &mut Request, _resp: &mut Response) -> MiddlewareResult {
        info!(method = %req.method(), target = %req.target(), "entering request");
        MiddlewareResult::Proceed
    }

    fn post_handle(&self, req: &mut Request, resp: &mut Response) -> MiddlewareResult {
        info!(target = %req.target(), status = resp.status().as_u16(), "leaving request");
        MiddlewareResult::Proceed
    }
}
