//! Middleware pipeline and the middleware bundled with the framework.

mod access_log;
mod core;
mod cors;

pub use self::access_log::AccessLog;
pub use self::core::{Middleware, MiddlewareChain, MiddlewareResult};
pub use self::cors::{AllowOrigin, Cors, CorsBuilder};
