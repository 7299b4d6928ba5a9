//! Kestrel is an embeddable HTTP/1.1 server framework built on stackful
//! coroutines.
//!
//! Routes are registered as `method + pattern -> handler` on a compressed
//! radix tree supporting literal segments, `:name` parameters and `*name`
//! catch-alls, with conflicts rejected at registration time. Every
//! connection runs a persistent request/response state machine on its own
//! coroutine: requests are parsed, dispatched through router-wide and
//! per-route middleware around the user handler, and responses are written
//! back while honoring keep-alive, `Expect: 100-continue`, graceful
//! shutdown and three independently configurable timeouts.
//!
//! # Example
//!
//! ```rust,no_run
//! use http::StatusCode;
//! use kestrel::Server;
//!
//! let mut server = Server::new();
//! server
//!     .get("/ping", |_req, resp| {
//!         resp.text(StatusCode::OK, "Pong!");
//!         Ok(())
//!     })
//!     .unwrap();
//! server
//!     .get("/users/:id/profile", |req, resp| {
//!         let id = req.param("id").unwrap_or("unknown");
//!         resp.text(StatusCode::OK, format!("profile of {id}"));
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! let handle = server.listen_and_serve("0.0.0.0:7890").unwrap();
//! handle.join().unwrap();
//! ```

pub mod cookie;
pub mod error;
pub mod io_pool;
pub mod middleware;
pub mod router;
pub mod server;

pub use error::{HandlerError, HandlerResult, HttpError, RouteError};
pub use io_pool::IoThreadPool;
pub use middleware::{Middleware, MiddlewareChain, MiddlewareResult};
pub use router::{PathParams, Router};
pub use server::{QueryParams, Request, Response, Server, ServerHandle, ServerOptions};
