//! HTTP/1.1 server: request/response types, the per-connection state
//! machine and the listening facade.

mod conn;
mod request;
mod response;
#[allow(clippy::module_inception)]
mod server;

pub use self::request::{QueryParams, Request};
pub use self::response::Response;
pub use self::server::{Server, ServerHandle, ServerOptions};

pub(crate) use self::server::spawn_connection;
