use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use http::Method;
use may::coroutine::{self, JoinHandle};
use may::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::error::{HandlerResult, RouteError};
use crate::io_pool::{IoThreadPool, LaneTask};
use crate::middleware::Middleware;
use crate::router::Router;
use crate::server::conn;
use crate::server::{Request, Response};

/// Stack size for connection and watchdog coroutines.
/// `KESTREL_STACK_SIZE` overrides the default, hex (`0x...`) or decimal.
pub(crate) fn coroutine_stack_size() -> usize {
    std::env::var("KESTREL_STACK_SIZE")
        .ok()
        .and_then(|s| {
            if let Some(hex) = s.strip_prefix("0x") {
                usize::from_str_radix(hex, 16).ok()
            } else {
                s.parse().ok()
            }
        })
        .unwrap_or(0x10000)
}

/// Connection timeout configuration. A zero duration disables the timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    /// Maximum duration an established connection may sit idle between
    /// requests (or before the first byte).
    pub idle_timeout: Duration,

    /// Maximum duration allowed to read the entire request, including the
    /// body.
    pub read_timeout: Duration,

    /// Maximum duration allowed to read the request, handle it and send
    /// back the response. Should be larger than `read_timeout`.
    pub serve_timeout: Duration,
}

impl ServerOptions {
    /// The timeout actually armed while reading. `serve_timeout` may be
    /// smaller than `read_timeout`, making the serve timeout effectively a
    /// read timeout.
    pub fn effective_read_timeout(&self) -> Duration {
        let (min, max) = if self.read_timeout <= self.serve_timeout {
            (self.read_timeout, self.serve_timeout)
        } else {
            (self.serve_timeout, self.read_timeout)
        };

        if max.is_zero() {
            Duration::ZERO
        } else if !min.is_zero() {
            min
        } else {
            max
        }
    }
}

/// The server facade: owns the router and options, registers routes, and
/// drives the accept loop once serving starts.
///
/// All registration happens before [`listen_and_serve`](Self::listen_and_serve);
/// the router is then frozen and shared read-only across connections.
#[derive(Default)]
pub struct Server {
    router: Router,
    opts: ServerOptions,
    io_pool: Option<IoThreadPool>,
}

macro_rules! route_methods {
    ($(($name:ident, $with_name:ident, $method:expr)),+ $(,)?) => {
        $(
            /// Register a handler for this method and pattern.
            /// Fails if the pattern conflicts with an existing route.
            pub fn $name<H>(&mut self, path: &str, handler: H) -> Result<(), RouteError>
            where
                H: Fn(&Request, &mut Response) -> HandlerResult + Send + Sync + 'static,
            {
                self.router.add_route($method, path, handler)
            }

            /// Register a handler with per-route middleware.
            /// Fails if the pattern conflicts with an existing route.
            pub fn $with_name<H>(
                &mut self,
                path: &str,
                middlewares: Vec<Box<dyn Middleware>>,
                handler: H,
            ) -> Result<(), RouteError>
            where
                H: Fn(&Request, &mut Response) -> HandlerResult + Send + Sync + 'static,
            {
                self.router.add_route_with($method, path, middlewares, handler)
            }
        )+
    };
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve connections on the given I/O pool instead of spawning them
    /// all from the accept coroutine's scheduler.
    pub fn with_io_pool(pool: IoThreadPool) -> Self {
        Self {
            io_pool: Some(pool),
            ..Self::default()
        }
    }

    pub fn set_options(&mut self, opts: ServerOptions) {
        self.opts = opts;
    }

    pub fn options(&self) -> &ServerOptions {
        &self.opts
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    route_methods! {
        (get, get_with, Method::GET),
        (post, post_with, Method::POST),
        (put, put_with, Method::PUT),
        (patch, patch_with, Method::PATCH),
        (delete, delete_with, Method::DELETE),
        (head, head_with, Method::HEAD),
    }

    /// Bind the listener and start the accept loop.
    ///
    /// Consumes the server: the router and options freeze and become shared
    /// read-only state. Returns a handle for lifecycle management.
    pub fn listen_and_serve<A: ToSocketAddrs>(self, addr: A) -> io::Result<ServerHandle> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid address"))?;

        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let router = Arc::new(self.router);
        let opts = Arc::new(self.opts);
        let stop = Arc::new(AtomicBool::new(false));
        let pool = self.io_pool.map(Arc::new);

        let accept_router = router.clone();
        let accept_opts = opts.clone();
        let accept_stop = stop.clone();
        let accept_pool = pool.clone();

        let handle = unsafe {
            coroutine::Builder::new()
                .stack_size(coroutine_stack_size())
                .spawn(move || {
                    accept_loop(listener, accept_router, accept_opts, accept_stop, accept_pool)
                })?
        };

        info!(addr = %local_addr, "server is listening");

        Ok(ServerHandle {
            addr: local_addr,
            stop,
            handle,
            pool,
        })
    }
}

fn accept_loop(
    listener: TcpListener,
    router: Arc<Router>,
    opts: Arc<ServerOptions>,
    stop: Arc<AtomicBool>,
    pool: Option<Arc<IoThreadPool>>,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                match &pool {
                    Some(pool) => pool.dispatch(LaneTask {
                        stream,
                        peer,
                        router: router.clone(),
                        opts: opts.clone(),
                        stop: stop.clone(),
                    }),
                    None => spawn_connection(
                        stream,
                        peer,
                        router.clone(),
                        opts.clone(),
                        stop.clone(),
                    ),
                }
            }
            Err(err) => {
                error!(error = %err, "failed to accept new connection");
                continue;
            }
        }
    }
}

pub(crate) fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    opts: Arc<ServerOptions>,
    stop: Arc<AtomicBool>,
) {
    let spawned = unsafe {
        coroutine::Builder::new()
            .stack_size(coroutine_stack_size())
            .spawn(move || conn::serve(stream, peer, router, opts, stop))
    };

    if let Err(err) = spawned {
        error!(%peer, error = %err, "failed to spawn connection coroutine");
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    pool: Option<Arc<IoThreadPool>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Block until the listener answers TCP connects.
    pub fn wait_ready(&self) -> io::Result<()> {
        for _ in 0..50 {
            if std::net::TcpStream::connect(self.addr).is_ok() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "server not ready"))
    }

    /// Stop gracefully: the acceptor closes so no new connections arrive,
    /// and live connections observe the stop token between requests, finish
    /// the in-flight response and close.
    pub fn stop(self) {
        info!(addr = %self.addr, "stopping server");
        self.stop.store(true, Ordering::Relaxed);
        unsafe {
            self.handle.coroutine().cancel();
        }
        let _ = self.handle.join();
        if let Some(pool) = &self.pool {
            pool.join();
        }
    }

    /// Wait for the accept loop to finish.
    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_read_timeout_table() {
        let secs = Duration::from_secs;
        let mut opts = ServerOptions::default();

        // No timeout configured at all.
        assert_eq!(opts.effective_read_timeout(), Duration::ZERO);

        // (read_timeout, serve_timeout, expected)
        let cases = [
            (secs(5), secs(10), secs(5)), // read-timeout is applied
            (secs(10), secs(5), secs(5)), // serve-timeout is applied
            (secs(5), secs(0), secs(5)),  // serve-timeout is not enabled
            (secs(0), secs(5), secs(5)),  // serve-timeout is still applied
            (secs(0), secs(0), secs(0)),  // both are not enabled
        ];

        for (read_timeout, serve_timeout, expected) in cases {
            opts.read_timeout = read_timeout;
            opts.serve_timeout = serve_timeout;
            assert_eq!(opts.effective_read_timeout(), expected);
        }
    }

    #[test]
    fn test_stack_size_env_parsing() {
        // Default when the variable is unset.
        std::env::remove_var("KESTREL_STACK_SIZE");
        assert_eq!(coroutine_stack_size(), 0x10000);
    }
}
