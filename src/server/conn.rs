//! Per-connection request/response state machine.
//!
//! Each accepted socket is driven by one coroutine running [`serve`]:
//! wait idle, read the request head, honor `Expect: 100-continue`, read the
//! Content-Length body, dispatch through the router, write the response,
//! then loop while keep-alive holds and the server is not stopping.
//!
//! Three timeouts apply per iteration: the idle timeout while waiting for
//! the first byte, the effective read timeout as an absolute deadline over
//! head + body, and the serve timeout as an end-to-end budget enforced by a
//! watchdog coroutine that cancels the connection when it expires.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING};
use http::{Method, StatusCode, Version};
use may::coroutine;
use may::net::TcpStream;
use tracing::{debug, error};

use crate::error::error_body;
use crate::router::Router;
use crate::server::server::{coroutine_stack_size, ServerOptions};
use crate::server::{Request, Response};

const READ_CHUNK: usize = 4096;
const MAX_HEADERS: usize = 64;
const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Drive one connection until it closes.
pub(crate) fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    opts: Arc<ServerOptions>,
    stop: Arc<AtomicBool>,
) {
    match serve_loop(&mut stream, &router, &opts, &stop) {
        Ok(()) => debug!(%peer, "session closed"),
        Err(err) => match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => {
                debug!(%peer, cause = %err, "remote session closed");
            }
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                error!(%peer, "remote session timed out");
            }
            _ => {
                error!(%peer, cause = %err, "unhandled session error");
            }
        },
    }

    let _ = stream.shutdown(Shutdown::Write);
}

fn serve_loop(
    stream: &mut TcpStream,
    router: &Router,
    opts: &ServerOptions,
    stop: &AtomicBool,
) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let read_timeout = opts.effective_read_timeout();

    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        // Idle until the first byte of the next request. Bytes left over
        // from a pipelined request count as that byte.
        if buf.is_empty() {
            stream.set_read_timeout(duration_opt(opts.idle_timeout))?;
            if read_chunk(stream, &mut buf)? == 0 {
                // Remote closed between requests.
                return Ok(());
            }
        }

        let t0 = Instant::now();
        let read_deadline = duration_opt(read_timeout).map(|d| t0 + d);

        let head = read_head(stream, &mut buf, read_deadline)?;
        let head = match head {
            Ok(head) => head,
            Err(reject) => {
                debug!(reason = %reject.message, "rejecting malformed request");
                write_error_response(stream, reject.status, &reject.message)?;
                return Ok(());
            }
        };

        if head.expect_continue {
            stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
        }

        let body = read_body(stream, &mut buf, head.content_length, read_deadline)?;

        // The serve budget covers read + dispatch + write; what the read
        // already consumed no longer counts.
        let mut serve_guard = None;
        if let Some(serve_timeout) = duration_opt(opts.serve_timeout) {
            let Some(budget) = serve_timeout.checked_sub(t0.elapsed()) else {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "serve budget exhausted while reading",
                ));
            };
            stream.set_write_timeout(Some(budget))?;
            serve_guard = Some(ServeGuard::arm(budget));
        } else {
            stream.set_write_timeout(None)?;
        }

        let request = Request::build(
            head.version,
            head.method,
            head.target,
            head.headers,
            body,
            head.keep_alive,
        );

        let keep_alive = match request {
            Ok(mut req) => {
                let resp = router.dispatch(&mut req);
                stream.write_all(&resp.encode())?;
                resp.keep_alive()
            }
            Err(err) => {
                write_error_response(stream, err.status(), err.message())?;
                false
            }
        };

        if let Some(guard) = serve_guard.take() {
            guard.disarm();
        }

        if !keep_alive {
            return Ok(());
        }
    }
}

/// Cancels the owning connection coroutine when the serve budget expires
/// before the response is fully written.
struct ServeGuard {
    done: Arc<AtomicBool>,
    watchdog: Option<coroutine::JoinHandle<()>>,
}

impl ServeGuard {
    fn arm(budget: Duration) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let target = coroutine::current();
        let observed = done.clone();

        let watchdog = unsafe {
            coroutine::Builder::new()
                .stack_size(coroutine_stack_size())
                .spawn(move || {
                    coroutine::sleep(budget);
                    if !observed.load(Ordering::Acquire) {
                        error!(budget_ms = budget.as_millis() as u64, "session timed out");
                        unsafe {
                            target.cancel();
                        }
                    }
                })
        };

        match watchdog {
            Ok(handle) => Self {
                done,
                watchdog: Some(handle),
            },
            Err(err) => {
                error!(error = %err, "failed to spawn serve watchdog");
                Self {
                    done,
                    watchdog: None,
                }
            }
        }
    }

    fn disarm(mut self) {
        self.done.store(true, Ordering::Release);
        if let Some(handle) = self.watchdog.take() {
            unsafe {
                handle.coroutine().cancel();
            }
        }
    }
}

impl Drop for ServeGuard {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Release);
        if let Some(handle) = self.watchdog.take() {
            unsafe {
                handle.coroutine().cancel();
            }
        }
    }
}

#[derive(Debug)]
struct Head {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    content_length: usize,
    expect_continue: bool,
    keep_alive: bool,
}

/// A request the parser refuses; answered and then the connection closes.
#[derive(Debug)]
struct Reject {
    status: StatusCode,
    message: String,
}

impl Reject {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn duration_opt(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

/// Arm the socket read timeout from an absolute deadline.
fn arm_read_deadline(stream: &TcpStream, deadline: Option<Instant>) -> io::Result<()> {
    match deadline {
        Some(deadline) => {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "read deadline expired"))?;
            stream.set_read_timeout(Some(remaining))
        }
        None => stream.set_read_timeout(None),
    }
}

fn read_chunk(stream: &mut TcpStream, buf: &mut BytesMut) -> io::Result<usize> {
    let mut chunk = [0u8; READ_CHUNK];
    let n = stream.read(&mut chunk)?;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

/// Read until the request head parses, respecting the read deadline.
fn read_head(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    deadline: Option<Instant>,
) -> io::Result<Result<Head, Reject>> {
    loop {
        match parse_head(buf) {
            Ok(Some((head, consumed))) => {
                buf.advance(consumed);
                return Ok(Ok(head));
            }
            Ok(None) => {
                if buf.len() > MAX_HEAD_BYTES {
                    return Ok(Err(Reject::bad_request("request head too large")));
                }
                arm_read_deadline(stream, deadline)?;
                if read_chunk(stream, buf)? == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed while reading request head",
                    ));
                }
            }
            Err(reject) => return Ok(Err(reject)),
        }
    }
}

fn read_body(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    content_length: usize,
    deadline: Option<Instant>,
) -> io::Result<Vec<u8>> {
    while buf.len() < content_length {
        arm_read_deadline(stream, deadline)?;
        if read_chunk(stream, buf)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed while reading request body",
            ));
        }
    }
    Ok(buf.split_to(content_length).to_vec())
}

/// Parse the request head out of `buf`. `Ok(None)` means more bytes are
/// needed; a `Reject` is answered with an error response and a close.
fn parse_head(buf: &[u8]) -> Result<Option<(Head, usize)>, Reject> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut header_storage);

    let consumed = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => consumed,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => return Err(Reject::bad_request(format!("malformed request: {err}"))),
    };

    let method = parsed
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| Reject::bad_request("malformed request method"))?;

    let target = parsed
        .path
        .ok_or_else(|| Reject::bad_request("malformed request target"))?
        .to_string();

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(Reject::bad_request("unsupported http version")),
    };

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Reject::bad_request("malformed header name"))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| Reject::bad_request("malformed header value"))?;
        headers.append(name, value);
    }

    if headers.contains_key(TRANSFER_ENCODING) {
        return Err(Reject {
            status: StatusCode::NOT_IMPLEMENTED,
            message: "transfer encodings are not supported".to_string(),
        });
    }

    let content_length = match headers.get(CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| Reject::bad_request("malformed content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(Reject {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: "request body too large".to_string(),
        });
    }

    let expect_continue = headers
        .get(EXPECT)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
        .unwrap_or(false);

    let keep_alive = wants_keep_alive(version, &headers);

    Ok(Some((
        Head {
            method,
            target,
            version,
            headers,
            content_length,
            expect_continue,
            keep_alive,
        },
        consumed,
    )))
}

fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let connection = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if version == Version::HTTP_10 {
        connection.contains("keep-alive")
    } else {
        !connection.contains("close")
    }
}

fn write_error_response(
    stream: &mut TcpStream,
    status: StatusCode,
    message: &str,
) -> io::Result<()> {
    let mut resp = Response::new(Version::HTTP_11, false);
    resp.json(status, error_body(message, None));
    stream.write_all(&resp.encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_head_complete() {
        let raw = b"GET /ping?x=1 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 3\r\n\r\nabcXX";
        let (head, consumed) = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/ping?x=1");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.content_length, 3);
        assert!(head.keep_alive);
        assert!(!head.expect_continue);
        assert_eq!(&raw[consumed..], &b"abcXX"[..]);
    }

    #[test]
    fn test_parse_head_partial() {
        assert!(parse_head(b"GET /ping HTTP/1.1\r\nHost: lo").unwrap().is_none());
    }

    #[test]
    fn test_parse_head_malformed() {
        let reject = parse_head(b"NOT A REQUEST\r\n\r\n").unwrap_err();
        assert_eq!(reject.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_head_expect_continue() {
        let raw = b"POST /echo HTTP/1.1\r\nExpect: 100-Continue\r\nContent-Length: 5\r\n\r\n";
        let (head, _) = parse_head(raw).unwrap().unwrap();
        assert!(head.expect_continue);
        assert_eq!(head.content_length, 5);
    }

    #[test]
    fn test_parse_head_connection_close() {
        let raw = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let (head, _) = parse_head(raw).unwrap().unwrap();
        assert!(!head.keep_alive);

        let raw = b"GET / HTTP/1.0\r\n\r\n";
        let (head, _) = parse_head(raw).unwrap().unwrap();
        assert!(!head.keep_alive);

        let raw = b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n";
        let (head, _) = parse_head(raw).unwrap().unwrap();
        assert!(head.keep_alive);
    }

    #[test]
    fn test_parse_head_bad_content_length() {
        let raw = b"GET / HTTP/1.1\r\nContent-Length: banana\r\n\r\n";
        let reject = parse_head(raw).unwrap_err();
        assert_eq!(reject.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_effective_timeouts_disable_on_zero() {
        assert_eq!(duration_opt(Duration::ZERO), None);
        assert_eq!(
            duration_opt(Duration::from_secs(5)),
            Some(Duration::from_secs(5))
        );
    }
}
