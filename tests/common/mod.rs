//! Shared helpers for the integration suites: a tracing guard and a tiny
//! blocking HTTP/1.1 client with Content-Length framing.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Pick a free loopback port by binding and immediately releasing it.
pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// One fully read response.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<String> {
        for line in self.head.lines().skip(1) {
            if let Some((field, value)) = line.split_once(':') {
                if field.eq_ignore_ascii_case(name) {
                    return Some(value.trim().to_string());
                }
            }
        }
        None
    }
}

/// Blocking test client. Keeps leftover bytes between reads so several
/// responses can be framed off one keep-alive connection.
pub struct HttpClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl HttpClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn send(&mut self, raw: &str) {
        self.stream.write_all(raw.as_bytes()).unwrap();
    }

    pub fn send_bytes(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).unwrap();
    }

    /// Read one response using Content-Length framing.
    pub fn read_response(&mut self) -> RawResponse {
        let mut chunk = [0u8; 1024];

        let head_end = loop {
            if let Some(pos) = find_subslice(&self.buf, b"\r\n\r\n") {
                break pos;
            }
            let n = self.stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed before response head");
            self.buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&self.buf[..head_end]).into_owned();
        self.buf.drain(..head_end + 4);

        let status: u16 = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .expect("malformed status line");

        let mut content_length = 0usize;
        for line in head.lines().skip(1) {
            if let Some((field, value)) = line.split_once(':') {
                if field.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap();
                }
            }
        }

        while self.buf.len() < content_length {
            let n = self.stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed before response body");
            self.buf.extend_from_slice(&chunk[..n]);
        }

        let body_bytes: Vec<u8> = self.buf.drain(..content_length).collect();
        RawResponse {
            status,
            head,
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
        }
    }

    /// Read until the server closes the connection.
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.buf);
        let _ = self.stream.read_to_end(&mut out);
        out
    }
}

/// Connect, send one request and read until the connection closes.
pub fn send_request(addr: SocketAddr, raw: &str) -> String {
    let mut client = HttpClient::connect(addr);
    client.send(raw);
    String::from_utf8_lossy(&client.read_to_end()).into_owned()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
