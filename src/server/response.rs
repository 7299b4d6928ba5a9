use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, SERVER, SET_COOKIE};
use http::{HeaderMap, HeaderValue, StatusCode, Version};
use tracing::warn;

use crate::cookie::SetCookie;
use crate::server::Request;

pub(crate) const SERVER_IDENT: &str = concat!("kestrel/", env!("CARGO_PKG_VERSION"));

const MIME_JSON: &str = "application/json";
const MIME_TEXT: &str = "text/plain";

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// An HTTP response under construction.
///
/// Created per request with the request's version and keep-alive flag;
/// handlers and middleware mutate status, headers and body. The payload is
/// prepared (Content-Length computed, Server header added) when the
/// connection serializes it.
#[derive(Debug)]
pub struct Response {
    version: Version,
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Response {
    pub fn new(version: Version, keep_alive: bool) -> Self {
        Self {
            version,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            keep_alive,
        }
    }

    pub fn for_request(req: &Request) -> Self {
        Self::new(req.version(), req.keep_alive())
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn append_body(&mut self, chunk: impl AsRef<[u8]>) {
        self.body.extend_from_slice(chunk.as_ref());
    }

    /// Set a `text/plain` payload with the given status.
    pub fn text(&mut self, status: StatusCode, body: impl Into<String>) {
        self.status = status;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(MIME_TEXT));
        self.body = body.into().into_bytes();
    }

    /// Set an `application/json` payload with the given status.
    pub fn json(&mut self, status: StatusCode, body: impl Into<String>) {
        self.status = status;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(MIME_JSON));
        self.body = body.into().into_bytes();
    }

    /// Append a `Set-Cookie` header. Invalid cookies are dropped with a
    /// warning rather than failing the response.
    pub fn set_cookie(&mut self, cookie: &SetCookie) {
        let Some(rendered) = cookie.render() else {
            return;
        };
        match HeaderValue::from_str(&rendered) {
            Ok(value) => {
                self.headers.append(SET_COOKIE, value);
            }
            Err(_) => warn!(cookie = %rendered, "unencodable Set-Cookie value, dropped"),
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Serialize the response head and body, computing `Content-Length` and
    /// stamping the `Server` header.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());

        out.extend_from_slice(version_str(self.version).as_bytes());
        out.extend_from_slice(
            format!(
                " {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason().unwrap_or("Unknown")
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            // Owned by the serializer.
            if *name == CONTENT_LENGTH || *name == CONNECTION {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if !self.headers.contains_key(SERVER) {
            out.extend_from_slice(b"Server: ");
            out.extend_from_slice(SERVER_IDENT.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if self.version == Version::HTTP_10 && self.keep_alive {
            out.extend_from_slice(b"Connection: keep-alive\r\n");
        } else if self.version != Version::HTTP_10 && !self.keep_alive {
            out.extend_from_slice(b"Connection: close\r\n");
        }

        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_to_string(resp: &Response) -> String {
        String::from_utf8(resp.encode()).unwrap()
    }

    #[test]
    fn test_text_sets_status_and_content_type() {
        let mut resp = Response::new(Version::HTTP_11, true);
        resp.text(StatusCode::OK, "Pong!");
        let wire = encode_to_string(&resp);
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("content-type: text/plain\r\n"));
        assert!(wire.contains("Content-Length: 5\r\n"));
        assert!(wire.ends_with("\r\n\r\nPong!"));
    }

    #[test]
    fn test_json_content_type() {
        let mut resp = Response::new(Version::HTTP_11, true);
        resp.json(StatusCode::NOT_FOUND, r#"{"error":{"message":"Unknown resource"}}"#);
        let wire = encode_to_string(&resp);
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.contains("content-type: application/json\r\n"));
    }

    #[test]
    fn test_server_header_stamped_once() {
        let mut resp = Response::new(Version::HTTP_11, true);
        resp.headers_mut()
            .insert(SERVER, HeaderValue::from_static("custom/1.0"));
        let wire = encode_to_string(&resp);
        assert!(wire.contains("server: custom/1.0\r\n"));
        assert!(!wire.contains(SERVER_IDENT));
    }

    #[test]
    fn test_connection_close_emitted() {
        let mut resp = Response::new(Version::HTTP_11, false);
        resp.text(StatusCode::OK, "bye");
        assert!(encode_to_string(&resp).contains("Connection: close\r\n"));

        let resp = Response::new(Version::HTTP_11, true);
        assert!(!encode_to_string(&resp).contains("Connection:"));
    }

    #[test]
    fn test_http10_keep_alive_emitted() {
        let resp = Response::new(Version::HTTP_10, true);
        let wire = encode_to_string(&resp);
        assert!(wire.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(wire.contains("Connection: keep-alive\r\n"));
    }

    #[test]
    fn test_set_cookie_appended() {
        let mut resp = Response::new(Version::HTTP_11, true);
        resp.set_cookie(&SetCookie::new("sid", "abc"));
        let wire = encode_to_string(&resp);
        assert!(wire.contains("set-cookie: sid=abc\r\n"));
    }
}
