use http::{HeaderMap, Method, StatusCode, Version};
use percent_encoding::percent_decode_str;
use tracing::error;

use crate::cookie::CookieJar;
use crate::error::HttpError;
use crate::router::PathParams;

// Reject strings with broken %XX escapes or embedded control bytes before
// percent-decoding; the decoder itself passes malformed escapes through.
fn pct_escapes_well_formed(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if i + 2 >= bytes.len()
                    || !bytes[i + 1].is_ascii_hexdigit()
                    || !bytes[i + 2].is_ascii_hexdigit()
                {
                    return false;
                }
                i += 3;
            }
            b if b.is_ascii_control() => return false,
            _ => i += 1,
        }
    }
    true
}

/// Parsed query-string parameters, in wire order.
///
/// Duplicate keys are kept; `get` returns the first match. A query string
/// that fails validation is discarded whole and the request continues with
/// an empty set.
#[derive(Debug, Default)]
pub struct QueryParams {
    items: Vec<(String, String)>,
}

impl QueryParams {
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        if !pct_escapes_well_formed(raw) || percent_decode_str(raw).decode_utf8().is_err() {
            return None;
        }
        let items = url::form_urlencoded::parse(raw.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Some(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Insert `{key, value}` if absent; otherwise the first match takes the
    /// new value and remaining matches are erased. Comparison is
    /// case-sensitive.
    pub fn set(&mut self, key: &str, value: &str) {
        let Some(pos) = self.items.iter().position(|(k, _)| k == key) else {
            self.items.push((key.to_string(), value.to_string()));
            return;
        };

        self.items[pos].1 = value.to_string();

        let mut next = pos + 1;
        while next < self.items.len() {
            if self.items[next].0 == key {
                self.items.remove(next);
            } else {
                next += 1;
            }
        }
    }

    /// Remove all matching entries, returning how many were removed.
    pub fn del(&mut self, key: &str) -> usize {
        let before = self.items.len();
        self.items.retain(|(k, _)| k != key);
        before - self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A parsed HTTP request.
///
/// Owns its target, decoded path, headers and body. Path-parameter captures
/// are spans into the decoded path, so they stay valid for the life of the
/// request and never allocate per lookup.
#[derive(Debug)]
pub struct Request {
    version: Version,
    method: Method,
    target: String,
    path: String,
    query: QueryParams,
    headers: HeaderMap,
    params: PathParams,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Request {
    /// Build a request from a method and an origin-form target. Useful for
    /// tests and for driving the router without a socket.
    pub fn new(method: Method, target: &str) -> Result<Self, HttpError> {
        Self::build(
            Version::HTTP_11,
            method,
            target.to_string(),
            HeaderMap::new(),
            Vec::new(),
            true,
        )
    }

    pub(crate) fn build(
        version: Version,
        method: Method,
        target: String,
        headers: HeaderMap,
        body: Vec<u8>,
        keep_alive: bool,
    ) -> Result<Self, HttpError> {
        let (raw_path, raw_query) = match target.find('?') {
            Some(pos) => (&target[..pos], Some(&target[pos + 1..])),
            None => (target.as_str(), None),
        };

        if !raw_path.starts_with('/') || !pct_escapes_well_formed(raw_path) {
            return Err(HttpError::new(StatusCode::BAD_REQUEST, "invalid url path"));
        }
        let path = percent_decode_str(raw_path)
            .decode_utf8()
            .map_err(|_| HttpError::new(StatusCode::BAD_REQUEST, "invalid url path"))?
            .into_owned();

        // Discard the whole query string if it is malformed.
        let query = match raw_query {
            Some(raw) => QueryParams::parse(raw).unwrap_or_else(|| {
                error!("malformed query string discarded");
                QueryParams::default()
            }),
            None => QueryParams::default(),
        };

        Ok(Self {
            version,
            method,
            target,
            path,
            query,
            headers,
            params: PathParams::new(),
            body,
            keep_alive,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The raw request target as it appeared on the wire.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The percent-decoded path component of the target.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    pub fn query_mut(&mut self) -> &mut QueryParams {
        &mut self.query
    }

    /// Cookies parsed from every `Cookie` header field.
    pub fn cookies(&self) -> CookieJar {
        CookieJar::from_headers(&self.headers)
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub(crate) fn set_params(&mut self, params: PathParams) {
        self.params = params;
    }

    /// Resolve the first path parameter named `name`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(&self.path, name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_split_and_decode() {
        let req = Request::new(Method::GET, "/greet%20all?name=hi").unwrap();
        assert_eq!(req.target(), "/greet%20all?name=hi");
        assert_eq!(req.path(), "/greet all");
        assert_eq!(req.query().get("name"), Some("hi"));
    }

    #[test]
    fn test_invalid_path_rejected() {
        let err = Request::new(Method::GET, "no-leading-slash").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = Request::new(Method::GET, "/bad%zzpath").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_malformed_query_discarded_request_continues() {
        let req = Request::new(Method::GET, "/search?q=%zz").unwrap();
        assert_eq!(req.path(), "/search");
        assert!(req.query().is_empty());
    }

    #[test]
    fn test_query_multi_and_plus() {
        let req = Request::new(Method::GET, "/p?x=1&x=2&msg=a+b").unwrap();
        assert_eq!(req.query().get("x"), Some("1"));
        assert_eq!(req.query().get_or("missing", "fallback"), "fallback");
        assert_eq!(req.query().get("msg"), Some("a b"));
        assert_eq!(req.query().len(), 3);
    }

    #[test]
    fn test_query_set_replaces_and_dedupes() {
        let req = Request::new(Method::GET, "/p?x=1&y=2&x=3");
        let mut req = req.unwrap();
        req.query_mut().set("x", "9");
        assert_eq!(req.query().get("x"), Some("9"));
        assert_eq!(req.query().len(), 2);

        req.query_mut().set("z", "new");
        assert_eq!(req.query().get("z"), Some("new"));
    }

    #[test]
    fn test_query_del() {
        let mut req = Request::new(Method::GET, "/p?x=1&x=2&y=3").unwrap();
        assert_eq!(req.query_mut().del("x"), 2);
        assert_eq!(req.query_mut().del("x"), 0);
        assert_eq!(req.query().get("y"), Some("3"));
    }
}
