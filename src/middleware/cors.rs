//! Cross-origin resource sharing middleware.
//!
//! Header sets are precomputed at build time; per request the middleware
//! only matches the origin and copies prepared values. Preflight `OPTIONS`
//! requests and disallowed origins short-circuit the chain.

use std::collections::HashSet;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue, HOST, ORIGIN, VARY};
use http::{Method, StatusCode};
use tracing::warn;

use crate::middleware::{Middleware, MiddlewareResult};
use crate::server::{Request, Response};

const ALLOW_CREDENTIALS: HeaderName = HeaderName::from_static("access-control-allow-credentials");
const ALLOW_METHODS: HeaderName = HeaderName::from_static("access-control-allow-methods");
const ALLOW_HEADERS: HeaderName = HeaderName::from_static("access-control-allow-headers");
const ALLOW_PRIVATE_NETWORK: HeaderName =
    HeaderName::from_static("access-control-allow-private-network");
const ALLOW_ORIGIN: HeaderName = HeaderName::from_static("access-control-allow-origin");
const MAX_AGE: HeaderName = HeaderName::from_static("access-control-max-age");
const EXPOSE_HEADERS: HeaderName = HeaderName::from_static("access-control-expose-headers");

/// Which origins may make cross-origin requests.
pub enum AllowOrigin {
    /// Allow every origin. Not compatible with `allow_credentials` as per
    /// the fetch spec; avoid on production deployments.
    Any,
    List(HashSet<String>),
    Predicate(Box<dyn Fn(&str) -> bool + Send + Sync>),
}

impl AllowOrigin {
    pub fn list<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AllowOrigin::List(origins.into_iter().map(Into::into).collect())
    }

    fn allows(&self, origin: &str) -> bool {
        match self {
            AllowOrigin::Any => true,
            AllowOrigin::List(origins) => origins.contains(origin),
            AllowOrigin::Predicate(predicate) => predicate(origin),
        }
    }
}

/// Builder for [`Cors`].
pub struct CorsBuilder {
    allow_origin: AllowOrigin,
    allow_methods: Vec<Method>,
    allow_headers: Vec<String>,
    expose_headers: Vec<String>,
    max_age: Option<Duration>,
    allow_credentials: bool,
    allow_private_network: bool,
    preflight_status: StatusCode,
}

impl Default for CorsBuilder {
    fn default() -> Self {
        Self {
            allow_origin: AllowOrigin::Any,
            allow_methods: Vec::new(),
            allow_headers: Vec::new(),
            expose_headers: Vec::new(),
            max_age: None,
            allow_credentials: false,
            allow_private_network: false,
            preflight_status: StatusCode::NO_CONTENT,
        }
    }
}

impl CorsBuilder {
    pub fn allow_origin(mut self, policy: AllowOrigin) -> Self {
        self.allow_origin = policy;
        self
    }

    pub fn allow_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.allow_methods = methods.into_iter().collect();
        self
    }

    pub fn allow_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    pub fn expose_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expose_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    pub fn allow_private_network(mut self, allow: bool) -> Self {
        self.allow_private_network = allow;
        self
    }

    pub fn preflight_status(mut self, status: StatusCode) -> Self {
        self.preflight_status = status;
        self
    }

    pub fn build(self) -> Cors {
        let mut preflight = Vec::new();
        let mut normal = Vec::new();

        if self.allow_credentials {
            let value = HeaderValue::from_static("true");
            preflight.push((ALLOW_CREDENTIALS, value.clone()));
            normal.push((ALLOW_CREDENTIALS, value));
        }

        if !self.allow_methods.is_empty() {
            let joined = self
                .allow_methods
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = HeaderValue::from_str(&joined) {
                preflight.push((ALLOW_METHODS, value));
            }
        }

        if !self.allow_headers.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.allow_headers.join(", ")) {
                preflight.push((ALLOW_HEADERS, value));
            }
        }

        if self.allow_private_network {
            preflight.push((ALLOW_PRIVATE_NETWORK, HeaderValue::from_static("true")));
        }

        if let Some(max_age) = self.max_age {
            if let Ok(value) = HeaderValue::from_str(&max_age.as_secs().to_string()) {
                preflight.push((MAX_AGE, value));
            }
        }

        if !self.expose_headers.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.expose_headers.join(", ")) {
                normal.push((EXPOSE_HEADERS, value));
            }
        }

        // The response depends on the request origin unless every origin is
        // allowed, so caches must key on it.
        if !matches!(self.allow_origin, AllowOrigin::Any) {
            preflight.push((
                VARY,
                HeaderValue::from_static(
                    "Origin, Access-Control-Request-Method, Access-Control-Request-Headers",
                ),
            ));
            normal.push((VARY, HeaderValue::from_static("Origin")));
        }

        Cors {
            allow_origin: self.allow_origin,
            preflight_headers: preflight,
            cors_headers: normal,
            preflight_status: self.preflight_status,
        }
    }
}

/// CORS middleware. Register per-route or router-wide.
pub struct Cors {
    allow_origin: AllowOrigin,
    preflight_headers: Vec<(HeaderName, HeaderValue)>,
    cors_headers: Vec<(HeaderName, HeaderValue)>,
    preflight_status: StatusCode,
}

impl Cors {
    pub fn builder() -> CorsBuilder {
        CorsBuilder::default()
    }

    fn is_origin_same_as_host(origin: &str, req: &Request) -> bool {
        // As per the RFC, an origin consists of scheme, host and port.
        let origin = origin
            .strip_prefix("http://")
            .or_else(|| origin.strip_prefix("https://"))
            .unwrap_or(origin);

        // The Host field also carries the port part. A missing Host on a
        // 1.1 request is suspicious; take the normal flow in that case.
        match req.headers().get(HOST).and_then(|v| v.to_str().ok()) {
            Some(host) => origin == host,
            None => {
                warn!(method = %req.method(), target = %req.target(),
                      "suspicious request carries no Host field");
                true
            }
        }
    }

    fn apply(headers: &[(HeaderName, HeaderValue)], resp: &mut Response) {
        for (name, value) in headers {
            resp.headers_mut().insert(name.clone(), value.clone());
        }
    }
}

impl Middleware for Cors {
    fn pre_handle(&self, req: &mut Request, resp: &mut Response) -> MiddlewareResult {
        let origin = match req.headers().get(ORIGIN).and_then(|v| v.to_str().ok()) {
            Some(origin) => origin.to_string(),
            // Not a CORS request.
            None => return MiddlewareResult::Proceed,
        };

        if Self::is_origin_same_as_host(&origin, req) {
            return MiddlewareResult::Proceed;
        }

        if !self.allow_origin.allows(&origin) {
            resp.set_status(StatusCode::FORBIDDEN);
            return MiddlewareResult::Abort;
        }

        let allowed = match &self.allow_origin {
            AllowOrigin::Any => HeaderValue::from_static("*"),
            _ => match HeaderValue::from_str(&origin) {
                Ok(value) => value,
                Err(_) => {
                    resp.set_status(StatusCode::FORBIDDEN);
                    return MiddlewareResult::Abort;
                }
            },
        };
        resp.headers_mut().insert(ALLOW_ORIGIN, allowed);

        if req.method() == Method::OPTIONS {
            Self::apply(&self.preflight_headers, resp);
            resp.set_status(self.preflight_status);
            return MiddlewareResult::Abort;
        }

        Self::apply(&self.cors_headers, resp);
        MiddlewareResult::Proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Version;

    fn request(method: Method, origin: Option<&str>) -> Request {
        let mut req = Request::new(method, "/data").unwrap();
        req.headers_mut()
            .insert(HOST, HeaderValue::from_static("api.local:8080"));
        if let Some(origin) = origin {
            req.headers_mut()
                .insert(ORIGIN, HeaderValue::from_str(origin).unwrap());
        }
        req
    }

    fn response() -> Response {
        Response::new(Version::HTTP_11, true)
    }

    #[test]
    fn test_non_cors_request_proceeds() {
        let cors = Cors::builder().build();
        let mut req = request(Method::GET, None);
        let mut resp = response();
        assert_eq!(cors.pre_handle(&mut req, &mut resp), MiddlewareResult::Proceed);
        assert!(resp.headers().get(ALLOW_ORIGIN).is_none());
    }

    #[test]
    fn test_same_host_origin_proceeds_untouched() {
        let cors = Cors::builder()
            .allow_origin(AllowOrigin::list(["http://elsewhere.example"]))
            .build();
        let mut req = request(Method::GET, Some("http://api.local:8080"));
        let mut resp = response();
        assert_eq!(cors.pre_handle(&mut req, &mut resp), MiddlewareResult::Proceed);
        assert!(resp.headers().get(ALLOW_ORIGIN).is_none());
    }

    #[test]
    fn test_disallowed_origin_aborts_with_403() {
        let cors = Cors::builder()
            .allow_origin(AllowOrigin::list(["http://good.example"]))
            .build();
        let mut req = request(Method::GET, Some("http://evil.example"));
        let mut resp = response();
        assert_eq!(cors.pre_handle(&mut req, &mut resp), MiddlewareResult::Abort);
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_allowed_origin_is_echoed() {
        let cors = Cors::builder()
            .allow_origin(AllowOrigin::list(["http://good.example"]))
            .expose_headers(["x-request-id"])
            .build();
        let mut req = request(Method::GET, Some("http://good.example"));
        let mut resp = response();
        assert_eq!(cors.pre_handle(&mut req, &mut resp), MiddlewareResult::Proceed);
        assert_eq!(
            resp.headers().get(ALLOW_ORIGIN).unwrap(),
            "http://good.example"
        );
        assert_eq!(resp.headers().get(EXPOSE_HEADERS).unwrap(), "x-request-id");
        assert_eq!(resp.headers().get(VARY).unwrap(), "Origin");
    }

    #[test]
    fn test_preflight_short_circuits() {
        let cors = Cors::builder()
            .allow_origin(AllowOrigin::list(["http://good.example"]))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(["content-type"])
            .max_age(Duration::from_secs(600))
            .build();
        let mut req = request(Method::OPTIONS, Some("http://good.example"));
        let mut resp = response();
        assert_eq!(cors.pre_handle(&mut req, &mut resp), MiddlewareResult::Abort);
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers().get(ALLOW_METHODS).unwrap(), "GET, POST");
        assert_eq!(resp.headers().get(ALLOW_HEADERS).unwrap(), "content-type");
        assert_eq!(resp.headers().get(MAX_AGE).unwrap(), "600");
        assert_eq!(
            resp.headers().get(VARY).unwrap(),
            "Origin, Access-Control-Request-Method, Access-Control-Request-Headers"
        );
    }

    #[test]
    fn test_allow_all_omits_vary() {
        let cors = Cors::builder().build();
        let mut req = request(Method::GET, Some("http://anywhere.example"));
        let mut resp = response();
        assert_eq!(cors.pre_handle(&mut req, &mut resp), MiddlewareResult::Proceed);
        assert_eq!(resp.headers().get(ALLOW_ORIGIN).unwrap(), "*");
        assert!(resp.headers().get(VARY).is_none());
    }

    #[test]
    fn test_predicate_policy() {
        let cors = Cors::builder()
            .allow_origin(AllowOrigin::Predicate(Box::new(|origin| {
                origin.ends_with(".trusted.example")
            })))
            .build();
        let mut req = request(Method::GET, Some("http://app.trusted.example"));
        let mut resp = response();
        assert_eq!(cors.pre_handle(&mut req, &mut resp), MiddlewareResult::Proceed);
    }
}
