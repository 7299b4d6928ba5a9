use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced while registering a route pattern.
///
/// Registration happens before the server starts serving, so these never
/// reach runtime traffic. The message text mirrors the conflict shapes the
/// route tree detects and is asserted by the tree tests.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("a handler is already registered for path '{path}'")]
    DuplicateRoute { path: String },

    #[error("invalid wildcard in path '{path}'")]
    InvalidWildcard { path: String },

    #[error("'{segment}' in path '{path}' conflicts with existing wildcard '{wildcard}' in '{prefix}'")]
    WildcardConflict {
        segment: String,
        path: String,
        wildcard: String,
        prefix: String,
    },

    #[error("wildcard segment '{segment}' conflicts with existing children in path '{path}'")]
    WildcardChildren { segment: String, path: String },

    #[error("catch-all is only allowed at the end of the path in '{path}'")]
    CatchAllPosition { path: String },

    #[error("catch-all conflicts with existing handle for path segment root in '{path}'")]
    CatchAllRootConflict { path: String },

    #[error("no / before catch-all in path '{path}'")]
    CatchAllNoSlash { path: String },
}

/// An error a handler raises deliberately to produce a specific HTTP status.
///
/// The dispatch failure boundary renders it as a JSON error body with the
/// carried status, and an optional numeric sub-code for API clients that
/// distinguish failures beyond the HTTP status.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HttpError {
    status: StatusCode,
    code: Option<i64>,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(status: StatusCode, code: i64, message: impl Into<String>) -> Self {
        Self {
            status,
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> Option<i64> {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure raised by a user handler.
///
/// `Http` carries a deliberate status; anything else becomes a
/// 500 Internal Server Error. Neither skips post-handle middleware.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type HandlerResult = Result<(), HandlerError>;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<i64>,
}

/// Render the `{"error":{"message":..,"code"?:..}}` wire body.
pub(crate) fn error_body(message: &str, code: Option<i64>) -> String {
    serde_json::to_string(&ErrorBody {
        error: ErrorDetail { message, code },
    })
    .unwrap_or_else(|_| String::from(r#"{"error":{"message":"internal error"}}"#))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_without_code() {
        assert_eq!(
            error_body("Unknown resource", None),
            r#"{"error":{"message":"Unknown resource"}}"#
        );
    }

    #[test]
    fn test_error_body_with_code() {
        assert_eq!(
            error_body("quota exceeded", Some(42)),
            r#"{"error":{"message":"quota exceeded","code":42}}"#
        );
    }

    #[test]
    fn test_http_error_accessors() {
        let err = HttpError::with_code(StatusCode::TOO_MANY_REQUESTS, 7, "slow down");
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code(), Some(7));
        assert_eq!(err.message(), "slow down");
    }
}
