//! Request cookie parsing and `Set-Cookie` rendering.
//!
//! Parsing is deliberately forgiving: malformed entries are skipped with a
//! warning instead of failing the request. Rendering validates each
//! attribute and skips invalid ones the same way.

use std::collections::HashMap;

use http::header::{HeaderMap, COOKIE};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::warn;

// Everything except unreserved characters gets percent-escaped.
const COOKIE_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

// token = 1*tchar
// tchar = "!" / "#" / "$" / "%" / "&" / "'" / "*" / "+" / "-" / "." /
//         "^" / "_" / "`" / "|" / "~" / DIGIT / ALPHA
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

// Unreserved characters or well-formed %XX escapes only.
fn is_pct_encoded_value(value: &str) -> bool {
    let bytes = value.as_bytes();
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
            b if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') => i += 1,
            _ => return false,
        }
    }
    true
}

fn is_valid_path_value(value: &str) -> bool {
    value
        .bytes()
        .all(|b| (0x20..0x7f).contains(&b) && b != b';')
}

fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b':'))
}

/// Read-only view of the cookies a request carried.
///
/// Built from every `Cookie` header field; duplicate names keep the first
/// occurrence, per the RFC first-match policy.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: HashMap<String, String>,
}

impl CookieJar {
    pub(crate) fn from_headers(headers: &HeaderMap) -> Self {
        let mut jar = CookieJar::default();
        for field in headers.get_all(COOKIE) {
            if let Ok(value) = field.to_str() {
                jar.parse_cookie_value(value);
            }
        }
        jar
    }

    fn parse_cookie_value(&mut self, cookie_value: &str) {
        for pair in cookie_value.split(';') {
            let trimmed = pair.trim_matches(|c: char| matches!(c, ' ' | '\t' | '\r' | '\n'));
            if trimmed.is_empty() {
                continue;
            }

            let fields: Vec<&str> = trimmed.split('=').collect();
            // Must be `name=value`; the value may be empty, the name cannot.
            if fields.len() > 2 || fields[0].is_empty() {
                warn!(cookie = %trimmed, "malformed cookie entry, skipped");
                continue;
            }

            let name = fields[0];
            // Strictly the RFC requires an `=`, but popular frameworks
            // accept a bare name with an empty value.
            let value = fields.get(1).copied().unwrap_or("");

            if !is_token(name) {
                warn!(name = %name, "cookie entry name is not a http token, skipped");
                continue;
            }

            if !is_pct_encoded_value(value) {
                warn!(name = %name, value = %value, "invalid cookie entry value, skipped");
                continue;
            }

            if !self.cookies.contains_key(name) {
                let decoded = percent_decode_str(value).decode_utf8_lossy().into_owned();
                self.cookies.insert(name.to_string(), decoded);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cookies.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    /// Do not emit the attribute.
    #[default]
    UseDefault,
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
            SameSite::UseDefault => "Default",
        }
    }
}

/// A `Set-Cookie` value under construction.
///
/// The value is percent-escaped on render. Invalid attributes are skipped
/// with a warning; an invalid name aborts rendering entirely.
#[derive(Debug, Clone, Default)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub domain: String,
    /// Zero or negative means the cookie should expire immediately.
    pub max_age: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: SameSite,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    /// Render the `Set-Cookie` header value, or `None` if the name is not a
    /// valid http token.
    pub fn render(&self) -> Option<String> {
        if !is_token(&self.name) {
            warn!(name = %self.name, "invalid cookie name, abort");
            return None;
        }

        let mut out = String::with_capacity(
            self.name.len() + self.value.len() + self.path.len() + self.domain.len() + 64,
        );
        out.push_str(&self.name);
        out.push('=');
        out.extend(utf8_percent_encode(&self.value, COOKIE_ESCAPE));

        if !self.path.is_empty() {
            if is_valid_path_value(&self.path) {
                out.push_str("; Path=");
                out.push_str(&self.path);
            } else {
                warn!(path = %self.path, "invalid cookie path value, skipped");
            }
        }

        if !self.domain.is_empty() {
            if is_valid_domain(&self.domain) {
                // A leading `.` is no longer required.
                let domain = self.domain.strip_prefix('.').unwrap_or(&self.domain);
                out.push_str("; Domain=");
                out.push_str(domain);
            } else {
                warn!(domain = %self.domain, "invalid cookie domain value, skipped");
            }
        }

        if let Some(max_age) = self.max_age {
            out.push_str("; Max-Age=");
            out.push_str(&max_age.to_string());
        }

        if self.secure {
            out.push_str("; Secure");
        }

        if self.http_only {
            out.push_str("; HttpOnly");
        }

        if self.same_site != SameSite::UseDefault {
            out.push_str("; SameSite=");
            out.push_str(self.same_site.as_str());
        }

        Some(out)
    }
}
