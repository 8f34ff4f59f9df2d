//! Credential extraction from request headers.
//!
//! These functions only locate candidate credentials; they never validate
//! them. Header lookups are case-insensitive through [`HeaderMap`].

use http::HeaderMap;
use http::header::{AUTHORIZATION, COOKIE};

/// Header carrying the Cloudflare Access assertion.
pub const ACCESS_TOKEN_HEADER: &str = "cf-access-jwt-assertion";

/// Cookie carrying the Cloudflare Access assertion.
pub const ACCESS_TOKEN_COOKIE: &str = "CF_Authorization";

/// Minimum length for a bearer value to be considered a signed token.
const MIN_JWT_LENGTH: usize = 20;

/// A candidate credential pulled from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Three-part signed token.
    SignedToken(String),
    /// Opaque shared secret.
    OpaqueToken(String),
}

impl Credential {
    /// Route a bearer value to the verifier it most likely belongs to.
    pub fn classify(raw: &str) -> Self {
        if looks_like_jwt(raw) {
            Self::SignedToken(raw.to_string())
        } else {
            Self::OpaqueToken(raw.to_string())
        }
    }

    /// The raw credential value.
    pub fn as_str(&self) -> &str {
        match self {
            Self::SignedToken(raw) | Self::OpaqueToken(raw) => raw,
        }
    }
}

/// The Access token found on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessToken {
    /// A token value made of visible ASCII.
    Present(String),
    /// A token was sent but its bytes cannot form a token.
    Unreadable,
}

/// Extract the Cloudflare Access token.
///
/// The `Cf-Access-Jwt-Assertion` header wins; the `CF_Authorization`
/// cookie is the fallback. A header or cookie that is present but not
/// readable is reported as [`AccessToken::Unreadable`], never as absent.
pub fn extract_access_token(headers: &HeaderMap) -> Option<AccessToken> {
    if let Some(value) = headers.get(ACCESS_TOKEN_HEADER)
        && !value.is_empty()
    {
        return Some(match value.to_str() {
            Ok(token) => AccessToken::Present(token.to_string()),
            Err(_) => AccessToken::Unreadable,
        });
    }

    headers
        .get(COOKIE)
        .and_then(|cookies| cookie_value(cookies.as_bytes(), ACCESS_TOKEN_COOKIE))
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
}

/// Find a named cookie in a raw `Cookie` header value.
fn cookie_value(cookies: &[u8], name: &str) -> Option<AccessToken> {
    cookies.split(|&b| b == b';').find_map(|pair| {
        let pair = pair.trim_ascii();
        let eq = pair.iter().position(|&b| b == b'=')?;
        let (key, value) = (&pair[..eq], &pair[eq + 1..]);
        if key != name.as_bytes() || value.is_empty() {
            return None;
        }

        Some(if value.iter().all(u8::is_ascii_graphic) {
            AccessToken::Present(String::from_utf8_lossy(value).into_owned())
        } else {
            AccessToken::Unreadable
        })
    })
}

/// Cheap shape check: does this look like a three-part signed token?
///
/// True iff the value is at least 20 characters, splits into exactly three
/// dot-separated parts, and the first part is non-empty base64url. This is
/// not a format validator; it only picks which verifier to try first.
pub fn looks_like_jwt(token: &str) -> bool {
    if token.len() < MIN_JWT_LENGTH {
        return false;
    }

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return false;
    }

    let header = parts[0];
    !header.is_empty()
        && header
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
