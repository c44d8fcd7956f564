// Crypto module for the cache server
//
// Narinfo signing and credential checks.

pub mod signing;

pub use signing::{default_key_name, NarinfoSigner};

use axum::http::{header, HeaderMap};
use base64::Engine;

/// Constant time comparison of a presented token with the expected one
pub fn token_matches(presented: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    constant_time_eq::constant_time_eq(presented.as_bytes(), expected.as_bytes())
}

/// Token carried by an Authorization header
///
/// Nix sends netrc credentials as Basic auth, Cachix clients send Bearer.
/// For Basic the password is the token.
pub fn presented_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, credential) = value.trim().split_once(' ')?;

    match scheme {
        s if s.eq_ignore_ascii_case("bearer") => Some(credential.trim().to_string()),
        s if s.eq_ignore_ascii_case("basic") => {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(credential.trim())
                .ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (_, password) = decoded.split_once(':')?;
            Some(password.to_string())
        }
        _ => None,
    }
}

/// Whether the request headers carry the expected token
pub fn is_authorized(headers: &HeaderMap, expected: &str) -> bool {
    presented_token(headers)
        .map(|token| token_matches(&token, expected))
        .unwrap_or(false)
}
