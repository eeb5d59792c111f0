//! Admin authentication: HTTP Basic against the configured credential pair.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::unauthorized;

/// The two recognized env-derived credentials. When either is unset, the
/// middleware is a no-op passthrough — unauthenticated management access is
/// the documented default for a bare local run (§6).
#[derive(Clone, Debug)]
pub struct AuthState {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Compares an inbound `Authorization: Basic` header against the configured
/// credential pair. No-op passthrough if both env vars are unset.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (Some(expected_user), Some(expected_pass)) = (&auth.username, &auth.password) else {
        return next.run(request).await;
    };

    match extract_basic_auth(request.headers()) {
        Some((user, pass)) if &user == expected_user && &pass == expected_pass => {
            next.run(request).await
        }
        _ => unauthorized(),
    }
}

fn extract_basic_auth(headers: &axum::http::HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    fn basic_header(user: &str, pass: &str) -> HeaderMap {
        let encoded = BASE64.encode(format!("{user}:{pass}"));
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {encoded}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn extracts_valid_basic_auth_header() {
        let headers = basic_header("admin", "s3cret");
        let (user, pass) = extract_basic_auth(&headers).unwrap();
        assert_eq!(user, "admin");
        assert_eq!(pass, "s3cret");
    }

    #[test]
    fn rejects_missing_header() {
        let headers = HeaderMap::new();
        assert!(extract_basic_auth(&headers).is_none());
    }

    #[test]
    fn rejects_non_basic_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert!(extract_basic_auth(&headers).is_none());
    }

    #[test]
    fn rejects_malformed_base64() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic ***".parse().unwrap());
        assert!(extract_basic_auth(&headers).is_none());
    }
}
