use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use super::error::error_response;
use super::external::DataPlane;

/// Check `Authorization: Bearer <token>` in constant time
pub(crate) fn verify_bearer(headers: &HeaderMap, expected: &str) -> bool {
    let Some(provided) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Rejects requests without the configured bearer token
///
/// Without a token every request is rejected unless the plane was built with
/// anonymous access.
pub(crate) async fn require_bearer(
    State(plane): State<DataPlane>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    match plane.auth_token() {
        Some(expected) if verify_bearer(&headers, expected) => next.run(request).await,
        Some(_) => {
            tracing::warn!("Rejected request without a valid bearer token");
            unauthorized("missing or invalid bearer token")
        }
        None if plane.allows_anonymous() => next.run(request).await,
        None => {
            tracing::debug!("Rejected request: no auth token configured");
            unauthorized("AUTH_TOKEN is not configured")
        }
    }
}

fn unauthorized(message: &str) -> Response {
    error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message.into())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_verify_bearer() {
        assert!(verify_bearer(&headers("Bearer s3cret"), "s3cret"));
        assert!(!verify_bearer(&headers("Bearer wrong"), "s3cret"));
        assert!(!verify_bearer(&headers("Basic s3cret"), "s3cret"));
        assert!(!verify_bearer(&HeaderMap::new(), "s3cret"));
    }
}
