// =============================================================================
// Operator API authentication
// =============================================================================
//
// Single shared admin token, checked on every request.  The expected value
// comes from the `MERIDIAN_ADMIN_TOKEN` environment variable and is compared
// in constant time.  Used as an Axum extractor:
//
//   async fn handler(_auth: AuthBearer, ...) { ... }
//
// A missing or wrong token short-circuits the request with 403 before the
// handler runs.
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Byte-wise comparison that always walks both slices fully, so the match
/// position is not observable through timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Validated bearer token. Carries the raw token for audit logging.
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Re-read per request: token rotation must not require a restart.
        let expected = std::env::var("MERIDIAN_ADMIN_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            warn!("MERIDIAN_ADMIN_TOKEN unset — rejecting all authenticated requests");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "server authentication not configured",
            });
        }

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match header.and_then(|v| v.strip_prefix("Bearer ")) {
            Some(token) => token,
            None => {
                return Err(AuthRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "missing or malformed authorization header",
                });
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "invalid authorization token",
            });
        }

        Ok(AuthBearer(token.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_match() {
        assert!(constant_time_eq(b"meridian", b"meridian"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn unequal_inputs_do_not_match() {
        assert!(!constant_time_eq(b"meridian", b"meridiaN"));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn length_mismatch_does_not_match() {
        assert!(!constant_time_eq(b"short", b"a-much-longer-token"));
    }
}
