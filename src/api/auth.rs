//! Shared-secret bearer authentication. There is no user model: a single
//! token configured via `SILO_API_TOKEN` either matches or it doesn't.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request;
use axum::http::StatusCode;

use crate::api::ErrorResponse;

/// Present on every request once it's passed auth. Carries nothing; its
/// only job is to make "this request was authenticated" part of a handler's
/// type signature.
#[derive(Debug, Clone, Copy)]
pub struct Authenticated;

fn parse_bearer(headers: &axum::http::HeaderMap) -> Result<&str, &'static str> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or("`Authorization` header is missing")?;
    let value = header.to_str().map_err(|_| "`Authorization` header is malformed")?;
    value.strip_prefix("Bearer ").ok_or("`Authorization` scheme must be `Bearer`")
}

impl<S> FromRequestParts<S> for Authenticated
where
    Option<String>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ErrorResponse;

    async fn from_request_parts(parts: &mut request::Parts, state: &S) -> Result<Self, Self::Rejection> {
        let configured = Option::<String>::from_ref(state);
        let Some(configured) = configured else {
            // No token configured: auth is a no-op. The startup warning is
            // logged once when the config is loaded, not on every request.
            return Ok(Authenticated);
        };

        let token = parse_bearer(&parts.headers).map_err(|msg| {
            ErrorResponse::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED".to_string(), msg.to_string())
        })?;

        if constant_time_eq(token.as_bytes(), configured.as_bytes()) {
            Ok(Authenticated)
        } else {
            Err(ErrorResponse::new(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED".to_string(),
                "invalid API token".to_string(),
            ))
        }
    }
}

/// Avoids leaking token length/content through timing. Not constant-time
/// with respect to a mismatched length, which is unavoidable without
/// padding and isn't a meaningful leak here.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
