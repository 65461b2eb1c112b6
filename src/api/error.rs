use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// The fixed JSON envelope every non-2xx response uses: `{error, errorCode,
/// errorString}`. Matches [`crate::error::Error`]'s `IntoResponse` impl, the
/// panic handler, and the catch-all for axum's own routing errors.
#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    #[serde(skip)]
    status: StatusCode,
    error: bool,
    #[serde(rename = "errorCode")]
    pub code: String,
    #[serde(rename = "errorString")]
    pub message: String,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, code: String, message: String) -> Self {
        Self {
            status,
            error: true,
            code,
            message,
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = serde_json::to_string(&self).unwrap_or_else(|_| {
            r#"{"error":true,"errorCode":"SERIALIZATION_FAILURE","errorString":"failed to serialize error response"}"#.to_string()
        });
        (status, [("content-type", "application/json")], body).into_response()
    }
}
