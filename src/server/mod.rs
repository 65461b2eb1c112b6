//! Router assembly: wires the handlers in [`crate::api`] onto the endpoint
//! table and wraps them in the shared middleware stack.

use std::any::Any;
use std::time::Duration;

use axum::body::Body;
use axum::error_handling::HandleErrorLayer;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{BoxError, Router};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::api::{self, ErrorResponse, ServerState};

/// Build the full router. `api_token` is forwarded into `ServerState`; when
/// `None`, [`api::auth::Authenticated`] accepts every request and a warning
/// is logged once here.
pub fn new(state: ServerState) -> Router {
    if state.api_token.is_none() {
        warn!("SILO_API_TOKEN is not set; the HTTP API is unauthenticated");
    }

    let v1 = Router::new()
        .route("/status", get(api::status))
        .route("/list/repos", get(api::list_repos))
        .route("/list/pool", get(api::list_pool))
        .route("/create/repo/{id}", get(api::create_repo))
        .route("/remove/repo/{id}", get(api::remove_repo))
        .route("/delta/repo/{id}", get(api::delta_repo))
        .route("/index/repo/{id}", get(api::index_repo))
        .route("/import/{id}", post(api::import))
        .route("/clone/{id}", post(api::clone_repo))
        .route("/pull/{id}", post(api::pull_repo))
        .route("/copy/source/{id}", post(api::copy_source))
        .route("/remove/source/{id}", post(api::remove_source))
        .route("/trim/packages/{id}", post(api::trim_packages))
        .route("/trim/obsoletes/{id}", get(api::trim_obsoletes));

    // The enqueue endpoints never wait on the job they schedule, so a
    // blanket timeout is safe to apply to the whole router; nothing here
    // blocks on job execution.
    Router::new()
        .nest("/api/v1", v1)
        .layer(axum::middleware::from_fn(envelope_non_success))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(HandleErrorLayer::new(handle_middleware_error))
                .timeout(Duration::from_secs(30)),
        )
        .with_state(state)
}

/// Rewrites any non-2xx response that isn't already our JSON envelope (404s
/// and 405s axum generates itself, mostly) into one.
async fn envelope_non_success(request: Request, next: Next) -> Response {
    let uri = request.uri().to_string();
    let response = next.run(request).await;
    let status = response.status();
    if status.is_success() || status.is_redirection() || status.is_informational() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) if !bytes.is_empty() => {
            if serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .is_some_and(|v| v.get("errorString").is_some())
            {
                return Response::from_parts(parts, Body::from(bytes));
            }
            Some(String::from_utf8_lossy(&bytes).to_string())
        }
        Ok(_) => None,
        Err(err) => {
            warn!(%err, %uri, "unable to read response body for envelope conversion");
            None
        }
    };

    let code = match status {
        StatusCode::NOT_FOUND => "HTTP_ROUTE_NOT_FOUND",
        StatusCode::METHOD_NOT_ALLOWED => "HTTP_METHOD_NOT_ALLOWED",
        _ if status.is_client_error() => "HTTP_CLIENT_ERROR",
        _ => "HTTP_SERVER_ERROR",
    };
    ErrorResponse::new(status, code.to_string(), body.unwrap_or_else(|| format!("{status}: {uri}")))
        .into_response()
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    ErrorResponse::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "PANIC".to_string(),
        format!("internal error: {details}"),
    )
    .into_response()
}

async fn handle_middleware_error(err: BoxError) -> ErrorResponse {
    ErrorResponse::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "MIDDLEWARE_ERROR".to_string(),
        err.to_string(),
    )
}
