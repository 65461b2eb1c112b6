//! The HTTP façade: one axum handler per endpoint in the external interface,
//! each a thin call into a [`Manager`] method. See [`crate::server`] for the
//! router assembly and middleware stack.

pub mod auth;
mod error;
mod packages;
mod repo;
mod status;

pub use error::ErrorResponse;
pub(crate) use packages::{
    clone_repo, copy_source, import, pull_repo, remove_source, trim_obsoletes, trim_packages,
};
pub(crate) use repo::{create_repo, delta_repo, index_repo, list_pool, list_repos, remove_repo};
pub(crate) use status::status;

use axum::extract::FromRef;
use serde::Serialize;

use crate::manager::Manager;

/// Shared axum state: the façade only ever needs the manager and the
/// configured token (read once per request by the auth extractor).
#[derive(Clone, FromRef)]
pub struct ServerState {
    pub manager: Manager,
    pub api_token: Option<String>,
}

/// Wraps a successful payload in the fixed `{error, errorString, ...}`
/// envelope from the external interface, with `error` always `false`.
#[derive(Serialize)]
pub(crate) struct Envelope<T: Serialize> {
    error: bool,
    #[serde(rename = "errorString")]
    error_string: String,
    #[serde(flatten)]
    payload: T,
}

impl<T: Serialize> Envelope<T> {
    pub(crate) fn ok(payload: T) -> axum::Json<Self> {
        axum::Json(Self {
            error: false,
            error_string: String::new(),
            payload,
        })
    }
}

/// The shared response shape for every enqueue-only endpoint: the queue key
/// as a hex string, so callers can correlate it against `/status`'s job
/// lists if they care to (the key itself carries no secret).
#[derive(Serialize)]
pub(crate) struct Queued {
    pub queued: bool,
    #[serde(rename = "jobId")]
    pub job_id: String,
}

impl Queued {
    pub(crate) fn from_key(key: Vec<u8>) -> Self {
        Self {
            queued: true,
            job_id: hex::encode(key),
        }
    }
}
