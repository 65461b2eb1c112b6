use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use tracing::instrument;

use crate::api::auth::Authenticated;
use crate::api::{Envelope, Queued, ServerState};
use crate::error::{Error, Result};

#[derive(Deserialize)]
pub struct ImportRequest {
    path: Vec<String>,
}

#[instrument(skip(state, req))]
pub async fn import(
    _auth: Authenticated,
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<ImportRequest>,
) -> Result<Json<Envelope<Queued>>, Error> {
    let key = state.manager.bulk_add(&id, req.path)?;
    Ok(Envelope::ok(Queued::from_key(key)))
}

#[derive(Deserialize)]
pub struct CloneRequest {
    #[serde(rename = "cloneName")]
    clone_name: String,
    #[serde(rename = "copyAll")]
    copy_all: bool,
}

#[instrument(skip(state, req))]
pub async fn clone_repo(
    _auth: Authenticated,
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<CloneRequest>,
) -> Result<Json<Envelope<Queued>>, Error> {
    let key = state.manager.clone_repo(&id, &req.clone_name, req.copy_all)?;
    Ok(Envelope::ok(Queued::from_key(key)))
}

#[derive(Deserialize)]
pub struct PullRequest {
    source: String,
}

#[instrument(skip(state, req))]
pub async fn pull_repo(
    _auth: Authenticated,
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<PullRequest>,
) -> Result<Json<Envelope<Queued>>, Error> {
    let key = state.manager.pull_repo(&id, &req.source)?;
    Ok(Envelope::ok(Queued::from_key(key)))
}

/// `:id` is the repository the packages currently live in; `target` is the
/// other repository they're copied into.
#[derive(Deserialize)]
pub struct CopySourceRequest {
    target: String,
    source: String,
    relno: u32,
}

#[instrument(skip(state, req))]
pub async fn copy_source(
    _auth: Authenticated,
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<CopySourceRequest>,
) -> Result<Json<Envelope<Queued>>, Error> {
    let key = state.manager.copy_source(&id, &req.target, &req.source, req.relno)?;
    Ok(Envelope::ok(Queued::from_key(key)))
}

#[derive(Deserialize)]
pub struct RemoveSourceRequest {
    source: String,
    relno: u32,
}

#[instrument(skip(state, req))]
pub async fn remove_source(
    _auth: Authenticated,
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<RemoveSourceRequest>,
) -> Result<Json<Envelope<Queued>>, Error> {
    let key = state.manager.remove_source(&id, &req.source, req.relno)?;
    Ok(Envelope::ok(Queued::from_key(key)))
}

#[derive(Deserialize)]
pub struct TrimPackagesRequest {
    #[serde(rename = "maxPackages")]
    max_packages: usize,
}

#[instrument(skip(state, req))]
pub async fn trim_packages(
    _auth: Authenticated,
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<TrimPackagesRequest>,
) -> Result<Json<Envelope<Queued>>, Error> {
    let key = state.manager.trim_packages(&id, req.max_packages)?;
    Ok(Envelope::ok(Queued::from_key(key)))
}

#[instrument(skip(state))]
pub async fn trim_obsoletes(
    _auth: Authenticated,
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Queued>>, Error> {
    let key = state.manager.trim_obsolete(&id)?;
    Ok(Envelope::ok(Queued::from_key(key)))
}
