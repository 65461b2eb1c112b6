use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use tracing::instrument;

use crate::api::auth::Authenticated;
use crate::api::{Envelope, Queued, ServerState};
use crate::error::{Error, Result};
use crate::manager::PoolItem;

#[derive(Serialize)]
struct Repos {
    repos: Vec<String>,
}

#[instrument(skip(state))]
pub async fn list_repos(
    _auth: Authenticated,
    State(state): State<ServerState>,
) -> Result<Json<Envelope<Repos>>, Error> {
    Ok(Envelope::ok(Repos {
        repos: state.manager.list_repos()?,
    }))
}

#[derive(Serialize)]
struct Pool {
    pool: Vec<PoolItem>,
}

#[instrument(skip(state))]
pub async fn list_pool(
    _auth: Authenticated,
    State(state): State<ServerState>,
) -> Result<Json<Envelope<Pool>>, Error> {
    Ok(Envelope::ok(Pool {
        pool: state.manager.list_pool()?,
    }))
}

#[instrument(skip(state))]
pub async fn create_repo(
    _auth: Authenticated,
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Queued>>, Error> {
    let key = state.manager.create_repo(&id)?;
    Ok(Envelope::ok(Queued::from_key(key)))
}

#[instrument(skip(state))]
pub async fn remove_repo(
    _auth: Authenticated,
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Queued>>, Error> {
    let key = state.manager.delete_repo(&id)?;
    Ok(Envelope::ok(Queued::from_key(key)))
}

#[instrument(skip(state))]
pub async fn delta_repo(
    _auth: Authenticated,
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Queued>>, Error> {
    let key = state.manager.delta_repo(&id)?;
    Ok(Envelope::ok(Queued::from_key(key)))
}

#[instrument(skip(state))]
pub async fn index_repo(
    _auth: Authenticated,
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Queued>>, Error> {
    let key = state.manager.index_repo(&id)?;
    Ok(Envelope::ok(Queued::from_key(key)))
}
