use axum::extract::State;
use axum::Json;
use tracing::instrument;

use crate::api::auth::Authenticated;
use crate::api::{Envelope, ServerState};
use crate::error::{Error, Result};

#[instrument(skip(state))]
pub async fn status(
    _auth: Authenticated,
    State(state): State<ServerState>,
) -> Result<Json<Envelope<crate::manager::Status>>, Error> {
    Ok(Envelope::ok(state.manager.status()?))
}
