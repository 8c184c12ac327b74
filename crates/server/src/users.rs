use axum::{extract::State, Json};
use parley_core::User;
use serde::Serialize;
use uuid::Uuid;

use crate::{error::ApiError, session::AuthUser, store::UserStore, AppState};

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub online: Vec<Uuid>,
}

/// Every account except the caller, ordered by username.
pub async fn list_users(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<User>>, ApiError> {
    let users = state
        .stores()
        .users
        .list_users_except(user_id)
        .await
        .map_err(|err| ApiError::internal(&err, "failed to list users"))?;
    Ok(Json(users))
}

pub async fn presence(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        online: state.hub().online_users().await,
    })
}
