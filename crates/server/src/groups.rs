use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    Json,
};
use chrono::{SubsecRound, Utc};
use parley_core::Group;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{
    authz,
    error::{ApiError, FieldError},
    messaging::{MessagingError, NOT_A_MEMBER},
    session::AuthUser,
    store::{GroupStore, Stores, UserStore},
    AppState,
};

pub const CREATOR_NOT_REMOVABLE: &str = "the group creator cannot be removed";
pub const ONLY_CREATOR_REMOVES: &str = "only the group creator can remove other members";

#[derive(Clone)]
pub struct GroupService {
    users: Arc<dyn UserStore>,
    groups: Arc<dyn GroupStore>,
}

impl GroupService {
    pub fn new(stores: &Stores) -> Self {
        Self {
            users: stores.users.clone(),
            groups: stores.groups.clone(),
        }
    }

    /// Create a group owned by `creator`. The creator is always the first
    /// member; repeated ids collapse.
    pub async fn create(
        &self,
        creator: Uuid,
        name: &str,
        members: &[Uuid],
    ) -> Result<Group, MessagingError> {
        let mut roster = Vec::with_capacity(members.len() + 1);
        roster.push(creator);
        for member in members {
            if roster.contains(member) {
                continue;
            }
            if self.users.find_user(*member).await?.is_none() {
                return Err(MessagingError::UserNotFound);
            }
            roster.push(*member);
        }

        let group = self
            .groups
            .create_group(name, creator, &roster, Utc::now().trunc_subsecs(6))
            .await?;
        info!(group_id = %group.id, %creator, members = group.members.len(), "group created");
        Ok(group)
    }

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<Group>, MessagingError> {
        Ok(self.groups.list_groups_for_user(user_id).await?)
    }

    pub async fn get(&self, user_id: Uuid, group_id: Uuid) -> Result<Group, MessagingError> {
        let group = self.require(group_id).await?;
        if !group.is_member(user_id) {
            return Err(MessagingError::Unauthorized(NOT_A_MEMBER));
        }
        Ok(group)
    }

    /// Any member may add an existing user. Adding a current member is a no-op.
    pub async fn add_member(
        &self,
        caller: Uuid,
        group_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), MessagingError> {
        self.require(group_id).await?;
        if !authz::is_group_member(self.groups.as_ref(), group_id, caller).await? {
            return Err(MessagingError::Unauthorized(NOT_A_MEMBER));
        }
        if self.users.find_user(user_id).await?.is_none() {
            return Err(MessagingError::UserNotFound);
        }

        self.groups
            .add_group_member(group_id, user_id, Utc::now().trunc_subsecs(6))
            .await?;
        info!(%group_id, %user_id, added_by = %caller, "group member added");
        Ok(())
    }

    /// Members may leave; only the creator removes others; the creator never
    /// leaves. Removing a non-member succeeds without effect.
    pub async fn remove_member(
        &self,
        caller: Uuid,
        group_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, MessagingError> {
        self.require(group_id).await?;
        if authz::is_group_creator(self.groups.as_ref(), group_id, user_id).await? {
            return Err(MessagingError::Forbidden(CREATOR_NOT_REMOVABLE));
        }
        if caller != user_id
            && !authz::is_group_creator(self.groups.as_ref(), group_id, caller).await?
        {
            return Err(MessagingError::Forbidden(ONLY_CREATOR_REMOVES));
        }

        let removed = self.groups.remove_group_member(group_id, user_id).await?;
        if removed {
            info!(%group_id, %user_id, removed_by = %caller, "group member removed");
        }
        Ok(removed)
    }

    async fn require(&self, group_id: Uuid) -> Result<Group, MessagingError> {
        self.groups
            .find_group(group_id)
            .await?
            .ok_or(MessagingError::GroupNotFound)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateGroupRequest {
    pub name: String,
    pub members: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct MembershipRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct MembershipResponse {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub member: bool,
}

fn validate_group_name(name: &str) -> Result<&str, Vec<FieldError>> {
    let name = name.trim();
    let len = name.chars().count();
    if (3..=100).contains(&len) {
        Ok(name)
    } else {
        Err(vec![FieldError::new(
            "name",
            "must be between 3 and 100 characters",
        )])
    }
}

pub async fn create_group(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Group>), ApiError> {
    let Json(request) = payload?;
    let name = validate_group_name(&request.name).map_err(ApiError::Validation)?;
    let group = state
        .groups()
        .create(user_id, name, &request.members)
        .await?;
    Ok((StatusCode::CREATED, Json(group)))
}

pub async fn list_groups(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<Group>>, ApiError> {
    Ok(Json(state.groups().list(user_id).await?))
}

pub async fn get_group(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Group>, ApiError> {
    let Path(group_id) = path?;
    Ok(Json(state.groups().get(user_id, group_id).await?))
}

pub async fn add_member(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<MembershipRequest>, JsonRejection>,
) -> Result<Json<MembershipResponse>, ApiError> {
    let Path(group_id) = path?;
    let Json(request) = payload?;
    state
        .groups()
        .add_member(caller, group_id, request.user_id)
        .await?;
    Ok(Json(MembershipResponse {
        group_id,
        user_id: request.user_id,
        member: true,
    }))
}

pub async fn remove_member(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<MembershipRequest>, JsonRejection>,
) -> Result<Json<MembershipResponse>, ApiError> {
    let Path(group_id) = path?;
    let Json(request) = payload?;
    state
        .groups()
        .remove_member(caller, group_id, request.user_id)
        .await?;
    Ok(Json(MembershipResponse {
        group_id,
        user_id: request.user_id,
        member: false,
    }))
}
