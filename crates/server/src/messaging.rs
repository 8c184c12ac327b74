use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use chrono::{DateTime, SubsecRound, Utc};
use parley_core::{normalize_limit, Message, MessageParent};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    authz,
    error::ApiError,
    hub::Hub,
    session::AuthUser,
    store::{ConversationStore, GroupStore, MessageStore, Stores, UserStore},
    AppState,
};

pub const NOT_A_PARTICIPANT: &str = "not a participant of this conversation";
pub const NOT_A_MEMBER: &str = "not a member of this group";
pub const EMPTY_CONTENT: &str = "content must not be empty";

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("user not found")]
    UserNotFound,
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("group not found")]
    GroupNotFound,
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Persists messages and reads history, gated on conversation participation
/// or group membership.
#[derive(Clone)]
pub struct MessagingService {
    users: Arc<dyn UserStore>,
    conversations: Arc<dyn ConversationStore>,
    groups: Arc<dyn GroupStore>,
    messages: Arc<dyn MessageStore>,
    hub: Hub,
}

impl MessagingService {
    pub fn new(stores: &Stores, hub: Hub) -> Self {
        Self {
            users: stores.users.clone(),
            conversations: stores.conversations.clone(),
            groups: stores.groups.clone(),
            messages: stores.messages.clone(),
            hub,
        }
    }

    /// Persist a conversation message and fan it out to both participants.
    /// The broadcast is only enqueued after the insert has committed.
    pub async fn send_conversation_message(
        &self,
        sender_id: Uuid,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Message, MessagingError> {
        self.publish(sender_id, MessageParent::conversation(conversation_id), content)
            .await
    }

    /// Persist a group message and fan it out to every member, the sender
    /// included.
    pub async fn send_group_message(
        &self,
        sender_id: Uuid,
        group_id: Uuid,
        content: &str,
    ) -> Result<Message, MessagingError> {
        self.publish(sender_id, MessageParent::group(group_id), content)
            .await
    }

    /// Route a socket send to the operation for its parent.
    pub async fn deliver(
        &self,
        sender_id: Uuid,
        parent: MessageParent,
        content: &str,
    ) -> Result<Message, MessagingError> {
        match parent {
            MessageParent::Conversation { conversation_id } => {
                self.send_conversation_message(sender_id, conversation_id, content)
                    .await
            }
            MessageParent::Group { group_id } => {
                self.send_group_message(sender_id, group_id, content).await
            }
        }
    }

    pub async fn conversation_history(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, MessagingError> {
        self.history(user_id, MessageParent::conversation(conversation_id), cursor, limit)
            .await
    }

    pub async fn group_history(
        &self,
        user_id: Uuid,
        group_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, MessagingError> {
        self.history(user_id, MessageParent::group(group_id), cursor, limit)
            .await
    }

    async fn publish(
        &self,
        sender_id: Uuid,
        parent: MessageParent,
        content: &str,
    ) -> Result<Message, MessagingError> {
        let (message, recipients) = self.send(sender_id, parent, content).await?;
        self.hub.broadcast_message(&message, recipients).await;
        debug!(message_id = %message.id, kind = message.kind().as_str(), "message delivered");
        Ok(message)
    }

    async fn send(
        &self,
        sender_id: Uuid,
        parent: MessageParent,
        content: &str,
    ) -> Result<(Message, Vec<Uuid>), MessagingError> {
        if content.trim().is_empty() {
            return Err(MessagingError::InvalidInput(EMPTY_CONTENT));
        }
        if self.users.find_user(sender_id).await?.is_none() {
            return Err(MessagingError::UserNotFound);
        }
        let recipients = self.authorize(sender_id, parent).await?;

        let message = Message::new(sender_id, parent, content, Utc::now().trunc_subsecs(6));
        self.messages.insert_message(&message).await?;
        Ok((message, recipients))
    }

    async fn history(
        &self,
        user_id: Uuid,
        parent: MessageParent,
        cursor: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, MessagingError> {
        self.authorize(user_id, parent).await?;
        let messages = self
            .messages
            .list_messages(parent, cursor, normalize_limit(limit))
            .await?;
        Ok(messages)
    }

    /// Existence first, then membership. Returns everyone entitled to see
    /// messages under `parent`.
    async fn authorize(
        &self,
        user_id: Uuid,
        parent: MessageParent,
    ) -> Result<Vec<Uuid>, MessagingError> {
        match parent {
            MessageParent::Conversation { conversation_id } => {
                let conversation = self
                    .conversations
                    .find_conversation(conversation_id)
                    .await?
                    .ok_or(MessagingError::ConversationNotFound)?;
                if !authz::is_conversation_participant(
                    self.conversations.as_ref(),
                    conversation_id,
                    user_id,
                )
                .await?
                {
                    return Err(MessagingError::Unauthorized(NOT_A_PARTICIPANT));
                }
                Ok(conversation.participants.to_vec())
            }
            MessageParent::Group { group_id } => {
                let group = self
                    .groups
                    .find_group(group_id)
                    .await?
                    .ok_or(MessagingError::GroupNotFound)?;
                if !authz::is_group_member(self.groups.as_ref(), group_id, user_id).await? {
                    return Err(MessagingError::Unauthorized(NOT_A_MEMBER));
                }
                Ok(group.members)
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub cursor: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn post_conversation_message(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    if !state.rate_limiter().check(user_id).await {
        return Err(ApiError::RateLimited);
    }
    let Path(conversation_id) = path?;
    let Json(request) = payload?;
    let message = state
        .messaging()
        .send_conversation_message(user_id, conversation_id, &request.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn conversation_messages(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let Path(conversation_id) = path?;
    let Query(query) = query?;
    let messages = state
        .messaging()
        .conversation_history(user_id, conversation_id, query.cursor, query.limit)
        .await?;
    Ok(Json(messages))
}

pub async fn post_group_message(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    if !state.rate_limiter().check(user_id).await {
        return Err(ApiError::RateLimited);
    }
    let Path(group_id) = path?;
    let Json(request) = payload?;
    let message = state
        .messaging()
        .send_group_message(user_id, group_id, &request.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn group_messages(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let Path(group_id) = path?;
    let Query(query) = query?;
    let messages = state
        .messaging()
        .group_history(user_id, group_id, query.cursor, query.limit)
        .await?;
    Ok(Json(messages))
}
