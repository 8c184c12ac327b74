use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use chrono::{SubsecRound, Utc};
use parley_core::Conversation;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::{
    error::ApiError,
    messaging::MessagingError,
    session::AuthUser,
    store::{ConversationStore, Stores, UserStore},
    AppState,
};

pub const SELF_CONVERSATION: &str = "cannot start a conversation with yourself";

#[derive(Clone)]
pub struct ConversationService {
    users: Arc<dyn UserStore>,
    conversations: Arc<dyn ConversationStore>,
}

impl ConversationService {
    pub fn new(stores: &Stores) -> Self {
        Self {
            users: stores.users.clone(),
            conversations: stores.conversations.clone(),
        }
    }

    /// Return the conversation between the two users, creating it on first use.
    pub async fn open(&self, user_id: Uuid, other_user_id: Uuid) -> Result<Conversation, MessagingError> {
        if user_id == other_user_id {
            return Err(MessagingError::InvalidInput(SELF_CONVERSATION));
        }
        if self.users.find_user(other_user_id).await?.is_none() {
            return Err(MessagingError::UserNotFound);
        }

        let conversation = self
            .conversations
            .find_or_create_conversation(user_id, other_user_id, Utc::now().trunc_subsecs(6))
            .await?;
        info!(conversation_id = %conversation.id, %user_id, %other_user_id, "conversation opened");
        Ok(conversation)
    }

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<Conversation>, MessagingError> {
        Ok(self.conversations.list_conversations_for_user(user_id).await?)
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenConversationRequest {
    pub other_user_id: Uuid,
}

pub async fn open_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<OpenConversationRequest>, JsonRejection>,
) -> Result<Json<Conversation>, ApiError> {
    let Json(request) = payload?;
    let conversation = state
        .conversations()
        .open(user_id, request.other_user_id)
        .await?;
    Ok(Json(conversation))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    Ok(Json(state.conversations().list(user_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewAccount;

    async fn user(stores: &Stores, name: &str) -> Uuid {
        stores
            .users
            .create_user(NewAccount {
                id: Uuid::new_v4(),
                username: name.into(),
                email: format!("{name}@x"),
                password_hash: "hash".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn open_is_idempotent_for_either_ordering() {
        let stores = Stores::in_memory();
        let service = ConversationService::new(&stores);
        let alice = user(&stores, "alice").await;
        let bob = user(&stores, "bob").await;

        let first = service.open(alice, bob).await.unwrap();
        let again = service.open(bob, alice).await.unwrap();
        assert_eq!(first.id, again.id);
        assert!(first.includes(alice) && first.includes(bob));

        assert_eq!(service.list(alice).await.unwrap().len(), 1);
        assert_eq!(service.list(bob).await.unwrap()[0].id, first.id);
    }

    #[tokio::test]
    async fn rejects_self_and_unknown_users() {
        let stores = Stores::in_memory();
        let service = ConversationService::new(&stores);
        let alice = user(&stores, "alice").await;

        assert!(matches!(
            service.open(alice, alice).await,
            Err(MessagingError::InvalidInput(SELF_CONVERSATION))
        ));
        assert!(matches!(
            service.open(alice, Uuid::new_v4()).await,
            Err(MessagingError::UserNotFound)
        ));
        assert!(service.list(alice).await.unwrap().is_empty());
    }
}
