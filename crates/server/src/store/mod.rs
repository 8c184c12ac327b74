//! Repository capabilities the services depend on.
//!
//! Each trait has a Postgres implementation backed by `parley-storage` and an
//! in-process implementation used when no database is configured.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{Conversation, Group, Message, MessageParent, User};
use parley_storage::StoragePool;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use parley_storage::{NewRefreshToken, RefreshTokenRecord};
pub use postgres::PostgresStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username already exists")]
    UsernameTaken,
    #[error("email already exists")]
    EmailTaken,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A user together with the stored password hash. Only the authentication
/// service sees this type.
#[derive(Debug, Clone)]
pub struct Account {
    pub user: User,
    pub password_hash: String,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, account: NewAccount) -> Result<User, StoreError>;
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>>;
    async fn find_account_by_username(&self, username: &str) -> Result<Option<Account>>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn list_users_except(&self, user_id: Uuid) -> Result<Vec<User>>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert_refresh_token(&self, token: NewRefreshToken) -> Result<RefreshTokenRecord>;
    async fn find_refresh_token(&self, token: &str) -> Result<Option<RefreshTokenRecord>>;
    async fn delete_refresh_tokens_for_user(&self, user_id: Uuid) -> Result<u64>;
    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_or_create_conversation(
        &self,
        first: Uuid,
        second: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Conversation>;
    async fn find_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>>;
    async fn find_conversation_by_participants(
        &self,
        first: Uuid,
        second: Uuid,
    ) -> Result<Option<Conversation>>;
    async fn list_conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>>;
    async fn is_conversation_participant(&self, conversation_id: Uuid, user_id: Uuid)
        -> Result<bool>;
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn create_group(
        &self,
        name: &str,
        created_by: Uuid,
        members: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Group>;
    async fn find_group(&self, group_id: Uuid) -> Result<Option<Group>>;
    async fn list_groups_for_user(&self, user_id: Uuid) -> Result<Vec<Group>>;
    async fn is_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool>;
    async fn is_group_creator(&self, group_id: Uuid, user_id: Uuid) -> Result<bool>;
    async fn add_group_member(&self, group_id: Uuid, user_id: Uuid, now: DateTime<Utc>)
        -> Result<()>;
    async fn remove_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist the message and set its parent's `updated_at` to the message
    /// timestamp in one atomic step.
    async fn insert_message(&self, message: &Message) -> Result<()>;
    async fn find_message(&self, message_id: Uuid) -> Result<Option<Message>>;
    async fn list_messages(
        &self,
        parent: MessageParent,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>>;
}

/// The full set of repositories, wired to one backend.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub refresh_tokens: Arc<dyn RefreshTokenStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub groups: Arc<dyn GroupStore>,
    pub messages: Arc<dyn MessageStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(InMemoryStore::new()))
    }

    pub fn postgres(pool: StoragePool) -> Self {
        Self::from_backend(Arc::new(PostgresStore::new(pool)))
    }

    fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: UserStore + RefreshTokenStore + ConversationStore + GroupStore + MessageStore + 'static,
    {
        Self {
            users: backend.clone(),
            refresh_tokens: backend.clone(),
            conversations: backend.clone(),
            groups: backend.clone(),
            messages: backend,
        }
    }
}
