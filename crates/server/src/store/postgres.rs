use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{Conversation, Group, Message, MessageParent, User};
use parley_storage::{
    ConversationRepository, CreateUserError, GroupRepository, MessageRepository, NewUser,
    RefreshTokenRepository, StoragePool, UserRepository,
};
use uuid::Uuid;

use super::{
    Account, ConversationStore, GroupStore, MessageStore, NewAccount, NewRefreshToken,
    RefreshTokenRecord, RefreshTokenStore, StoreError, UserStore,
};

pub struct PostgresStore {
    users: UserRepository,
    refresh_tokens: RefreshTokenRepository,
    conversations: ConversationRepository,
    groups: GroupRepository,
    messages: MessageRepository,
}

impl PostgresStore {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            refresh_tokens: RefreshTokenRepository::new(pool.clone()),
            conversations: ConversationRepository::new(pool.clone()),
            groups: GroupRepository::new(pool.clone()),
            messages: MessageRepository::new(pool),
        }
    }
}

#[async_trait]
impl UserStore for PostgresStore {
    async fn create_user(&self, account: NewAccount) -> Result<User, StoreError> {
        let new_user = NewUser {
            id: account.id,
            username: account.username,
            email: account.email,
            password_hash: account.password_hash,
            created_at: account.created_at,
        };
        match self.users.create_user(&new_user).await {
            Ok(record) => Ok(record.into_user()),
            Err(CreateUserError::UsernameTaken) => Err(StoreError::UsernameTaken),
            Err(CreateUserError::EmailTaken) => Err(StoreError::EmailTaken),
            Err(CreateUserError::Other(err)) => Err(StoreError::Backend(err)),
        }
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self.users.find_by_id(user_id).await?.map(|r| r.into_user()))
    }

    async fn find_account_by_username(&self, username: &str) -> Result<Option<Account>> {
        Ok(self
            .users
            .find_by_username(username)
            .await?
            .map(|record| {
                let password_hash = record.password_hash.clone();
                Account {
                    user: record.into_user(),
                    password_hash,
                }
            }))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self.users.find_by_email(email).await?.map(|r| r.into_user()))
    }

    async fn list_users_except(&self, user_id: Uuid) -> Result<Vec<User>> {
        Ok(self
            .users
            .list_except(user_id)
            .await?
            .into_iter()
            .map(|record| record.into_user())
            .collect())
    }
}

#[async_trait]
impl RefreshTokenStore for PostgresStore {
    async fn insert_refresh_token(&self, token: NewRefreshToken) -> Result<RefreshTokenRecord> {
        self.refresh_tokens.insert(&token).await
    }

    async fn find_refresh_token(&self, token: &str) -> Result<Option<RefreshTokenRecord>> {
        self.refresh_tokens.find(token).await
    }

    async fn delete_refresh_tokens_for_user(&self, user_id: Uuid) -> Result<u64> {
        self.refresh_tokens.delete_for_user(user_id).await
    }

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        self.refresh_tokens.delete_expired(now).await
    }
}

#[async_trait]
impl ConversationStore for PostgresStore {
    async fn find_or_create_conversation(
        &self,
        first: Uuid,
        second: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        self.conversations.find_or_create(first, second, now).await
    }

    async fn find_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        self.conversations.find(conversation_id).await
    }

    async fn find_conversation_by_participants(
        &self,
        first: Uuid,
        second: Uuid,
    ) -> Result<Option<Conversation>> {
        self.conversations.find_by_participants(first, second).await
    }

    async fn list_conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        self.conversations.list_for_user(user_id).await
    }

    async fn is_conversation_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool> {
        self.conversations
            .is_participant(conversation_id, user_id)
            .await
    }
}

#[async_trait]
impl GroupStore for PostgresStore {
    async fn create_group(
        &self,
        name: &str,
        created_by: Uuid,
        members: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Group> {
        self.groups.create(name, created_by, members, now).await
    }

    async fn find_group(&self, group_id: Uuid) -> Result<Option<Group>> {
        self.groups.find(group_id).await
    }

    async fn list_groups_for_user(&self, user_id: Uuid) -> Result<Vec<Group>> {
        self.groups.list_for_user(user_id).await
    }

    async fn is_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.groups.is_member(group_id, user_id).await
    }

    async fn is_group_creator(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.groups.is_creator(group_id, user_id).await
    }

    async fn add_group_member(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.groups.add_member(group_id, user_id, now).await
    }

    async fn remove_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.groups.remove_member(group_id, user_id).await
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    async fn insert_message(&self, message: &Message) -> Result<()> {
        self.messages.insert(message).await
    }

    async fn find_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        self.messages.find(message_id).await
    }

    async fn list_messages(
        &self,
        parent: MessageParent,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.messages.list_for_parent(parent, before, limit).await
    }
}
