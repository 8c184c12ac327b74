use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{page_newest_first, Conversation, Group, Message, MessageParent, User};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    Account, ConversationStore, GroupStore, MessageStore, NewAccount, NewRefreshToken,
    RefreshTokenRecord, RefreshTokenStore, StoreError, UserStore,
};

/// Process-local backend. All entities sit behind one lock so multi-entity
/// writes (message insert plus parent bump) are atomic.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    refresh_tokens: HashMap<String, RefreshTokenRecord>,
    conversations: HashMap<Uuid, Conversation>,
    conversation_pairs: HashMap<(Uuid, Uuid), Uuid>,
    groups: HashMap<Uuid, Group>,
    messages: HashMap<Uuid, Message>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn refresh_token_count(&self, user_id: Uuid) -> usize {
        self.state
            .read()
            .await
            .refresh_tokens
            .values()
            .filter(|record| record.user_id == user_id)
            .count()
    }
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn create_user(&self, account: NewAccount) -> Result<User, StoreError> {
        let mut state = self.state.write().await;
        if state
            .accounts
            .values()
            .any(|existing| existing.user.username == account.username)
        {
            return Err(StoreError::UsernameTaken);
        }
        if state
            .accounts
            .values()
            .any(|existing| existing.user.email == account.email)
        {
            return Err(StoreError::EmailTaken);
        }

        let user = User {
            id: account.id,
            username: account.username,
            email: account.email,
            created_at: account.created_at,
            updated_at: account.created_at,
        };
        state.accounts.insert(
            user.id,
            Account {
                user: user.clone(),
                password_hash: account.password_hash,
            },
        );
        Ok(user)
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let state = self.state.read().await;
        Ok(state.accounts.get(&user_id).map(|account| account.user.clone()))
    }

    async fn find_account_by_username(&self, username: &str) -> Result<Option<Account>> {
        let state = self.state.read().await;
        Ok(state
            .accounts
            .values()
            .find(|account| account.user.username == username)
            .cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let state = self.state.read().await;
        Ok(state
            .accounts
            .values()
            .find(|account| account.user.email == email)
            .map(|account| account.user.clone()))
    }

    async fn list_users_except(&self, user_id: Uuid) -> Result<Vec<User>> {
        let state = self.state.read().await;
        let mut users: Vec<User> = state
            .accounts
            .values()
            .filter(|account| account.user.id != user_id)
            .map(|account| account.user.clone())
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryStore {
    async fn insert_refresh_token(&self, token: NewRefreshToken) -> Result<RefreshTokenRecord> {
        let mut state = self.state.write().await;
        if !state.accounts.contains_key(&token.user_id) {
            return Err(anyhow!("user {} does not exist", token.user_id));
        }
        if state.refresh_tokens.contains_key(&token.token) {
            return Err(anyhow!("refresh token already stored"));
        }
        let record = RefreshTokenRecord {
            id: token.id,
            user_id: token.user_id,
            token: token.token,
            expires_at: token.expires_at,
            created_at: token.issued_at,
        };
        state
            .refresh_tokens
            .insert(record.token.clone(), record.clone());
        Ok(record)
    }

    async fn find_refresh_token(&self, token: &str) -> Result<Option<RefreshTokenRecord>> {
        Ok(self.state.read().await.refresh_tokens.get(token).cloned())
    }

    async fn delete_refresh_tokens_for_user(&self, user_id: Uuid) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.refresh_tokens.len();
        state
            .refresh_tokens
            .retain(|_, record| record.user_id != user_id);
        Ok((before - state.refresh_tokens.len()) as u64)
    }

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.refresh_tokens.len();
        state
            .refresh_tokens
            .retain(|_, record| !record.is_expired_at(now));
        Ok((before - state.refresh_tokens.len()) as u64)
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn find_or_create_conversation(
        &self,
        first: Uuid,
        second: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let pair = Conversation::canonical_pair(first, second);
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .conversation_pairs
            .get(&pair)
            .and_then(|id| state.conversations.get(id))
        {
            return Ok(existing.clone());
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            participants: [pair.0, pair.1],
            created_at: now,
            updated_at: now,
        };
        state.conversation_pairs.insert(pair, conversation.id);
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn find_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        Ok(self
            .state
            .read()
            .await
            .conversations
            .get(&conversation_id)
            .cloned())
    }

    async fn find_conversation_by_participants(
        &self,
        first: Uuid,
        second: Uuid,
    ) -> Result<Option<Conversation>> {
        let pair = Conversation::canonical_pair(first, second);
        let state = self.state.read().await;
        Ok(state
            .conversation_pairs
            .get(&pair)
            .and_then(|id| state.conversations.get(id))
            .cloned())
    }

    async fn list_conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let state = self.state.read().await;
        let mut conversations: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|conversation| conversation.includes(user_id))
            .cloned()
            .collect();
        conversations.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(conversations)
    }

    async fn is_conversation_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .conversations
            .get(&conversation_id)
            .is_some_and(|conversation| conversation.includes(user_id)))
    }
}

#[async_trait]
impl GroupStore for InMemoryStore {
    async fn create_group(
        &self,
        name: &str,
        created_by: Uuid,
        members: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Group> {
        let mut unique = Vec::with_capacity(members.len());
        for member in members {
            if !unique.contains(member) {
                unique.push(*member);
            }
        }

        let group = Group {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_by,
            members: unique,
            created_at: now,
            updated_at: now,
        };
        self.state
            .write()
            .await
            .groups
            .insert(group.id, group.clone());
        Ok(group)
    }

    async fn find_group(&self, group_id: Uuid) -> Result<Option<Group>> {
        Ok(self.state.read().await.groups.get(&group_id).cloned())
    }

    async fn list_groups_for_user(&self, user_id: Uuid) -> Result<Vec<Group>> {
        let state = self.state.read().await;
        let mut groups: Vec<Group> = state
            .groups
            .values()
            .filter(|group| group.is_member(user_id))
            .cloned()
            .collect();
        groups.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(groups)
    }

    async fn is_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .groups
            .get(&group_id)
            .is_some_and(|group| group.is_member(user_id)))
    }

    async fn is_group_creator(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .groups
            .get(&group_id)
            .is_some_and(|group| group.is_creator(user_id)))
    }

    async fn add_group_member(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let group = state
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| anyhow!("group {group_id} does not exist"))?;
        if !group.is_member(user_id) {
            group.members.push(user_id);
        }
        Ok(())
    }

    async fn remove_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(group) = state.groups.get_mut(&group_id) else {
            return Ok(false);
        };
        let before = group.members.len();
        group.members.retain(|member| *member != user_id);
        Ok(group.members.len() != before)
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn insert_message(&self, message: &Message) -> Result<()> {
        let mut state = self.state.write().await;
        match message.parent {
            MessageParent::Conversation { conversation_id } => {
                let conversation = state
                    .conversations
                    .get_mut(&conversation_id)
                    .ok_or_else(|| anyhow!("conversation {conversation_id} does not exist"))?;
                conversation.updated_at = conversation.updated_at.max(message.created_at);
            }
            MessageParent::Group { group_id } => {
                let group = state
                    .groups
                    .get_mut(&group_id)
                    .ok_or_else(|| anyhow!("group {group_id} does not exist"))?;
                group.updated_at = group.updated_at.max(message.created_at);
            }
        }
        state.messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn find_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        Ok(self.state.read().await.messages.get(&message_id).cloned())
    }

    async fn list_messages(
        &self,
        parent: MessageParent,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        let candidates = state
            .messages
            .values()
            .filter(|message| message.parent == parent)
            .cloned();
        Ok(page_newest_first(candidates, before, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn account(store: &InMemoryStore, username: &str) -> User {
        store
            .create_user(NewAccount {
                id: Uuid::new_v4(),
                username: username.to_string(),
                email: format!("{username}@example.org"),
                password_hash: "hash".into(),
                created_at: Utc::now(),
            })
            .await
            .expect("user created")
    }

    #[tokio::test]
    async fn duplicate_username_then_email_are_reported() {
        let store = InMemoryStore::new();
        account(&store, "alice").await;

        let same_name = store
            .create_user(NewAccount {
                id: Uuid::new_v4(),
                username: "alice".into(),
                email: "other@example.org".into(),
                password_hash: "hash".into(),
                created_at: Utc::now(),
            })
            .await;
        assert!(matches!(same_name, Err(StoreError::UsernameTaken)));

        let same_email = store
            .create_user(NewAccount {
                id: Uuid::new_v4(),
                username: "alice2".into(),
                email: "alice@example.org".into(),
                password_hash: "hash".into(),
                created_at: Utc::now(),
            })
            .await;
        assert!(matches!(same_email, Err(StoreError::EmailTaken)));
    }

    #[tokio::test]
    async fn conversation_pair_is_unordered() {
        let store = InMemoryStore::new();
        let alice = account(&store, "alice").await;
        let bob = account(&store, "bob").await;

        let first = store
            .find_or_create_conversation(alice.id, bob.id, Utc::now())
            .await
            .unwrap();
        let second = store
            .find_or_create_conversation(bob.id, alice.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(
            store
                .find_conversation_by_participants(bob.id, alice.id)
                .await
                .unwrap()
                .map(|c| c.id),
            Some(first.id)
        );
    }

    #[tokio::test]
    async fn message_insert_bumps_parent_updated_at() {
        let store = InMemoryStore::new();
        let alice = account(&store, "alice").await;
        let bob = account(&store, "bob").await;
        let created = Utc::now();
        let conversation = store
            .find_or_create_conversation(alice.id, bob.id, created)
            .await
            .unwrap();

        let message = Message::new(
            alice.id,
            MessageParent::conversation(conversation.id),
            "hello",
            created + Duration::seconds(5),
        );
        store.insert_message(&message).await.unwrap();

        let bumped = store
            .find_conversation(conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bumped.updated_at, message.created_at);
        assert_eq!(
            store.find_message(message.id).await.unwrap(),
            Some(message)
        );
    }

    #[tokio::test]
    async fn out_of_order_commits_never_move_updated_at_backwards() {
        let store = InMemoryStore::new();
        let alice = account(&store, "alice").await;
        let bob = account(&store, "bob").await;
        let t0 = Utc::now();
        let conversation = store
            .find_or_create_conversation(alice.id, bob.id, t0)
            .await
            .unwrap();
        let group = store
            .create_group("team", alice.id, &[alice.id, bob.id], t0)
            .await
            .unwrap();

        for parent in [
            MessageParent::conversation(conversation.id),
            MessageParent::group(group.id),
        ] {
            let later = Message::new(alice.id, parent, "later", t0 + Duration::seconds(2));
            let earlier = Message::new(bob.id, parent, "earlier", t0 + Duration::seconds(1));
            store.insert_message(&later).await.unwrap();
            store.insert_message(&earlier).await.unwrap();

            let updated_at = match parent {
                MessageParent::Conversation { conversation_id } => {
                    store.find_conversation(conversation_id).await.unwrap().unwrap().updated_at
                }
                MessageParent::Group { group_id } => {
                    store.find_group(group_id).await.unwrap().unwrap().updated_at
                }
            };
            assert_eq!(updated_at, later.created_at);
        }
    }

    #[tokio::test]
    async fn message_for_missing_parent_is_not_stored() {
        let store = InMemoryStore::new();
        let alice = account(&store, "alice").await;
        let orphan = Message::new(alice.id, MessageParent::group(Uuid::new_v4()), "x", Utc::now());
        assert!(store.insert_message(&orphan).await.is_err());
        assert!(store.find_message(orphan.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_tokens_sweep_and_per_user_delete() {
        let store = InMemoryStore::new();
        let alice = account(&store, "alice").await;
        let now = Utc::now();
        for (token, expires_at) in [
            ("live", now + Duration::days(1)),
            ("stale", now - Duration::seconds(1)),
        ] {
            store
                .insert_refresh_token(NewRefreshToken {
                    id: Uuid::new_v4(),
                    user_id: alice.id,
                    token: token.into(),
                    issued_at: now,
                    expires_at,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.delete_expired_refresh_tokens(now).await.unwrap(), 1);
        assert!(store.find_refresh_token("stale").await.unwrap().is_none());
        assert_eq!(
            store.delete_refresh_tokens_for_user(alice.id).await.unwrap(),
            1
        );
        assert_eq!(store.refresh_token_count(alice.id).await, 0);
    }

    #[tokio::test]
    async fn group_membership_changes_are_idempotent() {
        let store = InMemoryStore::new();
        let alice = account(&store, "alice").await;
        let bob = account(&store, "bob").await;
        let group = store
            .create_group("team", alice.id, &[alice.id, bob.id, bob.id], Utc::now())
            .await
            .unwrap();
        assert_eq!(group.members, vec![alice.id, bob.id]);

        store
            .add_group_member(group.id, bob.id, Utc::now())
            .await
            .unwrap();
        assert!(store.remove_group_member(group.id, bob.id).await.unwrap());
        assert!(!store.remove_group_member(group.id, bob.id).await.unwrap());
        assert!(!store.is_group_member(group.id, bob.id).await.unwrap());
        assert!(store.is_group_creator(group.id, alice.id).await.unwrap());
    }
}
