use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parley_core::Conversation;
use sqlx::FromRow;
use uuid::Uuid;

use crate::StoragePool;

/// Persistence for one-to-one conversations. Pairs are stored in canonical
/// order (`participant_a < participant_b`).
#[derive(Clone)]
pub struct ConversationRepository {
    pool: StoragePool,
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: Uuid,
    participant_a: Uuid,
    participant_b: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.id,
            participants: [row.participant_a, row.participant_b],
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl ConversationRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    /// Return the conversation for the unordered pair, creating it when absent.
    pub async fn find_or_create(
        &self,
        first: Uuid,
        second: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let (a, b) = Conversation::canonical_pair(first, second);

        let inserted = sqlx::query_as::<_, ConversationRow>(
            r#"
            INSERT INTO conversations (id, participant_a, participant_b, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (participant_a, participant_b) DO NOTHING
            RETURNING id, participant_a, participant_b, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(a)
        .bind(b)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("creating conversation between {a} and {b}"))?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }

        self.find_by_participants(a, b)
            .await?
            .with_context(|| format!("conversation between {a} and {b} vanished after conflict"))
    }

    pub async fn find(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT id, participant_a, participant_b, created_at, updated_at
            FROM conversations
            WHERE id = $1
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("querying conversation {conversation_id}"))?;

        Ok(row.map(Conversation::from))
    }

    pub async fn find_by_participants(
        &self,
        first: Uuid,
        second: Uuid,
    ) -> Result<Option<Conversation>> {
        let (a, b) = Conversation::canonical_pair(first, second);
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT id, participant_a, participant_b, created_at, updated_at
            FROM conversations
            WHERE participant_a = $1 AND participant_b = $2
            "#,
        )
        .bind(a)
        .bind(b)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("querying conversation between {a} and {b}"))?;

        Ok(row.map(Conversation::from))
    }

    /// Conversations the user takes part in, most recently active first.
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT id, participant_a, participant_b, created_at, updated_at
            FROM conversations
            WHERE participant_a = $1 OR participant_b = $1
            ORDER BY updated_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool.pool())
        .await
        .with_context(|| format!("listing conversations for {user_id}"))?;

        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    pub async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM conversations
                WHERE id = $1 AND (participant_a = $2 OR participant_b = $2)
            )
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(self.pool.pool())
        .await
        .with_context(|| format!("checking participation in conversation {conversation_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn unordered_pair_maps_to_one_conversation() -> anyhow::Result<()> {
        let Some(pool) = test_support::database().await? else {
            return Ok(());
        };
        let repo = ConversationRepository::new(pool.clone());
        let alice = test_support::seed_user(&pool, "conv_a").await?;
        let bob = test_support::seed_user(&pool, "conv_b").await?;
        let outsider = test_support::seed_user(&pool, "conv_c").await?;

        let first = repo.find_or_create(alice, bob, Utc::now()).await?;
        let second = repo.find_or_create(bob, alice, Utc::now()).await?;
        assert_eq!(first.id, second.id);
        assert!(first.includes(alice) && first.includes(bob));

        let by_pair = repo.find_by_participants(bob, alice).await?.expect("pair");
        assert_eq!(by_pair.id, first.id);
        assert!(repo.find_by_participants(alice, outsider).await?.is_none());

        assert!(repo.is_participant(first.id, alice).await?);
        assert!(!repo.is_participant(first.id, outsider).await?);
        assert!(!repo.is_participant(Uuid::new_v4(), alice).await?);

        let listed = repo.list_for_user(bob).await?;
        assert!(listed.iter().any(|conversation| conversation.id == first.id));
        assert!(repo.list_for_user(outsider).await?.is_empty());

        for user in [alice, bob, outsider] {
            sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(user)
                .execute(pool.pool())
                .await?;
        }
        Ok(())
    }
}
