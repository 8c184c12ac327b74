use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use parley_core::{Message, MessageParent};
use sqlx::FromRow;
use uuid::Uuid;

use crate::StoragePool;

#[derive(Clone)]
pub struct MessageRepository {
    pool: StoragePool,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    sender_id: Uuid,
    kind: String,
    conversation_id: Option<Uuid>,
    group_id: Option<Uuid>,
    content: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let parent = match (row.kind.as_str(), row.conversation_id, row.group_id) {
            ("conversation", Some(conversation_id), None) => {
                MessageParent::conversation(conversation_id)
            }
            ("group", None, Some(group_id)) => MessageParent::group(group_id),
            (kind, _, _) => bail!("message {} has inconsistent parent (kind '{kind}')", row.id),
        };

        Ok(Message {
            id: row.id,
            sender_id: row.sender_id,
            parent,
            content: row.content,
            created_at: row.created_at,
        })
    }
}

impl MessageRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    /// Persist the message and move its parent's `updated_at` forward to the
    /// message timestamp, atomically. An older message never moves it back.
    pub async fn insert(&self, message: &Message) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| "beginning message transaction")?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, sender_id, kind, conversation_id, group_id, content, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(message.id)
        .bind(message.sender_id)
        .bind(message.kind().as_str())
        .bind(message.parent.conversation_id())
        .bind(message.parent.group_id())
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting message {}", message.id))?;

        let bump = match message.parent {
            MessageParent::Conversation { .. } => {
                "UPDATE conversations SET updated_at = GREATEST(updated_at, $2) WHERE id = $1"
            }
            MessageParent::Group { .. } => {
                "UPDATE groups SET updated_at = GREATEST(updated_at, $2) WHERE id = $1"
            }
        };
        let result = sqlx::query(bump)
            .bind(message.parent.id())
            .bind(message.created_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("bumping parent of message {}", message.id))?;
        if result.rows_affected() != 1 {
            return Err(anyhow!("parent {} of message {} not found", message.parent.id(), message.id));
        }

        tx.commit()
            .await
            .with_context(|| "committing message transaction")
    }

    pub async fn find(&self, message_id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, sender_id, kind, conversation_id, group_id, content, created_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("querying message {message_id}"))?;

        row.map(Message::try_from).transpose()
    }

    /// One page of a parent's history, newest first, strictly older than `before`.
    pub async fn list_for_parent(
        &self,
        parent: MessageParent,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let column = match parent {
            MessageParent::Conversation { .. } => "conversation_id",
            MessageParent::Group { .. } => "group_id",
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT id, sender_id, kind, conversation_id, group_id, content, created_at
            FROM messages
            WHERE {column} = $1
              AND ($2::timestamptz IS NULL OR created_at < $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#
        ))
        .bind(parent.id())
        .bind(before)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .with_context(|| format!("listing history for {}", parent.id()))?;

        rows.into_iter().map(Message::try_from).collect()
    }
}
