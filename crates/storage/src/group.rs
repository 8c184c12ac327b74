use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parley_core::Group;
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use crate::StoragePool;

#[derive(Clone)]
pub struct GroupRepository {
    pool: StoragePool,
}

#[derive(Debug, FromRow)]
struct GroupRow {
    id: Uuid,
    name: String,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GroupRow {
    fn with_members(self, members: Vec<Uuid>) -> Group {
        Group {
            id: self.id,
            name: self.name,
            created_by: self.created_by,
            members,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl GroupRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    /// Insert the group and its initial membership in one transaction.
    /// `members` should already contain the creator.
    pub async fn create(
        &self,
        name: &str,
        created_by: Uuid,
        members: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Group> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| "beginning group transaction")?;

        let row = sqlx::query_as::<_, GroupRow>(
            r#"
            INSERT INTO groups (id, name, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            RETURNING id, name, created_by, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(created_by)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("creating group '{name}'"))?;

        for member in members {
            insert_member(&mut tx, row.id, *member, now).await?;
        }

        tx.commit()
            .await
            .with_context(|| "committing group transaction")?;

        Ok(row.with_members(members.to_vec()))
    }

    pub async fn find(&self, group_id: Uuid) -> Result<Option<Group>> {
        let row = sqlx::query_as::<_, GroupRow>(
            r#"
            SELECT id, name, created_by, created_at, updated_at
            FROM groups
            WHERE id = $1
            "#,
        )
        .bind(group_id)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("querying group {group_id}"))?;

        match row {
            Some(row) => {
                let members = self.members(row.id).await?;
                Ok(Some(row.with_members(members)))
            }
            None => Ok(None),
        }
    }

    pub async fn members(&self, group_id: Uuid) -> Result<Vec<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT user_id
            FROM group_members
            WHERE group_id = $1
            ORDER BY joined_at ASC, user_id ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(self.pool.pool())
        .await
        .with_context(|| format!("listing members of group {group_id}"))
    }

    /// Groups the user belongs to, most recently active first.
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Group>> {
        let rows = sqlx::query_as::<_, GroupRow>(
            r#"
            SELECT g.id, g.name, g.created_by, g.created_at, g.updated_at
            FROM groups g
            JOIN group_members m ON m.group_id = g.id
            WHERE m.user_id = $1
            ORDER BY g.updated_at DESC, g.id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool.pool())
        .await
        .with_context(|| format!("listing groups for {user_id}"))?;

        let mut groups = Vec::with_capacity(rows.len());
        for row in rows {
            let members = self.members(row.id).await?;
            groups.push(row.with_members(members));
        }
        Ok(groups)
    }

    pub async fn is_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM group_members WHERE group_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_one(self.pool.pool())
        .await
        .with_context(|| format!("checking membership in group {group_id}"))
    }

    pub async fn is_creator(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM groups WHERE id = $1 AND created_by = $2)",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_one(self.pool.pool())
        .await
        .with_context(|| format!("checking creator of group {group_id}"))
    }

    /// Add a member; adding an existing member is a no-op.
    pub async fn add_member(&self, group_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_members (group_id, user_id, joined_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (group_id, user_id) DO NOTHING
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .with_context(|| format!("adding {user_id} to group {group_id}"))?;
        Ok(())
    }

    /// Remove a member, returning whether a row was deleted.
    pub async fn remove_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM group_members WHERE group_id = $1 AND user_id = $2")
            .bind(group_id)
            .bind(user_id)
            .execute(self.pool.pool())
            .await
            .with_context(|| format!("removing {user_id} from group {group_id}"))?;
        Ok(result.rows_affected() > 0)
    }
}

async fn insert_member(
    tx: &mut Transaction<'_, Postgres>,
    group_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO group_members (group_id, user_id, joined_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (group_id, user_id) DO NOTHING
        "#,
    )
    .bind(group_id)
    .bind(user_id)
    .bind(now)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("adding {user_id} to group {group_id}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn group_membership_lifecycle() -> anyhow::Result<()> {
        let Some(pool) = test_support::database().await? else {
            return Ok(());
        };
        let repo = GroupRepository::new(pool.clone());
        let alice = test_support::seed_user(&pool, "grp_a").await?;
        let bob = test_support::seed_user(&pool, "grp_b").await?;
        let carol = test_support::seed_user(&pool, "grp_c").await?;

        let group = repo.create("team", alice, &[alice, bob], Utc::now()).await?;
        assert_eq!(group.members, vec![alice, bob]);
        assert!(repo.is_creator(group.id, alice).await?);
        assert!(!repo.is_creator(group.id, bob).await?);

        repo.add_member(group.id, carol, Utc::now()).await?;
        repo.add_member(group.id, carol, Utc::now()).await?;
        let loaded = repo.find(group.id).await?.expect("group exists");
        assert_eq!(loaded.members.len(), 3);
        assert!(loaded.is_member(carol));

        assert!(repo.remove_member(group.id, bob).await?);
        assert!(!repo.remove_member(group.id, bob).await?);
        assert!(!repo.is_member(group.id, bob).await?);

        let carols = repo.list_for_user(carol).await?;
        assert!(carols.iter().any(|candidate| candidate.id == group.id));
        assert!(repo.find(Uuid::new_v4()).await?.is_none());

        for user in [alice, bob, carol] {
            sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(user)
                .execute(pool.pool())
                .await?;
        }
        Ok(())
    }
}
