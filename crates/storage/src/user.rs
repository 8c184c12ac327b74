use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use parley_core::User;
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

use crate::StoragePool;

/// Repository utilities for user persistence.
#[derive(Clone)]
pub struct UserRepository {
    pool: StoragePool,
}

#[derive(Debug, Error)]
pub enum CreateUserError {
    #[error("username already exists")]
    UsernameTaken,
    #[error("email already exists")]
    EmailTaken,
    #[error("failed to create user: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A user row including its password hash. Convert with [`UserRecord::into_user`]
/// before handing it to anything that serializes.
#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn into_user(self) -> User {
        User {
            id: self.id,
            username: self.username,
            email: self.email,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

const USER_COLUMNS: &str = "id, username, email, password_hash, created_at, updated_at";

impl UserRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn create_user(&self, user: &NewUser) -> Result<UserRecord, CreateUserError> {
        sqlx::query_as::<_, UserRecord>(&format!(
            r#"
            INSERT INTO users (id, username, email, password_hash, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if db_err.constraint() == Some("users_username_key") => {
                CreateUserError::UsernameTaken
            }
            sqlx::Error::Database(db_err) if db_err.constraint() == Some("users_email_key") => {
                CreateUserError::EmailTaken
            }
            other => CreateUserError::Other(
                anyhow!(other).context(format!("creating user '{}'", user.username)),
            ),
        })
    }

    pub async fn find_by_id(&self, user_id: Uuid) -> Result<Option<UserRecord>> {
        sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("querying user {user_id}"))
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("querying user '{username}'"))
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| "querying user by email")
    }

    /// Every user except `user_id`, ordered by username.
    pub async fn list_except(&self, user_id: Uuid) -> Result<Vec<UserRecord>> {
        sqlx::query_as::<_, UserRecord>(&format!(
            r#"
            SELECT {USER_COLUMNS}
            FROM users
            WHERE id <> $1
            ORDER BY username ASC
            "#
        ))
        .bind(user_id)
        .fetch_all(self.pool.pool())
        .await
        .with_context(|| "listing users")
    }
}
