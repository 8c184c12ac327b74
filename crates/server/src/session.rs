use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use parley_core::User;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    credentials::{TokenError, TokenSigner},
    error::{ApiError, FieldError},
    store::{NewAccount, NewRefreshToken, RefreshTokenStore, StoreError, UserStore},
    AppState,
};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user already exists")]
    UserAlreadyExists,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Invalid => AuthError::InvalidToken,
            TokenError::Expired => AuthError::TokenExpired,
            TokenError::Signing(_) => {
                AuthError::Storage(anyhow::Error::new(err).context("signing access token"))
            }
        }
    }
}

/// An access/refresh pair handed to a client.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCredentials {
    pub access_token: String,
    pub refresh_token: String,
}

/// Registration, login and refresh-token rotation.
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    signer: Arc<TokenSigner>,
    refresh_ttl: Duration,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        signer: TokenSigner,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            users,
            refresh_tokens,
            signer: Arc::new(signer),
            refresh_ttl,
        }
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<(User, IssuedCredentials), AuthError> {
        if self.users.find_account_by_username(username).await?.is_some() {
            return Err(AuthError::UserAlreadyExists);
        }
        if self.users.find_user_by_email(email).await?.is_some() {
            return Err(AuthError::UserAlreadyExists);
        }

        let password = password.to_owned();
        let password_hash =
            tokio::task::spawn_blocking(move || parley_crypto::hash_password(&password))
                .await
                .context("password hashing task failed")??;

        let account = NewAccount {
            id: Uuid::new_v4(),
            username: username.to_owned(),
            email: email.to_owned(),
            password_hash,
            created_at: Utc::now(),
        };
        let user = match self.users.create_user(account).await {
            Ok(user) => user,
            Err(StoreError::UsernameTaken | StoreError::EmailTaken) => {
                return Err(AuthError::UserAlreadyExists)
            }
            Err(StoreError::Backend(err)) => return Err(AuthError::Storage(err)),
        };
        info!(user_id = %user.id, username = %user.username, "user registered");

        let credentials = self.issue(user.id).await?;
        Ok((user, credentials))
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(User, IssuedCredentials), AuthError> {
        let Some(account) = self.users.find_account_by_username(username).await? else {
            return Err(AuthError::InvalidCredentials);
        };

        let candidate = password.to_owned();
        let stored = account.password_hash.clone();
        let verified =
            tokio::task::spawn_blocking(move || parley_crypto::verify_password(&candidate, &stored))
                .await
                .context("password verification task failed")??;
        if !verified {
            return Err(AuthError::InvalidCredentials);
        }

        self.revoke_best_effort(account.user.id).await;
        let credentials = self.issue(account.user.id).await?;
        info!(user_id = %account.user.id, "user logged in");
        Ok((account.user, credentials))
    }

    /// Exchange a refresh token for a new pair. The presented token and every
    /// sibling are revoked; an expired token revokes them too.
    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedCredentials, AuthError> {
        let Some(record) = self.refresh_tokens.find_refresh_token(refresh_token).await? else {
            return Err(AuthError::InvalidToken);
        };

        if record.is_expired_at(Utc::now()) {
            self.revoke_best_effort(record.user_id).await;
            return Err(AuthError::TokenExpired);
        }

        if self.users.find_user(record.user_id).await?.is_none() {
            self.revoke_best_effort(record.user_id).await;
            return Err(AuthError::InvalidToken);
        }

        self.revoke_best_effort(record.user_id).await;
        self.issue(record.user_id).await
    }

    /// Revoke every refresh token held by `user_id`. Idempotent.
    pub async fn logout(&self, user_id: Uuid) {
        self.revoke_best_effort(user_id).await;
        info!(%user_id, "user logged out");
    }

    /// Resolve an access token to its user id.
    pub fn authenticate(&self, access_token: &str) -> Result<Uuid, AuthError> {
        Ok(self.signer.validate_access(access_token)?)
    }

    async fn issue(&self, user_id: Uuid) -> Result<IssuedCredentials, AuthError> {
        let access_token = self.signer.issue_access(user_id)?;
        let refresh_token = self.signer.issue_refresh();

        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.refresh_ttl)
            .context("refresh token ttl out of range")?;
        self.refresh_tokens
            .insert_refresh_token(NewRefreshToken {
                id: Uuid::new_v4(),
                user_id,
                token: refresh_token.clone(),
                issued_at,
                expires_at: issued_at + ttl,
            })
            .await?;

        Ok(IssuedCredentials {
            access_token,
            refresh_token,
        })
    }

    async fn revoke_best_effort(&self, user_id: Uuid) {
        if let Err(err) = self
            .refresh_tokens
            .delete_refresh_tokens_for_user(user_id)
            .await
        {
            warn!(%user_id, error = ?err, "failed to revoke refresh tokens");
        }
    }
}

/// Extracts `Authorization: Bearer <token>` and resolves it to a user id.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;
        let user_id = state.auth().authenticate(token)?;
        Ok(AuthUser(user_id))
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
}

impl AuthResponse {
    fn new(user: User, credentials: IssuedCredentials) -> Self {
        Self {
            user,
            access_token: credentials.access_token,
            refresh_token: credentials.refresh_token,
        }
    }
}

#[derive(Debug)]
struct Registration {
    username: String,
    email: String,
    password: String,
}

fn validate_registration(request: RegisterRequest) -> Result<Registration, Vec<FieldError>> {
    let username = request.username.trim().to_owned();
    let email = request.email.trim().to_owned();
    let mut errors = Vec::new();

    let username_len = username.chars().count();
    if !(3..=50).contains(&username_len) {
        errors.push(FieldError::new(
            "username",
            "must be between 3 and 50 characters",
        ));
    }
    if !is_plausible_email(&email) {
        errors.push(FieldError::new("email", "must be a valid email address"));
    }
    if request.password.chars().count() < 8 {
        errors.push(FieldError::new(
            "password",
            "must be at least 8 characters",
        ));
    }

    if errors.is_empty() {
        Ok(Registration {
            username,
            email,
            password: request.password,
        })
    } else {
        Err(errors)
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}

fn validate_login(request: &LoginRequest) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();
    if request.username.trim().is_empty() {
        errors.push(FieldError::new("username", "must not be empty"));
    }
    if request.password.is_empty() {
        errors.push(FieldError::new("password", "must not be empty"));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub async fn register_handler(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    let Json(request) = payload?;
    let registration = validate_registration(request).map_err(ApiError::Validation)?;
    let (user, credentials) = state
        .auth()
        .register(
            &registration.username,
            &registration.email,
            &registration.password,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse::new(user, credentials)),
    ))
}

pub async fn login_handler(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, ApiError> {
    let Json(request) = payload?;
    validate_login(&request).map_err(ApiError::Validation)?;
    let (user, credentials) = state
        .auth()
        .login(request.username.trim(), &request.password)
        .await?;
    Ok(Json(AuthResponse::new(user, credentials)))
}

pub async fn refresh_handler(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<IssuedCredentials>, ApiError> {
    let Json(request) = payload?;
    if request.refresh_token.trim().is_empty() {
        return Err(ApiError::Validation(vec![FieldError::new(
            "refresh_token",
            "must not be empty",
        )]));
    }
    let credentials = state.auth().refresh(request.refresh_token.trim()).await?;
    Ok(Json(credentials))
}

pub async fn logout_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Json<Value> {
    state.auth().logout(user_id).await;
    Json(json!({ "status": "logged_out" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use axum::http::HeaderValue;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn service() -> (AuthService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let signer = TokenSigner::new(SECRET, Duration::from_secs(900));
        let service = AuthService::new(
            store.clone(),
            store.clone(),
            signer,
            Duration::from_secs(7 * 24 * 3600),
        );
        (service, store)
    }

    #[tokio::test]
    async fn register_then_login() {
        let (auth, store) = service();
        let (user, issued) = auth
            .register("alice", "a@x", "pw12345678")
            .await
            .expect("register");
        assert_eq!(auth.authenticate(&issued.access_token).unwrap(), user.id);
        assert_eq!(store.refresh_token_count(user.id).await, 1);

        let (logged_in, _) = auth.login("alice", "pw12345678").await.expect("login");
        assert_eq!(logged_in.id, user.id);
        // Login rotates out the registration token.
        assert_eq!(store.refresh_token_count(user.id).await, 1);
        assert!(matches!(
            auth.refresh(&issued.refresh_token).await,
            Err(AuthError::InvalidToken)
        ));

        assert!(matches!(
            auth.login("alice", "wrong").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.login("mallory", "pw12345678").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn duplicate_username_or_email_conflicts() {
        let (auth, _) = service();
        auth.register("alice", "a@x", "pw12345678").await.unwrap();

        assert!(matches!(
            auth.register("alice", "other@x", "pw12345678").await,
            Err(AuthError::UserAlreadyExists)
        ));
        assert!(matches!(
            auth.register("alicia", "a@x", "pw12345678").await,
            Err(AuthError::UserAlreadyExists)
        ));
    }

    #[tokio::test]
    async fn refresh_rotates_the_presented_token() {
        let (auth, store) = service();
        let (user, issued) = auth.register("bob", "b@x", "pw12345678").await.unwrap();

        let rotated = auth.refresh(&issued.refresh_token).await.expect("refresh");
        assert_ne!(rotated.refresh_token, issued.refresh_token);
        assert_eq!(auth.authenticate(&rotated.access_token).unwrap(), user.id);
        assert!(matches!(
            auth.refresh(&issued.refresh_token).await,
            Err(AuthError::InvalidToken)
        ));
        assert_eq!(store.refresh_token_count(user.id).await, 1);

        auth.refresh(&rotated.refresh_token).await.expect("second refresh");
    }

    #[tokio::test]
    async fn expired_refresh_revokes_siblings() {
        let (auth, store) = service();
        let (user, issued) = auth.register("carol", "c@x", "pw12345678").await.unwrap();

        let now = Utc::now();
        store
            .insert_refresh_token(NewRefreshToken {
                id: Uuid::new_v4(),
                user_id: user.id,
                token: "stale".into(),
                issued_at: now - chrono::Duration::days(8),
                expires_at: now - chrono::Duration::seconds(1),
            })
            .await
            .unwrap();
        assert_eq!(store.refresh_token_count(user.id).await, 2);

        assert!(matches!(
            auth.refresh("stale").await,
            Err(AuthError::TokenExpired)
        ));
        assert_eq!(store.refresh_token_count(user.id).await, 0);
        assert!(matches!(
            auth.refresh(&issued.refresh_token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn refresh_for_unknown_account_is_an_invalid_token() {
        let (auth, store) = service();
        let ghost = Uuid::new_v4();
        let now = Utc::now();
        store
            .insert_refresh_token(NewRefreshToken {
                id: Uuid::new_v4(),
                user_id: ghost,
                token: "orphaned".into(),
                issued_at: now,
                expires_at: now + chrono::Duration::days(1),
            })
            .await
            .unwrap();

        let err = auth.refresh("orphaned").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
        assert_eq!(ApiError::from(err).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(store.refresh_token_count(ghost).await, 0);
    }

    #[tokio::test]
    async fn logout_revokes_refresh_tokens() {
        let (auth, store) = service();
        let (user, issued) = auth.register("dave", "d@x", "pw12345678").await.unwrap();

        auth.logout(user.id).await;
        auth.logout(user.id).await;
        assert_eq!(store.refresh_token_count(user.id).await, 0);
        assert!(matches!(
            auth.refresh(&issued.refresh_token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn registration_validation_reports_each_field() {
        let errors = validate_registration(RegisterRequest {
            username: "  al ".into(),
            email: "a@b@c".into(),
            password: "short".into(),
        })
        .unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["username", "email", "password"]);

        let ok = validate_registration(RegisterRequest {
            username: "  alice ".into(),
            email: " a@x ".into(),
            password: "pw12345678".into(),
        })
        .unwrap();
        assert_eq!(ok.username, "alice");
        assert_eq!(ok.email, "a@x");
    }

    #[test]
    fn bearer_token_requires_scheme_and_value() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer   tok"));
        assert_eq!(bearer_token(&headers), Some("tok"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
