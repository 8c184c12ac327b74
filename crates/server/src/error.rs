use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::{messaging::MessagingError, session::AuthError};

pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

impl FieldError {
    pub const fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

/// Boundary error: every handler failure becomes one of these, which renders
/// as a status code plus `{"error": ..}`.
#[derive(Debug)]
pub enum ApiError {
    Validation(Vec<FieldError>),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    RateLimited,
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Log the underlying failure once and hide it from the caller.
    pub fn internal(err: &anyhow::Error, context: &'static str) -> Self {
        error!(error = ?err, "{context}");
        ApiError::Internal
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::Validation(details) => ErrorBody {
                error: "validation_error".into(),
                details: Some(details),
            },
            ApiError::BadRequest(message)
            | ApiError::Unauthorized(message)
            | ApiError::Forbidden(message)
            | ApiError::NotFound(message)
            | ApiError::Conflict(message) => ErrorBody {
                error: message,
                details: None,
            },
            ApiError::RateLimited => ErrorBody {
                error: "rate limit exceeded".into(),
                details: None,
            },
            ApiError::Internal => ErrorBody {
                error: INTERNAL_ERROR_MESSAGE.into(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::UserAlreadyExists => ApiError::Conflict(err.to_string()),
            AuthError::InvalidCredentials | AuthError::InvalidToken | AuthError::TokenExpired => {
                ApiError::Unauthorized(err.to_string())
            }
            AuthError::Storage(inner) => ApiError::internal(&inner, "authentication failed"),
        }
    }
}

impl From<MessagingError> for ApiError {
    fn from(err: MessagingError) -> Self {
        match err {
            MessagingError::InvalidInput(_) => ApiError::BadRequest(err.to_string()),
            MessagingError::UserNotFound
            | MessagingError::ConversationNotFound
            | MessagingError::GroupNotFound => ApiError::NotFound(err.to_string()),
            MessagingError::Unauthorized(_) | MessagingError::Forbidden(_) => {
                ApiError::Forbidden(err.to_string())
            }
            MessagingError::Storage(inner) => ApiError::internal(&inner, "messaging failed"),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::{json, Value};

    async fn render(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn validation_errors_carry_details() {
        let (status, body) = render(ApiError::Validation(vec![FieldError::new(
            "username",
            "must be between 3 and 50 characters",
        )]))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({
                "error": "validation_error",
                "details": [{"field": "username", "message": "must be between 3 and 50 characters"}]
            })
        );
    }

    #[tokio::test]
    async fn storage_failures_are_opaque() {
        let err = MessagingError::Storage(anyhow::anyhow!("connection reset by peer"));
        let (status, body) = render(err.into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": INTERNAL_ERROR_MESSAGE}));
    }

    #[tokio::test]
    async fn domain_errors_map_to_status_codes() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (AuthError::UserAlreadyExists.into(), StatusCode::CONFLICT),
            (AuthError::InvalidCredentials.into(), StatusCode::UNAUTHORIZED),
            (AuthError::TokenExpired.into(), StatusCode::UNAUTHORIZED),
            (MessagingError::ConversationNotFound.into(), StatusCode::NOT_FOUND),
            (
                MessagingError::Unauthorized("not a member of this group").into(),
                StatusCode::FORBIDDEN,
            ),
            (ApiError::RateLimited, StatusCode::TOO_MANY_REQUESTS),
        ];
        for (err, expected) in cases {
            let (status, body) = render(err).await;
            assert_eq!(status, expected);
            assert!(body["error"].is_string());
        }
    }
}
