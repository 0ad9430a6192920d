use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use duolog_core::{CoreError, PreconditionError, TokenError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Too many messages, slow down")]
    RateLimited,
}

fn precondition_status(err: &PreconditionError) -> StatusCode {
    match err {
        PreconditionError::AlreadyQueued
        | PreconditionError::AlreadyInSession
        | PreconditionError::AlreadyRegistered
        | PreconditionError::NoActiveSession => StatusCode::CONFLICT,
        PreconditionError::Banned | PreconditionError::FilesNotAllowed => StatusCode::FORBIDDEN,
        PreconditionError::NotRegistered | PreconditionError::UnknownAnonId => {
            StatusCode::NOT_FOUND
        }
        PreconditionError::EmptyContent => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn token_status(err: &TokenError) -> StatusCode {
    match err {
        TokenError::TokenNotFound => StatusCode::NOT_FOUND,
        TokenError::TokenExpired => StatusCode::GONE,
        TokenError::TokenAlreadyUsed | TokenError::TooSoon { .. } => StatusCode::CONFLICT,
        TokenError::NotTokenOwner => StatusCode::FORBIDDEN,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Core(CoreError::Precondition(e)) => (precondition_status(e), e.to_string()),
            ApiError::Core(CoreError::Token(e)) => (token_status(e), e.to_string()),
            ApiError::Core(CoreError::NotFound(_)) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Core(CoreError::PeerUnreachable) => (StatusCode::GONE, self.to_string()),
            ApiError::Core(CoreError::Repository(e)) => {
                error!(error = %e, "Repository failure");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable".to_string(),
                )
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
        };

        let mut body = serde_json::json!({
            "error": message,
        });
        if let ApiError::Core(CoreError::Token(TokenError::TooSoon { remaining_secs })) = &self {
            body["retry_after_secs"] = serde_json::json!(remaining_secs);
        }

        (status, axum::Json(body)).into_response()
    }
}
