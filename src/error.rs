// src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt::Display;
use thiserror::Error;
use tracing::error;

use crate::store::StoreError;

/// Outcomes of poll and vote operations that the caller has to handle.
#[derive(Error, Debug)]
pub enum PollError {
    #[error("validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),

    #[error("only the poll owner may do that")]
    Authorization,

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("you have already voted on this poll")]
    DuplicateVote,

    #[error("poll is not active or has expired")]
    PollNotVotable,

    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("storage operation timed out")]
    StorageTimeout,

    #[error("missing, invalid or expired credentials")]
    Unauthorized,

    #[error("storage failure: {0}")]
    Storage(String),
}

impl PollError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }

    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Builds a consistency error and logs it; these only occur on a bug or corrupted data.
    pub fn consistency(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(target: "audit", %message, "consistency violation");
        Self::Consistency(message)
    }

    /// Transient failures that may succeed when retried once with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageTimeout)
    }
}

impl From<StoreError> for PollError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout => Self::StorageTimeout,
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Errors surfaced by HTTP handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Poll(#[from] PollError),

    #[error("rate limit exceeded, try again in {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Poll(err) => match err {
                PollError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                PollError::Authorization => StatusCode::FORBIDDEN,
                PollError::NotFound { .. } => StatusCode::NOT_FOUND,
                PollError::DuplicateVote => StatusCode::CONFLICT,
                PollError::PollNotVotable => StatusCode::UNPROCESSABLE_ENTITY,
                PollError::Consistency(_) | PollError::Storage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                PollError::StorageTimeout => StatusCode::SERVICE_UNAVAILABLE,
                PollError::Unauthorized => StatusCode::UNAUTHORIZED,
            },
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Poll(err) => match err {
                PollError::Validation(_) => "validation_error",
                PollError::Authorization => "forbidden",
                PollError::NotFound { .. } => "not_found",
                PollError::DuplicateVote => "duplicate_vote",
                PollError::PollNotVotable => "poll_not_votable",
                PollError::Consistency(_) => "consistency_error",
                PollError::StorageTimeout => "storage_timeout",
                PollError::Unauthorized => "unauthorized",
                PollError::Storage(_) => "internal_error",
            },
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let mut body = json!({ "error": self.to_string(), "code": self.code() });
        match &self {
            ApiError::Poll(PollError::Validation(messages)) => {
                body["errors"] = json!(messages);
            }
            ApiError::RateLimited { retry_after } => {
                body["retry_after"] = json!(retry_after);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
