// src/auth.rs
//! Resolves bearer tokens to users. Sessions are issued elsewhere; this side
//! only checks that a token exists and has not expired.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::{DateTime, Utc};
use http::{header::AUTHORIZATION, HeaderMap};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{ApiError, PollError};
use crate::models::UserId;
use crate::routes::AppState;
use crate::store::Store;

/// The caller behind a valid token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Fails with [`PollError::Unauthorized`] for unknown or expired tokens.
    async fn authenticate(&self, token: &str) -> Result<Identity, PollError>;
}

/// Looks tokens up in the session table.
pub struct SessionAuthenticator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl SessionAuthenticator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl Authenticator for SessionAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, PollError> {
        let session = self
            .store
            .session(token)
            .await?
            .ok_or(PollError::Unauthorized)?;
        if session.expires_at <= self.clock.now() {
            debug!(user_id = %session.user_id, "rejected expired session");
            return Err(PollError::Unauthorized);
        }
        Ok(Identity {
            user_id: session.user_id,
            expires_at: session.expires_at,
        })
    }
}

/// Token from an `Authorization: Bearer <token>` header, if present and non-empty.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Extractor for handlers that require a signed-in user.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub Identity);

impl CurrentUser {
    pub fn id(&self) -> UserId {
        self.0.user_id
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(PollError::Unauthorized)?;
        let identity = state.authenticator.authenticate(token).await?;
        Ok(CurrentUser(identity))
    }
}
