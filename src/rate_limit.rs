// src/rate_limit.rs
use std::fmt;
use std::time::Duration;

use tracing::warn;

use crate::cache::TtlStore;
use crate::config::RateLimits;
use crate::error::ApiError;
use crate::models::UserId;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Poll creation and updates.
    Polls,
    Votes,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Polls => f.write_str("polls"),
            Scope::Votes => f.write_str("votes"),
        }
    }
}

/// Fixed one-minute windows per user and scope.
pub struct RateLimiter {
    limits: RateLimits,
    windows: TtlStore<(Scope, UserId), u32>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            windows: TtlStore::new(WINDOW),
        }
    }

    fn limit(&self, scope: Scope) -> u32 {
        match scope {
            Scope::Polls => self.limits.polls_per_minute,
            Scope::Votes => self.limits.votes_per_minute,
        }
    }

    /// Counts one request; fails once the user exceeded the scope's limit for this window.
    pub fn check(&self, scope: Scope, user_id: UserId) -> Result<(), ApiError> {
        let (count, remaining) = self
            .windows
            .update((scope, user_id), |count| count.copied().unwrap_or(0).saturating_add(1));
        let limit = self.limit(scope);
        if count <= limit {
            return Ok(());
        }

        let retry_after = remaining.as_secs().max(1);
        warn!(
            target: "audit",
            user_id = %user_id,
            %scope,
            limit,
            retry_after,
            "rate_limited"
        );
        Err(ApiError::RateLimited { retry_after })
    }

    /// Drops windows that already closed.
    pub fn purge_expired(&self) -> usize {
        self.windows.purge_expired()
    }

    /// Windows currently tracked, open or not yet purged.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimits::default())
    }
}
