// src/store/mod.rs
//! Storage collaborator.
//!
//! [`Store`] serves plain reads and opens transactions; every mutation goes
//! through a [`StoreTx`], which either commits as a whole or rolls back when
//! dropped. Implementations must enforce uniqueness of `(user_id, poll_id)` on
//! votes at insert time and report it as [`StoreError::UniqueViolation`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{OptionId, Poll, PollId, PollOption, PollSort, Session, User, UserId, Vote, VoteId};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("storage timed out")]
    Timeout,

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StoreError::Timeout,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::UniqueViolation(db_err.constraint().unwrap_or("unknown").to_string())
            }
            // 57014: statement cancelled by statement_timeout
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("57014") => {
                StoreError::Timeout
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Row lock taken when reading a poll inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    /// Blocks updates and deletes of the poll, not other voters.
    Share,
    Update,
}

/// Marker that changes whenever the vote set of a poll changes.
///
/// It is the sum of the poll's per-option revisions. Every counter change
/// bumps its option's revision in the same transaction, so the sum only grows
/// and a later state never carries an earlier marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoteVersion {
    pub revision: i64,
}

/// An option with the number of vote rows that reference it, read in one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TalliedOption {
    pub option: PollOption,
    pub live_count: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    async fn poll(&self, id: PollId) -> Result<Option<Poll>, StoreError>;

    /// Options of a poll in display order.
    async fn options(&self, poll_id: PollId) -> Result<Vec<PollOption>, StoreError>;

    async fn user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    async fn session(&self, token: &str) -> Result<Option<Session>, StoreError>;

    async fn vote_version(&self, poll_id: PollId) -> Result<VoteVersion, StoreError>;

    /// Options with their counters and live vote counts from a single snapshot.
    async fn tally(&self, poll_id: PollId) -> Result<Vec<TalliedOption>, StoreError>;

    /// Active, unexpired polls in the requested order plus the total number of them.
    async fn open_polls(
        &self,
        now: DateTime<Utc>,
        sort: PollSort,
        limit: u32,
        offset: u64,
    ) -> Result<(Vec<Poll>, i64), StoreError>;

    /// Polls owned by `owner`, newest first.
    async fn polls_by_owner(&self, owner: UserId) -> Result<Vec<Poll>, StoreError>;

    async fn expired_poll_ids(&self, now: DateTime<Utc>) -> Result<Vec<PollId>, StoreError>;

    /// Inactive polls created before `created_before` that still hold votes.
    async fn stale_poll_ids(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PollId>, StoreError>;

    /// Vote counts bucketed by hour, for votes cast at or after `since`.
    async fn votes_per_hour(
        &self,
        poll_id: PollId,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, i64)>, StoreError>;
}

#[async_trait]
pub trait StoreTx: Send {
    async fn lock_poll(&mut self, id: PollId, lock: RowLock) -> Result<Option<Poll>, StoreError>;

    async fn options(&mut self, poll_id: PollId) -> Result<Vec<PollOption>, StoreError>;

    /// Reads an option and locks it against concurrent counter updates.
    async fn lock_option(&mut self, id: OptionId) -> Result<Option<PollOption>, StoreError>;

    async fn user(&mut self, id: UserId) -> Result<Option<User>, StoreError>;

    async fn vote(&mut self, id: VoteId) -> Result<Option<Vote>, StoreError>;

    async fn insert_poll(&mut self, poll: &Poll) -> Result<(), StoreError>;

    async fn insert_option(&mut self, option: &PollOption) -> Result<(), StoreError>;

    async fn update_poll(&mut self, poll: &Poll) -> Result<(), StoreError>;

    /// Deletes a poll with its options and votes. Returns false if it was already gone.
    async fn delete_poll(&mut self, id: PollId) -> Result<bool, StoreError>;

    async fn insert_vote(&mut self, vote: &Vote) -> Result<(), StoreError>;

    async fn delete_vote(&mut self, id: VoteId) -> Result<bool, StoreError>;

    /// Adds `delta` to an option's `votes_count`, bumps its revision and returns the new count.
    async fn add_votes(&mut self, option_id: OptionId, delta: i64) -> Result<i64, StoreError>;

    /// Flips every active poll with `expires_at <= now` to inactive.
    async fn deactivate_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<PollId>, StoreError>;

    /// Deletes all votes of a poll, zeroes its counters and bumps their revisions.
    /// Returns the number of votes deleted.
    async fn purge_votes(&mut self, poll_id: PollId) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
