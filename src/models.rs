// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// Identifies a user known to the identity collaborator.
    UserId
);
id_type!(PollId);
id_type!(OptionId);
id_type!(VoteId);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

/// A bearer credential issued by the identity collaborator.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Session {
    pub token: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Poll {
    pub id: PollId,
    pub title: String,
    pub description: Option<String>,
    pub user_id: UserId,
    pub active: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A votable choice. `votes_count` mirrors the number of vote rows pointing at it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PollOption {
    pub id: OptionId,
    pub poll_id: PollId,
    pub text: String,
    pub position: i32,
    pub votes_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vote {
    pub id: VoteId,
    pub user_id: UserId,
    pub poll_id: PollId,
    pub option_id: OptionId,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a poll together with its options.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPoll {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Owner-editable fields. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub active: Option<bool>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub option_id: OptionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
}

impl From<User> for UserSummary {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionResult {
    pub option_id: OptionId,
    pub text: String,
    pub votes_count: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResults {
    pub poll_id: PollId,
    pub total_votes: i64,
    pub options: Vec<OptionResult>,
}

/// Full state of a poll as seen by clients and subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSnapshot {
    pub id: PollId,
    pub title: String,
    pub description: Option<String>,
    pub active: bool,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
    pub total_votes: i64,
    pub view_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner: UserSummary,
    pub options: Vec<OptionResult>,
}

impl PollSnapshot {
    pub fn option(&self, text: &str) -> Option<&OptionResult> {
        self.options.iter().find(|option| option.text == text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoteOutcome {
    pub vote: Vote,
    pub poll: PollSnapshot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollSort {
    #[default]
    Recent,
    Popular,
    EndingSoon,
}

pub const DEFAULT_PER_PAGE: u32 = 10;
pub const MAX_PER_PAGE: u32 = 50;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollListQuery {
    #[serde(default)]
    pub sort: PollSort,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl PollListQuery {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
            .map_or(DEFAULT_PER_PAGE, |n| n.clamp(1, MAX_PER_PAGE))
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.per_page())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total_count: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollAnalytics {
    pub total_votes: i64,
    pub view_count: u64,
    pub completion_rate: f64,
    /// Votes per hour over the last day, keyed `YYYY-MM-DD HH:00`.
    pub votes_over_time: std::collections::BTreeMap<String, i64>,
    pub option_performance: Vec<OptionResult>,
}
