// src/poll.rs
use chrono::{DateTime, Utc};
use tracing::info;

use crate::broadcast::{poll_topic, PollEvent};
use crate::error::PollError;
use crate::models::{NewPoll, OptionId, Poll, PollChanges, PollId, PollOption, PollSnapshot, UserId};
use crate::services::PollService;
use crate::store::RowLock;

pub const TITLE_MIN_CHARS: usize = 5;
pub const TITLE_MAX_CHARS: usize = 200;
pub const DESCRIPTION_MAX_CHARS: usize = 1000;
pub const OPTION_MAX_CHARS: usize = 100;
pub const MIN_OPTIONS: usize = 2;

impl Poll {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Open for casting and retracting votes. An active poll past its expiry
    /// stays active until swept but is not votable.
    pub fn is_votable(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired(now)
    }

    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.user_id == user
    }
}

fn check_title(title: &str, errors: &mut Vec<String>) -> String {
    let title = title.trim();
    let chars = title.chars().count();
    if chars < TITLE_MIN_CHARS {
        errors.push(format!("title is too short (minimum is {TITLE_MIN_CHARS} characters)"));
    } else if chars > TITLE_MAX_CHARS {
        errors.push(format!("title is too long (maximum is {TITLE_MAX_CHARS} characters)"));
    }
    title.to_string()
}

fn check_description(description: Option<&str>, errors: &mut Vec<String>) -> Option<String> {
    let description = description.map(str::trim).filter(|text| !text.is_empty())?;
    if description.chars().count() > DESCRIPTION_MAX_CHARS {
        errors.push(format!(
            "description is too long (maximum is {DESCRIPTION_MAX_CHARS} characters)"
        ));
    }
    Some(description.to_string())
}

fn check_expiry(expires_at: DateTime<Utc>, now: DateTime<Utc>, errors: &mut Vec<String>) {
    if expires_at <= now {
        errors.push("expires_at can't be in the past".to_string());
    }
}

/// Trims option texts and drops blank ones. Duplicates are kept.
pub fn normalize_options(texts: &[String]) -> Vec<String> {
    texts
        .iter()
        .map(|text| text.trim())
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .collect()
}

fn check_options(texts: &[String], errors: &mut Vec<String>) -> Vec<String> {
    let options = normalize_options(texts);
    if options.len() < MIN_OPTIONS {
        errors.push(format!("poll must have at least {MIN_OPTIONS} options"));
    }
    for text in &options {
        if text.chars().count() > OPTION_MAX_CHARS {
            errors.push(format!(
                "option \"{}...\" is too long (maximum is {OPTION_MAX_CHARS} characters)",
                text.chars().take(20).collect::<String>()
            ));
        }
    }
    options
}

/// A validated poll ready to be stored.
#[derive(Debug)]
pub struct PollDraft {
    pub poll: Poll,
    pub options: Vec<PollOption>,
}

impl PollDraft {
    pub fn new(owner: UserId, input: &NewPoll, now: DateTime<Utc>) -> Result<Self, PollError> {
        let mut errors = Vec::new();
        let title = check_title(&input.title, &mut errors);
        let description = check_description(input.description.as_deref(), &mut errors);
        check_expiry(input.expires_at, now, &mut errors);
        let texts = check_options(&input.options, &mut errors);
        if !errors.is_empty() {
            return Err(PollError::Validation(errors));
        }

        let poll = Poll {
            id: PollId::new(),
            title,
            description,
            user_id: owner,
            active: true,
            expires_at: input.expires_at,
            created_at: now,
            updated_at: now,
        };
        let options = texts
            .into_iter()
            .zip(0..)
            .map(|(text, position)| PollOption {
                id: OptionId::new(),
                poll_id: poll.id,
                text,
                position,
                votes_count: 0,
            })
            .collect();

        Ok(Self { poll, options })
    }
}

impl PollChanges {
    /// Applies the changes to `poll` after validating them against `now`.
    pub fn apply(&self, poll: &mut Poll, now: DateTime<Utc>) -> Result<(), PollError> {
        let mut errors = Vec::new();
        let title = self.title.as_deref().map(|title| check_title(title, &mut errors));
        let description = self
            .description
            .as_deref()
            .map(|text| check_description(Some(text), &mut errors));
        if let Some(expires_at) = self.expires_at {
            check_expiry(expires_at, now, &mut errors);
        }
        if !errors.is_empty() {
            return Err(PollError::Validation(errors));
        }

        if let Some(title) = title {
            poll.title = title;
        }
        if let Some(description) = description {
            poll.description = description;
        }
        if let Some(active) = self.active {
            poll.active = active;
        }
        if let Some(expires_at) = self.expires_at {
            poll.expires_at = expires_at;
        }
        poll.updated_at = now;
        Ok(())
    }
}

impl PollService {
    /// Stores a poll and its options as one unit and announces it.
    pub async fn create_poll(&self, owner: UserId, input: NewPoll) -> Result<PollSnapshot, PollError> {
        let draft = PollDraft::new(owner, &input, self.clock.now())?;

        let (tx, snapshot) = self
            .within("create_poll", async {
                let mut tx = self.store.begin().await?;
                tx.user(owner)
                    .await?
                    .ok_or_else(|| PollError::not_found("user", owner))?;
                tx.insert_poll(&draft.poll).await?;
                for option in &draft.options {
                    tx.insert_option(option).await?;
                }
                let snapshot = self.snapshot_in(&mut *tx, &draft.poll).await?;
                Ok((tx, snapshot))
            })
            .await?;
        self.commit("create_poll", tx).await?;

        info!(
            target: "audit",
            poll_id = %snapshot.id,
            user_id = %owner,
            title = %snapshot.title,
            options = snapshot.options.len(),
            "poll_created"
        );
        self.publish(PollEvent::PollCreated {
            poll: snapshot.clone(),
        });
        Ok(snapshot)
    }

    pub async fn update_poll(
        &self,
        poll_id: PollId,
        requester: UserId,
        changes: PollChanges,
    ) -> Result<PollSnapshot, PollError> {
        let now = self.clock.now();
        let (tx, snapshot) = self
            .within("update_poll", async {
                let mut tx = self.store.begin().await?;
                let mut poll = tx
                    .lock_poll(poll_id, RowLock::Update)
                    .await?
                    .ok_or_else(|| PollError::not_found("poll", poll_id))?;
                if !poll.is_owned_by(requester) {
                    return Err(PollError::Authorization);
                }
                changes.apply(&mut poll, now)?;
                tx.update_poll(&poll).await?;
                let snapshot = self.snapshot_in(&mut *tx, &poll).await?;
                Ok((tx, snapshot))
            })
            .await?;
        self.commit("update_poll", tx).await?;

        self.results_cache.invalidate(poll_id);
        info!(poll_id = %poll_id, user_id = %requester, active = snapshot.active, "poll_updated");
        self.publish(PollEvent::PollUpdated {
            poll: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Deletes a poll with its options and votes. Subscribers get the final snapshot.
    pub async fn delete_poll(&self, poll_id: PollId, requester: UserId) -> Result<(), PollError> {
        let (tx, snapshot) = self
            .within("delete_poll", async {
                let mut tx = self.store.begin().await?;
                let poll = tx
                    .lock_poll(poll_id, RowLock::Update)
                    .await?
                    .ok_or_else(|| PollError::not_found("poll", poll_id))?;
                if !poll.is_owned_by(requester) {
                    return Err(PollError::Authorization);
                }
                let snapshot = self.snapshot_in(&mut *tx, &poll).await?;
                if !tx.delete_poll(poll_id).await? {
                    return Err(PollError::not_found("poll", poll_id));
                }
                Ok((tx, snapshot))
            })
            .await?;
        self.commit("delete_poll", tx).await?;

        self.results_cache.invalidate(poll_id);
        self.views.forget(poll_id);
        info!(target: "audit", poll_id = %poll_id, user_id = %requester, "poll_deleted");
        self.publish(PollEvent::PollDeleted { poll: snapshot });
        self.publisher.retire_topic(&poll_topic(poll_id));
        Ok(())
    }
}
