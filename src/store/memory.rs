// src/store/memory.rs
//! In-process store used by tests and local runs.
//!
//! A transaction holds the table lock from `begin` until it is committed or
//! dropped and works on a private copy of the tables, so concurrent
//! transactions are serialized and an uncommitted one leaves no trace.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{RowLock, Store, StoreError, StoreTx, TalliedOption, VoteVersion};
use crate::models::{
    OptionId, Poll, PollId, PollOption, PollSort, Session, User, UserId, Vote, VoteId,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    sessions: HashMap<String, Session>,
    polls: HashMap<PollId, Poll>,
    options: HashMap<OptionId, PollOption>,
    votes: HashMap<VoteId, Vote>,
    ballots: HashSet<(UserId, PollId)>,
    revisions: HashMap<OptionId, i64>,
}

impl Tables {
    fn options_of(&self, poll_id: PollId) -> Vec<PollOption> {
        let mut options: Vec<PollOption> = self
            .options
            .values()
            .filter(|option| option.poll_id == poll_id)
            .cloned()
            .collect();
        options.sort_by_key(|option| option.position);
        options
    }

    fn total_votes(&self, poll_id: PollId) -> i64 {
        self.options
            .values()
            .filter(|option| option.poll_id == poll_id)
            .map(|option| option.votes_count)
            .sum()
    }

    fn bump_revision(&mut self, option_id: OptionId) {
        *self.revisions.entry(option_id).or_insert(0) += 1;
    }

    fn remove_poll(&mut self, id: PollId) -> bool {
        if self.polls.remove(&id).is_none() {
            return false;
        }
        let options = &self.options;
        self.revisions
            .retain(|option_id, _| options.get(option_id).is_some_and(|o| o.poll_id != id));
        self.options.retain(|_, option| option.poll_id != id);
        self.votes.retain(|_, vote| vote.poll_id != id);
        self.ballots.retain(|(_, poll_id)| *poll_id != id);
        true
    }
}

#[derive(Default)]
struct Faults {
    latency: Duration,
    commit_latency: Duration,
    failing_purges: HashSet<PollId>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<AsyncMutex<Tables>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.tables.lock().await.users.insert(user.id, user);
    }

    /// Deletes a user with their polls and votes, keeping counters in step.
    pub async fn delete_user(&self, id: UserId) {
        let mut tables = self.tables.lock().await;
        tables.users.remove(&id);
        tables.sessions.retain(|_, session| session.user_id != id);

        let owned: Vec<PollId> = tables
            .polls
            .values()
            .filter(|poll| poll.user_id == id)
            .map(|poll| poll.id)
            .collect();
        for poll_id in owned {
            tables.remove_poll(poll_id);
        }

        let cast: Vec<Vote> = tables
            .votes
            .values()
            .filter(|vote| vote.user_id == id)
            .cloned()
            .collect();
        for vote in cast {
            tables.votes.remove(&vote.id);
            tables.ballots.remove(&(vote.user_id, vote.poll_id));
            if let Some(option) = tables.options.get_mut(&vote.option_id) {
                option.votes_count -= 1;
            }
            tables.bump_revision(vote.option_id);
        }
    }

    pub async fn insert_session(&self, session: Session) {
        self.tables
            .lock()
            .await
            .sessions
            .insert(session.token.clone(), session);
    }

    /// All votes currently stored, for invariant checks.
    pub async fn votes(&self) -> Vec<Vote> {
        self.tables.lock().await.votes.values().cloned().collect()
    }

    /// Every option with the number of vote rows referencing it.
    pub async fn counter_audit(&self) -> Vec<(PollOption, i64)> {
        let tables = self.tables.lock().await;
        tables
            .options
            .values()
            .map(|option| {
                let rows = tables
                    .votes
                    .values()
                    .filter(|vote| vote.option_id == option.id)
                    .count() as i64;
                (option.clone(), rows)
            })
            .collect()
    }

    /// Overwrites a counter without touching votes. Simulates corrupted data.
    pub async fn overwrite_votes_count(&self, option_id: OptionId, votes_count: i64) {
        if let Some(option) = self.tables.lock().await.options.get_mut(&option_id) {
            option.votes_count = votes_count;
        }
    }

    /// Delay applied before every transaction starts.
    pub fn set_latency(&self, latency: Duration) {
        self.faults().latency = latency;
    }

    /// Delay applied inside every commit, before its writes become visible.
    pub fn set_commit_latency(&self, latency: Duration) {
        self.faults().commit_latency = latency;
    }

    /// Makes `purge_votes` fail for one poll.
    pub fn fail_purges_for(&self, poll_id: PollId) {
        self.faults().failing_purges.insert(poll_id);
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let latency = self.faults().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            work,
            faults: Arc::clone(&self.faults),
        }))
    }

    async fn poll(&self, id: PollId) -> Result<Option<Poll>, StoreError> {
        Ok(self.tables.lock().await.polls.get(&id).cloned())
    }

    async fn options(&self, poll_id: PollId) -> Result<Vec<PollOption>, StoreError> {
        Ok(self.tables.lock().await.options_of(poll_id))
    }

    async fn user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.tables.lock().await.users.get(&id).cloned())
    }

    async fn session(&self, token: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.tables.lock().await.sessions.get(token).cloned())
    }

    async fn vote_version(&self, poll_id: PollId) -> Result<VoteVersion, StoreError> {
        let tables = self.tables.lock().await;
        let revision = tables
            .options
            .values()
            .filter(|option| option.poll_id == poll_id)
            .filter_map(|option| tables.revisions.get(&option.id))
            .sum();
        Ok(VoteVersion { revision })
    }

    async fn tally(&self, poll_id: PollId) -> Result<Vec<TalliedOption>, StoreError> {
        let tables = self.tables.lock().await;
        let mut live: HashMap<OptionId, i64> = HashMap::new();
        for vote in tables.votes.values().filter(|vote| vote.poll_id == poll_id) {
            *live.entry(vote.option_id).or_insert(0) += 1;
        }
        Ok(tables
            .options_of(poll_id)
            .into_iter()
            .map(|option| TalliedOption {
                live_count: live.get(&option.id).copied().unwrap_or(0),
                option,
            })
            .collect())
    }

    async fn open_polls(
        &self,
        now: DateTime<Utc>,
        sort: PollSort,
        limit: u32,
        offset: u64,
    ) -> Result<(Vec<Poll>, i64), StoreError> {
        let tables = self.tables.lock().await;
        let mut open: Vec<&Poll> = tables
            .polls
            .values()
            .filter(|poll| poll.active && poll.expires_at > now)
            .collect();
        match sort {
            PollSort::Recent => open.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            PollSort::EndingSoon => open.sort_by(|a, b| a.expires_at.cmp(&b.expires_at)),
            PollSort::Popular => open.sort_by(|a, b| {
                tables
                    .total_votes(b.id)
                    .cmp(&tables.total_votes(a.id))
                    .then(b.created_at.cmp(&a.created_at))
            }),
        }
        let total = open.len() as i64;
        let page = open
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn polls_by_owner(&self, owner: UserId) -> Result<Vec<Poll>, StoreError> {
        let tables = self.tables.lock().await;
        let mut polls: Vec<Poll> = tables
            .polls
            .values()
            .filter(|poll| poll.user_id == owner)
            .cloned()
            .collect();
        polls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(polls)
    }

    async fn expired_poll_ids(&self, now: DateTime<Utc>) -> Result<Vec<PollId>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .polls
            .values()
            .filter(|poll| poll.expires_at <= now)
            .map(|poll| poll.id)
            .collect())
    }

    async fn stale_poll_ids(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PollId>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .polls
            .values()
            .filter(|poll| !poll.active && poll.created_at < created_before)
            .filter(|poll| tables.votes.values().any(|vote| vote.poll_id == poll.id))
            .map(|poll| poll.id)
            .collect())
    }

    async fn votes_per_hour(
        &self,
        poll_id: PollId,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, i64)>, StoreError> {
        let tables = self.tables.lock().await;
        let mut buckets: BTreeMap<DateTime<Utc>, i64> = BTreeMap::new();
        for vote in tables
            .votes
            .values()
            .filter(|vote| vote.poll_id == poll_id && vote.created_at >= since)
        {
            let hour = vote
                .created_at
                .duration_trunc(chrono::Duration::hours(1))
                .map_err(|e| StoreError::Database(e.to_string()))?;
            *buckets.entry(hour).or_insert(0) += 1;
        }
        Ok(buckets.into_iter().collect())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
    faults: Arc<Mutex<Faults>>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_poll(&mut self, id: PollId, _lock: RowLock) -> Result<Option<Poll>, StoreError> {
        Ok(self.work.polls.get(&id).cloned())
    }

    async fn options(&mut self, poll_id: PollId) -> Result<Vec<PollOption>, StoreError> {
        Ok(self.work.options_of(poll_id))
    }

    async fn lock_option(&mut self, id: OptionId) -> Result<Option<PollOption>, StoreError> {
        Ok(self.work.options.get(&id).cloned())
    }

    async fn user(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.work.users.get(&id).cloned())
    }

    async fn vote(&mut self, id: VoteId) -> Result<Option<Vote>, StoreError> {
        Ok(self.work.votes.get(&id).cloned())
    }

    async fn insert_poll(&mut self, poll: &Poll) -> Result<(), StoreError> {
        if !self.work.users.contains_key(&poll.user_id) {
            return Err(StoreError::Database(format!(
                "polls.user_id references missing user {}",
                poll.user_id
            )));
        }
        self.work.polls.insert(poll.id, poll.clone());
        Ok(())
    }

    async fn insert_option(&mut self, option: &PollOption) -> Result<(), StoreError> {
        if !self.work.polls.contains_key(&option.poll_id) {
            return Err(StoreError::Database(format!(
                "options.poll_id references missing poll {}",
                option.poll_id
            )));
        }
        self.work.options.insert(option.id, option.clone());
        Ok(())
    }

    async fn update_poll(&mut self, poll: &Poll) -> Result<(), StoreError> {
        match self.work.polls.get_mut(&poll.id) {
            Some(stored) => {
                *stored = poll.clone();
                Ok(())
            }
            None => Err(StoreError::Database(format!("poll {} does not exist", poll.id))),
        }
    }

    async fn delete_poll(&mut self, id: PollId) -> Result<bool, StoreError> {
        Ok(self.work.remove_poll(id))
    }

    async fn insert_vote(&mut self, vote: &Vote) -> Result<(), StoreError> {
        if !self.work.ballots.insert((vote.user_id, vote.poll_id)) {
            return Err(StoreError::UniqueViolation(
                "index_votes_on_user_id_and_poll_id".to_string(),
            ));
        }
        self.work.votes.insert(vote.id, vote.clone());
        Ok(())
    }

    async fn delete_vote(&mut self, id: VoteId) -> Result<bool, StoreError> {
        match self.work.votes.remove(&id) {
            Some(vote) => {
                self.work.ballots.remove(&(vote.user_id, vote.poll_id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_votes(&mut self, option_id: OptionId, delta: i64) -> Result<i64, StoreError> {
        let option = self
            .work
            .options
            .get_mut(&option_id)
            .ok_or_else(|| StoreError::Database(format!("option {option_id} does not exist")))?;
        option.votes_count += delta;
        let votes_count = option.votes_count;
        self.work.bump_revision(option_id);
        Ok(votes_count)
    }

    async fn deactivate_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<PollId>, StoreError> {
        let mut flipped = Vec::new();
        for poll in self.work.polls.values_mut() {
            if poll.active && poll.expires_at <= now {
                poll.active = false;
                poll.updated_at = now;
                flipped.push(poll.id);
            }
        }
        Ok(flipped)
    }

    async fn purge_votes(&mut self, poll_id: PollId) -> Result<u64, StoreError> {
        let failing = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failing_purges
            .contains(&poll_id);
        if failing {
            return Err(StoreError::Database(format!("purge of poll {poll_id} failed")));
        }

        let before = self.work.votes.len();
        self.work.votes.retain(|_, vote| vote.poll_id != poll_id);
        self.work.ballots.retain(|(_, id)| *id != poll_id);
        let mut zeroed = Vec::new();
        for option in self.work.options.values_mut() {
            if option.poll_id == poll_id {
                option.votes_count = 0;
                zeroed.push(option.id);
            }
        }
        for option_id in zeroed {
            self.work.bump_revision(option_id);
        }
        Ok((before - self.work.votes.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx {
            mut guard,
            work,
            faults,
        } = *self;
        let latency = faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .commit_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        *guard = work;
        Ok(())
    }
}
