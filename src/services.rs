// src/services.rs
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::broadcast::{poll_topic, EventEnvelope, PollEvent, Publisher, GLOBAL_TOPIC};
use crate::cache::ViewCounter;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::PollError;
use crate::models::{
    Page, Poll, PollAnalytics, PollId, PollListQuery, PollOption, PollSnapshot, User, UserId,
};
use crate::results::{round2, tally, ResultsCache};
use crate::store::{Store, StoreTx};

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Upper bound for one transactional unit of work.
    pub storage_timeout: Duration,
    pub results_cache_ttl: Duration,
    /// Inactive polls older than this lose their vote history on sweep.
    pub vote_purge_after: chrono::Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            storage_timeout: Duration::from_secs(5),
            results_cache_ttl: Duration::from_secs(30),
            vote_purge_after: chrono::Duration::days(365),
        }
    }
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            storage_timeout: config.storage_timeout,
            results_cache_ttl: config.results_cache_ttl,
            vote_purge_after: config.vote_purge_after,
        }
    }
}

/// Poll lifecycle, vote ledger, results and sweeping over injected collaborators.
pub struct PollService {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) publisher: Arc<dyn Publisher>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) results_cache: ResultsCache,
    pub(crate) views: ViewCounter,
    pub(crate) settings: ServiceSettings,
}

impl PollService {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            results_cache: ResultsCache::new(settings.results_cache_ttl),
            views: ViewCounter::default(),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn results_cache(&self) -> &ResultsCache {
        &self.results_cache
    }

    /// Runs a unit of storage work under the configured timeout. A unit that
    /// times out is dropped, which rolls back any open transaction.
    pub(crate) async fn within<T, F>(&self, operation: &'static str, work: F) -> Result<T, PollError>
    where
        F: Future<Output = Result<T, PollError>>,
    {
        match tokio::time::timeout(self.settings.storage_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout = ?self.settings.storage_timeout, "storage timed out");
                Err(PollError::StorageTimeout)
            }
        }
    }

    /// Commits a transaction prepared under [`PollService::within`]. The commit
    /// itself is not cut off by the storage timeout, so a change that reached
    /// the store is always followed by its cache invalidation and event.
    pub(crate) async fn commit(&self, operation: &'static str, tx: Box<dyn StoreTx>) -> Result<(), PollError> {
        tx.commit().await.map_err(|err| {
            warn!(operation, error = %err, "commit failed");
            PollError::from(err)
        })
    }

    /// Publishes to the poll topic and the global topic. Callers invoke this after commit.
    pub(crate) fn publish(&self, event: PollEvent) {
        let timestamp = self.clock.now();
        let topic = poll_topic(event.poll().id);
        self.publisher.publish(EventEnvelope {
            topic: GLOBAL_TOPIC.to_string(),
            event: event.clone(),
            timestamp,
        });
        self.publisher.publish(EventEnvelope {
            topic,
            event,
            timestamp,
        });
    }

    pub(crate) fn build_snapshot(&self, poll: &Poll, options: &[PollOption], owner: User) -> PollSnapshot {
        let options = tally(options.iter().map(|option| (option, option.votes_count)));
        PollSnapshot {
            id: poll.id,
            title: poll.title.clone(),
            description: poll.description.clone(),
            active: poll.active,
            expires_at: poll.expires_at,
            expired: poll.is_expired(self.clock.now()),
            total_votes: options.iter().map(|option| option.votes_count).sum(),
            view_count: self.views.get(poll.id),
            created_at: poll.created_at,
            updated_at: poll.updated_at,
            owner: owner.into(),
            options,
        }
    }

    /// Snapshot read inside `tx`, so it reflects the transaction's own writes.
    pub(crate) async fn snapshot_in(
        &self,
        tx: &mut dyn StoreTx,
        poll: &Poll,
    ) -> Result<PollSnapshot, PollError> {
        let options = tx.options(poll.id).await?;
        let owner = tx.user(poll.user_id).await?.ok_or_else(|| {
            PollError::consistency(format!("poll {} references missing owner {}", poll.id, poll.user_id))
        })?;
        Ok(self.build_snapshot(poll, &options, owner))
    }

    async fn snapshot_of(&self, poll: &Poll) -> Result<PollSnapshot, PollError> {
        let options = self.store.options(poll.id).await?;
        let owner = self.store.user(poll.user_id).await?.ok_or_else(|| {
            PollError::consistency(format!("poll {} references missing owner {}", poll.id, poll.user_id))
        })?;
        Ok(self.build_snapshot(poll, &options, owner))
    }

    pub(crate) async fn require_poll(&self, poll_id: PollId) -> Result<Poll, PollError> {
        self.store
            .poll(poll_id)
            .await?
            .ok_or_else(|| PollError::not_found("poll", poll_id))
    }

    pub async fn poll(&self, poll_id: PollId) -> Result<PollSnapshot, PollError> {
        self.within("poll", async {
            let poll = self.require_poll(poll_id).await?;
            self.snapshot_of(&poll).await
        })
        .await
    }

    /// Like [`PollService::poll`] but counts a view first.
    pub async fn view_poll(&self, poll_id: PollId) -> Result<PollSnapshot, PollError> {
        let poll = self.within("view_poll", self.require_poll(poll_id)).await?;
        self.views.increment(poll_id);
        self.within("view_poll", self.snapshot_of(&poll)).await
    }

    pub async fn poll_exists(&self, poll_id: PollId) -> Result<bool, PollError> {
        self.within("poll_exists", async { Ok(self.store.poll(poll_id).await?.is_some()) })
            .await
    }

    pub async fn list_polls(&self, query: &PollListQuery) -> Result<Page<PollSnapshot>, PollError> {
        let (page, per_page) = (query.page(), query.per_page());
        self.within("list_polls", async {
            let (polls, total_count) = self
                .store
                .open_polls(self.clock.now(), query.sort, per_page, query.offset())
                .await?;
            let mut items = Vec::with_capacity(polls.len());
            for poll in &polls {
                items.push(self.snapshot_of(poll).await?);
            }
            let per = i64::from(per_page);
            Ok(Page {
                items,
                page,
                per_page,
                total_count,
                total_pages: (total_count + per - 1) / per,
            })
        })
        .await
    }

    pub async fn polls_of(&self, owner: UserId) -> Result<Vec<PollSnapshot>, PollError> {
        self.within("polls_of", async {
            let polls = self.store.polls_by_owner(owner).await?;
            let mut snapshots = Vec::with_capacity(polls.len());
            for poll in &polls {
                snapshots.push(self.snapshot_of(poll).await?);
            }
            Ok(snapshots)
        })
        .await
    }

    /// Owner-only engagement figures for one poll.
    pub async fn analytics(
        &self,
        poll_id: PollId,
        requester: UserId,
    ) -> Result<PollAnalytics, PollError> {
        let poll = self.within("analytics", self.require_poll(poll_id)).await?;
        if !poll.is_owned_by(requester) {
            return Err(PollError::Authorization);
        }

        let results = self.results(poll_id).await?;
        let since = self.clock.now() - chrono::Duration::hours(24);
        let hourly = self
            .within("analytics", async {
                Ok(self.store.votes_per_hour(poll_id, since).await?)
            })
            .await?;

        let view_count = self.views.get(poll_id);
        let completion_rate = if view_count == 0 {
            0.0
        } else {
            round2(results.total_votes as f64 / view_count as f64 * 100.0)
        };
        let votes_over_time: BTreeMap<String, i64> = hourly
            .into_iter()
            .map(|(hour, count)| (hour.format("%Y-%m-%d %H:00").to_string(), count))
            .collect();

        Ok(PollAnalytics {
            total_votes: results.total_votes,
            view_count,
            completion_rate,
            votes_over_time,
            option_performance: results.options,
        })
    }
}
