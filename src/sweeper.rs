// src/sweeper.rs
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broadcast::PollEvent;
use crate::error::PollError;
use crate::models::PollId;
use crate::rate_limit::RateLimiter;
use crate::services::PollService;

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SweepSummary {
    /// Polls flipped from active to inactive by this sweep.
    pub deactivated: usize,
    pub purged_polls: usize,
    pub cache_evicted: usize,
    pub rate_windows_evicted: usize,
    pub errors: Vec<String>,
}

impl PollService {
    /// One pass of expiry housekeeping. A failing step or poll is logged and
    /// recorded in the summary; the rest of the sweep still runs.
    pub async fn run_sweep(&self) -> SweepSummary {
        let now = self.clock.now();
        let mut summary = SweepSummary::default();
        info!("starting poll sweep");

        let deactivated = match self.deactivate_expired().await {
            Ok(ids) => ids,
            Err(err) => {
                error!(error = %err, "failed to deactivate expired polls");
                summary.errors.push(format!("deactivate expired polls: {err}"));
                Vec::new()
            }
        };
        summary.deactivated = deactivated.len();
        for poll_id in &deactivated {
            if self.results_cache.invalidate(*poll_id) {
                summary.cache_evicted += 1;
            }
        }

        match self
            .within("sweep.expired", async {
                Ok(self.store.expired_poll_ids(now).await?)
            })
            .await
        {
            Ok(ids) => {
                summary.cache_evicted += ids
                    .into_iter()
                    .filter(|poll_id| self.results_cache.invalidate(*poll_id))
                    .count();
            }
            Err(err) => {
                warn!(error = %err, "failed to list expired polls");
                summary.errors.push(format!("list expired polls: {err}"));
            }
        }
        summary.cache_evicted += self.results_cache.purge_expired();

        let stale = match now.checked_sub_signed(self.settings.vote_purge_after) {
            Some(cutoff) => {
                self.within("sweep.stale", async {
                    Ok(self.store.stale_poll_ids(cutoff).await?)
                })
                .await
            }
            // Nothing can be older than the earliest representable instant.
            None => Ok(Vec::new()),
        };
        match stale {
            Ok(ids) => {
                for poll_id in ids {
                    match self.purge_votes(poll_id).await {
                        Ok(deleted) => {
                            info!(poll_id = %poll_id, deleted, "purged vote history");
                            summary.purged_polls += 1;
                        }
                        Err(err) => {
                            warn!(poll_id = %poll_id, error = %err, "failed to purge vote history");
                            summary.errors.push(format!("purge poll {poll_id}: {err}"));
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to list stale polls");
                summary.errors.push(format!("list stale polls: {err}"));
            }
        }

        for poll_id in deactivated {
            match self.poll(poll_id).await {
                Ok(snapshot) => self.publish(PollEvent::PollUpdated { poll: snapshot }),
                Err(err) => warn!(poll_id = %poll_id, error = %err, "skipped expiry announcement"),
            }
        }

        let pruned = self.publisher.prune_idle_topics();
        info!(
            deactivated = summary.deactivated,
            purged_polls = summary.purged_polls,
            cache_evicted = summary.cache_evicted,
            pruned_topics = pruned,
            errors = summary.errors.len(),
            "poll sweep finished"
        );
        summary
    }

    async fn deactivate_expired(&self) -> Result<Vec<PollId>, PollError> {
        let now = self.clock.now();
        let (tx, ids) = self
            .within("sweep.deactivate", async {
                let mut tx = self.store.begin().await?;
                let ids = tx.deactivate_expired(now).await?;
                Ok((tx, ids))
            })
            .await?;
        self.commit("sweep.deactivate", tx).await?;
        Ok(ids)
    }

    /// Drops the vote history of one poll and zeroes its counters in one transaction.
    async fn purge_votes(&self, poll_id: PollId) -> Result<u64, PollError> {
        let (tx, deleted) = self
            .within("sweep.purge", async {
                let mut tx = self.store.begin().await?;
                let deleted = tx.purge_votes(poll_id).await?;
                Ok((tx, deleted))
            })
            .await?;
        self.commit("sweep.purge", tx).await?;
        self.results_cache.invalidate(poll_id);
        Ok(deleted)
    }
}

/// A full sweep: [`PollService::run_sweep`] followed by dropping rate-limit
/// windows that already closed.
pub async fn sweep(service: &PollService, limiter: &RateLimiter) -> SweepSummary {
    let mut summary = service.run_sweep().await;
    summary.rate_windows_evicted = limiter.purge_expired();
    debug!(
        evicted = summary.rate_windows_evicted,
        remaining = limiter.len(),
        "rate limit windows purged"
    );
    summary
}

/// Runs [`sweep`] every `every`, starting immediately.
pub fn spawn_sweeper(
    service: Arc<PollService>,
    limiter: Arc<RateLimiter>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let summary = sweep(&service, &limiter).await;
            if !summary.errors.is_empty() {
                warn!(errors = ?summary.errors, "poll sweep finished with errors");
            }
        }
    })
}
