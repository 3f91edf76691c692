// src/results.rs
use std::time::Duration;

use tracing::debug;

use crate::cache::TtlStore;
use crate::error::PollError;
use crate::models::{OptionResult, PollId, PollOption, PollResults};
use crate::services::PollService;
use crate::store::VoteVersion;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Share of `count` in `total` as a percentage with two decimals; 0 when nobody voted.
pub fn percentage(count: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(count as f64 / total as f64 * 100.0)
}

/// Builds per-option results from `(option, count)` pairs, keeping their order.
pub fn tally<'a, I>(counts: I) -> Vec<OptionResult>
where
    I: IntoIterator<Item = (&'a PollOption, i64)>,
{
    let counts: Vec<(&PollOption, i64)> = counts.into_iter().collect();
    let total: i64 = counts.iter().map(|(_, count)| count).sum();
    counts
        .into_iter()
        .map(|(option, count)| OptionResult {
            option_id: option.id,
            text: option.text.clone(),
            votes_count: count,
            percentage: percentage(count, total),
        })
        .collect()
}

#[derive(Clone)]
struct CachedResults {
    version: VoteVersion,
    results: PollResults,
}

/// Computed results keyed by poll, valid only for the vote version they were computed at.
pub struct ResultsCache {
    entries: TtlStore<PollId, CachedResults>,
}

impl ResultsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: TtlStore::new(ttl),
        }
    }

    pub fn get(&self, poll_id: PollId, version: &VoteVersion) -> Option<PollResults> {
        self.entries
            .get(&poll_id)
            .filter(|cached| &cached.version == version)
            .map(|cached| cached.results)
    }

    pub fn put(&self, poll_id: PollId, version: VoteVersion, results: PollResults) {
        self.entries.insert(poll_id, CachedResults { version, results });
    }

    /// Returns true when a live entry was dropped.
    pub fn invalidate(&self, poll_id: PollId) -> bool {
        self.entries.remove(&poll_id)
    }

    pub fn contains(&self, poll_id: PollId) -> bool {
        self.entries.get(&poll_id).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        self.entries.purge_expired()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PollService {
    /// Vote totals and percentages for a poll, computed from live vote rows.
    ///
    /// The denormalized counters must agree with the live counts; a mismatch
    /// is reported as [`PollError::Consistency`] instead of being papered over.
    pub async fn results(&self, poll_id: PollId) -> Result<PollResults, PollError> {
        self.within("results", async {
            self.require_poll(poll_id).await?;

            // Read the version before the tally: a vote landing in between makes
            // the entry look older than it is, never newer.
            let version = self.store.vote_version(poll_id).await?;
            if let Some(results) = self.results_cache.get(poll_id, &version) {
                debug!(poll_id = %poll_id, "results cache hit");
                return Ok(results);
            }

            let tallied = self.store.tally(poll_id).await?;
            if let Some(drift) = tallied
                .iter()
                .find(|entry| entry.option.votes_count != entry.live_count)
            {
                return Err(PollError::consistency(format!(
                    "option {} counts {} votes but {} vote rows reference it",
                    drift.option.id, drift.option.votes_count, drift.live_count
                )));
            }

            let options = tally(tallied.iter().map(|entry| (&entry.option, entry.live_count)));
            let results = PollResults {
                poll_id,
                total_votes: options.iter().map(|option| option.votes_count).sum(),
                options,
            };
            self.results_cache.put(poll_id, version, results.clone());
            Ok(results)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OptionId;

    fn option(text: &str) -> PollOption {
        PollOption {
            id: OptionId::new(),
            poll_id: PollId::new(),
            text: text.to_string(),
            position: 0,
            votes_count: 0,
        }
    }

    #[test]
    fn no_votes_means_zero_percent_everywhere() {
        let (a, b) = (option("A"), option("B"));
        let results = tally([(&a, 0), (&b, 0)]);
        assert!(results.iter().all(|r| r.percentage == 0.0));
    }

    #[test]
    fn percentages_round_to_two_decimals_and_sum_to_about_100() {
        let (a, b, c) = (option("A"), option("B"), option("C"));
        let results = tally([(&a, 1), (&b, 1), (&c, 1)]);
        assert_eq!(results[0].percentage, 33.33);
        let sum: f64 = results.iter().map(|r| r.percentage).sum();
        assert!((sum - 100.0).abs() <= 0.01 * results.len() as f64);

        let results = tally([(&a, 2), (&b, 1)]);
        assert_eq!(results[0].percentage, 66.67);
        assert_eq!(results[1].percentage, 33.33);
    }

    #[test]
    fn single_vote_takes_everything() {
        let (a, b) = (option("A"), option("B"));
        let results = tally([(&a, 1), (&b, 0)]);
        assert_eq!(results[0].percentage, 100.0);
        assert_eq!(results[1].percentage, 0.0);
        assert_eq!(results[0].text, "A");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn percentages_sum_to_100_within_rounding(counts in prop::collection::vec(0i64..10_000, 1..12)) {
                let options: Vec<PollOption> = counts.iter().map(|_| option("X")).collect();
                let results = tally(options.iter().zip(counts.iter().copied()));
                let total: i64 = counts.iter().sum();

                prop_assert_eq!(results.len(), counts.len());
                prop_assert!(results.iter().all(|r| (0.0..=100.0).contains(&r.percentage)));
                let sum: f64 = results.iter().map(|r| r.percentage).sum();
                if total == 0 {
                    prop_assert_eq!(sum, 0.0);
                } else {
                    prop_assert!((sum - 100.0).abs() <= 0.005 * results.len() as f64 + 1e-9);
                }
            }
        }
    }

    #[tokio::test]
    async fn cache_ignores_entries_from_another_version() {
        let cache = ResultsCache::new(Duration::from_secs(30));
        let poll_id = PollId::new();
        let results = PollResults {
            poll_id,
            total_votes: 0,
            options: Vec::new(),
        };
        let v0 = VoteVersion::default();
        cache.put(poll_id, v0, results.clone());

        assert_eq!(cache.get(poll_id, &v0), Some(results));
        assert_eq!(cache.get(poll_id, &VoteVersion { revision: 1 }), None);
        assert!(cache.invalidate(poll_id));
        assert!(!cache.contains(poll_id));
    }
}
