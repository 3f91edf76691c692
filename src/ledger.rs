// src/ledger.rs
//! Vote ledger: the only code path that creates or removes votes, and with
//! them the only place `votes_count` changes outside of a sweep purge.

use tracing::info;

use crate::broadcast::PollEvent;
use crate::error::PollError;
use crate::models::{OptionId, PollId, PollSnapshot, UserId, UserSummary, Vote, VoteId, VoteOutcome};
use crate::services::PollService;
use crate::store::{RowLock, StoreError};

impl PollService {
    /// Records `voter`'s choice of `option_id` in `poll_id`.
    ///
    /// The vote row and the counter increment commit together. Two racing casts
    /// from the same voter are settled by the store's `(user_id, poll_id)`
    /// unique index: one commits, the other gets [`PollError::DuplicateVote`].
    pub async fn cast_vote(
        &self,
        voter: UserId,
        poll_id: PollId,
        option_id: OptionId,
    ) -> Result<VoteOutcome, PollError> {
        let now = self.clock.now();
        let (tx, outcome, voter_summary) = self
            .within("cast_vote", async {
                let mut tx = self.store.begin().await?;
                let poll = tx
                    .lock_poll(poll_id, RowLock::Share)
                    .await?
                    .ok_or_else(|| PollError::not_found("poll", poll_id))?;
                let option = tx
                    .lock_option(option_id)
                    .await?
                    .ok_or_else(|| PollError::not_found("option", option_id))?;
                if option.poll_id != poll.id {
                    return Err(PollError::consistency(format!(
                        "option {option_id} belongs to poll {}, not {poll_id}",
                        option.poll_id
                    )));
                }
                if !poll.is_votable(now) {
                    return Err(PollError::PollNotVotable);
                }
                let voter_user = tx
                    .user(voter)
                    .await?
                    .ok_or_else(|| PollError::not_found("user", voter))?;

                let vote = Vote {
                    id: VoteId::new(),
                    user_id: voter,
                    poll_id,
                    option_id,
                    created_at: now,
                };
                match tx.insert_vote(&vote).await {
                    Ok(()) => {}
                    Err(StoreError::UniqueViolation(_)) => return Err(PollError::DuplicateVote),
                    Err(err) => return Err(err.into()),
                }
                tx.add_votes(option_id, 1).await?;

                let snapshot = self.snapshot_in(&mut *tx, &poll).await?;
                Ok((
                    tx,
                    VoteOutcome {
                        vote,
                        poll: snapshot,
                    },
                    UserSummary::from(voter_user),
                ))
            })
            .await?;
        self.commit("cast_vote", tx).await?;

        self.results_cache.invalidate(poll_id);
        info!(
            target: "audit",
            poll_id = %poll_id,
            option_id = %option_id,
            user_id = %voter,
            "vote_cast"
        );
        self.publish(PollEvent::VoteCast {
            poll: outcome.poll.clone(),
            voter: voter_summary,
        });
        Ok(outcome)
    }

    /// Removes `voter`'s vote while its poll is still open and returns the resulting poll.
    pub async fn retract_vote(
        &self,
        voter: UserId,
        vote_id: VoteId,
    ) -> Result<PollSnapshot, PollError> {
        let now = self.clock.now();
        let (tx, poll_id, snapshot, voter_summary) = self
            .within("retract_vote", async {
                let mut tx = self.store.begin().await?;
                let vote = tx
                    .vote(vote_id)
                    .await?
                    .filter(|vote| vote.user_id == voter)
                    .ok_or_else(|| PollError::not_found("vote", vote_id))?;

                // Lock order matches cast_vote and the poll owner paths: poll, then option.
                let poll = tx
                    .lock_poll(vote.poll_id, RowLock::Share)
                    .await?
                    .ok_or_else(|| {
                        PollError::consistency(format!(
                            "vote {vote_id} references missing poll {}",
                            vote.poll_id
                        ))
                    })?;
                if !poll.is_votable(now) {
                    return Err(PollError::PollNotVotable);
                }
                let option = tx.lock_option(vote.option_id).await?.ok_or_else(|| {
                    PollError::consistency(format!(
                        "vote {vote_id} references missing option {}",
                        vote.option_id
                    ))
                })?;

                if !tx.delete_vote(vote_id).await? {
                    // Retracted concurrently between the read and the lock.
                    return Err(PollError::not_found("vote", vote_id));
                }
                if option.votes_count < 1 {
                    return Err(PollError::consistency(format!(
                        "votes_count of option {} would drop below zero",
                        option.id
                    )));
                }
                tx.add_votes(option.id, -1).await?;

                let voter_user = tx
                    .user(voter)
                    .await?
                    .ok_or_else(|| PollError::not_found("user", voter))?;
                let snapshot = self.snapshot_in(&mut *tx, &poll).await?;
                Ok((tx, poll.id, snapshot, UserSummary::from(voter_user)))
            })
            .await?;
        self.commit("retract_vote", tx).await?;

        self.results_cache.invalidate(poll_id);
        info!(
            target: "audit",
            poll_id = %poll_id,
            vote_id = %vote_id,
            user_id = %voter,
            "vote_removed"
        );
        self.publish(PollEvent::VoteRemoved {
            poll: snapshot.clone(),
            voter: voter_summary,
        });
        Ok(snapshot)
    }
}
