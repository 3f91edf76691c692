// src/store/postgres.rs
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::{RowLock, Store, StoreError, StoreTx, TalliedOption, VoteVersion};
use crate::models::{
    OptionId, Poll, PollId, PollOption, PollSort, Session, User, UserId, Vote, VoteId,
};

const POLL_COLUMNS: &str =
    "id, title, description, user_id, active, expires_at, created_at, updated_at";
const OPTION_COLUMNS: &str = "id, poll_id, text, position, votes_count";

#[derive(sqlx::FromRow)]
struct TallyRow {
    #[sqlx(flatten)]
    option: PollOption,
    live_count: i64,
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let mut tx = self.pool.begin().await?;
        // SET does not accept bind parameters.
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn poll(&self, id: PollId) -> Result<Option<Poll>, StoreError> {
        let poll = sqlx::query_as::<_, Poll>(&format!("SELECT {POLL_COLUMNS} FROM polls WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(poll)
    }

    async fn options(&self, poll_id: PollId) -> Result<Vec<PollOption>, StoreError> {
        let options = sqlx::query_as::<_, PollOption>(&format!(
            "SELECT {OPTION_COLUMNS} FROM options WHERE poll_id = $1 ORDER BY position"
        ))
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(options)
    }

    async fn user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT id, name FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn session(&self, token: &str) -> Result<Option<Session>, StoreError> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT token, user_id, expires_at FROM sessions WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn vote_version(&self, poll_id: PollId) -> Result<VoteVersion, StoreError> {
        let revision: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(vote_revision), 0)::BIGINT FROM options WHERE poll_id = $1",
        )
        .bind(poll_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(VoteVersion { revision })
    }

    async fn tally(&self, poll_id: PollId) -> Result<Vec<TalliedOption>, StoreError> {
        // One statement, so counters and live counts come from the same snapshot.
        let rows = sqlx::query_as::<_, TallyRow>(
            r#"
            SELECT o.id, o.poll_id, o.text, o.position, o.votes_count,
                   (SELECT COUNT(*) FROM votes v WHERE v.option_id = o.id) AS live_count
            FROM options o
            WHERE o.poll_id = $1
            ORDER BY o.position
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TalliedOption {
                option: row.option,
                live_count: row.live_count,
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
        let order_by = match sort {
            PollSort::Recent => "p.created_at DESC",
            PollSort::EndingSoon => "p.expires_at ASC",
            PollSort::Popular => {
                "(SELECT COALESCE(SUM(o.votes_count), 0) FROM options o WHERE o.poll_id = p.id) DESC, \
                 p.created_at DESC"
            }
        };
        let polls = sqlx::query_as::<_, Poll>(&format!(
            r#"
            SELECT p.id, p.title, p.description, p.user_id, p.active,
                   p.expires_at, p.created_at, p.updated_at
            FROM polls p
            WHERE p.active AND p.expires_at > $1
            ORDER BY {order_by}
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(now)
        .bind(i64::from(limit))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM polls WHERE active AND expires_at > $1")
                .bind(now)
                .fetch_one(&self.pool)
                .await?;

        Ok((polls, total))
    }

    async fn polls_by_owner(&self, owner: UserId) -> Result<Vec<Poll>, StoreError> {
        let polls = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(polls)
    }

    async fn expired_poll_ids(&self, now: DateTime<Utc>) -> Result<Vec<PollId>, StoreError> {
        let ids = sqlx::query_scalar::<_, PollId>("SELECT id FROM polls WHERE expires_at <= $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn stale_poll_ids(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PollId>, StoreError> {
        let ids = sqlx::query_scalar::<_, PollId>(
            r#"
            SELECT p.id FROM polls p
            WHERE NOT p.active
              AND p.created_at < $1
              AND EXISTS (SELECT 1 FROM votes v WHERE v.poll_id = p.id)
            "#,
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn votes_per_hour(
        &self,
        poll_id: PollId,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, i64)>, StoreError> {
        let buckets = sqlx::query_as::<_, (DateTime<Utc>, i64)>(
            r#"
            SELECT date_trunc('hour', created_at) AS hour, COUNT(*)
            FROM votes
            WHERE poll_id = $1 AND created_at >= $2
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(poll_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(buckets)
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn lock_poll(&mut self, id: PollId, lock: RowLock) -> Result<Option<Poll>, StoreError> {
        let clause = match lock {
            RowLock::Share => "FOR SHARE",
            RowLock::Update => "FOR UPDATE",
        };
        let poll = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE id = $1 {clause}"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(poll)
    }

    async fn options(&mut self, poll_id: PollId) -> Result<Vec<PollOption>, StoreError> {
        let options = sqlx::query_as::<_, PollOption>(&format!(
            "SELECT {OPTION_COLUMNS} FROM options WHERE poll_id = $1 ORDER BY position"
        ))
        .bind(poll_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(options)
    }

    async fn lock_option(&mut self, id: OptionId) -> Result<Option<PollOption>, StoreError> {
        let option = sqlx::query_as::<_, PollOption>(&format!(
            "SELECT {OPTION_COLUMNS} FROM options WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(option)
    }

    async fn user(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT id, name FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn vote(&mut self, id: VoteId) -> Result<Option<Vote>, StoreError> {
        let vote = sqlx::query_as::<_, Vote>(
            "SELECT id, user_id, poll_id, option_id, created_at FROM votes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(vote)
    }

    async fn insert_poll(&mut self, poll: &Poll) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO polls (id, title, description, user_id, active, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(poll.id)
        .bind(&poll.title)
        .bind(&poll.description)
        .bind(poll.user_id)
        .bind(poll.active)
        .bind(poll.expires_at)
        .bind(poll.created_at)
        .bind(poll.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_option(&mut self, option: &PollOption) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO options (id, poll_id, text, position, votes_count) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(option.id)
        .bind(option.poll_id)
        .bind(&option.text)
        .bind(option.position)
        .bind(option.votes_count)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_poll(&mut self, poll: &Poll) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE polls
            SET title = $2, description = $3, active = $4, expires_at = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(poll.id)
        .bind(&poll.title)
        .bind(&poll.description)
        .bind(poll.active)
        .bind(poll.expires_at)
        .bind(poll.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_poll(&mut self, id: PollId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM polls WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_vote(&mut self, vote: &Vote) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO votes (id, user_id, poll_id, option_id, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(vote.id)
        .bind(vote.user_id)
        .bind(vote.poll_id)
        .bind(vote.option_id)
        .bind(vote.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_vote(&mut self, id: VoteId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM votes WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_votes(&mut self, option_id: OptionId, delta: i64) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE options
            SET votes_count = votes_count + $2, vote_revision = vote_revision + 1
            WHERE id = $1
            RETURNING votes_count
            "#,
        )
        .bind(option_id)
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::Database(format!("option {option_id} does not exist")))
    }

    async fn deactivate_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<PollId>, StoreError> {
        let ids = sqlx::query_scalar::<_, PollId>(
            r#"
            UPDATE polls SET active = FALSE, updated_at = $1
            WHERE active AND expires_at <= $1
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn purge_votes(&mut self, poll_id: PollId) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM votes WHERE poll_id = $1")
            .bind(poll_id)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        sqlx::query(
            "UPDATE options SET votes_count = 0, vote_revision = vote_revision + 1 WHERE poll_id = $1",
        )
            .bind(poll_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(deleted)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
