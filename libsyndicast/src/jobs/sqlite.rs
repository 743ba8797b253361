//! Durable queue engine backed by the `jobs` table

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use super::queue::{
    duration_ms, ensure_queue, invalid_state, lease_lost, now_ms, JobQueue, LEASE_EXPIRED,
};
use super::types::{FailOutcome, Job, JobPayload, JobState, QueueName, QueueOptions, QueueStats};
use crate::db::Database;
use crate::error::{DbError, QueueError, Result, SyndicastError};

const JOB_COLUMNS: &str = "id, queue, payload, state, attempts_made, max_attempts, run_at, \
                           locked_until, last_error, created_at, finished_at";

/// SQLite queue engine.
///
/// Claims are a single `UPDATE ... RETURNING` statement, so two workers can
/// never lease the same job.
#[derive(Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
    name: QueueName,
    options: QueueOptions,
}

impl SqliteJobQueue {
    pub fn new(db: &Database, name: QueueName, options: QueueOptions) -> Self {
        Self {
            pool: db.pool().clone(),
            name,
            options,
        }
    }

    async fn fetch(&self, job_id: &str) -> Result<Job> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ? AND queue = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(self.name.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        job_from_row(&row)
    }

    /// Why an update guarded on `claimed`'s lease matched no row
    async fn unsettled(&self, claimed: &Job) -> SyndicastError {
        match self.fetch(&claimed.id).await {
            Ok(job) if job.state != JobState::Active => invalid_state(&job, "active").into(),
            Ok(_) => lease_lost(claimed).into(),
            Err(e) => e,
        }
    }

    async fn reap_expired(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed', locked_until = NULL, last_error = ?, finished_at = ?
            WHERE queue = ? AND state = 'active' AND locked_until <= ?
              AND attempts_made >= max_attempts
            "#,
        )
        .bind(LEASE_EXPIRED)
        .bind(now)
        .bind(self.name.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected())
    }

    /// Apply the retention policy to finished jobs
    async fn prune(&self, now: i64) -> Result<()> {
        let retention = &self.options.retention;
        let cutoff = now.saturating_sub(duration_ms(retention.completed_max_age));

        sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue = ? AND state = 'completed' AND finished_at < ?
            "#,
        )
        .bind(self.name.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        for (state, keep) in [
            (JobState::Completed, retention.keep_completed),
            (JobState::Failed, retention.keep_failed),
        ] {
            let keep = i64::try_from(keep).unwrap_or(i64::MAX);
            sqlx::query(
                r#"
                DELETE FROM jobs
                WHERE queue = ?1 AND state = ?2 AND id NOT IN (
                    SELECT id FROM jobs
                    WHERE queue = ?1 AND state = ?2
                    ORDER BY finished_at DESC, rowid DESC
                    LIMIT ?3
                )
                "#,
            )
            .bind(self.name.as_str())
            .bind(state.as_str())
            .bind(keep)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        }

        Ok(())
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let queue: QueueName = row
        .get::<String, _>("queue")
        .parse()
        .map_err(|message| DbError::Decode {
            column: "jobs.queue",
            message,
        })?;
    let state: JobState = row
        .get::<String, _>("state")
        .parse()
        .map_err(|message| DbError::Decode {
            column: "jobs.state",
            message,
        })?;
    let payload = JobPayload::decode(queue, &row.get::<String, _>("payload")).map_err(|e| {
        DbError::Decode {
            column: "jobs.payload",
            message: e.to_string(),
        }
    })?;

    Ok(Job {
        id: row.get("id"),
        queue,
        payload,
        state,
        attempts_made: u32::try_from(row.get::<i64, _>("attempts_made")).unwrap_or(0),
        max_attempts: u32::try_from(row.get::<i64, _>("max_attempts")).unwrap_or(1),
        run_at: row.get("run_at"),
        locked_until: row.get("locked_until"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        finished_at: row.get("finished_at"),
    })
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    fn name(&self) -> QueueName {
        self.name
    }

    fn options(&self) -> &QueueOptions {
        &self.options
    }

    async fn enqueue_at(&self, payload: JobPayload, run_at: i64) -> Result<Job> {
        ensure_queue(self.name, &payload)?;
        let encoded = payload
            .encode()
            .map_err(|e| QueueError::Encode(e.to_string()))?;
        let job = Job::new(payload, self.options.retry.max_attempts, run_at);

        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, payload, state, attempts_made, max_attempts, run_at, created_at)
            VALUES (?, ?, ?, 'waiting', 0, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(self.name.as_str())
        .bind(encoded)
        .bind(i64::from(job.max_attempts))
        .bind(job.run_at)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        tracing::debug!(job_id = %job.id, queue = %self.name, run_at = job.run_at, "Enqueued job");
        Ok(job)
    }

    async fn claim(&self, lease: Duration) -> Result<Option<Job>> {
        let now = now_ms();
        if self.reap_expired(now).await? > 0 {
            self.prune(now).await?;
        }

        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'active', attempts_made = attempts_made + 1, locked_until = ?1
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ?2
                  AND ((state = 'waiting' AND run_at <= ?3)
                    OR (state = 'active' AND locked_until <= ?3))
                ORDER BY run_at, rowid
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(now.saturating_add(duration_ms(lease)))
            .bind(self.name.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete(&self, claimed: &Job) -> Result<()> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed', locked_until = NULL, finished_at = ?
            WHERE id = ? AND queue = ? AND state = 'active' AND attempts_made = ?
            "#,
        )
        .bind(now)
        .bind(&claimed.id)
        .bind(self.name.as_str())
        .bind(i64::from(claimed.attempts_made))
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(self.unsettled(claimed).await);
        }

        self.prune(now).await
    }

    async fn fail(&self, claimed: &Job, error: &str, retryable: bool) -> Result<FailOutcome> {
        let now = now_ms();
        let job = self.fetch(&claimed.id).await?;
        if job.state != JobState::Active {
            return Err(invalid_state(&job, "active").into());
        }
        if job.attempts_made != claimed.attempts_made {
            return Err(lease_lost(claimed).into());
        }

        if retryable && job.attempts_made < job.max_attempts {
            let delay = self.options.retry.delay_for_attempt(job.attempts_made);
            let run_at = now.saturating_add(duration_ms(delay));
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'waiting', locked_until = NULL, last_error = ?, run_at = ?
                WHERE id = ? AND state = 'active' AND attempts_made = ?
                "#,
            )
            .bind(error)
            .bind(run_at)
            .bind(&claimed.id)
            .bind(i64::from(claimed.attempts_made))
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
            if result.rows_affected() == 0 {
                return Err(self.unsettled(claimed).await);
            }
            return Ok(FailOutcome::Retrying { run_at });
        }

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed', locked_until = NULL, last_error = ?, finished_at = ?
            WHERE id = ? AND state = 'active' AND attempts_made = ?
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(&claimed.id)
        .bind(i64::from(claimed.attempts_made))
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        if result.rows_affected() == 0 {
            return Err(self.unsettled(claimed).await);
        }

        self.prune(now).await?;
        Ok(FailOutcome::Failed)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        match self.fetch(job_id).await {
            Ok(job) => Ok(Some(job)),
            Err(SyndicastError::Queue(QueueError::JobNotFound(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {} FROM jobs
            WHERE queue = ?1 AND (?2 IS NULL OR state = ?2)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?3
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(self.name.as_str())
            .bind(state.map(|s| s.as_str()))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN state = 'waiting' AND run_at <= ?2 THEN 1 ELSE 0 END), 0) AS waiting,
                COALESCE(SUM(CASE WHEN state = 'waiting' AND run_at > ?2 THEN 1 ELSE 0 END), 0) AS delayed,
                COALESCE(SUM(CASE WHEN state = 'active' THEN 1 ELSE 0 END), 0) AS active,
                COALESCE(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0) AS failed
            FROM jobs WHERE queue = ?1
            "#,
        )
        .bind(self.name.as_str())
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let count = |column: &str| usize::try_from(row.get::<i64, _>(column)).unwrap_or(0);
        Ok(QueueStats {
            waiting: count("waiting"),
            delayed: count("delayed"),
            active: count("active"),
            completed: count("completed"),
            failed: count("failed"),
        })
    }

    async fn retry_failed(&self) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'waiting', attempts_made = 0, run_at = ?, finished_at = NULL
            WHERE queue = ? AND state = 'failed'
            "#,
        )
        .bind(now_ms())
        .bind(self.name.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}
