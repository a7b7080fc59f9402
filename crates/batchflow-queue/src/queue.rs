//! Durable, at-least-once job queue (spec §4.4), backed by the `jobs` table
//! provisioned alongside the rest of the schema in `batchflow-store`'s
//! migrations.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::Result;
use crate::job::{Job, JobRow};

#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: PgPool,
}

const ENQUEUE_SINGLETON: &str = r#"
    INSERT INTO jobs (kind, subject_id, args, run_at, max_attempts, singleton)
    VALUES ($1, $2, $3, $4, $5, true)
    ON CONFLICT (kind, subject_id) WHERE singleton AND status IN ('pending', 'running')
    DO NOTHING
    RETURNING id
"#;

const ENQUEUE_PLAIN: &str = r#"
    INSERT INTO jobs (kind, subject_id, args, run_at, max_attempts, singleton)
    VALUES ($1, $2, $3, $4, $5, false)
    RETURNING id
"#;

const CLAIM_ONE: &str = r#"
    UPDATE jobs
    SET status = 'running', locked_by = $2, locked_at = now(), attempts = attempts + 1, updated_at = now()
    WHERE id = (
        SELECT id FROM jobs
        WHERE kind = $1 AND status = 'pending' AND run_at <= now()
        ORDER BY run_at ASC, id ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING *
"#;

const COMPLETE: &str = "UPDATE jobs SET status = 'done', updated_at = now() WHERE id = $1";

const RESCHEDULE: &str = r#"
    UPDATE jobs SET status = 'pending', run_at = $2, last_error = $3, locked_by = NULL, locked_at = NULL, updated_at = now()
    WHERE id = $1
"#;

const MARK_FAILED: &str = r#"
    UPDATE jobs SET status = 'failed', last_error = $2, locked_by = NULL, updated_at = now()
    WHERE id = $1
"#;

const RECLAIM_STALE: &str = r#"
    UPDATE jobs SET status = 'pending', locked_by = NULL, locked_at = NULL, updated_at = now()
    WHERE status = 'running' AND locked_at < now() - ($1 * INTERVAL '1 second')
"#;

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, args), fields(%kind, %subject_id))]
    pub async fn enqueue(
        &self,
        kind: &str,
        subject_id: &str,
        args: serde_json::Value,
        run_at: Option<DateTime<Utc>>,
        max_attempts: i32,
        singleton: bool,
    ) -> Result<Option<i64>> {
        let run_at = run_at.unwrap_or_else(Utc::now);
        let id: Option<i64> = if singleton {
            sqlx::query_scalar(ENQUEUE_SINGLETON)
                .bind(kind)
                .bind(subject_id)
                .bind(args)
                .bind(run_at)
                .bind(max_attempts)
                .fetch_optional(&self.pool)
                .await?
        } else {
            sqlx::query_scalar(ENQUEUE_PLAIN)
                .bind(kind)
                .bind(subject_id)
                .bind(args)
                .bind(run_at)
                .bind(max_attempts)
                .fetch_optional(&self.pool)
                .await?
        };
        Ok(id)
    }

    /// Claims at most one `pending`, due job of `kind`, row-locked via
    /// `FOR UPDATE SKIP LOCKED` so concurrent pollers never double-claim.
    pub async fn claim_one(&self, kind: &str, worker_id: &str) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(CLAIM_ONE).bind(kind).bind(worker_id).fetch_optional(&self.pool).await?;
        Ok(row.map(JobRow::into_job))
    }

    pub async fn complete(&self, job_id: i64) -> Result<()> {
        sqlx::query(COMPLETE).bind(job_id).execute(&self.pool).await?;
        Ok(())
    }

    /// Reschedules with exponential backoff, or marks permanently `failed`
    /// once `attempts >= max_attempts` (spec §4.4).
    pub async fn fail(&self, job: &Job, error: &str) -> Result<()> {
        if job.attempts >= job.max_attempts {
            sqlx::query(MARK_FAILED).bind(job.id).bind(error).execute(&self.pool).await?;
        } else {
            let backoff_secs = backoff_seconds(job.attempts);
            let run_at = Utc::now() + chrono::Duration::seconds(backoff_secs);
            sqlx::query(RESCHEDULE).bind(job.id).bind(run_at).bind(error).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Reclaims jobs whose worker died without heartbeating (spec §4.4
    /// "heartbeat/lease so a dead worker's job is reclaimed after a timeout").
    pub async fn reclaim_stale_leases(&self, lease_timeout_secs: i64) -> Result<u64> {
        let result = sqlx::query(RECLAIM_STALE).bind(lease_timeout_secs).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

/// 30s, 60s, 120s, ... capped at 1h — same shape as the corpus's
/// `increment_retry` backoff for `pending_batches`.
fn backoff_seconds(attempts: i32) -> i64 {
    let exp = (attempts - 1).max(0) as u32;
    (30_i64.saturating_mul(2_i64.saturating_pow(exp))).min(3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_seconds(1), 30);
        assert_eq!(backoff_seconds(2), 60);
        assert_eq!(backoff_seconds(3), 120);
        assert_eq!(backoff_seconds(10), 3600);
    }
}
