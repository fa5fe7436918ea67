//! Processed trigger events.
//!
//! One row per `(event key, template)` that has been turned into a job. Rows
//! outlive the process, so a redelivery after a restart is still recognized.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::time::Duration;

use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::Result;

#[async_trait]
pub trait ProcessedEventRepository: Send + Sync {
    /// Reserve `(event_key, template_id)` for `job_id` until `ttl` has passed.
    ///
    /// Returns false when the pair is already held by a live reservation. A
    /// reservation is taken over once it has expired, or when it is older than
    /// `abandoned_after` and its job was never created.
    async fn claim(
        &self,
        event_key: &str,
        template_id: &str,
        job_id: &str,
        ttl: Duration,
        abandoned_after: Duration,
    ) -> Result<bool>;

    /// Drop a reservation whose job could not be created.
    ///
    /// The row is kept when the job exists after all.
    async fn release(&self, event_key: &str, template_id: &str, job_id: &str) -> Result<bool>;

    /// Delete expired reservations.
    async fn purge_expired(&self) -> Result<u64>;
}

/// SQLx implementation of ProcessedEventRepository.
pub struct SqlxProcessedEventRepository {
    pool: SqlitePool,
}

impl SqlxProcessedEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl ProcessedEventRepository for SqlxProcessedEventRepository {
    async fn claim(
        &self,
        event_key: &str,
        template_id: &str,
        job_id: &str,
        ttl: Duration,
        abandoned_after: Duration,
    ) -> Result<bool> {
        retry_on_sqlite_busy("claim_processed_event", || async {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                INSERT INTO processed_event (event_key, template_id, job_id, processed_at, expires_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (event_key, template_id) DO UPDATE
                SET job_id = excluded.job_id,
                    processed_at = excluded.processed_at,
                    expires_at = excluded.expires_at
                WHERE processed_event.expires_at <= excluded.processed_at
                   OR (processed_event.processed_at <= ?
                       AND NOT EXISTS (SELECT 1 FROM job WHERE job.id = processed_event.job_id))
                "#,
            )
            .bind(event_key)
            .bind(template_id)
            .bind(job_id)
            .bind(now)
            .bind(now.saturating_add(millis(ttl)))
            .bind(now.saturating_sub(millis(abandoned_after)))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn release(&self, event_key: &str, template_id: &str, job_id: &str) -> Result<bool> {
        retry_on_sqlite_busy("release_processed_event", || async {
            let result = sqlx::query(
                r#"
                DELETE FROM processed_event
                WHERE event_key = ? AND template_id = ? AND job_id = ?
                  AND NOT EXISTS (SELECT 1 FROM job WHERE job.id = ?)
                "#,
            )
            .bind(event_key)
            .bind(template_id)
            .bind(job_id)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processed_event WHERE expires_at <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
