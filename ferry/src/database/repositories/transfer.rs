//! Transfer repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::TransferDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

#[async_trait]
pub trait TransferRepository: Send + Sync {
    async fn get_transfer(&self, id: &str) -> Result<TransferDbModel>;
    /// Insert a planned transfer unless the job already has one for the same
    /// source path, returning the stored record either way.
    async fn upsert_planned(&self, transfer: &TransferDbModel) -> Result<TransferDbModel>;
    async fn list_for_job(&self, job_id: &str) -> Result<Vec<TransferDbModel>>;
    async fn mark_running(&self, id: &str) -> Result<()>;
    async fn update_progress(&self, id: &str, bytes_transferred: u64, percent: f64) -> Result<()>;
    async fn mark_completed(&self, id: &str, bytes_transferred: u64) -> Result<()>;
    /// Record a failure. `permanent` failures are not attempted again when the
    /// job is retried.
    async fn mark_failed(&self, id: &str, error: &str, retry_count: u32, permanent: bool)
    -> Result<()>;
    /// Skip every transfer of the job that never started.
    async fn skip_pending(&self, job_id: &str, reason: &str) -> Result<u64>;
}

/// SQLx implementation of TransferRepository.
pub struct SqlxTransferRepository {
    pool: SqlitePool,
}

impl SqlxTransferRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransferRepository for SqlxTransferRepository {
    async fn get_transfer(&self, id: &str) -> Result<TransferDbModel> {
        sqlx::query_as::<_, TransferDbModel>("SELECT * FROM transfer WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Transfer", id))
    }

    async fn upsert_planned(&self, transfer: &TransferDbModel) -> Result<TransferDbModel> {
        retry_on_sqlite_busy("upsert_transfer", || async {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO transfer (
                    id, job_id, file_name, source_path, destination_path, size_bytes, status,
                    progress_percent, bytes_transferred, retry_count, error_message, created_at,
                    started_at, completed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&transfer.id)
            .bind(&transfer.job_id)
            .bind(&transfer.file_name)
            .bind(&transfer.source_path)
            .bind(&transfer.destination_path)
            .bind(transfer.size_bytes)
            .bind(&transfer.status)
            .bind(transfer.progress_percent)
            .bind(transfer.bytes_transferred)
            .bind(transfer.retry_count)
            .bind(&transfer.error_message)
            .bind(transfer.created_at)
            .bind(transfer.started_at)
            .bind(transfer.completed_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;

        sqlx::query_as::<_, TransferDbModel>(
            "SELECT * FROM transfer WHERE job_id = ? AND source_path = ?",
        )
        .bind(&transfer.job_id)
        .bind(&transfer.source_path)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("Transfer", transfer.id.clone()))
    }

    async fn list_for_job(&self, job_id: &str) -> Result<Vec<TransferDbModel>> {
        let transfers = sqlx::query_as::<_, TransferDbModel>(
            "SELECT * FROM transfer WHERE job_id = ? ORDER BY source_path",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(transfers)
    }

    async fn mark_running(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("mark_transfer_running", || async {
            sqlx::query(
                r#"
                UPDATE transfer
                SET status = 'running', started_at = ?, error_message = NULL,
                    permanent_failure = 0, progress_percent = 0, bytes_transferred = 0
                WHERE id = ? AND status != 'completed'
                "#,
            )
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn update_progress(&self, id: &str, bytes_transferred: u64, percent: f64) -> Result<()> {
        sqlx::query(
            "UPDATE transfer SET bytes_transferred = ?, progress_percent = ? WHERE id = ? AND status = 'running'",
        )
        .bind(bytes_transferred as i64)
        .bind(percent.clamp(0.0, 100.0))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed(&self, id: &str, bytes_transferred: u64) -> Result<()> {
        retry_on_sqlite_busy("mark_transfer_completed", || async {
            sqlx::query(
                r#"
                UPDATE transfer
                SET status = 'completed', progress_percent = 100,
                    bytes_transferred = MAX(?, size_bytes), error_message = NULL, completed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(bytes_transferred as i64)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        retry_count: u32,
        permanent: bool,
    ) -> Result<()> {
        retry_on_sqlite_busy("mark_transfer_failed", || async {
            sqlx::query(
                r#"
                UPDATE transfer
                SET status = 'failed', error_message = ?, retry_count = retry_count + ?,
                    permanent_failure = ?, completed_at = ?
                WHERE id = ? AND status != 'completed'
                "#,
            )
            .bind(error)
            .bind(i64::from(retry_count))
            .bind(permanent)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn skip_pending(&self, job_id: &str, reason: &str) -> Result<u64> {
        retry_on_sqlite_busy("skip_pending_transfers", || async {
            let result = sqlx::query(
                r#"
                UPDATE transfer
                SET status = 'skipped', error_message = ?, completed_at = ?
                WHERE job_id = ? AND status = 'pending'
                "#,
            )
            .bind(reason)
            .bind(now_ms())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
