//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{JobDbModel, JobStatus};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Job repository trait.
///
/// Status writes are compare-and-set: they only apply when the stored status
/// still equals the expected one, and report whether they did.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    /// Insert a scheduled run unless one already exists for the same
    /// `(scheduled_from, scheduled_for)`. Returns the stored run and whether
    /// this call created it.
    async fn insert_scheduled_run(&self, job: &JobDbModel) -> Result<(JobDbModel, bool)>;
    async fn transition(&self, id: &str, from: JobStatus, to: JobStatus) -> Result<bool>;
    /// Move a running job to its final status, recording the error message.
    async fn finish_job(&self, id: &str, to: JobStatus, error: Option<&str>) -> Result<bool>;
    /// `failed -> retrying`, consuming one retry.
    async fn schedule_retry(&self, id: &str) -> Result<bool>;
    /// Recompute aggregate counters from the job's transfers.
    async fn refresh_counters(&self, id: &str) -> Result<()>;
    async fn request_cancel(&self, id: &str) -> Result<bool>;
    async fn is_cancel_requested(&self, id: &str) -> Result<bool>;
    async fn list_schedule_definitions(&self) -> Result<Vec<JobDbModel>>;
    /// Advance the last-fired marker if it still holds `expected`.
    async fn advance_last_fired(&self, id: &str, expected: Option<i64>, fired_at: i64)
    -> Result<bool>;
    async fn set_schedule_enabled(&self, id: &str, enabled: bool) -> Result<()>;
    /// Jobs a restarted control plane must put back on the work queue.
    async fn list_recoverable_jobs(&self) -> Result<Vec<JobDbModel>>;
    async fn list_children(&self, parent_job_id: &str) -> Result<Vec<JobDbModel>>;
    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        retry_on_sqlite_busy("create_job", || async {
            insert_job(&self.pool, job, false).await?;
            Ok(())
        })
        .await
    }

    async fn insert_scheduled_run(&self, job: &JobDbModel) -> Result<(JobDbModel, bool)> {
        let (Some(from), Some(fire_time)) = (job.scheduled_from.as_deref(), job.scheduled_for)
        else {
            return Err(Error::validation(
                "scheduled run requires scheduled_from and scheduled_for",
            ));
        };

        let created = retry_on_sqlite_busy("insert_scheduled_run", || async {
            insert_job(&self.pool, job, true).await
        })
        .await?;

        let stored = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE scheduled_from = ? AND scheduled_for = ?",
        )
        .bind(from)
        .bind(fire_time)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("Job", job.id.clone()))?;

        Ok((stored, created))
    }

    async fn transition(&self, id: &str, from: JobStatus, to: JobStatus) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(Error::invalid_transition(from, to));
        }

        retry_on_sqlite_busy("transition_job", || async {
            let now = now_ms();
            let started_at = (to == JobStatus::Running).then_some(now);
            let completed_at = to.is_terminal().then_some(now);
            let result = sqlx::query(
                r#"
                UPDATE job
                SET status = ?,
                    updated_at = ?,
                    started_at = COALESCE(?, started_at),
                    completed_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(to.as_str())
            .bind(now)
            .bind(started_at)
            .bind(completed_at)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn finish_job(&self, id: &str, to: JobStatus, error: Option<&str>) -> Result<bool> {
        if !JobStatus::Running.can_transition_to(to) || !to.is_terminal() {
            return Err(Error::invalid_transition(JobStatus::Running, to));
        }

        retry_on_sqlite_busy("finish_job", || async {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                UPDATE job
                SET status = ?, error_message = ?, updated_at = ?, completed_at = ?
                WHERE id = ? AND status = 'running'
                "#,
            )
            .bind(to.as_str())
            .bind(error)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn schedule_retry(&self, id: &str) -> Result<bool> {
        retry_on_sqlite_busy("schedule_retry", || async {
            let result = sqlx::query(
                r#"
                UPDATE job
                SET status = 'retrying', retry_count = retry_count + 1,
                    completed_at = NULL, updated_at = ?
                WHERE id = ? AND status = 'failed'
                "#,
            )
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn refresh_counters(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("refresh_job_counters", || async {
            sqlx::query(
                r#"
                UPDATE job SET
                    files_total = (SELECT COUNT(*) FROM transfer WHERE job_id = job.id),
                    files_transferred = (SELECT COUNT(*) FROM transfer WHERE job_id = job.id AND status = 'completed'),
                    files_failed = (SELECT COUNT(*) FROM transfer WHERE job_id = job.id AND status = 'failed'),
                    bytes_total = (SELECT COALESCE(SUM(size_bytes), 0) FROM transfer WHERE job_id = job.id),
                    bytes_transferred = (SELECT COALESCE(SUM(bytes_transferred), 0) FROM transfer WHERE job_id = job.id),
                    updated_at = ?
                WHERE id = ?
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

    async fn request_cancel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job SET cancel_requested = 1, updated_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_cancel_requested(&self, id: &str) -> Result<bool> {
        let flag: Option<(bool,)> = sqlx::query_as("SELECT cancel_requested FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        flag.map(|(requested,)| requested)
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn list_schedule_definitions(&self) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM job
            WHERE schedule IS NOT NULL AND scheduled_from IS NULL AND schedule_enabled = 1
              AND status = 'pending'
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn advance_last_fired(
        &self,
        id: &str,
        expected: Option<i64>,
        fired_at: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("advance_last_fired", || async {
            let result = sqlx::query(
                "UPDATE job SET last_fired_at = ?, updated_at = ? WHERE id = ? AND last_fired_at IS ?",
            )
            .bind(fired_at)
            .bind(now_ms())
            .bind(id)
            .bind(expected)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn set_schedule_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE job SET schedule_enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Job", id));
        }
        Ok(())
    }

    async fn list_recoverable_jobs(&self) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM job
            WHERE status IN ('queued', 'retrying', 'running')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_children(&self, parent_job_id: &str) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE parent_job_id = ? ORDER BY created_at",
        )
        .bind(parent_job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE status = ? ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }
}

async fn insert_job(pool: &SqlitePool, job: &JobDbModel, ignore_conflict: bool) -> Result<bool> {
    let verb = if ignore_conflict {
        "INSERT OR IGNORE"
    } else {
        "INSERT"
    };
    let sql = format!(
        r#"
        {verb} INTO job (
            id, name, job_type, status, template_id, parent_job_id, scheduled_from, scheduled_for,
            source_endpoint_id, source_path, source_file, destination_endpoint_id, destination_path,
            target_name, file_pattern, schedule, schedule_timezone, schedule_enabled, last_fired_at,
            verify_checksum, files_total, files_transferred, files_failed, bytes_total,
            bytes_transferred, retry_count, max_retries, cancel_requested, error_message,
            created_at, updated_at, started_at, completed_at
        ) VALUES (
            ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
        )
        "#
    );
    let result = sqlx::query(&sql)
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.job_type)
        .bind(&job.status)
        .bind(&job.template_id)
        .bind(&job.parent_job_id)
        .bind(&job.scheduled_from)
        .bind(job.scheduled_for)
        .bind(&job.source_endpoint_id)
        .bind(&job.source_path)
        .bind(&job.source_file)
        .bind(&job.destination_endpoint_id)
        .bind(&job.destination_path)
        .bind(&job.target_name)
        .bind(&job.file_pattern)
        .bind(&job.schedule)
        .bind(&job.schedule_timezone)
        .bind(job.schedule_enabled)
        .bind(job.last_fired_at)
        .bind(job.verify_checksum)
        .bind(job.files_total)
        .bind(job.files_transferred)
        .bind(job.files_failed)
        .bind(job.bytes_total)
        .bind(job.bytes_transferred)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.cancel_requested)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{EndpointDbModel, JobType};
    use crate::database::repositories::{EndpointRepository, SqlxEndpointRepository};
    use crate::database::{init_pool, run_migrations};
    use transfer_executor::EndpointKind;

    async fn setup() -> (SqlxJobRepository, String) {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let endpoint = EndpointDbModel::new(
            "local",
            &EndpointKind::Local {
                root: "/data".into(),
            },
            2,
        )
        .unwrap();
        SqlxEndpointRepository::new(pool.clone())
            .create_endpoint(&endpoint)
            .await
            .unwrap();
        (SqlxJobRepository::new(pool), endpoint.id)
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (repo, ep) = setup().await;
        let job = JobDbModel::new(JobType::Manual, &ep, "in", &ep, "out");
        repo.create_job(&job).await.unwrap();

        assert!(
            repo.transition(&job.id, JobStatus::Pending, JobStatus::Queued)
                .await
                .unwrap()
        );
        // Stale expectation does not apply.
        assert!(
            !repo
                .transition(&job.id, JobStatus::Pending, JobStatus::Queued)
                .await
                .unwrap()
        );
        assert!(
            repo.transition(&job.id, JobStatus::Queued, JobStatus::Running)
                .await
                .unwrap()
        );
        let running = repo.get_job(&job.id).await.unwrap();
        assert_eq!(running.job_status().unwrap(), JobStatus::Running);
        assert!(running.started_at.is_some());
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let (repo, ep) = setup().await;
        let job = JobDbModel::new(JobType::Manual, &ep, "in", &ep, "out");
        repo.create_job(&job).await.unwrap();

        let err = repo
            .transition(&job.id, JobStatus::Pending, JobStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_finish_and_retry() {
        let (repo, ep) = setup().await;
        let mut job = JobDbModel::new(JobType::Manual, &ep, "in", &ep, "out");
        job.status = JobStatus::Running.as_str().to_string();
        job.max_retries = 2;
        repo.create_job(&job).await.unwrap();

        assert!(
            repo.finish_job(&job.id, JobStatus::Failed, Some("1 of 3 files failed"))
                .await
                .unwrap()
        );
        assert!(repo.schedule_retry(&job.id).await.unwrap());

        let stored = repo.get_job(&job.id).await.unwrap();
        assert_eq!(stored.job_status().unwrap(), JobStatus::Retrying);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error_message.as_deref(), Some("1 of 3 files failed"));
    }

    #[tokio::test]
    async fn test_scheduled_run_is_unique_per_fire_time() {
        let (repo, ep) = setup().await;
        let mut definition = JobDbModel::new(JobType::Scheduled, &ep, "in", &ep, "out");
        definition.schedule = Some("*/5 * * * *".into());
        repo.create_job(&definition).await.unwrap();

        let make_run = || {
            let mut run = JobDbModel::new(JobType::Scheduled, &ep, "in", &ep, "out");
            run.scheduled_from = Some(definition.id.clone());
            run.scheduled_for = Some(1_000);
            run
        };

        let (first, created) = repo.insert_scheduled_run(&make_run()).await.unwrap();
        assert!(created);
        let (second, created) = repo.insert_scheduled_run(&make_run()).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let definitions = repo.list_schedule_definitions().await.unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].id, definition.id);
    }

    #[tokio::test]
    async fn test_advance_last_fired_cas() {
        let (repo, ep) = setup().await;
        let mut definition = JobDbModel::new(JobType::Scheduled, &ep, "in", &ep, "out");
        definition.schedule = Some("0 * * * *".into());
        repo.create_job(&definition).await.unwrap();

        assert!(repo.advance_last_fired(&definition.id, None, 10).await.unwrap());
        assert!(!repo.advance_last_fired(&definition.id, None, 20).await.unwrap());
        assert!(repo.advance_last_fired(&definition.id, Some(10), 20).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_flag() {
        let (repo, ep) = setup().await;
        let job = JobDbModel::new(JobType::Manual, &ep, "in", &ep, "out");
        repo.create_job(&job).await.unwrap();

        assert!(!repo.is_cancel_requested(&job.id).await.unwrap());
        assert!(repo.request_cancel(&job.id).await.unwrap());
        assert!(repo.is_cancel_requested(&job.id).await.unwrap());
    }
}
