//! Job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::{Error, Result};

/// Job database model.
///
/// A Job moves the files matched under `source_path` on the source endpoint
/// to `destination_path` on the destination endpoint. Jobs with a `schedule`
/// and no `scheduled_from` are schedule definitions; the Scheduler creates
/// runs from them.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub name: Option<String>,
    /// manual, scheduled, event_triggered, chained
    pub job_type: String,
    /// pending, queued, running, completed, failed, cancelled, retrying
    pub status: String,
    pub template_id: Option<String>,
    pub parent_job_id: Option<String>,
    /// Schedule definition this run was created from.
    pub scheduled_from: Option<String>,
    /// Fire time (ms) this run was created for.
    pub scheduled_for: Option<i64>,
    pub source_endpoint_id: String,
    pub source_path: String,
    /// Exact file under `source_path` for single-file jobs.
    pub source_file: Option<String>,
    pub destination_endpoint_id: String,
    /// Path expression, or a literal directory when `target_name` is set.
    pub destination_path: String,
    /// Literal destination file name for single-file jobs.
    pub target_name: Option<String>,
    pub file_pattern: String,
    pub schedule: Option<String>,
    pub schedule_timezone: Option<String>,
    pub schedule_enabled: bool,
    pub last_fired_at: Option<i64>,
    pub verify_checksum: bool,
    pub files_total: i64,
    pub files_transferred: i64,
    pub files_failed: i64,
    pub bytes_total: i64,
    pub bytes_transferred: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub cancel_requested: bool,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl JobDbModel {
    pub fn new(
        job_type: JobType,
        source_endpoint_id: impl Into<String>,
        source_path: impl Into<String>,
        destination_endpoint_id: impl Into<String>,
        destination_path: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: None,
            job_type: job_type.as_str().to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            template_id: None,
            parent_job_id: None,
            scheduled_from: None,
            scheduled_for: None,
            source_endpoint_id: source_endpoint_id.into(),
            source_path: source_path.into(),
            source_file: None,
            destination_endpoint_id: destination_endpoint_id.into(),
            destination_path: destination_path.into(),
            target_name: None,
            file_pattern: String::new(),
            schedule: None,
            schedule_timezone: None,
            schedule_enabled: true,
            last_fired_at: None,
            verify_checksum: false,
            files_total: 0,
            files_transferred: 0,
            files_failed: 0,
            bytes_total: 0,
            bytes_transferred: 0,
            retry_count: 0,
            max_retries: 0,
            cancel_requested: false,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn job_status(&self) -> Result<JobStatus> {
        JobStatus::parse(&self.status)
            .ok_or_else(|| Error::validation(format!("Unknown job status '{}'", self.status)))
    }

    pub fn kind(&self) -> Option<JobType> {
        JobType::parse(&self.job_type)
    }

    /// A schedule definition rather than a runnable job.
    pub fn is_schedule_definition(&self) -> bool {
        self.schedule.is_some() && self.scheduled_from.is_none()
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Label for log lines.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Job lifecycle types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Manual,
    Scheduled,
    EventTriggered,
    Chained,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::EventTriggered => "event_triggered",
            Self::Chained => "chained",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// Job status values.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet handed to the work queue.
    Pending,
    /// In the work queue.
    Queued,
    /// Claimed by a worker.
    Running,
    Completed,
    /// Finished with failed transfers; terminal once retries are exhausted.
    Failed,
    Cancelled,
    /// Waiting out the retry backoff before going back to the queue.
    Retrying,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Terminal for the worker pool. A `failed` job only moves again through
    /// an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Queued)
                | (Failed, Retrying)
                | (Retrying, Queued)
                | (Retrying, Cancelled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Retrying,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
            assert_eq!(status.to_string(), status.as_str());
        }
        assert_eq!(JobStatus::parse("PROCESSING"), None);
    }

    #[test]
    fn test_job_type_strings() {
        assert_eq!(JobType::parse("event_triggered"), Some(JobType::EventTriggered));
        assert_eq!(JobType::Chained.to_string(), "chained");
    }

    #[test]
    fn test_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Retrying));
        assert!(JobStatus::Retrying.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn test_new_job_defaults() {
        let job = JobDbModel::new(JobType::Manual, "a", "in", "b", "out");
        assert_eq!(job.job_status().unwrap(), JobStatus::Pending);
        assert_eq!(job.kind(), Some(JobType::Manual));
        assert!(!job.is_schedule_definition());
        assert!(!job.retries_remaining());
    }
}
