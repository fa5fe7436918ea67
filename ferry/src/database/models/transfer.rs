//! Per-file transfer records.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// One file's movement within a Job.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransferDbModel {
    pub id: String,
    pub job_id: String,
    pub file_name: String,
    /// Path relative to the job's source directory.
    pub source_path: String,
    /// Resolved path relative to the destination endpoint.
    pub destination_path: String,
    pub size_bytes: i64,
    pub status: String,
    pub progress_percent: f64,
    pub bytes_transferred: i64,
    pub retry_count: i64,
    pub error_message: Option<String>,
    /// Set when the last failure cannot be fixed by trying again.
    pub permanent_failure: bool,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl TransferDbModel {
    pub fn new(
        job_id: impl Into<String>,
        file_name: impl Into<String>,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            file_name: file_name.into(),
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            size_bytes: size_bytes as i64,
            status: TransferStatus::Pending.as_str().to_string(),
            progress_percent: 0.0,
            bytes_transferred: 0,
            retry_count: 0,
            error_message: None,
            permanent_failure: false,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn transfer_status(&self) -> Option<TransferStatus> {
        TransferStatus::parse(&self.status)
    }

    pub fn is_completed(&self) -> bool {
        self.transfer_status() == Some(TransferStatus::Completed)
    }

    /// Failed earlier with an error that another attempt will not fix.
    pub fn is_permanently_failed(&self) -> bool {
        self.permanent_failure && self.transfer_status() == Some(TransferStatus::Failed)
    }
}

/// Per-file status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Not started because the job was cancelled.
    Skipped,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}
