//! Executor trait and request/progress types.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, Result};
use crate::location::Location;

/// Safety and shaping options for a single invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorFlags {
    /// Write through a temporary file and rename into place.
    pub atomic_write: bool,
    /// Verify checksums after the copy.
    pub verify_checksum: bool,
    /// Bandwidth cap in KiB/s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_limit_kbps: Option<u64>,
}

impl Default for ExecutorFlags {
    fn default() -> Self {
        Self {
            atomic_write: true,
            verify_checksum: false,
            bandwidth_limit_kbps: None,
        }
    }
}

/// One executor invocation.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: Location,
    pub destination: Location,
    /// Include filter. `None` means `source` and `destination` are single files.
    pub pattern: Option<String>,
    pub flags: ExecutorFlags,
}

impl TransferRequest {
    /// Build a single-file request.
    pub fn file(source: Location, destination: Location, flags: ExecutorFlags) -> Self {
        Self {
            source,
            destination,
            pattern: None,
            flags,
        }
    }
}

/// Progress reported while a transfer runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub bytes_transferred: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_bytes_per_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
}

/// Summary of a successful transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferSummary {
    pub bytes_transferred: u64,
    pub duration: Duration,
}

/// Items yielded by [`TransferExecutor::execute`].
///
/// A well-behaved stream yields any number of `Progress` items followed by
/// exactly one `Finished`.
#[derive(Debug)]
pub enum ExecutorEvent {
    Progress(ProgressEvent),
    Finished(Result<TransferSummary>),
}

/// Event stream of a running transfer. Dropping it stops the transfer.
pub type ExecutorStream = BoxStream<'static, ExecutorEvent>;

/// A file discovered under a source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Path relative to the listed root, `/`-separated.
    pub relative_path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteFile {
    /// Last path component.
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }
}

/// The external tool that moves bytes between storage backends.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// Executor name for logs.
    fn name(&self) -> &'static str;

    /// Recursively list files under `root`.
    async fn list(&self, root: &Location) -> Result<Vec<RemoteFile>>;

    /// Describe a single file, `None` if it does not exist.
    async fn stat(&self, file: &Location) -> Result<Option<RemoteFile>>;

    /// Start a transfer.
    ///
    /// The returned stream owns the underlying process; dropping the stream
    /// before `Finished` terminates it.
    fn execute(&self, request: TransferRequest) -> ExecutorStream;
}

/// Drain an executor stream, returning the terminal outcome.
///
/// Progress items are forwarded to `on_progress`. A stream that ends without a
/// `Finished` item is reported as a protocol error.
pub async fn drive<F>(mut stream: ExecutorStream, mut on_progress: F) -> Result<TransferSummary>
where
    F: FnMut(ProgressEvent),
{
    use futures::StreamExt;

    while let Some(event) = stream.next().await {
        match event {
            ExecutorEvent::Progress(p) => on_progress(p),
            ExecutorEvent::Finished(outcome) => return outcome,
        }
    }
    Err(ExecutorError::Protocol(
        "executor stream ended without a result".to_string(),
    ))
}
