//! Engine event broadcast for observers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::database::models::{JobStatus, JobType};

/// Lifecycle events published by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    JobQueued {
        job_id: String,
        job_type: JobType,
    },
    JobStarted {
        job_id: String,
        files_total: u64,
    },
    TransferProgress {
        job_id: String,
        transfer_id: String,
        bytes_transferred: u64,
        percent: f64,
    },
    TransferCompleted {
        job_id: String,
        transfer_id: String,
        destination_path: String,
    },
    TransferFailed {
        job_id: String,
        transfer_id: String,
        error: String,
    },
    JobFinished {
        job_id: String,
        status: JobStatus,
    },
    /// The job failed and will run again after a backoff.
    JobRetryScheduled {
        job_id: String,
        retry_count: u32,
        delay_ms: u64,
    },
    ChainJobCreated {
        parent_job_id: String,
        chain_job_id: String,
        source_path: String,
    },
}

/// Cloneable publisher handle.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
