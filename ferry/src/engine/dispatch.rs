//! Hand-off of new jobs from trigger sources to the work queue.

use std::sync::Arc;
use tracing::debug;

use super::events::{EngineEvent, EventBus};
use super::work_queue::WorkQueue;
use crate::database::models::{JobDbModel, JobStatus};
use crate::database::repositories::JobRepository;
use crate::Result;

/// Shared by the Scheduler, Event Monitor, Chain Job Service and manual API.
#[derive(Clone)]
pub struct Dispatcher {
    jobs: Arc<dyn JobRepository>,
    queue: Arc<dyn WorkQueue>,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(jobs: Arc<dyn JobRepository>, queue: Arc<dyn WorkQueue>, events: EventBus) -> Self {
        Self { jobs, queue, events }
    }

    pub fn jobs(&self) -> &Arc<dyn JobRepository> {
        &self.jobs
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Store a new job as `queued` and enqueue it.
    ///
    /// If enqueueing fails the job stays `queued` in the store and is picked
    /// up again by startup recovery.
    pub async fn submit(&self, mut job: JobDbModel) -> Result<JobDbModel> {
        job.status = JobStatus::Queued.as_str().to_string();
        self.jobs.create_job(&job).await?;
        self.push(&job).await?;
        Ok(job)
    }

    /// Enqueue a job that is already stored as `queued`.
    pub async fn push(&self, job: &JobDbModel) -> Result<()> {
        let added = self.queue.enqueue(&job.id).await?;
        if added {
            debug!(job_id = %job.id, job_type = %job.job_type, "Job enqueued");
            if let Some(job_type) = job.kind() {
                self.events.publish(EngineEvent::JobQueued {
                    job_id: job.id.clone(),
                    job_type,
                });
            }
        }
        Ok(())
    }
}
