//! Manual job API.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::dispatch::Dispatcher;
use crate::database::models::{JobDbModel, JobStatus, JobType, TransferDbModel};
use crate::database::repositories::Repositories;
use crate::domain::{FilePattern, PathExpression};
use crate::scheduler::CronSchedule;
use crate::{Error, Result};

/// A one-off transfer requested by an operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(default)]
    pub name: Option<String>,
    pub source_endpoint_id: String,
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub file_pattern: String,
    pub destination_endpoint_id: String,
    #[serde(default)]
    pub destination_path: String,
    #[serde(default)]
    pub verify_checksum: bool,
}

/// A recurring transfer, either of its own paths or of a template's.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSchedule {
    /// Cron expression, 5 or 6 fields.
    pub schedule: String,
    #[serde(default)]
    pub timezone: Option<String>,
    /// Run this template on each fire. `job` paths are ignored when set.
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub job: NewJob,
}

pub struct JobService {
    repos: Repositories,
    dispatcher: Dispatcher,
    default_max_retries: u32,
}

impl JobService {
    pub fn new(repos: Repositories, dispatcher: Dispatcher, default_max_retries: u32) -> Self {
        Self {
            repos,
            dispatcher,
            default_max_retries,
        }
    }

    /// Create a manual job and queue it.
    pub async fn create_job(&self, request: NewJob) -> Result<JobDbModel> {
        self.validate(&request).await?;
        let job = self.build(JobType::Manual, &request);
        self.repos.jobs.create_job(&job).await?;
        self.queue_pending(job).await
    }

    /// Run a template now, over everything in its source directory.
    pub async fn trigger_template(&self, template_id: &str) -> Result<JobDbModel> {
        let template = self.repos.templates.get_template(template_id).await?;
        let request = NewJob {
            name: Some(template.name.clone()),
            source_endpoint_id: template.source_endpoint_id.clone(),
            source_path: template.source_path.clone(),
            file_pattern: template.file_pattern.clone(),
            destination_endpoint_id: template.destination_endpoint_id.clone(),
            destination_path: template.destination_path.clone(),
            verify_checksum: template.verify_checksum,
        };
        self.validate(&request).await?;
        let mut job = self.build(JobType::Manual, &request);
        job.template_id = Some(template.id);
        self.repos.jobs.create_job(&job).await?;
        self.queue_pending(job).await
    }

    /// Store a schedule definition. The Scheduler creates its runs.
    pub async fn create_scheduled_job(&self, request: NewSchedule) -> Result<JobDbModel> {
        CronSchedule::parse(&request.schedule, request.timezone.as_deref())?;

        let job_request = match request.template_id.as_deref() {
            Some(template_id) => {
                let template = self.repos.templates.get_template(template_id).await?;
                NewJob {
                    name: request.job.name.clone().or(Some(template.name.clone())),
                    source_endpoint_id: template.source_endpoint_id,
                    source_path: template.source_path,
                    file_pattern: template.file_pattern,
                    destination_endpoint_id: template.destination_endpoint_id,
                    destination_path: template.destination_path,
                    verify_checksum: template.verify_checksum,
                }
            }
            None => request.job.clone(),
        };
        self.validate(&job_request).await?;

        let mut definition = self.build(JobType::Scheduled, &job_request);
        definition.template_id = request.template_id.clone();
        definition.schedule = Some(request.schedule.trim().to_string());
        definition.schedule_timezone = request.timezone.clone();
        self.repos.jobs.create_job(&definition).await?;
        info!(
            job_id = %definition.id,
            schedule = %request.schedule,
            "Schedule created"
        );
        Ok(definition)
    }

    /// Cancel a job.
    ///
    /// Jobs that have not started are cancelled at once. A running job is
    /// flagged; its worker stops starting new files and finishes it as
    /// `cancelled`. A schedule definition is also disabled.
    pub async fn cancel_job(&self, job_id: &str) -> Result<JobDbModel> {
        let job = self.repos.jobs.get_job(job_id).await?;
        let status = job.job_status()?;
        let jobs = &self.repos.jobs;

        if job.is_schedule_definition() {
            jobs.set_schedule_enabled(job_id, false).await?;
        }

        let done = match status {
            JobStatus::Pending | JobStatus::Queued | JobStatus::Retrying => {
                jobs.transition(job_id, status, JobStatus::Cancelled).await?
            }
            JobStatus::Running => false,
            terminal => return Err(Error::invalid_transition(terminal, JobStatus::Cancelled)),
        };
        if !done {
            // Running, or picked up by a worker since it was read.
            if !jobs.request_cancel(job_id).await? {
                let current = jobs.get_job(job_id).await?.job_status()?;
                return Err(Error::invalid_transition(current, JobStatus::Cancelled));
            }
        }
        info!(job_id = %job_id, "Job cancellation requested");
        jobs.get_job(job_id).await
    }

    /// Queue a failed job again, regardless of its retry budget.
    pub async fn retry_job(&self, job_id: &str) -> Result<JobDbModel> {
        let job = self.repos.jobs.get_job(job_id).await?;
        let status = job.job_status()?;
        if status != JobStatus::Failed || !self.repos.jobs.schedule_retry(job_id).await? {
            return Err(Error::invalid_transition(status, JobStatus::Retrying));
        }
        let job = self.repos.jobs.get_job(job_id).await?;
        self.dispatcher.push(&job).await?;
        info!(job_id = %job_id, retry = job.retry_count, "Job retry requested");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobDbModel> {
        self.repos.jobs.get_job(job_id).await
    }

    pub async fn list_transfers(&self, job_id: &str) -> Result<Vec<TransferDbModel>> {
        // Surface unknown ids as NotFound rather than an empty list.
        self.repos.jobs.get_job(job_id).await?;
        self.repos.transfers.list_for_job(job_id).await
    }

    pub async fn list_children(&self, job_id: &str) -> Result<Vec<JobDbModel>> {
        self.repos.jobs.list_children(job_id).await
    }

    /// Pause or resume a schedule definition.
    pub async fn set_schedule_enabled(&self, job_id: &str, enabled: bool) -> Result<()> {
        let job = self.repos.jobs.get_job(job_id).await?;
        if !job.is_schedule_definition() {
            return Err(Error::validation(format!("job {} has no schedule", job_id)));
        }
        self.repos.jobs.set_schedule_enabled(job_id, enabled).await
    }

    async fn validate(&self, request: &NewJob) -> Result<()> {
        self.repos.endpoints.get_endpoint(&request.source_endpoint_id).await?;
        self.repos
            .endpoints
            .get_endpoint(&request.destination_endpoint_id)
            .await?;
        FilePattern::parse(&request.file_pattern)?;
        PathExpression::parse(&request.destination_path)?;
        Ok(())
    }

    fn build(&self, job_type: JobType, request: &NewJob) -> JobDbModel {
        let mut job = JobDbModel::new(
            job_type,
            &request.source_endpoint_id,
            &request.source_path,
            &request.destination_endpoint_id,
            &request.destination_path,
        );
        job.name = request.name.clone();
        job.file_pattern = request.file_pattern.clone();
        job.verify_checksum = request.verify_checksum;
        job.max_retries = i64::from(self.default_max_retries);
        job
    }

    async fn queue_pending(&self, job: JobDbModel) -> Result<JobDbModel> {
        self.repos
            .jobs
            .transition(&job.id, JobStatus::Pending, JobStatus::Queued)
            .await?;
        let job = self.repos.jobs.get_job(&job.id).await?;
        self.dispatcher.push(&job).await?;
        info!(job_id = %job.id, job = %job.display_name(), "Job created");
        Ok(job)
    }
}
