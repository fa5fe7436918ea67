//! Execution of one claimed job.
//!
//! A run moves the job `queued -> running`, plans its files, then works
//! through them with bounded parallelism. Every executor invocation is
//! bracketed by a destination slot from the [`ThrottleController`]. When all
//! files are terminal the job is finished and its queue claim acked, or nacked
//! with a backoff when a job-level retry is due.

use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use transfer_executor::{
    EndpointKind, ExecutorError, ExecutorEvent, ExecutorFlags, Location, TransferExecutor,
    TransferRequest, TransferSummary,
};

use super::chain::{ChainJobService, LandedFile};
use super::events::{EngineEvent, EventBus};
use super::planner::{self, PlannedFile};
use super::progress::ProgressTracker;
use super::throttle::{Admission, SlotGuard, ThrottleController};
use super::work_queue::{Claim, WorkQueue};
use crate::config::EngineConfig;
use crate::database::models::{ChainRule, JobDbModel, JobStatus, TransferDbModel, TransferStatus};
use crate::database::repositories::{JobRepository, Repositories};
use crate::domain::RetryPolicy;
use crate::{Error, Result};

/// Knobs of a job run.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub file_parallelism: usize,
    pub heartbeat_interval: Duration,
    pub cancel_poll: Duration,
    pub progress_flush: Duration,
    pub stall_timeout: Duration,
    pub job_timeout: Option<Duration>,
    pub atomic_write: bool,
    pub transfer_retry: RetryPolicy,
    pub job_retry: RetryPolicy,
}

impl RunnerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            file_parallelism: config.worker_pool.file_parallelism.max(1),
            heartbeat_interval: config.worker_pool.heartbeat_interval(),
            cancel_poll: config.worker_pool.cancel_poll(),
            progress_flush: config.worker_pool.progress_flush(),
            stall_timeout: config.executor.stall_timeout(),
            job_timeout: config.executor.job_timeout(),
            atomic_write: config.executor.atomic_write,
            transfer_retry: config.transfer_retry.clone(),
            job_retry: config.job_retry.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FileOutcome {
    Completed,
    /// `retryable` is false when another attempt cannot succeed.
    Failed { message: String, retryable: bool },
    /// Not started because the job was cancelled.
    Skipped,
    /// Stopped by shutdown; the file runs again when the job resumes.
    Interrupted,
}

/// Result of a single executor invocation.
enum Attempt {
    Done(TransferSummary),
    Failed(ExecutorError),
    Interrupted,
}

#[derive(Debug, Default)]
struct RunSummary {
    total: usize,
    failed: usize,
    /// Failures a later job attempt may fix.
    retryable_failed: usize,
    first_error: Option<String>,
}

enum RunEnd {
    Finished(RunSummary),
    Cancelled,
    Interrupted,
    TimedOut(Duration),
    /// The run could not get as far as planning its files.
    Aborted(Error),
}

/// Everything a file of the current run needs.
struct RunContext<'a> {
    job: &'a JobDbModel,
    source: Location,
    destination: EndpointKind,
    flags: ExecutorFlags,
    rules: Vec<ChainRule>,
    /// Tripped by a cancel request or by shutdown.
    cancel: &'a CancellationToken,
    shutdown: &'a CancellationToken,
}

pub struct JobRunner {
    repos: Repositories,
    queue: Arc<dyn WorkQueue>,
    throttle: Arc<ThrottleController>,
    executor: Arc<dyn TransferExecutor>,
    chains: Arc<ChainJobService>,
    events: EventBus,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        repos: Repositories,
        queue: Arc<dyn WorkQueue>,
        throttle: Arc<ThrottleController>,
        executor: Arc<dyn TransferExecutor>,
        chains: Arc<ChainJobService>,
        events: EventBus,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            repos,
            queue,
            throttle,
            executor,
            chains,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Process one claim to the end. Errors are logged and the claim is
    /// handed back for a later attempt.
    pub async fn run_claim(&self, claim: Claim, shutdown: &CancellationToken) {
        if let Err(e) = self.process(&claim, shutdown).await {
            error!(job_id = %claim.job_id, error = %e, "Job processing failed");
            let delay = self
                .settings
                .job_retry
                .delay_for_attempt(claim.deliveries.saturating_sub(1));
            if let Err(e) = self.queue.nack(&claim, delay).await {
                warn!(job_id = %claim.job_id, error = %e, "Failed to return claim to the queue");
            }
        }
    }

    async fn process(&self, claim: &Claim, shutdown: &CancellationToken) -> Result<()> {
        let job = match self.repos.jobs.get_job(&claim.job_id).await {
            Ok(job) => job,
            Err(Error::NotFound { .. }) => {
                warn!(job_id = %claim.job_id, "Dropping queue item for unknown job");
                return self.queue.ack(claim).await;
            }
            Err(e) => return Err(e),
        };

        if !self.start(&job, claim).await? {
            return self.queue.ack(claim).await;
        }
        let job = self.repos.jobs.get_job(&job.id).await?;

        let cancel = shutdown.child_token();
        let stop_watch = CancellationToken::new();
        let watcher = tokio::spawn(watch_claim(
            self.queue.clone(),
            self.repos.jobs.clone(),
            claim.clone(),
            cancel.clone(),
            stop_watch.clone(),
            self.settings.heartbeat_interval,
            self.settings.cancel_poll,
        ));

        let end = self.execute(&job, &cancel, shutdown).await;

        stop_watch.cancel();
        let _ = watcher.await;
        self.finish(&job, claim, end).await
    }

    /// Move the job into `running`. Returns false when there is nothing to run.
    async fn start(&self, job: &JobDbModel, claim: &Claim) -> Result<bool> {
        let jobs = &self.repos.jobs;
        match job.job_status()? {
            JobStatus::Queued => jobs.transition(&job.id, JobStatus::Queued, JobStatus::Running).await,
            JobStatus::Retrying => {
                jobs.transition(&job.id, JobStatus::Retrying, JobStatus::Queued)
                    .await?;
                jobs.transition(&job.id, JobStatus::Queued, JobStatus::Running)
                    .await
            }
            JobStatus::Running => {
                info!(
                    job_id = %job.id,
                    deliveries = claim.deliveries,
                    "Resuming interrupted job"
                );
                Ok(true)
            }
            JobStatus::Pending => {
                warn!(job_id = %job.id, "Job was never queued, dropping queue item");
                Ok(false)
            }
            status => {
                debug!(job_id = %job.id, status = %status, "Job already finished");
                Ok(false)
            }
        }
    }

    async fn execute(
        &self,
        job: &JobDbModel,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> RunEnd {
        let run = self.run_files(job, cancel, shutdown);
        let outcome = match self.settings.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => outcome,
                // In-flight streams and slot guards were dropped with the future.
                Err(_) => return RunEnd::TimedOut(limit),
            },
            None => run.await,
        };
        outcome.unwrap_or_else(RunEnd::Aborted)
    }

    async fn run_files(
        &self,
        job: &JobDbModel,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<RunEnd> {
        let source_endpoint = self.repos.endpoints.get_endpoint(&job.source_endpoint_id).await?;
        let destination_endpoint = self
            .repos
            .endpoints
            .get_endpoint(&job.destination_endpoint_id)
            .await?;
        let source = Location::new(source_endpoint.endpoint_kind()?, job.source_path.clone());

        let files = planner::discover(self.executor.as_ref(), job, &source).await?;
        let planned = planner::plan(job, files, Utc::now())?;

        let rules = match self.chains.rules_for(job).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Could not load chain rules, continuing without");
                Vec::new()
            }
        };

        let mut work = Vec::with_capacity(planned.len());
        for file in planned {
            let record = TransferDbModel::new(
                &job.id,
                file.file_name(),
                &file.relative_path,
                &file.destination_path,
                file.size,
            );
            let stored = self.repos.transfers.upsert_planned(&record).await?;
            work.push((file, stored));
        }
        self.repos.jobs.refresh_counters(&job.id).await?;

        info!(
            job_id = %job.id,
            job = %job.display_name(),
            files = work.len(),
            "Job started"
        );
        self.events.publish(EngineEvent::JobStarted {
            job_id: job.id.clone(),
            files_total: work.len() as u64,
        });

        let ctx = RunContext {
            job,
            source,
            destination: destination_endpoint.endpoint_kind()?,
            flags: ExecutorFlags {
                atomic_write: self.settings.atomic_write,
                verify_checksum: job.verify_checksum,
                bandwidth_limit_kbps: destination_endpoint.bandwidth_limit(),
            },
            rules,
            cancel,
            shutdown,
        };

        let outcomes: Vec<FileOutcome> = futures::stream::iter(work)
            .map(|(file, transfer)| self.run_file(&ctx, file, transfer))
            .buffer_unordered(self.settings.file_parallelism)
            .collect()
            .await;

        if shutdown.is_cancelled() || outcomes.contains(&FileOutcome::Interrupted) {
            return Ok(RunEnd::Interrupted);
        }
        if outcomes.contains(&FileOutcome::Skipped) {
            return Ok(RunEnd::Cancelled);
        }

        let mut summary = RunSummary {
            total: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            if let FileOutcome::Failed { message, retryable } = outcome {
                summary.failed += 1;
                if retryable {
                    summary.retryable_failed += 1;
                }
                summary.first_error.get_or_insert(message);
            }
        }
        Ok(RunEnd::Finished(summary))
    }

    async fn run_file(
        &self,
        ctx: &RunContext<'_>,
        file: PlannedFile,
        transfer: TransferDbModel,
    ) -> FileOutcome {
        if transfer.is_completed() {
            trace!(transfer_id = %transfer.id, "Transfer completed in an earlier run");
            return FileOutcome::Completed;
        }
        if transfer.is_permanently_failed() {
            debug!(transfer_id = %transfer.id, "Transfer failed permanently in an earlier run");
            return FileOutcome::Failed {
                message: transfer.error_message.clone().unwrap_or_default(),
                retryable: false,
            };
        }

        let policy = &self.settings.transfer_retry;
        let mut attempt: u32 = 0;
        loop {
            if let Some(outcome) = self.stopped(ctx).await {
                return outcome;
            }

            let guard = match self
                .throttle
                .acquire(&ctx.job.destination_endpoint_id, ctx.cancel)
                .await
            {
                Ok(Admission::Granted(guard)) => Some(guard),
                Ok(Admission::Cancelled) => {
                    return if ctx.shutdown.is_cancelled() {
                        FileOutcome::Interrupted
                    } else {
                        FileOutcome::Skipped
                    };
                }
                Ok(Admission::TimedOut) => None,
                Err(e) => {
                    warn!(job_id = %ctx.job.id, error = %e, "Slot acquisition failed");
                    None
                }
            };

            let result = match guard {
                Some(guard) => {
                    if let Err(e) = self.repos.transfers.mark_running(&transfer.id).await {
                        warn!(transfer_id = %transfer.id, error = %e, "Failed to mark transfer running");
                    }
                    let result = self.invoke(ctx, &file, &transfer, &guard).await;
                    guard.release().await;
                    result
                }
                None => Attempt::Failed(ExecutorError::transient(
                    "no transfer slot became available in time",
                )),
            };

            match result {
                Attempt::Done(summary) => return self.landed(ctx, &file, &transfer, summary).await,
                Attempt::Interrupted => return FileOutcome::Interrupted,
                Attempt::Failed(e) if e.is_retryable() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(
                        job_id = %ctx.job.id,
                        file = %file.relative_path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient transfer failure, retrying"
                    );
                    tokio::select! {
                        _ = ctx.shutdown.cancelled() => return FileOutcome::Interrupted,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Attempt::Failed(e) => {
                    let message = e.to_string();
                    let retryable = e.is_retryable();
                    warn!(
                        job_id = %ctx.job.id,
                        file = %file.relative_path,
                        error = %message,
                        retryable,
                        "Transfer failed"
                    );
                    if let Err(e) = self
                        .repos
                        .transfers
                        .mark_failed(&transfer.id, &message, attempt, !retryable)
                        .await
                    {
                        error!(transfer_id = %transfer.id, error = %e, "Failed to record transfer failure");
                    }
                    self.refresh_counters(&ctx.job.id).await;
                    self.events.publish(EngineEvent::TransferFailed {
                        job_id: ctx.job.id.clone(),
                        transfer_id: transfer.id.clone(),
                        error: message.clone(),
                    });
                    return FileOutcome::Failed { message, retryable };
                }
            }
        }
    }

    /// Checked before each file attempt.
    async fn stopped(&self, ctx: &RunContext<'_>) -> Option<FileOutcome> {
        if ctx.shutdown.is_cancelled() {
            return Some(FileOutcome::Interrupted);
        }
        if ctx.cancel.is_cancelled() {
            return Some(FileOutcome::Skipped);
        }
        match self.repos.jobs.is_cancel_requested(&ctx.job.id).await {
            Ok(true) => {
                ctx.cancel.cancel();
                Some(FileOutcome::Skipped)
            }
            Ok(false) => None,
            Err(e) => {
                debug!(job_id = %ctx.job.id, error = %e, "Cancel check failed");
                None
            }
        }
    }

    async fn invoke(
        &self,
        ctx: &RunContext<'_>,
        file: &PlannedFile,
        transfer: &TransferDbModel,
        guard: &SlotGuard,
    ) -> Attempt {
        let request = TransferRequest::file(
            ctx.source.child(&file.relative_path),
            Location::new(ctx.destination.clone(), transfer.destination_path.clone()),
            ctx.flags.clone(),
        );
        debug!(
            job_id = %ctx.job.id,
            executor = self.executor.name(),
            source = %request.source.executor_path(),
            destination = %request.destination.executor_path(),
            "Starting transfer"
        );

        let stall = self.settings.stall_timeout;
        let mut tracker = ProgressTracker::new(file.size, self.settings.progress_flush);
        let mut stream = self.executor.execute(request);
        loop {
            let next = tokio::select! {
                _ = ctx.shutdown.cancelled() => return Attempt::Interrupted,
                next = tokio::time::timeout(stall, stream.next()) => next,
            };
            match next {
                Err(_) => {
                    warn!(job_id = %ctx.job.id, file = %file.relative_path, "Transfer stalled, stopping executor");
                    return Attempt::Failed(ExecutorError::Stalled(stall));
                }
                Ok(None) => {
                    return Attempt::Failed(ExecutorError::Protocol(
                        "executor stream ended without a result".to_string(),
                    ));
                }
                Ok(Some(ExecutorEvent::Progress(progress))) => {
                    if let Some((bytes, percent)) = tracker.record(progress) {
                        self.flush_progress(ctx, transfer, guard, bytes, percent).await;
                    }
                }
                Ok(Some(ExecutorEvent::Finished(Ok(summary)))) => return Attempt::Done(summary),
                Ok(Some(ExecutorEvent::Finished(Err(e)))) => return Attempt::Failed(e),
            }
        }
    }

    async fn flush_progress(
        &self,
        ctx: &RunContext<'_>,
        transfer: &TransferDbModel,
        guard: &SlotGuard,
        bytes: u64,
        percent: f64,
    ) {
        if let Err(e) = self
            .repos
            .transfers
            .update_progress(&transfer.id, bytes, percent)
            .await
        {
            debug!(transfer_id = %transfer.id, error = %e, "Progress write failed");
        }
        if let Err(e) = guard.renew().await {
            warn!(endpoint_id = %guard.endpoint_id(), error = %e, "Slot lease renewal failed");
        }
        self.events.publish(EngineEvent::TransferProgress {
            job_id: ctx.job.id.clone(),
            transfer_id: transfer.id.clone(),
            bytes_transferred: bytes,
            percent,
        });
    }

    async fn landed(
        &self,
        ctx: &RunContext<'_>,
        file: &PlannedFile,
        transfer: &TransferDbModel,
        summary: TransferSummary,
    ) -> FileOutcome {
        if let Err(e) = self
            .repos
            .transfers
            .mark_completed(&transfer.id, summary.bytes_transferred)
            .await
        {
            error!(transfer_id = %transfer.id, error = %e, "Failed to record completed transfer");
            return FileOutcome::Failed {
                message: e.to_string(),
                retryable: true,
            };
        }
        self.refresh_counters(&ctx.job.id).await;
        debug!(
            job_id = %ctx.job.id,
            destination = %transfer.destination_path,
            bytes = summary.bytes_transferred,
            elapsed_ms = summary.duration.as_millis() as u64,
            "Transfer completed"
        );
        self.events.publish(EngineEvent::TransferCompleted {
            job_id: ctx.job.id.clone(),
            transfer_id: transfer.id.clone(),
            destination_path: transfer.destination_path.clone(),
        });

        if !ctx.rules.is_empty() {
            let landed = LandedFile {
                written_path: &transfer.destination_path,
                timestamp: file.timestamp,
            };
            self.chains.on_file_landed(ctx.job, &ctx.rules, &landed).await;
        }
        FileOutcome::Completed
    }

    async fn refresh_counters(&self, job_id: &str) {
        if let Err(e) = self.repos.jobs.refresh_counters(job_id).await {
            debug!(job_id = %job_id, error = %e, "Counter refresh failed");
        }
    }

    async fn finish(&self, job: &JobDbModel, claim: &Claim, end: RunEnd) -> Result<()> {
        match end {
            RunEnd::Interrupted => {
                info!(job_id = %job.id, "Job interrupted by shutdown, it will resume");
                self.queue.nack(claim, Duration::ZERO).await
            }
            RunEnd::Cancelled => {
                let skipped = self
                    .repos
                    .transfers
                    .skip_pending(&job.id, "job cancelled")
                    .await?;
                self.repos.jobs.refresh_counters(&job.id).await?;
                self.repos
                    .jobs
                    .finish_job(&job.id, JobStatus::Cancelled, Some("cancelled on request"))
                    .await?;
                info!(job_id = %job.id, skipped, "Job cancelled");
                self.events.publish(EngineEvent::JobFinished {
                    job_id: job.id.clone(),
                    status: JobStatus::Cancelled,
                });
                self.queue.ack(claim).await
            }
            RunEnd::Finished(summary) if summary.failed == 0 => {
                self.repos.jobs.refresh_counters(&job.id).await?;
                if self
                    .repos
                    .jobs
                    .finish_job(&job.id, JobStatus::Completed, None)
                    .await?
                {
                    info!(job_id = %job.id, files = summary.total, "Job completed");
                    self.events.publish(EngineEvent::JobFinished {
                        job_id: job.id.clone(),
                        status: JobStatus::Completed,
                    });
                }
                self.queue.ack(claim).await
            }
            RunEnd::Finished(summary) => {
                let message = format!(
                    "{} of {} files failed: {}",
                    summary.failed,
                    summary.total,
                    summary.first_error.unwrap_or_default()
                );
                // Only failures a new attempt could fix earn a job retry.
                self.fail(job, claim, &message, summary.retryable_failed > 0)
                    .await
            }
            RunEnd::TimedOut(limit) => {
                self.abandon_unfinished(&job.id).await?;
                let message = format!("job timed out after {}s", limit.as_secs());
                self.fail(job, claim, &message, true).await
            }
            RunEnd::Aborted(e) => self.fail(job, claim, &e.to_string(), e.is_retryable()).await,
        }
    }

    /// Close out transfers left behind by a run that was cut short.
    async fn abandon_unfinished(&self, job_id: &str) -> Result<()> {
        for transfer in self.repos.transfers.list_for_job(job_id).await? {
            if transfer.transfer_status() == Some(TransferStatus::Running) {
                self.repos
                    .transfers
                    .mark_failed(&transfer.id, "job timed out", 0, false)
                    .await?;
            }
        }
        self.repos
            .transfers
            .skip_pending(job_id, "job timed out")
            .await?;
        Ok(())
    }

    async fn fail(&self, job: &JobDbModel, claim: &Claim, message: &str, retryable: bool) -> Result<()> {
        self.repos.jobs.refresh_counters(&job.id).await?;
        if !self
            .repos
            .jobs
            .finish_job(&job.id, JobStatus::Failed, Some(message))
            .await?
        {
            warn!(job_id = %job.id, "Job status changed underneath the worker");
            return self.queue.ack(claim).await;
        }
        self.events.publish(EngineEvent::JobFinished {
            job_id: job.id.clone(),
            status: JobStatus::Failed,
        });

        if retryable && job.retries_remaining() && self.repos.jobs.schedule_retry(&job.id).await? {
            let done = u32::try_from(job.retry_count).unwrap_or(0);
            let delay = self.settings.job_retry.delay_for_attempt(done);
            self.queue.nack(claim, delay).await?;
            info!(
                job_id = %job.id,
                retry = done + 1,
                max_retries = job.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Job failed, retry scheduled"
            );
            self.events.publish(EngineEvent::JobRetryScheduled {
                job_id: job.id.clone(),
                retry_count: done + 1,
                delay_ms: delay.as_millis() as u64,
            });
            return Ok(());
        }

        warn!(job_id = %job.id, error = %message, "Job failed");
        self.queue.ack(claim).await
    }
}

/// Keep the queue claim alive and notice cancel requests while a job runs.
async fn watch_claim(
    queue: Arc<dyn WorkQueue>,
    jobs: Arc<dyn JobRepository>,
    claim: Claim,
    cancel: CancellationToken,
    stop: CancellationToken,
    heartbeat: Duration,
    cancel_poll: Duration,
) {
    let mut last_beat = Instant::now();
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(cancel_poll.min(heartbeat)) => {}
        }

        if !cancel.is_cancelled() {
            match jobs.is_cancel_requested(&claim.job_id).await {
                Ok(true) => {
                    info!(job_id = %claim.job_id, "Cancel requested, no new transfers will start");
                    cancel.cancel();
                }
                Ok(false) => {}
                Err(e) => debug!(job_id = %claim.job_id, error = %e, "Cancel check failed"),
            }
        }

        if last_beat.elapsed() >= heartbeat {
            last_beat = Instant::now();
            match queue.extend(&claim).await {
                Ok(true) => trace!(job_id = %claim.job_id, "Claim extended"),
                Ok(false) => warn!(job_id = %claim.job_id, "Queue claim lost, job may be redelivered"),
                Err(e) => warn!(job_id = %claim.job_id, error = %e, "Failed to extend queue claim"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{EndpointDbModel, JobType};
    use crate::database::{init_pool, run_migrations};
    use crate::engine::dispatch::Dispatcher;
    use crate::engine::throttle::MemorySlotStore;
    use crate::engine::work_queue::MemoryWorkQueue;
    use async_trait::async_trait;
    use futures::stream;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use transfer_executor::{ExecutorStream, RemoteFile};

    /// What one executor invocation does.
    #[derive(Debug, Clone, Copy)]
    enum Step {
        Succeed,
        Transient,
        Permanent,
        /// Never reports anything.
        Hang,
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Plays back a per-file script; files without one succeed.
    #[derive(Default)]
    struct ScriptedExecutor {
        files: Vec<RemoteFile>,
        scripts: Mutex<HashMap<String, VecDeque<Step>>>,
        calls: Mutex<HashMap<String, usize>>,
        /// Hanging streams that were dropped.
        dropped: Arc<AtomicUsize>,
    }

    impl ScriptedExecutor {
        fn new(names: &[&str]) -> Self {
            Self {
                files: names
                    .iter()
                    .map(|name| RemoteFile {
                        relative_path: name.to_string(),
                        size: 10,
                        modified: None,
                    })
                    .collect(),
                ..Default::default()
            }
        }

        fn script(self, name: &str, steps: &[Step]) -> Self {
            self.scripts
                .lock()
                .insert(name.to_string(), steps.iter().copied().collect());
            self
        }

        fn calls(&self, name: &str) -> usize {
            self.calls.lock().get(name).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl TransferExecutor for ScriptedExecutor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn list(&self, _root: &Location) -> transfer_executor::Result<Vec<RemoteFile>> {
            Ok(self.files.clone())
        }

        async fn stat(&self, _file: &Location) -> transfer_executor::Result<Option<RemoteFile>> {
            Ok(None)
        }

        fn execute(&self, request: TransferRequest) -> ExecutorStream {
            let path = request.source.executor_path();
            let name = path.rsplit('/').next().unwrap_or_default().to_string();
            *self.calls.lock().entry(name.clone()).or_default() += 1;
            let step = self
                .scripts
                .lock()
                .get_mut(&name)
                .and_then(|steps| steps.pop_front())
                .unwrap_or(Step::Succeed);

            let done = ExecutorEvent::Finished(Ok(TransferSummary {
                bytes_transferred: 10,
                duration: Duration::from_millis(1),
            }));
            match step {
                Step::Succeed => stream::iter(vec![done]).boxed(),
                Step::Transient => {
                    let e = ExecutorError::transient("connection reset");
                    stream::iter(vec![ExecutorEvent::Finished(Err(e))]).boxed()
                }
                Step::Permanent => {
                    let e = ExecutorError::permanent("access denied");
                    stream::iter(vec![ExecutorEvent::Finished(Err(e))]).boxed()
                }
                Step::Hang => {
                    let counter = DropCounter(self.dropped.clone());
                    stream::once(async move {
                        let _counter = counter;
                        futures::future::pending::<ExecutorEvent>().await
                    })
                    .boxed()
                }
            }
        }
    }

    struct Fixture {
        runner: Arc<JobRunner>,
        repos: Repositories,
        queue: Arc<MemoryWorkQueue>,
        throttle: Arc<ThrottleController>,
        dispatcher: Dispatcher,
        executor: Arc<ScriptedExecutor>,
        endpoint_id: String,
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::with_max_retries(max_retries)
            .without_jitter()
            .with_delays(Duration::from_millis(5), Duration::from_millis(20))
    }

    async fn fixture(executor: ScriptedExecutor, tune: impl FnOnce(&mut RunnerSettings)) -> Fixture {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repos = Repositories::sqlite(pool);
        let endpoint = EndpointDbModel::new(
            "local",
            &EndpointKind::Local {
                root: "/data".into(),
            },
            4,
        )
        .unwrap();
        repos.endpoints.create_endpoint(&endpoint).await.unwrap();

        let events = EventBus::new(64);
        let queue = Arc::new(MemoryWorkQueue::new(Duration::from_secs(60)));
        let throttle = Arc::new(ThrottleController::new(
            Arc::new(MemorySlotStore::new()),
            repos.endpoints.clone(),
            crate::config::ThrottleConfig {
                admission_initial_backoff_ms: 5,
                admission_max_backoff_ms: 20,
                ..Default::default()
            },
        ));
        let dispatcher = Dispatcher::new(repos.jobs.clone(), queue.clone(), events.clone());
        let chains = Arc::new(ChainJobService::new(
            dispatcher.clone(),
            repos.templates.clone(),
            0,
        ));

        let mut settings = RunnerSettings {
            file_parallelism: 2,
            heartbeat_interval: Duration::from_secs(5),
            cancel_poll: Duration::from_millis(20),
            progress_flush: Duration::from_millis(10),
            stall_timeout: Duration::from_secs(5),
            job_timeout: None,
            atomic_write: true,
            transfer_retry: fast_policy(2),
            job_retry: fast_policy(2),
        };
        tune(&mut settings);

        let executor = Arc::new(executor);
        let runner = Arc::new(JobRunner::new(
            repos.clone(),
            queue.clone(),
            throttle.clone(),
            executor.clone(),
            chains,
            events,
            settings,
        ));
        Fixture {
            runner,
            repos,
            queue,
            throttle,
            dispatcher,
            executor,
            endpoint_id: endpoint.id,
        }
    }

    impl Fixture {
        async fn submit(&self, max_retries: i64) -> String {
            let mut job = JobDbModel::new(
                JobType::Manual,
                &self.endpoint_id,
                "in",
                &self.endpoint_id,
                "out",
            );
            job.max_retries = max_retries;
            self.dispatcher.submit(job).await.unwrap().id
        }

        async fn next_claim(&self) -> Claim {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                if let Some(claim) = self.queue.try_dequeue().await.unwrap() {
                    return claim;
                }
                assert!(Instant::now() < deadline, "no queue item became visible");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        async fn run_once(&self) {
            let claim = self.next_claim().await;
            self.runner.run_claim(claim, &CancellationToken::new()).await;
        }

        async fn job(&self, id: &str) -> JobDbModel {
            self.repos.jobs.get_job(id).await.unwrap()
        }

        async fn transfer(&self, job_id: &str, name: &str) -> TransferDbModel {
            self.repos
                .transfers
                .list_for_job(job_id)
                .await
                .unwrap()
                .into_iter()
                .find(|t| t.file_name == name)
                .unwrap()
        }

        async fn wait_for_free_slots(&self) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.throttle.in_use(&self.endpoint_id).await.unwrap() > 0 {
                assert!(Instant::now() < deadline, "slots were not released");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = EngineConfig::default();
        config.worker_pool.file_parallelism = 0;
        config.executor.job_timeout_secs = Some(90);
        let settings = RunnerSettings::from_config(&config);
        assert_eq!(settings.file_parallelism, 1);
        assert_eq!(settings.job_timeout, Some(Duration::from_secs(90)));
        assert_eq!(settings.job_retry.max_retries, 2);
        assert!(settings.atomic_write);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_within_the_run() {
        let executor = ScriptedExecutor::new(&["a.txt"]).script("a.txt", &[Step::Transient, Step::Succeed]);
        let f = fixture(executor, |_| {}).await;
        let job_id = f.submit(2).await;

        f.run_once().await;

        let job = f.job(&job_id).await;
        assert_eq!(job.job_status().unwrap(), JobStatus::Completed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(f.executor.calls("a.txt"), 2);
        assert!(f.transfer(&job_id, "a.txt").await.is_completed());
        assert_eq!(f.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let executor = ScriptedExecutor::new(&["f1.txt", "f2.txt", "f3.txt"])
            .script("f2.txt", &[Step::Permanent]);
        let f = fixture(executor, |_| {}).await;
        let job_id = f.submit(2).await;

        f.run_once().await;

        let job = f.job(&job_id).await;
        assert_eq!(job.job_status().unwrap(), JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.files_transferred, 2);
        assert_eq!(job.files_failed, 1);
        assert_eq!(f.executor.calls("f2.txt"), 1);
        assert!(f.transfer(&job_id, "f2.txt").await.is_permanently_failed());
        assert_eq!(f.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_job_retry_reruns_only_unfinished_transfers() {
        let executor = ScriptedExecutor::new(&["a.txt", "b.txt", "c.txt"])
            .script("b.txt", &[Step::Transient, Step::Transient, Step::Transient]);
        let f = fixture(executor, |_| {}).await;
        let job_id = f.submit(2).await;

        f.run_once().await;
        let job = f.job(&job_id).await;
        assert_eq!(job.job_status().unwrap(), JobStatus::Retrying);
        assert_eq!(job.retry_count, 1);
        assert_eq!(f.executor.calls("b.txt"), 3);
        assert_eq!(f.queue.depth().await.unwrap(), 1);

        f.run_once().await;
        let job = f.job(&job_id).await;
        assert_eq!(job.job_status().unwrap(), JobStatus::Completed);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.files_transferred, 3);
        assert_eq!(f.executor.calls("a.txt"), 1);
        assert_eq!(f.executor.calls("b.txt"), 4);
        assert_eq!(f.executor.calls("c.txt"), 1);
    }

    #[tokio::test]
    async fn test_job_retry_skips_permanently_failed_transfers() {
        let executor = ScriptedExecutor::new(&["a.txt", "b.txt"])
            .script("a.txt", &[Step::Permanent])
            .script("b.txt", &[Step::Transient, Step::Transient, Step::Transient]);
        let f = fixture(executor, |_| {}).await;
        let job_id = f.submit(2).await;

        f.run_once().await;
        assert_eq!(f.job(&job_id).await.job_status().unwrap(), JobStatus::Retrying);

        f.run_once().await;
        let job = f.job(&job_id).await;
        assert_eq!(job.job_status().unwrap(), JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
        assert!(job.error_message.unwrap().contains("access denied"));
        assert_eq!(f.executor.calls("a.txt"), 1);
        assert!(f.transfer(&job_id, "b.txt").await.is_completed());
        assert_eq!(f.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stalled_transfer_stops_the_executor() {
        let executor = ScriptedExecutor::new(&["a.txt"]).script("a.txt", &[Step::Hang]);
        let f = fixture(executor, |s| {
            s.stall_timeout = Duration::from_millis(50);
            s.transfer_retry = RetryPolicy::no_retry();
        })
        .await;
        let job_id = f.submit(0).await;

        f.run_once().await;

        let job = f.job(&job_id).await;
        assert_eq!(job.job_status().unwrap(), JobStatus::Failed);
        let transfer = f.transfer(&job_id, "a.txt").await;
        assert_eq!(transfer.transfer_status(), Some(TransferStatus::Failed));
        assert!(transfer.error_message.unwrap().contains("stalled"));
        assert!(!transfer.permanent_failure);
        assert_eq!(f.executor.dropped.load(Ordering::SeqCst), 1);
        f.wait_for_free_slots().await;
    }

    #[tokio::test]
    async fn test_job_timeout_fails_job_and_frees_slots() {
        let executor = ScriptedExecutor::new(&["a.txt", "b.txt", "c.txt"])
            .script("a.txt", &[Step::Hang])
            .script("b.txt", &[Step::Hang]);
        let f = fixture(executor, |s| {
            s.job_timeout = Some(Duration::from_millis(150));
        })
        .await;
        let job_id = f.submit(0).await;

        f.run_once().await;

        let job = f.job(&job_id).await;
        assert_eq!(job.job_status().unwrap(), JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("timed out"));
        for name in ["a.txt", "b.txt"] {
            let transfer = f.transfer(&job_id, name).await;
            assert_eq!(transfer.transfer_status(), Some(TransferStatus::Failed));
        }
        let pending = f.transfer(&job_id, "c.txt").await;
        assert_eq!(pending.transfer_status(), Some(TransferStatus::Skipped));
        assert_eq!(f.executor.calls("c.txt"), 0);
        assert_eq!(f.executor.dropped.load(Ordering::SeqCst), 2);
        f.wait_for_free_slots().await;
        assert_eq!(f.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_job_running_and_resumes_it() {
        let executor = ScriptedExecutor::new(&["a.txt", "b.txt"]).script("a.txt", &[Step::Hang]);
        let f = fixture(executor, |s| s.file_parallelism = 1).await;
        let job_id = f.submit(0).await;

        let shutdown = CancellationToken::new();
        let claim = f.next_claim().await;
        let task = {
            let runner = f.runner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { runner.run_claim(claim, &shutdown).await })
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.executor.calls("a.txt") == 0 {
            assert!(Instant::now() < deadline, "transfer never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        let job = f.job(&job_id).await;
        assert_eq!(job.job_status().unwrap(), JobStatus::Running);
        assert_eq!(
            f.transfer(&job_id, "a.txt").await.transfer_status(),
            Some(TransferStatus::Running)
        );
        assert_eq!(f.executor.calls("b.txt"), 0);
        assert_eq!(f.queue.depth().await.unwrap(), 1);
        f.wait_for_free_slots().await;

        let claim = f.next_claim().await;
        assert!(claim.is_redelivery());
        f.runner.run_claim(claim, &CancellationToken::new()).await;

        let job = f.job(&job_id).await;
        assert_eq!(job.job_status().unwrap(), JobStatus::Completed);
        assert_eq!(job.files_transferred, 2);
        assert_eq!(f.executor.calls("a.txt"), 2);
        assert_eq!(f.executor.calls("b.txt"), 1);
        assert_eq!(f.queue.depth().await.unwrap(), 0);
    }
}
