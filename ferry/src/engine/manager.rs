//! Engine wiring and lifecycle.
//!
//! [`Engine`] builds every component from an [`EngineConfig`], re-enqueues
//! unfinished work on start and stops the background tasks on shutdown.

use std::sync::Arc;
use std::time::Duration;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use transfer_executor::TransferExecutor;

use super::chain::ChainJobService;
use super::dispatch::Dispatcher;
use super::events::{EngineEvent, EventBus};
use super::runner::{JobRunner, RunnerSettings};
use super::service::JobService;
use super::throttle::{MemorySlotStore, SlotStore, SqliteSlotStore, ThrottleController};
use super::work_queue::{MemoryWorkQueue, SqliteWorkQueue, WorkQueue};
use super::worker_pool::WorkerPool;
use crate::config::{CoordinationBackend, EngineConfig};
use crate::database::repositories::Repositories;
use crate::monitor::{EventMonitor, RemoteEventQueue};
use crate::scheduler::{Clock, SchedulerService, SystemClock};
use crate::Result;

/// Default time to wait for background tasks on shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_BUS_CAPACITY: usize = 1024;

/// The running engine.
pub struct Engine {
    config: EngineConfig,
    repos: Repositories,
    dispatcher: Dispatcher,
    throttle: Arc<ThrottleController>,
    runner: Arc<JobRunner>,
    worker_pool: WorkerPool,
    scheduler: Arc<SchedulerService>,
    monitor: Arc<EventMonitor>,
    jobs: JobService,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine on the system clock with no remote event sources.
    pub fn new(config: EngineConfig, pool: SqlitePool, executor: Arc<dyn TransferExecutor>) -> Self {
        Self::with_options(config, pool, executor, Arc::new(SystemClock), Vec::new())
    }

    pub fn with_options(
        config: EngineConfig,
        pool: SqlitePool,
        executor: Arc<dyn TransferExecutor>,
        clock: Arc<dyn Clock>,
        remote_sources: Vec<Arc<dyn RemoteEventQueue>>,
    ) -> Self {
        let repos = Repositories::sqlite(pool.clone());
        let events = EventBus::new(EVENT_BUS_CAPACITY);

        let queue: Arc<dyn WorkQueue> = match config.work_queue.backend {
            CoordinationBackend::Memory => {
                Arc::new(MemoryWorkQueue::new(config.work_queue.visibility_timeout()))
            }
            CoordinationBackend::Sqlite => Arc::new(SqliteWorkQueue::new(
                pool.clone(),
                config.work_queue.visibility_timeout(),
                config.work_queue.poll_interval(),
            )),
        };
        let slots: Arc<dyn SlotStore> = match config.throttle.backend {
            CoordinationBackend::Memory => Arc::new(MemorySlotStore::new()),
            CoordinationBackend::Sqlite => {
                Arc::new(SqliteSlotStore::new(pool, config.throttle.lease_ttl()))
            }
        };
        let throttle = Arc::new(ThrottleController::new(
            slots,
            repos.endpoints.clone(),
            config.throttle.clone(),
        ));

        let dispatcher = Dispatcher::new(repos.jobs.clone(), queue.clone(), events.clone());
        let max_retries = config.job_retry.max_retries;
        let chains = Arc::new(ChainJobService::new(
            dispatcher.clone(),
            repos.templates.clone(),
            max_retries,
        ));
        let runner = Arc::new(JobRunner::new(
            repos.clone(),
            queue,
            throttle.clone(),
            executor,
            chains,
            events,
            RunnerSettings::from_config(&config),
        ));

        let scheduler = Arc::new(SchedulerService::new(
            dispatcher.clone(),
            repos.templates.clone(),
            clock,
            config.scheduler.clone(),
        ));
        let monitor = remote_sources.into_iter().fold(
            EventMonitor::new(&repos, dispatcher.clone(), config.monitor.clone(), max_retries),
            EventMonitor::with_remote_source,
        );

        let cancellation_token = CancellationToken::new();
        Self {
            worker_pool: WorkerPool::new(config.worker_pool.max_workers, &cancellation_token),
            jobs: JobService::new(repos.clone(), dispatcher.clone(), max_retries),
            monitor: Arc::new(monitor),
            scheduler,
            runner,
            throttle,
            dispatcher,
            repos,
            config,
            cancellation_token,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Re-enqueue jobs that were left `queued`, `retrying` or `running`.
    ///
    /// Enqueue is idempotent, so jobs whose queue item survived are left alone.
    pub async fn recover(&self) -> Result<usize> {
        let jobs = self.repos.jobs.list_recoverable_jobs().await?;
        for job in &jobs {
            self.dispatcher.push(job).await?;
        }
        if !jobs.is_empty() {
            info!("Recovered {} unfinished jobs", jobs.len());
        }
        Ok(jobs.len())
    }

    /// Recover, then start the workers and trigger sources.
    pub async fn start(&self) -> Result<()> {
        info!("Starting engine");
        self.recover().await?;
        self.worker_pool
            .start(self.dispatcher.queue().clone(), self.runner.clone());

        let mut tasks = self.tasks.lock();
        if self.config.scheduler.enabled {
            let token = self.cancellation_token.child_token();
            tasks.push(tokio::spawn(self.scheduler.clone().run(token)));
        }
        if self.config.monitor.enabled {
            let token = self.cancellation_token.child_token();
            tasks.push(tokio::spawn(self.monitor.clone().run(token)));
        }
        info!(
            workers = self.worker_pool.max_workers(),
            scheduler = self.config.scheduler.enabled,
            monitor = self.config.monitor.enabled,
            "Engine started"
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Stop everything. Jobs in flight keep their `running` status and resume
    /// on the next start.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) {
        info!("Shutting down engine (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let stopped = tokio::time::timeout(timeout, async {
            self.worker_pool.stop().await;
            futures::future::join_all(tasks).await;
        })
        .await;
        if stopped.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }
        info!("Engine shut down");
    }

    pub fn jobs(&self) -> &JobService {
        &self.jobs
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn throttle(&self) -> &Arc<ThrottleController> {
        &self.throttle
    }

    pub fn scheduler(&self) -> &Arc<SchedulerService> {
        &self.scheduler
    }

    pub fn monitor(&self) -> &Arc<EventMonitor> {
        &self.monitor
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.dispatcher.events().subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn active_workers(&self) -> usize {
        self.worker_pool.active_count()
    }
}
