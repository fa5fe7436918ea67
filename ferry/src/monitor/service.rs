//! The Event Monitor service.

use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transfer_executor::{EndpointKind, join};

use super::dedup::RecentEvents;
use super::events::{ChangeEvent, slash_path, strip_dir};
use super::fs_watch::FsWatcher;
use super::remote::RemoteEventQueue;
use crate::config::MonitorConfig;
use crate::database::models::{JobDbModel, JobType, TemplateDbModel};
use crate::database::repositories::{
    EndpointRepository, ProcessedEventRepository, Repositories, TemplateRepository,
};
use crate::domain::FilePattern;
use crate::engine::Dispatcher;
use crate::Result;

/// Messages taken from a remote queue per poll.
const REMOTE_BATCH: usize = 32;

/// A reservation this old without a job belongs to a monitor that died
/// mid-submit and may be taken over.
const ABANDONED_CLAIM_AGE: Duration = Duration::from_secs(60);

/// An active template together with what is needed to match events.
struct WatchedTemplate {
    template: TemplateDbModel,
    endpoint: EndpointKind,
    pattern: FilePattern,
}

impl WatchedTemplate {
    /// Path of the event relative to the template's source directory, when
    /// the event falls under it and fits the pattern.
    fn match_event(&self, event: &ChangeEvent) -> Option<String> {
        let endpoint_relative = match event {
            ChangeEvent::File { path, .. } => {
                let root = self.endpoint.local_root()?;
                strip_dir(root, &slash_path(path))?.to_string()
            }
            ChangeEvent::Object { bucket, key, .. } => self.endpoint.relative_object_path(bucket, key)?,
        };
        let relative = strip_dir(&self.template.source_path, &endpoint_relative)?;
        self.pattern
            .matches(relative)
            .then(|| relative.to_string())
    }

    /// Local directory to watch, for templates reading from a local endpoint.
    fn watch_dir(&self) -> Option<PathBuf> {
        let root = self.endpoint.local_root()?;
        Some(PathBuf::from(join(root, &self.template.source_path)))
    }

    fn job_for(&self, relative: &str, max_retries: u32) -> JobDbModel {
        let t = &self.template;
        let mut job = JobDbModel::new(
            JobType::EventTriggered,
            &t.source_endpoint_id,
            &t.source_path,
            &t.destination_endpoint_id,
            &t.destination_path,
        );
        job.name = Some(format!("{}: {}", t.name, relative));
        job.template_id = Some(t.id.clone());
        job.file_pattern = t.file_pattern.clone();
        job.source_file = Some(relative.to_string());
        job.verify_checksum = t.verify_checksum;
        job.max_retries = i64::from(max_retries);
        job
    }
}

pub struct EventMonitor {
    templates: Arc<dyn TemplateRepository>,
    endpoints: Arc<dyn EndpointRepository>,
    processed: Arc<dyn ProcessedEventRepository>,
    dispatcher: Dispatcher,
    /// In-process cache in front of `processed`.
    recent: RecentEvents,
    config: MonitorConfig,
    job_max_retries: u32,
    remote_sources: Vec<Arc<dyn RemoteEventQueue>>,
    /// Serializes handling so the duplicate check and the record agree.
    handling: tokio::sync::Mutex<()>,
}

impl EventMonitor {
    pub fn new(
        repos: &Repositories,
        dispatcher: Dispatcher,
        config: MonitorConfig,
        job_max_retries: u32,
    ) -> Self {
        Self {
            templates: repos.templates.clone(),
            endpoints: repos.endpoints.clone(),
            processed: repos.processed_events.clone(),
            dispatcher,
            recent: RecentEvents::new(config.dedup_window(), config.dedup_capacity),
            config,
            job_max_retries,
            remote_sources: Vec::new(),
            handling: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_remote_source(mut self, source: Arc<dyn RemoteEventQueue>) -> Self {
        self.remote_sources.push(source);
        self
    }

    pub fn recent_events(&self) -> &RecentEvents {
        &self.recent
    }

    /// Create one job per matching template. Returns the new job ids.
    ///
    /// Each `(event, template)` pair is reserved in the store before its job
    /// is submitted, so a redelivery within the dedup window creates nothing,
    /// even after a restart or when another template failed half-way. A
    /// reservation whose job could not be created is dropped again.
    pub async fn handle(&self, event: &ChangeEvent) -> Result<Vec<String>> {
        if !event.kind().triggers() {
            return Ok(Vec::new());
        }
        let _guard = self.handling.lock().await;

        let key = event.dedup_key();
        if self.recent.contains(&key) {
            debug!(event = %event.describe(), "Duplicate event ignored");
            return Ok(Vec::new());
        }

        let window = self.config.dedup_window();
        let mut created = Vec::new();
        for watched in self.active_templates().await? {
            let Some(relative) = watched.match_event(event) else {
                continue;
            };
            let template_id = &watched.template.id;
            let job = watched.job_for(&relative, self.job_max_retries);
            if !self
                .processed
                .claim(&key, template_id, &job.id, window, ABANDONED_CLAIM_AGE)
                .await?
            {
                debug!(
                    event = %event.describe(),
                    template = %watched.template.name,
                    "Event already handled for template"
                );
                continue;
            }

            let job_id = job.id.clone();
            let job = match self.dispatcher.submit(job).await {
                Ok(job) => job,
                Err(e) => {
                    if let Err(release) = self.processed.release(&key, template_id, &job_id).await {
                        warn!(job_id = %job_id, error = %release, "Failed to release event reservation");
                    }
                    return Err(e);
                }
            };
            info!(
                template = %watched.template.name,
                job_id = %job.id,
                file = %relative,
                "Event triggered job"
            );
            created.push(job.id);
        }

        self.recent.record(&key);
        if created.is_empty() {
            debug!(event = %event.describe(), "Event matched no template");
        }
        Ok(created)
    }

    /// Poll one remote queue once and handle what it returns.
    ///
    /// Handled messages are deleted; failed ones are left for redelivery.
    pub async fn drain_remote(&self, source: &dyn RemoteEventQueue) -> Result<usize> {
        let batch = source.poll(REMOTE_BATCH).await?;
        let mut handled = 0;
        for message in batch {
            match self.handle(&message.to_change()).await {
                Ok(_) => {
                    if let Err(e) = source.delete(&message.delivery_id).await {
                        warn!(queue = source.name(), error = %e, "Failed to delete handled message");
                    }
                    handled += 1;
                }
                Err(e) => warn!(
                    queue = source.name(),
                    key = %message.key,
                    error = %e,
                    "Failed to handle remote event, leaving it for redelivery"
                ),
            }
        }
        Ok(handled)
    }

    async fn active_templates(&self) -> Result<Vec<WatchedTemplate>> {
        let mut endpoints: HashMap<String, EndpointKind> = HashMap::new();
        let mut watched = Vec::new();
        for template in self.templates.list_active_templates().await? {
            let endpoint = match endpoints.get(&template.source_endpoint_id) {
                Some(kind) => kind.clone(),
                None => {
                    let kind = self
                        .endpoints
                        .get_endpoint(&template.source_endpoint_id)
                        .await?
                        .endpoint_kind()?;
                    endpoints.insert(template.source_endpoint_id.clone(), kind.clone());
                    kind
                }
            };
            let pattern = match FilePattern::parse(&template.file_pattern) {
                Ok(pattern) => pattern,
                Err(e) => {
                    warn!(template = %template.name, error = %e, "Skipping template with invalid pattern");
                    continue;
                }
            };
            watched.push(WatchedTemplate {
                template,
                endpoint,
                pattern,
            });
        }
        Ok(watched)
    }

    /// Run the filesystem and remote sources until cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(remote_sources = self.remote_sources.len(), "Event monitor started");

        for source in &self.remote_sources {
            tokio::spawn(Arc::clone(&self).poll_remote(source.clone(), token.child_token()));
        }

        let watcher = FsWatcher::new(Duration::from_millis(self.config.fs_poll_interval_ms));
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(1024);
        let mut watches: HashMap<PathBuf, CancellationToken> = HashMap::new();
        let mut refresh = tokio::time::interval(Duration::from_secs(
            self.config.template_refresh_secs.max(1),
        ));

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = refresh.tick() => {
                    self.refresh_watches(&watcher, &mut watches, &tx, &token).await;
                    match self.processed.purge_expired().await {
                        Ok(0) => {}
                        Ok(n) => debug!(purged = n, "Expired event reservations removed"),
                        Err(e) => warn!(error = %e, "Failed to purge event reservations"),
                    }
                }
                Some(event) = rx.recv() => {
                    if let Err(e) = self.handle(&event).await {
                        warn!(event = %event.describe(), error = %e, "Failed to handle filesystem event");
                    }
                }
            }
        }

        for (_, watch) in watches {
            watch.cancel();
        }
        info!("Event monitor stopped");
    }

    /// Start watching new template directories and stop watching dropped ones.
    async fn refresh_watches(
        &self,
        watcher: &FsWatcher,
        watches: &mut HashMap<PathBuf, CancellationToken>,
        tx: &mpsc::Sender<ChangeEvent>,
        token: &CancellationToken,
    ) {
        let templates = match self.active_templates().await {
            Ok(templates) => templates,
            Err(e) => {
                warn!(error = %e, "Failed to load templates for watching");
                return;
            }
        };
        let wanted: Vec<PathBuf> = templates.iter().filter_map(WatchedTemplate::watch_dir).collect();

        watches.retain(|dir, watch| {
            let keep = wanted.contains(dir);
            if !keep {
                debug!(dir = %dir.display(), "No template watches this directory any more");
                watch.cancel();
            }
            keep
        });

        for dir in wanted {
            if watches.contains_key(&dir) {
                continue;
            }
            let watch = token.child_token();
            let mut events = watcher.subscribe(dir.clone(), watch.clone());
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    let change = ChangeEvent::File {
                        path: event.path,
                        kind: event.kind,
                        size: event.size,
                        modified: event.modified,
                    };
                    if tx.send(change).await.is_err() {
                        break;
                    }
                }
            });
            watches.insert(dir, watch);
        }
    }

    async fn poll_remote(self: Arc<Self>, source: Arc<dyn RemoteEventQueue>, token: CancellationToken) {
        let interval = Duration::from_millis(self.config.remote_poll_interval_ms.max(1));
        loop {
            match self.drain_remote(source.as_ref()).await {
                Ok(n) if n > 0 => debug!(queue = source.name(), handled = n, "Remote events handled"),
                Ok(_) => {}
                Err(e) => warn!(queue = source.name(), error = %e, "Remote event poll failed"),
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::EndpointDbModel;
    use crate::database::{init_pool, run_migrations};
    use crate::engine::events::EventBus;
    use crate::engine::work_queue::{MemoryWorkQueue, WorkQueue};
    use crate::monitor::{ChangeKind, MemoryRemoteEventQueue, RemoteObjectEvent};

    struct Fixture {
        pool: crate::database::DbPool,
        repos: Repositories,
        queue: Arc<MemoryWorkQueue>,
        monitor: EventMonitor,
        local: String,
        bucket: String,
    }

    async fn fixture() -> Fixture {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repos = Repositories::sqlite(pool.clone());

        let local = EndpointDbModel::new("drop", &EndpointKind::Local { root: "/srv/drop".into() }, 2).unwrap();
        let bucket = EndpointDbModel::new(
            "lake",
            &EndpointKind::S3 {
                remote: "aws".into(),
                bucket: "lake".into(),
                prefix: Some("raw".into()),
            },
            2,
        )
        .unwrap();
        repos.endpoints.create_endpoint(&local).await.unwrap();
        repos.endpoints.create_endpoint(&bucket).await.unwrap();

        let queue = Arc::new(MemoryWorkQueue::new(Duration::from_secs(60)));
        let monitor = new_monitor(&repos, &queue);
        Fixture {
            pool,
            repos,
            queue,
            monitor,
            local: local.id,
            bucket: bucket.id,
        }
    }

    fn new_monitor(repos: &Repositories, queue: &Arc<MemoryWorkQueue>) -> EventMonitor {
        EventMonitor::new(
            repos,
            Dispatcher::new(repos.jobs.clone(), queue.clone(), EventBus::default()),
            MonitorConfig::default(),
            1,
        )
    }

    async fn queued_jobs(f: &Fixture) -> Vec<JobDbModel> {
        f.repos
            .jobs
            .list_jobs_by_status(crate::database::models::JobStatus::Queued)
            .await
            .unwrap()
    }

    fn file_event(path: &str) -> ChangeEvent {
        ChangeEvent::File {
            path: PathBuf::from(path),
            kind: ChangeKind::Created,
            size: 10,
            modified: None,
        }
    }

    #[tokio::test]
    async fn test_file_event_creates_scoped_job() {
        let f = fixture().await;
        let template = TemplateDbModel::new("videos", &f.local, "incoming", &f.bucket, "{year}/{filename}")
            .with_pattern("*.mp4");
        f.repos.templates.create_template(&template).await.unwrap();

        let created = f
            .monitor
            .handle(&file_event("/srv/drop/incoming/cam/clip.mp4"))
            .await
            .unwrap();
        assert_eq!(created.len(), 1);

        let job = f.repos.jobs.get_job(&created[0]).await.unwrap();
        assert_eq!(job.kind(), Some(JobType::EventTriggered));
        assert_eq!(job.source_path, "incoming");
        assert_eq!(job.source_file.as_deref(), Some("cam/clip.mp4"));
        assert_eq!(job.template_id.as_deref(), Some(template.id.as_str()));
        assert_eq!(f.queue.depth().await.unwrap(), 1);

        // Outside the source directory, or not matching the pattern.
        assert!(f.monitor.handle(&file_event("/srv/drop/other/x.mp4")).await.unwrap().is_empty());
        assert!(f.monitor.handle(&file_event("/srv/drop/incoming/x.txt")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_every_matching_template_gets_a_job() {
        let f = fixture().await;
        for name in ["a", "b"] {
            let template = TemplateDbModel::new(name, &f.local, "", &f.bucket, "");
            f.repos.templates.create_template(&template).await.unwrap();
        }
        let inactive = TemplateDbModel::new("c", &f.local, "", &f.bucket, "");
        f.repos.templates.create_template(&inactive).await.unwrap();
        f.repos.templates.set_active(&inactive.id, false).await.unwrap();

        let created = f.monitor.handle(&file_event("/srv/drop/f.bin")).await.unwrap();
        assert_eq!(created.len(), 2);
    }

    #[tokio::test]
    async fn test_redelivered_remote_event_creates_one_job() {
        let f = fixture().await;
        let template = TemplateDbModel::new("ingest", &f.bucket, "in", &f.local, "landing");
        f.repos.templates.create_template(&template).await.unwrap();

        let source = MemoryRemoteEventQueue::new("lake-events");
        let event = RemoteObjectEvent::created("lake", "raw/in/2026/a.parquet");
        source.push(event.clone());
        source.push(RemoteObjectEvent {
            delivery_id: "second-delivery".into(),
            ..event
        });

        assert_eq!(f.monitor.drain_remote(&source).await.unwrap(), 2);
        assert_eq!(source.outstanding(), 0);

        let jobs = f.repos.jobs.list_jobs_by_status(crate::database::models::JobStatus::Queued).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source_file.as_deref(), Some("2026/a.parquet"));
    }

    #[tokio::test]
    async fn test_removals_are_ignored() {
        let f = fixture().await;
        let template = TemplateDbModel::new("t", &f.local, "", &f.bucket, "");
        f.repos.templates.create_template(&template).await.unwrap();
        let removed = ChangeEvent::File {
            path: PathBuf::from("/srv/drop/a"),
            kind: ChangeKind::Removed,
            size: 0,
            modified: None,
        };
        assert!(f.monitor.handle(&removed).await.unwrap().is_empty());
        assert!(f.monitor.recent_events().is_empty());
    }

    #[tokio::test]
    async fn test_restarted_monitor_remembers_handled_events() {
        let f = fixture().await;
        let template = TemplateDbModel::new("ingest", &f.bucket, "in", &f.local, "landing");
        f.repos.templates.create_template(&template).await.unwrap();
        let event = RemoteObjectEvent::created("lake", "raw/in/a.parquet").to_change();

        assert_eq!(f.monitor.handle(&event).await.unwrap().len(), 1);

        // A new process starts with an empty cache, e.g. after the delete of
        // the handled message failed and the queue redelivered it.
        let restarted = new_monitor(&f.repos, &f.queue);
        assert!(restarted.recent_events().is_empty());
        assert!(restarted.handle(&event).await.unwrap().is_empty());
        assert_eq!(queued_jobs(&f).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_template_does_not_duplicate_the_others() {
        let f = fixture().await;
        let first = TemplateDbModel::new("first", &f.local, "", &f.bucket, "");
        let second = TemplateDbModel::new("second", &f.local, "", &f.bucket, "");
        f.repos.templates.create_template(&first).await.unwrap();
        f.repos.templates.create_template(&second).await.unwrap();

        sqlx::query(&format!(
            "CREATE TRIGGER reject_second BEFORE INSERT ON job WHEN NEW.template_id = '{}' \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
            second.id
        ))
        .execute(&f.pool)
        .await
        .unwrap();

        let event = file_event("/srv/drop/report.csv");
        assert!(f.monitor.handle(&event).await.is_err());

        sqlx::query("DROP TRIGGER reject_second")
            .execute(&f.pool)
            .await
            .unwrap();
        // Redelivery creates only the job that is still missing.
        f.monitor.handle(&event).await.unwrap();
        f.monitor.handle(&event).await.unwrap();

        let mut templates: Vec<_> = queued_jobs(&f)
            .await
            .into_iter()
            .filter_map(|job| job.template_id)
            .collect();
        templates.sort();
        let mut expected = vec![first.id.clone(), second.id.clone()];
        expected.sort();
        assert_eq!(templates, expected);
    }

    #[tokio::test]
    async fn test_reupload_with_new_version_triggers_again() {
        let f = fixture().await;
        let template = TemplateDbModel::new("ingest", &f.bucket, "in", &f.local, "landing");
        f.repos.templates.create_template(&template).await.unwrap();

        let source = MemoryRemoteEventQueue::new("lake-events");
        let v1 = RemoteObjectEvent::created("lake", "raw/in/a.parquet").with_version("etag-1");
        source.push(v1.clone());
        source.push(RemoteObjectEvent {
            delivery_id: "redelivered".into(),
            ..v1
        });
        source.push(RemoteObjectEvent::created("lake", "raw/in/a.parquet").with_version("etag-2"));

        assert_eq!(f.monitor.drain_remote(&source).await.unwrap(), 3);
        assert_eq!(queued_jobs(&f).await.len(), 2);
    }
}
