//! Chain Job Service.
//!
//! Chain rules fire per file: once a file of a template-backed job has landed,
//! every rule of the template gets its own job that moves exactly that file
//! onward. The rule's path expression is resolved here, against the file that
//! was written, so a chain job never carries an unresolved variable.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::dispatch::Dispatcher;
use super::events::EngineEvent;
use crate::database::models::{ChainRule, JobDbModel, JobType};
use crate::database::repositories::TemplateRepository;
use crate::domain::{FileContext, PathExpression};
use crate::Result;

/// A file that was just written by a parent job.
#[derive(Debug, Clone, Copy)]
pub struct LandedFile<'a> {
    /// Path relative to the parent's destination endpoint.
    pub written_path: &'a str,
    /// Timestamp the parent resolved its own expression with.
    pub timestamp: DateTime<Utc>,
}

/// Split `a/b/c.txt` into `("a/b", "c.txt")`.
pub(crate) fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    }
}

/// Build the chain job for one rule and one landed file.
pub fn build_chain_job(
    parent: &JobDbModel,
    rule: &ChainRule,
    file: &LandedFile<'_>,
    max_retries: u32,
) -> Result<JobDbModel> {
    let (source_dir, file_name) = split_parent(file.written_path);
    let expression = PathExpression::parse(&rule.destination_path)?;
    let resolved = expression.resolve(&FileContext::new(file_name, file.timestamp));
    let (destination_dir, target_name) = split_parent(&resolved);

    let mut job = JobDbModel::new(
        JobType::Chained,
        &parent.destination_endpoint_id,
        source_dir,
        &rule.destination_endpoint_id,
        destination_dir,
    );
    job.name = Some(match &rule.name {
        Some(name) => format!("{}: {}", name, file_name),
        None => format!("chain: {}", file_name),
    });
    job.parent_job_id = Some(parent.id.clone());
    job.source_file = Some(file_name.to_string());
    job.target_name = Some(target_name.to_string());
    job.verify_checksum = parent.verify_checksum;
    job.max_retries = i64::from(max_retries);
    Ok(job)
}

pub struct ChainJobService {
    dispatcher: Dispatcher,
    templates: Arc<dyn TemplateRepository>,
    max_retries: u32,
}

impl ChainJobService {
    pub fn new(dispatcher: Dispatcher, templates: Arc<dyn TemplateRepository>, max_retries: u32) -> Self {
        Self {
            dispatcher,
            templates,
            max_retries,
        }
    }

    /// Chain rules that apply to the files of `job`.
    ///
    /// Chain jobs themselves never chain again.
    pub async fn rules_for(&self, job: &JobDbModel) -> Result<Vec<ChainRule>> {
        if job.kind() == Some(JobType::Chained) {
            return Ok(Vec::new());
        }
        let Some(template_id) = job.template_id.as_deref() else {
            return Ok(Vec::new());
        };
        self.templates.get_template(template_id).await?.get_chain_rules()
    }

    /// Create and enqueue one job per rule for a landed file.
    ///
    /// A failing rule is logged and skipped; it never affects the parent or
    /// the other rules. Returns the ids of the jobs created.
    pub async fn on_file_landed(
        &self,
        parent: &JobDbModel,
        rules: &[ChainRule],
        file: &LandedFile<'_>,
    ) -> Vec<String> {
        let mut created = Vec::with_capacity(rules.len());
        for (idx, rule) in rules.iter().enumerate() {
            match self.create_one(parent, rule, file).await {
                Ok(job) => {
                    debug!(
                        parent_job_id = %parent.id,
                        chain_job_id = %job.id,
                        source = %file.written_path,
                        "Chain job created"
                    );
                    self.dispatcher.events().publish(EngineEvent::ChainJobCreated {
                        parent_job_id: parent.id.clone(),
                        chain_job_id: job.id.clone(),
                        source_path: file.written_path.to_string(),
                    });
                    created.push(job.id);
                }
                Err(e) => {
                    warn!(
                        parent_job_id = %parent.id,
                        rule = idx,
                        source = %file.written_path,
                        error = %e,
                        "Failed to create chain job"
                    );
                }
            }
        }
        if !created.is_empty() {
            info!(
                parent_job_id = %parent.id,
                count = created.len(),
                "Chain jobs queued for {}",
                file.written_path
            );
        }
        created
    }

    async fn create_one(
        &self,
        parent: &JobDbModel,
        rule: &ChainRule,
        file: &LandedFile<'_>,
    ) -> Result<JobDbModel> {
        let job = build_chain_job(parent, rule, file, self.max_retries)?;
        self.dispatcher.submit(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{EndpointDbModel, JobStatus, TemplateDbModel};
    use crate::database::repositories::{
        EndpointRepository, JobRepository, SqlxEndpointRepository, SqlxJobRepository,
        SqlxTemplateRepository,
    };
    use crate::database::{init_pool, run_migrations};
    use crate::engine::events::EventBus;
    use crate::engine::work_queue::{MemoryWorkQueue, WorkQueue};
    use chrono::TimeZone;
    use std::time::Duration;
    use transfer_executor::EndpointKind;

    fn landed(path: &str) -> LandedFile<'_> {
        LandedFile {
            written_path: path,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("a/b/c.txt"), ("a/b", "c.txt"));
        assert_eq!(split_parent("c.txt"), ("", "c.txt"));
    }

    #[test]
    fn test_chain_job_is_fully_resolved() {
        let parent = JobDbModel::new(JobType::EventTriggered, "in", "drop", "mid", "{year}/{filename}");
        let rule = ChainRule::new("cold", "backup/{year}/{month}/{stem}_{timestamp}.{ext}");
        let job = build_chain_job(&parent, &rule, &landed("2026/clip.mp4"), 1).unwrap();

        assert_eq!(job.kind(), Some(JobType::Chained));
        assert_eq!(job.source_endpoint_id, "mid");
        assert_eq!(job.source_path, "2026");
        assert_eq!(job.source_file.as_deref(), Some("clip.mp4"));
        assert_eq!(job.destination_endpoint_id, "cold");
        assert_eq!(job.destination_path, "backup/2026/03");
        assert_eq!(job.target_name.as_deref(), Some("clip_20260309_120000.mp4"));
        assert_eq!(job.parent_job_id.as_deref(), Some(parent.id.as_str()));
        assert!(job.template_id.is_none());
        assert!(!job.destination_path.contains('{'));
    }

    #[test]
    fn test_directory_rule_keeps_file_name() {
        let parent = JobDbModel::new(JobType::Manual, "in", "", "mid", "");
        let rule = ChainRule::new("cold", "mirror/{year}");
        let job = build_chain_job(&parent, &rule, &landed("x/report.csv"), 0).unwrap();
        assert_eq!(job.destination_path, "mirror/2026");
        assert_eq!(job.target_name.as_deref(), Some("report.csv"));
    }

    #[tokio::test]
    async fn test_one_job_per_rule_and_bad_rule_is_isolated() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let endpoints = SqlxEndpointRepository::new(pool.clone());
        let kind = EndpointKind::Local { root: "/srv".into() };
        let a = EndpointDbModel::new("a", &kind, 1).unwrap();
        let b = EndpointDbModel::new("b", &kind, 1).unwrap();
        endpoints.create_endpoint(&a).await.unwrap();
        endpoints.create_endpoint(&b).await.unwrap();

        let jobs: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(pool.clone()));
        let queue = Arc::new(MemoryWorkQueue::new(Duration::from_secs(30)));
        let dispatcher = Dispatcher::new(jobs.clone(), queue.clone(), EventBus::default());
        let service = ChainJobService::new(
            dispatcher,
            Arc::new(SqlxTemplateRepository::new(pool.clone())),
            2,
        );

        let parent = JobDbModel::new(JobType::Manual, &a.id, "in", &b.id, "out");
        jobs.create_job(&parent).await.unwrap();

        let rules = vec![
            ChainRule::new(&a.id, "copy1/{filename}"),
            ChainRule::new(&a.id, "copy2/{original_filename}"),
            ChainRule::new(&b.id, "copy3"),
        ];
        let created = service
            .on_file_landed(&parent, &rules, &landed("out/f.txt"))
            .await;
        assert_eq!(created.len(), 2);
        assert_eq!(queue.depth().await.unwrap(), 2);

        let children = jobs.list_children(&parent.id).await.unwrap();
        assert_eq!(children.len(), 2);
        for child in &children {
            assert_eq!(child.job_status().unwrap(), JobStatus::Queued);
            assert_eq!(child.source_path, "out");
            assert_eq!(child.source_file.as_deref(), Some("f.txt"));
            assert_eq!(child.max_retries, 2);
        }
    }

    #[tokio::test]
    async fn test_chained_jobs_have_no_rules() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let templates = Arc::new(SqlxTemplateRepository::new(pool.clone()));
        let jobs: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(pool));
        let queue = Arc::new(MemoryWorkQueue::new(Duration::from_secs(30)));
        let service = ChainJobService::new(
            Dispatcher::new(jobs, queue, EventBus::default()),
            templates,
            0,
        );

        let mut chained = JobDbModel::new(JobType::Chained, "a", "", "b", "");
        chained.template_id = Some(TemplateDbModel::new("t", "a", "", "b", "").id);
        assert!(service.rules_for(&chained).await.unwrap().is_empty());

        let manual = JobDbModel::new(JobType::Manual, "a", "", "b", "");
        assert!(service.rules_for(&manual).await.unwrap().is_empty());
    }
}
