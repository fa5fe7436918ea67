//! The scheduler tick loop.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::cron::CronSchedule;
use crate::config::SchedulerConfig;
use crate::database::models::{JobDbModel, JobStatus, JobType};
use crate::database::repositories::TemplateRepository;
use crate::database::time::{from_ms, to_ms};
use crate::engine::Dispatcher;
use crate::Result;

pub struct SchedulerService {
    dispatcher: Dispatcher,
    templates: Arc<dyn TemplateRepository>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl SchedulerService {
    pub fn new(
        dispatcher: Dispatcher,
        templates: Arc<dyn TemplateRepository>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            dispatcher,
            templates,
            clock,
            config,
        }
    }

    /// Tick until cancelled. The first tick runs immediately.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let period = Duration::from_secs(self.config.tick_interval_secs.max(1));
        info!(interval_secs = period.as_secs(), "Scheduler started");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.tick().await {
                Ok(0) => {}
                Ok(fired) => debug!(fired, "Scheduler tick"),
                Err(e) => error!(error = %e, "Scheduler tick failed"),
            }
        }
        info!("Scheduler stopped");
    }

    /// Evaluate every enabled schedule once. Returns the number of runs fired.
    ///
    /// A broken schedule is logged and skipped; the others still fire.
    pub async fn tick(&self) -> Result<usize> {
        let now = self.clock.now();
        let definitions = self.dispatcher.jobs().list_schedule_definitions().await?;
        let mut fired = 0;
        for definition in &definitions {
            match self.evaluate(definition, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    schedule_id = %definition.id,
                    schedule = definition.schedule.as_deref().unwrap_or_default(),
                    error = %e,
                    "Failed to evaluate schedule"
                ),
            }
        }
        Ok(fired)
    }

    async fn evaluate(&self, definition: &JobDbModel, now: DateTime<Utc>) -> Result<bool> {
        let Some(expression) = definition.schedule.as_deref() else {
            return Ok(false);
        };
        let schedule = CronSchedule::parse(expression, definition.schedule_timezone.as_deref())?;

        // A new schedule first fires after it was created.
        let anchor = from_ms(definition.last_fired_at.unwrap_or(definition.created_at));
        let Some(due) = schedule.latest_due(anchor, now) else {
            return Ok(false);
        };

        let run = self.build_run(definition, due).await?;
        let (run, inserted) = self.dispatcher.jobs().insert_scheduled_run(&run).await?;
        if run.job_status()? == JobStatus::Queued {
            self.dispatcher.push(&run).await?;
        }

        let advanced = self
            .dispatcher
            .jobs()
            .advance_last_fired(&definition.id, definition.last_fired_at, to_ms(due))
            .await?;
        if !advanced {
            debug!(schedule_id = %definition.id, "Schedule marker already advanced elsewhere");
        }

        if inserted {
            info!(
                schedule_id = %definition.id,
                job_id = %run.id,
                fire_time = %due.to_rfc3339(),
                "Scheduled job fired"
            );
        }
        Ok(inserted)
    }

    /// A fresh run for one fire time, following the template when there is one.
    async fn build_run(&self, definition: &JobDbModel, due: DateTime<Utc>) -> Result<JobDbModel> {
        let mut run = JobDbModel::new(
            JobType::Scheduled,
            &definition.source_endpoint_id,
            &definition.source_path,
            &definition.destination_endpoint_id,
            &definition.destination_path,
        );
        run.file_pattern = definition.file_pattern.clone();
        run.verify_checksum = definition.verify_checksum;

        if let Some(template_id) = definition.template_id.as_deref() {
            let template = self.templates.get_template(template_id).await?;
            run.source_endpoint_id = template.source_endpoint_id;
            run.source_path = template.source_path;
            run.destination_endpoint_id = template.destination_endpoint_id;
            run.destination_path = template.destination_path;
            run.file_pattern = template.file_pattern;
            run.verify_checksum = template.verify_checksum;
            run.template_id = Some(template.id);
        }

        run.name = Some(format!("{} @ {}", definition.display_name(), due.format("%Y-%m-%d %H:%M")));
        run.status = JobStatus::Queued.as_str().to_string();
        run.scheduled_from = Some(definition.id.clone());
        run.scheduled_for = Some(to_ms(due));
        run.max_retries = definition.max_retries;
        Ok(run)
    }
}
