//! Scheduler: turns due cron schedules into queued job runs.
//!
//! A schedule definition is a job row carrying a `schedule` expression. Each
//! fire creates a separate run row keyed by `(scheduled_from, scheduled_for)`,
//! and the definition's `last_fired_at` marker is advanced afterwards. Both
//! writes are idempotent, so a restart recomputes due schedules from the store
//! without duplicating runs.

pub mod clock;
pub mod cron;
pub mod service;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cron::CronSchedule;
pub use service::SchedulerService;
