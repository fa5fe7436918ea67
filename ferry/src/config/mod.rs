//! Engine configuration.
//!
//! Every section has serde defaults, so a configuration file only needs the
//! keys it changes. [`EngineConfig::from_env`] layers `.env`, an optional JSON
//! file and individual `FERRY_*` variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::domain::RetryPolicy;
use crate::{Error, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub worker_pool: WorkerPoolConfig,
    pub work_queue: WorkQueueConfig,
    pub throttle: ThrottleConfig,
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingSettings,
    /// Re-runs of a whole job after it ends with failed transfers.
    pub job_retry: RetryPolicy,
    /// Per-file retries of transient executor failures.
    pub transfer_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            work_queue: WorkQueueConfig::default(),
            throttle: ThrottleConfig::default(),
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
            executor: ExecutorConfig::default(),
            logging: LoggingSettings::default(),
            job_retry: RetryPolicy {
                max_retries: 2,
                initial_delay_ms: 30_000,
                max_delay_ms: 600_000,
                ..Default::default()
            },
            transfer_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:ferry.db?mode=rwc".to_string(),
            max_connections: crate::database::default_pool_size(),
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Jobs processed concurrently by this process.
    pub max_workers: usize,
    /// Files of one job in flight at once, before endpoint slots apply.
    pub file_parallelism: usize,
    /// How often a worker extends its queue claim while a job runs.
    pub heartbeat_interval_ms: u64,
    /// Minimum interval between progress writes for one transfer.
    pub progress_flush_ms: u64,
    /// How often a running job looks for a cancel request.
    pub cancel_poll_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            file_parallelism: 8,
            heartbeat_interval_ms: 30_000,
            progress_flush_ms: 1_000,
            cancel_poll_ms: 1_000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn progress_flush(&self) -> Duration {
        Duration::from_millis(self.progress_flush_ms)
    }

    pub fn cancel_poll(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms.max(1))
    }
}

/// Backing store for the work queue and throttle slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CoordinationBackend {
    /// In-process state, for a single engine process.
    Memory,
    /// Shared SQLite tables, for several processes on one database.
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueConfig {
    pub backend: CoordinationBackend,
    /// A claim not extended or acked within this window is redelivered.
    pub visibility_timeout_secs: u64,
    /// Fallback poll interval for dequeuers on a shared store.
    pub poll_interval_ms: u64,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            backend: CoordinationBackend::Sqlite,
            visibility_timeout_secs: 300,
            poll_interval_ms: 500,
        }
    }
}

impl WorkQueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Per-endpoint admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub backend: CoordinationBackend,
    /// How long a file may wait for a slot before it fails.
    pub admission_timeout_secs: u64,
    pub admission_initial_backoff_ms: u64,
    pub admission_max_backoff_ms: u64,
    /// Lifetime of a shared slot lease; renewed while the transfer progresses.
    pub lease_ttl_secs: u64,
    /// How long endpoint limits are cached.
    pub limit_cache_ttl_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            backend: CoordinationBackend::Sqlite,
            admission_timeout_secs: 3_600,
            admission_initial_backoff_ms: 250,
            admission_max_backoff_ms: 10_000,
            lease_ttl_secs: 120,
            limit_cache_ttl_secs: 30,
        }
    }
}

impl ThrottleConfig {
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn limit_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.limit_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Poll interval of the filesystem snapshot watcher.
    pub fs_poll_interval_ms: u64,
    /// Poll interval of remote event queues.
    pub remote_poll_interval_ms: u64,
    /// How often the set of watched template sources is refreshed.
    pub template_refresh_secs: u64,
    /// Window in which a repeated event is ignored.
    pub dedup_window_secs: u64,
    pub dedup_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fs_poll_interval_ms: 2_000,
            remote_poll_interval_ms: 10_000,
            template_refresh_secs: 60,
            dedup_window_secs: 3_600,
            dedup_capacity: 10_000,
        }
    }
}

impl MonitorConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

/// Transfer executor invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub rclone_path: String,
    pub rclone_config: Option<String>,
    pub extra_args: Vec<String>,
    /// Write through a temporary file and rename into place.
    pub atomic_write: bool,
    /// An invocation with no progress for this long is killed.
    pub stall_timeout_secs: u64,
    /// Upper bound on one job run. `None` disables it.
    pub job_timeout_secs: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            rclone_path: "rclone".to_string(),
            rclone_config: None,
            extra_args: Vec::new(),
            atomic_write: true,
            stall_timeout_secs: 300,
            job_timeout_secs: None,
        }
    }
}

impl ExecutorConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for daily-rolling log files. Console only when unset.
    pub log_dir: Option<String>,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Filter directive overriding the default.
    pub filter: Option<String>,
}

impl EngineConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var("FERRY_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply `FERRY_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("FERRY_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            self.database.url = url;
        }
        if let Some(v) = parse_var(&lookup, "FERRY_DB_MAX_CONNECTIONS")? {
            self.database.max_connections = v;
        }
        if let Some(v) = parse_var(&lookup, "FERRY_MAX_WORKERS")? {
            self.worker_pool.max_workers = v;
        }
        if let Some(v) = parse_var(&lookup, "FERRY_FILE_PARALLELISM")? {
            self.worker_pool.file_parallelism = v;
        }
        if let Some(v) = parse_var(&lookup, "FERRY_QUEUE_BACKEND")? {
            self.work_queue.backend = v;
        }
        if let Some(v) = parse_var(&lookup, "FERRY_VISIBILITY_TIMEOUT_SECS")? {
            self.work_queue.visibility_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "FERRY_THROTTLE_BACKEND")? {
            self.throttle.backend = v;
        }
        if let Some(v) = parse_var(&lookup, "FERRY_ADMISSION_TIMEOUT_SECS")? {
            self.throttle.admission_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "FERRY_SCHEDULER_ENABLED")? {
            self.scheduler.enabled = v;
        }
        if let Some(v) = parse_var(&lookup, "FERRY_SCHEDULER_TICK_SECS")? {
            self.scheduler.tick_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "FERRY_MONITOR_ENABLED")? {
            self.monitor.enabled = v;
        }
        if let Some(path) = lookup("RCLONE_PATH") {
            self.executor.rclone_path = path;
        }
        if let Some(path) = lookup("RCLONE_CONFIG") {
            self.executor.rclone_config = Some(path);
        }
        if let Some(v) = parse_var(&lookup, "FERRY_STALL_TIMEOUT_SECS")? {
            self.executor.stall_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "FERRY_JOB_TIMEOUT_SECS")? {
            self.executor.job_timeout_secs = Some(v);
        }
        if let Some(dir) = lookup("FERRY_LOG_DIR") {
            self.logging.log_dir = Some(dir);
        }
        if let Some(v) = lookup("FERRY_LOG_JSON") {
            self.logging.json = matches!(v.trim(), "1" | "true" | "yes");
        }
        if let Some(filter) = lookup("FERRY_LOG") {
            self.logging.filter = Some(filter);
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 9] = [
            ("worker_pool.max_workers", self.worker_pool.max_workers == 0),
            (
                "worker_pool.file_parallelism",
                self.worker_pool.file_parallelism == 0,
            ),
            (
                "worker_pool.heartbeat_interval_ms",
                self.worker_pool.heartbeat_interval_ms == 0,
            ),
            (
                "work_queue.visibility_timeout_secs",
                self.work_queue.visibility_timeout_secs == 0,
            ),
            ("work_queue.poll_interval_ms", self.work_queue.poll_interval_ms == 0),
            ("throttle.lease_ttl_secs", self.throttle.lease_ttl_secs == 0),
            (
                "scheduler.tick_interval_secs",
                self.scheduler.tick_interval_secs == 0,
            ),
            ("monitor.fs_poll_interval_ms", self.monitor.fs_poll_interval_ms == 0),
            ("executor.stall_timeout_secs", self.executor.stall_timeout_secs == 0),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, invalid)| *invalid) {
            return Err(Error::config(format!("{} must be greater than zero", name)));
        }
        if self.worker_pool.heartbeat_interval_ms >= self.work_queue.visibility_timeout_secs * 1000
        {
            return Err(Error::config(
                "worker_pool.heartbeat_interval_ms must be shorter than the visibility timeout",
            ));
        }
        if self.database.url.trim().is_empty() {
            return Err(Error::config("database.url must not be empty"));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::config(format!("Invalid value for {}: {}", key, e))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.job_retry.max_retries, 2);
        assert_eq!(config.transfer_retry.max_retries, 3);
        assert_eq!(config.work_queue.backend, CoordinationBackend::Sqlite);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_env(lookup(&[
                ("DATABASE_URL", "sqlite::memory:"),
                ("FERRY_MAX_WORKERS", "8"),
                ("FERRY_QUEUE_BACKEND", "memory"),
                ("FERRY_LOG_JSON", "1"),
                ("FERRY_JOB_TIMEOUT_SECS", "600"),
            ]))
            .unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.worker_pool.max_workers, 8);
        assert_eq!(config.work_queue.backend, CoordinationBackend::Memory);
        assert!(config.logging.json);
        assert_eq!(config.executor.job_timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env(lookup(&[("FERRY_MAX_WORKERS", "many")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = EngineConfig::default();
        config.worker_pool.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.throttle.lease_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.json");
        std::fs::write(
            &path,
            r#"{"worker_pool": {"max_workers": 2}, "job_retry": {"max_retries": 0}}"#,
        )
        .unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.worker_pool.max_workers, 2);
        assert_eq!(config.worker_pool.file_parallelism, 8);
        assert_eq!(config.job_retry.max_retries, 0);
        assert_eq!(config.scheduler.tick_interval_secs, 60);
    }
}
