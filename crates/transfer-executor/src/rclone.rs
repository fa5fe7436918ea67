//! Rclone-backed transfer executor.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, Result};
use crate::location::Location;
use crate::traits::{
    ExecutorEvent, ExecutorStream, ProgressEvent, RemoteFile, TransferExecutor, TransferRequest,
    TransferSummary,
};

/// One-line stats, e.g. `1.500 MiB / 10 MiB, 15%, 512 KiB/s, ETA 16s`.
static STATS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?P<done>[\d.]+\s*[KMGTPE]?i?B)\s*/\s*(?P<total>[\d.]+\s*[KMGTPE]?i?B),\s*(?P<pct>\d+)%(?:,\s*(?P<speed>[\d.]+\s*[KMGTPE]?i?B)/s)?(?:,\s*ETA\s*(?P<eta>[0-9hms.]+))?",
    )
    .expect("stats regex is valid")
});

static ETA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<n>[\d.]+)(?P<u>[hms])").expect("eta regex is valid")
});

/// Executor that shells out to `rclone`.
pub struct RcloneExecutor {
    rclone_path: String,
    config_path: Option<String>,
    extra_args: Vec<String>,
}

impl RcloneExecutor {
    /// Create an executor using `RCLONE_PATH` or `rclone` from `PATH`.
    pub fn new() -> Self {
        Self::with_rclone_path(std::env::var("RCLONE_PATH").unwrap_or_else(|_| "rclone".to_string()))
    }

    pub fn with_rclone_path(path: impl Into<String>) -> Self {
        Self {
            rclone_path: path.into(),
            config_path: None,
            extra_args: Vec::new(),
        }
    }

    /// Use a specific rclone config file.
    pub fn with_config_path(mut self, path: Option<String>) -> Self {
        self.config_path = path;
        self
    }

    /// Arguments appended to every transfer invocation.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.rclone_path);
        if let Some(cfg) = &self.config_path {
            cmd.arg("--config").arg(cfg);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Build the argument list for a transfer.
    pub fn transfer_args(&self, request: &TransferRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "--log-level",
            "NOTICE",
            "--stats",
            "1s",
            "--stats-one-line",
            "--stats-log-level",
            "NOTICE",
            // retries are owned by the engine
            "--retries",
            "1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if !request.flags.atomic_write {
            args.push("--inplace".to_string());
        }
        if request.flags.verify_checksum {
            args.push("--checksum".to_string());
        }
        if let Some(kbps) = request.flags.bandwidth_limit_kbps {
            args.push("--bwlimit".to_string());
            args.push(format!("{}K", kbps));
        }

        let source = request.source.executor_path();
        let destination = request.destination.executor_path();
        match &request.pattern {
            Some(pattern) => {
                args.extend(["copy".to_string(), source, destination]);
                args.push("--include".to_string());
                args.push(pattern.clone());
            }
            None => args.extend(["copyto".to_string(), source, destination]),
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }

    async fn run_lsjson(&self, args: &[&str], target: &str) -> Result<(bool, Vec<u8>)> {
        let mut cmd = self.command();
        cmd.arg("lsjson").args(args).arg(target);
        cmd.stdin(Stdio::null());

        debug!("rclone lsjson {:?} {}", args, target);
        let output = cmd.output().await?;
        if output.status.success() {
            return Ok((true, output.stdout));
        }

        let code = output.status.code();
        if matches!(code, Some(3) | Some(4)) {
            return Ok((false, Vec::new()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_exit(code, last_error_line(&stderr)))
    }
}

impl Default for RcloneExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsJsonEntry {
    path: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    mod_time: Option<String>,
    #[serde(default)]
    is_dir: bool,
}

impl LsJsonEntry {
    fn into_remote_file(self, relative_path: String) -> RemoteFile {
        RemoteFile {
            relative_path,
            size: self.size.max(0) as u64,
            modified: self
                .mod_time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Parse `rclone lsjson --recursive --files-only` output.
pub fn parse_lsjson(raw: &[u8]) -> Result<Vec<RemoteFile>> {
    let entries: Vec<LsJsonEntry> = serde_json::from_slice(raw)?;
    let mut files: Vec<RemoteFile> = entries
        .into_iter()
        .filter(|e| !e.is_dir)
        .map(|e| {
            let path = e.path.clone();
            e.into_remote_file(path)
        })
        .collect();
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

#[async_trait]
impl TransferExecutor for RcloneExecutor {
    fn name(&self) -> &'static str {
        "rclone"
    }

    async fn list(&self, root: &Location) -> Result<Vec<RemoteFile>> {
        let target = root.executor_path();
        let (found, stdout) = self
            .run_lsjson(&["--recursive", "--files-only"], &target)
            .await?;
        if !found {
            return Err(ExecutorError::permanent(format!(
                "source directory not found: {}",
                target
            )));
        }
        parse_lsjson(&stdout)
    }

    async fn stat(&self, file: &Location) -> Result<Option<RemoteFile>> {
        let target = file.executor_path();
        let (found, stdout) = self.run_lsjson(&["--stat"], &target).await?;
        if !found || stdout.is_empty() {
            return Ok(None);
        }
        let entry: LsJsonEntry = serde_json::from_slice(&stdout)?;
        if entry.is_dir {
            return Ok(None);
        }
        let name = file
            .path
            .rsplit('/')
            .next()
            .unwrap_or(&file.path)
            .to_string();
        Ok(Some(entry.into_remote_file(name)))
    }

    fn execute(&self, request: TransferRequest) -> ExecutorStream {
        let mut cmd = self.command();
        cmd.args(self.transfer_args(&request));

        info!(
            "rclone transfer: {} -> {}",
            request.source.executor_path(),
            request.destination.executor_path()
        );

        let (tx, rx) = mpsc::channel::<ExecutorEvent>(64);
        tokio::spawn(run_transfer(cmd, tx));

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed()
    }
}

/// Run one rclone transfer, forwarding stats lines as progress.
///
/// Stops the child as soon as the receiving side goes away.
async fn run_transfer(mut cmd: Command, tx: mpsc::Sender<ExecutorEvent>) {
    let start = Instant::now();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = tx.send(ExecutorEvent::Finished(Err(e.into()))).await;
            return;
        }
    };

    let mut last_error: Option<String> = None;
    let mut last_bytes = 0u64;

    if let Some(stderr) = child.stderr.take() {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("transfer abandoned by receiver, stopping rclone");
                    let _ = child.kill().await;
                    return;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(progress) = parse_stats_line(&line) {
                            last_bytes = progress.bytes_transferred;
                            if tx.send(ExecutorEvent::Progress(progress)).await.is_err() {
                                let _ = child.kill().await;
                                return;
                            }
                        } else if line.contains("ERROR") {
                            warn!("rclone: {}", line);
                            last_error = Some(line);
                        } else {
                            debug!("rclone: {}", line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read rclone output: {}", e);
                        break;
                    }
                }
            }
        }
    }

    let status = tokio::select! {
        _ = tx.closed() => {
            let _ = child.kill().await;
            return;
        }
        status = child.wait() => status,
    };

    let outcome = match status {
        Ok(status) if status.success() => {
            let duration = start.elapsed();
            info!("rclone transfer completed in {:.2}s", duration.as_secs_f64());
            Ok(TransferSummary {
                bytes_transferred: last_bytes,
                duration,
            })
        }
        Ok(status) => Err(classify_exit(status.code(), last_error)),
        Err(e) => Err(ExecutorError::transient(format!(
            "failed to wait for rclone: {}",
            e
        ))),
    };

    let _ = tx.send(ExecutorEvent::Finished(outcome)).await;
}

/// Map an rclone exit code to the engine's failure classes.
///
/// See `rclone --help` exit codes: 3/4 missing dir/file, 1 usage, 6 no-retry,
/// 7 fatal and 9 no-transfer are permanent; the rest are worth retrying.
pub fn classify_exit(code: Option<i32>, message: Option<String>) -> ExecutorError {
    let detail = message.unwrap_or_else(|| "no error output".to_string());
    match code {
        Some(c @ (1 | 3 | 4 | 6 | 7 | 9)) => {
            ExecutorError::permanent(format!("rclone exited with code {}: {}", c, detail))
        }
        Some(c) => ExecutorError::transient(format!("rclone exited with code {}: {}", c, detail)),
        None => ExecutorError::transient(format!("rclone terminated by signal: {}", detail)),
    }
}

fn last_error_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .rfind(|l| l.contains("ERROR") || l.contains("Failed"))
        .or_else(|| stderr.lines().rfind(|l| !l.trim().is_empty()))
        .map(|l| l.trim().to_string())
}

/// Parse a one-line stats message into a progress event.
pub fn parse_stats_line(line: &str) -> Option<ProgressEvent> {
    let caps = STATS_RE.captures(line)?;
    let bytes_transferred = parse_size(caps.name("done")?.as_str())?;
    let total_bytes = caps.name("total").and_then(|m| parse_size(m.as_str()));
    let percent = caps
        .name("pct")
        .and_then(|m| m.as_str().parse::<f32>().ok());
    let speed_bytes_per_sec = caps
        .name("speed")
        .and_then(|m| parse_size(m.as_str()))
        .map(|v| v as f64);
    let eta_secs = caps.name("eta").and_then(|m| parse_eta(m.as_str()));

    Some(ProgressEvent {
        bytes_transferred,
        total_bytes,
        percent,
        speed_bytes_per_sec,
        eta_secs,
    })
}

/// Parse a human size such as `1.5 MiB` or `512 B`.
fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "B" | "" => 1.0,
        "KiB" | "KB" => 1024.0,
        "MiB" | "MB" => 1024.0_f64.powi(2),
        "GiB" | "GB" => 1024.0_f64.powi(3),
        "TiB" | "TB" => 1024.0_f64.powi(4),
        "PiB" | "PB" => 1024.0_f64.powi(5),
        "EiB" | "EB" => 1024.0_f64.powi(6),
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

/// Parse an ETA such as `1h2m3s`.
fn parse_eta(raw: &str) -> Option<u64> {
    let mut total = 0f64;
    let mut matched = false;
    for caps in ETA_RE.captures_iter(raw) {
        let n: f64 = caps["n"].parse().ok()?;
        total += match &caps["u"] {
            "h" => n * 3600.0,
            "m" => n * 60.0,
            _ => n,
        };
        matched = true;
    }
    matched.then_some(total.round() as u64)
}
