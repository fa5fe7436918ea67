//! Change events delivered by trigger sources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What happened to a file or object.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

impl ChangeKind {
    /// Removals never trigger a transfer.
    pub fn triggers(&self) -> bool {
        !matches!(self, Self::Removed)
    }
}

/// A change observed by one of the trigger sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A file under a watched local directory.
    File {
        path: PathBuf,
        kind: ChangeKind,
        size: u64,
        modified: Option<DateTime<Utc>>,
    },
    /// A remote storage notification.
    Object {
        bucket: String,
        key: String,
        kind: ChangeKind,
        /// ETag or sequencer, distinguishing re-uploads of the same key.
        version: Option<String>,
        delivery_id: String,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::File { kind, .. } | Self::Object { kind, .. } => *kind,
        }
    }

    /// Identity used to drop repeated deliveries of the same change.
    ///
    /// A local file that is rewritten later has a new size or mtime, so it is
    /// a different change. A remote object is identified by bucket and key,
    /// plus its version when the notification carries one.
    pub fn dedup_key(&self) -> String {
        match self {
            Self::File {
                path,
                size,
                modified,
                ..
            } => format!(
                "file:{}:{}:{}",
                slash_path(path),
                size,
                modified.map(|t| t.timestamp_millis()).unwrap_or_default()
            ),
            Self::Object {
                bucket,
                key,
                version,
                ..
            } => {
                let key = key.trim_start_matches('/');
                match version {
                    Some(version) => format!("object:{}/{}@{}", bucket, key, version),
                    None => format!("object:{}/{}", bucket, key),
                }
            }
        }
    }

    /// Short label for log lines.
    pub fn describe(&self) -> String {
        match self {
            Self::File { path, .. } => slash_path(path),
            Self::Object { bucket, key, .. } => format!("{}/{}", bucket, key),
        }
    }
}

/// A filesystem path with `/` separators.
pub fn slash_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// `path` relative to `base`, when `path` lies strictly below it.
pub fn strip_dir<'a>(base: &str, path: &'a str) -> Option<&'a str> {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        let rest = path.trim_start_matches('/');
        return (!rest.is_empty()).then_some(rest);
    }
    let rest = path.strip_prefix(base)?.strip_prefix('/')?;
    let rest = rest.trim_start_matches('/');
    (!rest.is_empty()).then_some(rest)
}
