//! Polling filesystem watcher.
//!
//! Each poll takes a recursive snapshot of `(size, mtime)` per file. A file is
//! reported once it has looked the same for two consecutive polls, so files
//! still being written are not picked up half-way. Files already present
//! when the subscription starts are treated as seen.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use super::events::ChangeKind;

/// One observed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileState {
    size: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug)]
struct Tracked {
    observed: FileState,
    reported: Option<FileState>,
}

type Snapshot = HashMap<PathBuf, FileState>;

/// Diff engine behind [`FsWatcher`], kept free of I/O.
#[derive(Debug, Default)]
struct Tracker {
    files: HashMap<PathBuf, Tracked>,
}

impl Tracker {
    fn baseline(snapshot: Snapshot) -> Self {
        let files = snapshot
            .into_iter()
            .map(|(path, state)| {
                (
                    path,
                    Tracked {
                        observed: state,
                        reported: Some(state),
                    },
                )
            })
            .collect();
        Self { files }
    }

    fn update(&mut self, snapshot: Snapshot) -> Vec<FsEvent> {
        let mut events = Vec::new();

        self.files.retain(|path, tracked| {
            if snapshot.contains_key(path) {
                return true;
            }
            if let Some(last) = tracked.reported {
                events.push(event(path, ChangeKind::Removed, last));
            }
            false
        });

        for (path, state) in snapshot {
            match self.files.get_mut(&path) {
                Some(tracked) if tracked.observed == state => {
                    if tracked.reported != Some(state) {
                        let kind = if tracked.reported.is_some() {
                            ChangeKind::Modified
                        } else {
                            ChangeKind::Created
                        };
                        tracked.reported = Some(state);
                        events.push(event(&path, kind, state));
                    }
                }
                Some(tracked) => tracked.observed = state,
                None => {
                    self.files.insert(
                        path,
                        Tracked {
                            observed: state,
                            reported: None,
                        },
                    );
                }
            }
        }

        events.sort_by(|a, b| a.path.cmp(&b.path));
        events
    }
}

fn event(path: &Path, kind: ChangeKind, state: FileState) -> FsEvent {
    FsEvent {
        path: path.to_path_buf(),
        kind,
        size: state.size,
        modified: state.modified.map(DateTime::<Utc>::from),
    }
}

/// Snapshot every regular file under `root`.
///
/// Symlinks are not followed. Unreadable entries are skipped and picked up by
/// a later poll once they become readable.
fn scan(root: &Path) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for result in WalkDir::new(root).follow_links(false) {
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                trace!(root = %root.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        snapshot.insert(
            entry.into_path(),
            FileState {
                size: meta.len(),
                modified: meta.modified().ok(),
            },
        );
    }
    snapshot
}

async fn scan_blocking(root: PathBuf) -> Snapshot {
    match tokio::task::spawn_blocking(move || scan(&root)).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "Filesystem scan task failed");
            Snapshot::new()
        }
    }
}

/// Polling watcher for local directories.
#[derive(Debug, Clone)]
pub struct FsWatcher {
    interval: Duration,
}

impl FsWatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    /// Watch `root` until `token` is cancelled.
    ///
    /// The stream ends when the token is cancelled.
    pub fn subscribe(&self, root: impl Into<PathBuf>, token: CancellationToken) -> BoxStream<'static, FsEvent> {
        let root = root.into();
        let interval = self.interval;
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            debug!(root = %root.display(), "Watching directory");
            let mut tracker = Tracker::baseline(scan_blocking(root.clone()).await);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                for event in tracker.update(scan_blocking(root.clone()).await) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            debug!(root = %root.display(), "Stopped watching directory");
        });

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn state(size: u64) -> FileState {
        FileState {
            size,
            modified: None,
        }
    }

    fn snap(entries: &[(&str, u64)]) -> Snapshot {
        entries
            .iter()
            .map(|(p, s)| (PathBuf::from(p), state(*s)))
            .collect()
    }

    #[test]
    fn test_file_reported_once_stable() {
        let mut tracker = Tracker::baseline(snap(&[("/w/old", 1)]));
        assert!(tracker.update(snap(&[("/w/old", 1), ("/w/new", 5)])).is_empty());
        // Still growing.
        assert!(tracker.update(snap(&[("/w/old", 1), ("/w/new", 9)])).is_empty());
        let events = tracker.update(snap(&[("/w/old", 1), ("/w/new", 9)]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, PathBuf::from("/w/new"));
        assert_eq!(events[0].kind, ChangeKind::Created);
        assert_eq!(events[0].size, 9);
        // Unchanged afterwards.
        assert!(tracker.update(snap(&[("/w/old", 1), ("/w/new", 9)])).is_empty());
    }

    #[test]
    fn test_rewrite_and_removal() {
        let mut tracker = Tracker::baseline(snap(&[("/w/a", 1)]));
        tracker.update(snap(&[("/w/a", 2)]));
        let events = tracker.update(snap(&[("/w/a", 2)]));
        assert_eq!(events[0].kind, ChangeKind::Modified);

        let events = tracker.update(snap(&[]));
        assert_eq!(events[0].kind, ChangeKind::Removed);
        assert_eq!(events[0].size, 2);
    }

    #[test]
    fn test_unreported_file_removed_silently() {
        let mut tracker = Tracker::default();
        tracker.update(snap(&[("/w/tmp", 1)]));
        assert!(tracker.update(snap(&[])).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_reports_new_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("existing.txt"), b"old").unwrap();

        let token = CancellationToken::new();
        let watcher = FsWatcher::new(Duration::from_millis(20));
        let mut events = watcher.subscribe(dir.path(), token.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/new.txt"), b"hello").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, dir.path().join("sub/new.txt"));
        assert_eq!(event.kind, ChangeKind::Created);
        assert_eq!(event.size, 5);

        token.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[test]
    fn test_scan_lists_nested_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("a/b/deep.txt"), b"four").unwrap();

        let snapshot = scan(dir.path());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&dir.path().join("a/b/deep.txt")].size, 4);
        assert!(!snapshot.contains_key(&dir.path().join("a")));
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("file-link.txt"),
        )
        .unwrap();
        std::fs::write(dir.path().join("real.txt"), b"y").unwrap();

        let snapshot = scan(dir.path());
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec![&dir.path().join("real.txt")]);
    }

    #[test]
    fn test_scan_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan(&dir.path().join("missing")).is_empty());
    }
}
