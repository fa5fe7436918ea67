//! Storage locations understood by the executor.
//!
//! `EndpointKind` is the only place that knows about protocols. The engine
//! stores it as an opaque JSON blob on the endpoint record and hands it back
//! here when it needs a concrete path.

use serde::{Deserialize, Serialize};

/// Protocol-specific description of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EndpointKind {
    /// A directory on the local filesystem.
    Local {
        /// Absolute root directory.
        root: String,
    },
    /// An S3-compatible bucket reachable through a configured rclone remote.
    S3 {
        remote: String,
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    /// An SMB share reachable through a configured rclone remote.
    Smb { remote: String, share: String },
    /// An SFTP server reachable through a configured rclone remote.
    Sftp {
        remote: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_dir: Option<String>,
    },
}

impl EndpointKind {
    /// Short tag used in logs and listings.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::S3 { .. } => "s3",
            Self::Smb { .. } => "smb",
            Self::Sftp { .. } => "sftp",
        }
    }

    /// Root directory when this endpoint can be watched on the local filesystem.
    pub fn local_root(&self) -> Option<&str> {
        match self {
            Self::Local { root } => Some(root),
            _ => None,
        }
    }

    /// Translate a remote object notification into an endpoint-relative path.
    ///
    /// Returns `None` when the notification does not belong to this endpoint.
    pub fn relative_object_path(&self, bucket: &str, key: &str) -> Option<String> {
        match self {
            Self::S3 {
                bucket: own_bucket,
                prefix,
                ..
            } if own_bucket == bucket => {
                let key = key.trim_start_matches('/');
                match prefix.as_deref().map(|p| p.trim_matches('/')) {
                    Some(p) if !p.is_empty() => key
                        .strip_prefix(p)
                        .and_then(|rest| rest.strip_prefix('/'))
                        .map(str::to_string),
                    _ => Some(key.to_string()),
                }
            }
            _ => None,
        }
    }

    /// Build the executor-facing path for `path` relative to this endpoint.
    pub fn resolve(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        match self {
            Self::Local { root } => join(root, path),
            Self::S3 {
                remote,
                bucket,
                prefix,
            } => {
                let base = match prefix {
                    Some(p) => join(bucket, p),
                    None => bucket.clone(),
                };
                format!("{}:{}", remote, join(&base, path))
            }
            Self::Smb { remote, share } => format!("{}:{}", remote, join(share, path)),
            Self::Sftp { remote, base_dir } => match base_dir {
                Some(dir) => format!("{}:{}", remote, join(dir, path)),
                None => format!("{}:{}", remote, path),
            },
        }
    }
}

/// A path on a specific endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub kind: EndpointKind,
    /// Endpoint-relative path.
    pub path: String,
}

impl Location {
    pub fn new(kind: EndpointKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Executor-facing path.
    pub fn executor_path(&self) -> String {
        self.kind.resolve(&self.path)
    }

    /// Location of a child entry.
    pub fn child(&self, relative: &str) -> Self {
        Self {
            kind: self.kind.clone(),
            path: join(&self.path, relative),
        }
    }
}

/// Join two slash-separated path fragments without doubling separators.
pub fn join(base: &str, rest: &str) -> String {
    let rest = rest.trim_start_matches('/');
    if base.is_empty() {
        return rest.to_string();
    }
    if rest.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_resolve() {
        let kind = EndpointKind::Local {
            root: "/data/in/".to_string(),
        };
        assert_eq!(kind.resolve("a/b.csv"), "/data/in/a/b.csv");
        assert_eq!(kind.resolve("/a.csv"), "/data/in/a.csv");
        assert_eq!(kind.local_root(), Some("/data/in/"));
    }

    #[test]
    fn test_s3_resolve_with_prefix() {
        let kind = EndpointKind::S3 {
            remote: "aws".to_string(),
            bucket: "drop".to_string(),
            prefix: Some("incoming".to_string()),
        };
        assert_eq!(kind.resolve("x.csv"), "aws:drop/incoming/x.csv");
        assert!(kind.local_root().is_none());
    }

    #[test]
    fn test_relative_object_path() {
        let kind = EndpointKind::S3 {
            remote: "aws".to_string(),
            bucket: "drop".to_string(),
            prefix: Some("incoming/".to_string()),
        };
        assert_eq!(
            kind.relative_object_path("drop", "incoming/2026/a.csv"),
            Some("2026/a.csv".to_string())
        );
        assert_eq!(kind.relative_object_path("drop", "other/a.csv"), None);
        assert_eq!(kind.relative_object_path("elsewhere", "incoming/a.csv"), None);

        let local = EndpointKind::Local {
            root: "/tmp".to_string(),
        };
        assert_eq!(local.relative_object_path("drop", "a.csv"), None);
    }

    #[test]
    fn test_kind_serde_tagged() {
        let kind: EndpointKind =
            serde_json::from_str(r#"{"type":"sftp","remote":"box","base_dir":"/srv"}"#).unwrap();
        assert_eq!(kind.tag(), "sftp");
        assert_eq!(kind.resolve("f.txt"), "box:/srv/f.txt");
    }

    #[test]
    fn test_location_child() {
        let loc = Location::new(
            EndpointKind::Smb {
                remote: "nas".to_string(),
                share: "media".to_string(),
            },
            "in",
        );
        assert_eq!(loc.child("a.mp4").executor_path(), "nas:media/in/a.mp4");
    }
}
