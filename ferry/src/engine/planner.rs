//! Source discovery and destination planning for one job run.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use transfer_executor::{ExecutorError, Location, RemoteFile, TransferExecutor, join};

use crate::database::models::JobDbModel;
use crate::domain::{FileContext, FilePattern, PathExpression, with_collision_suffix};
use crate::Result;

/// A source file with its resolved destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    /// Path relative to the job's source directory.
    pub relative_path: String,
    pub size: u64,
    /// Modification time, or the planning time when unknown.
    pub timestamp: DateTime<Utc>,
    /// Path relative to the destination endpoint.
    pub destination_path: String,
}

impl PlannedFile {
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }

    pub fn context(&self) -> FileContext<'_> {
        FileContext::new(&self.relative_path, self.timestamp)
    }
}

/// List the files a job should move.
///
/// Single-file jobs stat their file; other jobs list the source directory
/// and keep what matches the job's pattern.
pub async fn discover(
    executor: &dyn TransferExecutor,
    job: &JobDbModel,
    source: &Location,
) -> Result<Vec<RemoteFile>> {
    if let Some(file) = job.source_file.as_deref() {
        let mut found = executor
            .stat(&source.child(file))
            .await?
            .ok_or_else(|| {
                ExecutorError::permanent(format!(
                    "source file not found: {}",
                    source.child(file).executor_path()
                ))
            })?;
        found.relative_path = file.trim_start_matches('/').to_string();
        return Ok(vec![found]);
    }

    let pattern = FilePattern::parse(&job.file_pattern)?;
    let mut files: Vec<RemoteFile> = executor
        .list(source)
        .await?
        .into_iter()
        .filter(|f| pattern.matches(&f.relative_path))
        .collect();
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Resolve every file's destination.
///
/// Files are taken in source path order; a file whose destination is
/// already taken by an earlier one gets `_1`, `_2`, ... before its extension.
pub fn plan(job: &JobDbModel, mut files: Vec<RemoteFile>, planned_at: DateTime<Utc>) -> Result<Vec<PlannedFile>> {
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    // A literal target was resolved when the job was created.
    let expression = match job.target_name {
        Some(_) => None,
        None => Some(PathExpression::parse(&job.destination_path)?),
    };

    let mut taken = HashSet::with_capacity(files.len());
    let mut planned = Vec::with_capacity(files.len());

    for file in files {
        let timestamp = file.modified.unwrap_or(planned_at);
        let resolved = match (&expression, job.target_name.as_deref()) {
            (Some(expr), _) => expr.resolve(&FileContext::new(&file.relative_path, timestamp)),
            (None, Some(target)) => join(&job.destination_path, target),
            (None, None) => file.relative_path.clone(),
        };

        let mut destination = resolved.clone();
        let mut n = 0;
        while taken.contains(&destination) {
            n += 1;
            destination = with_collision_suffix(&resolved, n);
        }
        taken.insert(destination.clone());

        planned.push(PlannedFile {
            relative_path: file.relative_path,
            size: file.size,
            timestamp,
            destination_path: destination,
        });
    }
    Ok(planned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::JobType;
    use chrono::TimeZone;

    fn file(path: &str, day: u32) -> RemoteFile {
        RemoteFile {
            relative_path: path.to_string(),
            size: 10,
            modified: Some(Utc.with_ymd_and_hms(2026, 5, day, 0, 0, 0).unwrap()),
        }
    }

    fn job(destination: &str) -> JobDbModel {
        JobDbModel::new(JobType::Manual, "src", "in", "dst", destination)
    }

    #[test]
    fn test_plan_resolves_per_file_dates() {
        let planned = plan(
            &job("{year}/{month}/{day}/{filename}"),
            vec![file("b.txt", 2), file("a.txt", 1)],
            Utc::now(),
        )
        .unwrap();
        assert_eq!(planned[0].relative_path, "a.txt");
        assert_eq!(planned[0].destination_path, "2026/05/01/a.txt");
        assert_eq!(planned[1].destination_path, "2026/05/02/b.txt");
    }

    #[test]
    fn test_collisions_get_suffixes_in_source_order() {
        let planned = plan(
            &job("flat/{filename}"),
            vec![file("z/report.csv", 1), file("a/report.csv", 1), file("m/report.csv", 1)],
            Utc::now(),
        )
        .unwrap();
        let destinations: Vec<_> = planned.iter().map(|p| p.destination_path.as_str()).collect();
        assert_eq!(
            destinations,
            vec!["flat/report.csv", "flat/report_1.csv", "flat/report_2.csv"]
        );
        assert_eq!(planned[1].relative_path, "m/report.csv");
    }

    #[test]
    fn test_directory_expression_keeps_nesting() {
        let planned = plan(&job("mirror"), vec![file("a/b/c.bin", 1)], Utc::now()).unwrap();
        assert_eq!(planned[0].destination_path, "mirror/a/b/c.bin");
    }

    #[test]
    fn test_literal_target_is_not_reparsed() {
        let mut chained = job("archive/2026");
        chained.target_name = Some("{weird}.txt".to_string());
        let planned = plan(&chained, vec![file("{weird}.txt", 1)], Utc::now()).unwrap();
        assert_eq!(planned[0].destination_path, "archive/2026/{weird}.txt");
    }

    #[test]
    fn test_missing_mtime_uses_planning_time() {
        let planned_at = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
        let mut f = file("x.txt", 1);
        f.modified = None;
        let planned = plan(&job("{year}/{filename}"), vec![f], planned_at).unwrap();
        assert_eq!(planned[0].timestamp, planned_at);
        assert_eq!(planned[0].destination_path, "2030/x.txt");
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        assert!(plan(&job("{original_filename}"), vec![file("a", 1)], Utc::now()).is_err());
    }
}
