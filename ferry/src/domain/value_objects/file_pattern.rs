//! Glob file patterns.

use glob::{MatchOptions, Pattern};

use crate::{Error, Result};

/// A file-match pattern.
///
/// A pattern without `/` is matched against the file name, a pattern with `/`
/// against the path relative to the job's source directory. An empty pattern
/// matches everything.
#[derive(Debug, Clone)]
pub struct FilePattern {
    raw: String,
    pattern: Option<Pattern>,
    match_path: bool,
}

impl FilePattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::any());
        }
        let pattern = Pattern::new(trimmed)
            .map_err(|e| Error::validation(format!("Invalid file pattern '{}': {}", raw, e)))?;
        Ok(Self {
            raw: trimmed.to_string(),
            pattern: Some(pattern),
            match_path: trimmed.contains('/'),
        })
    }

    pub fn any() -> Self {
        Self {
            raw: String::new(),
            pattern: None,
            match_path: false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_any(&self) -> bool {
        self.pattern.is_none()
    }

    pub fn matches(&self, relative_path: &str) -> bool {
        let Some(pattern) = &self.pattern else {
            return true;
        };
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        if self.match_path {
            pattern.matches_with(relative_path.trim_start_matches('/'), options)
        } else {
            let name = relative_path.rsplit('/').next().unwrap_or(relative_path);
            pattern.matches_with(name, options)
        }
    }
}
