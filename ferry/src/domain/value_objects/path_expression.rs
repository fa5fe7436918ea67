//! Destination path expressions.
//!
//! An expression such as `archive/{year}/{month}/{filename}` is parsed once
//! and resolved per file. Parsing rejects unknown variables and unbalanced
//! braces, so a resolved path never carries a `{...}` placeholder.

use chrono::{DateTime, Utc};
use std::fmt;
use transfer_executor::join;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variable {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Timestamp,
    Filename,
    Stem,
    Ext,
}

impl Variable {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "year" => Self::Year,
            "month" => Self::Month,
            "day" => Self::Day,
            "hour" => Self::Hour,
            "minute" => Self::Minute,
            "timestamp" => Self::Timestamp,
            "filename" => Self::Filename,
            "stem" => Self::Stem,
            "ext" => Self::Ext,
            _ => return None,
        })
    }

    fn names_file(self) -> bool {
        matches!(self, Self::Filename | Self::Stem | Self::Ext)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Var(Variable),
}

/// Metadata a path expression is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct FileContext<'a> {
    /// Path relative to the job's source directory.
    pub relative_path: &'a str,
    /// Modification time, or the planning time when the listing has none.
    pub timestamp: DateTime<Utc>,
}

impl<'a> FileContext<'a> {
    pub fn new(relative_path: &'a str, timestamp: DateTime<Utc>) -> Self {
        Self {
            relative_path,
            timestamp,
        }
    }

    fn file_name(&self) -> &'a str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(self.relative_path)
    }

    fn split_extension(&self) -> (&'a str, &'a str) {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => (name, ""),
            Some(idx) => (&name[..idx], &name[idx + 1..]),
        }
    }
}

/// A parsed destination path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpression {
    raw: String,
    tokens: Vec<Token>,
}

impl PathExpression {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(Error::validation(format!(
                                    "Unbalanced '{{' in path expression '{}'",
                                    raw
                                )));
                            }
                            Some(ch) => name.push(ch),
                        }
                    }
                    let var = Variable::parse(name.trim()).ok_or_else(|| {
                        Error::validation(format!(
                            "Unknown variable '{{{}}}' in path expression '{}'",
                            name, raw
                        ))
                    })?;
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Var(var));
                }
                '}' => {
                    return Err(Error::validation(format!(
                        "Unbalanced '}}' in path expression '{}'",
                        raw
                    )));
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the last path segment refers to the file itself, as opposed
    /// to a directory the file is placed into.
    pub fn names_file(&self) -> bool {
        let mut in_last_segment = false;
        for token in &self.tokens {
            match token {
                Token::Literal(text) if text.contains('/') => {
                    in_last_segment = false;
                }
                Token::Var(var) if var.names_file() => in_last_segment = true,
                _ => {}
            }
        }
        in_last_segment
    }

    /// Substitute every variable.
    pub fn render(&self, ctx: &FileContext<'_>) -> String {
        let mut out = String::with_capacity(self.raw.len() + 16);
        let ts = ctx.timestamp;
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Var(Variable::Year) => out.push_str(&ts.format("%Y").to_string()),
                Token::Var(Variable::Month) => out.push_str(&ts.format("%m").to_string()),
                Token::Var(Variable::Day) => out.push_str(&ts.format("%d").to_string()),
                Token::Var(Variable::Hour) => out.push_str(&ts.format("%H").to_string()),
                Token::Var(Variable::Minute) => out.push_str(&ts.format("%M").to_string()),
                Token::Var(Variable::Timestamp) => {
                    out.push_str(&ts.format("%Y%m%d_%H%M%S").to_string())
                }
                Token::Var(Variable::Filename) => out.push_str(ctx.file_name()),
                Token::Var(Variable::Stem) => out.push_str(ctx.split_extension().0),
                Token::Var(Variable::Ext) => out.push_str(ctx.split_extension().1),
            }
        }
        normalize(&out)
    }

    /// Full destination path of one file.
    ///
    /// A directory expression keeps the file's relative source path, so
    /// nested source directories are mirrored below it.
    pub fn resolve(&self, ctx: &FileContext<'_>) -> String {
        let rendered = self.render(ctx);
        if self.names_file() {
            rendered
        } else {
            normalize(&join(&rendered, ctx.relative_path))
        }
    }
}

impl fmt::Display for PathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Insert `_n` before the extension of the last path segment.
pub fn with_collision_suffix(path: &str, n: usize) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(idx) => (&path[..=idx], &path[idx + 1..]),
        None => ("", path),
    };
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{}{}_{}{}", dir, &name[..idx], n, &name[idx..]),
        _ => format!("{}{}_{}", dir, name, n),
    }
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
