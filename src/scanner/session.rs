//! Scan session bookkeeping and the incremental-scan memory.

use crate::core::error::Error;
use crate::core::types::MatchRecord;
use crate::detection::RuleMatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Completed => write!(f, "completed"),
            SessionOutcome::Cancelled => write!(f, "cancelled"),
            SessionOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Classification of a per-file error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileErrorKind {
    Timeout,
    Io,
    Match,
    Walk,
}

/// An error recorded against one file. Never aborts the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub path: PathBuf,
    pub kind: FileErrorKind,
    pub message: String,
}

impl FileError {
    pub fn new(path: impl Into<PathBuf>, kind: FileErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }

    /// Classify a matching error.
    pub fn from_error(path: impl Into<PathBuf>, err: &Error) -> Self {
        let kind = match err {
            Error::MatchTimeout { .. } => FileErrorKind::Timeout,
            Error::FileRead { .. } | Error::Io(_) => FileErrorKind::Io,
            _ => FileErrorKind::Match,
        };
        Self::new(path, kind, err.to_string())
    }
}

/// Convert an engine hit into a reportable record.
pub fn match_record(path: &Path, hit: RuleMatch) -> MatchRecord {
    MatchRecord::new(
        path.to_path_buf(),
        hit.rule_name,
        hit.namespace,
        hit.tags,
        hit.meta,
        hit.strings,
    )
}

/// Immutable result of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub session_id: Uuid,
    pub root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub incremental: bool,
    pub quarantine_on_match: bool,
    pub files_discovered: u64,
    /// Files matched against the rule set, with or without hits
    pub files_considered: u64,
    pub files_skipped: u64,
    pub matches: Vec<MatchRecord>,
    pub errors: Vec<FileError>,
    pub outcome: SessionOutcome,
}

impl ScanSummary {
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn is_clean(&self) -> bool {
        self.matches.is_empty()
    }

    /// Distinct files with at least one match.
    pub fn matched_files(&self) -> usize {
        let mut paths: Vec<&Path> = self.matches.iter().map(|m| m.file_path.as_path()).collect();
        paths.sort();
        paths.dedup();
        paths.len()
    }
}

/// Mutable session state, owned by the coordinator's control task.
#[derive(Debug)]
pub struct ScanSession {
    pub id: Uuid,
    pub root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub incremental: bool,
    pub quarantine_on_match: bool,
    pub files_discovered: u64,
    pub files_considered: u64,
    pub files_skipped: u64,
    pub matches: Vec<MatchRecord>,
    pub errors: Vec<FileError>,
    /// Files whose results were folded in and may enter the incremental cache
    pub folded: Vec<PathBuf>,
}

impl ScanSession {
    pub fn new(id: Uuid, root: PathBuf, incremental: bool, quarantine_on_match: bool) -> Self {
        Self {
            id,
            root,
            started_at: Utc::now(),
            incremental,
            quarantine_on_match,
            files_discovered: 0,
            files_considered: 0,
            files_skipped: 0,
            matches: Vec::new(),
            errors: Vec::new(),
            folded: Vec::new(),
        }
    }

    pub fn record_error(&mut self, error: FileError) {
        log::debug!(
            "Scan error on {} ({:?}): {}",
            error.path.display(),
            error.kind,
            error.message
        );
        self.errors.push(error);
    }

    pub fn finalize(self, outcome: SessionOutcome) -> ScanSummary {
        ScanSummary {
            session_id: self.id,
            root: self.root,
            started_at: self.started_at,
            finished_at: Utc::now(),
            incremental: self.incremental,
            quarantine_on_match: self.quarantine_on_match,
            files_discovered: self.files_discovered,
            files_considered: self.files_considered,
            files_skipped: self.files_skipped,
            matches: self.matches,
            errors: self.errors,
            outcome,
        }
    }
}

/// Last successfully scanned modification time per path. Process lifetime only.
#[derive(Debug, Default)]
pub struct IncrementalCache {
    entries: HashMap<PathBuf, SystemTime>,
}

impl IncrementalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `path` is unchanged since it was last scanned. Unknown paths
    /// and files without a modification time are never skipped.
    pub fn is_unchanged(&self, path: &Path, modified: Option<SystemTime>) -> bool {
        match (self.entries.get(path), modified) {
            (Some(cached), Some(modified)) => modified <= *cached,
            _ => false,
        }
    }

    pub fn record(&mut self, path: PathBuf, modified: SystemTime) {
        self.entries.insert(path, modified);
    }

    pub fn forget(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    /// Re-stat `paths` and record their current modification times; paths
    /// that no longer exist are forgotten.
    pub fn refresh<'a>(&mut self, paths: impl IntoIterator<Item = &'a PathBuf>) {
        for path in paths {
            match std::fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => self.record(path.clone(), modified),
                Err(_) => self.forget(path),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
