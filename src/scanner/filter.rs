//! Eligibility filter deciding which files are worth matching.

use crate::core::config::{normalize_extension, ScanConfig};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Extensions of rule sources and the compiled rule cache.
const RULE_EXTENSIONS: &[&str] = &["yar", "yara", "yarac"];

/// One candidate file, stat'ed once.
#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    /// Lower-case extension without the dot
    pub extension: Option<String>,
    pub is_file: bool,
    pub readable: bool,
}

impl ScanTarget {
    /// Stat `path`. A path that cannot be stat'ed yields a target that the
    /// filter rejects as not a regular file.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let extension = path
            .extension()
            .map(|e| normalize_extension(&e.to_string_lossy()))
            .filter(|e| !e.is_empty());

        match fs::metadata(&path) {
            Ok(meta) => {
                let is_file = meta.is_file();
                Self {
                    readable: is_file && File::open(&path).is_ok(),
                    size: meta.len(),
                    modified: meta.modified().ok(),
                    extension,
                    is_file,
                    path,
                }
            }
            Err(e) => {
                log::trace!("Cannot stat {}: {}", path.display(), e);
                Self {
                    path,
                    size: 0,
                    modified: None,
                    extension,
                    is_file: false,
                    readable: false,
                }
            }
        }
    }
}

/// Why a target was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NotRegularFile,
    TooLarge { size: u64, limit: u64 },
    NotAllowed,
    Blocked,
    RuleSource,
    Protected(PathBuf),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotRegularFile => write!(f, "not a regular readable file"),
            RejectReason::TooLarge { size, limit } => {
                write!(f, "size {} exceeds limit {}", size, limit)
            }
            RejectReason::NotAllowed => write!(f, "extension not in allow-list"),
            RejectReason::Blocked => write!(f, "extension blocked"),
            RejectReason::RuleSource => write!(f, "rule source file"),
            RejectReason::Protected(prefix) => write!(f, "under protected path {}", prefix.display()),
        }
    }
}

/// Outcome of [`EligibilityFilter::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Accept,
    Reject(RejectReason),
}

/// Pure predicate over a [`ScanTarget`] and static configuration.
#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    max_file_size: u64,
    allowed: HashSet<String>,
    blocked: HashSet<String>,
    protected: Vec<PathBuf>,
}

impl EligibilityFilter {
    pub fn new<A, B, P>(max_file_size: u64, allowed: A, blocked: B, protected: P) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        B: IntoIterator,
        B::Item: AsRef<str>,
        P: IntoIterator<Item = PathBuf>,
    {
        let normalize = |e: &str| normalize_extension(e);
        Self {
            max_file_size,
            allowed: allowed
                .into_iter()
                .map(|e| normalize(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
            blocked: blocked
                .into_iter()
                .map(|e| normalize(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
            protected: protected.into_iter().collect(),
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(
            config.max_file_size_bytes(),
            &config.allowed_extensions,
            &config.blocked_extensions,
            config.protected_paths.iter().cloned(),
        )
    }

    /// Add protected prefixes.
    pub fn with_protected(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        for path in paths {
            if !self.protected.contains(&path) {
                self.protected.push(path);
            }
        }
        self
    }

    /// Evaluate the rules in order; the first that matches decides.
    pub fn evaluate(&self, target: &ScanTarget) -> Eligibility {
        if !target.is_file || !target.readable {
            return Eligibility::Reject(RejectReason::NotRegularFile);
        }

        if target.size > self.max_file_size {
            return Eligibility::Reject(RejectReason::TooLarge {
                size: target.size,
                limit: self.max_file_size,
            });
        }

        let ext = target.extension.as_deref();

        if !self.allowed.is_empty() && !ext.is_some_and(|e| self.allowed.contains(e)) {
            return Eligibility::Reject(RejectReason::NotAllowed);
        }

        if ext.is_some_and(|e| self.blocked.contains(e)) {
            return Eligibility::Reject(RejectReason::Blocked);
        }

        if ext.is_some_and(|e| RULE_EXTENSIONS.contains(&e)) {
            return Eligibility::Reject(RejectReason::RuleSource);
        }

        if let Some(prefix) = self.protected_prefix(&target.path) {
            return Eligibility::Reject(RejectReason::Protected(prefix.to_path_buf()));
        }

        Eligibility::Accept
    }

    pub fn is_eligible(&self, target: &ScanTarget) -> bool {
        self.evaluate(target) == Eligibility::Accept
    }

    /// Whether `path` lies under a protected prefix.
    pub fn is_protected(&self, path: &Path) -> bool {
        self.protected_prefix(path).is_some()
    }

    fn protected_prefix(&self, path: &Path) -> Option<&Path> {
        self.protected
            .iter()
            .find(|prefix| path.starts_with(prefix))
            .map(PathBuf::as_path)
    }
}
