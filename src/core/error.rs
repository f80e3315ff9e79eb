//! Error types and result handling for Falcon Defender.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our custom Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Falcon Defender operations.
#[derive(Error, Debug)]
pub enum Error {
    // ===== I/O Errors =====
    #[error("Failed to read file: {path}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete file: {path}")]
    FileDelete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to access directory: {path}")]
    DirectoryAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // ===== Configuration Errors =====
    #[error("Failed to load configuration: {0}")]
    ConfigLoad(String),

    #[error("Failed to save configuration: {0}")]
    ConfigSave(String),

    #[error("Invalid configuration value: {field} - {message}")]
    ConfigInvalid { field: String, message: String },

    // ===== Database Errors =====
    #[error("Database error: {0}")]
    DatabaseSql(#[from] rusqlite::Error),

    // ===== Rule Errors =====
    #[error("Rule compilation failed in {source_name} at line {line}: {message}")]
    RuleCompile {
        source_name: String,
        line: usize,
        message: String,
    },

    // ===== Scanning Errors =====
    #[error("A scan session is already active")]
    ScanBusy,

    #[error("Cannot {operation} while coordinator is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: String,
    },

    #[error("Matching timed out after {timeout_secs}s: {path}")]
    MatchTimeout { path: PathBuf, timeout_secs: u64 },

    #[error("Failed to scan file: {path} - {reason}")]
    ScanError { path: PathBuf, reason: String },

    // ===== Quarantine Errors =====
    #[error("Failed to quarantine file: {path}")]
    QuarantineFailed {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Quarantine record not found: {0}")]
    QuarantineItemNotFound(i64),

    #[error("Quarantined file for record {id} is missing from storage: {path}")]
    QuarantineFileMissing { id: i64, path: PathBuf },

    #[error("Quarantine record {id} is already {state}")]
    RecordFinalized { id: i64, state: String },

    #[error("Refusing to restore record {id}: {path} already exists")]
    RestoreTargetExists { id: i64, path: PathBuf },

    // ===== Concurrency Errors =====
    #[error("Lock poisoned: {context}")]
    LockPoisoned { context: String },

    #[error("Background task failed: {context}")]
    TaskJoin { context: String },

    // ===== Serialization Errors =====
    #[error("JSON serialization error")]
    JsonSerialize(#[from] serde_json::Error),

    // ===== Generic Errors =====
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a file read error.
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Create a file write error.
    pub fn file_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWrite {
            path: path.into(),
            source,
        }
    }

    /// Create a file delete error.
    pub fn file_delete(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileDelete {
            path: path.into(),
            source,
        }
    }

    /// Create a scan error.
    pub fn scan_error(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ScanError {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a rule compilation error.
    pub fn rule_compile(
        source_name: impl Into<String>,
        line: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::RuleCompile {
            source_name: source_name.into(),
            line,
            message: message.into(),
        }
    }

    /// Create an invalid state transition error.
    pub fn invalid_transition(operation: &'static str, state: impl ToString) -> Self {
        Self::InvalidTransition {
            operation,
            state: state.to_string(),
        }
    }

    /// Create a lock poisoned error.
    pub fn lock_poisoned(context: impl Into<String>) -> Self {
        Self::LockPoisoned {
            context: context.into(),
        }
    }

    /// Create a background task failure error.
    pub fn task_join(context: impl Into<String>) -> Self {
        Self::TaskJoin {
            context: context.into(),
        }
    }

    /// Check if this error is recoverable (scan can continue).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::FileRead { .. }
                | Error::ScanError { .. }
                | Error::MatchTimeout { .. }
                | Error::DirectoryAccess { .. }
        )
    }

    /// Get a user-friendly suggestion for how to resolve this error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::PathNotFound(_) => Some("Check that the path exists and is accessible"),
            Error::ConfigLoad(_) | Error::ConfigInvalid { .. } => {
                Some("Check your configuration file for syntax errors or missing fields")
            }
            Error::RuleCompile { .. } => {
                Some("Fix the reported rule file; scanning stays disabled until it compiles")
            }
            Error::ScanBusy => Some("Wait for the running scan to finish or cancel it first"),
            Error::MatchTimeout { .. } => {
                Some("Increase scan.match_timeout_secs or exclude very large files")
            }
            Error::DatabaseSql(_) => {
                Some("Check that the quarantine database is writable")
            }
            Error::LockPoisoned { .. } => Some("Internal error: restart the application"),
            Error::QuarantineItemNotFound(_) => Some("Run `quarantine list` to see valid ids"),
            Error::RecordFinalized { .. } => {
                Some("The quarantine item has already been restored or deleted")
            }
            Error::QuarantineFileMissing { .. } => {
                Some("The stored copy was removed outside the application and cannot be restored")
            }
            Error::RestoreTargetExists { .. } => {
                Some("Move or rename the file at the original location, then retry")
            }
            _ => None,
        }
    }

    /// Get the error category for logging and classification.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::FileRead { .. }
            | Error::FileWrite { .. }
            | Error::FileDelete { .. }
            | Error::DirectoryAccess { .. }
            | Error::ScanError { .. }
            | Error::QuarantineFailed { .. }
            | Error::Io(_) => ErrorCategory::Io,

            Error::ConfigLoad(_) | Error::ConfigSave(_) | Error::ConfigInvalid { .. } => {
                ErrorCategory::Configuration
            }

            Error::RuleCompile { .. } => ErrorCategory::Compile,

            Error::PathNotFound(_)
            | Error::QuarantineItemNotFound(_)
            | Error::QuarantineFileMissing { .. } => ErrorCategory::NotFound,

            Error::InvalidTransition { .. }
            | Error::RecordFinalized { .. }
            | Error::RestoreTargetExists { .. } => ErrorCategory::StateConflict,

            Error::MatchTimeout { .. } => ErrorCategory::Timeout,

            Error::ScanBusy => ErrorCategory::Busy,

            Error::DatabaseSql(_) => ErrorCategory::Database,

            Error::LockPoisoned { .. } | Error::TaskJoin { .. } => ErrorCategory::Concurrency,

            Error::JsonSerialize(_) => ErrorCategory::Serialization,

            Error::Internal(_) => ErrorCategory::Internal,
        }
    }
}

/// Error category for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Io,
    Configuration,
    Compile,
    NotFound,
    StateConflict,
    Timeout,
    Busy,
    Database,
    Concurrency,
    Serialization,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "I/O"),
            Self::Configuration => write!(f, "Configuration"),
            Self::Compile => write!(f, "Compile"),
            Self::NotFound => write!(f, "Not Found"),
            Self::StateConflict => write!(f, "State Conflict"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Busy => write!(f, "Busy"),
            Self::Database => write!(f, "Database"),
            Self::Concurrency => write!(f, "Concurrency"),
            Self::Serialization => write!(f, "Serialization"),
            Self::Internal => write!(f, "Internal"),
        }
    }
}
