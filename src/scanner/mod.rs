//! File system scanning.
//!
//! This module provides:
//! - Eligibility filtering of candidate files
//! - Scan sessions with incremental skipping
//! - Pause, resume and cancel control
//! - Progress tracking and the event stream

pub mod control;
pub mod coordinator;
pub mod events;
pub mod filter;
pub mod progress;
pub mod session;

pub use control::ScanControl;
pub use coordinator::{CoordinatorStatus, ScanCoordinator, ScanState, SessionHandle};
pub use events::{EventBus, ScanEvent, ScanEventEnvelope};
pub use filter::{Eligibility, EligibilityFilter, RejectReason, ScanTarget};
pub use progress::{ConsoleProgressReporter, ProgressSnapshot, ProgressTracker};
pub use session::{FileError, FileErrorKind, IncrementalCache, ScanSummary, SessionOutcome};
