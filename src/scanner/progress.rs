//! Scan progress tracking and reporting.

use crate::core::types::MatchRecord;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Point-in-time view of a session's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Files found by enumeration
    pub files_discovered: u64,
    /// Files rejected by the filter or skipped as unchanged
    pub files_skipped: u64,
    /// Files whose match result was folded into the session
    pub files_completed: u64,
    /// Files queued for matching, once enumeration finished
    pub total_queued: Option<u64>,
    /// Rule hits recorded so far
    pub matches: u64,
    /// Per-file errors recorded so far
    pub errors: u64,
    /// Bytes of completed files
    pub bytes_scanned: u64,
    /// Seconds since the session started
    pub elapsed_secs: f64,
}

impl ProgressSnapshot {
    /// Calculate scan rate (files per second).
    pub fn files_per_second(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.files_completed as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }

    /// Calculate completion percentage.
    pub fn percentage(&self) -> Option<f64> {
        self.total_queued.map(|total| {
            if total > 0 {
                (self.files_completed as f64 / total as f64) * 100.0
            } else {
                100.0
            }
        })
    }
}

const TOTAL_UNKNOWN: u64 = u64::MAX;

/// Lock-free counters for one scan session.
pub struct ProgressTracker {
    files_discovered: AtomicU64,
    files_skipped: AtomicU64,
    files_completed: AtomicU64,
    total_queued: AtomicU64,
    matches: AtomicU64,
    errors: AtomicU64,
    bytes_scanned: AtomicU64,
    start_time: Instant,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    /// Create a tracker whose clock starts now.
    pub fn new() -> Self {
        Self {
            files_discovered: AtomicU64::new(0),
            files_skipped: AtomicU64::new(0),
            files_completed: AtomicU64::new(0),
            total_queued: AtomicU64::new(TOTAL_UNKNOWN),
            matches: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            bytes_scanned: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn add_discovered(&self, count: u64) {
        self.files_discovered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_skipped(&self, count: u64) {
        self.files_skipped.fetch_add(count, Ordering::Relaxed);
    }

    /// Record the number of files queued for matching.
    pub fn set_total_queued(&self, total: u64) {
        self.total_queued.store(total, Ordering::Relaxed);
    }

    /// Record one folded file.
    pub fn complete_file(&self, bytes: u64) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_scanned.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_matches(&self, count: u64) {
        self.matches.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current progress snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.total_queued.load(Ordering::Relaxed);
        ProgressSnapshot {
            files_discovered: self.files_discovered.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            files_completed: self.files_completed.load(Ordering::Relaxed),
            total_queued: (total != TOTAL_UNKNOWN).then_some(total),
            matches: self.matches.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Console progress reporter.
pub struct ConsoleProgressReporter {
    last_line_length: AtomicUsize,
    verbose: bool,
}

impl Default for ConsoleProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleProgressReporter {
    /// Create a new console reporter.
    pub fn new() -> Self {
        Self {
            last_line_length: AtomicUsize::new(0),
            verbose: false,
        }
    }

    /// Enable verbose output.
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    /// Format a status line for `progress`.
    pub fn format_line(status: &str, progress: &ProgressSnapshot) -> String {
        let rate = progress.files_per_second();
        let elapsed = progress.elapsed_secs as u64;

        match progress.percentage() {
            Some(pct) => format!(
                "[{}] {:.1}% | Files: {} | Skipped: {} | Matches: {} | Rate: {:.0}/s | Time: {}s",
                status,
                pct,
                progress.files_completed,
                progress.files_skipped,
                progress.matches,
                rate,
                elapsed
            ),
            None => format!(
                "[{}] Discovered: {} | Matches: {} | Time: {}s",
                status, progress.files_discovered, progress.matches, elapsed
            ),
        }
    }

    /// Overwrite the current console line with `progress`.
    pub fn report(&self, status: &str, progress: &ProgressSnapshot) {
        let message = Self::format_line(status, progress);

        let last_len = self.last_line_length.load(Ordering::Relaxed);
        let padding = " ".repeat(last_len.saturating_sub(message.len()));

        eprint!("\r{}{}", message, padding);
        self.last_line_length.store(message.len(), Ordering::Relaxed);
    }

    /// End the progress line.
    pub fn finish(&self) {
        if self.last_line_length.swap(0, Ordering::Relaxed) > 0 {
            eprintln!();
        }
    }

    /// Report a match.
    pub fn report_match(&self, record: &MatchRecord) {
        if self.verbose {
            eprintln!(
                "\n  [!] {} - {} ({}, {})",
                record.rule_name,
                record.file_path.display(),
                record.severity,
                record.action
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_tracker() {
        let tracker = ProgressTracker::new();

        tracker.add_discovered(3);
        tracker.add_skipped(1);
        tracker.complete_file(1000);
        tracker.complete_file(24);
        tracker.add_matches(2);
        tracker.increment_errors();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.files_discovered, 3);
        assert_eq!(snapshot.files_skipped, 1);
        assert_eq!(snapshot.files_completed, 2);
        assert_eq!(snapshot.bytes_scanned, 1024);
        assert_eq!(snapshot.matches, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.total_queued, None);
        assert_eq!(snapshot.percentage(), None);
    }

    #[test]
    fn test_scan_rate_and_percentage() {
        let progress = ProgressSnapshot {
            files_discovered: 250,
            files_skipped: 50,
            files_completed: 100,
            total_queued: Some(200),
            matches: 0,
            errors: 0,
            bytes_scanned: 10000,
            elapsed_secs: 10.0,
        };

        assert!((progress.files_per_second() - 10.0).abs() < f64::EPSILON);
        assert_eq!(progress.percentage(), Some(50.0));

        let empty = ProgressSnapshot {
            total_queued: Some(0),
            files_completed: 0,
            ..progress
        };
        assert_eq!(empty.percentage(), Some(100.0));
    }

    #[test]
    fn test_format_line() {
        let tracker = ProgressTracker::new();
        tracker.add_discovered(4);
        let line = ConsoleProgressReporter::format_line("Scanning", &tracker.snapshot());
        assert!(line.starts_with("[Scanning] Discovered: 4"));

        tracker.set_total_queued(4);
        tracker.complete_file(1);
        let line = ConsoleProgressReporter::format_line("Scanning", &tracker.snapshot());
        assert!(line.contains("25.0%"));
    }
}
