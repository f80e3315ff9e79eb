//! Falcon Defender: a rule-based malware scanner.
//!
//! This crate compiles pattern rules into a cached rule set, walks files
//! through an eligibility filter, matches them on a bounded worker pool and
//! can move matched files into a durable quarantine vault. Scan sessions are
//! driven through a [`scanner::ScanCoordinator`] that supports pause, resume
//! and cancel, and reports on a bounded event stream.

pub mod core;
pub mod detection;
pub mod quarantine;
pub mod scanner;
pub mod tasks;
pub mod ui;
pub mod utils;

// Re-export commonly used types
pub use crate::core::config::Config;
pub use crate::core::error::{Error, Result};
pub use crate::core::types::{MatchAction, MatchRecord, Severity};
