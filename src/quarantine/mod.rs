//! Quarantine vault management.
//!
//! This module handles:
//! - Moving matched files into managed storage
//! - Durable records of every containment
//! - Restore and delete transitions

pub mod metadata;
pub mod operations;
pub mod vault;

pub use metadata::{QuarantineRecord, RecordState};
pub use operations::SecureOperations;
pub use vault::{ContainmentRequest, QuarantineVault};
