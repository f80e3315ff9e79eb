//! Scan event stream.
//!
//! Events fan out over a bounded `tokio::sync::broadcast` channel. A
//! subscriber that falls more than `capacity` events behind loses the oldest
//! ones and sees `RecvError::Lagged`; the publisher never waits.

use crate::core::types::MatchRecord;
use crate::scanner::progress::ProgressSnapshot;
use crate::scanner::session::ScanSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Something an observer may want to know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScanEvent {
    /// Counter snapshot
    Progress(ProgressSnapshot),
    /// One rule hit on one file
    Match(MatchRecord),
    Info {
        message: String,
    },
    Error {
        path: Option<PathBuf>,
        message: String,
    },
    /// Final session summary
    Done(ScanSummary),
}

impl ScanEvent {
    pub fn info(message: impl Into<String>) -> Self {
        ScanEvent::Info {
            message: message.into(),
        }
    }

    pub fn error(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        ScanEvent::Error {
            path,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ScanEvent::Progress(_) => "progress",
            ScanEvent::Match(_) => "match",
            ScanEvent::Info { .. } => "info",
            ScanEvent::Error { .. } => "error",
            ScanEvent::Done(_) => "done",
        }
    }
}

/// An event with its origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEventEnvelope {
    /// Owning session, or none for quarantine operations
    pub session_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub event: ScanEvent,
}

/// Multi-subscriber event channel with a fixed buffer.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ScanEventEnvelope>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEventEnvelope> {
        self.sender.subscribe()
    }

    /// Publish `event`. Returns the number of subscribers it reached; having
    /// none is not an error.
    pub fn publish(&self, session_id: Option<Uuid>, event: ScanEvent) -> usize {
        log::trace!("Publishing {} event", event.kind());
        let envelope = ScanEventEnvelope {
            session_id,
            timestamp: Utc::now(),
            event,
        };
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
