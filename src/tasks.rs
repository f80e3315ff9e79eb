//! Scheduled task definitions.
//!
//! Tasks are built with direct references to the components they drive and
//! handed to whatever trigger runs them (cron, interval timer, manual).

use crate::core::error::Result;
use crate::detection::RuleStore;
use crate::scanner::{ScanCoordinator, SessionOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Result of one task run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub message: String,
}

impl TaskReport {
    fn new(task: &str, started_at: DateTime<Utc>, success: bool, message: String) -> Self {
        Self {
            task: task.to_string(),
            started_at,
            finished_at: Utc::now(),
            success,
            message,
        }
    }
}

/// A unit of work a scheduler can trigger.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<TaskReport>;
}

/// Runs one scan session to completion.
pub struct ScanTask {
    name: String,
    coordinator: Arc<ScanCoordinator>,
    root: PathBuf,
    incremental: bool,
    quarantine_on_match: bool,
}

impl ScanTask {
    pub fn new(name: impl Into<String>, coordinator: Arc<ScanCoordinator>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            coordinator,
            root: root.into(),
            incremental: true,
            quarantine_on_match: false,
        }
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn quarantine_on_match(mut self, quarantine: bool) -> Self {
        self.quarantine_on_match = quarantine;
        self
    }
}

#[async_trait]
impl ScheduledTask for ScanTask {
    fn name(&self) -> &str {
        &self.name
    }

    /// A busy coordinator surfaces as an error; the trigger decides whether to retry.
    async fn run(&self) -> Result<TaskReport> {
        let started_at = Utc::now();
        log::info!("Task '{}' scanning {}", self.name, self.root.display());

        let summary = self
            .coordinator
            .start(&self.root, self.incremental, self.quarantine_on_match)?
            .wait()
            .await?;

        let message = format!(
            "{}: {} considered, {} match(es) in {} file(s), {} error(s)",
            summary.outcome,
            summary.files_considered,
            summary.matches.len(),
            summary.matched_files(),
            summary.errors.len()
        );
        Ok(TaskReport::new(
            &self.name,
            started_at,
            summary.outcome == SessionOutcome::Completed,
            message,
        ))
    }
}

/// Swaps in a fresh rule set after the rules directory was updated externally.
pub struct RuleRefreshTask {
    name: String,
    rules: Arc<RuleStore>,
}

impl RuleRefreshTask {
    pub fn new(name: impl Into<String>, rules: Arc<RuleStore>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }
}

#[async_trait]
impl ScheduledTask for RuleRefreshTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<TaskReport> {
        let started_at = Utc::now();
        let rules = Arc::clone(&self.rules);
        let reloaded = tokio::task::spawn_blocking(move || rules.reload_if_changed())
            .await
            .map_err(|e| crate::core::error::Error::task_join(format!("rule refresh: {}", e)))??;

        let message = match (reloaded, self.rules.active()) {
            (true, Some(set)) => format!(
                "loaded {} rule(s), fingerprint {}",
                set.rule_count(),
                set.fingerprint
            ),
            (true, None) => "rules directory is empty".to_string(),
            (false, _) => "rules unchanged".to_string(),
        };
        log::info!("Task '{}': {}", self.name, message);
        Ok(TaskReport::new(&self.name, started_at, true, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use std::fs;
    use tempfile::TempDir;

    const RULE: &str = r#"
rule Marker {
    strings:
        $m = "MARKER-42"
    condition:
        $m
}
"#;

    #[tokio::test]
    async fn test_scan_task_reports_summary() {
        let tmp = TempDir::new().unwrap();
        let rules_dir = tmp.path().join("rules");
        fs::create_dir_all(&rules_dir).unwrap();
        fs::write(rules_dir.join("marker.yar"), RULE).unwrap();
        let root = tmp.path().join("data");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.bin"), b"xx MARKER-42 xx").unwrap();

        let mut config = Config::default();
        config.scan.protected_paths = Vec::new();
        let store = Arc::new(RuleStore::open(&rules_dir).unwrap());
        let coordinator = Arc::new(ScanCoordinator::new(Arc::new(config), store, None));

        let task = ScanTask::new("nightly", coordinator, &root).incremental(false);
        assert_eq!(task.name(), "nightly");
        let report = task.run().await.unwrap();
        assert!(report.success);
        assert!(report.message.contains("1 match(es)"), "{}", report.message);
    }

    #[tokio::test]
    async fn test_rule_refresh_task() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(RuleStore::open(tmp.path()).unwrap());
        let task = RuleRefreshTask::new("rules", Arc::clone(&store));

        let report = task.run().await.unwrap();
        assert_eq!(report.message, "rules unchanged");

        fs::write(tmp.path().join("marker.yar"), RULE).unwrap();
        let report = task.run().await.unwrap();
        assert!(report.message.starts_with("loaded 1 rule(s)"), "{}", report.message);
        assert_eq!(store.active().unwrap().rule_count(), 1);

        let report = task.run().await.unwrap();
        assert_eq!(report.message, "rules unchanged");
    }
}
