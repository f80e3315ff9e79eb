//! Scan orchestration.
//!
//! A [`ScanCoordinator`] runs at most one session at a time. The session's
//! control loop is a Tokio task that enumerates the root on the blocking pool,
//! keeps up to `scan_threads` match jobs in flight, and folds each finished
//! file into the session in the order results arrive. Pause and cancel are
//! checked before every dispatch and before every fold.

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{MatchAction, MatchRecord};
use crate::detection::{RuleMatch, RuleSet, RuleStore};
use crate::quarantine::{ContainmentRequest, QuarantineRecord, QuarantineVault};
use crate::scanner::control::ScanControl;
use crate::scanner::events::{EventBus, ScanEvent, ScanEventEnvelope};
use crate::scanner::filter::{Eligibility, EligibilityFilter, ScanTarget};
use crate::scanner::progress::{ProgressSnapshot, ProgressTracker};
use crate::scanner::session::{
    match_record, FileError, FileErrorKind, IncrementalCache, ScanSession, ScanSummary,
    SessionOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use uuid::Uuid;
use walkdir::WalkDir;

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Idle,
    Scanning,
    Paused,
    /// The last session failed; a new one may be started
    Error,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanState::Idle => "idle",
            ScanState::Scanning => "scanning",
            ScanState::Paused => "paused",
            ScanState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub state: ScanState,
    /// Current or most recent session
    pub session_id: Option<Uuid>,
    pub progress: Option<ProgressSnapshot>,
    pub last_outcome: Option<SessionOutcome>,
    pub cancel_requested: bool,
}

/// Handle to a started session.
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: Uuid,
    join: JoinHandle<ScanSummary>,
}

impl SessionHandle {
    /// Wait for the session to finish.
    pub async fn wait(self) -> Result<ScanSummary> {
        let session_id = self.session_id;
        self.join
            .await
            .map_err(|e| Error::task_join(format!("scan session {}: {}", session_id, e)))
    }
}

struct Inner {
    state: ScanState,
    session_id: Option<Uuid>,
    control: Option<Arc<ScanControl>>,
    progress: Option<Arc<ProgressTracker>>,
    cancel_requested: bool,
    last_outcome: Option<SessionOutcome>,
    last_summary: Option<ScanSummary>,
}

impl Inner {
    fn describe(&self) -> String {
        if self.cancel_requested {
            "cancelling".to_string()
        } else {
            self.state.to_string()
        }
    }
}

#[derive(Default)]
struct Enumeration {
    targets: Vec<ScanTarget>,
    discovered: u64,
    skipped: u64,
    errors: Vec<FileError>,
}

type MatchResult = (ScanTarget, Result<Vec<RuleMatch>>);

/// Orchestrates scan sessions against the active rule set.
pub struct ScanCoordinator {
    config: Arc<Config>,
    rules: Arc<RuleStore>,
    vault: Option<Arc<QuarantineVault>>,
    filter: Arc<EligibilityFilter>,
    events: EventBus,
    inner: Mutex<Inner>,
    cache: Arc<Mutex<IncrementalCache>>,
}

impl ScanCoordinator {
    pub fn new(
        config: Arc<Config>,
        rules: Arc<RuleStore>,
        vault: Option<Arc<QuarantineVault>>,
    ) -> Self {
        // never scan our own rule sources or vault storage
        let mut own_dirs = vec![rules.rules_dir().to_path_buf()];
        if let Some(vault) = &vault {
            own_dirs.push(vault.base_path().to_path_buf());
        }
        let canonical: Vec<PathBuf> = own_dirs
            .iter()
            .filter_map(|dir| fs::canonicalize(dir).ok())
            .collect();
        own_dirs.extend(canonical);
        let filter = EligibilityFilter::from_config(&config.scan).with_protected(own_dirs);

        Self {
            filter: Arc::new(filter),
            events: EventBus::new(config.events.channel_capacity),
            rules,
            vault,
            inner: Mutex::new(Inner {
                state: ScanState::Idle,
                session_id: None,
                control: None,
                progress: None,
                cancel_requested: false,
                last_outcome: None,
                last_summary: None,
            }),
            cache: Arc::new(Mutex::new(IncrementalCache::new())),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEventEnvelope> {
        self.events.subscribe()
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::lock_poisoned("coordinator state"))
    }

    fn read_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a session over `root`. Fails with `ScanBusy` while another
    /// session is scanning or paused.
    pub fn start(
        self: &Arc<Self>,
        root: impl Into<PathBuf>,
        incremental: bool,
        quarantine_on_match: bool,
    ) -> Result<SessionHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Internal("scan sessions require a Tokio runtime".to_string()))?;

        let root = root.into();
        let root = if root.is_relative() {
            std::env::current_dir()
                .map(|cwd| cwd.join(&root))
                .unwrap_or(root)
        } else {
            root
        };

        let session_id = Uuid::new_v4();
        let control = Arc::new(ScanControl::new());
        let progress = Arc::new(ProgressTracker::new());
        {
            let mut inner = self.lock_inner()?;
            if matches!(inner.state, ScanState::Scanning | ScanState::Paused) {
                return Err(Error::ScanBusy);
            }
            inner.state = ScanState::Scanning;
            inner.session_id = Some(session_id);
            inner.control = Some(Arc::clone(&control));
            inner.progress = Some(Arc::clone(&progress));
            inner.cancel_requested = false;
        }

        log::info!(
            "Starting scan {} of {} (incremental: {}, quarantine: {})",
            session_id,
            root.display(),
            incremental,
            quarantine_on_match
        );

        let session = ScanSession::new(session_id, root, incremental, quarantine_on_match);
        let coordinator = Arc::clone(self);
        let join = runtime.spawn(async move { coordinator.run_session(session, control, progress).await });

        Ok(SessionHandle { session_id, join })
    }

    /// Stop dispatching new files until [`ScanCoordinator::resume`].
    pub fn pause(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        if inner.state != ScanState::Scanning || inner.cancel_requested {
            return Err(Error::invalid_transition("pause", inner.describe()));
        }
        inner.state = ScanState::Paused;
        if let Some(control) = &inner.control {
            control.pause();
        }
        log::info!("Scan paused");
        self.events.publish(inner.session_id, ScanEvent::info("Scan paused"));
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        if inner.state != ScanState::Paused || inner.cancel_requested {
            return Err(Error::invalid_transition("resume", inner.describe()));
        }
        inner.state = ScanState::Scanning;
        if let Some(control) = &inner.control {
            control.resume();
        }
        log::info!("Scan resumed");
        self.events.publish(inner.session_id, ScanEvent::info("Scan resumed"));
        Ok(())
    }

    /// Request cancellation. In-flight matches finish but their results are
    /// discarded. Repeating the request is a no-op.
    pub fn cancel(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        match inner.state {
            ScanState::Scanning | ScanState::Paused => {
                if inner.cancel_requested {
                    return Ok(());
                }
                inner.cancel_requested = true;
                if let Some(control) = &inner.control {
                    control.cancel();
                }
                log::info!("Scan cancellation requested");
                self.events
                    .publish(inner.session_id, ScanEvent::info("Cancellation requested"));
                Ok(())
            }
            ScanState::Idle if inner.last_outcome == Some(SessionOutcome::Cancelled) => Ok(()),
            _ => Err(Error::invalid_transition("cancel", inner.describe())),
        }
    }

    /// Current state and live counters.
    pub fn status(&self) -> CoordinatorStatus {
        let inner = self.read_inner();
        CoordinatorStatus {
            state: inner.state,
            session_id: inner.session_id,
            progress: inner.progress.as_ref().map(|p| p.snapshot()),
            last_outcome: inner.last_outcome,
            cancel_requested: inner.cancel_requested,
        }
    }

    /// Summary of the most recently finished session.
    pub fn last_summary(&self) -> Option<ScanSummary> {
        self.read_inner().last_summary.clone()
    }

    async fn run_session(
        self: Arc<Self>,
        mut session: ScanSession,
        control: Arc<ScanControl>,
        progress: Arc<ProgressTracker>,
    ) -> ScanSummary {
        let session_id = session.id;
        self.events.publish(
            Some(session_id),
            ScanEvent::info(format!("Scan started: {}", session.root.display())),
        );

        let outcome = self.drive(&mut session, &control, &progress).await;
        self.refresh_cache(std::mem::take(&mut session.folded)).await;

        let summary = session.finalize(outcome);
        log::info!(
            "Scan {} {}: {} considered, {} skipped, {} match(es), {} error(s) in {:.1}s",
            session_id,
            outcome,
            summary.files_considered,
            summary.files_skipped,
            summary.matches.len(),
            summary.errors.len(),
            summary.duration().as_secs_f64()
        );

        {
            let mut inner = self.read_inner();
            inner.state = match outcome {
                SessionOutcome::Failed => ScanState::Error,
                _ => ScanState::Idle,
            };
            inner.control = None;
            inner.cancel_requested = false;
            inner.last_outcome = Some(outcome);
            inner.last_summary = Some(summary.clone());
        }

        self.events
            .publish(Some(session_id), ScanEvent::Progress(progress.snapshot()));
        self.events
            .publish(Some(session_id), ScanEvent::Done(summary.clone()));
        summary
    }

    async fn drive(
        &self,
        session: &mut ScanSession,
        control: &Arc<ScanControl>,
        progress: &Arc<ProgressTracker>,
    ) -> SessionOutcome {
        let enumeration = {
            let root = session.root.clone();
            let filter = Arc::clone(&self.filter);
            let cache = Arc::clone(&self.cache);
            let control = Arc::clone(control);
            let progress = Arc::clone(progress);
            let follow_symlinks = self.config.scan.follow_symlinks;
            let incremental = session.incremental;

            tokio::task::spawn_blocking(move || {
                let cache = cache
                    .lock()
                    .map_err(|_| Error::lock_poisoned("incremental cache"))?;
                enumerate(
                    &root,
                    &filter,
                    follow_symlinks,
                    incremental,
                    &cache,
                    &control,
                    &progress,
                )
            })
            .await
        };

        let enumeration = match flatten(enumeration, "enumeration") {
            Ok(enumeration) => enumeration,
            Err(e) => {
                log::error!("Cannot scan {}: {}", session.root.display(), e);
                progress.increment_errors();
                let error = FileError::new(session.root.clone(), FileErrorKind::Io, e.to_string());
                self.record_error(session, error);
                return SessionOutcome::Failed;
            }
        };

        session.files_discovered = enumeration.discovered;
        session.files_skipped = enumeration.skipped;
        for error in enumeration.errors {
            progress.increment_errors();
            self.record_error(session, error);
        }
        if control.is_cancelled() {
            return SessionOutcome::Cancelled;
        }

        let mut queue: VecDeque<ScanTarget> = enumeration.targets.into();
        progress.set_total_queued(queue.len() as u64);
        log::debug!("{} file(s) queued for matching", queue.len());

        let limit = self.config.scan.scan_threads.max(1);
        let timeout = Duration::from_secs(self.config.scan.match_timeout_secs.max(1));
        let mut in_flight: JoinSet<MatchResult> = JoinSet::new();
        let mut warned_no_rules = false;

        loop {
            if control.is_cancelled() {
                return SessionOutcome::Cancelled;
            }

            if !control.is_paused() {
                while in_flight.len() < limit {
                    let Some(target) = queue.pop_front() else {
                        break;
                    };
                    match self.rules.active() {
                        Some(rules) => {
                            in_flight.spawn(match_target(rules, target, timeout));
                        }
                        None => {
                            if !warned_no_rules {
                                log::warn!("No active rule set, files are counted but not matched");
                                self.events.publish(
                                    Some(session.id),
                                    ScanEvent::info("No active rule set; scanning yields no matches"),
                                );
                                warned_no_rules = true;
                            }
                            session.files_considered += 1;
                            progress.complete_file(target.size);
                        }
                    }
                    if control.is_cancelled() {
                        return SessionOutcome::Cancelled;
                    }
                }
            }

            if in_flight.is_empty() {
                if queue.is_empty() {
                    return SessionOutcome::Completed;
                }
                // paused with nothing running
                control.changed().await;
                continue;
            }

            tokio::select! {
                _ = control.changed() => {}
                joined = in_flight.join_next() => match joined {
                    Some(Ok((target, result))) => {
                        if control.is_cancelled() {
                            return SessionOutcome::Cancelled;
                        }
                        self.fold(session, progress, target, result).await;
                    }
                    Some(Err(e)) => {
                        log::error!("Match task failed: {}", e);
                        progress.increment_errors();
                    }
                    None => {}
                }
            }
        }
    }

    /// Fold one file's result into the session and emit its events together.
    async fn fold(
        &self,
        session: &mut ScanSession,
        progress: &ProgressTracker,
        target: ScanTarget,
        result: Result<Vec<RuleMatch>>,
    ) {
        session.files_considered += 1;
        session.folded.push(target.path.clone());
        progress.complete_file(target.size);

        let hits = match result {
            Ok(hits) => hits,
            Err(e) => {
                progress.increment_errors();
                self.record_error(session, FileError::from_error(&target.path, &e));
                return;
            }
        };
        if hits.is_empty() {
            log::trace!("Clean: {}", target.path.display());
            return;
        }

        let mut records: Vec<MatchRecord> = hits
            .into_iter()
            .map(|hit| match_record(&target.path, hit))
            .collect();

        if session.quarantine_on_match {
            let action = self.contain(&target.path, &records).await;
            for record in &mut records {
                record.action = action.clone();
            }
        }

        progress.add_matches(records.len() as u64);
        for record in &records {
            log::warn!(
                "Match: {} in {} [{}] ({})",
                record.rule_name,
                record.file_path.display(),
                record.namespace,
                record.action
            );
            self.events
                .publish(Some(session.id), ScanEvent::Match(record.clone()));
        }
        session.matches.extend(records);
    }

    /// Contain a matched file once, whatever the number of rules that hit it.
    async fn contain(&self, path: &Path, records: &[MatchRecord]) -> MatchAction {
        let Some(vault) = self.vault.clone() else {
            return MatchAction::QuarantineFailed {
                reason: "quarantine vault unavailable".to_string(),
            };
        };
        let Some(request) = ContainmentRequest::from_matches(records) else {
            return MatchAction::Detected;
        };

        let path = path.to_path_buf();
        let contained = tokio::task::spawn_blocking(move || {
            let id = vault.quarantine(&path, &request)?;
            vault.get(id)?.ok_or(Error::QuarantineItemNotFound(id))
        })
        .await;

        match flatten(contained, "quarantine") {
            Ok(record) => MatchAction::Quarantined {
                record_id: record.id,
                storage_path: record.quarantine_path,
            },
            Err(e) => MatchAction::QuarantineFailed {
                reason: e.to_string(),
            },
        }
    }

    fn record_error(&self, session: &mut ScanSession, error: FileError) {
        self.events.publish(
            Some(session.id),
            ScanEvent::error(Some(error.path.clone()), error.message.clone()),
        );
        session.record_error(error);
    }

    async fn refresh_cache(&self, folded: Vec<PathBuf>) {
        let cache = Arc::clone(&self.cache);
        let refreshed = tokio::task::spawn_blocking(move || {
            let mut cache = cache
                .lock()
                .map_err(|_| Error::lock_poisoned("incremental cache"))?;
            cache.refresh(&folded);
            Ok::<_, Error>(cache.len())
        })
        .await;

        match flatten(refreshed, "incremental cache refresh") {
            Ok(len) => log::debug!("Incremental cache holds {} path(s)", len),
            Err(e) => log::warn!("Failed to update incremental cache: {}", e),
        }
    }

    fn vault(&self) -> Result<Arc<QuarantineVault>> {
        self.vault.clone().ok_or_else(|| Error::ConfigInvalid {
            field: "quarantine.vault_path".to_string(),
            message: "quarantine vault is not available".to_string(),
        })
    }

    /// Active quarantine records.
    pub async fn list_quarantined(&self) -> Result<Vec<QuarantineRecord>> {
        let vault = self.vault()?;
        flatten(
            tokio::task::spawn_blocking(move || vault.list()).await,
            "quarantine list",
        )
    }

    /// Restore a record and report the result on the event stream.
    pub async fn restore_quarantined(&self, id: i64) -> Result<QuarantineRecord> {
        let vault = self.vault()?;
        let result = flatten(
            tokio::task::spawn_blocking(move || vault.restore(id)).await,
            "quarantine restore",
        );
        self.report_quarantine_op("Restore", id, &result);
        result
    }

    /// Delete a record and report the result on the event stream.
    pub async fn delete_quarantined(&self, id: i64) -> Result<QuarantineRecord> {
        let vault = self.vault()?;
        let result = flatten(
            tokio::task::spawn_blocking(move || vault.delete(id)).await,
            "quarantine delete",
        );
        self.report_quarantine_op("Delete", id, &result);
        result
    }

    fn report_quarantine_op(&self, op: &str, id: i64, result: &Result<QuarantineRecord>) {
        match result {
            Ok(record) => {
                self.events.publish(
                    None,
                    ScanEvent::info(format!(
                        "{} of #{} succeeded: {}",
                        op,
                        id,
                        record.original_path.display()
                    )),
                );
            }
            Err(e) => {
                log::error!("{} of quarantine record #{} failed: {}", op, id, e);
                self.events.publish(
                    None,
                    ScanEvent::error(None, format!("{} of #{} failed: {}", op, id, e)),
                );
            }
        }
    }
}

fn flatten<T>(joined: std::result::Result<Result<T>, JoinError>, context: &str) -> Result<T> {
    joined.map_err(|e| Error::task_join(format!("{}: {}", context, e)))?
}

async fn match_target(rules: Arc<RuleSet>, target: ScanTarget, timeout: Duration) -> MatchResult {
    let path = target.path.clone();
    let work = tokio::task::spawn_blocking(move || rules.scan_file(&path, Some(timeout)));

    let result = match tokio::time::timeout(timeout, work).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(Error::scan_error(
            &target.path,
            format!("match task failed: {}", e),
        )),
        Err(_) => Err(Error::MatchTimeout {
            path: target.path.clone(),
            timeout_secs: timeout.as_secs(),
        }),
    };
    (target, result)
}

/// Collect the eligible files under `root`.
///
/// Runs on the blocking pool. The filter applies to a single-file root too;
/// only files found by the directory walk are subject to incremental skipping.
fn enumerate(
    root: &Path,
    filter: &EligibilityFilter,
    follow_symlinks: bool,
    incremental: bool,
    cache: &IncrementalCache,
    control: &ScanControl,
    progress: &ProgressTracker,
) -> Result<Enumeration> {
    let meta = fs::metadata(root).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::PathNotFound(root.to_path_buf())
        } else {
            Error::DirectoryAccess {
                path: root.to_path_buf(),
                source: e,
            }
        }
    })?;

    let mut enumeration = Enumeration::default();

    if !meta.is_dir() {
        enumeration.discovered = 1;
        progress.add_discovered(1);
        let target = ScanTarget::from_path(root);
        match filter.evaluate(&target) {
            Eligibility::Accept => enumeration.targets.push(target),
            Eligibility::Reject(reason) => {
                log::debug!("Skipping {}: {}", root.display(), reason);
                enumeration.skipped = 1;
                progress.add_skipped(1);
            }
        }
        return Ok(enumeration);
    }

    let walker = WalkDir::new(root)
        .follow_links(follow_symlinks)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && filter.is_protected(e.path())));

    for entry in walker {
        if control.is_cancelled() {
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
                enumeration
                    .errors
                    .push(FileError::new(path, FileErrorKind::Walk, e.to_string()));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        enumeration.discovered += 1;
        progress.add_discovered(1);

        let target = ScanTarget::from_path(entry.path());
        if let Eligibility::Reject(reason) = filter.evaluate(&target) {
            log::trace!("Skipping {}: {}", target.path.display(), reason);
            enumeration.skipped += 1;
            progress.add_skipped(1);
            continue;
        }
        if incremental && cache.is_unchanged(&target.path, target.modified) {
            log::trace!("Unchanged since last scan: {}", target.path.display());
            enumeration.skipped += 1;
            progress.add_skipped(1);
            continue;
        }

        enumeration.targets.push(target);
    }

    Ok(enumeration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorCategory;
    use std::fs::File;
    use std::time::SystemTime;
    use tempfile::TempDir;

    const EICAR: &[u8] = b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

    const EICAR_RULE: &str = r#"
rule EICAR_Test_File {
    meta:
        description = "EICAR test file"
        confidence = "high"
    strings:
        $eicar = "X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"
    condition:
        $eicar
}

rule EICAR_Prefix {
    strings:
        $p = "X5O!P%@AP"
    condition:
        $p
}
"#;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        vault: Arc<QuarantineVault>,
        coordinator: Arc<ScanCoordinator>,
    }

    fn fixture(rules: Option<&str>) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let rules_dir = tmp.path().join("rules");
        fs::create_dir_all(&rules_dir).unwrap();
        if let Some(source) = rules {
            fs::write(rules_dir.join("test.yar"), source).unwrap();
        }
        let root = tmp.path().join("target");
        fs::create_dir_all(&root).unwrap();

        let mut config = Config::default();
        config.scan.max_file_size_mb = 1;
        config.scan.scan_threads = 2;
        config.scan.protected_paths = Vec::new();
        config.quarantine.vault_path = Some(tmp.path().join("vault"));

        let store = Arc::new(RuleStore::open(&rules_dir).unwrap());
        let vault = Arc::new(QuarantineVault::open(&tmp.path().join("vault")).unwrap());
        let coordinator = Arc::new(ScanCoordinator::new(
            Arc::new(config),
            store,
            Some(Arc::clone(&vault)),
        ));

        Fixture {
            _tmp: tmp,
            root,
            vault,
            coordinator,
        }
    }

    fn write(root: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = root.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    async fn collect_until_done(
        rx: &mut broadcast::Receiver<ScanEventEnvelope>,
    ) -> Vec<ScanEventEnvelope> {
        let mut events = Vec::new();
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let done = matches!(envelope.event, ScanEvent::Done(_));
            events.push(envelope);
            if done {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn test_end_to_end_quarantine() {
        let fx = fixture(Some(EICAR_RULE));
        let infected = write(&fx.root, "eicar.com", EICAR);
        write(&fx.root, "clean.txt", b"nothing to see");
        write(&fx.root, "huge.bin", &vec![0u8; 1024 * 1024 + 1]);

        let summary = fx
            .coordinator
            .start(&fx.root, false, true)
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(summary.outcome, SessionOutcome::Completed);
        assert_eq!(summary.files_discovered, 3);
        assert_eq!(summary.files_considered, 2);
        assert_eq!(summary.files_skipped, 1);
        assert!(summary.errors.is_empty());

        // two rules hit the same file, which is contained once
        assert_eq!(summary.matches.len(), 2);
        assert_eq!(summary.matched_files(), 1);
        assert!(summary.matches.iter().all(|m| m.action.is_quarantined()));
        assert_eq!(summary.matches[0].action, summary.matches[1].action);
        assert!(!infected.exists());

        let records = fx.coordinator.list_quarantined().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_path, infected);
        assert_eq!(records[0].match_records().unwrap().len(), 2);
        assert_eq!(fx.coordinator.status().state, ScanState::Idle);
    }

    #[tokio::test]
    async fn test_restore_through_coordinator() {
        let fx = fixture(Some(EICAR_RULE));
        let infected = write(&fx.root, "eicar.com", EICAR);
        fx.coordinator
            .start(&fx.root, false, true)
            .unwrap()
            .wait()
            .await
            .unwrap();
        let id = fx.vault.list().unwrap()[0].id;

        let mut rx = fx.coordinator.subscribe();
        fx.coordinator.restore_quarantined(id).await.unwrap();
        assert!(fx.coordinator.list_quarantined().await.unwrap().is_empty());
        assert_eq!(fs::read(&infected).unwrap(), EICAR);
        assert!(matches!(rx.recv().await.unwrap().event, ScanEvent::Info { .. }));

        let err = fx.coordinator.delete_quarantined(id).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::StateConflict);
        assert!(matches!(rx.recv().await.unwrap().event, ScanEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_event_stream() {
        let fx = fixture(Some(EICAR_RULE));
        write(&fx.root, "eicar.com", EICAR);
        write(&fx.root, "clean.txt", b"clean");

        let mut rx = fx.coordinator.subscribe();
        let handle = fx.coordinator.start(&fx.root, false, false).unwrap();
        let session_id = handle.session_id;
        let events = collect_until_done(&mut rx).await;
        handle.wait().await.unwrap();

        assert!(events.iter().all(|e| e.session_id == Some(session_id)));
        let kinds: Vec<&str> = events.iter().map(|e| e.event.kind()).collect();
        assert_eq!(kinds.iter().filter(|k| **k == "progress").count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == "done").count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == "match").count(), 2);
        assert_eq!(&kinds[kinds.len() - 2..], &["progress", "done"]);

        match &events[events.len() - 2].event {
            ScanEvent::Progress(snapshot) => {
                assert_eq!(snapshot.files_completed, 2);
                assert_eq!(snapshot.matches, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rescan_is_deterministic() {
        let fx = fixture(Some(EICAR_RULE));
        write(&fx.root, "a.com", EICAR);
        write(&fx.root, "b.com", EICAR);

        let mut previous: Option<Vec<(PathBuf, String)>> = None;
        for _ in 0..2 {
            let summary = fx
                .coordinator
                .start(&fx.root, false, false)
                .unwrap()
                .wait()
                .await
                .unwrap();
            let mut hits: Vec<(PathBuf, String)> = summary
                .matches
                .iter()
                .map(|m| (m.file_path.clone(), m.rule_name.clone()))
                .collect();
            hits.sort();
            assert_eq!(hits.len(), 4);
            if let Some(prev) = &previous {
                assert_eq!(prev, &hits);
            }
            previous = Some(hits);
        }
    }

    #[tokio::test]
    async fn test_incremental_skips_unchanged() {
        let fx = fixture(Some(EICAR_RULE));
        let changed = write(&fx.root, "a.txt", b"one");
        write(&fx.root, "b.txt", b"two");

        let first = fx
            .coordinator
            .start(&fx.root, true, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(first.files_considered, 2);

        let second = fx
            .coordinator
            .start(&fx.root, true, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(second.files_considered, 0);
        assert_eq!(second.files_skipped, 2);

        File::options()
            .write(true)
            .open(&changed)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();
        write(&fx.root, "new.txt", b"three");

        let third = fx
            .coordinator
            .start(&fx.root, true, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(third.files_considered, 2);
        assert_eq!(third.files_skipped, 1);

        // a full scan ignores the cache
        let full = fx
            .coordinator
            .start(&fx.root, false, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(full.files_considered, 3);
    }

    #[tokio::test]
    async fn test_single_file_root() {
        let fx = fixture(Some(EICAR_RULE));
        let file = write(&fx.root, "eicar.com", EICAR);
        let blocked = write(&fx.root, "eicar.tmp", EICAR);

        for _ in 0..2 {
            let summary = fx
                .coordinator
                .start(&file, true, false)
                .unwrap()
                .wait()
                .await
                .unwrap();
            assert_eq!(summary.files_considered, 1);
            assert_eq!(summary.matches.len(), 2);
        }

        let summary = fx
            .coordinator
            .start(&blocked, false, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(summary.files_considered, 0);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.outcome, SessionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_busy_and_pause_resume() {
        let fx = fixture(Some(EICAR_RULE));
        for i in 0..5 {
            write(&fx.root, &format!("f{}.bin", i), EICAR);
        }

        let handle = fx.coordinator.start(&fx.root, false, false).unwrap();
        let err = fx.coordinator.start(&fx.root, false, false).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Busy);

        fx.coordinator.pause().unwrap();
        assert_eq!(fx.coordinator.status().state, ScanState::Paused);
        assert!(fx.coordinator.start(&fx.root, false, false).is_err());
        assert_eq!(
            fx.coordinator.pause().unwrap_err().category(),
            ErrorCategory::StateConflict
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = fx.coordinator.status();
        assert_eq!(status.state, ScanState::Paused);
        assert_eq!(status.progress.unwrap().files_completed, 0);

        fx.coordinator.resume().unwrap();
        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.outcome, SessionOutcome::Completed);
        assert_eq!(summary.files_considered, 5);
        assert_eq!(fx.coordinator.status().state, ScanState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let fx = fixture(Some(EICAR_RULE));
        for i in 0..5 {
            write(&fx.root, &format!("f{}.bin", i), EICAR);
        }

        let handle = fx.coordinator.start(&fx.root, false, true).unwrap();
        fx.coordinator.pause().unwrap();
        fx.coordinator.cancel().unwrap();
        fx.coordinator.cancel().unwrap();
        assert!(fx.coordinator.status().cancel_requested);
        assert!(fx.coordinator.resume().is_err());
        assert!(fx.coordinator.pause().is_err());

        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.outcome, SessionOutcome::Cancelled);
        assert_eq!(summary.files_considered, 0);
        assert!(fx.vault.list().unwrap().is_empty());

        let status = fx.coordinator.status();
        assert_eq!(status.state, ScanState::Idle);
        assert_eq!(status.last_outcome, Some(SessionOutcome::Cancelled));
        fx.coordinator.cancel().unwrap();
        assert_eq!(
            fx.coordinator.last_summary().unwrap().session_id,
            summary.session_id
        );
    }

    #[tokio::test]
    async fn test_invalid_transitions_from_idle() {
        let fx = fixture(Some(EICAR_RULE));
        for result in [
            fx.coordinator.pause(),
            fx.coordinator.resume(),
            fx.coordinator.cancel(),
        ] {
            assert_eq!(result.unwrap_err().category(), ErrorCategory::StateConflict);
        }
    }

    #[tokio::test]
    async fn test_missing_root_fails() {
        let fx = fixture(Some(EICAR_RULE));
        let summary = fx
            .coordinator
            .start(fx.root.join("missing"), false, false)
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(summary.outcome, SessionOutcome::Failed);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(fx.coordinator.status().state, ScanState::Error);

        // error state can start again
        write(&fx.root, "clean.txt", b"clean");
        let summary = fx
            .coordinator
            .start(&fx.root, false, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(summary.outcome, SessionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_no_rules_counts_without_matching() {
        let fx = fixture(None);
        write(&fx.root, "eicar.com", EICAR);

        for _ in 0..2 {
            let summary = fx
                .coordinator
                .start(&fx.root, true, true)
                .unwrap()
                .wait()
                .await
                .unwrap();
            assert_eq!(summary.outcome, SessionOutcome::Completed);
            assert_eq!(summary.files_considered, 1);
            assert!(summary.is_clean());
        }
    }

    #[tokio::test]
    async fn test_quarantine_without_vault() {
        let fx = fixture(Some(EICAR_RULE));
        let infected = write(&fx.root, "eicar.com", EICAR);
        let coordinator = Arc::new(ScanCoordinator::new(
            Arc::new(fx.coordinator.config().clone()),
            Arc::clone(fx.coordinator.rules()),
            None,
        ));

        let summary = coordinator
            .start(&fx.root, false, true)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(summary.matches.len(), 2);
        assert!(summary
            .matches
            .iter()
            .all(|m| m.action.to_string().starts_with("quarantine-failed:")));
        assert!(infected.exists());
        assert!(coordinator.list_quarantined().await.is_err());
    }

    #[tokio::test]
    async fn test_vault_and_rules_inside_root_are_not_scanned() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let state_dir = root.join(".falcon");
        let rules_dir = state_dir.join("rules");
        fs::create_dir_all(&rules_dir).unwrap();
        fs::write(
            rules_dir.join("prefix.yar"),
            "rule E { strings: $p = \"X5O!P%@AP\" condition: $p }",
        )
        .unwrap();
        let infected = write(&root, "eicar.com", EICAR);

        let mut config = Config::default();
        config.scan.protected_paths = Vec::new();
        let store = Arc::new(RuleStore::open(&rules_dir).unwrap());
        let vault = Arc::new(QuarantineVault::open(&state_dir.join("quarantine")).unwrap());
        let coordinator = Arc::new(ScanCoordinator::new(
            Arc::new(config),
            store,
            Some(Arc::clone(&vault)),
        ));

        let first = coordinator
            .start(&root, false, true)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(first.files_considered, 1);
        assert_eq!(first.matches.len(), 1);
        assert!(!infected.exists());

        // the database now holds the matched excerpt
        let second = coordinator
            .start(&root, false, true)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(second.files_considered, 0);
        assert!(second.matches.is_empty(), "{:?}", second.matches);
        assert!(vault.base_path().join("quarantine.db").exists());

        let records = vault.list().unwrap();
        assert_eq!(records.len(), 1);
        coordinator.restore_quarantined(records[0].id).await.unwrap();
        assert_eq!(fs::read(&infected).unwrap(), EICAR);
    }

    #[tokio::test]
    async fn test_file_error_does_not_abort_session() {
        let fx = fixture(Some(EICAR_RULE));
        let kept = write(&fx.root, "a.com", EICAR);
        let vanished = write(&fx.root, "b.com", EICAR);

        let handle = fx.coordinator.start(&fx.root, false, false).unwrap();
        fx.coordinator.pause().unwrap();

        // wait for enumeration to queue both files
        let queued = async {
            loop {
                let status = fx.coordinator.status();
                if status.progress.and_then(|p| p.total_queued) == Some(2) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), queued)
            .await
            .unwrap();

        fs::remove_file(&vanished).unwrap();
        fx.coordinator.resume().unwrap();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.outcome, SessionOutcome::Completed);
        assert_eq!(summary.files_considered, 2);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].path, vanished);
        assert_eq!(summary.errors[0].kind, FileErrorKind::Io);
        assert_eq!(summary.matches.len(), 2);
        assert!(summary.matches.iter().all(|m| m.file_path == kept));
    }
}
