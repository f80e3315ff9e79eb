//! Rule compilation, on-disk caching and hot reload.
//!
//! Rule sources are every `.yar`/`.yara` file below the rules directory. The
//! whole tree is identified by a [`Fingerprint`]; a compiled copy is cached
//! next to the sources as `compiled_rules.yarac` plus a checksum sidecar and is
//! only trusted while both agree with the current fingerprint.

use crate::core::error::{Error, Result};
use crate::detection::yara::{RuleMatch, YaraEngine, YaraRule};
use crate::utils::hash::{HashCalculator, ManifestDigest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use walkdir::WalkDir;

/// Compiled rule cache file name.
pub const COMPILED_FILE: &str = "compiled_rules.yarac";

/// Checksum sidecar of the compiled cache.
pub const CHECKSUM_FILE: &str = "compiled_rules.yarac.checksum";

const ARTIFACT_VERSION: u32 = 1;

const NO_RULES: &str = "no-rules";

/// Content identity of a rule source tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Sentinel for a missing or empty rules directory.
    pub fn none() -> Self {
        Self(NO_RULES.to_string())
    }

    pub fn is_none(&self) -> bool {
        self.0 == NO_RULES
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() > 12 {
            write!(f, "{}", &self.0[..12])
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A rule source file.
#[derive(Debug, Clone)]
pub struct RuleSource {
    /// Path relative to the rules directory, `/`-separated
    pub key: String,
    pub path: PathBuf,
}

fn is_rule_source(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yar") || e.eq_ignore_ascii_case("yara"))
}

fn source_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// List rule sources below `dir`, sorted by key. A missing directory has none.
pub fn discover_sources(dir: &Path) -> Result<Vec<RuleSource>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut sources = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(format!("Failed to walk rules directory: {}", e)))?;
        if entry.file_type().is_file() && is_rule_source(entry.path()) {
            sources.push(RuleSource {
                key: source_key(dir, entry.path()),
                path: entry.path().to_path_buf(),
            });
        }
    }

    sources.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(sources)
}

/// Fingerprint the rule sources currently below `dir`.
///
/// Depends on file names and contents only, never on timestamps.
pub fn fingerprint(dir: &Path) -> Result<Fingerprint> {
    let sources = discover_sources(dir)?;
    if sources.is_empty() {
        return Ok(Fingerprint::none());
    }

    let mut digest = ManifestDigest::new();
    for source in &sources {
        digest.add(&source.key, &HashCalculator::sha256_file(&source.path)?);
    }
    Ok(Fingerprint(digest.finish()))
}

/// An immutable compiled rule set.
#[derive(Debug)]
pub struct RuleSet {
    /// Source key to content SHA-256
    pub sources: BTreeMap<String, String>,
    pub fingerprint: Fingerprint,
    engine: YaraEngine,
    pub compiled_at: DateTime<Utc>,
}

impl RuleSet {
    /// Compile every source below `dir`. Any error fails the whole set.
    pub fn compile(dir: &Path) -> Result<Self> {
        let sources = discover_sources(dir)?;
        if sources.is_empty() {
            return Err(Error::rule_compile(
                dir.display().to_string(),
                0,
                "no rule sources found",
            ));
        }

        let mut engine = YaraEngine::new();
        let mut hashes = BTreeMap::new();
        let mut digest = ManifestDigest::new();

        for source in &sources {
            // hash and parse the same bytes so the fingerprint matches what was compiled
            let bytes = fs::read(&source.path).map_err(|e| Error::file_read(&source.path, e))?;
            let sha = HashCalculator::sha256_bytes(&bytes);
            digest.add(&source.key, &sha);

            let text = String::from_utf8(bytes)
                .map_err(|_| Error::rule_compile(&source.key, 0, "source is not valid UTF-8"))?;
            let added = engine.add_source(&source.key, &text)?;
            log::debug!("Compiled {} rule(s) from {}", added, source.key);
            hashes.insert(source.key.clone(), sha);
        }

        if engine.rule_count() == 0 {
            return Err(Error::rule_compile(
                dir.display().to_string(),
                0,
                "rule sources contain no rules",
            ));
        }

        Ok(Self {
            sources: hashes,
            fingerprint: Fingerprint(digest.finish()),
            engine,
            compiled_at: Utc::now(),
        })
    }

    pub fn rule_count(&self) -> usize {
        self.engine.rule_count()
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.engine.list_rules()
    }

    /// Match a file against this rule set.
    pub fn scan_file(&self, path: &Path, timeout: Option<Duration>) -> Result<Vec<RuleMatch>> {
        self.engine.scan_file(path, timeout)
    }

    pub fn engine(&self) -> &YaraEngine {
        &self.engine
    }
}

#[derive(Serialize, Deserialize)]
struct CompiledArtifact {
    format_version: u32,
    fingerprint: Fingerprint,
    compiled_at: DateTime<Utc>,
    sources: BTreeMap<String, String>,
    rules: Vec<YaraRule>,
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| Error::file_write(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::file_write(path, e))
}

/// Write the compiled cache for `set` into `dir`.
///
/// The sidecar is removed first and written last, so a crash in between
/// leaves a blob without a checksum, which is treated as a miss.
pub fn persist(dir: &Path, set: &RuleSet) -> Result<()> {
    let blob_path = dir.join(COMPILED_FILE);
    let sidecar_path = dir.join(CHECKSUM_FILE);

    if let Err(e) = fs::remove_file(&sidecar_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(Error::file_delete(&sidecar_path, e));
        }
    }

    let artifact = CompiledArtifact {
        format_version: ARTIFACT_VERSION,
        fingerprint: set.fingerprint.clone(),
        compiled_at: set.compiled_at,
        sources: set.sources.clone(),
        rules: set.engine.rules().to_vec(),
    };
    write_atomic(&blob_path, &serde_json::to_vec(&artifact)?)?;
    write_atomic(&sidecar_path, set.fingerprint.as_str().as_bytes())?;

    log::debug!("Persisted compiled rules ({})", set.fingerprint);
    Ok(())
}

/// Load the compiled cache if it was built from exactly `expected`.
///
/// Every failure is a cache miss, never an error.
pub fn load_cached(dir: &Path, expected: &Fingerprint) -> Option<RuleSet> {
    let sidecar = fs::read_to_string(dir.join(CHECKSUM_FILE)).ok()?;
    if sidecar.trim() != expected.as_str() {
        log::debug!("Compiled rule cache is stale");
        return None;
    }

    let bytes = fs::read(dir.join(COMPILED_FILE)).ok()?;
    let artifact: CompiledArtifact = match serde_json::from_slice(&bytes) {
        Ok(artifact) => artifact,
        Err(e) => {
            log::warn!("Ignoring unreadable compiled rule cache: {}", e);
            return None;
        }
    };
    if artifact.format_version != ARTIFACT_VERSION || artifact.fingerprint != *expected {
        log::debug!("Compiled rule cache does not match its checksum");
        return None;
    }

    match YaraEngine::from_compiled(artifact.rules) {
        Ok(engine) => Some(RuleSet {
            sources: artifact.sources,
            fingerprint: artifact.fingerprint,
            engine,
            compiled_at: artifact.compiled_at,
        }),
        Err(e) => {
            log::warn!("Ignoring compiled rule cache: {}", e);
            None
        }
    }
}

/// Remove both cache files. Missing files are fine.
pub fn invalidate_cache(dir: &Path) {
    for name in [CHECKSUM_FILE, COMPILED_FILE] {
        let path = dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

#[derive(Default)]
struct StoreState {
    active: Option<Arc<RuleSet>>,
    /// Fingerprint of the last load or compile attempt, successful or not
    fingerprint: Option<Fingerprint>,
}

/// Owner of the active rule set.
///
/// Readers take an `Arc` snapshot with [`RuleStore::active`]; a reload swaps
/// the whole set in one write, and matches still running against the old set
/// keep it alive until they finish.
pub struct RuleStore {
    rules_dir: PathBuf,
    state: RwLock<StoreState>,
    reload_lock: Mutex<()>,
    compilations: AtomicU64,
}

impl RuleStore {
    /// Create a store with no active rules.
    pub fn new(rules_dir: impl Into<PathBuf>) -> Self {
        Self {
            rules_dir: rules_dir.into(),
            state: RwLock::new(StoreState::default()),
            reload_lock: Mutex::new(()),
            compilations: AtomicU64::new(0),
        }
    }

    /// Create a store and perform the startup load.
    ///
    /// A compile failure is logged and leaves the store without rules; only
    /// an unusable rules directory is an error.
    pub fn open(rules_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(rules_dir);
        fs::create_dir_all(&store.rules_dir).map_err(|e| Error::DirectoryAccess {
            path: store.rules_dir.clone(),
            source: e,
        })?;

        match store.load() {
            Ok(()) => {}
            Err(e @ Error::RuleCompile { .. }) => {
                log::error!("Rules unavailable, scanning will find nothing: {}", e);
            }
            Err(e) => return Err(e),
        }
        Ok(store)
    }

    pub fn rules_dir(&self) -> &Path {
        &self.rules_dir
    }

    /// Startup load: use the compiled cache when valid, otherwise compile.
    pub fn load(&self) -> Result<()> {
        let _guard = self
            .reload_lock
            .lock()
            .map_err(|_| Error::lock_poisoned("rule reload"))?;
        let current = fingerprint(&self.rules_dir)?;
        self.rebuild(current, true)
    }

    /// Recompile when the sources changed since the last attempt.
    ///
    /// Returns whether a reload happened. Unchanged sources that failed to
    /// compile last time are not recompiled.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let _guard = self
            .reload_lock
            .lock()
            .map_err(|_| Error::lock_poisoned("rule reload"))?;
        let current = fingerprint(&self.rules_dir)?;

        if self.read_state()?.fingerprint.as_ref() == Some(&current) {
            log::debug!("Rule sources unchanged ({})", current);
            return Ok(false);
        }

        log::info!("Rule sources changed ({}), reloading", current);
        self.rebuild(current, false)?;
        Ok(true)
    }

    fn rebuild(&self, current: Fingerprint, try_cache: bool) -> Result<()> {
        if current.is_none() {
            log::warn!("No rule sources in {}", self.rules_dir.display());
            invalidate_cache(&self.rules_dir);
            return self.swap(None, current);
        }

        if try_cache {
            if let Some(set) = load_cached(&self.rules_dir, &current) {
                log::info!(
                    "Loaded {} rule(s) from compiled cache ({})",
                    set.rule_count(),
                    current
                );
                return self.swap(Some(Arc::new(set)), current);
            }
        }

        log::info!("Compiling rules in {}", self.rules_dir.display());
        self.compilations.fetch_add(1, Ordering::SeqCst);
        match RuleSet::compile(&self.rules_dir) {
            Ok(set) => {
                log::info!(
                    "Compiled {} rule(s) from {} source(s) ({})",
                    set.rule_count(),
                    set.sources.len(),
                    set.fingerprint
                );
                if let Err(e) = persist(&self.rules_dir, &set) {
                    log::warn!("Failed to cache compiled rules: {}", e);
                    invalidate_cache(&self.rules_dir);
                }
                let fingerprint = set.fingerprint.clone();
                self.swap(Some(Arc::new(set)), fingerprint)
            }
            Err(e) => {
                log::error!("Rule compilation failed: {}", e);
                invalidate_cache(&self.rules_dir);
                self.swap(None, current)?;
                Err(e)
            }
        }
    }

    fn swap(&self, active: Option<Arc<RuleSet>>, fingerprint: Fingerprint) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| Error::lock_poisoned("rule store state"))?;
        state.active = active;
        state.fingerprint = Some(fingerprint);
        Ok(())
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreState>> {
        self.state
            .read()
            .map_err(|_| Error::lock_poisoned("rule store state"))
    }

    /// Snapshot of the active rule set, if any.
    pub fn active(&self) -> Option<Arc<RuleSet>> {
        self.read_state().ok().and_then(|s| s.active.clone())
    }

    /// Fingerprint of the last load attempt.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.read_state().ok().and_then(|s| s.fingerprint.clone())
    }

    /// Number of compilations performed by this store.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::SeqCst)
    }

    /// Remove the compiled cache files.
    pub fn invalidate_cache(&self) {
        invalidate_cache(&self.rules_dir);
    }
}
