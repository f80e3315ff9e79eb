//! Quarantine vault manager.
//!
//! The vault combines the record database with file relocation:
//! - a pending record is written before the file moves (write-ahead)
//! - restore and delete are serialised on the database connection
//! - pending records left by a crash are resolved on open

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::metadata::{
    is_constraint_violation, Finalization, NewRecord, QuarantineMetadata, QuarantineRecord,
    RecordState,
};
use super::operations::{move_file, SecureOperations};
use crate::core::config::QuarantineConfig;
use crate::core::error::{Error, Result};
use crate::core::types::MatchRecord;
use crate::utils::hash::HashCalculator;

/// Subdirectory holding contained files.
pub const ITEMS_DIR: &str = "items";

/// Record database file name.
pub const DB_FILE: &str = "quarantine.db";

const MAX_NAME_ATTEMPTS: u32 = 16;

/// What to store alongside a contained file.
#[derive(Debug, Clone)]
pub struct ContainmentRequest {
    /// Rule reported as responsible
    pub rule_name: String,
    /// Every match record of the file
    pub match_details: Vec<MatchRecord>,
}

impl ContainmentRequest {
    pub fn new(rule_name: impl Into<String>, match_details: Vec<MatchRecord>) -> Self {
        Self {
            rule_name: rule_name.into(),
            match_details,
        }
    }

    /// Build a request naming the first rule of `records`.
    pub fn from_matches(records: &[MatchRecord]) -> Option<Self> {
        records
            .first()
            .map(|first| Self::new(first.rule_name.clone(), records.to_vec()))
    }
}

/// Storage name: original file name plus a nanosecond timestamp.
fn storage_name(path: &Path, at: &DateTime<Utc>) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    format!("{}_{}", name, at.format("%Y%m%d%H%M%S%9f"))
}

/// Quarantine vault manager.
pub struct QuarantineVault {
    base_path: PathBuf,
    items_path: PathBuf,
    /// Single writer for every record transition
    metadata: Mutex<QuarantineMetadata>,
    operations: SecureOperations,
}

impl QuarantineVault {
    /// Open or create a vault with plain deletion.
    pub fn open(base_path: &Path) -> Result<Self> {
        Self::open_with(base_path, SecureOperations::new())
    }

    /// Open the vault described by `config`.
    pub fn from_config(config: &QuarantineConfig) -> Result<Self> {
        let operations = if config.secure_delete {
            SecureOperations::with_passes(config.overwrite_passes)
        } else {
            SecureOperations::new()
        };
        Self::open_with(&config.quarantine_dir(), operations)
    }

    pub fn open_with(base_path: &Path, operations: SecureOperations) -> Result<Self> {
        let items_path = base_path.join(ITEMS_DIR);
        fs::create_dir_all(&items_path).map_err(|e| Error::DirectoryAccess {
            path: items_path.clone(),
            source: e,
        })?;

        let metadata = QuarantineMetadata::open(&base_path.join(DB_FILE))?;

        let vault = Self {
            base_path: base_path.to_path_buf(),
            items_path,
            metadata: Mutex::new(metadata),
            operations,
        };

        let recovered = vault.recover_pending()?;
        if recovered > 0 {
            log::info!("Resolved {} interrupted quarantine record(s)", recovered);
        }
        Ok(vault)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn items_path(&self) -> &Path {
        &self.items_path
    }

    fn db(&self) -> Result<MutexGuard<'_, QuarantineMetadata>> {
        self.metadata
            .lock()
            .map_err(|_| Error::lock_poisoned("quarantine database"))
    }

    /// Contain `path` and return the new record id.
    pub fn quarantine(&self, path: &Path, request: &ContainmentRequest) -> Result<i64> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(Error::PathNotFound(path.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::PathNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(Error::file_read(path, e)),
        }

        let file_hash = HashCalculator::sha256_file(path)?;
        let match_details = serde_json::to_string(&request.match_details)?;

        let db = self.db()?;
        let (id, storage) = self.insert_pending(&db, path, &file_hash, request, &match_details)?;

        if let Err(e) = move_file(path, &storage) {
            if let Err(db_err) = db.set_state(id, RecordState::Aborted) {
                log::error!("Failed to abort quarantine record {}: {}", id, db_err);
            }
            log::error!("Failed to quarantine {}: {}", path.display(), e);
            return Err(Error::QuarantineFailed {
                path: path.to_path_buf(),
                source: Box::new(e),
            });
        }

        if let Err(e) = db.set_state(id, RecordState::Active) {
            // the row stays pending; recover_pending completes it on next open
            log::error!(
                "Quarantined {} but could not activate record #{}: {}",
                path.display(),
                id,
                e
            );
            return Err(e);
        }
        log::info!(
            "Quarantined {} as #{} ({})",
            path.display(),
            id,
            request.rule_name
        );
        Ok(id)
    }

    fn insert_pending(
        &self,
        db: &QuarantineMetadata,
        path: &Path,
        file_hash: &str,
        request: &ContainmentRequest,
        match_details: &str,
    ) -> Result<(i64, PathBuf)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = Utc::now();
            let storage = self.items_path.join(storage_name(path, &now));
            if storage.exists() && attempt < MAX_NAME_ATTEMPTS {
                continue;
            }

            let record = NewRecord {
                original_path: path,
                quarantine_path: &storage,
                file_hash,
                quarantined_at: now,
                rule_name: &request.rule_name,
                match_details,
            };
            match db.insert_pending(&record) {
                Ok(id) => return Ok((id, storage)),
                Err(e) if is_constraint_violation(&e) && attempt < MAX_NAME_ATTEMPTS => {
                    log::debug!("Storage name {} taken, retrying", storage.display());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve records left `pending` by an interrupted quarantine.
    ///
    /// A stored file whose original is gone means the move completed; any
    /// other combination is rolled back.
    pub fn recover_pending(&self) -> Result<usize> {
        let db = self.db()?;
        let pending = db.list_pending()?;

        for record in &pending {
            let stored = record.quarantine_path.exists();
            let original = record.original_path.exists();

            if stored && !original {
                log::info!("Completing interrupted quarantine #{}", record.id);
                db.set_state(record.id, RecordState::Active)?;
                continue;
            }

            if stored {
                if let Err(e) = fs::remove_file(&record.quarantine_path) {
                    log::warn!(
                        "Failed to remove partial copy {}: {}",
                        record.quarantine_path.display(),
                        e
                    );
                }
            }
            log::warn!("Rolling back interrupted quarantine #{}", record.id);
            db.set_state(record.id, RecordState::Aborted)?;
        }

        Ok(pending.len())
    }

    fn load_open_record(db: &QuarantineMetadata, id: i64) -> Result<QuarantineRecord> {
        let record = db.get(id)?.ok_or(Error::QuarantineItemNotFound(id))?;
        if record.is_terminal() || record.state != RecordState::Active {
            return Err(Error::RecordFinalized {
                id,
                state: record.status().to_string(),
            });
        }
        Ok(record)
    }

    fn finalize(
        db: &QuarantineMetadata,
        record: &QuarantineRecord,
        how: Finalization,
    ) -> Result<QuarantineRecord> {
        if !db.finalize(record.id, how, Utc::now())? {
            return Err(Error::RecordFinalized {
                id: record.id,
                state: record.status().to_string(),
            });
        }
        db.get(record.id)?
            .ok_or(Error::QuarantineItemNotFound(record.id))
    }

    /// Move a contained file back to its original path.
    pub fn restore(&self, id: i64) -> Result<QuarantineRecord> {
        let db = self.db()?;
        let record = Self::load_open_record(&db, id)?;

        if !record.quarantine_path.exists() {
            return Err(Error::QuarantineFileMissing {
                id,
                path: record.quarantine_path.clone(),
            });
        }
        if record.original_path.exists() {
            return Err(Error::RestoreTargetExists {
                id,
                path: record.original_path.clone(),
            });
        }

        let restored = move_then_commit(&record.quarantine_path, &record.original_path, || {
            Self::finalize(&db, &record, Finalization::Restored)
        })?;
        log::info!("Restored #{} to {}", id, record.original_path.display());
        Ok(restored)
    }

    /// Delete a contained file and finalize its record.
    ///
    /// A stored file that is already gone is logged and the record is
    /// finalized anyway.
    pub fn delete(&self, id: i64) -> Result<QuarantineRecord> {
        let db = self.db()?;
        let record = Self::load_open_record(&db, id)?;

        if !self.operations.delete(&record.quarantine_path)? {
            log::warn!(
                "Stored file for #{} was already missing: {}",
                id,
                record.quarantine_path.display()
            );
        }

        let deleted = Self::finalize(&db, &record, Finalization::Deleted)?;
        log::info!("Deleted quarantined #{} ({})", id, record.original_path.display());
        Ok(deleted)
    }

    /// Active records in quarantine order.
    pub fn list(&self) -> Result<Vec<QuarantineRecord>> {
        self.db()?.list_active()
    }

    /// Every record including terminal ones, newest first.
    pub fn history(&self) -> Result<Vec<QuarantineRecord>> {
        self.db()?.list_all()
    }

    pub fn get(&self, id: i64) -> Result<Option<QuarantineRecord>> {
        self.db()?.get(id)
    }

    /// Number of active records.
    pub fn count(&self) -> Result<usize> {
        self.db()?.count()
    }
}

/// Move `source` to `dest` and run `commit`. When the commit fails the file
/// is moved back so storage and database keep agreeing.
fn move_then_commit<T, F>(source: &Path, dest: &Path, commit: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    move_file(source, dest)?;
    commit().map_err(|e| {
        log::error!(
            "Moved {} to {} but could not record it: {}",
            source.display(),
            dest.display(),
            e
        );
        if let Err(back) = move_file(dest, source) {
            log::error!(
                "Cannot move {} back to {}, file is out of sync with its record: {}",
                dest.display(),
                source.display(),
                back
            );
        }
        e
    })
}
