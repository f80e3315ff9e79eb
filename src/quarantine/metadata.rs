//! Quarantine record database using SQLite.
//!
//! One row per contained file. Rows are never removed: restore and delete
//! stamp `restored_at` or `deleted_at`, after which the record is terminal.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::error::{Error, Result};
use crate::core::types::MatchRecord;

/// Write-ahead state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Inserted, file move not yet confirmed
    Pending,
    /// File is in storage
    Active,
    /// File move failed or never happened
    Aborted,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Active => "active",
            RecordState::Aborted => "aborted",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecordState::Pending),
            "active" => Some(RecordState::Active),
            "aborted" => Some(RecordState::Aborted),
            _ => None,
        }
    }
}

/// Terminal transition applied by restore or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    Restored,
    Deleted,
}

impl Finalization {
    fn column(&self) -> &'static str {
        match self {
            Finalization::Restored => "restored_at",
            Finalization::Deleted => "deleted_at",
        }
    }
}

/// A persisted quarantine entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub id: i64,
    pub original_path: PathBuf,
    /// Location in storage; unique for the lifetime of the store
    pub quarantine_path: PathBuf,
    /// SHA-256 of the contained file
    pub file_hash: String,
    pub quarantined_at: DateTime<Utc>,
    /// First rule that matched the file
    pub rule_name: String,
    /// JSON list of the file's match records
    pub match_details: String,
    pub restored_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub state: RecordState,
}

impl QuarantineRecord {
    /// Restored or deleted; no further transitions.
    pub fn is_terminal(&self) -> bool {
        self.restored_at.is_some() || self.deleted_at.is_some()
    }

    /// Human-readable lifecycle status.
    pub fn status(&self) -> &'static str {
        if self.restored_at.is_some() {
            "restored"
        } else if self.deleted_at.is_some() {
            "deleted"
        } else {
            self.state.as_str()
        }
    }

    /// Decode the stored match details.
    pub fn match_records(&self) -> Result<Vec<MatchRecord>> {
        Ok(serde_json::from_str(&self.match_details)?)
    }
}

impl fmt::Display for QuarantineRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} ({}, {})",
            self.id,
            self.original_path.display(),
            self.rule_name,
            self.status()
        )
    }
}

/// Fields of a new pending record.
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    pub original_path: &'a Path,
    pub quarantine_path: &'a Path,
    pub file_hash: &'a str,
    pub quarantined_at: DateTime<Utc>,
    pub rule_name: &'a str,
    pub match_details: &'a str,
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_time(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_time(idx, v)).transpose()
}

const COLUMNS: &str = "id, original_path, quarantine_path, file_hash, quarantined_at, rule_name,
                       match_details, restored_at, deleted_at, state";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<QuarantineRecord> {
    let state: String = row.get(9)?;
    Ok(QuarantineRecord {
        id: row.get(0)?,
        original_path: PathBuf::from(row.get::<_, String>(1)?),
        quarantine_path: PathBuf::from(row.get::<_, String>(2)?),
        file_hash: row.get(3)?,
        quarantined_at: parse_time(4, row.get(4)?)?,
        rule_name: row.get(5)?,
        match_details: row.get(6)?,
        restored_at: parse_optional_time(7, row.get(7)?)?,
        deleted_at: parse_optional_time(8, row.get(8)?)?,
        state: RecordState::parse(&state).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                rusqlite::types::Type::Text,
                format!("unknown record state '{}'", state).into(),
            )
        })?,
    })
}

/// Whether `err` is a UNIQUE or other constraint violation.
pub fn is_constraint_violation(err: &Error) -> bool {
    matches!(
        err,
        Error::DatabaseSql(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Quarantine record database manager.
pub struct QuarantineMetadata {
    conn: Connection,
}

impl QuarantineMetadata {
    /// Create or open the record database.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::DirectoryAccess {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(db_path)?;
        let metadata = Self { conn };
        metadata.initialize()?;
        Ok(metadata)
    }

    /// Create an in-memory database (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let metadata = Self { conn };
        metadata.initialize()?;
        Ok(metadata)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA synchronous = FULL;
             CREATE TABLE IF NOT EXISTS quarantine_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_path TEXT NOT NULL,
                quarantine_path TEXT NOT NULL UNIQUE,
                file_hash TEXT NOT NULL,
                quarantined_at TEXT NOT NULL,
                rule_name TEXT NOT NULL,
                match_details TEXT NOT NULL,
                restored_at TEXT,
                deleted_at TEXT,
                state TEXT NOT NULL DEFAULT 'pending'
             );
             CREATE INDEX IF NOT EXISTS idx_quarantine_time ON quarantine_files(quarantined_at);
             CREATE INDEX IF NOT EXISTS idx_quarantine_state ON quarantine_files(state);",
        )?;
        Ok(())
    }

    /// Insert a pending record and return its id.
    pub fn insert_pending(&self, record: &NewRecord<'_>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO quarantine_files
             (original_path, quarantine_path, file_hash, quarantined_at, rule_name, match_details, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
            params![
                record.original_path.to_string_lossy(),
                record.quarantine_path.to_string_lossy(),
                record.file_hash,
                format_time(&record.quarantined_at),
                record.rule_name,
                record.match_details,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Move a record out of `pending`.
    pub fn set_state(&self, id: i64, state: RecordState) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE quarantine_files SET state = ?1 WHERE id = ?2",
            params![state.as_str(), id],
        )?;
        Ok(rows > 0)
    }

    /// Stamp a terminal timestamp. Returns `false` if the record was already
    /// terminal or not active.
    pub fn finalize(&self, id: i64, how: Finalization, at: DateTime<Utc>) -> Result<bool> {
        let sql = format!(
            "UPDATE quarantine_files SET {} = ?1
             WHERE id = ?2 AND state = 'active' AND restored_at IS NULL AND deleted_at IS NULL",
            how.column()
        );
        let rows = self.conn.execute(&sql, params![format_time(&at), id])?;
        Ok(rows > 0)
    }

    /// Get a record by id, whatever its state.
    pub fn get(&self, id: i64) -> Result<Option<QuarantineRecord>> {
        let sql = format!("SELECT {} FROM quarantine_files WHERE id = ?1", COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [id], row_to_record)
            .optional()?)
    }

    /// Active, non-terminal records in quarantine order.
    pub fn list_active(&self) -> Result<Vec<QuarantineRecord>> {
        self.query_list(
            "state = 'active' AND restored_at IS NULL AND deleted_at IS NULL
             ORDER BY quarantined_at ASC, id ASC",
        )
    }

    /// Records left pending by an interrupted quarantine.
    pub fn list_pending(&self) -> Result<Vec<QuarantineRecord>> {
        self.query_list("state = 'pending' ORDER BY id ASC")
    }

    /// Every record, newest first.
    pub fn list_all(&self) -> Result<Vec<QuarantineRecord>> {
        self.query_list("1 = 1 ORDER BY quarantined_at DESC, id DESC")
    }

    fn query_list(&self, clause: &str) -> Result<Vec<QuarantineRecord>> {
        let sql = format!("SELECT {} FROM quarantine_files WHERE {}", COLUMNS, clause);
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Number of active records.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM quarantine_files
             WHERE state = 'active' AND restored_at IS NULL AND deleted_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(metadata: &QuarantineMetadata, name: &str) -> i64 {
        let storage = PathBuf::from(format!("/vault/items/{}", name));
        metadata
            .insert_pending(&NewRecord {
                original_path: Path::new("/home/user/malware.exe"),
                quarantine_path: &storage,
                file_hash: &"a".repeat(64),
                quarantined_at: Utc::now(),
                rule_name: "Trojan_Generic",
                match_details: "[]",
            })
            .unwrap()
    }

    #[test]
    fn test_open_in_memory() {
        let metadata = QuarantineMetadata::in_memory().unwrap();
        assert_eq!(metadata.count().unwrap(), 0);
    }

    #[test]
    fn test_pending_is_not_listed() {
        let metadata = QuarantineMetadata::in_memory().unwrap();
        let id = insert(&metadata, "a");

        assert!(metadata.list_active().unwrap().is_empty());
        assert_eq!(metadata.list_pending().unwrap().len(), 1);

        metadata.set_state(id, RecordState::Active).unwrap();
        let active = metadata.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_name, "Trojan_Generic");
        assert_eq!(active[0].status(), "active");
        assert!(metadata.list_pending().unwrap().is_empty());
    }

    #[test]
    fn test_quarantine_path_unique() {
        let metadata = QuarantineMetadata::in_memory().unwrap();
        insert(&metadata, "same");

        let err = metadata
            .insert_pending(&NewRecord {
                original_path: Path::new("/x"),
                quarantine_path: Path::new("/vault/items/same"),
                file_hash: "b",
                quarantined_at: Utc::now(),
                rule_name: "r",
                match_details: "[]",
            })
            .unwrap_err();
        assert!(is_constraint_violation(&err));
    }

    #[test]
    fn test_finalize_once() {
        let metadata = QuarantineMetadata::in_memory().unwrap();
        let id = insert(&metadata, "a");

        // pending records cannot be finalized
        assert!(!metadata.finalize(id, Finalization::Deleted, Utc::now()).unwrap());

        metadata.set_state(id, RecordState::Active).unwrap();
        assert!(metadata.finalize(id, Finalization::Deleted, Utc::now()).unwrap());
        assert!(!metadata.finalize(id, Finalization::Deleted, Utc::now()).unwrap());
        assert!(!metadata.finalize(id, Finalization::Restored, Utc::now()).unwrap());

        let record = metadata.get(id).unwrap().unwrap();
        assert!(record.is_terminal());
        assert!(record.restored_at.is_none());
        assert_eq!(record.status(), "deleted");
        assert_eq!(metadata.count().unwrap(), 0);
    }

    #[test]
    fn test_ids_not_reused() {
        let metadata = QuarantineMetadata::in_memory().unwrap();
        let first = insert(&metadata, "a");
        metadata
            .conn
            .execute("DELETE FROM quarantine_files WHERE id = ?1", [first])
            .unwrap();
        let second = insert(&metadata, "b");
        assert!(second > first);
    }

    #[test]
    fn test_list_order() {
        let metadata = QuarantineMetadata::in_memory().unwrap();
        let ids: Vec<i64> = ["a", "b", "c"].iter().map(|n| insert(&metadata, n)).collect();
        for id in &ids {
            metadata.set_state(*id, RecordState::Active).unwrap();
        }

        let listed: Vec<i64> = metadata.list_active().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(listed, ids);
        assert_eq!(metadata.list_all().unwrap()[0].id, ids[2]);
    }

    #[test]
    fn test_get_nonexistent() {
        let metadata = QuarantineMetadata::in_memory().unwrap();
        assert!(metadata.get(42).unwrap().is_none());
    }
}
