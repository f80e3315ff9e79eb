//! File operations used by the quarantine vault.
//!
//! Provides:
//! - Moving files with a copy fallback across filesystems
//! - Optional overwrite-before-delete for stored items

use rand::RngCore;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use crate::core::error::{Error, Result};

/// File operations with a configurable deletion policy.
#[derive(Debug, Clone)]
pub struct SecureOperations {
    /// Overwrite passes before unlinking; zero means a plain unlink
    overwrite_passes: u32,
}

impl Default for SecureOperations {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureOperations {
    /// Plain deletion without overwriting.
    pub fn new() -> Self {
        Self {
            overwrite_passes: 0,
        }
    }

    /// Overwrite files `passes` times before deleting them.
    pub fn with_passes(passes: u32) -> Self {
        Self {
            overwrite_passes: passes.max(1),
        }
    }

    pub fn overwrite_passes(&self) -> u32 {
        self.overwrite_passes
    }

    /// Delete `path`, overwriting it first when configured.
    ///
    /// Returns `false` if the file was already gone.
    pub fn delete(&self, path: &Path) -> Result<bool> {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::file_read(path, e)),
        };

        for _ in 0..self.overwrite_passes {
            overwrite_with_random(path, size)?;
        }

        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::file_delete(path, e)),
        }
    }
}

/// Overwrite a file with random data.
fn overwrite_with_random(path: &Path, size: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| Error::file_write(path, e))?;

    const CHUNK_SIZE: u64 = 8192;
    let mut rng = rand::thread_rng();
    let mut buffer = vec![0u8; CHUNK_SIZE.min(size) as usize];
    let mut remaining = size;

    file.seek(SeekFrom::Start(0))
        .map_err(|e| Error::file_write(path, e))?;

    while remaining > 0 {
        let write_size = remaining.min(CHUNK_SIZE) as usize;
        rng.fill_bytes(&mut buffer[..write_size]);
        file.write_all(&buffer[..write_size])
            .map_err(|e| Error::file_write(path, e))?;
        remaining -= write_size as u64;
    }

    file.sync_all().map_err(|e| Error::file_write(path, e))
}

/// Move `source` to `dest`, which must not exist.
///
/// Tries a rename first and falls back to copy, fsync and unlink when the two
/// paths live on different filesystems. A failed fallback leaves `source` in
/// place and removes any partial copy.
pub fn move_file(source: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        return Err(Error::file_write(
            dest,
            io::Error::new(io::ErrorKind::AlreadyExists, "destination exists"),
        ));
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::DirectoryAccess {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    match fs::rename(source, dest) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::file_read(source, e));
        }
        Err(e) => log::debug!(
            "Rename {} -> {} failed ({}), copying instead",
            source.display(),
            dest.display(),
            e
        ),
    }

    copy_then_unlink(source, dest, |path| fs::remove_file(path))
}

/// Copy `source` to `dest`, then unlink `source`. Exactly one of the two
/// paths exists afterwards: on any failure `dest` is removed again.
fn copy_then_unlink<F>(source: &Path, dest: &Path, unlink: F) -> Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    if let Err(e) = copy_synced(source, dest) {
        remove_copy(dest);
        return Err(e);
    }

    if let Err(e) = unlink(source) {
        log::warn!(
            "Cannot remove {} after copying it, discarding copy {}",
            source.display(),
            dest.display()
        );
        remove_copy(dest);
        return Err(Error::file_delete(source, e));
    }
    Ok(())
}

fn remove_copy(dest: &Path) {
    if let Err(e) = fs::remove_file(dest) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("Failed to remove copy {}: {}", dest.display(), e);
        }
    }
}

fn copy_synced(source: &Path, dest: &Path) -> Result<()> {
    let mut input = File::open(source).map_err(|e| Error::file_read(source, e))?;
    let mut output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .map_err(|e| Error::file_write(dest, e))?;

    let copied = io::copy(&mut input, &mut output).map_err(|e| Error::file_write(dest, e))?;
    output.sync_all().map_err(|e| Error::file_write(dest, e))?;

    let expected = input
        .metadata()
        .map_err(|e| Error::file_read(source, e))?
        .len();
    if copied != expected {
        return Err(Error::Internal(format!(
            "Copy of {} truncated: {} of {} bytes",
            source.display(),
            copied,
            expected
        )));
    }
    Ok(())
}
