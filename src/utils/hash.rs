//! Hash calculation utilities.

use crate::core::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Buffer size for reading files (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Hash calculator for files and rule sources.
pub struct HashCalculator;

impl HashCalculator {
    /// Calculate SHA256 hash of a file.
    pub fn sha256_file(path: &Path) -> Result<String> {
        let file = File::open(path).map_err(|e| Error::file_read(path, e))?;
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; BUFFER_SIZE];

        loop {
            let bytes_read = reader
                .read(&mut buffer)
                .map_err(|e| Error::file_read(path, e))?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Calculate SHA256 hash of bytes.
    pub fn sha256_bytes(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Verify a file matches an expected SHA256 hash.
    pub fn verify_sha256(path: &Path, expected: &str) -> Result<bool> {
        let actual = Self::sha256_file(path)?;
        Ok(actual.eq_ignore_ascii_case(expected))
    }
}

/// Incremental digest over a sequence of named entries.
///
/// Each entry contributes `name \0 content-hash \n`, so renaming a file
/// changes the digest even when its bytes do not.
pub struct ManifestDigest {
    hasher: Sha256,
    entries: usize,
}

impl ManifestDigest {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            entries: 0,
        }
    }

    pub fn add(&mut self, name: &str, content_hash: &str) {
        self.hasher.update(name.as_bytes());
        self.hasher.update([0u8]);
        self.hasher.update(content_hash.as_bytes());
        self.hasher.update(b"\n");
        self.entries += 1;
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for ManifestDigest {
    fn default() -> Self {
        Self::new()
    }
}
