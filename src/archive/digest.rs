//! Content digest over archive payload entries.
//!
//! The digest is SHA-256 over the archive's entries sorted lexicographically
//! by path, feeding each entry's path bytes and then its uncompressed content
//! into one running hasher. Sorting makes the digest independent of writer
//! ordering and compression parameters; the signature entry is excluded so an
//! archive hashes the same before and after signing.

use crate::archive::SIGNATURE_ENTRY;
use crate::error::{Result, VaultError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Lowercase hex SHA-256 of an archive's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    pub fn into_hex(self) -> String {
        self.0
    }
}

pub(super) fn unreadable(path: &Path, reason: impl std::fmt::Display) -> VaultError {
    VaultError::ArchiveUnreadable {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string()),
        reason: reason.to_string(),
    }
}

/// Computes the content digest of the archive at `path`.
///
/// Fails with [`VaultError::ArchiveUnreadable`] when the file cannot be
/// opened or is not a valid zip; a partially hashed result is never returned.
pub fn compute_digest(path: &Path) -> Result<ContentDigest> {
    let file = File::open(path).map_err(|e| unreadable(path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| unreadable(path, e))?;

    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| *n != SIGNATURE_ENTRY && !n.ends_with('/'))
        .map(str::to_string)
        .collect();
    names.sort_unstable();

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    for name in &names {
        let mut entry = archive.by_name(name).map_err(|e| unreadable(path, e))?;
        hasher.update(name.as_bytes());
        loop {
            let n = entry.read(&mut buf).map_err(|e| unreadable(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }

    Ok(ContentDigest(hex::encode(hasher.finalize())))
}
