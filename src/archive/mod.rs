//! Archive layout, naming and local listing.
//!
//! An archive is a zip whose top-level entries are fixed: the snapshotted
//! `database/`, `config/` and `uploads/` trees, an optional `.env` file, the
//! generated `backup-info.json` metadata entry and, once signing succeeded,
//! the `.signature` entry. The signing secret travels inside `config/` as
//! the fallback for cross-instance verification.

pub mod builder;
pub mod digest;
pub mod signing;

use crate::error::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Signature entry inside the archive; excluded from the content digest.
pub const SIGNATURE_ENTRY: &str = ".signature";

/// Metadata entry describing the snapshot.
pub const METADATA_ENTRY: &str = "backup-info.json";

/// Top-level entry holding the store's on-disk files.
pub const DATABASE_ENTRY: &str = "database";

/// Top-level entry holding the config directory.
pub const CONFIG_ENTRY: &str = "config";

/// Top-level entry holding user-uploaded assets.
pub const UPLOADS_ENTRY: &str = "uploads";

/// Optional environment file entry.
pub const ENV_ENTRY: &str = ".env";

/// Where the creating instance's signing secret sits inside the archive.
pub const EMBEDDED_SECRET_ENTRY: &str = "config/.vault-key";

/// Current `backup-info.json` format version.
pub const FORMAT_VERSION: u32 = 1;

/// Manual archive prefixes are clamped to this many characters.
const MAX_PREFIX_LEN: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupCategory {
    /// Debounce-triggered snapshot after a burst of mutations.
    Incremental,
    /// Calendar-triggered daily snapshot.
    Daily,
    /// User-initiated snapshot, optionally with a custom name prefix.
    Manual,
}

impl BackupCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupCategory::Incremental => "incremental",
            BackupCategory::Daily => "daily",
            BackupCategory::Manual => "manual",
        }
    }

    /// Classifies an archive file name. Anything that is not prefixed with a
    /// trigger category counts as manual (manual archives may carry a
    /// user-supplied prefix).
    pub fn of_archive(name: &str) -> BackupCategory {
        if name.starts_with("incremental-") {
            BackupCategory::Incremental
        } else if name.starts_with("daily-") {
            BackupCategory::Daily
        } else {
            BackupCategory::Manual
        }
    }

    pub fn matches(&self, archive_name: &str) -> bool {
        BackupCategory::of_archive(archive_name) == *self
    }
}

/// Metadata entry payload (`backup-info.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub timestamp: DateTime<Utc>,
    pub category: BackupCategory,
    pub version: u32,
    #[serde(default)]
    pub description: String,
}

/// One archive as seen by listing, retention and the facade operations.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveInfo {
    pub name: String,
    pub category: BackupCategory,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub signed: bool,
    pub local_path: Option<PathBuf>,
    pub remote_path: Option<String>,
}

/// Strips everything outside `[A-Za-z0-9_-]` and the CJK ranges, clamping to
/// a filesystem-safe length. Falls back to the literal category when nothing
/// survives.
pub fn sanitize_prefix(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric()
                || *c == '_'
                || *c == '-'
                || matches!(*c,
                    '\u{4E00}'..='\u{9FFF}'     // CJK unified ideographs
                    | '\u{3040}'..='\u{30FF}'   // hiragana + katakana
                    | '\u{AC00}'..='\u{D7AF}')  // hangul syllables
        })
        .take(MAX_PREFIX_LEN)
        .collect();

    if cleaned.is_empty() {
        BackupCategory::Manual.as_str().to_string()
    } else {
        cleaned
    }
}

/// ISO-8601 UTC with colons stripped, safe in file names.
pub fn timestamp_slug(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%SZ").to_string()
}

pub fn archive_file_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}.zip", prefix, timestamp_slug(at))
}

/// Recovers the creation time baked into an archive name. Works on every
/// name this crate generates; remote listings rely on it because WebDAV
/// Depth-1 listings carry no usable timestamps.
pub fn timestamp_from_name(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(".zip")?;
    let slug = stem.get(stem.len().checked_sub(20)?..)?;
    chrono::NaiveDateTime::parse_from_str(slug, "%Y-%m-%dT%H-%M-%SZ")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Detached signature file written next to the archive on local disk only.
pub fn sidecar_name(archive_name: &str) -> String {
    match archive_name.strip_suffix(".zip") {
        Some(stem) => format!("{}.sig", stem),
        None => format!("{}.sig", archive_name),
    }
}

/// Rejects names that could escape the backups directory.
pub fn validate_archive_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || !name.ends_with(".zip")
    {
        return Err(VaultError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// True when the archive carries a signature, checking the cheap sidecar
/// first and probing the zip only when it is absent.
pub fn is_signed(archive_path: &Path) -> bool {
    let sidecar = archive_path.with_file_name(sidecar_name(
        &archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    ));
    if sidecar.is_file() {
        return true;
    }

    let Ok(file) = File::open(archive_path) else {
        return false;
    };
    match zip::ZipArchive::new(file) {
        Ok(archive) => archive.file_names().any(|n| n == SIGNATURE_ENTRY),
        Err(_) => false,
    }
}

/// Lists local archives, newest first.
pub fn list_local(backups_dir: &Path) -> Result<Vec<ArchiveInfo>> {
    if !backups_dir.exists() {
        return Ok(Vec::new());
    }

    let mut archives = Vec::new();
    for entry in std::fs::read_dir(backups_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map(|e| e == "zip").unwrap_or(false) {
            let name = entry.file_name().to_string_lossy().to_string();
            // An eviction running concurrently can delete the file between
            // the directory scan and the stat.
            let meta = match std::fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let created_at = meta
                .modified()
                .map(|t| {
                    let dt: DateTime<Utc> = t.into();
                    dt
                })
                .unwrap_or_else(|_| Utc::now());

            archives.push(ArchiveInfo {
                category: BackupCategory::of_archive(&name),
                signed: is_signed(&path),
                size_bytes: meta.len(),
                created_at,
                local_path: Some(path),
                remote_path: None,
                name,
            });
        }
    }

    archives.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.name.cmp(&a.name)));
    Ok(archives)
}
