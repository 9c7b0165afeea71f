//! Snapshot assembly.
//!
//! A build writes `<name>.zip.part`, walks the snapshot sources into it,
//! appends the metadata entry and finalizes the stream. Only then is the
//! digest computed, the signature injected as an internal entry and the part
//! renamed into place, so a crash never leaves a half-written `.zip` that
//! listing or retention would pick up. Prior archives are never touched here.

use crate::archive::digest::{compute_digest, ContentDigest};
use crate::archive::signing;
use crate::archive::{
    archive_file_name, sanitize_prefix, sidecar_name, ArchiveInfo, ArchiveMetadata,
    BackupCategory, CONFIG_ENTRY, DATABASE_ENTRY, ENV_ENTRY, FORMAT_VERSION, METADATA_ENTRY,
    SIGNATURE_ENTRY, UPLOADS_ENTRY,
};
use crate::config::VaultPaths;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// What to snapshot and how to label it.
#[derive(Debug)]
pub struct BuildRequest<'a> {
    pub category: BackupCategory,
    /// Custom name prefix for manual archives; ignored for triggered ones.
    pub prefix: Option<&'a str>,
    pub description: String,
    /// Signing secret. `None` produces an unsigned archive.
    pub secret: Option<&'a str>,
}

/// A finished archive on local disk.
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub name: String,
    pub path: PathBuf,
    pub category: BackupCategory,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub signed: bool,
    pub digest: ContentDigest,
}

impl BuiltArchive {
    pub fn info(&self) -> ArchiveInfo {
        ArchiveInfo {
            name: self.name.clone(),
            category: self.category,
            size_bytes: self.size_bytes,
            created_at: self.created_at,
            signed: self.signed,
            local_path: Some(self.path.clone()),
            remote_path: None,
        }
    }
}

/// Builds snapshot archives from the instance's live directories. All
/// methods block on file I/O; callers run them on a blocking task.
pub struct ArchiveBuilder {
    paths: VaultPaths,
}

impl ArchiveBuilder {
    pub fn new(paths: VaultPaths) -> Self {
        Self { paths }
    }

    pub fn build(&self, request: &BuildRequest<'_>) -> Result<BuiltArchive> {
        std::fs::create_dir_all(&self.paths.backups_dir)?;

        let created_at = Utc::now();
        let prefix = match request.category {
            BackupCategory::Manual => sanitize_prefix(request.prefix.unwrap_or("")),
            triggered => triggered.as_str().to_string(),
        };
        let name = archive_file_name(&prefix, created_at);
        let final_path = self.paths.backups_dir.join(&name);
        let part_path = self.paths.backups_dir.join(format!("{}.part", name));

        match self.assemble(&part_path, &final_path, request, created_at) {
            Ok((signed, digest)) => {
                let size_bytes = std::fs::metadata(&final_path)?.len();
                info!(
                    archive = %name,
                    category = request.category.as_str(),
                    size_bytes,
                    signed,
                    "backup archive created"
                );
                Ok(BuiltArchive {
                    name,
                    path: final_path,
                    category: request.category,
                    size_bytes,
                    created_at,
                    signed,
                    digest,
                })
            }
            Err(e) => {
                if part_path.exists() {
                    if let Err(cleanup) = std::fs::remove_file(&part_path) {
                        warn!(part = %part_path.display(), error = %cleanup, "failed to remove partial archive");
                    }
                }
                Err(e)
            }
        }
    }

    fn assemble(
        &self,
        part_path: &Path,
        final_path: &Path,
        request: &BuildRequest<'_>,
        created_at: DateTime<Utc>,
    ) -> Result<(bool, ContentDigest)> {
        self.write_payload(part_path, request, created_at)?;

        let digest = compute_digest(part_path)?;
        let mut signature = None;
        if let Some(secret) = request.secret {
            let sig = signing::sign(&digest, secret);
            append_signature(part_path, &sig)?;
            signature = Some(sig);
        } else {
            debug!(archive = %final_path.display(), "no signing secret available, archive stays unsigned");
        }

        std::fs::rename(part_path, final_path)?;

        // The archive is durable at this point. The sidecar is a convenience
        // copy, so a failure to write it only warrants a warning.
        if let Some(sig) = &signature {
            let file_name = final_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let sidecar = final_path.with_file_name(sidecar_name(&file_name));
            if let Err(e) = std::fs::write(&sidecar, sig) {
                warn!(sidecar = %sidecar.display(), error = %e, "failed to write signature sidecar");
            }
        }

        Ok((signature.is_some(), digest))
    }

    fn write_payload(
        &self,
        part_path: &Path,
        request: &BuildRequest<'_>,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let file = File::create(part_path)?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        add_dir_tree(&mut writer, &self.paths.database_dir, DATABASE_ENTRY, options)?;
        add_dir_tree(&mut writer, &self.paths.config_dir, CONFIG_ENTRY, options)?;
        add_dir_tree(&mut writer, &self.paths.uploads_dir, UPLOADS_ENTRY, options)?;

        if self.paths.env_file.is_file() {
            writer.start_file(ENV_ENTRY, options)?;
            let mut env = File::open(&self.paths.env_file)?;
            std::io::copy(&mut env, &mut writer)?;
        }

        let metadata = ArchiveMetadata {
            timestamp: created_at,
            category: request.category,
            version: FORMAT_VERSION,
            description: request.description.clone(),
        };
        writer.start_file(METADATA_ENTRY, options)?;
        writer.write_all(&serde_json::to_vec_pretty(&metadata)?)?;

        writer.finish()?;
        Ok(())
    }
}

fn add_dir_tree(
    writer: &mut ZipWriter<File>,
    root: &Path,
    entry_prefix: &str,
    options: SimpleFileOptions,
) -> Result<()> {
    if !root.is_dir() {
        debug!(dir = %root.display(), "snapshot source missing, skipping");
        return Ok(());
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(std::io::Error::other)?;
        let entry_name = format!("{}/{}", entry_prefix, rel.to_string_lossy().replace('\\', "/"));

        writer.start_file(entry_name, options)?;
        let mut source = File::open(entry.path())?;
        std::io::copy(&mut source, writer)?;
    }
    Ok(())
}

/// Re-opens a finalized zip and injects the signature entry.
fn append_signature(path: &Path, signature_hex: &str) -> Result<()> {
    let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let mut writer = ZipWriter::new_append(file)?;
    writer.start_file(SIGNATURE_ENTRY, SimpleFileOptions::default())?;
    writer.write_all(signature_hex.as_bytes())?;
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::signing::{verify_archive, Verification};
    use crate::archive::EMBEDDED_SECRET_ENTRY;
    use std::collections::HashSet;

    fn seeded_paths(base: &Path) -> VaultPaths {
        let paths = VaultPaths::rooted(base);
        std::fs::create_dir_all(&paths.database_dir).unwrap();
        std::fs::create_dir_all(paths.config_dir.join("icons")).unwrap();
        std::fs::create_dir_all(&paths.uploads_dir).unwrap();
        std::fs::write(paths.database_dir.join("navboard.db"), b"sqlite bytes").unwrap();
        std::fs::write(paths.config_dir.join("settings.json"), b"{}").unwrap();
        std::fs::write(paths.config_dir.join(".vault-key"), b"abc123").unwrap();
        std::fs::write(paths.config_dir.join("icons/home.svg"), b"<svg/>").unwrap();
        std::fs::write(paths.uploads_dir.join("wallpaper.png"), b"png").unwrap();
        std::fs::write(&paths.env_file, b"TZ=UTC\n").unwrap();
        paths
    }

    fn entry_names(path: &Path) -> HashSet<String> {
        let file = File::open(path).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    #[test]
    fn snapshot_contains_all_canonical_entries() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(seeded_paths(dir.path()));

        let built = builder
            .build(&BuildRequest {
                category: BackupCategory::Incremental,
                prefix: None,
                description: String::new(),
                secret: Some("abc123"),
            })
            .unwrap();

        assert!(built.name.starts_with("incremental-"));
        assert!(built.signed);
        assert!(built.size_bytes > 0);

        let names = entry_names(&built.path);
        for expected in [
            "database/navboard.db",
            "config/settings.json",
            "config/icons/home.svg",
            EMBEDDED_SECRET_ENTRY,
            "uploads/wallpaper.png",
            ENV_ENTRY,
            METADATA_ENTRY,
            SIGNATURE_ENTRY,
        ] {
            assert!(names.contains(expected), "missing entry {expected}");
        }

        let sidecar = built.path.with_file_name(sidecar_name(&built.name));
        assert!(sidecar.is_file());
    }

    #[test]
    fn built_archive_verifies_as_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(seeded_paths(dir.path()));
        let built = builder
            .build(&BuildRequest {
                category: BackupCategory::Daily,
                prefix: None,
                description: "nightly".into(),
                secret: Some("abc123"),
            })
            .unwrap();

        assert_eq!(
            verify_archive(&built.path, "abc123").unwrap(),
            Verification::Trusted
        );
    }

    #[test]
    fn metadata_entry_records_category_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(seeded_paths(dir.path()));
        let built = builder
            .build(&BuildRequest {
                category: BackupCategory::Manual,
                prefix: Some("before-migration"),
                description: "pre-upgrade safety copy".into(),
                secret: Some("abc123"),
            })
            .unwrap();

        let file = File::open(&built.path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let entry = archive.by_name(METADATA_ENTRY).unwrap();
        let meta: ArchiveMetadata = serde_json::from_reader(entry).unwrap();

        assert_eq!(meta.category, BackupCategory::Manual);
        assert_eq!(meta.version, FORMAT_VERSION);
        assert_eq!(meta.description, "pre-upgrade safety copy");
        assert!(built.name.starts_with("before-migration-"));
    }

    #[test]
    fn manual_prefix_is_sanitized_for_the_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(seeded_paths(dir.path()));
        let built = builder
            .build(&BuildRequest {
                category: BackupCategory::Manual,
                prefix: Some("my links / 书签!"),
                description: String::new(),
                secret: None,
            })
            .unwrap();

        assert!(built.name.starts_with("mylinks书签-"), "got {}", built.name);
        assert_eq!(built.category, BackupCategory::Manual);
    }

    #[test]
    fn missing_secret_produces_an_unsigned_archive() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(seeded_paths(dir.path()));
        let built = builder
            .build(&BuildRequest {
                category: BackupCategory::Incremental,
                prefix: None,
                description: String::new(),
                secret: None,
            })
            .unwrap();

        assert!(!built.signed);
        assert!(!entry_names(&built.path).contains(SIGNATURE_ENTRY));
        assert_eq!(
            verify_archive(&built.path, "abc123").unwrap(),
            Verification::Unsigned
        );
    }

    #[test]
    fn successful_build_leaves_no_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = seeded_paths(dir.path());
        let builder = ArchiveBuilder::new(paths.clone());
        builder
            .build(&BuildRequest {
                category: BackupCategory::Incremental,
                prefix: None,
                description: String::new(),
                secret: Some("abc123"),
            })
            .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(&paths.backups_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn failed_build_removes_the_partial_archive() {
        let dir = tempfile::tempdir().unwrap();
        let paths = seeded_paths(dir.path());
        // A dangling symlink makes the walk's File::open fail mid-build.
        std::os::unix::fs::symlink(
            dir.path().join("does-not-exist"),
            paths.uploads_dir.join("dangling"),
        )
        .unwrap();

        let builder = ArchiveBuilder::new(paths.clone());
        let result = builder.build(&BuildRequest {
            category: BackupCategory::Incremental,
            prefix: None,
            description: String::new(),
            secret: Some("abc123"),
        });

        assert!(result.is_err());
        let entries: Vec<_> = std::fs::read_dir(&paths.backups_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(entries.is_empty(), "backups dir should be empty after a failed build");
    }
}
