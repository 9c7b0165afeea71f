//! Restore pipeline: validate, stage, swap, reconnect.
//!
//! A restore never extracts over live state. The archive is verified first,
//! extracted into a unique staging directory, checked against the allow-list
//! of expected top-level entries and only then copied over the live paths
//! with the store connection closed. Backup triggers are paused from the
//! moment staging begins until reconnection finished, so no archive build
//! overlaps the swap. The caller gets its answer as soon as the swap is
//! durable; reopening the store, re-reading settings and secret, and
//! removing the staging directory happen in a background task that also
//! runs when the swap itself failed, so the instance always reconnects.

use crate::archive::signing::{verify_archive, Verification};
use crate::archive::{
    validate_archive_name, CONFIG_ENTRY, DATABASE_ENTRY, ENV_ENTRY, METADATA_ENTRY,
    SIGNATURE_ENTRY, UPLOADS_ENTRY,
};
use crate::config::{BackupSettings, VaultPaths};
use crate::error::{Result, VaultError};
use crate::scheduler::TriggerCoordinator;
use crate::secrets::{SecretStore, SECRET_FILE};
use crate::store::StoreHandle;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Staging directories are created under the data dir with this prefix; the
/// startup sweep removes any that a crash left behind.
pub(crate) const STAGING_PREFIX: &str = "restore-staging-";

/// Top-level entries an archive is allowed to carry. Anything else aborts
/// the restore before a single byte reaches the live directories.
const ALLOWED_TOP_LEVEL: &[&str] = &[
    DATABASE_ENTRY,
    CONFIG_ENTRY,
    UPLOADS_ENTRY,
    ENV_ENTRY,
    METADATA_ENTRY,
    SIGNATURE_ENTRY,
];

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RestoreOptions {
    /// Keep the live environment file instead of the archived one.
    #[serde(default)]
    pub skip_env: bool,
}

/// What a completed restore applied to the live state.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub archive: String,
    pub verification: Verification,
    /// Top-level entries copied over live paths.
    pub applied: Vec<String>,
    /// Entries present in the archive but deliberately not applied.
    pub skipped: Vec<String>,
}

pub struct RestoreOrchestrator {
    paths: VaultPaths,
    store: Arc<StoreHandle>,
    secrets: Arc<SecretStore>,
    settings: Arc<RwLock<BackupSettings>>,
    coordinator: TriggerCoordinator,
}

impl RestoreOrchestrator {
    pub fn new(
        paths: VaultPaths,
        store: Arc<StoreHandle>,
        secrets: Arc<SecretStore>,
        settings: Arc<RwLock<BackupSettings>>,
        coordinator: TriggerCoordinator,
    ) -> Self {
        Self {
            paths,
            store,
            secrets,
            settings,
            coordinator,
        }
    }

    /// Restores a local archive over the live state. `ops_guard` is the
    /// held operations gate; it moves into the reconnect task so no other
    /// backup or restore operation can start until reconnection finished.
    pub async fn restore(
        &self,
        archive_name: &str,
        options: RestoreOptions,
        ops_guard: OwnedMutexGuard<()>,
    ) -> Result<RestoreReport> {
        validate_archive_name(archive_name)?;
        let archive_path = self.paths.backups_dir.join(archive_name);
        if !archive_path.is_file() {
            return Err(VaultError::ArchiveNotFound(archive_name.to_string()));
        }

        info!(archive = %archive_name, "validating archive before restore");
        let verification = {
            let secret = self.secrets.get_or_create().await?;
            let path = archive_path.clone();
            tokio::task::spawn_blocking(move || verify_archive(&path, &secret)).await??
        };
        match verification {
            Verification::Trusted => {}
            Verification::ForeignSigned => {
                warn!(archive = %archive_name, "archive was signed by a different instance, accepted via its embedded secret");
            }
            Verification::Unsigned => {
                return Err(VaultError::SignatureMissing(archive_name.to_string()));
            }
            Verification::Mismatch => {
                return Err(VaultError::SignatureMismatch(archive_name.to_string()));
            }
        }

        // Triggers stay paused from here until the reconnect task resumes
        // them; pause waits out any backup build already in flight.
        self.coordinator.pause().await;

        info!(archive = %archive_name, "staging archive");
        let staging = self
            .paths
            .data_dir
            .join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));
        {
            let path = archive_path.clone();
            let stage_dir = staging.clone();
            let staged =
                match tokio::task::spawn_blocking(move || stage_archive(&path, &stage_dir)).await {
                    Ok(result) => result,
                    Err(join) => Err(join.into()),
                };
            if let Err(e) = staged {
                remove_staging(&staging).await;
                self.coordinator.resume();
                return Err(e);
            }
        }

        info!(archive = %archive_name, "swapping live state");
        self.store.close().await;

        let swap_result = {
            let stage_dir = staging.clone();
            let paths = self.paths.clone();
            let skip_env = options.skip_env;
            match tokio::task::spawn_blocking(move || swap_from_staging(&stage_dir, &paths, skip_env))
                .await
            {
                Ok(result) => result,
                Err(join) => Err(join.into()),
            }
        };

        // Reconnection runs no matter how the swap went; a half-applied swap
        // with a dead store would be strictly worse.
        self.spawn_reconnect(staging, ops_guard);

        let (applied, skipped) = swap_result?;
        info!(
            archive = %archive_name,
            applied = ?applied,
            skipped = ?skipped,
            "restore swap complete, reconnecting in background"
        );
        Ok(RestoreReport {
            archive: archive_name.to_string(),
            verification,
            applied,
            skipped,
        })
    }

    fn spawn_reconnect(&self, staging: PathBuf, ops_guard: OwnedMutexGuard<()>) {
        let store = self.store.clone();
        let secrets = self.secrets.clone();
        let settings = self.settings.clone();
        let coordinator = self.coordinator.clone();
        let settings_path = self.paths.settings_path();

        tokio::spawn(async move {
            // Held until every reconnect step ran.
            let _gate = ops_guard;

            if let Err(e) = store.reopen().await {
                error!(error = %e, "store failed to reopen after restore");
            }

            // The restored config directory may carry a different secret and
            // different settings than the ones cached in memory.
            secrets.invalidate().await;
            let fresh = BackupSettings::load(&settings_path);
            *settings.write().await = fresh;
            if let Err(e) = coordinator.reconfigure().await {
                error!(error = %e, "failed to re-arm the daily trigger after restore");
            }

            remove_staging(&staging).await;
            coordinator.resume();
            info!("restore reconnect complete");
        });
    }
}

/// Rejects any entry whose top-level segment is not an expected archive
/// member. Catches traversal names and injected extras alike.
fn check_top_level_allow_list<'a>(names: impl Iterator<Item = &'a str>) -> Result<()> {
    for name in names {
        let top = name.split('/').next().unwrap_or(name);
        if !ALLOWED_TOP_LEVEL.contains(&top) {
            return Err(VaultError::ContentRejected(format!(
                "unexpected top-level entry {name:?}"
            )));
        }
    }
    Ok(())
}

fn stage_archive(archive_path: &Path, staging: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    check_top_level_allow_list(names.iter().map(String::as_str))?;

    std::fs::create_dir_all(staging)?;
    archive.extract(staging)?;
    Ok(())
}

/// Copies the staged entries over the live paths. Files are overwritten in
/// place; live files absent from the archive stay as they are. The staged
/// instance secret is never applied.
fn swap_from_staging(
    staging: &Path,
    paths: &VaultPaths,
    skip_env: bool,
) -> Result<(Vec<String>, Vec<String>)> {
    let mut applied = Vec::new();
    let mut skipped = Vec::new();

    let staged_database = staging.join(DATABASE_ENTRY);
    if staged_database.is_dir() {
        copy_dir_over(&staged_database, &paths.database_dir, &[])?;
        applied.push(DATABASE_ENTRY.to_string());
    }

    let staged_config = staging.join(CONFIG_ENTRY);
    if staged_config.is_dir() {
        copy_dir_over(&staged_config, &paths.config_dir, &[SECRET_FILE])?;
        applied.push(CONFIG_ENTRY.to_string());
        if staged_config.join(SECRET_FILE).is_file() {
            skipped.push(format!("{}/{}", CONFIG_ENTRY, SECRET_FILE));
        }
    }

    let staged_uploads = staging.join(UPLOADS_ENTRY);
    if staged_uploads.is_dir() {
        copy_dir_over(&staged_uploads, &paths.uploads_dir, &[])?;
        applied.push(UPLOADS_ENTRY.to_string());
    }

    let staged_env = staging.join(ENV_ENTRY);
    if staged_env.is_file() {
        if skip_env {
            skipped.push(ENV_ENTRY.to_string());
        } else {
            std::fs::copy(&staged_env, &paths.env_file)?;
            applied.push(ENV_ENTRY.to_string());
        }
    }

    Ok((applied, skipped))
}

/// Recursive overwrite-copy. `skip_root_names` are file names ignored at the
/// top level of `src` only.
fn copy_dir_over(src: &Path, dst: &Path, skip_root_names: &[&str]) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        if entry.depth() == 1
            && skip_root_names
                .iter()
                .any(|s| entry.file_name() == std::ffi::OsStr::new(s))
        {
            continue;
        }

        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn remove_staging(staging: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(staging = %staging.display(), error = %e, "failed to remove staging directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::builder::{ArchiveBuilder, BuildRequest};
    use crate::archive::digest::compute_digest;
    use crate::archive::{signing, BackupCategory};
    use crate::store::{DbPool, STORE_FILE};
    use std::io::Write;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use zip::write::SimpleFileOptions;

    struct Fixture {
        paths: VaultPaths,
        store: Arc<StoreHandle>,
        secrets: Arc<SecretStore>,
        settings: Arc<RwLock<BackupSettings>>,
        coordinator: TriggerCoordinator,
        orchestrator: RestoreOrchestrator,
        gate: Arc<Mutex<()>>,
    }

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();
    }

    async fn fixture(base: &Path) -> Fixture {
        init_logging();
        let paths = VaultPaths::rooted(base);
        paths.ensure_dirs().unwrap();
        std::fs::write(paths.config_dir.join("settings.json"), b"{}").unwrap();
        std::fs::write(paths.uploads_dir.join("icon.png"), b"old-icon").unwrap();
        std::fs::write(&paths.env_file, b"LIVE_ENV\n").unwrap();

        let store = Arc::new(StoreHandle::new(&paths.database_dir));
        let secrets = Arc::new(SecretStore::new(&paths.config_dir));
        let settings = Arc::new(RwLock::new(BackupSettings::default()));
        let coordinator = TriggerCoordinator::new(paths.clone(), settings.clone(), secrets.clone())
            .await
            .unwrap();
        let orchestrator = RestoreOrchestrator::new(
            paths.clone(),
            store.clone(),
            secrets.clone(),
            settings.clone(),
            coordinator.clone(),
        );

        Fixture {
            paths,
            store,
            secrets,
            settings,
            coordinator,
            orchestrator,
            gate: Arc::new(Mutex::new(())),
        }
    }

    fn seed_marker(pool: &DbPool, value: &str) {
        let conn = pool.get().unwrap();
        conn.execute_batch("CREATE TABLE IF NOT EXISTS marker (v TEXT)").unwrap();
        conn.execute("DELETE FROM marker", []).unwrap();
        conn.execute("INSERT INTO marker (v) VALUES (?1)", [value]).unwrap();
    }

    fn read_marker(pool: &DbPool) -> String {
        let conn = pool.get().unwrap();
        conn.query_row("SELECT v FROM marker", [], |row| row.get(0)).unwrap()
    }

    fn build_archive(fix: &Fixture, secret: Option<&str>) -> String {
        let builder = ArchiveBuilder::new(fix.paths.clone());
        builder
            .build(&BuildRequest {
                category: BackupCategory::Manual,
                prefix: Some("checkpoint"),
                description: String::new(),
                secret,
            })
            .unwrap()
            .name
    }

    async fn wait_for_reconnect(data_dir: &Path) {
        for _ in 0..60 {
            let pending = std::fs::read_dir(data_dir)
                .unwrap()
                .filter_map(|e| e.ok())
                .any(|e| e.file_name().to_string_lossy().starts_with("restore-staging-"));
            if !pending {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("reconnect never cleaned the staging directory");
    }

    #[tokio::test]
    async fn restore_rolls_live_state_back_to_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let fix = fixture(dir.path()).await;

        fix.store.connect().await.unwrap();
        seed_marker(&fix.store.pool().await.unwrap(), "v1");
        let secret = fix.secrets.get_or_create().await.unwrap();
        let name = build_archive(&fix, Some(&secret));

        // Mutate everything the archive covers, plus one extra upload.
        seed_marker(&fix.store.pool().await.unwrap(), "v2");
        std::fs::write(fix.paths.uploads_dir.join("icon.png"), b"new-icon").unwrap();
        std::fs::write(fix.paths.uploads_dir.join("extra.png"), b"kept").unwrap();

        let guard = fix.gate.clone().lock_owned().await;
        let report = fix
            .orchestrator
            .restore(&name, RestoreOptions::default(), guard)
            .await
            .unwrap();

        assert_eq!(report.verification, Verification::Trusted);
        assert!(report.applied.contains(&DATABASE_ENTRY.to_string()));

        // The gate stays held by the reconnect task until it finishes.
        assert!(fix.gate.try_lock().is_err());
        wait_for_reconnect(&fix.paths.data_dir).await;

        assert_eq!(read_marker(&fix.store.pool().await.unwrap()), "v1");
        assert_eq!(
            std::fs::read(fix.paths.uploads_dir.join("icon.png")).unwrap(),
            b"old-icon"
        );
        // Copy-over semantics: live files absent from the archive survive.
        assert!(fix.paths.uploads_dir.join("extra.png").exists());
    }

    #[tokio::test]
    async fn restore_kills_a_pending_trigger_before_touching_the_disk() {
        let dir = tempfile::tempdir().unwrap();
        let fix = fixture(dir.path()).await;
        fix.store.connect().await.unwrap();
        seed_marker(&fix.store.pool().await.unwrap(), "v1");
        let secret = fix.secrets.get_or_create().await.unwrap();
        let name = build_archive(&fix, Some(&secret));

        // A mutation just before the restore leaves an armed timer that
        // would otherwise fire mid-swap.
        fix.coordinator.arm_after(Duration::from_millis(400)).await;

        let guard = fix.gate.clone().lock_owned().await;
        fix.orchestrator
            .restore(&name, RestoreOptions::default(), guard)
            .await
            .unwrap();
        wait_for_reconnect(&fix.paths.data_dir).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let incrementals = crate::archive::list_local(&fix.paths.backups_dir)
            .unwrap()
            .into_iter()
            .filter(|a| a.category == BackupCategory::Incremental)
            .count();
        assert_eq!(incrementals, 0);
    }

    #[tokio::test]
    async fn unsigned_archive_is_rejected_before_any_change() {
        let dir = tempfile::tempdir().unwrap();
        let fix = fixture(dir.path()).await;
        std::fs::write(fix.paths.database_dir.join(STORE_FILE), b"bytes").unwrap();
        let name = build_archive(&fix, None);

        std::fs::write(fix.paths.database_dir.join(STORE_FILE), b"live").unwrap();
        let guard = fix.gate.clone().lock_owned().await;
        let err = fix
            .orchestrator
            .restore(&name, RestoreOptions::default(), guard)
            .await
            .unwrap_err();

        assert!(matches!(err, VaultError::SignatureMissing(_)));
        assert_eq!(
            std::fs::read(fix.paths.database_dir.join(STORE_FILE)).unwrap(),
            b"live"
        );
    }

    #[tokio::test]
    async fn tampered_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fix = fixture(dir.path()).await;
        std::fs::write(fix.paths.database_dir.join(STORE_FILE), b"bytes").unwrap();
        let secret = fix.secrets.get_or_create().await.unwrap();
        let name = build_archive(&fix, Some(&secret));

        // Injecting content after signing invalidates the digest.
        let archive_path = fix.paths.backups_dir.join(&name);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&archive_path)
            .unwrap();
        let mut writer = zip::ZipWriter::new_append(file).unwrap();
        writer
            .start_file("database/injected", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"evil").unwrap();
        writer.finish().unwrap();

        let guard = fix.gate.clone().lock_owned().await;
        let err = fix
            .orchestrator
            .restore(&name, RestoreOptions::default(), guard)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::SignatureMismatch(_)));
    }

    #[tokio::test]
    async fn foreign_archive_restores_but_keeps_the_local_secret() {
        let local_dir = tempfile::tempdir().unwrap();
        let foreign_dir = tempfile::tempdir().unwrap();

        let fix = fixture(local_dir.path()).await;
        fix.store.connect().await.unwrap();
        seed_marker(&fix.store.pool().await.unwrap(), "local-rows");
        let local_secret = fix.secrets.get_or_create().await.unwrap();

        // A second instance with its own secret and its own data.
        let foreign = fixture(foreign_dir.path()).await;
        foreign.store.connect().await.unwrap();
        seed_marker(&foreign.store.pool().await.unwrap(), "foreign-rows");
        let foreign_secret = foreign.secrets.get_or_create().await.unwrap();
        assert_ne!(local_secret, foreign_secret);
        let foreign_name = build_archive(&foreign, Some(&foreign_secret));

        // Hand-carry the archive across instances.
        let carried = "imported-2024-05-10T00-00-00Z.zip";
        std::fs::copy(
            foreign.paths.backups_dir.join(&foreign_name),
            fix.paths.backups_dir.join(carried),
        )
        .unwrap();

        let guard = fix.gate.clone().lock_owned().await;
        let report = fix
            .orchestrator
            .restore(carried, RestoreOptions { skip_env: true }, guard)
            .await
            .unwrap();

        assert_eq!(report.verification, Verification::ForeignSigned);
        wait_for_reconnect(&fix.paths.data_dir).await;

        assert_eq!(read_marker(&fix.store.pool().await.unwrap()), "foreign-rows");
        // The foreign instance's key must not clobber ours.
        let key_on_disk =
            std::fs::read_to_string(fix.paths.config_dir.join(SECRET_FILE)).unwrap();
        assert_eq!(key_on_disk.trim(), local_secret);
        // Cache was invalidated and re-read from the untouched file.
        assert_eq!(fix.secrets.get_or_create().await.unwrap(), local_secret);
    }

    #[tokio::test]
    async fn unexpected_top_level_entry_aborts_the_restore() {
        let dir = tempfile::tempdir().unwrap();
        let fix = fixture(dir.path()).await;
        let secret = fix.secrets.get_or_create().await.unwrap();

        // Hand-build an archive with a stowaway entry and a valid signature.
        let payload_path = fix.paths.backups_dir.join("stowaway-2024-05-10T00-00-00Z.zip");
        {
            let file = File::create(&payload_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = SimpleFileOptions::default();
            writer.start_file("database/navboard.db", options).unwrap();
            writer.write_all(b"rows").unwrap();
            writer.start_file("evil.sh", options).unwrap();
            writer.write_all(b"#!/bin/sh").unwrap();
            writer.finish().unwrap();
        }
        let digest = compute_digest(&payload_path).unwrap();
        let sig = signing::sign(&digest, &secret);
        {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&payload_path)
                .unwrap();
            let mut writer = zip::ZipWriter::new_append(file).unwrap();
            writer
                .start_file(SIGNATURE_ENTRY, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(sig.as_bytes()).unwrap();
            writer.finish().unwrap();
        }

        let guard = fix.gate.clone().lock_owned().await;
        let err = fix
            .orchestrator
            .restore(
                "stowaway-2024-05-10T00-00-00Z.zip",
                RestoreOptions::default(),
                guard,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, VaultError::ContentRejected(_)));
        // The failed staging attempt cleaned up after itself.
        let staging_left = std::fs::read_dir(&fix.paths.data_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("restore-staging-"));
        assert!(!staging_left);

        // And it resumed the triggers: a later quiet window still fires.
        fix.coordinator.arm_after(Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(crate::archive::list_local(&fix.paths.backups_dir)
            .unwrap()
            .iter()
            .any(|a| a.category == BackupCategory::Incremental));
    }

    #[tokio::test]
    async fn skip_env_preserves_the_live_environment_file() {
        let dir = tempfile::tempdir().unwrap();
        let fix = fixture(dir.path()).await;
        std::fs::write(fix.paths.database_dir.join(STORE_FILE), b"bytes").unwrap();
        let secret = fix.secrets.get_or_create().await.unwrap();
        let name = build_archive(&fix, Some(&secret));

        std::fs::write(&fix.paths.env_file, b"CHANGED_AFTER_BACKUP\n").unwrap();

        let guard = fix.gate.clone().lock_owned().await;
        let report = fix
            .orchestrator
            .restore(&name, RestoreOptions { skip_env: true }, guard)
            .await
            .unwrap();

        assert!(report.skipped.contains(&ENV_ENTRY.to_string()));
        assert_eq!(
            std::fs::read(&fix.paths.env_file).unwrap(),
            b"CHANGED_AFTER_BACKUP\n"
        );
        wait_for_reconnect(&fix.paths.data_dir).await;
    }

    #[test]
    fn allow_list_rejects_traversal_and_extras() {
        let ok = [
            "database/navboard.db",
            "config/settings.json",
            "uploads/a.png",
            ".env",
            "backup-info.json",
            ".signature",
        ];
        assert!(check_top_level_allow_list(ok.iter().copied()).is_ok());

        for bad in ["evil.sh", "../escape", "/abs/path", "config2/x"] {
            assert!(
                check_top_level_allow_list(std::iter::once(bad)).is_err(),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn settings_are_reloaded_from_the_restored_config() {
        let dir = tempfile::tempdir().unwrap();
        let fix = fixture(dir.path()).await;
        std::fs::write(fix.paths.database_dir.join(STORE_FILE), b"bytes").unwrap();

        // Persist settings with a distinctive hour, then archive them.
        {
            let mut s = fix.settings.write().await;
            s.calendar.hour = 6;
            s.save(&fix.paths.settings_path()).unwrap();
        }
        let secret = fix.secrets.get_or_create().await.unwrap();
        let name = build_archive(&fix, Some(&secret));

        // Diverge the in-memory settings afterwards.
        fix.settings.write().await.calendar.hour = 9;

        let guard = fix.gate.clone().lock_owned().await;
        fix.orchestrator
            .restore(&name, RestoreOptions::default(), guard)
            .await
            .unwrap();
        wait_for_reconnect(&fix.paths.data_dir).await;

        assert_eq!(fix.settings.read().await.calendar.hour, 6);
    }
}
