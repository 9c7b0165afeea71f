//! The vault facade.
//!
//! [`Vault`] wires the pipeline together and is the only type an embedding
//! dashboard talks to: it owns the store handle, the signing secret, the
//! mutable settings and the trigger coordinator, and it exposes the backup
//! operations the (external) HTTP layer maps onto routes. Operations that
//! change the backups directory or the live state share one gate with the
//! restore pipeline, so nothing runs while a restore holds the instance.

use crate::archive::builder::{ArchiveBuilder, BuildRequest};
use crate::archive::signing::{read_signature, verify_archive, Verification};
use crate::archive::{
    archive_file_name, list_local, sanitize_prefix, sidecar_name, timestamp_from_name,
    validate_archive_name, ArchiveInfo, BackupCategory,
};
use crate::config::{BackupSettings, BackupSettingsPatch, VaultPaths};
use crate::error::{Result, VaultError};
use crate::remote::WebdavClient;
use crate::restore::{RestoreOptions, RestoreOrchestrator, RestoreReport, STAGING_PREFIX};
use crate::retention;
use crate::scheduler::TriggerCoordinator;
use crate::secrets::SecretStore;
use crate::store::StoreHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Which copy of the archive set to enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Remote,
}

/// Result of accepting an uploaded archive.
#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    /// Name the archive was stored under in the backups directory.
    pub name: String,
    pub verification: Verification,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CategoryStats {
    pub count: u32,
    pub total_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultStats {
    pub incremental: CategoryStats,
    pub daily: CategoryStats,
    pub manual: CategoryStats,
    pub last_debounce_at: Option<DateTime<Utc>>,
    pub last_scheduled_at: Option<DateTime<Utc>>,
    pub next_scheduled_at: Option<DateTime<Utc>>,
}

pub struct Vault {
    paths: VaultPaths,
    store: Arc<StoreHandle>,
    secrets: Arc<SecretStore>,
    settings: Arc<RwLock<BackupSettings>>,
    coordinator: TriggerCoordinator,
    restorer: RestoreOrchestrator,
    /// Serializes user-facing mutations of the backup set against restores.
    ops_gate: Arc<Mutex<()>>,
}

impl Vault {
    /// Opens the vault over an instance directory: loads persisted settings,
    /// connects the store and wires the triggers. Call [`Vault::start`] to
    /// arm them.
    pub async fn open(paths: VaultPaths) -> Result<Vault> {
        paths.ensure_dirs()?;

        let settings = Arc::new(RwLock::new(BackupSettings::load(&paths.settings_path())));
        let secrets = Arc::new(SecretStore::new(&paths.config_dir));
        let store = Arc::new(StoreHandle::new(&paths.database_dir));
        store.connect().await?;

        let coordinator =
            TriggerCoordinator::new(paths.clone(), settings.clone(), secrets.clone()).await?;
        let restorer = RestoreOrchestrator::new(
            paths.clone(),
            store.clone(),
            secrets.clone(),
            settings.clone(),
            coordinator.clone(),
        );

        Ok(Vault {
            paths,
            store,
            secrets,
            settings,
            coordinator,
            restorer,
            ops_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Sweeps crash leftovers and arms the calendar trigger.
    pub async fn start(&self) -> Result<()> {
        let paths = self.paths.clone();
        let (stagings, parts) = tokio::task::spawn_blocking(move || sweep_stale_artifacts(&paths))
            .await??;
        if stagings > 0 || parts > 0 {
            info!(stagings, parts, "removed stale restore/build artifacts");
        }

        self.coordinator.start().await?;
        info!(data_dir = %self.paths.data_dir.display(), "backup vault started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.coordinator.shutdown().await?;
        self.store.close().await;
        info!("backup vault stopped");
        Ok(())
    }

    /// The store seam, for hosts that query through the vault-managed pool.
    pub fn store_handle(&self) -> Arc<StoreHandle> {
        self.store.clone()
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    /// A store mutation happened; (re)arm the debounce window.
    pub async fn notify_mutation(&self) {
        self.coordinator.notify_mutation().await;
    }

    /// Creates a manual archive and applies manual retention. Manual
    /// archives stay on the local tier.
    pub async fn create_backup(
        &self,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<ArchiveInfo> {
        let _ops = self.ops_gate.lock().await;

        let secret = match self.secrets.get_or_create().await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "signing secret unavailable, archive will be unsigned");
                None
            }
        };
        let keep = self.settings.read().await.manual_keep_count;

        let paths = self.paths.clone();
        let prefix = name.map(str::to_string);
        let description = description.unwrap_or_default().to_string();
        let built = tokio::task::spawn_blocking(move || {
            let builder = ArchiveBuilder::new(paths.clone());
            let built = builder.build(&BuildRequest {
                category: BackupCategory::Manual,
                prefix: prefix.as_deref(),
                description,
                secret: secret.as_deref(),
            })?;
            retention::evict_local(&paths.backups_dir, BackupCategory::Manual, keep)?;
            Ok::<_, VaultError>(built)
        })
        .await??;

        Ok(built.info())
    }

    /// Lists archives on one tier, newest first. Remote entries carry only
    /// what the Depth-1 listing returns: their name and what the name
    /// implies; unsigned archives are never pushed, so every remote entry
    /// is signed.
    pub async fn list_backups(&self, tier: Tier) -> Result<Vec<ArchiveInfo>> {
        match tier {
            Tier::Local => {
                let dir = self.paths.backups_dir.clone();
                tokio::task::spawn_blocking(move || list_local(&dir)).await?
            }
            Tier::Remote => {
                let webdav = self.settings.read().await.webdav.clone();
                let Some(client) = WebdavClient::from_settings(&webdav)? else {
                    return Ok(Vec::new());
                };
                let mut names = client.list().await?;
                names.sort_by(|a, b| b.cmp(a));
                Ok(names
                    .into_iter()
                    .map(|name| ArchiveInfo {
                        category: BackupCategory::of_archive(&name),
                        size_bytes: 0,
                        created_at: timestamp_from_name(&name).unwrap_or_else(Utc::now),
                        signed: true,
                        local_path: None,
                        remote_path: Some(format!("{}/{}", webdav.remote_dir, name)),
                        name,
                    })
                    .collect())
            }
        }
    }

    /// Opens a local archive for streaming, returning the file and its size.
    pub async fn open_download(&self, name: &str) -> Result<(tokio::fs::File, u64)> {
        validate_archive_name(name)?;
        let path = self.paths.backups_dir.join(name);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::ArchiveNotFound(name.to_string())
            } else {
                e.into()
            }
        })?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Deletes a local archive and its signature sidecar.
    pub async fn delete_backup(&self, name: &str) -> Result<()> {
        validate_archive_name(name)?;
        let _ops = self.ops_gate.lock().await;

        let path = self.paths.backups_dir.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::ArchiveNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let sidecar = path.with_file_name(sidecar_name(name));
        if let Err(e) = tokio::fs::remove_file(&sidecar).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(sidecar = %sidecar.display(), error = %e, "failed to remove signature sidecar");
            }
        }

        info!(archive = %name, "archive deleted");
        Ok(())
    }

    /// Runs the full trust check on an uploaded archive and, when it passes,
    /// moves it into the backups directory. Rejected uploads are deleted
    /// from the spool.
    pub async fn import_backup(&self, spooled: &Path, original_name: &str) -> Result<ImportOutcome> {
        let _ops = self.ops_gate.lock().await;

        let secret = self.secrets.get_or_create().await?;
        let spool = spooled.to_path_buf();
        let verification =
            match tokio::task::spawn_blocking(move || verify_archive(&spool, &secret)).await? {
                Ok(v) => v,
                Err(e) => {
                    discard_spool(spooled).await;
                    return Err(e);
                }
            };

        if !verification.is_accepted() {
            discard_spool(spooled).await;
            return Err(match verification {
                Verification::Unsigned => VaultError::SignatureMissing(original_name.to_string()),
                _ => VaultError::SignatureMismatch(original_name.to_string()),
            });
        }
        if verification == Verification::ForeignSigned {
            warn!(archive = %original_name, "imported archive was signed by a different instance");
        }

        // Keep the uploader's name when it is safe and free, otherwise
        // re-derive one from its stem.
        let final_name = match validate_archive_name(original_name) {
            Ok(()) if !self.paths.backups_dir.join(original_name).exists() => {
                original_name.to_string()
            }
            _ => {
                let stem = original_name.trim_end_matches(".zip");
                archive_file_name(&sanitize_prefix(stem), Utc::now())
            }
        };

        let destination = self.paths.backups_dir.join(&final_name);
        move_into_place(spooled, &destination).await?;

        let stored = destination.clone();
        if let Ok(Some(sig)) = tokio::task::spawn_blocking(move || read_signature(&stored)).await? {
            let sidecar = destination.with_file_name(sidecar_name(&final_name));
            if let Err(e) = tokio::fs::write(&sidecar, sig).await {
                warn!(sidecar = %sidecar.display(), error = %e, "failed to write signature sidecar");
            }
        }

        info!(archive = %final_name, "archive imported");
        Ok(ImportOutcome {
            name: final_name,
            verification,
        })
    }

    /// Restores a local archive. Returns once the swap is durable; the
    /// store reconnect and cleanup finish in the background while the
    /// operations gate stays held.
    pub async fn restore_backup(
        &self,
        name: &str,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        let guard = self.ops_gate.clone().lock_owned().await;
        self.restorer.restore(name, options, guard).await
    }

    /// The restore validation phase as a read-only check on a local archive.
    pub async fn verify_backup(&self, name: &str) -> Result<Verification> {
        validate_archive_name(name)?;
        let path = self.paths.backups_dir.join(name);
        if !path.is_file() {
            return Err(VaultError::ArchiveNotFound(name.to_string()));
        }
        let secret = self.secrets.get_or_create().await?;
        tokio::task::spawn_blocking(move || verify_archive(&path, &secret)).await?
    }

    pub async fn settings(&self) -> BackupSettings {
        self.settings.read().await.clone()
    }

    /// Merges the patch over the current settings, persists atomically and
    /// re-arms the calendar trigger. Validation failure leaves both the file
    /// and the running configuration untouched.
    pub async fn update_settings(&self, patch: BackupSettingsPatch) -> Result<BackupSettings> {
        {
            let mut current = self.settings.write().await;
            let next = current.merged(&patch);
            next.validate()?;
            next.save(&self.paths.settings_path())?;
            *current = next;
        }
        self.coordinator.reconfigure().await?;
        info!("backup settings updated");
        Ok(self.settings.read().await.clone())
    }

    /// Archive counts and sizes from disk plus the trigger timeline. Trigger
    /// times fall back to the newest matching archive on disk so they
    /// survive restarts.
    pub async fn stats(&self) -> Result<VaultStats> {
        let dir = self.paths.backups_dir.clone();
        let archives = tokio::task::spawn_blocking(move || list_local(&dir)).await??;

        let mut incremental = CategoryStats::default();
        let mut daily = CategoryStats::default();
        let mut manual = CategoryStats::default();
        for archive in &archives {
            let bucket = match archive.category {
                BackupCategory::Incremental => &mut incremental,
                BackupCategory::Daily => &mut daily,
                BackupCategory::Manual => &mut manual,
            };
            bucket.count += 1;
            bucket.total_size_bytes += archive.size_bytes;
        }

        let newest = |category: BackupCategory| {
            archives
                .iter()
                .filter(|a| a.category == category)
                .map(|a| a.created_at)
                .max()
        };

        Ok(VaultStats {
            incremental,
            daily,
            manual,
            last_debounce_at: self
                .coordinator
                .last_debounce_at()
                .await
                .or_else(|| newest(BackupCategory::Incremental)),
            last_scheduled_at: self
                .coordinator
                .last_scheduled_at()
                .await
                .or_else(|| newest(BackupCategory::Daily)),
            next_scheduled_at: self.coordinator.next_scheduled_at().await,
        })
    }
}

/// Removes leftovers from interrupted work: staging directories from a
/// crashed restore and `.part` files from a crashed build.
fn sweep_stale_artifacts(paths: &VaultPaths) -> Result<(usize, usize)> {
    let mut stagings = 0;
    let mut parts = 0;

    if paths.data_dir.is_dir() {
        for entry in std::fs::read_dir(&paths.data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(STAGING_PREFIX) && entry.path().is_dir() {
                match std::fs::remove_dir_all(entry.path()) {
                    Ok(()) => stagings += 1,
                    Err(e) => warn!(dir = %entry.path().display(), error = %e, "failed to remove stale staging directory"),
                }
            }
        }
    }

    if paths.backups_dir.is_dir() {
        for entry in std::fs::read_dir(&paths.backups_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".part") && entry.path().is_file() {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => parts += 1,
                    Err(e) => warn!(file = %entry.path().display(), error = %e, "failed to remove stale partial archive"),
                }
            }
        }
    }

    Ok((stagings, parts))
}

async fn discard_spool(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(spool = %path.display(), error = %e, "failed to remove rejected upload");
        }
    }
}

/// Rename when possible; the upload spool may sit on a different filesystem
/// than the backups directory, in which case fall back to copy+remove.
async fn move_into_place(src: &Path, dst: &Path) -> Result<()> {
    if tokio::fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(src, dst).await?;
    tokio::fs::remove_file(src).await?;
    Ok(())
}
