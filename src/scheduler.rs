//! Debounce and calendar backup triggers.
//!
//! The debounce trigger coalesces mutation bursts: every mutation restarts a
//! single pending timer, and only when the instance has been quiet for the
//! configured window does one incremental archive get built. The calendar
//! trigger fires once a day through a cron job and can skip itself when a
//! debounced archive already covers the last 24 hours.
//!
//! Both triggers run the same cycle on firing: build the archive, apply
//! local retention, push signed archives to the remote, then apply remote
//! retention if the push completed.

use crate::archive::builder::{ArchiveBuilder, BuildRequest, BuiltArchive};
use crate::archive::{list_local, BackupCategory};
use crate::config::{BackupSettings, VaultPaths};
use crate::error::{Result, VaultError};
use crate::remote::{self, WebdavClient};
use crate::retention;
use crate::secrets::SecretStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Owns the debounce timer slot and the daily cron job. Cloning shares the
/// same coordinator.
#[derive(Clone)]
pub struct TriggerCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    paths: VaultPaths,
    settings: Arc<RwLock<BackupSettings>>,
    secrets: Arc<SecretStore>,
    scheduler: Mutex<JobScheduler>,
    calendar_job: Mutex<Option<Uuid>>,
    debounce_slot: Mutex<Option<JoinHandle<()>>>,
    /// Serializes archive builds so overlapping triggers cannot race on the
    /// backups directory.
    trigger_gate: Mutex<()>,
    /// Set while a restore owns the data directories.
    paused: AtomicBool,
    last_debounce_at: Mutex<Option<DateTime<Utc>>>,
    last_scheduled_at: Mutex<Option<DateTime<Utc>>>,
}

impl TriggerCoordinator {
    pub async fn new(
        paths: VaultPaths,
        settings: Arc<RwLock<BackupSettings>>,
        secrets: Arc<SecretStore>,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                paths,
                settings,
                secrets,
                scheduler: Mutex::new(scheduler),
                calendar_job: Mutex::new(None),
                debounce_slot: Mutex::new(None),
                trigger_gate: Mutex::new(()),
                paused: AtomicBool::new(false),
                last_debounce_at: Mutex::new(None),
                last_scheduled_at: Mutex::new(None),
            }),
        })
    }

    /// Arms the calendar job and starts the cron runtime. The last debounce
    /// time is seeded from the newest incremental archive on disk so the
    /// daily skip rule survives restarts.
    pub async fn start(&self) -> Result<()> {
        if let Some(at) = newest_incremental_at(&self.inner.paths) {
            *self.inner.last_debounce_at.lock().await = Some(at);
        }
        self.reconfigure().await?;
        self.inner.scheduler.lock().await.start().await?;
        Ok(())
    }

    /// A store mutation happened; (re)start the quiet-window timer. Only the
    /// most recently armed timer survives.
    pub async fn notify_mutation(&self) {
        if self.inner.paused.load(Ordering::SeqCst) {
            return;
        }
        let delay_minutes = {
            let settings = self.inner.settings.read().await;
            if !settings.debounce.enabled {
                return;
            }
            settings.debounce.delay_minutes
        };
        self.arm_after(Duration::from_secs(u64::from(delay_minutes) * 60))
            .await;
    }

    /// Arms the debounce timer with an explicit delay. The spawned task
    /// vacates the slot before building, so a mutation arriving mid-build
    /// arms a fresh window instead of aborting the build.
    pub(crate) async fn arm_after(&self, delay: Duration) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = inner.debounce_slot.lock().await;
                *slot = None;
            }
            if inner.paused.load(Ordering::SeqCst) {
                return;
            }
            inner.fire_debounce().await;
        });

        let mut slot = self.inner.debounce_slot.lock().await;
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Applies the current calendar settings: removes the existing cron job
    /// and adds a new one when the daily trigger is enabled. There is never
    /// more than one calendar job alive.
    pub async fn reconfigure(&self) -> Result<()> {
        let calendar = self.inner.settings.read().await.calendar.clone();
        let mut job_slot = self.inner.calendar_job.lock().await;
        let mut scheduler = self.inner.scheduler.lock().await;

        if let Some(old) = job_slot.take() {
            scheduler.remove(&old).await?;
        }

        if calendar.enabled {
            let inner = self.inner.clone();
            let job = Job::new_async(calendar.cron_expr().as_str(), move |_uuid, _lock| {
                let inner = inner.clone();
                Box::pin(async move {
                    inner.fire_calendar().await;
                })
            })?;
            let id = scheduler.add(job).await?;
            *job_slot = Some(id);
            info!(cron = %calendar.cron_expr(), "daily backup scheduled");
        } else {
            info!("daily backup disabled");
        }
        Ok(())
    }

    /// Stops both triggers while a restore owns the data directories.
    /// Returns only after any in-flight trigger cycle has finished, so the
    /// caller can touch the live directories without a build racing it.
    pub async fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        if let Some(pending) = self.inner.debounce_slot.lock().await.take() {
            pending.abort();
        }
        // A cycle that passed its paused check still owns the trigger gate;
        // taking the gate once waits that cycle out.
        drop(self.inner.trigger_gate.lock().await);
        info!("backup triggers paused");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        info!("backup triggers resumed");
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(pending) = self.inner.debounce_slot.lock().await.take() {
            pending.abort();
        }
        self.inner.scheduler.lock().await.shutdown().await?;
        Ok(())
    }

    pub async fn last_debounce_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_debounce_at.lock().await
    }

    pub async fn last_scheduled_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_scheduled_at.lock().await
    }

    /// Next daily firing, or `None` while the calendar trigger is disabled.
    pub async fn next_scheduled_at(&self) -> Option<DateTime<Utc>> {
        let calendar = self.inner.settings.read().await.calendar.clone();
        if !calendar.enabled || self.inner.calendar_job.lock().await.is_none() {
            return None;
        }
        calendar.next_fire_after(Utc::now())
    }
}

impl CoordinatorInner {
    async fn fire_debounce(self: Arc<Self>) {
        let _fire = self.trigger_gate.lock().await;
        // Checked while holding the gate so nothing fires after `pause`
        // drained it.
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        let settings = self.settings.read().await.clone();
        if !settings.debounce.enabled {
            return;
        }

        info!("quiet window elapsed, building incremental backup");
        match run_trigger_cycle(
            &self.paths,
            &settings,
            &self.secrets,
            BackupCategory::Incremental,
            settings.debounce.keep_count,
        )
        .await
        {
            Ok(built) => {
                *self.last_debounce_at.lock().await = Some(built.created_at);
            }
            Err(e) => error!(error = %e, "debounced backup failed"),
        }
    }

    async fn fire_calendar(self: Arc<Self>) {
        let _fire = self.trigger_gate.lock().await;
        if self.paused.load(Ordering::SeqCst) {
            info!("daily backup skipped, restore in progress");
            return;
        }
        let settings = self.settings.read().await.clone();
        if !settings.calendar.enabled {
            return;
        }

        let last_debounce = *self.last_debounce_at.lock().await;
        if skip_daily_for_recent_incremental(
            last_debounce,
            Utc::now(),
            settings.calendar.only_if_recent_debounce,
        ) {
            info!("daily backup skipped, a debounced archive covers the last 24h");
            return;
        }

        info!("building daily backup");
        match run_trigger_cycle(
            &self.paths,
            &settings,
            &self.secrets,
            BackupCategory::Daily,
            settings.calendar.keep_count,
        )
        .await
        {
            Ok(built) => {
                *self.last_scheduled_at.lock().await = Some(built.created_at);
            }
            Err(e) => error!(error = %e, "daily backup failed"),
        }
    }
}

/// One full trigger cycle: build, local retention, remote push, remote
/// retention. Local failures abort the cycle; remote failures never do.
async fn run_trigger_cycle(
    paths: &VaultPaths,
    settings: &BackupSettings,
    secrets: &SecretStore,
    category: BackupCategory,
    keep: u32,
) -> Result<BuiltArchive> {
    let secret = match secrets.get_or_create().await {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "signing secret unavailable, archive will be unsigned");
            None
        }
    };

    let builder_paths = paths.clone();
    let backups_dir = paths.backups_dir.clone();
    let built = tokio::task::spawn_blocking(move || {
        let builder = ArchiveBuilder::new(builder_paths);
        let built = builder.build(&BuildRequest {
            category,
            prefix: None,
            description: String::new(),
            secret: secret.as_deref(),
        })?;
        retention::evict_local(&backups_dir, category, keep)?;
        Ok::<BuiltArchive, VaultError>(built)
    })
    .await??;

    // Only signed archives leave the instance; remote entries are trusted
    // to carry a signature.
    if !built.signed {
        warn!(archive = %built.name, "archive is unsigned, remote sync skipped");
        return Ok(built);
    }

    let client = WebdavClient::from_settings(&settings.webdav)?;
    let outcome = remote::push_archive(client.as_ref(), &built.path, &built.name).await;
    if outcome.reached_remote() {
        if let Some(client) = client.as_ref() {
            if let Err(e) = retention::evict_remote(client, category, keep).await {
                warn!(error = %e, "remote retention failed");
            }
        }
    }

    Ok(built)
}

/// Daily-trigger skip rule: with the flag set, a debounced archive newer
/// than 24 hours makes the daily snapshot redundant.
fn skip_daily_for_recent_incremental(
    last_debounce: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    only_if_recent_debounce: bool,
) -> bool {
    if !only_if_recent_debounce {
        return false;
    }
    match last_debounce {
        Some(at) => now.signed_duration_since(at) < ChronoDuration::hours(24),
        None => false,
    }
}

/// Creation time of the newest incremental archive on disk, if any.
fn newest_incremental_at(paths: &VaultPaths) -> Option<DateTime<Utc>> {
    list_local(&paths.backups_dir)
        .ok()?
        .into_iter()
        .find(|a| a.category == BackupCategory::Incremental)
        .map(|a| a.created_at)
}
