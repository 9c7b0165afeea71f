//! Configuration for the vault pipeline.
//!
//! Two layers: [`VaultPaths`] is immutable process-wide wiring resolved once
//! at startup (env overrides honored), while [`BackupSettings`] is the
//! user-mutable schedule/retention/remote configuration persisted as JSON in
//! the config directory and updated through a single merge-and-persist entry
//! point.

use crate::error::{Result, VaultError};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the persisted settings inside the config directory.
pub const SETTINGS_FILE: &str = "vault-settings.json";

#[derive(Debug, Clone)]
pub struct VaultPaths {
    /// Base data directory of the dashboard instance.
    pub data_dir: PathBuf,

    /// Live store files (sqlite database and friends).
    pub database_dir: PathBuf,

    /// Configuration directory; also holds the signing secret and the
    /// persisted [`BackupSettings`].
    pub config_dir: PathBuf,

    /// User-uploaded assets (icons, wallpapers).
    pub uploads_dir: PathBuf,

    /// Optional environment file; only archived when it exists.
    pub env_file: PathBuf,

    /// Where finished archives and their sidecars land.
    pub backups_dir: PathBuf,
}

impl VaultPaths {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("NAVBOARD_DATA_DIR").unwrap_or_else(|_| "./data".into()),
        );

        let backups_dir = std::env::var("NAVBOARD_BACKUPS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("backups"));

        Self {
            database_dir: data_dir.join("database"),
            config_dir: data_dir.join("config"),
            uploads_dir: data_dir.join("uploads"),
            env_file: std::env::var("NAVBOARD_ENV_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join(".env")),
            backups_dir,
            data_dir,
        }
    }

    /// All directories rooted below `base`. Used by embedders that manage a
    /// single instance directory, and by tests.
    pub fn rooted(base: &Path) -> Self {
        Self {
            data_dir: base.to_path_buf(),
            database_dir: base.join("database"),
            config_dir: base.join("config"),
            uploads_dir: base.join("uploads"),
            env_file: base.join(".env"),
            backups_dir: base.join("backups"),
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE)
    }

    /// Creates the directories the pipeline writes into.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.database_dir)?;
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.uploads_dir)?;
        std::fs::create_dir_all(&self.backups_dir)?;
        Ok(())
    }
}

// ── Mutable settings ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DebounceSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Quiet window after the last mutation before an incremental archive is
    /// taken. Bursts inside the window coalesce into one archive.
    #[serde(default = "default_debounce_delay")]
    pub delay_minutes: u32,

    #[serde(default = "default_debounce_keep")]
    pub keep_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalendarSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Daily firing time, UTC.
    #[serde(default = "default_calendar_hour")]
    pub hour: u8,

    #[serde(default)]
    pub minute: u8,

    #[serde(default = "default_calendar_keep")]
    pub keep_count: u32,

    /// Skip the daily archive when a debounce-triggered one completed within
    /// the previous 24 hours.
    #[serde(default = "default_true")]
    pub only_if_recent_debounce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebdavSettings {
    /// Base URL of the WebDAV server. Empty means no remote target is
    /// configured, which silently disables remote sync.
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Directory on the remote holding all synced archives, flat.
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupSettings {
    #[serde(default)]
    pub debounce: DebounceSettings,

    #[serde(default)]
    pub calendar: CalendarSettings,

    /// Keep-count for manually created archives (local tier only).
    #[serde(default = "default_manual_keep")]
    pub manual_keep_count: u32,

    #[serde(default)]
    pub webdav: WebdavSettings,
}

fn default_true() -> bool {
    true
}

fn default_debounce_delay() -> u32 {
    5
}

fn default_debounce_keep() -> u32 {
    10
}

fn default_calendar_hour() -> u8 {
    3
}

fn default_calendar_keep() -> u32 {
    7
}

fn default_manual_keep() -> u32 {
    5
}

fn default_remote_dir() -> String {
    "navboard-backups".to_string()
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_minutes: default_debounce_delay(),
            keep_count: default_debounce_keep(),
        }
    }
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            hour: default_calendar_hour(),
            minute: 0,
            keep_count: default_calendar_keep(),
            only_if_recent_debounce: true,
        }
    }
}

impl Default for WebdavSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            remote_dir: default_remote_dir(),
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            debounce: DebounceSettings::default(),
            calendar: CalendarSettings::default(),
            manual_keep_count: default_manual_keep(),
            webdav: WebdavSettings::default(),
        }
    }
}

impl CalendarSettings {
    /// Six-field cron expression (seconds first) for the daily firing.
    pub fn cron_expr(&self) -> String {
        format!("0 {} {} * * *", self.minute, self.hour)
    }

    /// Next UTC firing strictly after `now`.
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now.date_naive().and_hms_opt(self.hour as u32, self.minute as u32, 0)?;
        let today = Utc.from_utc_datetime(&today);
        if today > now {
            Some(today)
        } else {
            Some(today + ChronoDuration::days(1))
        }
    }
}

impl BackupSettings {
    pub fn validate(&self) -> Result<()> {
        if self.calendar.hour > 23 {
            return Err(VaultError::Config(format!(
                "calendar hour {} out of range",
                self.calendar.hour
            )));
        }
        if self.calendar.minute > 59 {
            return Err(VaultError::Config(format!(
                "calendar minute {} out of range",
                self.calendar.minute
            )));
        }
        if self.debounce.enabled && self.debounce.delay_minutes == 0 {
            return Err(VaultError::Config(
                "debounce delay must be at least one minute".into(),
            ));
        }
        if !self.webdav.url.is_empty() && self.webdav.remote_dir.trim().is_empty() {
            return Err(VaultError::Config("webdav remote_dir must not be empty".into()));
        }
        Ok(())
    }

    /// Loads persisted settings; a missing, unparsable or out-of-range file
    /// falls back to defaults (the next update writes a fresh file).
    pub fn load(path: &Path) -> Self {
        let settings = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Self>(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Settings file unparsable, using defaults");
                    return Self::default();
                }
            },
            Err(_) => return Self::default(),
        };

        // A file edited by hand can parse and still be unusable, e.g. a
        // calendar hour the cron job would reject at arming time.
        if let Err(e) = settings.validate() {
            tracing::warn!(path = %path.display(), error = %e, "Settings file invalid, using defaults");
            return Self::default();
        }
        settings
    }

    /// Persists atomically: write a temp file in the same directory, then
    /// rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Returns a copy with `patch` merged over `self`. Absent patch fields
    /// keep their current value.
    pub fn merged(&self, patch: &BackupSettingsPatch) -> Self {
        let mut next = self.clone();
        if let Some(d) = &patch.debounce {
            if let Some(v) = d.enabled {
                next.debounce.enabled = v;
            }
            if let Some(v) = d.delay_minutes {
                next.debounce.delay_minutes = v;
            }
            if let Some(v) = d.keep_count {
                next.debounce.keep_count = v;
            }
        }
        if let Some(c) = &patch.calendar {
            if let Some(v) = c.enabled {
                next.calendar.enabled = v;
            }
            if let Some(v) = c.hour {
                next.calendar.hour = v;
            }
            if let Some(v) = c.minute {
                next.calendar.minute = v;
            }
            if let Some(v) = c.keep_count {
                next.calendar.keep_count = v;
            }
            if let Some(v) = c.only_if_recent_debounce {
                next.calendar.only_if_recent_debounce = v;
            }
        }
        if let Some(v) = patch.manual_keep_count {
            next.manual_keep_count = v;
        }
        if let Some(w) = &patch.webdav {
            if let Some(v) = &w.url {
                next.webdav.url = v.clone();
            }
            if let Some(v) = &w.username {
                next.webdav.username = v.clone();
            }
            if let Some(v) = &w.password {
                next.webdav.password = v.clone();
            }
            if let Some(v) = &w.remote_dir {
                next.webdav.remote_dir = v.clone();
            }
        }
        next
    }
}

// ── Partial update ──

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebouncePatch {
    pub enabled: Option<bool>,
    pub delay_minutes: Option<u32>,
    pub keep_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalendarPatch {
    pub enabled: Option<bool>,
    pub hour: Option<u8>,
    pub minute: Option<u8>,
    pub keep_count: Option<u32>,
    pub only_if_recent_debounce: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebdavPatch {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub remote_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupSettingsPatch {
    pub debounce: Option<DebouncePatch>,
    pub calendar: Option<CalendarPatch>,
    pub manual_keep_count: Option<u32>,
    pub webdav: Option<WebdavPatch>,
}
