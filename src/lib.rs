//! Navboard Vault
//!
//! Backup, integrity and restore pipeline for a self-hosted navigation
//! dashboard: signed zip snapshots of the instance state, debounce and
//! calendar triggers, WebDAV off-site sync and in-place restore.

pub mod archive;
pub mod config;
pub mod error;
pub mod remote;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod secrets;
pub mod store;
pub mod vault;

// Re-export commonly used types
pub use archive::signing::Verification;
pub use archive::{ArchiveInfo, ArchiveMetadata, BackupCategory};
pub use config::{BackupSettings, BackupSettingsPatch, VaultPaths};
pub use error::{Result, VaultError};
pub use remote::RemoteOutcome;
pub use restore::{RestoreOptions, RestoreReport};
pub use vault::{CategoryStats, ImportOutcome, Tier, Vault, VaultStats};
