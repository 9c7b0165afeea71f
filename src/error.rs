//! Error types for the vault pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Archive {name} is unreadable: {reason}")]
    ArchiveUnreadable { name: String, reason: String },

    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("Invalid archive name: {0}")]
    InvalidName(String),

    #[error("Archive {0} carries no signature")]
    SignatureMissing(String),

    #[error("Signature verification failed for {0}")]
    SignatureMismatch(String),

    #[error("Archive content rejected: {0}")]
    ContentRejected(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote target error: {0}")]
    Remote(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Store pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Store query error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),

    #[error("Restore error: {0}")]
    Restore(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, VaultError>;
