//! Live store connection handling.
//!
//! The dashboard's relational store is external to the pipeline; the vault
//! only needs to close it before a restore swaps its on-disk files and to
//! reconnect afterwards. [`StoreHandle`] wraps the sqlite pool behind that
//! close/reopen seam. Files can't be safely overwritten under an open
//! connection on platforms that lock them, so the pool is fully dropped
//! during the swap window.

use crate::error::{Result, VaultError};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Database file name inside the database directory.
pub const STORE_FILE: &str = "navboard.db";

pub struct StoreHandle {
    db_path: PathBuf,
    pool: Mutex<Option<DbPool>>,
}

impl StoreHandle {
    pub fn new(database_dir: &Path) -> Self {
        Self {
            db_path: database_dir.join(STORE_FILE),
            pool: Mutex::new(None),
        }
    }

    pub fn db_file(&self) -> &Path {
        &self.db_path
    }

    /// Opens the pool if it is not already open.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.pool.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(create_pool(&self.db_path)?);
        tracing::info!(db = %self.db_path.display(), "Store connected");
        Ok(())
    }

    /// Hands out a pool clone for query use. Callers must not hold a clone
    /// across a restore window.
    pub async fn pool(&self) -> Result<DbPool> {
        self.pool
            .lock()
            .await
            .clone()
            .ok_or_else(|| VaultError::Store("store connection is closed".into()))
    }

    /// Checkpoints and drops the pool, releasing every file handle.
    pub async fn close(&self) {
        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool {
            // Checkpoint just in case (no-op in DELETE journal mode).
            if let Ok(conn) = pool.get() {
                let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
            }
            drop(pool);
            tracing::info!(db = %self.db_path.display(), "Store connection closed");
        }
    }

    /// Closes (if open) and opens a fresh pool against the current on-disk
    /// state. Used by the restore reconnect step.
    pub async fn reopen(&self) -> Result<()> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.take() {
            if let Ok(conn) = pool.get() {
                let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
            }
        }
        *guard = Some(create_pool(&self.db_path)?);
        tracing::info!(db = %self.db_path.display(), "Store reconnected");
        Ok(())
    }
}

fn create_pool(db_path: &Path) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(db_path);
    let pool = Pool::builder().max_size(4).build(manager)?;

    // Configure pragmas on a fresh connection
    let conn = pool.get()?;
    conn.execute_batch(
        "PRAGMA journal_mode = DELETE;
         PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;",
    )?;

    Ok(pool)
}
