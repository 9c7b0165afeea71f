//! Signing-secret management.
//!
//! The signing secret is a per-instance random value stored inside the config
//! directory, which means every archive that snapshots the config directory
//! carries its creator's secret as the embedded fallback for cross-instance
//! verification. Access is get-or-create; the cached copy is invalidated
//! after a restore so the key is re-read from the restored state.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// File name of the signing secret inside the config directory.
pub const SECRET_FILE: &str = ".vault-key";

pub struct SecretStore {
    path: PathBuf,
    cached: Mutex<Option<String>>,
}

impl SecretStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(SECRET_FILE),
            cached: Mutex::new(None),
        }
    }

    /// Returns the instance secret, generating and persisting a fresh one on
    /// first use.
    pub async fn get_or_create(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(secret) = cached.as_ref() {
            return Ok(secret.clone());
        }

        let secret = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if !content.trim().is_empty() => content.trim().to_string(),
            _ => {
                let fresh = generate_secret();
                if let Some(parent) = self.path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&self.path, &fresh).await?;
                tracing::info!(path = %self.path.display(), "Generated new signing secret");
                fresh
            }
        };

        *cached = Some(secret.clone());
        Ok(secret)
    }

    /// Drops the cached copy so the next access re-reads the file. Called
    /// after a restore replaces the config directory.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

fn generate_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}
