//! Keep-count retention for local and remote archives.
//!
//! Eviction keeps the newest `keep` archives of a category and deletes the
//! rest. Running twice with the same keep-count deletes nothing the second
//! time, and deleting an archive that is already gone is tolerated since the
//! debounce and calendar triggers can race on the same directory.

use crate::archive::{list_local, sidecar_name, BackupCategory};
use crate::error::Result;
use crate::remote::WebdavClient;
use std::path::Path;
use tracing::{debug, info, warn};

/// Removes local archives of `category` beyond the newest `keep`, returning
/// the evicted file names. `keep == 0` removes every matching archive.
pub fn evict_local(backups_dir: &Path, category: BackupCategory, keep: u32) -> Result<Vec<String>> {
    let archives = list_local(backups_dir)?;
    let mut evicted = Vec::new();

    for info in archives
        .into_iter()
        .filter(|a| a.category == category)
        .skip(keep as usize)
    {
        let Some(path) = info.local_path else { continue };
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            // A concurrent trigger may have evicted it first.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let sidecar = path.with_file_name(sidecar_name(&info.name));
        if sidecar.exists() {
            if let Err(e) = std::fs::remove_file(&sidecar) {
                warn!(sidecar = %sidecar.display(), error = %e, "failed to remove signature sidecar");
            }
        }

        debug!(archive = %info.name, "evicted local archive");
        evicted.push(info.name);
    }

    if !evicted.is_empty() {
        info!(
            category = category.as_str(),
            keep,
            evicted = evicted.len(),
            "local retention applied"
        );
    }
    Ok(evicted)
}

/// Filters and orders remote names for eviction. Remote listings carry no
/// usable modification time, but archive names embed their UTC creation
/// timestamp, so descending name order is descending age order within a
/// category.
fn remote_evictable(names: Vec<String>, category: BackupCategory, keep: u32) -> Vec<String> {
    let mut matching: Vec<String> = names
        .into_iter()
        .filter(|n| category.matches(n))
        .collect();
    matching.sort_by(|a, b| b.cmp(a));
    matching.into_iter().skip(keep as usize).collect()
}

/// Removes remote archives of `category` beyond the newest `keep`. Per-file
/// deletion failures are logged and skipped so one stuck file cannot block
/// eviction of the rest.
pub async fn evict_remote(
    client: &WebdavClient,
    category: BackupCategory,
    keep: u32,
) -> Result<Vec<String>> {
    let names = client.list().await?;
    let mut evicted = Vec::new();

    for name in remote_evictable(names, category, keep) {
        if let Err(e) = client.delete(&name).await {
            warn!(archive = %name, error = %e, "remote eviction failed, skipping file");
            continue;
        }
        debug!(archive = %name, "evicted remote archive");
        evicted.push(name);
    }

    if !evicted.is_empty() {
        info!(
            category = category.as_str(),
            keep,
            evicted = evicted.len(),
            "remote retention applied"
        );
    }
    Ok(evicted)
}
