use std::io;
use std::path::PathBuf;

use driftbay_session::SessionRegistry;

pub mod multipart;
pub mod store;
pub mod writer;

pub use multipart::*;
pub use store::*;
pub use writer::*;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            scratch_dir: PathBuf::from("./scratch"),
        }
    }
}

/// Removes scratch state (spools, part directories) whose session is gone —
/// purged after its retention window, or lost to a restart before finishing.
pub async fn sweep_orphans(
    registry: &SessionRegistry,
    store: &LocalStore,
) -> io::Result<Vec<String>> {
    let mut removed = Vec::new();
    for upload_id in store.scratch_ids().await? {
        if registry.get(&upload_id).is_err() {
            store.remove_scratch(&upload_id).await?;
            removed.push(upload_id);
        }
    }
    if !removed.is_empty() {
        tracing::info!(count = removed.len(), "swept orphaned upload scratch");
    }
    Ok(removed)
}
