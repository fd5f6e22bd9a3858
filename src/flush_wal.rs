use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use vigilare_core::AppConfig;
use vigilare_storage::{checkpoint_database, DataPaths};

/// Force a `wal_checkpoint(TRUNCATE)` on each database. Useful when a
/// crawler or indexer crash left large `-wal` files behind.
pub async fn run_flush_wal(config: AppConfig) -> Result<()> {
    let paths = DataPaths::new(&config.data_dir());

    for (name, path) in [
        ("crawl", paths.crawl_db()),
        ("storage", paths.storage_db()),
        ("search", paths.search_db()),
    ] {
        flush_one(name, &path).await;
    }
    Ok(())
}

async fn flush_one(name: &str, path: &Path) {
    if !path.exists() {
        info!(name, "no database file, skipping");
        return;
    }

    let wal_path = format!("{}-wal", path.display());
    match std::fs::metadata(&wal_path) {
        Ok(meta) => info!(name, wal_mb = meta.len() / (1024 * 1024), "checkpointing"),
        Err(_) => {
            info!(name, "no WAL file, already clean");
            return;
        }
    }

    if let Err(e) = checkpoint_database(path).await {
        warn!(name, "checkpoint failed: {e}");
        return;
    }

    match std::fs::metadata(&wal_path) {
        Ok(meta) if meta.len() > 1024 * 1024 => {
            warn!(name, wal_mb = meta.len() / (1024 * 1024), "WAL still large; another process may hold a lock");
        }
        _ => info!(name, "WAL drained"),
    }
}
