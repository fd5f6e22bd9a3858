pub mod crawl;
pub mod pages;
pub mod search;

pub use crawl::{CrawlBatch, CrawlStore, VisitedRow};
pub use pages::{PageStore, StorageDoc, StorageRow};
pub use search::{CandidateRow, SearchDoc, SearchStore};

use std::path::{Path, PathBuf};

use anyhow::Result;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

/// Filesystem layout under the configured data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    data_dir: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self { data_dir: data_dir.to_path_buf() }
    }

    pub fn crawl_db(&self) -> PathBuf {
        self.data_dir.join("vigilare_crawl.db")
    }

    pub fn storage_db(&self) -> PathBuf {
        self.data_dir.join("vigilare_storage.db")
    }

    pub fn search_db(&self) -> PathBuf {
        self.data_dir.join("vigilare_search.db")
    }

    pub fn bloom_snapshot(&self) -> PathBuf {
        self.data_dir.join("bloom.snapshot")
    }

    pub fn indexer_state(&self) -> PathBuf {
        self.data_dir.join("indexer_state.txt")
    }

    pub fn icons_dir(&self) -> PathBuf {
        self.data_dir.join("icons")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.icons_dir())
    }
}

/// Writer pool: exactly one connection, WAL journal, `synchronous=OFF`.
/// Each database has a single writer task, so one connection is all a
/// writer ever needs and transactions can never interleave.
pub(crate) async fn open_writer_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Off)
        .busy_timeout(std::time::Duration::from_secs(60));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Reader pool: read-only URI mode so readers can never block the writer
/// beyond an individual statement.
pub(crate) async fn open_reader_pool(path: &Path, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Commit on success, roll back on failure, so an aborted batch never
/// leaves an open transaction on a pooled connection.
pub(crate) async fn finish_transaction(
    conn: &mut sqlx::SqliteConnection,
    result: Result<()>,
) -> Result<()> {
    match result {
        Ok(()) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(())
        }
        Err(e) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(e)
        }
    }
}

pub(crate) async fn wal_checkpoint_truncate(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await?;
    Ok(())
}

/// One-shot WAL truncate against an existing database file.
pub async fn checkpoint_database(path: &Path) -> Result<()> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(60));

    let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
    wal_checkpoint_truncate(&pool).await?;
    pool.close().await;
    Ok(())
}
