use std::path::Path;

use anyhow::Result;
use sqlx::sqlite::SqlitePool;
use tracing::info;

/// One page headed for `html_storage`.
#[derive(Debug)]
pub struct StorageRow {
    pub url: String,
    pub raw_html: Vec<u8>,
    pub parsed_text: String,
    pub title: String,
    pub http_headers: String,
    pub crawled_at: String,
}

/// A stored page as read back by the indexer.
#[derive(Debug)]
pub struct StorageDoc {
    pub rowid: i64,
    pub url: String,
    pub parsed_text: Option<String>,
    pub title: Option<String>,
}

/// Store over the storage database: compressed HTML plus parsed text,
/// keyed by URL, with the implicit rowid as the indexing cursor.
#[derive(Clone)]
pub struct PageStore {
    pool: SqlitePool,
}

impl PageStore {
    pub async fn open_writer(path: &Path) -> Result<Self> {
        Ok(Self { pool: crate::open_writer_pool(path).await? })
    }

    pub async fn open_reader(path: &Path) -> Result<Self> {
        Ok(Self { pool: crate::open_reader_pool(path, 2).await? })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../migrations/storage.sql"))
            .execute(&self.pool)
            .await?;
        info!("storage migrations complete");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn insert_pages(&self, rows: &[StorageRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result = async {
            for row in rows {
                sqlx::query(
                    "INSERT OR REPLACE INTO html_storage \
                     (url, raw_html, parsed_text, title, http_headers, crawled_at) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&row.url)
                .bind(&row.raw_html)
                .bind(&row.parsed_text)
                .bind(&row.title)
                .bind(&row.http_headers)
                .bind(&row.crawled_at)
                .execute(&mut *conn)
                .await?;
            }
            Ok(())
        }
        .await;
        crate::finish_transaction(&mut conn, result).await
    }

    pub async fn max_rowid(&self) -> Result<i64> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(rowid) FROM html_storage")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.unwrap_or(0))
    }

    pub async fn select_unindexed(&self, last_id: i64, limit: i64) -> Result<Vec<StorageDoc>> {
        let rows: Vec<(i64, String, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT rowid, url, parsed_text, title FROM html_storage \
             WHERE rowid > ? AND parsed_text IS NOT NULL \
             ORDER BY rowid ASC LIMIT ?",
        )
        .bind(last_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(rowid, url, parsed_text, title)| StorageDoc { rowid, url, parsed_text, title })
            .collect())
    }

    pub async fn wal_checkpoint_truncate(&self) -> Result<()> {
        crate::wal_checkpoint_truncate(&self.pool).await
    }
}
