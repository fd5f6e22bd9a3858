use std::path::Path;

use anyhow::Result;
use sqlx::sqlite::SqlitePool;
use sqlx::SqliteConnection;
use tracing::info;

use crate::finish_transaction;

use vigilare_core::config::{CRAWL_EPOCH, RESERVATION_LEASE_MINUTES, UNKNOWN_DOMAIN_RANK};

/// One completed crawl outcome headed for the `visited` table.
#[derive(Debug)]
pub struct VisitedRow {
    pub url: String,
    pub title: String,
    pub description: String,
    pub http_status: u16,
    pub out_links: u32,
    pub crawled_at: String,
    /// `h:`-prefixed SimHash.
    pub content_hash: String,
}

/// Per-statement batches drained from the write queue, applied in one
/// `BEGIN IMMEDIATE` transaction.
#[derive(Debug, Default)]
pub struct CrawlBatch {
    pub visited: Vec<VisitedRow>,
    /// (status, next_crawl_time, url)
    pub status: Vec<(i64, String, String)>,
    /// (source_domain, target_domain, source_url, target_url)
    pub links: Vec<(String, String, String, String)>,
    /// (url, domain) rows newly discovered for the frontier.
    pub frontier: Vec<(String, String)>,
    pub reserves: Vec<String>,
    /// (retry_count, url)
    pub retries: Vec<(u32, String)>,
    /// (next_crawl_time, url)
    pub reschedules: Vec<(String, String)>,
}

impl CrawlBatch {
    pub fn is_empty(&self) -> bool {
        self.visited.is_empty()
            && self.status.is_empty()
            && self.links.is_empty()
            && self.frontier.is_empty()
            && self.reserves.is_empty()
            && self.retries.is_empty()
            && self.reschedules.is_empty()
    }
}

/// Store over the crawl database: frontier, visited metadata, link graph.
#[derive(Clone)]
pub struct CrawlStore {
    pool: SqlitePool,
}

impl CrawlStore {
    pub async fn open_writer(path: &Path) -> Result<Self> {
        Ok(Self { pool: crate::open_writer_pool(path).await? })
    }

    pub async fn open_reader(path: &Path) -> Result<Self> {
        Ok(Self { pool: crate::open_reader_pool(path, 4).await? })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../migrations/crawl.sql"))
            .execute(&self.pool)
            .await?;
        info!("crawl migrations complete");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Startup recovery: reservations from a previous run are stale.
    pub async fn recover_stale_reservations(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE frontier SET status = 0 WHERE status = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_frontier(&self, rows: &[(String, String)]) -> Result<u64> {
        let mut inserted = 0;
        for (url, domain) in rows {
            let result =
                sqlx::query("INSERT OR IGNORE INTO frontier (url, domain) VALUES (?, ?)")
                    .bind(url)
                    .bind(domain)
                    .execute(&self.pool)
                    .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    /// Rows eligible for dispatch: pending, or active past the reservation
    /// lease. Ordered by priority (retries sit at 50, fresh rows at 100).
    pub async fn select_dispatchable(&self, limit: i64) -> Result<Vec<(String, u32)>> {
        let sql = format!(
            "SELECT url, retry_count FROM frontier \
             WHERE status = 0 \
             OR (status = 1 AND reserved_at < datetime('now', '-{RESERVATION_LEASE_MINUTES} minutes')) \
             ORDER BY priority ASC \
             LIMIT ?"
        );
        let rows: Vec<(String, i64)> =
            sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(url, rc)| (url, rc as u32)).collect())
    }

    /// Apply one writer batch atomically. The transaction is rolled back
    /// on any statement failure.
    pub async fn apply(&self, batch: &CrawlBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result = apply_statements(&mut conn, batch).await;
        finish_transaction(&mut conn, result).await
    }

    /// Seed the writer's in-memory duplicate set from prior runs.
    pub async fn load_content_hashes(&self, limit: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT content_hash FROM visited WHERE content_hash IS NOT NULL LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(h,)| h).collect())
    }

    /// (language, url) pairs from the indexer.
    pub async fn update_languages(&self, updates: &[(String, String)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result = async {
            for (language, url) in updates {
                sqlx::query("UPDATE visited SET language = ? WHERE url = ?")
                    .bind(language)
                    .bind(url)
                    .execute(&mut *conn)
                    .await?;
            }
            Ok(())
        }
        .await;
        finish_transaction(&mut conn, result).await
    }

    /// All (source_url, target_url) edges for the PageRank job.
    pub async fn link_edges(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT source_url, target_url FROM link_graph")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// (score, url) pairs from the PageRank job.
    pub async fn update_page_ranks(&self, updates: &[(f64, String)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result = async {
            for (score, url) in updates {
                sqlx::query("UPDATE visited SET page_rank = ? WHERE url = ?")
                    .bind(score)
                    .bind(url)
                    .execute(&mut *conn)
                    .await?;
            }
            Ok(())
        }
        .await;
        finish_transaction(&mut conn, result).await
    }

    pub async fn wal_checkpoint_truncate(&self) -> Result<()> {
        crate::wal_checkpoint_truncate(&self.pool).await
    }
}

async fn apply_statements(conn: &mut SqliteConnection, batch: &CrawlBatch) -> Result<()> {
    for row in &batch.visited {
        sqlx::query(
            "INSERT OR REPLACE INTO visited \
             (url, title, description, http_status, language, out_links, crawled_at, \
              crawl_epoch, last_seen_epoch, domain_rank, page_rank, content_hash) \
             VALUES (?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, 0.0, ?)",
        )
        .bind(&row.url)
        .bind(&row.title)
        .bind(&row.description)
        .bind(i64::from(row.http_status))
        .bind(i64::from(row.out_links))
        .bind(&row.crawled_at)
        .bind(CRAWL_EPOCH)
        .bind(CRAWL_EPOCH)
        .bind(UNKNOWN_DOMAIN_RANK)
        .bind(&row.content_hash)
        .execute(&mut *conn)
        .await?;
    }

    for (status, next_crawl_time, url) in &batch.status {
        sqlx::query("UPDATE frontier SET status = ?, next_crawl_time = ? WHERE url = ?")
            .bind(status)
            .bind(next_crawl_time)
            .bind(url)
            .execute(&mut *conn)
            .await?;
    }

    for (source_domain, target_domain, source_url, target_url) in &batch.links {
        sqlx::query(
            "INSERT OR IGNORE INTO link_graph \
             (source_domain, target_domain, source_url, target_url) VALUES (?, ?, ?, ?)",
        )
        .bind(source_domain)
        .bind(target_domain)
        .bind(source_url)
        .bind(target_url)
        .execute(&mut *conn)
        .await?;
    }

    for (url, domain) in &batch.frontier {
        sqlx::query("INSERT OR IGNORE INTO frontier (url, domain) VALUES (?, ?)")
            .bind(url)
            .bind(domain)
            .execute(&mut *conn)
            .await?;
    }

    // `status < 2` keeps terminal rows terminal: a stale message from a
    // double-dispatched URL must never resurrect a completed or failed row.
    for url in &batch.reserves {
        sqlx::query(
            "UPDATE frontier SET status = 1, reserved_at = CURRENT_TIMESTAMP \
             WHERE url = ? AND status < 2",
        )
        .bind(url)
        .execute(&mut *conn)
        .await?;
    }

    for (retry_count, url) in &batch.retries {
        sqlx::query(
            "UPDATE frontier SET status = 0, priority = 50, retry_count = ? \
             WHERE url = ? AND status < 2",
        )
        .bind(i64::from(*retry_count))
        .bind(url)
        .execute(&mut *conn)
        .await?;
    }

    for (next_crawl_time, url) in &batch.reschedules {
        sqlx::query(
            "UPDATE frontier SET status = 0, next_crawl_time = ? WHERE url = ? AND status < 2",
        )
        .bind(next_crawl_time)
        .bind(url)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigilare_core::sql_now;

    async fn store() -> (tempfile::TempDir, CrawlStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CrawlStore::open_writer(&dir.path().join("crawl.db")).await.unwrap();
        store.migrate().await.unwrap();
        (dir, store)
    }

    fn visited(url: &str) -> VisitedRow {
        VisitedRow {
            url: url.to_string(),
            title: "t".into(),
            description: "d".into(),
            http_status: 200,
            out_links: 0,
            crawled_at: sql_now(),
            content_hash: "h:00000000deadbeef".into(),
        }
    }

    #[tokio::test]
    async fn frontier_insert_is_idempotent() {
        let (_dir, store) = store().await;
        let rows = vec![("https://example.com".to_string(), "example.com".to_string())];
        assert_eq!(store.insert_frontier(&rows).await.unwrap(), 1);
        assert_eq!(store.insert_frontier(&rows).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reserve_removes_row_from_dispatch_until_lease_expires() {
        let (_dir, store) = store().await;
        store
            .insert_frontier(&[("https://example.com/a".to_string(), "example.com".to_string())])
            .await
            .unwrap();

        let rows = store.select_dispatchable(10).await.unwrap();
        assert_eq!(rows.len(), 1);

        let mut batch = CrawlBatch::default();
        batch.reserves.push("https://example.com/a".to_string());
        store.apply(&batch).await.unwrap();

        // Freshly reserved: inside the lease window, not dispatchable.
        assert!(store.select_dispatchable(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_resets_active_rows() {
        let (_dir, store) = store().await;
        store
            .insert_frontier(&[("https://example.com/a".to_string(), "example.com".to_string())])
            .await
            .unwrap();
        let mut batch = CrawlBatch::default();
        batch.reserves.push("https://example.com/a".to_string());
        store.apply(&batch).await.unwrap();

        assert_eq!(store.recover_stale_reservations().await.unwrap(), 1);
        assert_eq!(store.select_dispatchable(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retries_move_ahead_of_fresh_rows() {
        let (_dir, store) = store().await;
        store
            .insert_frontier(&[
                ("https://example.com/fresh".to_string(), "example.com".to_string()),
                ("https://example.com/retry".to_string(), "example.com".to_string()),
            ])
            .await
            .unwrap();

        let mut batch = CrawlBatch::default();
        batch.retries.push((1, "https://example.com/retry".to_string()));
        store.apply(&batch).await.unwrap();

        let rows = store.select_dispatchable(10).await.unwrap();
        assert_eq!(rows[0], ("https://example.com/retry".to_string(), 1));
    }

    #[tokio::test]
    async fn terminal_rows_stay_terminal() {
        let (_dir, store) = store().await;
        store
            .insert_frontier(&[("https://example.com/done".to_string(), "example.com".to_string())])
            .await
            .unwrap();

        let mut batch = CrawlBatch::default();
        batch.status.push((2, sql_now(), "https://example.com/done".to_string()));
        store.apply(&batch).await.unwrap();

        // A stale retry from a double-dispatch must not resurrect the row.
        let mut batch = CrawlBatch::default();
        batch.retries.push((1, "https://example.com/done".to_string()));
        batch.reserves.push("https://example.com/done".to_string());
        store.apply(&batch).await.unwrap();

        assert!(store.select_dispatchable(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn visited_is_replaced_by_url() {
        let (_dir, store) = store().await;
        let mut batch = CrawlBatch::default();
        batch.visited.push(visited("https://example.com/a"));
        store.apply(&batch).await.unwrap();
        // Second crawl of the same URL replaces, never duplicates.
        let mut batch = CrawlBatch::default();
        batch.visited.push(visited("https://example.com/a"));
        store.apply(&batch).await.unwrap();

        let hashes = store.load_content_hashes(10).await.unwrap();
        assert_eq!(hashes.len(), 1);
        assert!(hashes[0].starts_with("h:"));
    }

    #[tokio::test]
    async fn link_graph_ignores_duplicate_edges() {
        let (_dir, store) = store().await;
        let edge = (
            "a.com".to_string(),
            "b.com".to_string(),
            "https://a.com".to_string(),
            "https://b.com".to_string(),
        );
        let mut batch = CrawlBatch::default();
        batch.links.push(edge.clone());
        batch.links.push(edge);
        store.apply(&batch).await.unwrap();

        assert_eq!(store.link_edges().await.unwrap().len(), 1);
    }
}
