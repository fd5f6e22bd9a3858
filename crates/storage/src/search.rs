use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

/// One document headed for the full-text index.
#[derive(Debug)]
pub struct SearchDoc {
    pub url: String,
    pub title: String,
    pub description: String,
    pub content: String,
    pub h1: String,
    pub h2: String,
    pub important_text: String,
}

/// Candidate row from the FTS join against the crawl database.
#[derive(Debug, Clone)]
pub struct CandidateRow {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content_sample: Option<String>,
    pub crawled_at: Option<String>,
    pub language: Option<String>,
    pub domain_rank: Option<i64>,
    pub page_rank: Option<f64>,
    pub bm25: f64,
}

/// Store over the search database: the FTS5 index and the learned
/// vocabulary. The query-side pool attaches the crawl database so
/// candidates can join against `visited` in one statement.
#[derive(Clone)]
pub struct SearchStore {
    pool: SqlitePool,
}

impl SearchStore {
    /// Indexer-side handle (writes, no attached crawl database).
    pub async fn open_writer(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(60));

        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Query-side handle with `crawl_db` attached on every connection.
    pub async fn open_reader(path: &Path, crawl_db: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(10));

        let attach = format!(
            "ATTACH DATABASE '{}' AS crawl_db",
            crawl_db.display().to_string().replace('\'', "''")
        );

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .after_connect(move |conn, _meta| {
                let attach = attach.clone();
                Box::pin(async move {
                    sqlx::query(&attach).execute(conn).await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../migrations/search.sql"))
            .execute(&self.pool)
            .await?;
        info!("search migrations complete");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Index a batch and fold its term counts into the vocabulary, in one
    /// transaction. Documents are deleted by URL first so re-processing
    /// after a crash collapses duplicates.
    pub async fn index_documents(
        &self,
        docs: &[SearchDoc],
        vocab_counts: &HashMap<String, i64>,
    ) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result = async {
            for doc in docs {
                sqlx::query("DELETE FROM search_index WHERE url = ?")
                    .bind(&doc.url)
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(
                    "INSERT INTO search_index \
                     (url, title, description, content, h1, h2, important_text) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&doc.url)
                .bind(&doc.title)
                .bind(&doc.description)
                .bind(&doc.content)
                .bind(&doc.h1)
                .bind(&doc.h2)
                .bind(&doc.important_text)
                .execute(&mut *conn)
                .await?;
            }

            for (term, count) in vocab_counts {
                sqlx::query(
                    "INSERT INTO search_vocab (term, doc_freq) VALUES (?, ?) \
                     ON CONFLICT(term) DO UPDATE SET doc_freq = doc_freq + excluded.doc_freq",
                )
                .bind(term)
                .bind(count)
                .execute(&mut *conn)
                .await?;
            }
            Ok(())
        }
        .await;
        crate::finish_transaction(&mut conn, result).await
    }

    pub async fn candidates(&self, fts_query: &str, limit: i64) -> Result<Vec<CandidateRow>> {
        let rows: Vec<(
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<i64>,
            Option<f64>,
            f64,
        )> = sqlx::query_as(
            "SELECT \
                 search_index.url, \
                 search_index.title, \
                 search_index.description, \
                 substr(search_index.content, 1, 5000) AS content_sample, \
                 crawl_db.visited.crawled_at, \
                 crawl_db.visited.language, \
                 crawl_db.visited.domain_rank, \
                 crawl_db.visited.page_rank, \
                 bm25(search_index) AS bm25 \
             FROM search_index \
             JOIN crawl_db.visited ON search_index.url = crawl_db.visited.url \
             WHERE search_index MATCH ? \
             LIMIT ?",
        )
        .bind(fts_query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(url, title, description, content_sample, crawled_at, language, domain_rank, page_rank, bm25)| {
                    CandidateRow {
                        url,
                        title,
                        description,
                        content_sample,
                        crawled_at,
                        language,
                        domain_rank,
                        page_rank,
                        bm25,
                    }
                },
            )
            .collect())
    }

    pub async fn vocab_contains(&self, term: &str) -> Result<bool> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM search_vocab WHERE term = ?")
            .bind(term)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 > 0)
    }

    /// Up to `limit` vocabulary terms sharing a first letter, for the
    /// spelling corrector.
    pub async fn vocab_candidates(&self, first_letter: char, limit: i64) -> Result<Vec<String>> {
        let pattern = format!("{first_letter}%");
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT term FROM search_vocab WHERE term LIKE ? LIMIT ?")
                .bind(pattern)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    /// Title autocomplete over the attached crawl database.
    pub async fn suggest_titles(&self, query: &str, limit: i64) -> Result<Vec<String>> {
        let pattern = format!("%{query}%");
        let rows: Vec<(Option<String>,)> =
            sqlx::query_as("SELECT title FROM crawl_db.visited WHERE title LIKE ? LIMIT ?")
                .bind(pattern)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().filter_map(|(t,)| t).filter(|t| !t.is_empty()).collect())
    }

    pub async fn wal_checkpoint_truncate(&self) -> Result<()> {
        crate::wal_checkpoint_truncate(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(url: &str, title: &str, content: &str) -> SearchDoc {
        SearchDoc {
            url: url.to_string(),
            title: title.to_string(),
            description: String::new(),
            content: content.to_string(),
            h1: String::new(),
            h2: String::new(),
            important_text: String::new(),
        }
    }

    #[tokio::test]
    async fn reindexing_same_url_collapses_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = SearchStore::open_writer(&dir.path().join("search.db")).await.unwrap();
        store.migrate().await.unwrap();

        let vocab = HashMap::new();
        store
            .index_documents(&[doc("https://a.com", "rust guide", "install rust")], &vocab)
            .await
            .unwrap();
        store
            .index_documents(&[doc("https://a.com", "rust guide", "install rust today")], &vocab)
            .await
            .unwrap();

        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM search_index WHERE url = ?")
            .bind("https://a.com")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }

    #[tokio::test]
    async fn vocab_upsert_is_additive() {
        let dir = tempfile::tempdir().unwrap();
        let store = SearchStore::open_writer(&dir.path().join("search.db")).await.unwrap();
        store.migrate().await.unwrap();

        let mut vocab = HashMap::new();
        vocab.insert("rust".to_string(), 2i64);
        store.index_documents(&[doc("https://a.com", "t", "c")], &vocab).await.unwrap();
        store.index_documents(&[doc("https://b.com", "t", "c")], &vocab).await.unwrap();

        let row: (i64,) = sqlx::query_as("SELECT doc_freq FROM search_vocab WHERE term = 'rust'")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 4);
        assert!(store.vocab_contains("rust").await.unwrap());
        assert_eq!(store.vocab_candidates('r', 50).await.unwrap(), vec!["rust"]);
    }
}
