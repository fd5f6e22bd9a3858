//! End-to-end query-engine flows over real on-disk stores: candidate
//! retrieval joins the crawl database, fallback and spelling kick in on
//! thin result sets, and navigational queries surface the brand root.

use std::collections::HashMap;

use vigilare_core::sql_now;
use vigilare_search::SearchEngine;
use vigilare_storage::{CrawlBatch, CrawlStore, DataPaths, SearchDoc, SearchStore, VisitedRow};

fn visited(url: &str, title: &str) -> VisitedRow {
    VisitedRow {
        url: url.to_string(),
        title: title.to_string(),
        description: String::new(),
        http_status: 200,
        out_links: 0,
        crawled_at: sql_now(),
        content_hash: format!("h:{:016x}", url.len()),
    }
}

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

async fn engine_with(
    dir: &std::path::Path,
    pages: Vec<(SearchDoc, VisitedRow)>,
    vocab: HashMap<String, i64>,
) -> SearchEngine {
    let paths = DataPaths::new(dir);
    paths.ensure_dirs().unwrap();

    let crawl = CrawlStore::open_writer(&paths.crawl_db()).await.unwrap();
    crawl.migrate().await.unwrap();
    let search = SearchStore::open_writer(&paths.search_db()).await.unwrap();
    search.migrate().await.unwrap();

    let mut batch = CrawlBatch::default();
    let mut docs = Vec::new();
    for (d, v) in pages {
        batch.visited.push(v);
        docs.push(d);
    }
    crawl.apply(&batch).await.unwrap();
    search.index_documents(&docs, &vocab).await.unwrap();
    crawl.close().await;
    search.close().await;

    let reader = SearchStore::open_reader(&paths.search_db(), &paths.crawl_db()).await.unwrap();
    SearchEngine::new(reader)
}

#[tokio::test]
async fn fallback_and_spelling_for_misspelled_query() {
    let dir = tempfile::tempdir().unwrap();
    let pages = vec![
        (
            doc(
                "https://docs.example.com/python",
                "Install Python",
                "how to install python on linux step by step",
            ),
            visited("https://docs.example.com/python", "Install Python"),
        ),
        (
            doc(
                "https://wiki.example.org/setup",
                "Python setup guide",
                "a guide to install the python toolchain",
            ),
            visited("https://wiki.example.org/setup", "Python setup guide"),
        ),
    ];
    let mut vocab = HashMap::new();
    vocab.insert("install".to_string(), 5);
    vocab.insert("python".to_string(), 5);
    vocab.insert("guide".to_string(), 2);

    let engine = engine_with(dir.path(), pages, vocab).await;
    let resp = engine.search("instal pyhton", 1, "en").await;

    assert_eq!(resp.suggestion.as_deref(), Some("install python"));
    // The OR fallback still surfaces the install docs.
    assert!(!resp.results.is_empty());
    assert!(resp.count >= 2);
}

#[tokio::test]
async fn navigational_query_puts_brand_root_first() {
    let dir = tempfile::tempdir().unwrap();
    let pages = vec![
        (
            doc(
                "https://github.com/a/b/c/d?tab=repos",
                "some repository on GitHub",
                "github repository page with code and issues",
            ),
            visited("https://github.com/a/b/c/d?tab=repos", "some repository on GitHub"),
        ),
        (
            doc(
                "https://github.com/",
                "GitHub: where the world builds software",
                "github is where over 100 million developers shape the future of software",
            ),
            visited("https://github.com/", "GitHub: where the world builds software"),
        ),
        (
            doc(
                "https://example.com/about-github",
                "an article about GitHub",
                "a blog post discussing github and its history",
            ),
            visited("https://example.com/about-github", "an article about GitHub"),
        ),
    ];

    let engine = engine_with(dir.path(), pages, HashMap::new()).await;
    let resp = engine.search("github", 1, "en").await;

    assert!(resp.results.len() >= 3);
    assert_eq!(resp.results[0].url, "https://github.com/");
    assert_eq!(resp.results[0].domain, "github.com");
    assert_eq!(resp.page, 1);
    assert_eq!(resp.total_pages, 1);
    assert!(resp.suggestion.is_none());
}

#[tokio::test]
async fn suggest_returns_matching_titles() {
    let dir = tempfile::tempdir().unwrap();
    let pages = vec![
        (
            doc("https://github.com/", "GitHub home", "github"),
            visited("https://github.com/", "GitHub home"),
        ),
        (
            doc("https://gitlab.com/", "GitLab home", "gitlab"),
            visited("https://gitlab.com/", "GitLab home"),
        ),
    ];

    let engine = engine_with(dir.path(), pages, HashMap::new()).await;

    let titles = engine.suggest("Git").await;
    assert_eq!(titles.len(), 2);

    // Inputs under two characters return nothing.
    assert!(engine.suggest("g").await.is_empty());
}

#[tokio::test]
async fn empty_query_yields_empty_response() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(dir.path(), Vec::new(), HashMap::new()).await;

    let resp = engine.search("   ", 1, "en").await;
    assert!(resp.results.is_empty());
    assert_eq!(resp.count, 0);
    assert!(resp.suggestion.is_none());
}
