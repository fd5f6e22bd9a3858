use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use once_cell::sync::Lazy;
use petgraph::graph::{DiGraph, NodeIndex};
use regex::Regex;
use tracing::{debug, error, info, warn};

use vigilare_core::AppConfig;
use vigilare_storage::{CrawlStore, DataPaths, PageStore, SearchDoc, SearchStore, StorageDoc};

const BATCH_SIZE: i64 = 2_500;
const MIN_BATCH_SIZE: i64 = 1_000;
/// A sub-minimum batch is processed anyway once this much time has passed.
const MAX_WAIT_TIME: Duration = Duration::from_secs(120);
const RECYCLE_CONN_EVERY: u32 = 100;
const PAGERANK_INTERVAL: Duration = Duration::from_secs(600);
const PAGERANK_DAMPING: f64 = 0.85;
const PAGERANK_ITERATIONS: usize = 100;
const PAGERANK_SCALE: f64 = 100_000.0;
const PAGERANK_LOCK_RETRIES: u32 = 3;
const TITLE_MAX_CHARS: usize = 80;
/// Text shorter than this is too thin for language detection.
const LANG_DETECT_MIN_CHARS: usize = 200;
const LANG_DETECT_SAMPLE_CHARS: usize = 1_000;
const VOCAB_SAMPLE_CHARS: usize = 500;

static VOCAB_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-z]{3,15}\b").unwrap());

struct IndexerStores {
    pages: PageStore,
    search: SearchStore,
    crawl: CrawlStore,
}

impl IndexerStores {
    async fn open(paths: &DataPaths) -> Result<Self> {
        let pages = PageStore::open_reader(&paths.storage_db()).await?;
        let search = SearchStore::open_writer(&paths.search_db()).await?;
        search.migrate().await?;
        let crawl = CrawlStore::open_writer(&paths.crawl_db()).await?;
        crawl.migrate().await?;
        Ok(Self { pages, search, crawl })
    }

    /// Close and reopen everything; long-lived SQLite connections end up
    /// holding WAL frames and locks forever.
    async fn recycle(&mut self, paths: &DataPaths) -> Result<()> {
        self.pages.close().await;
        self.search.close().await;
        self.crawl.close().await;
        *self = Self::open(paths).await?;
        debug!("recycled database connections");
        Ok(())
    }
}

pub async fn run_indexer(config: AppConfig) -> Result<()> {
    let paths = DataPaths::new(&config.data_dir());
    paths.ensure_dirs()?;

    let mut stores = IndexerStores::open(&paths).await?;
    let state_file = paths.indexer_state();
    let mut last_id = read_cursor(&state_file);
    info!(last_id, "indexer resuming from storage row id");

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("indexer stopping after current batch");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    let mut batch_counter = 0u32;
    let mut last_pagerank = Instant::now();
    let mut last_process = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        if batch_counter >= RECYCLE_CONN_EVERY {
            stores.recycle(&paths).await?;
            batch_counter = 0;
        }

        if last_pagerank.elapsed() > PAGERANK_INTERVAL {
            run_pagerank_job(&stores.crawl).await;
            last_pagerank = Instant::now();
        }

        // Hysteresis: wait for a worthwhile batch unless it has been quiet
        // for too long.
        let max_rowid = stores.pages.max_rowid().await.unwrap_or(last_id);
        let pending = max_rowid - last_id;
        if pending < MIN_BATCH_SIZE && last_process.elapsed() < MAX_WAIT_TIME {
            debug!(pending, "buffering until batch fills");
            tokio::time::sleep(Duration::from_secs(2)).await;
            continue;
        }

        let docs = match stores.pages.select_unindexed(last_id, BATCH_SIZE).await {
            Ok(docs) => docs,
            Err(e) => {
                sleep_for_db_error(&e).await;
                continue;
            }
        };
        if docs.is_empty() {
            debug!("waiting for new pages");
            tokio::time::sleep(Duration::from_secs(2)).await;
            continue;
        }

        let started = Instant::now();
        let count = docs.len();
        let first_id = docs[0].rowid;
        let batch = build_batch(docs);
        info!(count, first_id, "indexing batch");

        if let Err(e) = stores.search.index_documents(&batch.docs, &batch.vocab).await {
            sleep_for_db_error(&e).await;
            continue;
        }

        if let Err(e) = stores.crawl.update_languages(&batch.languages).await {
            warn!("language update failed (non-critical): {e}");
        }

        // The cursor advances only after the search commit; a crash before
        // this point re-processes the batch, which the URL-keyed delete
        // collapses.
        write_cursor(&state_file, batch.max_rowid)?;
        last_id = batch.max_rowid;
        batch_counter += 1;
        last_process = Instant::now();

        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { (count as f64 / elapsed) as u64 } else { 0 };
        info!(count, elapsed_s = format!("{elapsed:.2}"), rate, "batch indexed");
    }

    Ok(())
}

struct IndexBatch {
    docs: Vec<SearchDoc>,
    vocab: HashMap<String, i64>,
    /// (language, url) for rows with a detected language.
    languages: Vec<(String, String)>,
    max_rowid: i64,
}

fn build_batch(rows: Vec<StorageDoc>) -> IndexBatch {
    let mut docs = Vec::with_capacity(rows.len());
    let mut vocab: HashMap<String, i64> = HashMap::new();
    let mut languages = Vec::new();
    let mut max_rowid = 0;

    for row in rows {
        max_rowid = max_rowid.max(row.rowid);
        let text = row.parsed_text.unwrap_or_default();
        let title = choose_title(row.title.as_deref(), &text, &row.url);

        let learning_text =
            format!("{} {}", title, prefix_chars(&text, VOCAB_SAMPLE_CHARS)).to_lowercase();
        for m in VOCAB_RE.find_iter(&learning_text) {
            *vocab.entry(m.as_str().to_string()).or_insert(0) += 1;
        }

        if let Some(lang) = detect_language(&text) {
            languages.push((lang, row.url.clone()));
        }

        docs.push(SearchDoc {
            url: row.url,
            title,
            description: String::new(),
            content: text,
            h1: String::new(),
            h2: String::new(),
            important_text: String::new(),
        });
    }

    IndexBatch { docs, vocab, languages, max_rowid }
}

/// `title ?? first nonempty line of text ?? url`, truncated to 80 chars.
fn choose_title(title: Option<&str>, text: &str, url: &str) -> String {
    if let Some(t) = title.map(str::trim).filter(|t| !t.is_empty()) {
        return prefix_chars(t, TITLE_MAX_CHARS).to_string();
    }
    for line in text.lines().take(3) {
        let line = line.trim();
        if !line.is_empty() {
            return prefix_chars(line, TITLE_MAX_CHARS).to_string();
        }
    }
    prefix_chars(url, TITLE_MAX_CHARS).to_string()
}

fn detect_language(text: &str) -> Option<String> {
    if text.chars().count() <= LANG_DETECT_MIN_CHARS {
        return None;
    }
    let sample = prefix_chars(text, LANG_DETECT_SAMPLE_CHARS);
    whatlang::detect(sample).map(|info| info.lang().code().to_string())
}

fn prefix_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

async fn sleep_for_db_error(e: &anyhow::Error) {
    if is_locked_error(e) {
        tokio::time::sleep(Duration::from_secs(1)).await;
    } else {
        error!("indexer database error: {e}");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

fn is_locked_error(e: &anyhow::Error) -> bool {
    e.to_string().to_lowercase().contains("locked")
}

fn read_cursor(path: &Path) -> i64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Write-then-rename so a crash never leaves a torn cursor.
fn write_cursor(path: &Path, rowid: i64) -> std::io::Result<()> {
    let tmp: PathBuf = path.with_extension("tmp");
    std::fs::write(&tmp, rowid.to_string())?;
    std::fs::rename(&tmp, path)
}

/// Recompute PageRank over the harvested link graph and write the scaled
/// scores back to `visited`. Lock contention is retried with a 10 s pause.
pub async fn run_pagerank_job(crawl: &CrawlStore) {
    info!("starting pagerank calculation");
    for attempt in 1..=PAGERANK_LOCK_RETRIES {
        match try_pagerank(crawl).await {
            Ok(0) => return,
            Ok(updated) => {
                info!(updated, "pagerank scores written");
                return;
            }
            Err(e) if is_locked_error(&e) => {
                warn!(attempt, "database locked, waiting 10s");
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Err(e) => {
                error!("pagerank failed: {e}");
                return;
            }
        }
    }
    warn!("pagerank skipped; database busy after {PAGERANK_LOCK_RETRIES} attempts");
}

async fn try_pagerank(crawl: &CrawlStore) -> Result<usize> {
    let started = Instant::now();
    let edges = crawl.link_edges().await?;
    if edges.is_empty() {
        info!("link graph empty, skipping pagerank");
        return Ok(0);
    }

    let updates = pagerank_scores(&edges);
    crawl.update_page_ranks(&updates).await?;
    info!(
        edges = edges.len(),
        nodes = updates.len(),
        elapsed_s = format!("{:.2}", started.elapsed().as_secs_f64()),
        "pagerank computed"
    );
    Ok(updates.len())
}

/// (scaled score, url) pairs for every node in the edge list.
fn pagerank_scores(edges: &[(String, String)]) -> Vec<(f64, String)> {
    let mut graph: DiGraph<(), ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

    for (source, target) in edges {
        let a = *nodes.entry(source.as_str()).or_insert_with(|| graph.add_node(()));
        let b = *nodes.entry(target.as_str()).or_insert_with(|| graph.add_node(()));
        graph.add_edge(a, b, ());
    }

    let scores = petgraph::algo::page_rank(&graph, PAGERANK_DAMPING, PAGERANK_ITERATIONS);
    nodes
        .into_iter()
        .map(|(url, idx)| (scores[idx.index()] * PAGERANK_SCALE, url.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_fallback_chain() {
        assert_eq!(choose_title(Some("A Title"), "text", "https://u"), "A Title");
        assert_eq!(choose_title(None, "\n\nfirst line\nsecond", "https://u"), "first line");
        assert_eq!(choose_title(Some("  "), "", "https://u"), "https://u");

        let long = "x".repeat(200);
        assert_eq!(choose_title(Some(&long), "", "https://u").chars().count(), 80);
    }

    #[test]
    fn vocab_regex_matches_lowercase_words_3_to_15() {
        let text = "ab abc installation x1 supercalifragilisticexpialidocious rust";
        let found: Vec<&str> = VOCAB_RE.find_iter(text).map(|m| m.as_str()).collect();
        assert_eq!(found, vec!["abc", "installation", "rust"]);
    }

    #[test]
    fn short_text_skips_language_detection() {
        assert_eq!(detect_language("too short"), None);
        let english = "This is a long passage of English text. ".repeat(10);
        assert_eq!(detect_language(&english).as_deref(), Some("eng"));
    }

    #[test]
    fn pagerank_favors_link_targets() {
        let edges: Vec<(String, String)> = vec![
            ("https://a.com".into(), "https://hub.com".into()),
            ("https://b.com".into(), "https://hub.com".into()),
            ("https://c.com".into(), "https://hub.com".into()),
            ("https://hub.com".into(), "https://a.com".into()),
        ];
        let scores = pagerank_scores(&edges);
        let score_of = |url: &str| {
            scores.iter().find(|(_, u)| u == url).map(|(s, _)| *s).unwrap()
        };
        assert!(score_of("https://hub.com") > score_of("https://b.com"));
        assert!(scores.iter().all(|(s, _)| *s > 0.0));
    }

    #[test]
    fn cursor_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("indexer_state.txt");
        assert_eq!(read_cursor(&path), 0);
        write_cursor(&path, 4242).unwrap();
        assert_eq!(read_cursor(&path), 4242);
    }

    #[test]
    fn batch_accumulates_vocab_and_languages() {
        let english = "This is a long passage of English text about installation. ".repeat(10);
        let rows = vec![
            StorageDoc {
                rowid: 7,
                url: "https://a.com".into(),
                parsed_text: Some(english),
                title: Some("Install guide".into()),
            },
            StorageDoc {
                rowid: 9,
                url: "https://b.com".into(),
                parsed_text: Some("tiny".into()),
                title: None,
            },
        ];
        let batch = build_batch(rows);
        assert_eq!(batch.max_rowid, 9);
        assert_eq!(batch.docs.len(), 2);
        assert_eq!(batch.docs[1].title, "tiny");
        assert!(batch.vocab.contains_key("installation"));
        assert_eq!(batch.languages.len(), 1);
        assert_eq!(batch.languages[0].1, "https://a.com");
    }
}
