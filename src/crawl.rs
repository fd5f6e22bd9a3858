use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use lru::LruCache;
use rand::seq::SliceRandom;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use vigilare_core::config::{
    BLOOM_SNAPSHOT_INTERVAL, DISPATCHED_RING_SIZE, DISPATCH_BATCH_SIZE, DISPATCH_MIN_FREE_SLOTS,
    FETCH_MAX_RETRIES, FETCH_WORKERS, PARSE_WORKERS, PENALTY_MAX_RETRIES, QUEUE_CAPACITY,
    RESCHEDULE_DELAY_SECS, SEEN_HASH_CAP, WRITE_BATCH_SIZE,
};
use vigilare_core::{sql_now, AppConfig, CrawlStatus, FetchJob, FetchedPage, SavePage, WriteMsg};
use vigilare_fetch::{download_with_retry, RobotsCache};
use vigilare_frontier::{canonicalise, domain_of, CrawlGate, DomainManager, RotationalBloom};
use vigilare_parser::{compress_html, parse_page, simhash_hex};
use vigilare_storage::{CrawlBatch, CrawlStore, DataPaths, PageStore, StorageRow, VisitedRow};

/// Shared crawl state, constructed once at startup and handed to every
/// worker. No free-floating globals.
pub struct Pipeline {
    pub bloom: parking_lot::Mutex<RotationalBloom>,
    pub domains: DomainManager,
    pub robots: RobotsCache,
}

type SharedReceiver<T> = Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>;

pub async fn run_crawl(config: AppConfig, seeds: Option<String>, seed: Option<String>) -> Result<()> {
    let paths = DataPaths::new(&config.data_dir());
    paths.ensure_dirs()?;

    let crawl_store = CrawlStore::open_writer(&paths.crawl_db()).await?;
    crawl_store.migrate().await?;
    let page_store = PageStore::open_writer(&paths.storage_db()).await?;
    page_store.migrate().await?;

    let reset = crawl_store.recover_stale_reservations().await?;
    if reset > 0 {
        info!(reset, "reset stale reservations from previous run");
    }

    let mut bloom = RotationalBloom::new(&paths.bloom_snapshot());
    bloom.load();
    let pipeline = Arc::new(Pipeline {
        bloom: parking_lot::Mutex::new(bloom),
        domains: DomainManager::new(),
        robots: RobotsCache::new()?,
    });

    seed_frontier(&crawl_store, &pipeline, seed, seeds).await?;

    // Dispatcher reads the frontier through its own read-only pool; the
    // writer task keeps exclusive write access.
    let dispatch_store = CrawlStore::open_reader(&paths.crawl_db()).await?;

    let client = vigilare_fetch::build_client()?;

    let (fetch_tx, fetch_rx) = mpsc::channel::<FetchJob>(QUEUE_CAPACITY);
    let (parse_tx, parse_rx) = mpsc::channel::<FetchedPage>(QUEUE_CAPACITY);
    let (write_tx, write_rx) = mpsc::channel::<WriteMsg>(QUEUE_CAPACITY);
    let fetch_rx: SharedReceiver<FetchJob> = Arc::new(tokio::sync::Mutex::new(fetch_rx));
    let parse_rx: SharedReceiver<FetchedPage> = Arc::new(tokio::sync::Mutex::new(parse_rx));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // The writer exits when the write queue closes, i.e. once every other
    // worker has dropped its sender.
    let writer_handle = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(db_writer(crawl_store, page_store, write_rx, pipeline))
    };

    let dispatcher_handle = {
        let fetch_tx = fetch_tx.clone();
        let write_tx = write_tx.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(dispatcher_loop(dispatch_store, fetch_tx, write_tx, shutdown))
    };

    let mut worker_handles = Vec::new();
    for worker_id in 0..FETCH_WORKERS {
        let pipeline = Arc::clone(&pipeline);
        let client = client.clone();
        let fetch_rx = Arc::clone(&fetch_rx);
        let parse_tx = parse_tx.clone();
        let write_tx = write_tx.clone();
        let shutdown = shutdown_tx.subscribe();
        worker_handles.push(tokio::spawn(fetch_worker(
            worker_id, pipeline, client, fetch_rx, parse_tx, write_tx, shutdown,
        )));
    }
    for worker_id in 0..PARSE_WORKERS {
        let parse_rx = Arc::clone(&parse_rx);
        let fetch_tx = fetch_tx.clone();
        let write_tx = write_tx.clone();
        let shutdown = shutdown_tx.subscribe();
        worker_handles.push(tokio::spawn(parse_worker(
            worker_id, parse_rx, fetch_tx, write_tx, shutdown,
        )));
    }

    drop(fetch_tx);
    drop(parse_tx);
    drop(write_tx);

    info!(
        fetchers = FETCH_WORKERS,
        parsers = PARSE_WORKERS,
        "crawl engine running, press Ctrl+C to stop"
    );
    signal::ctrl_c().await?;
    info!("shutdown signal received, draining queues (Ctrl+C again to force quit)");
    let _ = shutdown_tx.send(());

    // A second Ctrl+C abandons whatever is still queued.
    tokio::spawn(async {
        if signal::ctrl_c().await.is_ok() {
            warn!("force quit; pending write-queue items may be lost");
            std::process::exit(130);
        }
    });

    let _ = dispatcher_handle.await;
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = writer_handle.await;

    info!("shutdown complete");
    Ok(())
}

/// Insert seed URLs into the frontier and mark them in the Bloom filter so
/// discovered links back to them are deduplicated.
async fn seed_frontier(
    store: &CrawlStore,
    pipeline: &Pipeline,
    seed: Option<String>,
    seeds: Option<String>,
) -> Result<()> {
    let mut raw_urls: Vec<String> = Vec::new();
    if let Some(s) = seed {
        raw_urls.push(s);
    }
    if let Some(seeds_arg) = seeds {
        if std::path::Path::new(&seeds_arg).exists() {
            let content = std::fs::read_to_string(&seeds_arg)?;
            raw_urls.extend(content.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()));
        } else {
            raw_urls.extend(seeds_arg.split(',').map(|s| s.trim().to_string()));
        }
    }
    if raw_urls.is_empty() {
        return Ok(());
    }

    let mut rows = Vec::new();
    for raw in &raw_urls {
        let Some(url) = canonicalise(raw) else {
            warn!(url = %raw, "skipping unusable seed");
            continue;
        };
        let domain = domain_of(&url).to_string();
        {
            let mut bloom = pipeline.bloom.lock();
            bloom.insert(&url);
        }
        rows.push((url, domain));
    }
    let inserted = store.insert_frontier(&rows).await?;
    info!(inserted, total = rows.len(), "seeds loaded");
    Ok(())
}

/// Single-threaded dispatcher: keeps the fetch queue topped up from the
/// frontier while at least half its capacity is free.
async fn dispatcher_loop(
    store: CrawlStore,
    fetch_tx: mpsc::Sender<FetchJob>,
    write_tx: mpsc::Sender<WriteMsg>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("dispatcher started");
    // Recently dispatched URLs the writer may not have marked active yet.
    let mut ring = LruCache::<String, ()>::new(
        NonZeroUsize::new(DISPATCHED_RING_SIZE).expect("ring size is nonzero"),
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("dispatcher shutting down");
                break;
            }
            _ = dispatch_tick(&store, &fetch_tx, &write_tx, &mut ring) => {}
        }
    }
}

async fn dispatch_tick(
    store: &CrawlStore,
    fetch_tx: &mpsc::Sender<FetchJob>,
    write_tx: &mpsc::Sender<WriteMsg>,
    ring: &mut LruCache<String, ()>,
) {
    if fetch_tx.capacity() < DISPATCH_MIN_FREE_SLOTS {
        tokio::time::sleep(Duration::from_millis(500)).await;
        return;
    }

    let started = Instant::now();
    let rows = match store.select_dispatchable(DISPATCH_BATCH_SIZE).await {
        Ok(rows) => rows,
        Err(e) => {
            error!("dispatch query failed: {e}");
            tokio::time::sleep(Duration::from_secs(5)).await;
            return;
        }
    };

    let mut fresh: Vec<(String, u32)> =
        rows.into_iter().filter(|(url, _)| !ring.contains(url)).collect();

    if fresh.is_empty() {
        debug!("frontier empty, sleeping");
        tokio::time::sleep(Duration::from_secs(2)).await;
        return;
    }

    // Shuffle so naturally clustered frontier rows don't hammer one domain.
    fresh.shuffle(&mut rand::thread_rng());

    let urls: Vec<String> = fresh.iter().map(|(url, _)| url.clone()).collect();
    if write_tx.send(WriteMsg::Reserve(urls.clone())).await.is_err() {
        return;
    }
    for url in urls {
        ring.put(url, ());
    }

    let count = fresh.len();
    for (url, retry_count) in fresh {
        if fetch_tx.send(FetchJob { url, retry_count }).await.is_err() {
            return;
        }
    }
    info!(count, elapsed_ms = started.elapsed().as_millis() as u64, "dispatched URLs");
}

async fn fetch_worker(
    worker_id: usize,
    pipeline: Arc<Pipeline>,
    client: reqwest::Client,
    fetch_rx: SharedReceiver<FetchJob>,
    parse_tx: mpsc::Sender<FetchedPage>,
    write_tx: mpsc::Sender<WriteMsg>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.recv() => break,
            job = async { fetch_rx.lock().await.recv().await } => job,
        };
        let Some(job) = job else { break };
        handle_fetch(worker_id, &pipeline, &client, job, &parse_tx, &write_tx).await;
    }
    debug!(worker_id, "fetch worker stopped");
}

async fn handle_fetch(
    worker_id: usize,
    pipeline: &Pipeline,
    client: &reqwest::Client,
    job: FetchJob,
    parse_tx: &mpsc::Sender<FetchedPage>,
    write_tx: &mpsc::Sender<WriteMsg>,
) {
    let domain = domain_of(&job.url).to_string();

    match pipeline.domains.check(&domain) {
        CrawlGate::Ok => {}
        CrawlGate::CapHit => {
            // Cap satisfied: the domain is done, not broken.
            let _ = write_tx
                .send(WriteMsg::StatusUpdate { url: job.url, status: CrawlStatus::Completed })
                .await;
            return;
        }
        CrawlGate::PenaltyBox => {
            let msg = if job.retry_count >= PENALTY_MAX_RETRIES {
                debug!(worker_id, url = %job.url, "penalty loop, abandoning");
                WriteMsg::StatusUpdate { url: job.url, status: CrawlStatus::Failed }
            } else {
                WriteMsg::Retry { url: job.url, retry_count: job.retry_count + 1 }
            };
            let _ = write_tx.send(msg).await;
            return;
        }
        CrawlGate::Politeness => {
            let _ = write_tx
                .send(WriteMsg::Reschedule { url: job.url, delay_secs: RESCHEDULE_DELAY_SECS })
                .await;
            return;
        }
    }

    match pipeline.robots.allows(&domain, &job.url).await {
        Ok(true) => {}
        Ok(false) => {
            let _ = write_tx
                .send(WriteMsg::StatusUpdate { url: job.url, status: CrawlStatus::Failed })
                .await;
            return;
        }
        Err(e) => {
            debug!(worker_id, domain, "robots fetch failed, will retry: {e}");
            let _ = write_tx
                .send(WriteMsg::Retry { url: job.url, retry_count: job.retry_count + 1 })
                .await;
            return;
        }
    }

    let entry = pipeline.domains.entry(&domain);
    let result = {
        let _guard = entry.fetch_lock.lock().await;
        pipeline.domains.mark_access(&domain);
        let started = Instant::now();
        let result = download_with_retry(client, &job.url).await;
        debug!(
            worker_id,
            url = %job.url,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fetch finished"
        );
        result
    };

    match result {
        Err(err) => {
            pipeline.domains.mark_failure(&domain);
            let msg = if err.is_retryable() && job.retry_count < FETCH_MAX_RETRIES {
                WriteMsg::Retry { url: job.url, retry_count: job.retry_count + 1 }
            } else {
                debug!(worker_id, url = %job.url, %err, "permanent fetch failure");
                WriteMsg::StatusUpdate { url: job.url, status: CrawlStatus::Failed }
            };
            let _ = write_tx.send(msg).await;
        }
        Ok(dl) => {
            pipeline.domains.mark_success(&domain);
            let page = FetchedPage {
                url: job.url,
                body: dl.body,
                headers: dl.headers,
                status: dl.status,
                retry_count: job.retry_count,
            };
            if parse_tx.send(page).await.is_err() {
                error!(worker_id, "parse channel closed");
            }
        }
    }
}

async fn parse_worker(
    worker_id: usize,
    parse_rx: SharedReceiver<FetchedPage>,
    fetch_tx: mpsc::Sender<FetchJob>,
    write_tx: mpsc::Sender<WriteMsg>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let page = tokio::select! {
            _ = shutdown.recv() => {
                // Parsed work already fetched is still saved on shutdown.
                loop {
                    let pending = parse_rx.lock().await.try_recv();
                    match pending {
                        Ok(page) => process_page(worker_id, page, &fetch_tx, &write_tx).await,
                        Err(_) => break,
                    }
                }
                break;
            }
            page = async { parse_rx.lock().await.recv().await } => page,
        };
        let Some(page) = page else { break };
        process_page(worker_id, page, &fetch_tx, &write_tx).await;
    }
    debug!(worker_id, "parse worker stopped");
}

async fn process_page(
    worker_id: usize,
    page: FetchedPage,
    fetch_tx: &mpsc::Sender<FetchJob>,
    write_tx: &mpsc::Sender<WriteMsg>,
) {
    let Ok(base_url) = url::Url::parse(&page.url) else {
        warn!(worker_id, url = %page.url, "unparseable URL reached parser");
        return;
    };

    // Backpressure valve: stop discovering links while the fetch queue is
    // saturated.
    let extract_links = fetch_tx.capacity() > 0;

    let started = Instant::now();
    let parsed = parse_page(&base_url, &page.body, extract_links);
    let content_hash = simhash_hex(&parsed.content);

    let raw_html = match compress_html(&page.body) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(worker_id, url = %page.url, "compression failed: {e}");
            return;
        }
    };
    let headers_json = serde_json::to_string(&page.headers).unwrap_or_else(|_| "{}".to_string());

    debug!(
        worker_id,
        url = %page.url,
        links = parsed.links.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "parsed page"
    );

    let msg = SavePage {
        url: page.url,
        title: parsed.title,
        description: parsed.description,
        content: parsed.content,
        content_hash,
        raw_html,
        headers_json,
        http_status: page.status,
        out_links: parsed.links.len() as u32,
        links: parsed.links,
    };
    if write_tx.send(WriteMsg::SavePage(Box::new(msg))).await.is_err() {
        error!(worker_id, "write channel closed");
    }
}

/// The single writer with exclusive write access to the crawl and storage
/// databases. Drains the write queue in batches, persists the Bloom filter
/// and checkpoints both WALs every five minutes, and exits only once the
/// queue is closed and fully drained.
async fn db_writer(
    crawl_store: CrawlStore,
    page_store: PageStore,
    mut write_rx: mpsc::Receiver<WriteMsg>,
    pipeline: Arc<Pipeline>,
) {
    info!("db writer started");

    let mut seen_hashes = LruCache::<String, ()>::new(
        NonZeroUsize::new(SEEN_HASH_CAP).expect("hash cap is nonzero"),
    );
    match crawl_store.load_content_hashes(SEEN_HASH_CAP as i64).await {
        Ok(hashes) => {
            let count = hashes.len();
            for hash in hashes {
                seen_hashes.put(hash, ());
            }
            info!(count, "pre-loaded content hashes");
        }
        Err(e) => warn!("content hash pre-load skipped: {e}"),
    }

    let mut last_snapshot = Instant::now();
    let mut last_store_time = Instant::now();
    let mut pages_stored = 0u64;
    let stall_threshold = Duration::from_secs(300);

    loop {
        let mut msgs = Vec::new();
        let mut closed = false;
        while msgs.len() < WRITE_BATCH_SIZE {
            match write_rx.try_recv() {
                Ok(msg) => msgs.push(msg),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }

        let idle = msgs.is_empty();
        if !idle {
            let (batch, storage_rows) = classify_messages(msgs, &mut seen_hashes, &pipeline);
            let stored_pages = !batch.visited.is_empty();

            if let Err(e) = crawl_store.apply(&batch).await {
                error!("crawl db write failed: {e}");
            }
            if let Err(e) = page_store.insert_pages(&storage_rows).await {
                error!("storage db write failed: {e}");
            }
            pages_stored += storage_rows.len() as u64;
            if stored_pages {
                last_store_time = Instant::now();
            }
        }

        if last_snapshot.elapsed() >= BLOOM_SNAPSHOT_INTERVAL {
            persist_shared_state(&pipeline, &crawl_store, &page_store).await;
            last_snapshot = Instant::now();
            if last_store_time.elapsed() > stall_threshold {
                warn!(
                    pages_stored,
                    idle_secs = last_store_time.elapsed().as_secs(),
                    "no pages stored recently, crawl may be stalled"
                );
            }
        }

        if closed {
            break;
        }
        if idle {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    persist_shared_state(&pipeline, &crawl_store, &page_store).await;
    info!(pages_stored, "db writer stopped");
}

/// Sort drained messages into per-statement batches. Content-hash dedup
/// and Bloom admission of discovered links happen here, under the single
/// writer, so both sets have exactly one mutator.
fn classify_messages(
    msgs: Vec<WriteMsg>,
    seen_hashes: &mut LruCache<String, ()>,
    pipeline: &Pipeline,
) -> (CrawlBatch, Vec<StorageRow>) {
    let mut batch = CrawlBatch::default();
    let mut storage_rows = Vec::new();

    for msg in msgs {
        match msg {
            WriteMsg::SavePage(page) => {
                let page = *page;
                let safe_hash = format!("h:{}", page.content_hash);

                let is_duplicate = seen_hashes.contains(&safe_hash);
                if !is_duplicate {
                    seen_hashes.put(safe_hash.clone(), ());
                }

                batch.visited.push(VisitedRow {
                    url: page.url.clone(),
                    title: page.title.clone(),
                    description: page.description.clone(),
                    http_status: page.http_status,
                    out_links: page.out_links,
                    crawled_at: sql_now(),
                    content_hash: safe_hash,
                });
                batch.status.push((CrawlStatus::Completed.as_i64(), sql_now(), page.url.clone()));

                if !is_duplicate {
                    storage_rows.push(StorageRow {
                        url: page.url.clone(),
                        raw_html: page.raw_html,
                        parsed_text: page.content,
                        title: page.title,
                        http_headers: page.headers_json,
                        crawled_at: sql_now(),
                    });
                }

                let source_domain = domain_of(&page.url).to_string();
                for link in page.links {
                    if link == page.url {
                        continue;
                    }
                    let target_domain = domain_of(&link).to_string();
                    batch.links.push((
                        source_domain.clone(),
                        target_domain.clone(),
                        page.url.clone(),
                        link.clone(),
                    ));

                    let mut bloom = pipeline.bloom.lock();
                    if !bloom.contains(&link) {
                        bloom.insert(&link);
                        batch.frontier.push((link, target_domain));
                    }
                }
            }
            WriteMsg::StatusUpdate { url, status } => {
                batch.status.push((status.as_i64(), sql_now(), url));
            }
            WriteMsg::Retry { url, retry_count } => {
                batch.retries.push((retry_count, url));
            }
            WriteMsg::Reserve(urls) => {
                batch.reserves.extend(urls);
            }
            WriteMsg::Reschedule { url, delay_secs } => {
                let future = (chrono::Utc::now() + chrono::Duration::seconds(delay_secs))
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string();
                batch.reschedules.push((future, url));
            }
        }
    }

    (batch, storage_rows)
}

async fn persist_shared_state(pipeline: &Pipeline, crawl_store: &CrawlStore, page_store: &PageStore) {
    let saved = {
        let bloom = pipeline.bloom.lock();
        bloom.save()
    };
    if let Err(e) = saved {
        warn!("bloom snapshot failed: {e}");
    }
    if let Err(e) = crawl_store.wal_checkpoint_truncate().await {
        warn!("crawl WAL checkpoint skipped: {e}");
    }
    if let Err(e) = page_store.wal_checkpoint_truncate().await {
        warn!("storage WAL checkpoint skipped: {e}");
    }
    info!("bloom snapshot + WAL checkpoint (truncate) done");
}
