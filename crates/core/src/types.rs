use std::collections::HashMap;

/// Frontier row lifecycle. Stored as an integer in the `frontier` table;
/// a row never moves back from `Completed`/`Failed` to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum CrawlStatus {
    Pending = 0,
    Active = 1,
    Completed = 2,
    Failed = 3,
}

impl CrawlStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Dispatcher → fetcher.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub url: String,
    pub retry_count: u32,
}

/// Fetcher → parser: a successfully downloaded HTML body.
#[derive(Debug)]
pub struct FetchedPage {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub status: u16,
    pub retry_count: u32,
}

/// Parser → writer: everything needed to persist one crawled page.
#[derive(Debug)]
pub struct SavePage {
    pub url: String,
    pub title: String,
    pub description: String,
    pub content: String,
    /// SimHash of the cleaned text, lowercase hex without the `h:` prefix.
    pub content_hash: String,
    pub raw_html: Vec<u8>,
    pub headers_json: String,
    pub http_status: u16,
    pub out_links: u32,
    pub links: Vec<String>,
}

/// Messages drained by the single DB writer.
#[derive(Debug)]
pub enum WriteMsg {
    SavePage(Box<SavePage>),
    StatusUpdate { url: String, status: CrawlStatus },
    Retry { url: String, retry_count: u32 },
    Reserve(Vec<String>),
    Reschedule { url: String, delay_secs: i64 },
}

/// Timestamp in the `YYYY-MM-DD HH:MM:SS` form every table stores.
pub fn sql_now() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
