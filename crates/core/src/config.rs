use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    pub data_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl AppConfig {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.general.data_dir)
    }
}

/// Crawler identity sent with every request, including robots.txt fetches.
pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; Vigilare/0.1.5; +mailto:crawler@vigilare.dev)";

// Pipeline sizing. These are design constants, not runtime flags.
pub const FETCH_WORKERS: usize = 50;
pub const PARSE_WORKERS: usize = 10;
pub const QUEUE_CAPACITY: usize = 5_000;
pub const WRITE_BATCH_SIZE: usize = 500;

// Dispatcher.
pub const DISPATCH_BATCH_SIZE: i64 = 5_000;
pub const DISPATCH_MIN_FREE_SLOTS: usize = 2_500;
pub const DISPATCHED_RING_SIZE: usize = 20_000;
pub const RESERVATION_LEASE_MINUTES: i64 = 15;

// Domain governance.
pub const MAX_PAGES_PER_DOMAIN: u64 = 10_000;
pub const CRAWL_DELAY: Duration = Duration::from_millis(500);
pub const PENALTY_FAILURE_THRESHOLD: u32 = 10;
pub const PENALTY_WINDOW: Duration = Duration::from_secs(300);
pub const PENALTY_MAX_RETRIES: u32 = 5;
pub const RESCHEDULE_DELAY_SECS: i64 = 5;

// Download contract.
pub const MAX_BYTES: usize = 6_000_000;
pub const MAX_DOWNLOAD_TIME: Duration = Duration::from_secs(15);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const FETCH_MAX_RETRIES: u32 = 3;
pub const HTTP_RETRY_TOTAL: u32 = 3;
pub const HTTP_RETRY_BACKOFF: Duration = Duration::from_millis(500);

// Parsing.
pub const MAX_TEXT_CHARS: usize = 1_000_000;

// Shared state.
pub const BLOOM_BITS: u64 = 100_000_000;
pub const BLOOM_HASHES: u32 = 7;
pub const BLOOM_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(300);
pub const SEEN_HASH_CAP: usize = 1_000_000;
pub const ROBOTS_TTL: Duration = Duration::from_secs(86_400);
pub const ROBOTS_FETCH_TIMEOUT: Duration = Duration::from_secs(6);

pub const CRAWL_EPOCH: i64 = 1;
/// Sentinel for "no external authority data" (lower = more authoritative).
pub const UNKNOWN_DOMAIN_RANK: i64 = 10_000_000;
