use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::debug;

use vigilare_core::config::{
    CRAWL_DELAY, MAX_PAGES_PER_DOMAIN, PENALTY_FAILURE_THRESHOLD, PENALTY_WINDOW,
};

/// Verdict of the per-domain gate a fetcher consults before downloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlGate {
    Ok,
    /// Domain already yielded `MAX_PAGES_PER_DOMAIN` pages.
    CapHit,
    /// Too many recent failures; suppressed for `PENALTY_WINDOW`.
    PenaltyBox,
    /// Last access was within `CRAWL_DELAY`.
    Politeness,
}

pub struct DomainEntry {
    /// Held across the fetch so only one download per domain is in flight.
    pub fetch_lock: tokio::sync::Mutex<()>,
    last_access_ms: AtomicU64,
    failures: AtomicU32,
    pages: AtomicU64,
}

impl DomainEntry {
    fn new() -> Self {
        Self {
            fetch_lock: tokio::sync::Mutex::new(()),
            last_access_ms: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            pages: AtomicU64::new(0),
        }
    }

    fn since_last_access(&self) -> Duration {
        let last = self.last_access_ms.load(Ordering::Relaxed);
        if last == 0 {
            return Duration::MAX;
        }
        Duration::from_millis(now_ms().saturating_sub(last))
    }
}

/// Per-domain politeness, failure and cap accounting, shared by all fetchers.
pub struct DomainManager {
    domains: DashMap<String, Arc<DomainEntry>>,
}

impl Default for DomainManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainManager {
    pub fn new() -> Self {
        Self { domains: DashMap::new() }
    }

    pub fn entry(&self, domain: &str) -> Arc<DomainEntry> {
        self.domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainEntry::new()))
            .clone()
    }

    pub fn check(&self, domain: &str) -> CrawlGate {
        let entry = self.entry(domain);

        if entry.pages.load(Ordering::Relaxed) >= MAX_PAGES_PER_DOMAIN {
            debug!(domain, "gate: page cap hit");
            return CrawlGate::CapHit;
        }

        if entry.failures.load(Ordering::Relaxed) > PENALTY_FAILURE_THRESHOLD
            && entry.since_last_access() < PENALTY_WINDOW
        {
            debug!(domain, "gate: penalty box");
            return CrawlGate::PenaltyBox;
        }

        if entry.since_last_access() < CRAWL_DELAY {
            debug!(domain, "gate: politeness wait");
            return CrawlGate::Politeness;
        }

        CrawlGate::Ok
    }

    pub fn mark_access(&self, domain: &str) {
        self.entry(domain).last_access_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn mark_success(&self, domain: &str) {
        self.entry(domain).pages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_failure(&self, domain: &str) {
        let entry = self.entry(domain);
        entry.failures.fetch_add(1, Ordering::Relaxed);
        entry.last_access_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn page_count(&self, domain: &str) -> u64 {
        self.entry(domain).pages.load(Ordering::Relaxed)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_domain_is_ok() {
        let mgr = DomainManager::new();
        assert_eq!(mgr.check("example.com"), CrawlGate::Ok);
    }

    #[test]
    fn recent_access_trips_politeness() {
        let mgr = DomainManager::new();
        mgr.mark_access("example.com");
        assert_eq!(mgr.check("example.com"), CrawlGate::Politeness);
        // Unrelated domains are unaffected.
        assert_eq!(mgr.check("other.com"), CrawlGate::Ok);
    }

    #[test]
    fn failures_over_threshold_trip_penalty_box() {
        let mgr = DomainManager::new();
        for _ in 0..=PENALTY_FAILURE_THRESHOLD {
            mgr.mark_failure("bad.com");
        }
        assert_eq!(mgr.check("bad.com"), CrawlGate::PenaltyBox);
    }

    #[test]
    fn page_cap_wins_over_everything() {
        let mgr = DomainManager::new();
        for _ in 0..MAX_PAGES_PER_DOMAIN {
            mgr.mark_success("big.com");
        }
        assert_eq!(mgr.check("big.com"), CrawlGate::CapHit);
        assert_eq!(mgr.page_count("big.com"), MAX_PAGES_PER_DOMAIN);
    }
}
