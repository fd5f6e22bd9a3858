use std::collections::HashMap;
use std::time::Instant;

use anyhow::Result;
use robotstxt::DefaultMatcher;
use tokio::sync::Mutex;
use tracing::debug;

use vigilare_core::config::{ROBOTS_FETCH_TIMEOUT, ROBOTS_TTL, USER_AGENT};

enum RobotsPolicy {
    AllowAll,
    DisallowAll,
    Rules(String),
}

struct CachedRobots {
    policy: RobotsPolicy,
    fetched_at: Instant,
}

/// Per-domain robots.txt cache with a 24 h TTL.
///
/// robots.txt is fetched once per domain over plain HTTP. `401`/`403`
/// responses deny the whole domain, any other `>= 400` allows everything,
/// and a network failure is reported to the caller so the URL can be
/// retried. The cache lock is released while the network fetch runs.
pub struct RobotsCache {
    cache: Mutex<HashMap<String, CachedRobots>>,
    client: reqwest::Client,
}

impl RobotsCache {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(ROBOTS_FETCH_TIMEOUT)
            .build()?;
        Ok(Self { cache: Mutex::new(HashMap::new()), client })
    }

    /// Whether `url` on `domain` may be fetched. `Err` means robots.txt
    /// itself could not be retrieved (a retryable condition).
    pub async fn allows(&self, domain: &str, url: &str) -> Result<bool> {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(domain) {
                if entry.fetched_at.elapsed() < ROBOTS_TTL {
                    return Ok(self.evaluate(&entry.policy, url));
                }
            }
        }

        debug!(domain, "fetching robots.txt");
        let policy = self.fetch_policy(domain).await?;
        let allowed = self.evaluate(&policy, url);

        let mut cache = self.cache.lock().await;
        cache.insert(domain.to_string(), CachedRobots { policy, fetched_at: Instant::now() });

        if !allowed {
            debug!(url, "denied by robots.txt");
        }
        Ok(allowed)
    }

    async fn fetch_policy(&self, domain: &str) -> Result<RobotsPolicy> {
        let resp = self.client.get(format!("http://{domain}/robots.txt")).send().await?;
        let status = resp.status().as_u16();

        Ok(match status {
            401 | 403 => RobotsPolicy::DisallowAll,
            s if s >= 400 => RobotsPolicy::AllowAll,
            _ => RobotsPolicy::Rules(resp.text().await?),
        })
    }

    fn evaluate(&self, policy: &RobotsPolicy, url: &str) -> bool {
        match policy {
            RobotsPolicy::AllowAll => true,
            RobotsPolicy::DisallowAll => false,
            RobotsPolicy::Rules(body) => {
                let mut matcher = DefaultMatcher::default();
                matcher.one_agent_allowed_by_robots(body, USER_AGENT, url)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> RobotsCache {
        RobotsCache::new().unwrap()
    }

    #[test]
    fn disallow_all_denies_everything() {
        let c = cache();
        assert!(!c.evaluate(&RobotsPolicy::DisallowAll, "http://example.com/any"));
    }

    #[test]
    fn rules_are_applied_per_path() {
        let c = cache();
        let body = "User-agent: *\nDisallow: /private/\n";
        let policy = RobotsPolicy::Rules(body.to_string());
        assert!(!c.evaluate(&policy, "http://example.com/private/page"));
        assert!(c.evaluate(&policy, "http://example.com/public"));
    }

    #[test]
    fn blanket_disallow_denies_root() {
        let c = cache();
        let policy = RobotsPolicy::Rules("User-agent: *\nDisallow: /\n".to_string());
        assert!(!c.evaluate(&policy, "http://example.com/"));
        assert!(!c.evaluate(&policy, "http://example.com/deep/path"));
    }
}
