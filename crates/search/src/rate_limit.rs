use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const RATE_LIMIT_MAX: u32 = 30;
/// Above this many tracked IPs the whole table is cleared.
const TRACKED_IP_CAP: usize = 10_000;

/// Fixed-window per-IP request limiter for the search endpoints.
pub struct RateLimiter {
    windows: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { windows: Mutex::new(HashMap::new()) }
    }

    /// `true` when the request is allowed.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();

        if windows.len() > TRACKED_IP_CAP {
            windows.clear();
        }

        match windows.get_mut(&ip) {
            None => {
                windows.insert(ip, (now, 1));
                true
            }
            Some((start, count)) => {
                if now.duration_since(*start) > RATE_LIMIT_WINDOW {
                    *start = now;
                    *count = 1;
                    true
                } else if *count >= RATE_LIMIT_MAX {
                    false
                } else {
                    *count += 1;
                    true
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn allows_up_to_limit_then_blocks() {
        let limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_MAX {
            assert!(limiter.check(ip(1)));
        }
        assert!(!limiter.check(ip(1)));
        // Other clients are unaffected.
        assert!(limiter.check(ip(2)));
    }
}
