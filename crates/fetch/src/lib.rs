pub mod download;
pub mod robots;

pub use download::{download, DownloadResult};
pub use robots::RobotsCache;

use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use vigilare_core::config::{
    CONNECT_TIMEOUT, HTTP_RETRY_BACKOFF, HTTP_RETRY_TOTAL, READ_TIMEOUT, USER_AGENT,
};
use vigilare_core::FetchError;

/// Build the shared crawl client. Redirect handling is capped so loops
/// surface as errors instead of hanging a worker.
pub fn build_client() -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?;
    Ok(client)
}

/// Download with the client-level retry layer: transient failures
/// (connect-class errors and 500/502/503/504) are re-issued up to
/// `HTTP_RETRY_TOTAL` times with exponential backoff from
/// `HTTP_RETRY_BACKOFF`. Everything else is returned as-is.
pub async fn download_with_retry(
    client: &reqwest::Client,
    url: &str,
) -> Result<DownloadResult, FetchError> {
    let mut attempt = 0u32;
    loop {
        match download(client, url).await {
            Err(err) if err.is_transient() && attempt < HTTP_RETRY_TOTAL => {
                let backoff = backoff_delay(attempt);
                debug!(url, attempt, %err, "transient fetch failure, backing off");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    HTTP_RETRY_BACKOFF * 2u32.saturating_pow(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
    }
}
