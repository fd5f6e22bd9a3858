use std::collections::HashMap;
use std::time::Instant;

use futures_util::StreamExt;

use vigilare_core::config::{MAX_BYTES, MAX_DOWNLOAD_TIME};
use vigilare_core::FetchError;

/// A completed download: always `200` with an HTML content type.
#[derive(Debug)]
pub struct DownloadResult {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Streaming GET with hard ceilings. Only `200` responses whose
/// Content-Type contains `text/html` or `application/xhtml` produce a body;
/// everything else maps onto the fetch error taxonomy. The body is read
/// chunk-by-chunk so oversized or slow responses abort without buffering.
pub async fn download(client: &reqwest::Client, url: &str) -> Result<DownloadResult, FetchError> {
    let started = Instant::now();

    let resp = client.get(url).send().await.map_err(classify_send_error)?;

    let status = resp.status().as_u16();
    let headers: HashMap<String, String> = resp
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect();

    if status != 200 {
        return Err(FetchError::Http(status));
    }

    let ctype = headers
        .get("content-type")
        .map(|v| v.to_lowercase())
        .unwrap_or_default();
    if !ctype.contains("text/html") && !ctype.contains("application/xhtml") {
        return Err(FetchError::NotHtml);
    }

    if let Some(len) = headers.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
        if len > MAX_BYTES {
            return Err(FetchError::TooLargeHeader);
        }
    }

    let mut body = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if started.elapsed() > MAX_DOWNLOAD_TIME {
            return Err(FetchError::TimeoutDuringRead);
        }
        let chunk = chunk.map_err(classify_read_error)?;
        body.extend_from_slice(&chunk);
        if body.len() > MAX_BYTES {
            return Err(FetchError::TooLargeBody);
        }
    }

    Ok(DownloadResult { status, headers, body })
}

fn classify_send_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::TimeoutConnect
    } else if err.is_redirect() {
        FetchError::RedirectLoop
    } else if err.is_connect() {
        FetchError::Connection
    } else {
        FetchError::Net(truncate(&err.to_string(), 50))
    }
}

fn classify_read_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::TimeoutDuringRead
    } else if err.is_connect() {
        FetchError::Connection
    } else {
        FetchError::Net(truncate(&err.to_string(), 50))
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
