pub mod bloom;
pub mod domains;

pub use bloom::RotationalBloom;
pub use domains::{CrawlGate, DomainManager};

use url::Url;

/// Query parameters that only track campaigns; stripped during canonicalisation.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "yclid", "msclkid", "mc_eid"];

/// Reduce a URL to its canonical string form: lowercase scheme and host,
/// no `www.` prefix, no trailing slash, no fragment, no tracking params.
/// The result is the stable key used for the frontier, the Bloom filter and
/// the link graph. Returns `None` for non-http(s) or unparseable URLs.
pub fn canonicalise(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;

    match url.scheme() {
        "http" | "https" => {}
        _ => return None,
    }

    let host = url.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() {
        return None;
    }

    let path = url.path().trim_end_matches('/');

    let query: Vec<String> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| {
            if v.is_empty() {
                k.into_owned()
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect();

    let mut out = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        out.push_str(&format!(":{}", port));
    }
    out.push_str(path);
    if !query.is_empty() {
        out.push('?');
        out.push_str(&query.join("&"));
    }
    Some(out)
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

/// Host portion of an already-canonical URL (everything between `://` and
/// the next `/`, `?` or end of string).
pub fn domain_of(canonical_url: &str) -> &str {
    let rest = canonical_url
        .split_once("://")
        .map(|(_, r)| r)
        .unwrap_or(canonical_url);
    rest.split(['/', '?']).next().unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalise_normalises_host_and_path() {
        assert_eq!(
            canonicalise("HTTPS://WWW.Example.COM/Path/").as_deref(),
            Some("https://example.com/Path")
        );
    }

    #[test]
    fn canonicalise_drops_fragments_and_tracking() {
        assert_eq!(
            canonicalise("http://example.com/a?utm_source=x&q=1&fbclid=z#frag").as_deref(),
            Some("http://example.com/a?q=1")
        );
    }

    #[test]
    fn canonicalise_rejects_other_schemes() {
        assert_eq!(canonicalise("ftp://example.com/file"), None);
        assert_eq!(canonicalise("mailto:someone@example.com"), None);
        assert_eq!(canonicalise("javascript:void(0)"), None);
    }

    #[test]
    fn canonicalise_is_idempotent() {
        let inputs = [
            "https://www.example.com/a/b/?utm_campaign=x&k=v#top",
            "http://EXAMPLE.org",
            "https://sub.example.co.uk:8443/path?x=1",
        ];
        for raw in inputs {
            let once = canonicalise(raw).unwrap();
            let twice = canonicalise(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw}");
        }
    }

    #[test]
    fn domain_of_strips_scheme_and_path() {
        assert_eq!(domain_of("https://example.com/a/b"), "example.com");
        assert_eq!(domain_of("http://example.com:8080?q=1"), "example.com:8080");
    }
}
