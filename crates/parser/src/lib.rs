pub mod compress;
pub mod simhash;

pub use compress::{compress_html, decompress_html};
pub use simhash::{simhash, simhash_hex};

use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use vigilare_core::config::MAX_TEXT_CHARS;
use vigilare_frontier::canonicalise;

/// Elements whose text is page chrome, not content.
const STRIPPED_ELEMENTS: &[&str] =
    &["script", "style", "nav", "footer", "header", "noscript", "iframe", "svg"];

pub struct ParsedPage {
    pub title: String,
    pub description: String,
    /// Whitespace-collapsed visible body text, capped at `MAX_TEXT_CHARS`.
    pub content: String,
    /// Canonicalised outbound links (empty when extraction was skipped).
    pub links: Vec<String>,
}

/// Decode and extract a fetched HTML body. `extract_links` is the
/// backpressure valve: when the fetch queue is saturated the caller skips
/// link discovery entirely.
pub fn parse_page(url: &Url, body: &[u8], extract_links: bool) -> ParsedPage {
    let html_str = decode_body(body);
    let document = Html::parse_document(&html_str);

    let title = selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let description = selector(r#"meta[name="description"]"#)
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("content").map(|s| s.to_string()))
        .unwrap_or_default();

    let content = selector("body")
        .and_then(|s| document.select(&s).next())
        .map(visible_text)
        .map(|text| truncate_chars(text, MAX_TEXT_CHARS))
        .unwrap_or_default();

    let links = if extract_links {
        extract_page_links(&document, url)
    } else {
        Vec::new()
    };

    ParsedPage { title, description, content, links }
}

/// UTF-8 with Latin-1 fallback: every byte is a valid Latin-1 code point,
/// so malformed documents still yield indexable text.
fn decode_body(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(s) => s.to_string(),
        Err(_) => body.iter().map(|&b| b as char).collect(),
    }
}

/// Collect text below `root`, skipping stripped elements, and collapse
/// whitespace runs to single spaces.
fn visible_text(root: ElementRef<'_>) -> String {
    let mut out = String::new();
    let mut stack: Vec<_> = root.children().rev().collect();

    while let Some(node) = stack.pop() {
        match node.value() {
            Node::Text(text) => {
                out.push_str(text);
                out.push(' ');
            }
            Node::Element(el) => {
                if !STRIPPED_ELEMENTS.contains(&el.name()) {
                    stack.extend(node.children().rev());
                }
            }
            _ => {}
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_page_links(document: &Html, base_url: &Url) -> Vec<String> {
    let Some(sel) = selector("a[href]") else {
        return Vec::new();
    };

    document
        .select(&sel)
        .filter_map(|el| {
            let href = el.value().attr("href")?;

            if href.starts_with("javascript:")
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
                || href.starts_with("data:")
                || href.starts_with('#')
            {
                return None;
            }

            let resolved = base_url.join(href).ok()?;
            canonicalise(resolved.as_str())
        })
        .collect()
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

fn truncate_chars(s: String, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/page").unwrap()
    }

    #[test]
    fn extracts_title_description_and_text() {
        let html = br#"<html><head><title> Hello World </title>
            <meta name="description" content="A test page"></head>
            <body><p>Some   body
            text</p></body></html>"#;
        let page = parse_page(&base(), html, true);
        assert_eq!(page.title, "Hello World");
        assert_eq!(page.description, "A test page");
        assert_eq!(page.content, "Some body text");
    }

    #[test]
    fn strips_chrome_elements() {
        let html = br#"<html><body>
            <nav>menu items</nav>
            <script>var x = 1;</script>
            <style>.a { color: red }</style>
            <p>real content</p>
            <footer>copyright</footer>
            </body></html>"#;
        let page = parse_page(&base(), html, true);
        assert_eq!(page.content, "real content");
    }

    #[test]
    fn resolves_and_canonicalises_links() {
        let html = br##"<html><body>
            <a href="/about/">About</a>
            <a href="https://www.other.com/x?utm_source=a">Other</a>
            <a href="mailto:x@example.com">Mail</a>
            <a href="#section">Anchor</a>
            </body></html>"##;
        let page = parse_page(&base(), html, true);
        assert_eq!(
            page.links,
            vec!["https://example.com/about", "https://other.com/x"]
        );
    }

    #[test]
    fn skips_links_when_valve_closed() {
        let html = br#"<html><body><a href="/a">A</a></body></html>"#;
        let page = parse_page(&base(), html, false);
        assert!(page.links.is_empty());
    }

    #[test]
    fn latin1_fallback_decodes_invalid_utf8() {
        // 0xE9 is 'é' in Latin-1 but invalid standalone UTF-8.
        let html = b"<html><body>caf\xe9</body></html>";
        let page = parse_page(&base(), html, false);
        assert_eq!(page.content, "caf\u{e9}");
    }
}
