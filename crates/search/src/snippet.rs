use regex::RegexBuilder;

/// Window size around each term occurrence: 60 chars of lead-in, 240 out.
const WINDOW_BEFORE: usize = 60;
const WINDOW_AFTER: usize = 240;
const PLAIN_PREFIX_LEN: usize = 250;

/// Pick the 300-char window of `content` with the most query-term
/// occurrences and bold the matches. Falls back to the first 250 chars
/// when no term occurs.
pub fn contextual_snippet(content: &str, terms: &[String]) -> String {
    if content.is_empty() || terms.is_empty() {
        return String::new();
    }

    let text = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let lower = text.to_lowercase();
    // Byte positions found in the lowercase copy only map onto `text` when
    // lowercasing didn't change byte lengths; otherwise display the
    // lowercase form.
    let display: &str = if lower.len() == text.len() { &text } else { &lower };

    let mut positions = Vec::new();
    for term in terms {
        let mut start = 0;
        while let Some(idx) = lower[start..].find(term.as_str()) {
            positions.push(start + idx);
            start += idx + 1;
        }
    }

    if positions.is_empty() {
        return format!("{}...", prefix_chars(display, PLAIN_PREFIX_LEN));
    }
    positions.sort_unstable();

    let mut best_window = "";
    let mut max_score = 0usize;
    for &pos in &positions {
        let start = floor_boundary(display, pos.saturating_sub(WINDOW_BEFORE));
        let end = floor_boundary(display, (pos + WINDOW_AFTER).min(display.len()));
        let window = &display[start..end];
        let window_lower = &lower[start..end];

        let score: usize = terms.iter().map(|t| window_lower.matches(t.as_str()).count()).sum();
        if score > max_score {
            max_score = score;
            best_window = window;
        }
    }

    if best_window.is_empty() {
        return format!("{}...", prefix_chars(display, PLAIN_PREFIX_LEN));
    }

    let mut highlighted = best_window.to_string();
    for term in terms {
        if let Ok(re) = RegexBuilder::new(&regex::escape(term)).case_insensitive(true).build() {
            highlighted = re.replace_all(&highlighted, "<b>$0</b>").into_owned();
        }
    }
    format!("...{highlighted}...")
}

fn prefix_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx.min(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bolds_matched_terms() {
        let snippet = contextual_snippet("You can install Rust with rustup.", &terms(&["install", "rust"]));
        assert!(snippet.contains("<b>install</b>"));
        assert!(snippet.contains("<b>Rust</b>"));
        assert!(snippet.starts_with("..."));
        assert!(snippet.ends_with("..."));
    }

    #[test]
    fn picks_densest_window() {
        let padding = "filler words here ".repeat(40);
        let content = format!("rust once. {padding} rust rust rust cluster of rust mentions");
        let snippet = contextual_snippet(&content, &terms(&["rust"]));
        assert!(snippet.contains("cluster"));
    }

    #[test]
    fn falls_back_to_prefix_without_matches() {
        let content = "nothing relevant in this text at all ".repeat(20);
        let snippet = contextual_snippet(&content, &terms(&["zebra"]));
        assert!(snippet.ends_with("..."));
        assert!(!snippet.contains("<b>"));
        assert!(snippet.chars().count() <= PLAIN_PREFIX_LEN + 3);
    }

    #[test]
    fn collapses_whitespace() {
        let snippet = contextual_snippet("install\n\n   rust\ttoday", &terms(&["rust"]));
        assert!(snippet.contains("install <b>rust</b> today"));
    }

    #[test]
    fn empty_inputs_yield_empty_snippet() {
        assert_eq!(contextual_snippet("", &terms(&["a"])), "");
        assert_eq!(contextual_snippet("text", &[]), "");
    }
}
