use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

pub const PER_PAGE: usize = 20;
pub const CANDIDATE_POOL_SIZE: i64 = 500;
pub const MAX_QUERY_TERMS: usize = 7;
pub const MAX_QUERY_LENGTH: usize = 150;
/// Fewer hits than this triggers the OR fallback and spelling lookup.
pub const MIN_GOOD_HITS: usize = 5;
/// All scores from a fallback retrieval are damped by this factor.
pub const FALLBACK_SCORE_FACTOR: f64 = 0.8;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "of", "to", "and", "in", "on", "for", "with", "at", "by", "from", "how",
    "what", "why", "when", "where", "is", "are", "be", "this", "that", "it", "its",
];

/// Fixed synonym table used for both expansion and FTS variants.
pub fn synonyms(term: &str) -> &'static [&'static str] {
    match term {
        "install" => &["setup", "configure"],
        "setup" => &["install", "configure"],
        "error" => &["issue", "problem"],
        "bug" => &["issue", "defect"],
        "security" => &["infosec", "cybersecurity"],
        "auth" => &["authentication", "login"],
        "login" => &["authentication", "auth"],
        "network" => &["net", "networking"],
        "linux" => &["gnu", "unix"],
        "windows" => &["win"],
        _ => &[],
    }
}

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]+").unwrap());
static SITE_DIRECTIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"site:\s*([a-z0-9.\-]+)").unwrap());
static HOSTISH_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9.]+").unwrap());

/// Lower-case, strip punctuation, drop stop-words and 1-char tokens,
/// dedupe preserving order, cap at `MAX_QUERY_TERMS`.
pub fn normalise_tokens(raw: &str) -> Vec<String> {
    let lowered = raw.to_lowercase();
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for token in TOKEN_RE.find_iter(&lowered) {
        let t = token.as_str();
        if t.len() <= 1 || STOPWORDS.contains(&t) {
            continue;
        }
        if seen.insert(t.to_string()) {
            out.push(t.to_string());
            if out.len() == MAX_QUERY_TERMS {
                break;
            }
        }
    }
    out
}

/// Alphanumerics only, for brand matching against the registered domain.
pub fn normalise_for_brand(raw: &str) -> String {
    raw.to_lowercase().chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// `site:<host>` directive, or any dot-bearing token longer than 4 chars
/// as an implicit one.
pub fn extract_site_directive(raw: &str) -> Option<String> {
    let lowered = raw.to_lowercase();
    if let Some(caps) = SITE_DIRECTIVE_RE.captures(&lowered) {
        return Some(caps[1].to_string());
    }
    HOSTISH_TOKEN_RE
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .find(|t| t.contains('.') && t.len() > 4)
        .map(|t| t.to_string())
}

pub fn expand_terms(base_terms: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for t in base_terms {
        if seen.insert(t.clone()) {
            out.push(t.clone());
        }
        for s in synonyms(t) {
            if seen.insert(s.to_string()) {
                out.push(s.to_string());
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtsMode {
    And,
    Or,
}

/// FTS5 query: one group per base term, `("t" OR "t"* OR "syn"...)`,
/// joined with AND (or OR for the fallback pass).
pub fn build_fts_query(base_terms: &[String], mode: FtsMode) -> String {
    let groups: Vec<String> = base_terms
        .iter()
        .map(|t| {
            let mut variants = vec![format!("\"{t}\""), format!("\"{t}\"*")];
            for s in synonyms(t) {
                variants.push(format!("\"{s}\""));
            }
            format!("({})", variants.join(" OR "))
        })
        .collect();

    let joiner = match mode {
        FtsMode::And => " AND ",
        FtsMode::Or => " OR ",
    };
    groups.join(joiner)
}

/// Per-term weight: longer terms weigh more, synonym variants half.
pub fn term_weights(original: &[String], expanded: &[String]) -> HashMap<String, f64> {
    let original_set: HashSet<&String> = original.iter().collect();
    expanded
        .iter()
        .map(|t| {
            let mut w = 1.0 + (t.len() as f64 / 6.0).min(1.5);
            if !original_set.contains(t) {
                w *= 0.5;
            }
            (t.clone(), w)
        })
        .collect()
}

/// Lowercase alphanumeric runs of arbitrary text (titles, paths).
pub fn tokenise(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    TOKEN_RE.find_iter(&lowered).map(|m| m.as_str().to_string()).collect()
}
