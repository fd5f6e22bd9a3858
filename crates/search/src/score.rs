use std::collections::HashMap;

use chrono::NaiveDateTime;
use url::Url;

use vigilare_storage::CandidateRow;

use crate::query::tokenise;

/// Everything about the query that scoring needs, computed once per request.
pub struct QueryContext {
    pub expanded_terms: Vec<String>,
    pub weights: HashMap<String, f64>,
    /// Queries of at most two terms are treated as navigational.
    pub navigational: bool,
    pub site_directive: Option<String>,
    /// Alphanumeric-only form of the raw query, for brand matching.
    pub brand: String,
    pub user_lang: String,
}

/// Second-level suffixes treated as part of the TLD when splitting a host
/// into registered domain + suffix.
const SECOND_LEVEL_SUFFIXES: &[&str] = &[
    "co.uk", "ac.uk", "gov.uk", "org.uk", "com.au", "net.au", "org.au", "co.jp", "co.nz",
    "co.in", "com.br", "com.cn", "co.za",
];

/// Split a host into (registered base, suffix): `docs.github.com` →
/// (`github`, `com`), `news.bbc.co.uk` → (`bbc`, `co.uk`).
pub fn domain_parts(host: &str) -> (String, String) {
    let host = host.split(':').next().unwrap_or(host);
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return (host.to_string(), String::new());
    }

    let last_two = labels[labels.len() - 2..].join(".");
    if SECOND_LEVEL_SUFFIXES.contains(&last_two.as_str()) && labels.len() >= 3 {
        (labels[labels.len() - 3].to_string(), last_two)
    } else {
        (labels[labels.len() - 2].to_string(), labels[labels.len() - 1].to_string())
    }
}

fn saturation(val: f64, cap: f64) -> f64 {
    (val / cap).min(1.0)
}

/// Positional span of matching tokens; tight clusters score up to 30.
pub fn multi_term_proximity(text: &str, terms: &[String]) -> f64 {
    let tokens = tokenise(text);
    if tokens.len() < 2 || terms.len() < 2 {
        return 0.0;
    }

    let positions: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, tok)| terms.iter().any(|t| tok.contains(t.as_str())))
        .map(|(i, _)| i)
        .collect();

    if positions.len() < 2 {
        return 0.0;
    }
    let span = (positions[positions.len() - 1] - positions[0]) as f64;
    (30.0 / (1.0 + span)).max(0.0)
}

/// Externally supplied authority: lower rank is better, capped at 60.
pub fn authority_score(rank: Option<i64>) -> f64 {
    match rank {
        Some(r) if r > 0 => (160.0 / (1.0 + ((r as f64) + 10.0).log10())).min(60.0),
        _ => 0.0,
    }
}

pub fn pagerank_score(pr: Option<f64>) -> f64 {
    match pr {
        Some(v) if v > 0.0 => (v * 10.0 + 1.0).ln() * 15.0,
        _ => 0.0,
    }
}

/// Exponential decay with a 200-day half-life-ish constant, max 25.
pub fn freshness_score(crawled_at: Option<&str>) -> f64 {
    let Some(raw) = crawled_at else { return 0.0 };
    let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") else {
        return 0.0;
    };
    let age_days = (chrono::Utc::now().naive_utc() - dt).num_days().max(0) as f64;
    25.0 * (-age_days / 200.0).exp()
}

pub fn tld_bias(suffix: &str) -> f64 {
    match suffix {
        "gov" | "edu" | "org" => 15.0,
        "io" | "dev" | "net" => 8.0,
        _ => 0.0,
    }
}

pub fn url_quality(path: &str, raw_url: &str) -> f64 {
    let mut score = 0.0;
    let depth = path.matches('/').count() as i64;
    score -= ((depth - 3).max(0) * 4) as f64;

    if raw_url.contains('?') {
        score -= 12.0;
    }

    score += (tokenise(path).len() as f64 * 2.0).min(10.0);

    if path.is_empty() || path == "/" {
        score += 12.0;
    }
    score
}

/// Exact-phrase and weighted per-field hit scoring over title,
/// description and URL, plus positional proximity.
pub fn field_score(
    title: &str,
    description: &str,
    url: &str,
    terms: &[String],
    weights: &HashMap<String, f64>,
) -> f64 {
    let title = title.to_lowercase();
    let description = description.to_lowercase();
    let url = url.to_lowercase();

    let mut score = 0.0;
    let phrase = terms.join(" ");

    if !phrase.is_empty() {
        if title.contains(&phrase) {
            score += 90.0;
        } else if description.contains(&phrase) {
            score += 50.0;
        }
    }

    let hits = |field: &str| -> f64 {
        terms
            .iter()
            .filter(|t| field.contains(t.as_str()))
            .map(|t| weights.get(t).copied().unwrap_or(0.0))
            .sum()
    };

    score += saturation(hits(&title), 4.0) * 70.0;
    score += saturation(hits(&description), 6.0) * 35.0;
    score += saturation(hits(&url), 4.0) * 30.0;

    score += multi_term_proximity(&title, terms) * 1.6;
    score += multi_term_proximity(&description, terms);

    score
}

/// Match against the user's Accept-Language primary tag. Detected codes
/// are ISO 639-3 (`eng`) while browsers send 639-1 (`en`), so a prefix
/// match counts as a full match.
pub fn language_score(row_lang: Option<&str>, user_lang: &str) -> f64 {
    let Some(row_lang) = row_lang.filter(|l| !l.is_empty()) else {
        return 0.0;
    };
    let rl = row_lang.to_lowercase();
    let rl = rl.split('-').next().unwrap_or(&rl);
    let ul = user_lang.to_lowercase();
    let ul = ul.split('-').next().unwrap_or(&ul);

    if ul.is_empty() {
        return 0.0;
    }
    if rl == ul || rl.starts_with(ul) || ul.starts_with(rl) {
        return 40.0;
    }
    if rl.chars().next() == ul.chars().next() {
        return 8.0;
    }
    -10.0
}

/// The full multi-signal score for one candidate. Unparseable URLs score 0.
pub fn calculate_score(row: &CandidateRow, ctx: &QueryContext) -> f64 {
    let Ok(parsed) = Url::parse(&row.url) else {
        return 0.0;
    };
    let Some(host) = parsed.host_str() else {
        return 0.0;
    };
    let netloc = match parsed.port() {
        Some(p) => format!("{host}:{p}"),
        None => host.to_string(),
    };
    let (domain_base, suffix) = domain_parts(host);
    let path = parsed.path();
    let is_root = path.is_empty() || path == "/";

    let mut score = 100.0;

    score += ((20.0 - row.bm25) * 2.0).max(0.0);
    score += authority_score(row.domain_rank);
    score += pagerank_score(row.page_rank);
    score += freshness_score(row.crawled_at.as_deref());
    score += tld_bias(&suffix);
    score += url_quality(path, &row.url);
    score += language_score(row.language.as_deref(), &ctx.user_lang);
    score += field_score(
        row.title.as_deref().unwrap_or(""),
        row.description.as_deref().unwrap_or(""),
        &row.url,
        &ctx.expanded_terms,
        &ctx.weights,
    );

    if ctx.navigational && !ctx.brand.is_empty() && netloc.contains(&ctx.brand) {
        score += 180.0;
    }

    if let Some(sd) = &ctx.site_directive {
        let sd = sd.trim_end_matches('/');
        if !sd.is_empty() && (netloc.contains(sd) || sd == domain_base) {
            score += if is_root { 240.0 } else { 80.0 };
        }
    }

    if !ctx.brand.is_empty() && ctx.brand == domain_base {
        score += if is_root { 240.0 } else { 40.0 };
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(url: &str) -> CandidateRow {
        CandidateRow {
            url: url.to_string(),
            title: Some("GitHub: Where the world builds software".into()),
            description: None,
            content_sample: None,
            crawled_at: None,
            language: None,
            domain_rank: None,
            page_rank: None,
            bm25: 0.0,
        }
    }

    fn ctx(query: &str) -> QueryContext {
        let base = crate::query::normalise_tokens(query);
        let expanded = crate::query::expand_terms(&base);
        let weights = crate::query::term_weights(&base, &expanded);
        QueryContext {
            navigational: base.len() <= 2,
            expanded_terms: expanded,
            weights,
            site_directive: crate::query::extract_site_directive(query),
            brand: crate::query::normalise_for_brand(query),
            user_lang: "en".into(),
        }
    }

    #[test]
    fn domain_parts_handles_second_level_suffixes() {
        assert_eq!(domain_parts("docs.github.com"), ("github".into(), "com".into()));
        assert_eq!(domain_parts("news.bbc.co.uk"), ("bbc".into(), "co.uk".into()));
        assert_eq!(domain_parts("localhost"), ("localhost".into(), "".into()));
        assert_eq!(domain_parts("example.com:8080"), ("example".into(), "com".into()));
    }

    #[test]
    fn negative_bm25_scores_above_weak_matches() {
        // FTS5 bm25 is lower-is-better and goes negative on strong matches.
        let c = ctx("github");
        let mut strong = row("https://example.org/a");
        strong.bm25 = -8.0;
        let mut weak = row("https://example.org/a");
        weak.bm25 = 5.0;
        assert!(calculate_score(&strong, &c) > calculate_score(&weak, &c));
    }

    #[test]
    fn authority_saturates_at_60() {
        assert!(authority_score(Some(1)) <= 60.0);
        assert!(authority_score(Some(1)) > authority_score(Some(1_000_000)));
        assert_eq!(authority_score(None), 0.0);
    }

    #[test]
    fn url_quality_prefers_shallow_clean_paths() {
        assert_eq!(url_quality("/", "https://example.com/"), 12.0);
        let deep = url_quality("/a/b/c/d/e", "https://example.com/a/b/c/d/e");
        // depth 5 → -8, five path tokens capped at +10
        assert_eq!(deep, 2.0);
        assert!(url_quality("/a", "https://example.com/a?x=1") < url_quality("/a", "https://example.com/a"));
    }

    #[test]
    fn language_prefix_counts_as_match() {
        assert_eq!(language_score(Some("eng"), "en-US"), 40.0);
        assert_eq!(language_score(Some("deu"), "en"), -10.0);
        assert_eq!(language_score(Some("epo"), "en"), 8.0);
        assert_eq!(language_score(None, "en"), 0.0);
    }

    #[test]
    fn phrase_in_title_beats_scattered_hits() {
        let terms = vec!["install".to_string(), "rust".to_string()];
        let weights = crate::query::term_weights(&terms, &terms);
        let exact = field_score("install rust quickly", "", "", &terms, &weights);
        let scattered = field_score("rust is fun to install", "", "", &terms, &weights);
        assert!(exact > scattered);
    }

    #[test]
    fn brand_root_outranks_deep_page_by_at_least_220() {
        let c = ctx("github");
        let root = calculate_score(&row("https://github.com/"), &c);
        let deep = calculate_score(&row("https://github.com/a/b/c/d?tab=repos"), &c);
        assert!(root - deep >= 220.0, "root={root} deep={deep}");
    }

    #[test]
    fn site_directive_boosts_matching_host() {
        let c = ctx("tokio site:docs.rs");
        let on_site = calculate_score(&row("https://docs.rs/tokio"), &c);
        let off_site = calculate_score(&row("https://example.com/tokio"), &c);
        assert!(on_site > off_site);
    }

    #[test]
    fn proximity_rewards_tight_spans() {
        let terms = vec!["install".to_string(), "rust".to_string()];
        let tight = multi_term_proximity("install rust now", &terms);
        let loose = multi_term_proximity("install something something something rust", &terms);
        assert!(tight > loose);
        assert_eq!(multi_term_proximity("install only", &terms), 0.0);
    }
}
