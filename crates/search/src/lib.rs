pub mod query;
pub mod rate_limit;
pub mod score;
pub mod snippet;
pub mod spell;

pub use rate_limit::RateLimiter;

use std::time::Instant;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::warn;
use url::Url;

use vigilare_core::config::UNKNOWN_DOMAIN_RANK;
use vigilare_storage::{CandidateRow, SearchStore};

use crate::query::{
    build_fts_query, expand_terms, extract_site_directive, normalise_for_brand, normalise_tokens,
    term_weights, FtsMode, CANDIDATE_POOL_SIZE, FALLBACK_SCORE_FACTOR, MAX_QUERY_LENGTH,
    MIN_GOOD_HITS, PER_PAGE,
};
use crate::score::{calculate_score, QueryContext};
use crate::snippet::contextual_snippet;
use crate::spell::spelling_suggestion;

/// Domains below this externally supplied rank render as verified.
const VERIFIED_RANK_THRESHOLD: i64 = 10_000;
/// Flat score penalty per prior result from the same domain.
const DIVERSITY_PENALTY: f64 = 15.0;

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub domain: String,
    pub snippet: String,
    pub lang: Option<String>,
    pub rank: i64,
    pub verified: bool,
}

#[derive(Debug, Serialize, Default)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub count: usize,
    pub time: f64,
    pub page: usize,
    pub total_pages: usize,
    pub suggestion: Option<String>,
}

static URL_PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://(www\.)?").unwrap());

pub struct SearchEngine {
    store: SearchStore,
}

impl SearchEngine {
    pub fn new(store: SearchStore) -> Self {
        Self { store }
    }

    /// Serve one query. Failures are logged and produce an empty response;
    /// a search request never takes the server down.
    pub async fn search(&self, raw_query: &str, page: usize, user_lang: &str) -> SearchResponse {
        let started = Instant::now();
        let raw_query: String = raw_query.trim().chars().take(MAX_QUERY_LENGTH).collect();
        let page = page.max(1);

        if raw_query.is_empty() {
            return SearchResponse { page, ..Default::default() };
        }

        match self.run(&raw_query, page, user_lang).await {
            Ok(mut resp) => {
                resp.time = round4(started.elapsed().as_secs_f64());
                resp
            }
            Err(e) => {
                warn!(query = %raw_query, "search failed: {e}");
                SearchResponse {
                    query: raw_query,
                    page,
                    time: round4(started.elapsed().as_secs_f64()),
                    ..Default::default()
                }
            }
        }
    }

    async fn run(&self, raw_query: &str, page: usize, user_lang: &str) -> Result<SearchResponse> {
        let site_directive = extract_site_directive(raw_query);
        let mut base_terms = normalise_tokens(raw_query);
        if base_terms.is_empty() {
            base_terms = raw_query.to_lowercase().split_whitespace().map(String::from).collect();
        }
        let expanded_terms = expand_terms(&base_terms);
        let weights = term_weights(&base_terms, &expanded_terms);

        let ctx = QueryContext {
            navigational: base_terms.len() <= 2,
            expanded_terms,
            weights,
            site_directive,
            brand: normalise_for_brand(raw_query),
            user_lang: user_lang.to_string(),
        };

        let mut rows = self
            .store
            .candidates(&build_fts_query(&base_terms, FtsMode::And), CANDIDATE_POOL_SIZE)
            .await?;

        let suggestion = if rows.len() < MIN_GOOD_HITS {
            spelling_suggestion(&self.store, raw_query).await.unwrap_or(None)
        } else {
            None
        };

        let mut fallback = false;
        if rows.len() < MIN_GOOD_HITS && base_terms.len() > 1 {
            fallback = true;
            rows = self
                .store
                .candidates(&build_fts_query(&base_terms, FtsMode::Or), CANDIDATE_POOL_SIZE)
                .await?;
        }

        // Drop near-identical URLs (scheme/www/trailing-slash variants)
        // before scoring.
        let mut seen_norm = std::collections::HashSet::new();
        let mut pre_scored: Vec<(f64, CandidateRow)> = Vec::with_capacity(rows.len());
        for row in rows {
            let norm = normalise_result_url(&row.url);
            if !seen_norm.insert(norm) {
                continue;
            }
            let mut score = calculate_score(&row, &ctx);
            if fallback {
                score *= FALLBACK_SCORE_FACTOR;
            }
            pre_scored.push((score, row));
        }
        pre_scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        // Single-pass per-domain diversity penalty, then final ordering.
        let mut domain_counts: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        let mut final_scored: Vec<(f64, CandidateRow)> = Vec::with_capacity(pre_scored.len());
        for (score, row) in pre_scored {
            let domain = netloc_of(&row.url);
            let count = domain_counts.entry(domain).or_insert(0);
            final_scored.push((score - *count as f64 * DIVERSITY_PENALTY, row));
            *count += 1;
        }
        final_scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let count = final_scored.len();
        let total_pages = count / PER_PAGE + usize::from(count % PER_PAGE != 0);
        let start = (page - 1) * PER_PAGE;

        let results = final_scored
            .into_iter()
            .skip(start)
            .take(PER_PAGE)
            .map(|(_, row)| {
                let mut snip =
                    contextual_snippet(row.content_sample.as_deref().unwrap_or(""), &base_terms);
                if snip.chars().count() < 20 {
                    if let Some(desc) = row.description.as_deref().filter(|d| !d.is_empty()) {
                        snip = format!("{}...", desc.chars().take(250).collect::<String>());
                    }
                }

                let rank = row.domain_rank.unwrap_or(UNKNOWN_DOMAIN_RANK);
                SearchResult {
                    title: row
                        .title
                        .clone()
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| row.url.clone()),
                    domain: netloc_of(&row.url),
                    url: row.url,
                    snippet: snip,
                    lang: row.language,
                    rank,
                    verified: rank < VERIFIED_RANK_THRESHOLD,
                }
            })
            .collect();

        Ok(SearchResponse {
            query: raw_query.to_string(),
            results,
            count,
            time: 0.0,
            page,
            total_pages,
            suggestion,
        })
    }

    /// Title autocomplete; inputs shorter than 2 chars return nothing.
    pub async fn suggest(&self, q: &str) -> Vec<String> {
        let q = q.trim();
        if q.chars().count() < 2 {
            return Vec::new();
        }
        self.store.suggest_titles(q, 5).await.unwrap_or_default()
    }
}

fn normalise_result_url(url: &str) -> String {
    let lowered = url.to_lowercase();
    URL_PREFIX_RE.replace(&lowered, "").trim_end_matches('/').to_string()
}

fn netloc_of(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        },
        Err(_) => String::new(),
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_url_normalisation_merges_variants() {
        assert_eq!(normalise_result_url("https://www.Example.com/A/"), "example.com/a");
        assert_eq!(normalise_result_url("http://example.com/a"), "example.com/a");
        assert_eq!(
            normalise_result_url("https://example.com/a"),
            normalise_result_url("http://www.example.com/a/")
        );
    }

    #[test]
    fn diversity_penalty_is_15_per_repeat() {
        // Mirror the penalty pass over a pre-sorted slice of one domain.
        let scores = [500.0, 400.0, 300.0];
        let mut counts = 0usize;
        let adjusted: Vec<f64> = scores
            .iter()
            .map(|s| {
                let out = s - counts as f64 * DIVERSITY_PENALTY;
                counts += 1;
                out
            })
            .collect();
        assert_eq!(adjusted, vec![500.0, 385.0, 270.0]);
    }
}
