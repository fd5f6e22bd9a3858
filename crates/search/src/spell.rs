use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use vigilare_storage::SearchStore;

use crate::query::normalise_tokens;

/// Minimum similarity for a vocabulary term to be offered as a correction.
const SIMILARITY_CUTOFF: f64 = 0.75;
/// How many same-first-letter vocabulary terms to consider per typo.
const CANDIDATE_LIMIT: i64 = 50;

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]+").unwrap());

/// Rewrite the query with vocabulary-backed corrections, or `None` when
/// every term is already known (or nothing close enough exists).
pub async fn spelling_suggestion(store: &SearchStore, raw_query: &str) -> Result<Option<String>> {
    let terms = normalise_tokens(raw_query);
    if terms.is_empty() {
        return Ok(None);
    }

    let mut corrections: Vec<(String, String)> = Vec::new();
    for term in &terms {
        if store.vocab_contains(term).await? {
            continue;
        }
        let Some(first) = term.chars().next() else { continue };
        let candidates = store.vocab_candidates(first, CANDIDATE_LIMIT).await?;
        if let Some(best) = closest_match(term, &candidates) {
            corrections.push((term.clone(), best));
        }
    }

    if corrections.is_empty() {
        return Ok(None);
    }

    let lowered = raw_query.to_lowercase();
    let rewritten = WORD_RE.replace_all(&lowered, |caps: &regex::Captures<'_>| {
        let word = &caps[0];
        corrections
            .iter()
            .find(|(wrong, _)| wrong == word)
            .map(|(_, right)| right.clone())
            .unwrap_or_else(|| word.to_string())
    });

    if rewritten == lowered {
        return Ok(None);
    }
    Ok(Some(rewritten.into_owned()))
}

// Jaro-Winkler forgives transpositions (`pyhton` → `python`), which plain
// Levenshtein pushes below the cutoff.
fn closest_match(term: &str, candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .map(|c| (strsim::jaro_winkler(term, c), c))
        .filter(|(sim, _)| *sim >= SIMILARITY_CUTOFF)
        .max_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, c)| c.clone())
}
