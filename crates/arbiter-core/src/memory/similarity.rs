//! Entry similarity and suggestion relevance

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::entry::ContextEntry;

const TASK_TYPE_WEIGHT: f64 = 0.30;
const BACKEND_WEIGHT: f64 = 0.20;
const SHARED_TAG_WEIGHT: f64 = 0.10;
const RECENCY_WEIGHT: f64 = 0.20;
const RECENCY_WINDOW_DAYS: f64 = 7.0;
const SHARED_TOKEN_WEIGHT: f64 = 0.05;
const LEXICAL_CAP: f64 = 0.20;
const MIN_TOKEN_LEN: usize = 4;

/// Similarity between two entries in `[0, 1]`
///
/// Symmetric in its arguments. Callers never pass the same entry twice.
pub fn similarity(a: &ContextEntry, b: &ContextEntry) -> f64 {
    similarity_with_tokens(a, &tokens(&a.input), b, &tokens(&b.input))
}

/// [`similarity`] with each entry's input tokens already extracted
pub fn similarity_with_tokens(
    a: &ContextEntry,
    a_tokens: &HashSet<String>,
    b: &ContextEntry,
    b_tokens: &HashSet<String>,
) -> f64 {
    let mut score = 0.0;

    if a.task_type == b.task_type {
        score += TASK_TYPE_WEIGHT;
    }
    if a.backend_id == b.backend_id {
        score += BACKEND_WEIGHT;
    }
    score += a.tags.intersection(&b.tags).count() as f64 * SHARED_TAG_WEIGHT;

    let days_apart = days_between(a.created_at, b.created_at);
    score += RECENCY_WEIGHT * (1.0 - days_apart / RECENCY_WINDOW_DAYS).max(0.0);

    let shared = a_tokens.intersection(b_tokens).count();
    score += (shared as f64 * SHARED_TOKEN_WEIGHT).min(LEXICAL_CAP);

    score.min(1.0)
}

/// Lowercased tokens longer than three characters from a serialized payload
pub fn tokens(value: &serde_json::Value) -> HashSet<String> {
    words(value)
        .into_iter()
        .filter(|w| w.chars().count() >= MIN_TOKEN_LEN)
        .collect()
}

/// Lowercased alphanumeric words from a serialized payload
pub fn words(value: &serde_json::Value) -> HashSet<String> {
    value
        .to_string()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fraction of shared words relative to the larger word set
pub fn word_overlap(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let larger = a.len().max(b.len());
    if larger == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / larger as f64
}

/// Exponential decay that halves every `half_life_days`
pub fn time_decay(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    0.5_f64.powf(age_days.max(0.0) / half_life_days)
}

fn days_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (a - b).num_seconds().abs() as f64 / 86_400.0
}
