//! Field-weighted re-scoring.
//!
//! The query is treated as a parsed value (quoted phrases plus individual
//! terms) and scoring is a pure function over (document fields, parsed
//! query, weights). The engine multiplies |BM25| by `0.3 + max_field_score`;
//! the 0.3 floor keeps a BM25 contribution alive when no weighted field
//! matches.

use crate::indexer::extract_text;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;

static PHRASE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]+)""#).unwrap());

/// Boost weight at or above which a field is treated as primary (titles):
/// exact equality bonuses grow and long texts are penalized.
const HIGH_BOOST: f64 = 2.5;

/// Bonus when a quoted phrase occurs inside a weighted field.
const PHRASE_BONUS: f64 = 15.0;
/// Additional bonus when the whole field equals the phrase.
const FIELD_EQUALS_PHRASE_BONUS: f64 = 50.0;
/// Additional bonus when equality holds after stripping punctuation.
const FIELD_EQUALS_STRIPPED_BONUS: f64 = 30.0;

/// A query reduced to its exact phrases and individual terms, lowercased.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedQuery {
    pub phrases: Vec<String>,
    pub terms: Vec<String>,
}

impl ParsedQuery {
    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty() && self.terms.is_empty()
    }
}

/// Extract quoted phrases; everything outside quotes becomes individual
/// terms.
pub fn parse_query(raw: &str) -> ParsedQuery {
    let lowered = raw.to_lowercase();
    let phrases: Vec<String> = PHRASE_RE
        .captures_iter(&lowered)
        .map(|cap| cap[1].trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    let without_phrases = PHRASE_RE.replace_all(&lowered, " ");
    let terms: Vec<String> = without_phrases
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect();

    ParsedQuery { phrases, terms }
}

fn strip_punctuation(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Score one field against the parsed query. Returns 0 when nothing matches.
fn field_score(text: &str, weight: f64, query: &ParsedQuery) -> f64 {
    let text_lower = text.to_lowercase();
    let text_trimmed = text_lower.trim();
    let mut matched = 0.0_f64;

    for phrase in &query.phrases {
        if !text_lower.contains(phrase.as_str()) {
            continue;
        }
        let mut bonus = PHRASE_BONUS;
        if text_trimmed == phrase {
            bonus += FIELD_EQUALS_PHRASE_BONUS;
        } else if strip_punctuation(text_trimmed) == strip_punctuation(phrase) {
            bonus += FIELD_EQUALS_STRIPPED_BONUS;
        }
        matched += bonus;
    }

    if query.phrases.is_empty() {
        for term in &query.terms {
            if !text_lower.contains(term.as_str()) {
                continue;
            }
            matched += 1.0;
            if weight >= HIGH_BOOST && text_trimmed == term {
                matched += 2.0;
            }
        }
    }

    if matched == 0.0 {
        return 0.0;
    }

    // Long texts in primary fields dilute the match; cap the penalty at 0.5.
    if weight >= HIGH_BOOST {
        let len = text_trimmed.chars().count();
        if len > 100 {
            let penalty = (0.5 * (len as f64 - 100.0) / 400.0).min(0.5);
            matched *= 1.0 - penalty;
        }
    }

    weight * matched.powf(1.5)
}

/// Best field score across the weighted fields of a document.
pub fn max_field_score(
    content: &Map<String, Value>,
    weights: &HashMap<String, f64>,
    query: &ParsedQuery,
) -> f64 {
    weights
        .iter()
        .filter_map(|(field, weight)| {
            let value = content.get(field)?;
            let text = extract_text(value);
            if text.is_empty() {
                return None;
            }
            Some(field_score(&text, *weight, query))
        })
        .fold(0.0, f64::max)
}

/// Final two-pass score: |BM25| scaled by the best weighted-field match.
pub fn rescore(bm25_rank: f64, max_field: f64) -> f64 {
    bm25_rank.abs() * (0.3 + max_field)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    fn weights(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_parse_query_phrases_and_terms() {
        let parsed = parse_query(r#"fast "star wars" saga"#);
        assert_eq!(parsed.phrases, vec!["star wars"]);
        assert_eq!(parsed.terms, vec!["fast", "saga"]);
    }

    #[test]
    fn test_parse_query_plain_terms() {
        let parsed = parse_query("Coffee, shops!");
        assert!(parsed.phrases.is_empty());
        assert_eq!(parsed.terms, vec!["coffee", "shops"]);
    }

    #[test]
    fn test_exact_phrase_field_equality_dominates() {
        let query = parse_query(r#""star wars""#);
        let w = weights(&[("title", 3.0)]);

        let exact = max_field_score(&content(&[("title", "Star Wars")]), &w, &query);
        let partial =
            max_field_score(&content(&[("title", "Star Wars: Deleted Magic")]), &w, &query);
        let miss = max_field_score(&content(&[("title", "Apocalypse Now")]), &w, &query);

        assert!(exact > partial, "exact {} vs partial {}", exact, partial);
        assert!(partial > 0.0);
        assert_eq!(miss, 0.0);
    }

    #[test]
    fn test_stripped_equality_bonus() {
        let query = parse_query(r#""star wars""#);
        let w = weights(&[("title", 3.0)]);
        let stripped = max_field_score(&content(&[("title", "Star Wars!")]), &w, &query);
        let contains =
            max_field_score(&content(&[("title", "Star Wars Episode IV")]), &w, &query);
        assert!(stripped > contains);
    }

    #[test]
    fn test_term_matching_counts_per_term() {
        let query = parse_query("star wars");
        let w = weights(&[("title", 1.0)]);
        let both = max_field_score(&content(&[("title", "star wars saga")]), &w, &query);
        let one = max_field_score(&content(&[("title", "star trek")]), &w, &query);
        assert!(both > one);
        assert!(one > 0.0);
    }

    #[test]
    fn test_high_boost_exact_term_bonus() {
        let query = parse_query("gladiator");
        let high = weights(&[("title", 3.0)]);
        let exact = max_field_score(&content(&[("title", "gladiator")]), &high, &query);
        let contains = max_field_score(&content(&[("title", "gladiator ii")]), &high, &query);
        assert!(exact > contains);
    }

    #[test]
    fn test_length_penalty_on_high_boost_fields() {
        let query = parse_query("needle");
        let w = weights(&[("title", 3.0)]);
        let short = max_field_score(&content(&[("title", "needle in time")]), &w, &query);
        let long_text = format!("needle {}", "hay ".repeat(200));
        let long = max_field_score(&content(&[("title", long_text.as_str())]), &w, &query);
        assert!(short > long, "short {} vs long {}", short, long);
        assert!(long > 0.0, "penalty caps at half, never zeroes");
    }

    #[test]
    fn test_max_over_fields() {
        let query = parse_query("rust");
        let w = weights(&[("title", 3.0), ("body", 1.0)]);
        let doc = content(&[("title", "rust book"), ("body", "all about rust")]);
        let title_only = content(&[("title", "rust book"), ("body", "unrelated")]);
        assert_eq!(
            max_field_score(&doc, &w, &query),
            max_field_score(&title_only, &w, &query),
            "max, not sum, across fields"
        );
    }

    #[test]
    fn test_rescore_uses_absolute_bm25_with_floor() {
        // No field match: the 0.3 floor keeps BM25 ordering intact
        let weak = rescore(-1.0, 0.0);
        let strong = rescore(-4.0, 0.0);
        assert!(strong > weak);
        // A field match amplifies
        assert!(rescore(-1.0, 5.0) > rescore(-1.0, 0.0));
    }
}
