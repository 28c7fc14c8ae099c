//! Tokenization and term-frequency scoring for the full-text index.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

/// Tokens shorter than this carry no signal.
const MIN_TOKEN_LEN: usize = 2;
/// Bound on distinct terms indexed per entity; keeps postings bounded for
/// entities with very long notes.
const MAX_TERMS_PER_ENTITY: usize = 512;

static STOPWORDS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "and", "or", "of", "to", "in", "is", "it", "for", "on", "with", "at",
        "this", "that", "was", "are", "be",
    ]
    .into_iter()
    .collect()
});

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(token)
}

/// NFKC-normalized, lowercased word tokens.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    let normalized: String = text.nfkc().collect();
    normalized
        .unicode_words()
        .map(str::to_lowercase)
        .filter(|token| token.chars().count() >= MIN_TOKEN_LEN && !is_stopword(token))
        .collect::<Vec<_>>()
        .into_iter()
}

/// Term frequencies for one entity's searchable text, capped so a single
/// entity cannot dominate the postings.
#[must_use]
pub fn term_frequencies(text: &str) -> BTreeMap<String, u32> {
    let mut frequencies = BTreeMap::new();
    for token in tokenize(text) {
        if frequencies.len() >= MAX_TERMS_PER_ENTITY && !frequencies.contains_key(&token) {
            continue;
        }
        *frequencies.entry(token).or_insert(0) += 1;
    }
    frequencies
}

/// tf-idf contribution of one matched term.
#[must_use]
pub fn score_term(tf: u32, doc_count: usize, df: usize) -> f64 {
    if df == 0 {
        return 0.0;
    }
    let idf = (1.0 + doc_count as f64 / df as f64).ln();
    f64::from(tf) * idf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_drops_noise() {
        let tokens: Vec<String> = tokenize("The Quick-Brown Fox, v2 review!").collect();
        assert_eq!(tokens, vec!["quick", "brown", "fox", "v2", "review"]);
    }

    #[test]
    fn tokenize_normalizes_unicode() {
        // Fullwidth letters fold to ASCII under NFKC.
        let tokens: Vec<String> = tokenize("ｒｅｖｉｅｗ session").collect();
        assert_eq!(tokens, vec!["review", "session"]);
    }

    #[test]
    fn term_frequencies_count_repeats() {
        let frequencies = term_frequencies("billing review billing escalation");
        assert_eq!(frequencies.get("billing"), Some(&2));
        assert_eq!(frequencies.get("review"), Some(&1));
        assert_eq!(frequencies.get("escalation"), Some(&1));
    }

    #[test]
    fn rarer_terms_score_higher() {
        let common = score_term(1, 1000, 900);
        let rare = score_term(1, 1000, 3);
        assert!(rare > common);
        assert_eq!(score_term(1, 1000, 0), 0.0);
    }
}
