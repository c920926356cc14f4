//! Okapi BM25 over an in-memory pool of documents.
//!
//! Corpus statistics (document frequency, average length) come only from the
//! `docs` slice passed in. The retrieval engine scores a bounded scan of the
//! index rather than the whole collection, so scores are relative to that
//! pool and are not comparable across queries.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// BM25 tuning constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Lowercased runs of ASCII letters, digits, and `_`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

/// Score every document in `docs` against `query`.
///
/// Query terms are not deduplicated: a term repeated in the query adds its
/// contribution once per occurrence.
///
/// Returns one score per document, in order. An empty `docs` gives an empty
/// vector; a query with no tokens gives all zeros.
pub fn bm25_scores<S: AsRef<str>>(query: &str, docs: &[S], params: &Bm25Params) -> Vec<f64> {
    if docs.is_empty() {
        return Vec::new();
    }

    let query_terms = tokenize(query);
    if query_terms.is_empty() {
        return vec![0.0; docs.len()];
    }

    let tokenized: Vec<Vec<String>> = docs.iter().map(|d| tokenize(d.as_ref())).collect();
    let n = tokenized.len() as f64;
    let avg_len = (tokenized.iter().map(Vec::len).sum::<usize>() as f64 / n).max(1e-9);

    let distinct: HashSet<&str> = query_terms.iter().map(String::as_str).collect();
    let mut df: HashMap<&str, usize> = HashMap::new();
    for tokens in &tokenized {
        let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        for term in &distinct {
            if unique.contains(term) {
                *df.entry(*term).or_insert(0) += 1;
            }
        }
    }

    let idf: HashMap<&str, f64> = distinct
        .iter()
        .map(|term| {
            let d = df.get(term).copied().unwrap_or(0) as f64;
            (*term, (1.0 + (n - d + 0.5) / (d + 0.5)).ln())
        })
        .collect();

    tokenized
        .iter()
        .map(|tokens| {
            let len = tokens.len().max(1) as f64;
            let mut tf: HashMap<&str, usize> = HashMap::new();
            for t in tokens {
                *tf.entry(t.as_str()).or_insert(0) += 1;
            }
            let norm = params.k1 * (1.0 - params.b + params.b * len / avg_len);
            query_terms
                .iter()
                .map(|term| {
                    let f = tf.get(term.as_str()).copied().unwrap_or(0) as f64;
                    if f == 0.0 {
                        return 0.0;
                    }
                    idf[term.as_str()] * f * (params.k1 + 1.0) / (f + norm)
                })
                .sum()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_splits_on_punctuation() {
        assert_eq!(
            tokenize("Refund-Policy: 30 days, see FAQ_v2!"),
            vec!["refund", "policy", "30", "days", "see", "faq_v2"]
        );
        assert!(tokenize("  ...  ").is_empty());
    }

    #[test]
    fn non_ascii_letters_are_separators() {
        assert_eq!(tokenize("café au lait"), vec!["caf", "au", "lait"]);
    }

    #[test]
    fn empty_pool_and_empty_query() {
        let empty: Vec<&str> = Vec::new();
        assert!(bm25_scores("refund", &empty, &Bm25Params::default()).is_empty());
        let scores = bm25_scores("!!!", &["a b", "c d"], &Bm25Params::default());
        assert_eq!(scores, vec![0.0, 0.0]);
    }

    #[test]
    fn absent_terms_score_zero() {
        let docs = ["the refund policy", "shipping times", "returns and refunds"];
        let scores = bm25_scores("refund", &docs, &Bm25Params::default());
        assert!(scores[0] > 0.0);
        assert_eq!(scores[1], 0.0);
        assert_eq!(scores[2], 0.0);
    }

    #[test]
    fn non_decreasing_in_term_frequency() {
        // Same length, different number of query-term occurrences.
        let docs = [
            "refund alpha beta gamma",
            "refund refund beta gamma",
            "refund refund refund gamma",
            "other words only here",
        ];
        let scores = bm25_scores("refund", &docs, &Bm25Params::default());
        assert!(scores[0] <= scores[1]);
        assert!(scores[1] <= scores[2]);
        assert!(scores[0] > 0.0);
    }

    #[test]
    fn rarer_terms_weigh_more() {
        let docs = ["common rare", "common", "common", "common"];
        let rare = bm25_scores("rare", &docs, &Bm25Params::default());
        let common = bm25_scores("common", &docs, &Bm25Params::default());
        assert!(rare[0] > common[0]);
    }

    #[test]
    fn repeated_query_terms_weigh_per_occurrence() {
        let docs = ["refund policy", "nothing here"];
        let once = bm25_scores("refund", &docs, &Bm25Params::default());
        let twice = bm25_scores("refund REFUND", &docs, &Bm25Params::default());
        assert!((twice[0] - 2.0 * once[0]).abs() < 1e-12);
        assert_eq!(twice[1], 0.0);
    }

    #[test]
    fn idf_matches_formula_for_single_doc() {
        let docs = ["refund"];
        let p = Bm25Params::default();
        let scores = bm25_scores("refund", &docs, &p);
        let idf = (1.0f64 + 0.5 / 1.5).ln();
        let expected = idf * (p.k1 + 1.0) / (1.0 + p.k1);
        assert!((scores[0] - expected).abs() < 1e-12);
    }
}
