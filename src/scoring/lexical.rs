//! In-memory Okapi BM25 over a small document set.
//!
//! Every call to `score` indexes exactly the documents it is given, so the
//! collection statistics (document frequency, average length) are those of
//! the tie group being ranked.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use super::{RelevanceScorer, ScorerError};

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\w\w+\b").expect("token regex is valid"));

/// English stopwords dropped before indexing.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
    "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
    "these", "they", "this", "to", "was", "will", "with",
];

/// Lowercased runs of two or more word characters, minus stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    TOKEN_RE
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Bm25Scorer {
    params: Bm25Params,
}

impl Bm25Scorer {
    pub fn new(params: Bm25Params) -> Self {
        Self { params }
    }

    /// Synchronous scoring; the async trait method delegates here.
    pub fn score_texts(&self, query: &str, documents: &[String]) -> Vec<f64> {
        let docs: Vec<Vec<String>> = documents.iter().map(|d| tokenize(d)).collect();
        if docs.is_empty() {
            return Vec::new();
        }

        let n = docs.len() as f64;
        let avg_len = docs.iter().map(Vec::len).sum::<usize>() as f64 / n;

        let mut df: HashMap<&str, usize> = HashMap::new();
        for doc in &docs {
            let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
            for term in unique {
                *df.entry(term).or_default() += 1;
            }
        }

        // Repeated query terms count once per occurrence.
        let query_terms = tokenize(query);
        let Bm25Params { k1, b } = self.params;

        docs.iter()
            .map(|doc| {
                let len = doc.len() as f64;
                let mut tf: HashMap<&str, usize> = HashMap::new();
                for term in doc {
                    *tf.entry(term.as_str()).or_default() += 1;
                }
                query_terms
                    .iter()
                    .map(|term| {
                        let Some(&freq) = tf.get(term.as_str()) else {
                            return 0.0;
                        };
                        let df = df.get(term.as_str()).copied().unwrap_or(0) as f64;
                        let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                        let freq = freq as f64;
                        let norm = if avg_len > 0.0 {
                            1.0 - b + b * len / avg_len
                        } else {
                            1.0
                        };
                        idf * freq / (freq + k1 * norm)
                    })
                    .sum()
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl RelevanceScorer for Bm25Scorer {
    fn name(&self) -> &str {
        "bm25"
    }

    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f64>, ScorerError> {
        Ok(self.score_texts(query, documents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::rank_by_scores;

    fn docs(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn tokenizer_lowercases_and_drops_short_tokens_and_stopwords() {
        assert_eq!(
            tokenize("The Sleep-deprivation of a 5 year old, in 2020"),
            vec!["sleep", "deprivation", "year", "old", "2020"]
        );
    }

    #[test]
    fn matching_documents_outrank_unrelated_ones() {
        let scorer = Bm25Scorer::default();
        let scores = scorer.score_texts(
            "sleep memory consolidation",
            &docs(&[
                "Traffic modelling on urban roads",
                "Sleep supports memory consolidation in adults",
                "Memory allocators for embedded systems",
            ]),
        );
        assert_eq!(rank_by_scores(&scores, &[1, 2, 3]), vec![2, 3, 1]);
        assert_eq!(scores[0], 0.0);
    }

    #[test]
    fn shorter_documents_win_on_equal_term_frequency() {
        let scorer = Bm25Scorer::default();
        let scores = scorer.score_texts(
            "screening",
            &docs(&[
                "screening alpha beta gamma delta epsilon zeta",
                "screening alpha",
                "unrelated words here",
            ]),
        );
        assert!(scores[1] > scores[0]);
    }

    #[test]
    fn empty_inputs_score_zero() {
        let scorer = Bm25Scorer::default();
        assert!(scorer.score_texts("q", &[]).is_empty());
        assert_eq!(scorer.score_texts("", &docs(&["a b"])), vec![0.0]);
    }
}
