//! Pointwise re-ranking of aggregated estimates.
//!
//! Documents are ordered by estimate; each run of equal estimates is then
//! ordered by an auxiliary relevance scorer. When that scorer fails the group
//! is ordered by BM25 over the abstracts instead, so a missing reranker never
//! fails the ranking.

use std::cmp::Ordering;
use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, warn};

use super::aggregate::ScoredDocument;
use super::decision::{is_valid, INVALID};
use crate::scoring::{rank_by_scores, Bm25Scorer, RelevanceScorer, ScorerError};

#[derive(Debug, Error)]
pub enum RerankError {
    #[error("document {0} appears more than once in the input")]
    DuplicateId(i64),
}

/// Final document order with bookkeeping about how ties were broken.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    pub ids: Vec<i64>,
    /// Tie groups of two or more documents.
    pub tie_groups: usize,
    /// Tie groups ordered by the lexical fallback.
    pub fallbacks: usize,
}

pub struct PointwiseReranker<'a> {
    scorer: &'a dyn RelevanceScorer,
    fallback: Bm25Scorer,
}

impl<'a> PointwiseReranker<'a> {
    pub fn new(scorer: &'a dyn RelevanceScorer) -> Self {
        Self {
            scorer,
            fallback: Bm25Scorer::default(),
        }
    }

    pub fn scorer_name(&self) -> &str {
        self.scorer.name()
    }

    /// Order `documents` by estimate, breaking ties with the scorer.
    ///
    /// The result is a permutation of the input ids.
    pub async fn rerank(
        &self,
        mut documents: Vec<ScoredDocument>,
        query: &str,
    ) -> Result<Ranking, RerankError> {
        let mut seen = HashSet::with_capacity(documents.len());
        for doc in &documents {
            if !seen.insert(doc.document.id) {
                return Err(RerankError::DuplicateId(doc.document.id));
            }
        }

        impute_invalid(&mut documents);
        documents.sort_by(|a, b| b.estimate.total_cmp(&a.estimate));

        let mut ranking = Ranking {
            ids: Vec::with_capacity(documents.len()),
            tie_groups: 0,
            fallbacks: 0,
        };

        for group in documents.chunk_by(|a, b| a.estimate.total_cmp(&b.estimate) == Ordering::Equal) {
            if group.len() == 1 {
                ranking.ids.push(group[0].document.id);
                continue;
            }
            ranking.tie_groups += 1;
            let (ids, used_fallback) = self.order_group(group, query).await;
            if used_fallback {
                ranking.fallbacks += 1;
            }
            ranking.ids.extend(ids);
        }

        debug!(
            documents = ranking.ids.len(),
            tie_groups = ranking.tie_groups,
            fallbacks = ranking.fallbacks,
            "Reranked documents"
        );
        Ok(ranking)
    }

    async fn order_group(&self, group: &[ScoredDocument], query: &str) -> (Vec<i64>, bool) {
        let ids: Vec<i64> = group.iter().map(|d| d.document.id).collect();
        let texts: Vec<String> = group.iter().map(|d| d.document.title_abstract()).collect();

        let err = match self.scorer.score(query, &texts).await {
            Ok(scores) if scores.len() == ids.len() => {
                return (self.scorer.rank(&scores, &ids), false);
            }
            Ok(scores) => ScorerError::Length {
                expected: ids.len(),
                found: scores.len(),
            },
            Err(err) => err,
        };

        warn!(
            scorer = self.scorer.name(),
            group_size = group.len(),
            estimate = group[0].estimate,
            error = %err,
            "Reranker failed; falling back to BM25 for this group"
        );
        let abstracts: Vec<String> = group
            .iter()
            .map(|d| d.document.abstract_text.clone())
            .collect();
        let scores = self.fallback.score_texts(query, &abstracts);
        (rank_by_scores(&scores, &ids), true)
    }
}

/// Replace INVALID estimates with the mean of the valid ones.
///
/// Left unchanged when no estimate is valid.
pub fn impute_invalid(documents: &mut [ScoredDocument]) {
    let valid: Vec<f64> = documents
        .iter()
        .map(|d| d.estimate)
        .filter(|&e| is_valid(e))
        .collect();
    if valid.is_empty() || valid.len() == documents.len() {
        return;
    }
    let mean = valid.iter().sum::<f64>() / valid.len() as f64;
    for doc in documents.iter_mut().filter(|d| d.estimate == INVALID) {
        doc.estimate = mean;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Document;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn scored(id: i64, estimate: f64, abstract_text: &str) -> ScoredDocument {
        ScoredDocument {
            document: Document::new(id, format!("title {id}"), abstract_text, 0),
            estimate,
        }
    }

    /// Scores by a fixed table keyed on title; records every group it sees.
    struct TableScorer {
        scores: HashMap<String, f64>,
        groups: Mutex<Vec<usize>>,
    }

    impl TableScorer {
        fn new(scores: &[(i64, f64)]) -> Self {
            Self {
                scores: scores
                    .iter()
                    .map(|(id, s)| (format!("title {id}"), *s))
                    .collect(),
                groups: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl RelevanceScorer for TableScorer {
        fn name(&self) -> &str {
            "table"
        }

        async fn score(&self, _query: &str, documents: &[String]) -> Result<Vec<f64>, ScorerError> {
            self.groups.lock().unwrap().push(documents.len());
            Ok(documents
                .iter()
                .map(|text| {
                    self.scores
                        .iter()
                        .find(|(title, _)| text.starts_with(&format!("{title} ")))
                        .map(|(_, s)| *s)
                        .unwrap_or(0.0)
                })
                .collect())
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl RelevanceScorer for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f64>, ScorerError> {
            Err(ScorerError::Unavailable("no model".to_string()))
        }
    }

    #[test]
    fn invalid_estimates_take_the_mean_of_valid_ones() {
        let mut docs = vec![scored(1, 2.0, ""), scored(2, INVALID, ""), scored(3, 6.0, "")];
        impute_invalid(&mut docs);
        assert_eq!(docs[1].estimate, 4.0);
    }

    #[test]
    fn all_invalid_is_left_alone() {
        let mut docs = vec![scored(1, INVALID, ""), scored(2, INVALID, "")];
        impute_invalid(&mut docs);
        assert!(docs.iter().all(|d| d.estimate == INVALID));
    }

    #[tokio::test]
    async fn ties_are_broken_by_scorer_and_groups_stay_in_order() {
        let scorer = TableScorer::new(&[(1, 0.2), (2, 0.9)]);
        let reranker = PointwiseReranker::new(&scorer);
        let docs = vec![scored(1, 5.0, ""), scored(2, 5.0, ""), scored(3, 3.0, "")];

        let ranking = reranker.rerank(docs, "q").await.unwrap();
        assert_eq!(ranking.ids, vec![2, 1, 3]);
        assert_eq!(ranking.tie_groups, 1);
        assert_eq!(ranking.fallbacks, 0);
        // The singleton group never reaches the scorer.
        assert_eq!(*scorer.groups.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn equal_scores_keep_estimate_order() {
        let scorer = TableScorer::new(&[]);
        let reranker = PointwiseReranker::new(&scorer);
        let docs = vec![scored(3, 1.0, ""), scored(1, 5.0, ""), scored(2, 5.0, "")];
        let ranking = reranker.rerank(docs, "q").await.unwrap();
        assert_eq!(ranking.ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failing_scorer_falls_back_to_bm25_on_abstracts() {
        let reranker = PointwiseReranker::new(&Broken);
        let docs = vec![
            scored(1, 2.0, "road traffic congestion"),
            scored(2, 2.0, "sleep and memory consolidation"),
            scored(3, 0.0, "other"),
        ];

        let ranking = reranker.rerank(docs, "memory consolidation").await.unwrap();
        let expected = {
            let bm25 = Bm25Scorer::default();
            let scores = bm25.score_texts(
                "memory consolidation",
                &["road traffic congestion".to_string(), "sleep and memory consolidation".to_string()],
            );
            rank_by_scores(&scores, &[1, 2])
        };
        assert_eq!(&ranking.ids[..2], expected.as_slice());
        assert_eq!(ranking.ids, vec![2, 1, 3]);
        assert_eq!(ranking.fallbacks, 1);
    }

    #[tokio::test]
    async fn imputed_documents_join_the_matching_group() {
        let scorer = TableScorer::new(&[(2, 1.0)]);
        let reranker = PointwiseReranker::new(&scorer);
        let docs = vec![scored(1, 2.0, ""), scored(2, INVALID, ""), scored(3, 6.0, ""), scored(4, 4.0, "")];
        // Mean of {2, 6, 4} is 4, so document 2 ties with document 4.
        let ranking = reranker.rerank(docs, "q").await.unwrap();
        assert_eq!(ranking.ids, vec![3, 2, 4, 1]);
    }

    #[tokio::test]
    async fn output_is_a_permutation_of_the_input() {
        let reranker = PointwiseReranker::new(&Broken);
        let docs: Vec<ScoredDocument> = (0..40)
            .map(|i| scored(i, f64::from((i % 4) as i32), "abstract text"))
            .collect();
        let ranking = reranker.rerank(docs, "text").await.unwrap();
        let mut ids = ranking.ids.clone();
        ids.sort();
        assert_eq!(ids, (0..40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let reranker = PointwiseReranker::new(&Broken);
        let docs = vec![scored(1, 1.0, ""), scored(1, 2.0, "")];
        assert!(matches!(
            reranker.rerank(docs, "q").await,
            Err(RerankError::DuplicateId(1))
        ));
    }
}
