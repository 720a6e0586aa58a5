//! Relevance scorers.
//!
//! A scorer turns a query and a set of document texts into one score per
//! document; higher is more relevant. The pointwise reranker uses a scorer to
//! break ties between documents that share a relevance estimate, and falls
//! back to [`Bm25Scorer`] when the configured one is unavailable.

mod generative;
mod lexical;
mod remote;
mod shuffle;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::{ChatGateway, ChatModel, ProviderError};
use crate::screening::ScaleConfig;

pub use generative::GenerativeScorer;
pub use lexical::{tokenize, Bm25Params, Bm25Scorer};
pub use remote::HttpRerankScorer;
pub use shuffle::ShuffleScorer;

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("scorer unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("scorer returned {found} scores for {expected} documents")]
    Length { expected: usize, found: usize },
    #[error("invalid scorer response: {0}")]
    InvalidResponse(String),
}

#[async_trait::async_trait]
pub trait RelevanceScorer: Send + Sync {
    /// Identifier written to the ranked output log.
    fn name(&self) -> &str;

    /// One score per document, in input order.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f64>, ScorerError>;

    /// Ids ordered by descending score; equal scores keep input order.
    fn rank(&self, scores: &[f64], ids: &[i64]) -> Vec<i64> {
        rank_by_scores(scores, ids)
    }
}

/// Stable descending order of `ids` by `scores`.
pub fn rank_by_scores(scores: &[f64], ids: &[i64]) -> Vec<i64> {
    let mut order: Vec<usize> = (0..ids.len().min(scores.len())).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order.into_iter().map(|i| ids[i]).collect()
}

/// Scorer family selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    /// Batched chat model; the score is the extracted decision.
    Generative,
    /// Query/document cross-encoder behind a `/rerank` endpoint.
    CrossEncoder,
    /// Sequence classifier behind a `/rerank` endpoint.
    PointwiseClassifier,
    Lexical,
    /// Seeded random scores.
    Random,
}

impl ScorerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScorerKind::Generative => "generative",
            ScorerKind::CrossEncoder => "cross_encoder",
            ScorerKind::PointwiseClassifier => "pointwise_classifier",
            ScorerKind::Lexical => "lexical",
            ScorerKind::Random => "random",
        }
    }
}

/// Everything a scorer may need; unused fields are ignored by the chosen kind.
#[derive(Clone)]
pub struct ScorerSpec {
    pub kind: ScorerKind,
    /// Model id for `generative`, endpoint URL for the `/rerank` kinds.
    pub path: String,
    pub gateway: Option<Arc<dyn ChatGateway>>,
    pub scale: ScaleConfig,
    pub seed: u64,
}

/// Build the scorer described by `spec`.
pub fn build_scorer(spec: ScorerSpec) -> Result<Box<dyn RelevanceScorer>, ScorerError> {
    let scorer: Box<dyn RelevanceScorer> = match spec.kind {
        ScorerKind::Generative => {
            let gateway = spec.gateway.ok_or_else(|| {
                ScorerError::Unavailable("generative scorer needs a chat gateway".to_string())
            })?;
            Box::new(GenerativeScorer::new(
                gateway,
                ChatModel::new(spec.path),
                spec.scale,
            ))
        }
        ScorerKind::CrossEncoder | ScorerKind::PointwiseClassifier => {
            Box::new(HttpRerankScorer::new(spec.kind, spec.path)?)
        }
        ScorerKind::Lexical => Box::new(Bm25Scorer::default()),
        ScorerKind::Random => Box::new(ShuffleScorer::new(spec.seed)),
    };
    Ok(scorer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_is_stable_and_descending() {
        let ids = [10, 11, 12, 13];
        let scores = [0.5, 0.9, 0.5, -1.0];
        assert_eq!(rank_by_scores(&scores, &ids), vec![11, 10, 12, 13]);
    }

    #[test]
    fn generative_without_gateway_is_unavailable() {
        let spec = ScorerSpec {
            kind: ScorerKind::Generative,
            path: "m".to_string(),
            gateway: None,
            scale: ScaleConfig::new(0, 4).unwrap(),
            seed: 0,
        };
        assert!(matches!(build_scorer(spec), Err(ScorerError::Unavailable(_))));
    }

    #[test]
    fn lexical_kind_builds_bm25() {
        let spec = ScorerSpec {
            kind: ScorerKind::Lexical,
            path: String::new(),
            gateway: None,
            scale: ScaleConfig::new(0, 1).unwrap(),
            seed: 0,
        };
        assert_eq!(build_scorer(spec).unwrap().name(), "bm25");
    }
}
