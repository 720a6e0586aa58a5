//! Cross-encoder and pointwise-classifier scorers served over HTTP.
//!
//! Speaks the `/rerank` shape used by text-embeddings-inference:
//! `POST {base}/rerank {"query", "texts"}` answered by `[{"index", "score"}]`.
//! The `{"results": [{"index", "relevance_score"}]}` shape of hosted rerank
//! APIs is accepted too.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{RelevanceScorer, ScorerError, ScorerKind};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    raw_scores: bool,
}

#[derive(Debug, Deserialize)]
struct IndexedScore {
    index: usize,
    #[serde(alias = "relevance_score")]
    score: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RerankResponse {
    Bare(Vec<IndexedScore>),
    Wrapped { results: Vec<IndexedScore> },
}

impl RerankResponse {
    fn into_scores(self) -> Vec<IndexedScore> {
        match self {
            RerankResponse::Bare(scores) => scores,
            RerankResponse::Wrapped { results } => results,
        }
    }
}

pub struct HttpRerankScorer {
    kind: ScorerKind,
    /// Configured model path; only `http(s)://` endpoints are usable.
    endpoint: String,
    client: reqwest::Client,
}

impl HttpRerankScorer {
    pub fn new(kind: ScorerKind, endpoint: impl Into<String>) -> Result<Self, ScorerError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self {
            kind,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn rerank_url(&self) -> Result<String, ScorerError> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ScorerError::Unavailable(format!(
                "no reranker endpoint at '{}'",
                self.endpoint
            )));
        }
        if self.endpoint.ends_with("/rerank") {
            Ok(self.endpoint.clone())
        } else {
            Ok(format!("{}/rerank", self.endpoint))
        }
    }
}

#[async_trait::async_trait]
impl RelevanceScorer for HttpRerankScorer {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f64>, ScorerError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.rerank_url()?;
        let resp = self
            .client
            .post(&url)
            .json(&RerankRequest {
                query,
                texts: documents,
                raw_scores: false,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ScorerError::InvalidResponse(format!(
                "{url} returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: RerankResponse = resp
            .json()
            .await
            .map_err(|e| ScorerError::InvalidResponse(e.to_string()))?;
        let entries = parsed.into_scores();
        if entries.len() != documents.len() {
            return Err(ScorerError::Length {
                expected: documents.len(),
                found: entries.len(),
            });
        }

        // Responses are sorted by score; restore input order.
        let mut scores = vec![None; documents.len()];
        for entry in entries {
            let slot = scores.get_mut(entry.index).ok_or_else(|| {
                ScorerError::InvalidResponse(format!("index {} out of range", entry.index))
            })?;
            *slot = Some(entry.score);
        }
        scores
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                s.ok_or_else(|| ScorerError::InvalidResponse(format!("no score for index {i}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_response_shapes_parse() {
        let bare: RerankResponse =
            serde_json::from_str(r#"[{"index":1,"score":0.9},{"index":0,"score":0.1}]"#).unwrap();
        assert_eq!(bare.into_scores().len(), 2);

        let wrapped: RerankResponse = serde_json::from_str(
            r#"{"id":"x","results":[{"index":0,"relevance_score":0.4}]}"#,
        )
        .unwrap();
        let scores = wrapped.into_scores();
        assert_eq!(scores[0].score, 0.4);
    }

    #[tokio::test]
    async fn local_model_path_is_unavailable() {
        let scorer = HttpRerankScorer::new(ScorerKind::CrossEncoder, "models/monoBERT").unwrap();
        let err = scorer
            .score("q", &["doc".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ScorerError::Unavailable(_)));
    }

    #[test]
    fn rerank_suffix_is_added_once() {
        let a = HttpRerankScorer::new(ScorerKind::CrossEncoder, "http://h:8080/").unwrap();
        let b = HttpRerankScorer::new(ScorerKind::CrossEncoder, "http://h:8080/rerank").unwrap();
        assert_eq!(a.rerank_url().unwrap(), "http://h:8080/rerank");
        assert_eq!(b.rerank_url().unwrap(), "http://h:8080/rerank");
    }
}
