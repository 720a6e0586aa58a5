use std::sync::Arc;

use tracing::debug;

use super::{RelevanceScorer, ScorerError};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Message};
use crate::screening::{extract, ScaleConfig};

const SYSTEM: &str = "You rate how relevant a document is to a search query.";

/// Scores each document with one chat call; the score is the extracted decision.
pub struct GenerativeScorer {
    gateway: Arc<dyn ChatGateway>,
    model: ChatModel,
    scale: ScaleConfig,
    max_tokens: u32,
}

impl GenerativeScorer {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: ChatModel, scale: ScaleConfig) -> Self {
        Self {
            gateway,
            model,
            scale,
            max_tokens: 256,
        }
    }

    fn prompt(&self, query: &str, document: &str) -> String {
        format!(
            "Query: '{query}'\nDocument: '{document}'\n\nRate the relevance of the document to the query from '{lo}' (not relevant) to '{hi}' (highly relevant).\nGive your answer in the following format:\n```\nDecision: {lo} - {hi}\n```\n",
            lo = self.scale.lower,
            hi = self.scale.upper,
        )
    }
}

#[async_trait::async_trait]
impl RelevanceScorer for GenerativeScorer {
    fn name(&self) -> &str {
        self.model.model_id()
    }

    /// Unparseable answers score INVALID and sort last; a failed call fails the whole group.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f64>, ScorerError> {
        let requests = documents
            .iter()
            .map(|doc| {
                ChatRequest::new(
                    self.model.clone(),
                    vec![Message::system(SYSTEM), Message::user(self.prompt(query, doc))],
                    Attribution::new("scoring::generative"),
                )
                .temperature(0.0)
                .max_tokens(self.max_tokens)
            })
            .collect();

        let responses = self.gateway.chat_batch(requests).await;
        if responses.len() != documents.len() {
            return Err(ScorerError::Length {
                expected: documents.len(),
                found: responses.len(),
            });
        }

        let mut scores = Vec::with_capacity(documents.len());
        for resp in responses {
            let resp = resp?;
            scores.push(extract(&resp.content, self.scale));
        }
        debug!(documents = documents.len(), model = self.model.model_id(), "Scored group");
        Ok(scores)
    }
}
