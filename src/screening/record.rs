//! Per-repetition run records, serialized as the `log_file_<n>.json` run log.

use std::collections::BTreeMap;

use chrono::Local;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::decision::{is_valid, Decision};
use crate::dataset::Document;
use crate::fewshot::FewShotExample;

/// The accepted decision for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    pub question: String,
    pub response: String,
    pub decision_of_llm: String,
    pub relevance_of_paper: f64,
    pub ground_truth: u8,
    pub prompt_tokens: u32,
    pub response_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A rejected attempt, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub question: String,
    pub response: String,
    pub decision_of_llm: String,
    pub relevance_of_paper: f64,
    pub prompt_tokens: u32,
    pub response_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run-level metadata fixed before the first prompt is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct RunHeader {
    pub deployment_name: String,
    pub path_to_model: String,
    pub path_of_additional_ranker: Option<String>,
    pub model_temperature: f32,
    pub count: usize,
    pub prompt_template: String,
    pub system_message: String,
    pub num_of_max_requests: u32,
    pub few_shot: Option<FewShotHeader>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FewShotHeader {
    pub ordering: String,
    pub different_examples: bool,
    pub seed: u64,
    pub examples: Vec<FewShotExample>,
}

impl RunHeader {
    pub fn new(deployment_name: impl Into<String>, path_to_model: impl Into<String>) -> Self {
        Self {
            deployment_name: deployment_name.into(),
            path_to_model: path_to_model.into(),
            path_of_additional_ranker: None,
            model_temperature: 0.0,
            count: 0,
            prompt_template: String::new(),
            system_message: String::new(),
            num_of_max_requests: 1,
            few_shot: None,
        }
    }
}

/// One completed self-consistency repetition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(rename = "Date and Time")]
    pub date_time: String,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub deployment_name: String,
    pub path_to_model: String,
    pub path_of_additional_ranker: Option<String>,
    pub model_temperature: f32,
    pub count: usize,
    pub prompt_template: String,
    pub system_message: String,
    pub total_prompt_tokens: u64,
    pub total_response_tokens: u64,
    /// Wall time of the repetition in seconds.
    pub total_computation_time: f64,
    pub num_of_max_requests: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_few_shot_examples: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub different_examples: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub few_shot_example_seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub few_shot_examples: Option<Vec<FewShotExample>>,
    pub papers: BTreeMap<i64, PaperRecord>,
    pub failed_responses: BTreeMap<String, FailedAttempt>,
}

impl RunRecord {
    pub fn new(header: RunHeader) -> Self {
        let (ordering, different, seed, examples) = match header.few_shot {
            Some(fs) => (
                Some(fs.ordering),
                Some(fs.different_examples),
                Some(fs.seed),
                // An empty example list is left out of the log.
                (!fs.examples.is_empty()).then_some(fs.examples),
            ),
            None => (None, None, None, None),
        };

        Self {
            date_time: Local::now().format("%Y-%m-%d, %H:%M").to_string(),
            run_id: Some(Uuid::new_v4()),
            deployment_name: header.deployment_name,
            path_to_model: header.path_to_model,
            path_of_additional_ranker: header.path_of_additional_ranker,
            model_temperature: header.model_temperature,
            count: header.count,
            prompt_template: header.prompt_template,
            system_message: header.system_message,
            total_prompt_tokens: 0,
            total_response_tokens: 0,
            total_computation_time: 0.0,
            num_of_max_requests: header.num_of_max_requests,
            ordering_few_shot_examples: ordering,
            different_examples: different,
            few_shot_example_seed: seed,
            few_shot_examples: examples,
            papers: BTreeMap::new(),
            failed_responses: BTreeMap::new(),
        }
    }

    pub fn add_tokens(&mut self, prompt: u32, response: u32) {
        self.total_prompt_tokens += u64::from(prompt);
        self.total_response_tokens += u64::from(response);
    }

    pub fn accept(&mut self, document: &Document, attempt: &AttemptRecord) {
        self.papers.insert(
            document.id,
            PaperRecord {
                question: attempt.question.clone(),
                response: attempt.response.clone(),
                decision_of_llm: attempt.decision.text.clone(),
                relevance_of_paper: attempt.decision.value,
                ground_truth: document.label,
                prompt_tokens: attempt.prompt_tokens,
                response_tokens: attempt.response_tokens,
                error: attempt.error.clone(),
            },
        );
    }

    pub fn reject(&mut self, document_id: i64, attempt_index: u32, attempt: &AttemptRecord) {
        self.failed_responses.insert(
            failed_key(document_id, attempt_index),
            FailedAttempt {
                question: attempt.question.clone(),
                response: attempt.response.clone(),
                decision_of_llm: attempt.decision.text.clone(),
                relevance_of_paper: attempt.decision.value,
                prompt_tokens: attempt.prompt_tokens,
                response_tokens: attempt.response_tokens,
                error: attempt.error.clone(),
            },
        );
    }

    /// Accepted relevance value per document.
    pub fn relevance(&self) -> impl Iterator<Item = (i64, f64)> + '_ {
        self.papers
            .iter()
            .map(|(id, paper)| (*id, paper.relevance_of_paper))
    }

    /// Accepted decisions that are still INVALID after the retry budget.
    pub fn invalid_count(&self) -> usize {
        self.papers
            .values()
            .filter(|p| !is_valid(p.relevance_of_paper))
            .count()
    }

    /// Failed attempts per accepted paper.
    pub fn failure_rate(&self) -> f64 {
        if self.papers.is_empty() {
            return 0.0;
        }
        self.failed_responses.len() as f64 / self.papers.len() as f64
    }
}

/// One attempt as seen by the retry loop, before it is filed as accepted or failed.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub question: String,
    pub response: String,
    pub decision: Decision,
    pub prompt_tokens: u32,
    pub response_tokens: u32,
    pub error: Option<String>,
}

pub fn failed_key(document_id: i64, attempt_index: u32) -> String {
    format!("{document_id}_{attempt_index}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screening::decision::INVALID;

    fn attempt(value: f64) -> AttemptRecord {
        AttemptRecord {
            question: "q".to_string(),
            response: "r".to_string(),
            decision: Decision {
                text: String::new(),
                value,
            },
            prompt_tokens: 10,
            response_tokens: 5,
            error: None,
        }
    }

    fn doc(id: i64, label: u8) -> Document {
        Document::new(id, "t", "a", label)
    }

    #[test]
    fn run_log_uses_documented_field_names() {
        let mut record = RunRecord::new(RunHeader::new("llama", "/models/llama"));
        record.accept(&doc(7, 1), &attempt(3.0));
        record.reject(7, 0, &attempt(INVALID));

        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("Date and Time").is_some());
        assert_eq!(value["deployment_name"], "llama");
        assert_eq!(value["papers"]["7"]["relevance_of_paper"], 3.0);
        assert_eq!(value["papers"]["7"]["ground_truth"], 1);
        assert!(value["failed_responses"]["7_0"].get("ground_truth").is_none());
        assert!(value.get("few_shot_examples").is_none());
    }

    #[test]
    fn run_log_reads_back() {
        let mut record = RunRecord::new(RunHeader::new("m", "p"));
        record.accept(&doc(1, 0), &attempt(0.0));
        record.add_tokens(10, 5);
        let raw = serde_json::to_string(&record).unwrap();
        let back: RunRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn failure_rate_counts_failed_attempts_per_paper() {
        let mut record = RunRecord::new(RunHeader::new("m", "p"));
        record.accept(&doc(1, 0), &attempt(1.0));
        record.accept(&doc(2, 0), &attempt(INVALID));
        record.reject(2, 0, &attempt(INVALID));
        record.reject(2, 1, &attempt(INVALID));
        record.reject(2, 2, &attempt(INVALID));
        assert_eq!(record.failure_rate(), 1.5);
        assert_eq!(record.invalid_count(), 1);
    }
}
