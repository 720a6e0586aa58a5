//! Retry-orchestrated evaluation loop.
//!
//! Each repetition sends every document's prompt in one batch, then walks the
//! responses in prompt order. A response whose decision does not parse is
//! filed as a failed attempt and that single prompt is re-sent at a higher
//! temperature, up to `num_of_max_requests` calls per document in total. The
//! last attempt is always accepted, INVALID or not.

use std::path::PathBuf;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::decision::{parse, ScaleConfig};
use super::record::{AttemptRecord, RunHeader, RunRecord};
use super::store::{RunStore, StoreError};
use super::trace::{now_epoch_ms, AttemptTrace, TraceSink};
use crate::dataset::{Dataset, Document};
use crate::gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, ChatResponse, Message, ProviderError,
};
use crate::prompts::ScreeningPrompter;

/// Temperature for single-document retries.
pub const RETRY_TEMPERATURE: f32 = 0.5;
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
const TOP_P: f32 = 1.0;

#[derive(Debug, Clone)]
pub struct EvaluationSettings {
    pub model: ChatModel,
    pub scale: ScaleConfig,
    /// Temperature of the batched call.
    pub temperature: f32,
    pub retry_temperature: f32,
    pub max_tokens: u32,
    /// Calls per document per repetition, including the batched one.
    pub num_of_max_requests: u32,
    /// Self-consistency repetitions (`number_consistency_path + 1`).
    pub repetitions: usize,
}

impl EvaluationSettings {
    pub fn new(model: ChatModel, scale: ScaleConfig) -> Self {
        Self {
            model,
            scale,
            temperature: 0.0,
            retry_temperature: RETRY_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            num_of_max_requests: 1,
            repetitions: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to persist run log: {0}")]
    Store(#[from] StoreError),
}

/// One provider call as seen by the retry loop.
#[derive(Debug)]
pub enum AttemptOutcome {
    Response(ChatResponse),
    Failed(ProviderError),
}

impl From<Result<ChatResponse, ProviderError>> for AttemptOutcome {
    fn from(result: Result<ChatResponse, ProviderError>) -> Self {
        match result {
            Ok(resp) => AttemptOutcome::Response(resp),
            Err(err) => AttemptOutcome::Failed(err),
        }
    }
}

impl AttemptOutcome {
    fn latency_ms(&self) -> u64 {
        match self {
            AttemptOutcome::Response(resp) => resp.latency.as_millis() as u64,
            AttemptOutcome::Failed(_) => 0,
        }
    }

    /// A failed call carries no text, so its decision is always INVALID.
    fn into_attempt(self, question: &str, scale: ScaleConfig) -> AttemptRecord {
        match self {
            AttemptOutcome::Response(resp) => AttemptRecord {
                question: question.to_string(),
                decision: parse(&resp.content, scale),
                response: resp.content,
                prompt_tokens: resp.input_tokens,
                response_tokens: resp.output_tokens,
                error: None,
            },
            AttemptOutcome::Failed(err) => AttemptRecord {
                question: question.to_string(),
                response: String::new(),
                decision: parse("", scale),
                prompt_tokens: 0,
                response_tokens: 0,
                error: Some(err.to_string()),
            },
        }
    }
}

struct TemplateTag {
    slug: &'static str,
    hash: String,
}

struct DocumentContext<'t> {
    repetition: usize,
    run_id: Uuid,
    template: &'t TemplateTag,
}

pub struct EvaluationLoop<'a> {
    gateway: &'a dyn ChatGateway,
    settings: EvaluationSettings,
    trace: Option<&'a dyn TraceSink>,
}

impl<'a> EvaluationLoop<'a> {
    pub fn new(gateway: &'a dyn ChatGateway, settings: EvaluationSettings) -> Self {
        Self {
            gateway,
            settings,
            trace: None,
        }
    }

    pub fn with_trace(mut self, sink: &'a dyn TraceSink) -> Self {
        self.trace = Some(sink);
        self
    }

    pub fn settings(&self) -> &EvaluationSettings {
        &self.settings
    }

    /// Run every repetition in sequence, persisting each run log before the next starts.
    pub async fn run(
        &self,
        dataset: &Dataset,
        prompter: &ScreeningPrompter,
        header: &RunHeader,
        store: &RunStore,
    ) -> Result<Vec<PathBuf>, RunError> {
        let repetitions = self.settings.repetitions.max(1);
        let mut files = Vec::with_capacity(repetitions);

        for repetition in 0..repetitions {
            let mut header = header.clone();
            if let Some(few_shot) = header.few_shot.as_mut() {
                few_shot.examples = prompter.examples_for(repetition).to_vec();
            }

            let record = self
                .run_repetition(repetition, dataset, prompter, header)
                .await;
            let path = store.save(repetition, &record)?;
            info!(
                repetition,
                path = %path.display(),
                failure_rate = record.failure_rate(),
                "Saved run log"
            );
            files.push(path);
        }

        Ok(files)
    }

    /// Screen every document once; never fails.
    pub async fn run_repetition(
        &self,
        repetition: usize,
        dataset: &Dataset,
        prompter: &ScreeningPrompter,
        header: RunHeader,
    ) -> RunRecord {
        let started = Instant::now();
        let mut record = RunRecord::new(header);
        let run_id = record.run_id.unwrap_or_else(Uuid::new_v4);

        info!(
            repetition,
            documents = dataset.len(),
            model = self.settings.model.model_id(),
            "Starting repetition"
        );

        let prompts: Vec<Vec<Message>> = dataset
            .documents
            .iter()
            .map(|doc| prompter.messages(repetition, doc))
            .collect();

        let requests = prompts
            .iter()
            .map(|messages| {
                self.request(
                    messages.clone(),
                    self.settings.temperature,
                    Attribution::new("screening::batch").with_run(run_id),
                )
            })
            .collect();

        let mut responses = self.gateway.chat_batch(requests).await.into_iter();
        let template = TemplateTag {
            slug: prompter.template().slug,
            hash: prompter.template().hash(),
        };

        for (doc, messages) in dataset.documents.iter().zip(prompts) {
            let first = responses.next().map(AttemptOutcome::from).unwrap_or_else(|| {
                AttemptOutcome::Failed(ProviderError::provider(
                    "gateway",
                    "batch returned fewer responses than prompts",
                    false,
                ))
            });
            let ctx = DocumentContext {
                repetition,
                run_id,
                template: &template,
            };
            self.screen_document(&ctx, doc, messages, first, &mut record)
                .await;
        }

        record.total_computation_time = started.elapsed().as_secs_f64();

        info!(
            repetition,
            elapsed_s = record.total_computation_time,
            prompt_tokens = record.total_prompt_tokens,
            response_tokens = record.total_response_tokens,
            failed_attempts = record.failed_responses.len(),
            invalid = record.invalid_count(),
            "Finished repetition"
        );

        record
    }

    async fn screen_document(
        &self,
        ctx: &DocumentContext<'_>,
        doc: &Document,
        messages: Vec<Message>,
        first: AttemptOutcome,
        record: &mut RunRecord,
    ) {
        let question = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let max_requests = self.settings.num_of_max_requests.max(1);
        let mut outcome = first;

        for attempt in 0..max_requests {
            let temperature = if attempt == 0 {
                self.settings.temperature
            } else {
                self.settings.retry_temperature
            };
            let latency_ms = outcome.latency_ms();
            let current = outcome.into_attempt(&question, self.settings.scale);
            record.add_tokens(current.prompt_tokens, current.response_tokens);

            let valid = current.decision.is_valid();
            let accepted = valid || attempt + 1 == max_requests;
            self.trace(AttemptTrace {
                timestamp_ms: now_epoch_ms(),
                run_id: Some(ctx.run_id.to_string()),
                repetition: ctx.repetition,
                document_id: doc.id,
                attempt,
                model: self.settings.model.model_id().to_string(),
                temperature,
                template_slug: ctx.template.slug.to_string(),
                template_hash: ctx.template.hash.clone(),
                decision: current.decision.value,
                valid,
                accepted,
                input_tokens: current.prompt_tokens,
                output_tokens: current.response_tokens,
                latency_ms,
                error: current.error.clone(),
            });

            if accepted {
                if !valid {
                    warn!(
                        document_id = doc.id,
                        attempts = max_requests,
                        "Accepting INVALID decision after exhausting retries"
                    );
                }
                record.accept(doc, &current);
                return;
            }

            warn!(
                document_id = doc.id,
                attempt,
                reason = failure_reason(&current),
                "Unusable decision; re-sending document"
            );
            record.reject(doc.id, attempt, &current);

            let req = self.request(
                messages.clone(),
                self.settings.retry_temperature,
                Attribution::new("screening::retry").with_run(ctx.run_id),
            );
            outcome = self.gateway.chat(req).await.into();
        }
    }

    fn request(
        &self,
        messages: Vec<Message>,
        temperature: f32,
        attribution: Attribution,
    ) -> ChatRequest {
        ChatRequest::new(self.settings.model.clone(), messages, attribution)
            .temperature(temperature)
            .max_tokens(self.settings.max_tokens)
            .top_p(TOP_P)
    }

    fn trace(&self, event: AttemptTrace) {
        if let Some(sink) = self.trace {
            if let Err(err) = sink.record(event) {
                warn!(error = %err, "Failed to record attempt trace");
            }
        }
    }
}

fn failure_reason(attempt: &AttemptRecord) -> &str {
    match &attempt.error {
        Some(err) => err.as_str(),
        None if attempt.decision.text.is_empty() => "no decision found",
        None => "decision out of range",
    }
}
