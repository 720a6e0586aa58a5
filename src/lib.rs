#![forbid(unsafe_code)]

//! # screening-harness
//!
//! Relevance screening for systematic literature reviews with chat models.
//!
//! Every candidate paper of a review is shown to a model, which answers with
//! a relevance value on a configurable integer scale. Several
//! self-consistency repetitions are averaged into one estimate per paper.
//! Papers that share an estimate are reordered by a secondary scorer, with
//! BM25 over the abstracts as the fallback, and the final ranking is judged
//! with technology-assisted-review metrics (MAP, recall at fixed screening
//! budgets, work saved over sampling).

pub mod config;
pub mod dataset;
pub mod experiment;
pub mod fewshot;
pub mod gateway;
pub mod prompts;
pub mod scoring;
pub mod screening;
pub mod tar;

pub use config::{ConfigError, ExperimentConfig, LlmClientConfig, Preset, PresetKind};
pub use dataset::{Dataset, DatasetSchema, Document, SlrInfo};
pub use experiment::{
    evaluate_experiment, random_baseline, rank_run, rank_with_scorer, run_screening,
    save_exemplars, BaselineMode, ExperimentError, ScreeningOutcome,
};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use scoring::{build_scorer, Bm25Scorer, RelevanceScorer, ScorerKind, ScorerSpec};
pub use screening::{
    EvaluationLoop, EvaluationSettings, JsonlTraceSink, PointwiseReranker, RunStore, TraceSink,
    TraceWorker,
};
pub use tar::{MetricSet, TarEvaluator, TrecTarEvaluator};
