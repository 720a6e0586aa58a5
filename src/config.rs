//! Experiment configuration.
//!
//! Read once from JSON and validated before anything else runs. Experiment
//! variants (`--preset <kind> --index <n>`) derive a fresh configuration from
//! the base one; nothing mutates a shared instance.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::dataset::{DatasetSchema, QueryComposition};
use crate::fewshot::OrderingPattern;
use crate::gateway::ChatModel;
use crate::prompts::{PromptingTechnique, SystemMessageType};
use crate::scoring::ScorerKind;
use crate::screening::{EvaluationSettings, ScaleConfig, DEFAULT_MAX_TOKENS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {message}")]
    Json { path: PathBuf, message: String },
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("no {kind} preset with index {index}")]
    UnknownPreset { kind: &'static str, index: usize },
}

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Folder holding one `<slr>.csv` per review.
    pub folder_path_slrs: PathBuf,
    pub file_path_slr_infos: PathBuf,
    #[serde(alias = "llm_client_output_directory_path")]
    pub output_directory: PathBuf,
    pub folder_path_few_shot_examples: PathBuf,
    #[serde(deserialize_with = "integer_or_text")]
    pub relevance_lower_value: i64,
    #[serde(deserialize_with = "integer_or_text")]
    pub relevance_upper_value: i64,
    /// Inferred from `folder_path_slrs` when absent.
    #[serde(default)]
    pub dataset_schema: Option<DatasetSchema>,
    pub llm_client_config: LlmClientConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmClientConfig {
    pub name_of_model: String,
    /// Model id sent to the completions endpoint.
    pub path_to_model: String,
    /// Auxiliary reranker: model id or `/rerank` endpoint; empty for BM25.
    #[serde(default)]
    pub path_to_reranker: String,
    #[serde(default)]
    pub reranker_kind: Option<ScorerKind>,
    #[serde(default)]
    pub base_url: Option<String>,
    pub temperature: f32,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub number_consistency_path: usize,
    pub num_of_max_requests: u32,
    pub prompting_technique: PromptingTechnique,
    pub system_message_type: SystemMessageType,
    #[serde(default)]
    pub is_few_shot: bool,
    #[serde(default)]
    pub ordering_few_shot_examples: String,
    #[serde(default)]
    pub few_shot_example_seed: u64,
    #[serde(default)]
    pub different_examples: bool,
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_batch_concurrency() -> usize {
    crate::gateway::DEFAULT_BATCH_CONCURRENCY
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

// =============================================================================
// Loading and validation
// =============================================================================

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::Json {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Collects every problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let llm = &self.llm_client_config;
        let mut problems = Vec::new();

        if self.relevance_lower_value < 0 {
            problems.push(format!(
                "relevance_lower_value {} is negative",
                self.relevance_lower_value
            ));
        }
        if self.relevance_lower_value > self.relevance_upper_value {
            problems.push(format!(
                "relevance_lower_value {} exceeds relevance_upper_value {}",
                self.relevance_lower_value, self.relevance_upper_value
            ));
        }
        if llm.name_of_model.trim().is_empty() {
            problems.push("name_of_model is empty".to_string());
        }
        if llm.path_to_model.trim().is_empty() {
            problems.push("path_to_model is empty".to_string());
        }
        if !(0.0..=2.0).contains(&llm.temperature) {
            problems.push(format!("temperature {} outside 0..=2", llm.temperature));
        }
        if llm.num_of_max_requests == 0 {
            problems.push("num_of_max_requests must be at least 1".to_string());
        }
        if llm.batch_concurrency == 0 {
            problems.push("batch_concurrency must be at least 1".to_string());
        }
        if llm.max_tokens == 0 {
            problems.push("max_tokens must be at least 1".to_string());
        }
        match OrderingPattern::parse(&llm.ordering_few_shot_examples) {
            Ok(pattern) if llm.is_few_shot && pattern.is_empty() => {
                problems.push("is_few_shot requires ordering_few_shot_examples".to_string());
            }
            Ok(_) => {}
            Err(e) => problems.push(e.to_string()),
        }
        if llm.reranker_kind == Some(ScorerKind::CrossEncoder)
            && llm.path_to_reranker.trim().is_empty()
        {
            problems.push("cross_encoder reranker needs path_to_reranker".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn scale(&self) -> ScaleConfig {
        ScaleConfig {
            lower: self.relevance_lower_value,
            upper: self.relevance_upper_value,
        }
    }

    pub fn schema(&self) -> DatasetSchema {
        if let Some(schema) = self.dataset_schema {
            return schema;
        }
        let folder = self.folder_path_slrs.to_string_lossy();
        if folder.contains("tar2019") {
            DatasetSchema::Tar
        } else if folder.contains("guo") {
            DatasetSchema::Guo
        } else {
            DatasetSchema::Synergy
        }
    }

    /// Rerank query: research questions are added when the system message carries them.
    pub fn query_composition(&self) -> QueryComposition {
        match self.llm_client_config.system_message_type {
            SystemMessageType::WithResearchQuestions => QueryComposition::TitleAndResearchQuestions,
            SystemMessageType::Basic => QueryComposition::Title,
        }
    }

    /// Self-consistency repetitions.
    pub fn repetitions(&self) -> usize {
        self.llm_client_config.number_consistency_path + 1
    }

    /// Explicit kind, else inferred from `path_to_reranker`.
    pub fn reranker_kind(&self) -> ScorerKind {
        let llm = &self.llm_client_config;
        if let Some(kind) = llm.reranker_kind {
            return kind;
        }
        let path = llm.path_to_reranker.trim();
        if path.is_empty() {
            ScorerKind::Lexical
        } else if path.starts_with("http://") || path.starts_with("https://") {
            ScorerKind::CrossEncoder
        } else {
            ScorerKind::Generative
        }
    }

    pub fn evaluation_settings(&self) -> EvaluationSettings {
        let llm = &self.llm_client_config;
        let mut settings =
            EvaluationSettings::new(ChatModel::new(llm.path_to_model.clone()), self.scale());
        settings.temperature = llm.temperature;
        settings.max_tokens = llm.max_tokens;
        settings.num_of_max_requests = llm.num_of_max_requests;
        settings.repetitions = self.repetitions();
        settings
    }
}

fn integer_or_text<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntegerOrText {
        Integer(i64),
        Text(String),
    }

    match IntegerOrText::deserialize(deserializer)? {
        IntegerOrText::Integer(n) => Ok(n),
        IntegerOrText::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// =============================================================================
// Presets
// =============================================================================

/// Family of experiment variants selected by `--index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PresetKind {
    /// 0: Llama3.1-8B, 1: Qwen2.5-32B, 2: Qwen2.5-72B, 3: Mistral-123B.
    Model,
    /// 0-1, 0-2, 0-4, 0-9, 0-14, 0-19.
    Scale,
    /// 2-shot, CoT, CoT (n=3), 2-shot CoT, 2-shot CoT (n=3).
    Technique,
}

const MODELS: [(&str, &str); 4] = [
    ("Llama3.1-8B", "meta-llama/Llama-3.1-8B-Instruct"),
    ("Qwen2.5-32B", "Qwen/Qwen2.5-32B-Instruct"),
    ("Qwen2.5-72B", "Qwen/Qwen2.5-72B-Instruct"),
    ("Mistral-123B", "mistralai/Mistral-Large-Instruct-2411"),
];

const SCALE_UPPER: [i64; 8] = [1, 2, 4, 9, 14, 19, 24, 29];

struct TechniqueVariant {
    label: &'static str,
    technique: PromptingTechnique,
    few_shot: bool,
    consistency_paths: usize,
    temperature: f32,
}

const TECHNIQUES: [TechniqueVariant; 5] = [
    TechniqueVariant {
        label: "2s",
        technique: PromptingTechnique::ZeroShot,
        few_shot: true,
        consistency_paths: 0,
        temperature: 0.0,
    },
    TechniqueVariant {
        label: "CoT",
        technique: PromptingTechnique::ChainOfThought,
        few_shot: false,
        consistency_paths: 0,
        temperature: 0.0,
    },
    TechniqueVariant {
        label: "CoT_sc",
        technique: PromptingTechnique::ChainOfThought,
        few_shot: false,
        consistency_paths: 2,
        temperature: 0.5,
    },
    TechniqueVariant {
        label: "2s_CoT",
        technique: PromptingTechnique::ChainOfThought,
        few_shot: true,
        consistency_paths: 0,
        temperature: 0.0,
    },
    TechniqueVariant {
        label: "2s_CoT_sc",
        technique: PromptingTechnique::ChainOfThought,
        few_shot: true,
        consistency_paths: 2,
        temperature: 0.5,
    },
];

/// One experiment variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub kind: PresetKind,
    pub index: usize,
}

impl Preset {
    pub fn new(kind: PresetKind, index: usize) -> Result<Self, ConfigError> {
        let (name, len) = match kind {
            PresetKind::Model => ("model", MODELS.len()),
            PresetKind::Scale => ("scale", SCALE_UPPER.len()),
            PresetKind::Technique => ("technique", TECHNIQUES.len()),
        };
        if index >= len {
            return Err(ConfigError::UnknownPreset { kind: name, index });
        }
        Ok(Self { kind, index })
    }

    /// Output sub-folder of this variant.
    pub fn label(&self) -> String {
        match self.kind {
            PresetKind::Model => MODELS[self.index].0.to_string(),
            PresetKind::Scale => format!("0-{}", SCALE_UPPER[self.index]),
            PresetKind::Technique => TECHNIQUES[self.index].label.to_string(),
        }
    }

    /// A new configuration with this variant applied; `base` is untouched.
    pub fn apply(&self, base: &ExperimentConfig) -> Result<ExperimentConfig, ConfigError> {
        let mut config = base.clone();
        let llm = &mut config.llm_client_config;

        match self.kind {
            PresetKind::Model => {
                let (name, path) = MODELS[self.index];
                llm.name_of_model = name.to_string();
                llm.path_to_model = path.to_string();
            }
            PresetKind::Scale => {
                config.relevance_lower_value = 0;
                config.relevance_upper_value = SCALE_UPPER[self.index];
                llm.temperature = 0.0;
                llm.prompting_technique = PromptingTechnique::ZeroShot;
                llm.system_message_type = SystemMessageType::WithResearchQuestions;
                llm.number_consistency_path = 0;
                llm.is_few_shot = false;
                llm.ordering_few_shot_examples = String::new();
                llm.path_to_reranker = String::new();
                llm.reranker_kind = None;
            }
            PresetKind::Technique => {
                let variant = &TECHNIQUES[self.index];
                config.relevance_lower_value = 0;
                config.relevance_upper_value = 19;
                llm.system_message_type = SystemMessageType::WithResearchQuestions;
                llm.path_to_reranker = String::new();
                llm.reranker_kind = None;
                llm.temperature = variant.temperature;
                llm.prompting_technique = variant.technique;
                llm.number_consistency_path = variant.consistency_paths;
                llm.is_few_shot = variant.few_shot;
                llm.ordering_few_shot_examples = if variant.few_shot { "PN" } else { "" }.to_string();
            }
        }

        config.output_directory = base.output_directory.join(self.label());
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_json() -> serde_json::Value {
        json!({
            "folder_path_slrs": "./data/guo_slrs/",
            "file_path_slr_infos": "./data/guo_slrs/guo_infos.json",
            "llm_client_output_directory_path": "./out/",
            "folder_path_few_shot_examples": "./few_shot/",
            "relevance_lower_value": "0",
            "relevance_upper_value": "4",
            "llm_client_config": {
                "name_of_model": "Llama3.1-8B",
                "path_to_model": "meta-llama/Llama-3.1-8B-Instruct",
                "temperature": 0,
                "num_of_max_requests": 3,
                "prompting_technique": "zero_shot",
                "system_message_type": "system_message_basic",
                "few_shot_example_seed": 42
            }
        })
    }

    fn base() -> ExperimentConfig {
        serde_json::from_value(base_json()).unwrap()
    }

    #[test]
    fn parses_string_scale_bounds_and_defaults() {
        let config = base();
        config.validate().unwrap();
        assert_eq!(config.scale(), ScaleConfig::new(0, 4).unwrap());
        assert_eq!(config.output_directory, PathBuf::from("./out/"));
        assert_eq!(config.schema(), DatasetSchema::Guo);
        assert_eq!(config.reranker_kind(), ScorerKind::Lexical);
        assert_eq!(config.query_composition(), QueryComposition::Title);
        assert_eq!(config.repetitions(), 1);
        assert_eq!(config.llm_client_config.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn validation_reports_every_problem() {
        let mut config = base();
        config.relevance_lower_value = 5;
        config.llm_client_config.num_of_max_requests = 0;
        config.llm_client_config.ordering_few_shot_examples = "PPP".to_string();
        let ConfigError::Invalid(problems) = config.validate().unwrap_err() else {
            panic!("expected Invalid");
        };
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn negative_lower_bound_is_rejected() {
        let mut config = base();
        config.relevance_lower_value = -1;
        let ConfigError::Invalid(problems) = config.validate().unwrap_err() else {
            panic!("expected Invalid");
        };
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("negative"));
    }

    #[test]
    fn scale_presets_reach_zero_to_twenty_nine() {
        let base = base();
        let labels: Vec<String> = (0..8)
            .map(|i| Preset::new(PresetKind::Scale, i).unwrap().label())
            .collect();
        assert_eq!(&labels[5..], ["0-19", "0-24", "0-29"]);

        let widest = Preset::new(PresetKind::Scale, 7).unwrap().apply(&base).unwrap();
        assert_eq!(widest.scale(), ScaleConfig::new(0, 29).unwrap());
        assert_eq!(widest.output_directory, PathBuf::from("./out/0-29"));
    }

    #[test]
    fn few_shot_needs_a_pattern() {
        let mut config = base();
        config.llm_client_config.is_few_shot = true;
        assert!(config.validate().is_err());
        config.llm_client_config.ordering_few_shot_examples = "NP".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn presets_return_fresh_configs() {
        let base = base();
        let scaled = Preset::new(PresetKind::Scale, 3).unwrap().apply(&base).unwrap();
        assert_eq!(scaled.scale(), ScaleConfig::new(0, 9).unwrap());
        assert_eq!(scaled.output_directory, PathBuf::from("./out/0-9"));
        assert_eq!(base.scale(), ScaleConfig::new(0, 4).unwrap());

        let cot_sc = Preset::new(PresetKind::Technique, 4).unwrap().apply(&base).unwrap();
        assert_eq!(cot_sc.repetitions(), 3);
        assert!(cot_sc.llm_client_config.is_few_shot);
        assert_eq!(cot_sc.llm_client_config.ordering_few_shot_examples, "PN");
        assert_eq!(cot_sc.llm_client_config.temperature, 0.5);

        let model = Preset::new(PresetKind::Model, 1).unwrap().apply(&base).unwrap();
        assert_eq!(model.llm_client_config.name_of_model, "Qwen2.5-32B");
    }

    #[test]
    fn out_of_range_preset_is_rejected() {
        assert!(matches!(
            Preset::new(PresetKind::Scale, 8),
            Err(ConfigError::UnknownPreset { kind: "scale", index: 8 })
        ));
    }

    #[test]
    fn load_reports_path_on_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{").unwrap();
        let err = ExperimentConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("config.json"));
    }
}
