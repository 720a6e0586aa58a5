//! Few-shot exemplars: ordering patterns, seeded selection, and derivation
//! of exemplar candidates from a zero-shot run record.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::dataset::Dataset;
use crate::prompts::{PromptingTechnique, COT_MARKER};
use crate::screening::{is_valid, RunRecord, ScaleConfig};

/// A screened paper reused as an in-context example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShotExample {
    #[serde(deserialize_with = "id_from_number_or_text")]
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
    pub label: u8,
    pub question: String,
    pub response: String,
    #[serde(default)]
    pub decision_of_llm: String,
    pub relevance_of_paper: f64,
}

#[derive(Debug, Error)]
pub enum FewShotError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid exemplar file {path}: {message}")]
    Json { path: PathBuf, message: String },
    #[error("unsupported few-shot ordering '{0}'")]
    Pattern(String),
}

// =============================================================================
// Ordering pattern
// =============================================================================

const PATTERNS: &[&str] = &["", "PN", "NP", "PPNN", "NNPP", "PNPN", "NPNP", "PNNP", "NPPN"];

/// Exemplar slot: relevant or irrelevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Positive,
    Negative,
}

/// Order of relevant (P) and irrelevant (N) exemplars shown before the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingPattern {
    raw: String,
    slots: Vec<Slot>,
}

impl OrderingPattern {
    pub fn parse(raw: &str) -> Result<Self, FewShotError> {
        if !PATTERNS.contains(&raw) {
            return Err(FewShotError::Pattern(raw.to_string()));
        }
        let slots = raw
            .chars()
            .map(|c| if c == 'P' { Slot::Positive } else { Slot::Negative })
            .collect();
        Ok(Self {
            raw: raw.to_string(),
            slots,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Exemplars drawn per class for one repetition.
    pub fn per_class(&self) -> usize {
        self.slots.len() / 2
    }
}

// =============================================================================
// Selection
// =============================================================================

#[derive(Debug, Clone)]
pub struct SelectionSettings {
    pub pattern: OrderingPattern,
    pub seed: u64,
    pub repetitions: usize,
    /// Draw fresh exemplars for every repetition instead of reusing one set.
    pub different_examples: bool,
}

/// Pick exemplars for every repetition.
///
/// Draws with replacement from each class using a seeded RNG; the result
/// has one list per repetition laid out in pattern order. Slots whose class
/// has no candidates are skipped.
pub fn select_examples(
    candidates: &[FewShotExample],
    settings: &SelectionSettings,
) -> Vec<Vec<FewShotExample>> {
    if settings.pattern.is_empty() {
        warn!("Few-shot run requested with an empty ordering pattern; using zero exemplars");
        return Vec::new();
    }

    let repetitions = settings.repetitions.max(1);
    let relevant: Vec<&FewShotExample> = candidates.iter().filter(|e| e.label == 1).collect();
    let irrelevant: Vec<&FewShotExample> = candidates.iter().filter(|e| e.label == 0).collect();

    let mut draws = settings.pattern.per_class();
    if settings.different_examples {
        draws *= repetitions;
    }

    let mut rng = StdRng::seed_from_u64(settings.seed);
    let mut draw = |pool: &[&FewShotExample]| -> Vec<FewShotExample> {
        if pool.is_empty() {
            return Vec::new();
        }
        (0..draws)
            .map(|_| pool[rng.gen_range(0..pool.len())].clone())
            .collect()
    };
    let mut positives = draw(&relevant);
    let mut negatives = draw(&irrelevant);

    if !settings.different_examples && repetitions > 1 {
        positives = repeat_all(&positives, repetitions);
        negatives = repeat_all(&negatives, repetitions);
    }

    (0..repetitions)
        .map(|rep| {
            let pos_offset = rep * positives.len() / repetitions;
            let neg_offset = rep * negatives.len() / repetitions;
            let (mut p, mut n) = (0, 0);
            let mut run = Vec::with_capacity(settings.pattern.slots.len());
            for slot in &settings.pattern.slots {
                match slot {
                    Slot::Positive => {
                        if let Some(example) = positives.get(pos_offset + p) {
                            run.push(example.clone());
                            p += 1;
                        }
                    }
                    Slot::Negative => {
                        if let Some(example) = negatives.get(neg_offset + n) {
                            run.push(example.clone());
                            n += 1;
                        }
                    }
                }
            }
            run
        })
        .collect()
}

fn repeat_all(examples: &[FewShotExample], times: usize) -> Vec<FewShotExample> {
    examples
        .iter()
        .cycle()
        .take(examples.len() * times)
        .cloned()
        .collect()
}

/// Ids of every exemplar across repetitions; excluded from the screened dataset.
pub fn exemplar_ids(sets: &[Vec<FewShotExample>]) -> HashSet<i64> {
    sets.iter().flatten().map(|e| e.id).collect()
}

// =============================================================================
// Candidates
// =============================================================================

/// `<folder>/<slr>_<technique>_ex_<model>_point_<index>.json`
pub fn candidate_path(
    folder: &Path,
    slr: &str,
    technique: PromptingTechnique,
    model: &str,
    index: usize,
) -> PathBuf {
    folder.join(format!(
        "{slr}_{}_ex_{model}_point_{index}.json",
        technique.as_str()
    ))
}

pub fn load_candidates(path: &Path) -> Result<Vec<FewShotExample>, FewShotError> {
    let raw = std::fs::read_to_string(path).map_err(|source| FewShotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|e| FewShotError::Json {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

pub fn save_candidates(path: &Path, candidates: &[FewShotExample]) -> Result<(), FewShotError> {
    let io_err = |source| FewShotError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let raw = serde_json::to_string_pretty(candidates).map_err(|e| FewShotError::Json {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    std::fs::write(path, raw).map_err(io_err)
}

/// Papers the model screened confidently and correctly.
///
/// Relevant papers rated at the scale's upper bound and irrelevant papers
/// rated at the lower bound, relevant first. Chain-of-thought exemplars must
/// also contain the reasoning marker.
pub fn derive_candidates(
    record: &RunRecord,
    dataset: &Dataset,
    scale: ScaleConfig,
    technique: PromptingTechnique,
) -> Vec<FewShotExample> {
    let mut relevant = Vec::new();
    let mut irrelevant = Vec::new();

    for doc in &dataset.documents {
        let Some(paper) = record.papers.get(&doc.id) else {
            continue;
        };
        let value = paper.relevance_of_paper;
        if !is_valid(value) {
            continue;
        }
        if technique == PromptingTechnique::ChainOfThought && !paper.response.contains(COT_MARKER)
        {
            continue;
        }

        let example = FewShotExample {
            id: doc.id,
            title: doc.title.clone(),
            abstract_text: doc.abstract_text.clone(),
            label: doc.label,
            question: paper.question.clone(),
            response: paper.response.clone(),
            decision_of_llm: paper.decision_of_llm.clone(),
            relevance_of_paper: value,
        };
        match doc.label {
            1 if value == scale.upper as f64 => relevant.push(example),
            0 if value == scale.lower as f64 => irrelevant.push(example),
            _ => {}
        }
    }

    relevant.extend(irrelevant);
    relevant
}

fn id_from_number_or_text<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(i64),
        Text(String),
    }

    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => Ok(n),
        NumberOrText::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
