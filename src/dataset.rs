//! Dataset loading: SLR CSV files in several schemas, normalized to [`Document`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

// =============================================================================
// Documents
// =============================================================================

/// A candidate paper with its ground-truth screening label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub label: u8,
}

impl Document {
    pub fn new(
        id: i64,
        title: impl Into<String>,
        abstract_text: impl Into<String>,
        label: u8,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            abstract_text: abstract_text.into(),
            label,
        }
    }

    /// Text handed to auxiliary rerankers.
    pub fn title_abstract(&self) -> String {
        format!("{} {}", self.title, self.abstract_text)
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path}: missing column '{column}'")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("{path}: row {row}: unrecognized label '{value}'")]
    Label {
        path: PathBuf,
        row: usize,
        value: String,
    },
    #[error("{path}: row {row}: invalid document id '{value}'")]
    Id {
        path: PathBuf,
        row: usize,
        value: String,
    },
    #[error("{path}: duplicate document id {id}")]
    DuplicateId { path: PathBuf, id: i64 },
    #[error("failed to read SLR metadata {path}: {message}")]
    Metadata { path: PathBuf, message: String },
    #[error("no SLR metadata for '{slr}' in {path}")]
    UnknownSlr { path: PathBuf, slr: String },
}

/// Column layout of a source CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSchema {
    /// `title, abstract, label_included`; ids assigned 1..=N.
    Synergy,
    /// `title, abstract, tag` (Included / Excluded); ids assigned 1..=N.
    Guo,
    /// `PMID, Title, Abstract, Label`; ids taken from PMID.
    Tar,
}

struct Columns {
    id: Option<&'static str>,
    title: &'static str,
    abstract_text: &'static str,
    label: &'static str,
}

impl DatasetSchema {
    fn columns(self) -> Columns {
        match self {
            DatasetSchema::Synergy => Columns {
                id: None,
                title: "title",
                abstract_text: "abstract",
                label: "label_included",
            },
            DatasetSchema::Guo => Columns {
                id: None,
                title: "title",
                abstract_text: "abstract",
                label: "tag",
            },
            DatasetSchema::Tar => Columns {
                id: Some("PMID"),
                title: "Title",
                abstract_text: "Abstract",
                label: "Label",
            },
        }
    }
}

/// Documents of one SLR, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub documents: Vec<Document>,
}

impl Dataset {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    /// Load `<folder>/<slr>` (".csv" appended when missing).
    pub fn load(folder: &Path, slr: &str, schema: DatasetSchema) -> Result<Self, DatasetError> {
        let file = if slr.ends_with(".csv") {
            slr.to_string()
        } else {
            format!("{slr}.csv")
        };
        Self::from_csv(&folder.join(file), schema)
    }

    pub fn from_csv(path: &Path, schema: DatasetSchema) -> Result<Self, DatasetError> {
        let csv_err = |source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(csv_err)?;

        let cols = schema.columns();
        let headers = reader.headers().map_err(csv_err)?.clone();
        let find = |column: &'static str| {
            headers
                .iter()
                .position(|h| h.trim() == column)
                .ok_or_else(|| DatasetError::MissingColumn {
                    path: path.to_path_buf(),
                    column,
                })
        };

        let id_idx = cols.id.map(&find).transpose()?;
        let title_idx = find(cols.title)?;
        let abstract_idx = find(cols.abstract_text)?;
        let label_idx = find(cols.label)?;

        let mut documents = Vec::new();
        let mut seen = HashSet::new();
        for (row, record) in reader.records().enumerate() {
            let record = record.map_err(csv_err)?;
            let field = |idx: usize| record.get(idx).unwrap_or("").trim().to_string();

            let id = match id_idx {
                Some(idx) => {
                    let raw = field(idx);
                    raw.parse::<i64>().map_err(|_| DatasetError::Id {
                        path: path.to_path_buf(),
                        row: row + 1,
                        value: raw.clone(),
                    })?
                }
                None => row as i64 + 1,
            };
            if !seen.insert(id) {
                return Err(DatasetError::DuplicateId {
                    path: path.to_path_buf(),
                    id,
                });
            }

            let raw_label = field(label_idx);
            let label = parse_label(&raw_label).ok_or_else(|| DatasetError::Label {
                path: path.to_path_buf(),
                row: row + 1,
                value: raw_label.clone(),
            })?;

            documents.push(Document::new(id, field(title_idx), field(abstract_idx), label));
        }

        Ok(Self { documents })
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Drop documents used as few-shot exemplars.
    pub fn exclude(&self, ids: &HashSet<i64>) -> Self {
        Self {
            documents: self
                .documents
                .iter()
                .filter(|d| !ids.contains(&d.id))
                .cloned()
                .collect(),
        }
    }

    /// First `n` documents, or all of them when `n` is `None`.
    pub fn head(&self, n: Option<usize>) -> Self {
        match n {
            Some(n) => Self {
                documents: self.documents.iter().take(n).cloned().collect(),
            },
            None => self.clone(),
        }
    }

    /// Ground truth keyed by id.
    pub fn labels(&self) -> HashMap<i64, u8> {
        self.documents.iter().map(|d| (d.id, d.label)).collect()
    }

    pub fn positives(&self) -> usize {
        self.documents.iter().filter(|d| d.label == 1).count()
    }
}

fn parse_label(raw: &str) -> Option<u8> {
    match raw.to_ascii_lowercase().as_str() {
        "included" | "include" | "true" => return Some(1),
        "excluded" | "exclude" | "false" => return Some(0),
        _ => {}
    }
    match raw.parse::<f64>().ok()? {
        v if v == 1.0 => Some(1),
        v if v == 0.0 => Some(0),
        _ => None,
    }
}

// =============================================================================
// SLR metadata
// =============================================================================

/// Review-level context used in prompts and rerank queries.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SlrInfo {
    pub title: String,
    #[serde(default, deserialize_with = "text_or_lines")]
    pub research_questions: String,
    #[serde(default, deserialize_with = "text_or_lines")]
    pub inclusion_criteria: String,
    #[serde(default, deserialize_with = "text_or_lines")]
    pub exclusion_criteria: String,
}

/// How the rerank query is composed from the SLR metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryComposition {
    Title,
    TitleAndResearchQuestions,
}

impl QueryComposition {
    pub fn descriptor(self) -> &'static str {
        match self {
            QueryComposition::Title => "title",
            QueryComposition::TitleAndResearchQuestions => "title + research questions",
        }
    }
}

impl SlrInfo {
    /// Read the entry for `slr` from a JSON object keyed by SLR name.
    pub fn load(path: &Path, slr: &str) -> Result<Self, DatasetError> {
        let meta_err = |message: String| DatasetError::Metadata {
            path: path.to_path_buf(),
            message,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| meta_err(e.to_string()))?;
        let mut all: HashMap<String, SlrInfo> =
            serde_json::from_str(&raw).map_err(|e| meta_err(e.to_string()))?;
        all.remove(slr)
            .or_else(|| all.remove(slr.trim_end_matches(".csv")))
            .ok_or_else(|| DatasetError::UnknownSlr {
                path: path.to_path_buf(),
                slr: slr.to_string(),
            })
    }

    pub fn query(&self, composition: QueryComposition) -> String {
        match composition {
            QueryComposition::Title => self.title.clone(),
            QueryComposition::TitleAndResearchQuestions => {
                let rqs = self.research_questions.replace('\n', "").replace("- ", "");
                format!("{} {}", self.title, rqs)
            }
        }
    }
}

fn text_or_lines<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TextOrLines {
        Text(String),
        Lines(Vec<String>),
    }

    Ok(match TextOrLines::deserialize(deserializer)? {
        TextOrLines::Text(s) => s,
        TextOrLines::Lines(lines) => lines.join("\n"),
    })
}
