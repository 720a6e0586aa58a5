//! On-disk layout of an experiment: one folder per run, one `log_file_<n>.json`
//! per repetition, plus the ranked output `ranked_df.json`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::RunRecord;

pub const RANKED_OUTPUT_FILE: &str = "ranked_df.json";
const LOG_PREFIX: &str = "log_file_";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {message}")]
    Json { path: PathBuf, message: String },
    #[error("refusing to overwrite {0}")]
    Exists(PathBuf),
    #[error("no run logs in {0}")]
    Empty(PathBuf),
}

/// Final ranking of one run, as written to `ranked_df.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedOutput {
    pub reranker: String,
    pub timestamp: String,
    /// "title" or "title + research questions".
    pub query: String,
    /// Seconds spent reranking.
    pub duration: f64,
    pub ids: Vec<i64>,
}

/// Folder name: `<slr>_<few_shot|zero_shot>_<model>_<YYYY.MM.DD_HH-MM-SS>_<count>_<index>`.
pub fn run_folder_name(
    slr: &str,
    few_shot: bool,
    model: &str,
    started: DateTime<Local>,
    count: usize,
    index: usize,
) -> String {
    let shots = if few_shot { "few_shot" } else { "zero_shot" };
    format!(
        "{}_{shots}_{model}_{}_{count}_{index}",
        slr.trim_end_matches(".csv"),
        started.format("%Y.%m.%d_%H-%M-%S")
    )
}

/// SLR name from a run folder name: everything before `_few_shot` or `_zero_shot`.
pub fn slr_from_folder(name: &str) -> Option<&str> {
    ["_few_shot", "_zero_shot"]
        .iter()
        .filter_map(|marker| name.find(marker))
        .min()
        .filter(|&i| i > 0)
        .map(|i| &name[..i])
}

/// A run folder.
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    /// Create `<output_dir>/<folder>`.
    pub fn create(output_dir: &Path, folder: &str) -> Result<Self, StoreError> {
        let dir = output_dir.join(folder);
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self, repetition: usize) -> PathBuf {
        self.dir.join(format!("{LOG_PREFIX}{repetition}.json"))
    }

    /// Write the run log of `repetition`. Each log is written exactly once.
    pub fn save(&self, repetition: usize, record: &RunRecord) -> Result<PathBuf, StoreError> {
        let path = self.log_path(repetition);
        write_new(&path, record)?;
        Ok(path)
    }

    /// Every `log_file_<n>.json`, ordered by `n`.
    pub fn log_files(&self) -> Result<Vec<(usize, PathBuf)>, StoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let Some(n) = name
                .to_str()
                .and_then(|s| s.strip_prefix(LOG_PREFIX))
                .and_then(|s| s.strip_suffix(".json"))
                .and_then(|s| s.parse::<usize>().ok())
            else {
                continue;
            };
            files.push((n, entry.path()));
        }
        files.sort_by_key(|(n, _)| *n);
        Ok(files)
    }

    pub fn load_all(&self) -> Result<Vec<RunRecord>, StoreError> {
        let files = self.log_files()?;
        if files.is_empty() {
            return Err(StoreError::Empty(self.dir.clone()));
        }
        files.iter().map(|(_, path)| read_json(path)).collect()
    }

    /// Write `ranked_df.json`, replacing the ranking of an earlier reranker.
    pub fn save_ranking(&self, ranked: &RankedOutput) -> Result<PathBuf, StoreError> {
        let path = self.dir.join(RANKED_OUTPUT_FILE);
        let raw = to_json(&path, ranked)?;
        std::fs::write(&path, raw).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn load_ranking(&self) -> Result<RankedOutput, StoreError> {
        read_json(&self.dir.join(RANKED_OUTPUT_FILE))
    }

    pub fn has_ranking(&self) -> bool {
        self.dir.join(RANKED_OUTPUT_FILE).is_file()
    }
}

fn write_new<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let raw = to_json(path, value)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::AlreadyExists {
                StoreError::Exists(path.to_path_buf())
            } else {
                io_err(source)
            }
        })?;
    file.write_all(raw.as_bytes()).map_err(io_err)
}

fn to_json<T: Serialize>(path: &Path, value: &T) -> Result<String, StoreError> {
    serde_json::to_string_pretty(value).map_err(|e| StoreError::Json {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|e| StoreError::Json {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
