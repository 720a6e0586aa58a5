//! TAR metrics adapter.
//!
//! Turns rankings plus ground truth into the scratch run/qrel files, hands
//! them to a [`TarEvaluator`] and scales the extracted metrics to 0..100. The
//! scratch files are removed whether or not evaluation succeeds.

mod baseline;
mod scratch;
mod summary;
mod trec;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub use baseline::{shuffled_dataset_baseline, tie_shuffle_baseline, BaselineTopic};
pub use scratch::{ScratchFiles, LABEL_FILE, RESULTS_FILE};
pub use summary::{write_metrics_csv, MetricSummary};
pub use trec::{topic_metrics, TrecTarEvaluator};

#[derive(Debug, Error)]
pub enum TarError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("{0} holds no ranked documents")]
    Empty(PathBuf),
    #[error("topic {topic} has no relevance judgments")]
    MissingTopic { topic: String },
    #[error("document {id} of topic {topic} has no label")]
    MissingLabel { topic: String, id: i64 },
    #[error("nothing to evaluate")]
    NoRankings,
    #[error("evaluator failed: {0}")]
    Evaluator(String),
    #[error("failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },
}

/// Computes metrics from a run file and a qrel file.
pub trait TarEvaluator: Send + Sync {
    /// Unscaled metrics, macro-averaged over the topics in `results`.
    fn evaluate(&self, results: &Path, qrels: &Path) -> Result<MetricSet, TarError>;
}

/// Metric names in report order.
pub const METRIC_NAMES: [&str; 9] = [
    "MAP", "TNR@95%", "R@1%", "R@5%", "R@10%", "R@20%", "R@50%", "WSS@95%", "WSS@100%",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    #[serde(rename = "MAP")]
    pub map: f64,
    #[serde(rename = "TNR@95%")]
    pub tnr_95: f64,
    #[serde(rename = "R@1%")]
    pub recall_1: f64,
    #[serde(rename = "R@5%")]
    pub recall_5: f64,
    #[serde(rename = "R@10%")]
    pub recall_10: f64,
    #[serde(rename = "R@20%")]
    pub recall_20: f64,
    #[serde(rename = "R@50%")]
    pub recall_50: f64,
    #[serde(rename = "WSS@95%")]
    pub wss_95: f64,
    #[serde(rename = "WSS@100%")]
    pub wss_100: f64,
}

impl MetricSet {
    /// Values in [`METRIC_NAMES`] order.
    pub fn values(&self) -> [f64; 9] {
        [
            self.map,
            self.tnr_95,
            self.recall_1,
            self.recall_5,
            self.recall_10,
            self.recall_20,
            self.recall_50,
            self.wss_95,
            self.wss_100,
        ]
    }

    fn from_values(v: [f64; 9]) -> Self {
        Self {
            map: v[0],
            tnr_95: v[1],
            recall_1: v[2],
            recall_5: v[3],
            recall_10: v[4],
            recall_20: v[5],
            recall_50: v[6],
            wss_95: v[7],
            wss_100: v[8],
        }
    }

    pub fn named(&self) -> impl Iterator<Item = (&'static str, f64)> {
        METRIC_NAMES.into_iter().zip(self.values())
    }

    /// Element-wise mean; all zero for an empty slice.
    pub fn mean(sets: &[MetricSet]) -> Self {
        if sets.is_empty() {
            return Self::default();
        }
        let mut acc = [0.0; 9];
        for set in sets {
            for (a, v) in acc.iter_mut().zip(set.values()) {
                *a += v;
            }
        }
        Self::from_values(acc.map(|a| a / sets.len() as f64))
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self::from_values(self.values().map(|v| v * factor))
    }
}

/// One topic's ranked ids with their binary labels, in rank order.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicRanking {
    topic: String,
    entries: Vec<(i64, u8)>,
}

impl TopicRanking {
    /// Every ranked id must have a label.
    pub fn new(
        topic: impl Into<String>,
        ids: &[i64],
        labels: &HashMap<i64, u8>,
    ) -> Result<Self, TarError> {
        let topic = topic.into();
        let entries = ids
            .iter()
            .map(|&id| match labels.get(&id) {
                Some(&label) => Ok((id, label)),
                None => Err(TarError::MissingLabel {
                    topic: topic.clone(),
                    id,
                }),
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { topic, entries })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn entries(&self) -> &[(i64, u8)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Metrics of one ranking, scaled to 0..100.
pub fn evaluate(
    ranking: &TopicRanking,
    evaluator: &dyn TarEvaluator,
    scratch_dir: &Path,
) -> Result<MetricSet, TarError> {
    evaluate_runs(std::slice::from_ref(ranking), evaluator, scratch_dir)
}

/// Metrics of several topic rankings evaluated together, scaled to 0..100.
pub fn evaluate_runs(
    rankings: &[TopicRanking],
    evaluator: &dyn TarEvaluator,
    scratch_dir: &Path,
) -> Result<MetricSet, TarError> {
    if rankings.is_empty() {
        return Err(TarError::NoRankings);
    }
    let scratch = ScratchFiles::write(scratch_dir, rankings)?;
    let metrics = evaluator.evaluate(scratch.results(), scratch.labels())?;
    drop(scratch);

    let metrics = metrics.scaled(100.0);
    info!(
        topics = rankings.len(),
        documents = rankings.iter().map(TopicRanking::len).sum::<usize>(),
        map = metrics.map,
        wss_95 = metrics.wss_95,
        "Evaluated rankings"
    );
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct Failing;

    impl TarEvaluator for Failing {
        fn evaluate(&self, results: &Path, qrels: &Path) -> Result<MetricSet, TarError> {
            assert!(results.exists() && qrels.exists());
            Err(TarError::Evaluator("crashed".to_string()))
        }
    }

    fn labels() -> HashMap<i64, u8> {
        [(1, 1), (2, 0), (3, 1), (4, 0)].into_iter().collect()
    }

    #[test]
    fn scratch_files_are_removed_after_success() {
        let dir = tempdir().unwrap();
        let ranking = TopicRanking::new("t", &[1, 3, 2, 4], &labels()).unwrap();
        let metrics = evaluate(&ranking, &TrecTarEvaluator, dir.path()).unwrap();
        assert!((metrics.map - 100.0).abs() < 1e-9);
        assert!(!dir.path().join(RESULTS_FILE).exists());
        assert!(!dir.path().join(LABEL_FILE).exists());
    }

    #[test]
    fn scratch_files_are_removed_when_evaluator_fails() {
        let dir = tempdir().unwrap();
        let ranking = TopicRanking::new("t", &[1, 2], &labels()).unwrap();
        let err = evaluate(&ranking, &Failing, dir.path()).unwrap_err();
        assert!(matches!(err, TarError::Evaluator(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn unlabeled_documents_are_rejected() {
        let err = TopicRanking::new("t", &[1, 9], &labels()).unwrap_err();
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn topics_are_macro_averaged() {
        let dir = tempdir().unwrap();
        let good = TopicRanking::new("a", &[1, 3, 2, 4], &labels()).unwrap();
        let bad = TopicRanking::new("b", &[2, 4, 1, 3], &labels()).unwrap();
        let both = evaluate_runs(&[good.clone(), bad.clone()], &TrecTarEvaluator, dir.path()).unwrap();
        let a = evaluate(&good, &TrecTarEvaluator, dir.path()).unwrap();
        let b = evaluate(&bad, &TrecTarEvaluator, dir.path()).unwrap();
        assert!((both.map - (a.map + b.map) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn metric_names_follow_report_order() {
        let set = MetricSet {
            map: 1.0,
            wss_100: 9.0,
            ..MetricSet::default()
        };
        let named: Vec<_> = set.named().collect();
        assert_eq!(named[0], ("MAP", 1.0));
        assert_eq!(named[8], ("WSS@100%", 9.0));
    }
}
