//! Random baselines for comparing tie-breaking strategies.

use std::cmp::Ordering;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{evaluate_runs, MetricSet, TarError, TarEvaluator, TopicRanking};
use crate::dataset::Dataset;
use crate::screening::{impute_invalid, ScoredDocument};

/// Aggregated estimates of one topic.
#[derive(Debug, Clone)]
pub struct BaselineTopic {
    pub topic: String,
    pub documents: Vec<ScoredDocument>,
}

/// Order by estimate and shuffle each tie group; one metric set per seed `0..runs`.
pub fn tie_shuffle_baseline(
    topics: &[BaselineTopic],
    runs: u64,
    evaluator: &dyn TarEvaluator,
    scratch_dir: &Path,
) -> Result<Vec<MetricSet>, TarError> {
    let prepared: Vec<(String, Vec<ScoredDocument>)> = topics
        .iter()
        .map(|t| {
            let mut docs = t.documents.clone();
            impute_invalid(&mut docs);
            docs.sort_by(|a, b| b.estimate.total_cmp(&a.estimate));
            (t.topic.clone(), docs)
        })
        .collect();

    (0..runs)
        .map(|seed| {
            let rankings = prepared
                .iter()
                .map(|(topic, docs)| {
                    let mut ordered = Vec::with_capacity(docs.len());
                    for group in docs.chunk_by(|a, b| a.estimate.total_cmp(&b.estimate) == Ordering::Equal) {
                        let mut group = group.to_vec();
                        if group.len() > 1 {
                            group.shuffle(&mut StdRng::seed_from_u64(seed));
                        }
                        ordered.extend(group);
                    }
                    ranking_of(topic, &ordered)
                })
                .collect::<Result<Vec<_>, _>>()?;
            evaluate_runs(&rankings, evaluator, scratch_dir)
        })
        .collect()
}

/// Shuffle every dataset as a whole; one metric set per seed `0..runs`.
pub fn shuffled_dataset_baseline(
    topics: &[(String, Dataset)],
    runs: u64,
    evaluator: &dyn TarEvaluator,
    scratch_dir: &Path,
) -> Result<Vec<MetricSet>, TarError> {
    (0..runs)
        .map(|seed| {
            let rankings = topics
                .iter()
                .map(|(topic, dataset)| {
                    let mut ids: Vec<i64> = dataset.documents.iter().map(|d| d.id).collect();
                    ids.shuffle(&mut StdRng::seed_from_u64(seed));
                    TopicRanking::new(topic.clone(), &ids, &dataset.labels())
                })
                .collect::<Result<Vec<_>, _>>()?;
            evaluate_runs(&rankings, evaluator, scratch_dir)
        })
        .collect()
}

fn ranking_of(topic: &str, docs: &[ScoredDocument]) -> Result<TopicRanking, TarError> {
    let ids: Vec<i64> = docs.iter().map(|d| d.document.id).collect();
    let labels = docs.iter().map(|d| (d.document.id, d.document.label)).collect();
    TopicRanking::new(topic, &ids, &labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Document;
    use crate::tar::TrecTarEvaluator;
    use tempfile::tempdir;

    fn topic(estimates: &[(i64, f64, u8)]) -> BaselineTopic {
        BaselineTopic {
            topic: "t".to_string(),
            documents: estimates
                .iter()
                .map(|&(id, estimate, label)| ScoredDocument {
                    document: Document::new(id, "", "", label),
                    estimate,
                })
                .collect(),
        }
    }

    #[test]
    fn distinct_estimates_give_identical_runs() {
        let dir = tempdir().unwrap();
        let t = topic(&[(1, 3.0, 1), (2, 2.0, 0), (3, 1.0, 1)]);
        let sets = tie_shuffle_baseline(&[t], 3, &TrecTarEvaluator, dir.path()).unwrap();
        assert_eq!(sets.len(), 3);
        assert!(sets.iter().all(|s| s == &sets[0]));
    }

    #[test]
    fn shuffling_stays_inside_tie_groups() {
        let dir = tempdir().unwrap();
        // The relevant document is alone at the top, so recall at the first cutoff never moves.
        let mut docs = vec![(1, 4.0, 1)];
        docs.extend((2..30).map(|id| (id, 1.0, 0)));
        let sets = tie_shuffle_baseline(&[topic(&docs)], 4, &TrecTarEvaluator, dir.path()).unwrap();
        assert!(sets.iter().all(|s| (s.map - 100.0).abs() < 1e-9));
    }

    #[test]
    fn whole_dataset_shuffle_is_seeded() {
        let dir = tempdir().unwrap();
        let dataset = Dataset::new(
            (1..=50)
                .map(|id| Document::new(id, "", "", u8::from(id % 7 == 0)))
                .collect(),
        );
        let topics = vec![("t".to_string(), dataset)];
        let a = shuffled_dataset_baseline(&topics, 2, &TrecTarEvaluator, dir.path()).unwrap();
        let b = shuffled_dataset_baseline(&topics, 2, &TrecTarEvaluator, dir.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
