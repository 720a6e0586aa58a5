//! Self-consistency aggregation: one relevance estimate per document from
//! several run logs.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{error, warn};

use super::record::RunRecord;
use crate::dataset::{Dataset, Document};

/// Mean relevance per document id.
pub type AggregatedEstimate = BTreeMap<i64, f64>;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("no run logs to aggregate")]
    NoRuns,
    #[error("run {run} holds {found} papers, expected {expected}")]
    CountMismatch {
        run: usize,
        expected: usize,
        found: usize,
    },
    #[error("document {id} has no relevance estimate")]
    MissingEstimate { id: i64 },
    #[error("estimate for document {id} matches no document in the dataset")]
    ExtraDocument { id: i64 },
}

/// Mean of the accepted relevance values over every run, for ids present in all runs.
///
/// INVALID values are averaged in as they are.
pub fn aggregate(runs: &[RunRecord]) -> Result<AggregatedEstimate, AggregateError> {
    let (first, rest) = runs.split_first().ok_or(AggregateError::NoRuns)?;
    let expected = first.papers.len();
    for (i, run) in rest.iter().enumerate() {
        if run.papers.len() != expected {
            let err = AggregateError::CountMismatch {
                run: i + 1,
                expected,
                found: run.papers.len(),
            };
            error!(error = %err, "Run logs disagree on document count");
            return Err(err);
        }
    }

    let shared: BTreeSet<i64> = first
        .papers
        .keys()
        .copied()
        .filter(|id| rest.iter().all(|run| run.papers.contains_key(id)))
        .collect();
    if shared.len() != expected {
        warn!(
            dropped = expected - shared.len(),
            "Documents missing from some run logs were dropped"
        );
    }

    let invalid: usize = runs.iter().map(RunRecord::invalid_count).sum();
    if invalid > 0 {
        warn!(invalid, runs = runs.len(), "INVALID decisions are averaged into the estimates");
    }

    let n = runs.len() as f64;
    Ok(shared
        .into_iter()
        .map(|id| {
            let sum: f64 = runs.iter().map(|run| run.papers[&id].relevance_of_paper).sum();
            (id, sum / n)
        })
        .collect())
}

/// A dataset document with its aggregated estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub document: Document,
    pub estimate: f64,
}

/// Pair every document with its estimate, in dataset order.
///
/// Both sides must hold exactly the same ids.
pub fn attach_estimates(
    dataset: &Dataset,
    estimates: &AggregatedEstimate,
) -> Result<Vec<ScoredDocument>, AggregateError> {
    let mut scored = Vec::with_capacity(dataset.len());
    for document in &dataset.documents {
        let Some(&estimate) = estimates.get(&document.id) else {
            error!(document_id = document.id, "Document has no relevance estimate");
            return Err(AggregateError::MissingEstimate { id: document.id });
        };
        scored.push(ScoredDocument {
            document: document.clone(),
            estimate,
        });
    }
    if scored.len() != estimates.len() {
        let known: BTreeSet<i64> = dataset.documents.iter().map(|d| d.id).collect();
        if let Some(&id) = estimates.keys().find(|id| !known.contains(id)) {
            error!(document_id = id, "Estimate has no matching document");
            return Err(AggregateError::ExtraDocument { id });
        }
    }
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screening::{PaperRecord, RunHeader, INVALID};

    fn run(values: &[(i64, f64)]) -> RunRecord {
        let mut record = RunRecord::new(RunHeader::new("m", "p"));
        for &(id, value) in values {
            record.papers.insert(
                id,
                PaperRecord {
                    question: String::new(),
                    response: String::new(),
                    decision_of_llm: String::new(),
                    relevance_of_paper: value,
                    ground_truth: 0,
                    prompt_tokens: 0,
                    response_tokens: 0,
                    error: None,
                },
            );
        }
        record
    }

    #[test]
    fn invalid_values_enter_the_mean_unchanged() {
        let runs = [run(&[(1, 2.0)]), run(&[(1, INVALID)]), run(&[(1, 4.0)])];
        let estimate = aggregate(&runs).unwrap();
        assert!((estimate[&1] - 5.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn single_run_is_passed_through() {
        let estimate = aggregate(&[run(&[(1, 3.0), (2, 0.0)])]).unwrap();
        assert_eq!(estimate[&1], 3.0);
        assert_eq!(estimate[&2], 0.0);
    }

    #[test]
    fn differing_counts_are_fatal() {
        let runs = [run(&[(1, 1.0), (2, 1.0)]), run(&[(1, 1.0)])];
        let err = aggregate(&runs).unwrap_err();
        assert!(matches!(
            err,
            AggregateError::CountMismatch {
                run: 1,
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn ids_missing_from_a_run_are_dropped() {
        let runs = [run(&[(1, 1.0), (2, 3.0)]), run(&[(1, 3.0), (3, 3.0)])];
        let estimate = aggregate(&runs).unwrap();
        assert_eq!(estimate.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(estimate[&1], 2.0);
    }

    #[test]
    fn no_runs_is_an_error() {
        assert!(matches!(aggregate(&[]), Err(AggregateError::NoRuns)));
    }

    #[test]
    fn attach_requires_one_to_one_ids() {
        let dataset = Dataset::new(vec![
            Document::new(2, "b", "", 1),
            Document::new(1, "a", "", 0),
        ]);
        let ok: AggregatedEstimate = [(1, 1.0), (2, 2.0)].into_iter().collect();
        let scored = attach_estimates(&dataset, &ok).unwrap();
        assert_eq!(scored[0].document.id, 2);
        assert_eq!(scored[0].estimate, 2.0);

        let missing: AggregatedEstimate = [(1, 1.0)].into_iter().collect();
        assert!(matches!(
            attach_estimates(&dataset, &missing),
            Err(AggregateError::MissingEstimate { id: 2 })
        ));

        let extra: AggregatedEstimate = [(1, 1.0), (2, 2.0), (7, 0.0)].into_iter().collect();
        let err = attach_estimates(&dataset, &extra).unwrap_err();
        assert!(err.to_string().contains('7'));
    }
}
