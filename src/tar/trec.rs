//! Built-in TAR evaluation routine over TREC-style run and qrel files.
//!
//! Per topic: average precision, recall at 1/5/10/20/50% of the ranking,
//! work saved over sampling at 95% and 100% recall, and the true negative
//! rate at 95% recall. Topics are macro-averaged. Values are fractions in
//! `[0, 1]`; the adapter scales them.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use super::{MetricSet, TarError, TarEvaluator};

const RECALL_CUTOFFS: [usize; 5] = [1, 5, 10, 20, 50];

#[derive(Debug, Clone, Copy, Default)]
pub struct TrecTarEvaluator;

impl TarEvaluator for TrecTarEvaluator {
    fn evaluate(&self, results: &Path, qrels: &Path) -> Result<MetricSet, TarError> {
        let runs = read_results(results)?;
        let judgments = read_qrels(qrels)?;
        if runs.is_empty() {
            return Err(TarError::Empty(results.to_path_buf()));
        }

        let mut per_topic = Vec::with_capacity(runs.len());
        for (topic, mut ranked) in runs {
            let qrel = judgments.get(&topic).ok_or_else(|| TarError::MissingTopic {
                topic: topic.clone(),
            })?;
            ranked.sort_by_key(|(rank, _)| *rank);
            let relevant: Vec<bool> = ranked
                .iter()
                .map(|(_, id)| qrel.get(id).copied().unwrap_or(0) > 0)
                .collect();
            let total_relevant = qrel.values().filter(|&&l| l > 0).count();
            per_topic.push(topic_metrics(&relevant, total_relevant));
        }
        Ok(MetricSet::mean(&per_topic))
    }
}

/// Metrics of one topic from relevance flags in rank order.
pub fn topic_metrics(relevant: &[bool], total_relevant: usize) -> MetricSet {
    let n = relevant.len();
    if n == 0 || total_relevant == 0 {
        return MetricSet::default();
    }
    let r_total = total_relevant as f64;

    // found[k] = relevant documents among the first k.
    let mut found = Vec::with_capacity(n + 1);
    found.push(0usize);
    let mut ap = 0.0;
    for (i, &rel) in relevant.iter().enumerate() {
        let hits = found[i] + usize::from(rel);
        if rel {
            ap += hits as f64 / (i + 1) as f64;
        }
        found.push(hits);
    }

    let recall_at = |pct: usize| {
        let cutoff = (n * pct).div_ceil(100).min(n);
        found[cutoff] as f64 / r_total
    };
    let rank_at_recall = |target: f64| {
        (1..=n)
            .find(|&k| found[k] as f64 >= target * r_total - 1e-9)
            .unwrap_or(n)
    };
    let wss = |target: f64| (n - rank_at_recall(target)) as f64 / n as f64 - (1.0 - target);

    let n95 = rank_at_recall(0.95);
    let negatives = n - found[n];
    let tnr_95 = if negatives == 0 {
        0.0
    } else {
        let seen_negatives = n95 - found[n95];
        (negatives - seen_negatives) as f64 / negatives as f64
    };

    let [r1, r5, r10, r20, r50] = RECALL_CUTOFFS.map(recall_at);
    MetricSet {
        map: ap / r_total,
        tnr_95,
        recall_1: r1,
        recall_5: r5,
        recall_10: r10,
        recall_20: r20,
        recall_50: r50,
        wss_95: wss(0.95),
        wss_100: wss(1.0),
    }
}

type Results = BTreeMap<String, Vec<(usize, i64)>>;
type Qrels = HashMap<String, HashMap<i64, u8>>;

fn read_results(path: &Path) -> Result<Results, TarError> {
    let mut runs: Results = BTreeMap::new();
    for (line_no, fields) in read_fields(path, 6)? {
        let id = parse_field(path, line_no, &fields[2])?;
        let rank = parse_field(path, line_no, &fields[3])?;
        runs.entry(fields[0].clone()).or_default().push((rank, id));
    }
    Ok(runs)
}

fn read_qrels(path: &Path) -> Result<Qrels, TarError> {
    let mut qrels: Qrels = HashMap::new();
    for (line_no, fields) in read_fields(path, 4)? {
        let id = parse_field(path, line_no, &fields[2])?;
        let label = parse_field(path, line_no, &fields[3])?;
        qrels.entry(fields[0].clone()).or_default().insert(id, label);
    }
    Ok(qrels)
}

/// Non-empty lines split on whitespace, with 1-based line numbers.
fn read_fields(path: &Path, width: usize) -> Result<Vec<(usize, Vec<String>)>, TarError> {
    let raw = std::fs::read_to_string(path).map_err(|source| TarError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut rows = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if fields.len() != width {
            return Err(TarError::Parse {
                path: path.to_path_buf(),
                line: i + 1,
                message: format!("expected {width} fields, found {}", fields.len()),
            });
        }
        rows.push((i + 1, fields));
    }
    Ok(rows)
}

fn parse_field<T: std::str::FromStr>(path: &Path, line: usize, raw: &str) -> Result<T, TarError> {
    raw.parse().map_err(|_| TarError::Parse {
        path: path.to_path_buf(),
        line,
        message: format!("cannot parse '{raw}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn hand_computed_topic() {
        let mut relevant = vec![false; 10];
        relevant[0] = true;
        relevant[2] = true;
        let m = topic_metrics(&relevant, 2);

        assert!(close(m.map, (1.0 + 2.0 / 3.0) / 2.0));
        assert!(close(m.recall_1, 0.5));
        assert!(close(m.recall_10, 0.5));
        assert!(close(m.recall_20, 0.5));
        assert!(close(m.recall_50, 1.0));
        assert!(close(m.wss_95, 0.7 - 0.05));
        assert!(close(m.wss_100, 0.7));
        assert!(close(m.tnr_95, 7.0 / 8.0));
    }

    #[test]
    fn perfect_ranking() {
        let relevant = [true, true, false, false];
        let m = topic_metrics(&relevant, 2);
        assert!(close(m.map, 1.0));
        assert!(close(m.wss_100, 0.5));
        assert!(close(m.tnr_95, 1.0));
    }

    #[test]
    fn relevant_documents_missing_from_ranking_cap_recall() {
        let m = topic_metrics(&[true, false], 2);
        assert!(close(m.recall_50, 0.5));
        assert!(close(m.map, 0.5));
    }

    #[test]
    fn no_relevant_documents_scores_zero() {
        let m = topic_metrics(&[false, false], 0);
        assert_eq!(m, MetricSet::default());
    }
}
