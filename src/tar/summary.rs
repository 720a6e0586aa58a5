//! Metric summaries written next to an experiment.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use statrs::statistics::Statistics;

use super::{MetricSet, TarError, METRIC_NAMES};

/// Formatted metric values: `"mean"` for a single set, `"mean±std"` otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSummary {
    entries: Vec<(&'static str, String)>,
}

impl MetricSummary {
    pub fn from_sets(sets: &[MetricSet]) -> Result<Self, TarError> {
        if sets.is_empty() {
            return Err(TarError::NoRankings);
        }
        let with_std = sets.len() > 1;
        let entries = METRIC_NAMES
            .iter()
            .enumerate()
            .map(|(i, &name)| {
                let values: Vec<f64> = sets.iter().map(|s| s.values()[i]).collect();
                let mean = values.iter().mean();
                let text = if with_std {
                    // Sample standard deviation (n - 1).
                    format!("{mean:.5}±{:.3}", values.iter().std_dev())
                } else {
                    format!("{mean:.5}")
                };
                (name, text)
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|(name, value)| (name.to_string(), Value::String(value.clone())))
            .collect();
        Value::Object(map)
    }

    /// Write `<dir>/<tag>_metrics.json`.
    pub fn write(&self, dir: &Path, tag: &str) -> Result<PathBuf, TarError> {
        let path = dir.join(format!("{tag}_metrics.json"));
        let raw = serde_json::to_string_pretty(&self.to_json()).map_err(|e| TarError::Write {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, raw).map_err(|source| TarError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// One row per labelled metric set, values rounded to two decimals.
pub fn write_metrics_csv(path: &Path, rows: &[(String, MetricSet)]) -> Result<(), TarError> {
    let csv_err = |e: csv::Error| TarError::Write {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;

    let mut header = vec![""];
    header.extend(METRIC_NAMES);
    writer.write_record(&header).map_err(csv_err)?;

    for (label, set) in rows {
        let mut record = vec![label.clone()];
        record.extend(set.values().iter().map(|v| format!("{v:.2}")));
        writer.write_record(&record).map_err(csv_err)?;
    }
    writer.flush().map_err(|source| TarError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn set(map: f64) -> MetricSet {
        MetricSet {
            map,
            ..MetricSet::default()
        }
    }

    #[test]
    fn single_set_has_no_deviation() {
        let summary = MetricSummary::from_sets(&[set(12.5)]).unwrap();
        assert_eq!(summary.get("MAP"), Some("12.50000"));
    }

    #[test]
    fn several_sets_report_sample_deviation() {
        let summary = MetricSummary::from_sets(&[set(10.0), set(20.0), set(30.0)]).unwrap();
        assert_eq!(summary.get("MAP"), Some("20.00000±10.000"));
        assert_eq!(summary.get("WSS@95%"), Some("0.00000±0.000"));
    }

    #[test]
    fn written_file_is_named_after_the_tag() {
        let dir = tempdir().unwrap();
        let summary = MetricSummary::from_sets(&[set(1.0)]).unwrap();
        let path = summary.write(dir.path(), "0-4").unwrap();
        assert!(path.ends_with("0-4_metrics.json"));
        let json: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["MAP"], "1.00000");
        assert_eq!(json.as_object().unwrap().len(), 9);
    }

    #[test]
    fn csv_rows_are_rounded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("all.csv");
        write_metrics_csv(&path, &[("random".to_string(), set(33.3333))]).unwrap();
        let raw = std::fs::read_to_string(path).unwrap();
        let mut lines = raw.lines();
        assert!(lines.next().unwrap().starts_with(",MAP,TNR@95%"));
        assert!(lines.next().unwrap().starts_with("random,33.33,0.00"));
    }
}
