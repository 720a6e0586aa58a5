//! Scratch run/qrel files handed to a TAR evaluator.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::{TarError, TopicRanking};

pub const RESULTS_FILE: &str = "output.res";
pub const LABEL_FILE: &str = "label_file";
const RUN_TAG: &str = "pubmed";

/// `output.res` and `label_file` inside one directory, removed on drop.
///
/// The guard owns the paths before anything is written, so a failed write
/// or a failing evaluator still leaves the directory clean.
#[derive(Debug)]
pub struct ScratchFiles {
    results: PathBuf,
    labels: PathBuf,
}

impl ScratchFiles {
    pub fn write(dir: &Path, rankings: &[TopicRanking]) -> Result<Self, TarError> {
        let scratch = Self {
            results: dir.join(RESULTS_FILE),
            labels: dir.join(LABEL_FILE),
        };
        write_lines(&scratch.results, rankings, |topic, rank, id, _| {
            format!("{topic} 0 {id} {rank} {:.1} {RUN_TAG}", -(rank as f64))
        })?;
        write_lines(&scratch.labels, rankings, |topic, _, id, label| {
            format!("{topic} 0 {id} {label}")
        })?;
        Ok(scratch)
    }

    pub fn results(&self) -> &Path {
        &self.results
    }

    pub fn labels(&self) -> &Path {
        &self.labels
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in [&self.results, &self.labels] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch file"),
            }
        }
    }
}

fn write_lines(
    path: &Path,
    rankings: &[TopicRanking],
    line: impl Fn(&str, usize, i64, u8) -> String,
) -> Result<(), TarError> {
    let io_err = |source| TarError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
    for ranking in rankings {
        for (i, (id, label)) in ranking.entries().iter().enumerate() {
            writeln!(writer, "{}", line(ranking.topic(), i + 1, *id, *label)).map_err(io_err)?;
        }
    }
    writer.flush().map_err(io_err)
}
