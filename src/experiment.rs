//! Experiment drivers: screen → rank → evaluate.
//!
//! Each driver takes a validated [`ExperimentConfig`] and the collaborators it
//! needs (gateway, scorer, evaluator) and works on the folder layout below
//! `output_directory`:
//!
//! ```text
//! <experiment>/<slr>_<few_shot|zero_shot>_<model>_<timestamp>_<count>_<index>/
//!     log_file_0.json ... log_file_<R-1>.json
//!     ranked_df.json
//! <experiment>/<tag>_metrics.json
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, ExperimentConfig};
use crate::dataset::{Dataset, DatasetError, SlrInfo};
use crate::fewshot::{
    candidate_path, derive_candidates, exemplar_ids, load_candidates, save_candidates,
    select_examples, FewShotError, OrderingPattern, SelectionSettings,
};
use crate::gateway::ChatGateway;
use crate::prompts::ScreeningPrompter;
use crate::scoring::{RelevanceScorer, ScorerError};
use crate::screening::{
    aggregate, attach_estimates, run_folder_name, slr_from_folder, AggregateError,
    EvaluationLoop, FewShotHeader, PointwiseReranker, RankedOutput, RerankError, RunError,
    RunHeader, RunRecord, RunStore, StoreError, TraceSink,
};
use crate::tar::{
    evaluate_runs, shuffled_dataset_baseline, tie_shuffle_baseline, write_metrics_csv,
    BaselineTopic, MetricSet, MetricSummary, TarError, TarEvaluator, TopicRanking,
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    FewShot(#[from] FewShotError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Rerank(#[from] RerankError),
    #[error(transparent)]
    Scorer(#[from] ScorerError),
    #[error(transparent)]
    Tar(#[from] TarError),
    #[error("cannot tell the SLR of run folder {0}")]
    UnknownRunFolder(PathBuf),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// =============================================================================
// Screening
// =============================================================================

/// Where a screening run was written.
#[derive(Debug, Clone)]
pub struct ScreeningOutcome {
    pub run_dir: PathBuf,
    pub log_files: Vec<PathBuf>,
    pub documents: usize,
}

/// Screen every document of `slr` and persist one run log per repetition.
///
/// `index` selects the few-shot candidate file and is part of the folder name.
pub async fn run_screening(
    config: &ExperimentConfig,
    slr: &str,
    index: usize,
    gateway: &dyn ChatGateway,
    trace: Option<&dyn TraceSink>,
) -> Result<ScreeningOutcome, ExperimentError> {
    let llm = &config.llm_client_config;
    let slr = slr.trim_end_matches(".csv");
    let scale = config.scale();
    let dataset = Dataset::load(&config.folder_path_slrs, slr, config.schema())?;
    let slr_info = SlrInfo::load(&config.file_path_slr_infos, slr)?;

    let examples = if llm.is_few_shot {
        let path = candidate_path(
            &config.folder_path_few_shot_examples,
            slr,
            llm.prompting_technique,
            &llm.name_of_model,
            index,
        );
        let candidates = load_candidates(&path)?;
        select_examples(
            &candidates,
            &SelectionSettings {
                pattern: OrderingPattern::parse(&llm.ordering_few_shot_examples)?,
                seed: llm.few_shot_example_seed,
                repetitions: config.repetitions(),
                different_examples: llm.different_examples,
            },
        )
    } else {
        Vec::new()
    };

    let dataset = dataset.exclude(&exemplar_ids(&examples)).head(llm.count);
    let template = llm.prompting_technique.template(scale);
    let prompter = ScreeningPrompter::new(
        template,
        llm.system_message_type.template(),
        slr_info,
        scale,
    )
    .with_examples(examples);

    let mut header = RunHeader::new(llm.name_of_model.clone(), llm.path_to_model.clone());
    header.path_of_additional_ranker = Some(llm.path_to_reranker.clone());
    header.model_temperature = llm.temperature;
    header.count = dataset.len();
    header.prompt_template = template.text.to_string();
    header.system_message = prompter.system_message().to_string();
    header.num_of_max_requests = llm.num_of_max_requests;
    if llm.is_few_shot {
        header.few_shot = Some(FewShotHeader {
            ordering: llm.ordering_few_shot_examples.clone(),
            different_examples: llm.different_examples,
            seed: llm.few_shot_example_seed,
            examples: Vec::new(),
        });
    }

    let folder = run_folder_name(
        slr,
        llm.is_few_shot,
        &llm.name_of_model,
        Local::now(),
        dataset.len(),
        index,
    );
    let store = RunStore::create(&config.output_directory, &folder)?;
    info!(slr, run_dir = %store.dir().display(), documents = dataset.len(), "Screening SLR");

    let mut runner = EvaluationLoop::new(gateway, config.evaluation_settings());
    if let Some(sink) = trace {
        runner = runner.with_trace(sink);
    }
    let log_files = runner.run(&dataset, &prompter, &header, &store).await?;

    Ok(ScreeningOutcome {
        run_dir: store.dir().to_path_buf(),
        log_files,
        documents: dataset.len(),
    })
}

/// Turn the first run log of `run_dir` into few-shot candidates for later runs.
pub fn save_exemplars(
    config: &ExperimentConfig,
    run_dir: &Path,
    index: usize,
) -> Result<PathBuf, ExperimentError> {
    let llm = &config.llm_client_config;
    let slr = run_slr(run_dir)?;
    let records = RunStore::open(run_dir).load_all()?;
    let dataset = Dataset::load(&config.folder_path_slrs, &slr, config.schema())?;

    let candidates = derive_candidates(
        &records[0],
        &dataset,
        config.scale(),
        llm.prompting_technique,
    );
    let path = candidate_path(
        &config.folder_path_few_shot_examples,
        &slr,
        llm.prompting_technique,
        &llm.name_of_model,
        index,
    );
    save_candidates(&path, &candidates)?;
    info!(slr, candidates = candidates.len(), path = %path.display(), "Saved few-shot candidates");
    Ok(path)
}

// =============================================================================
// Ranking
// =============================================================================

/// Aggregate the run logs of `run_dir`, rerank, and write `ranked_df.json`.
pub async fn rank_run(
    config: &ExperimentConfig,
    run_dir: &Path,
    scorer: &dyn RelevanceScorer,
) -> Result<RankedOutput, ExperimentError> {
    let slr = run_slr(run_dir)?;
    let store = RunStore::open(run_dir);
    let records = store.load_all()?;
    let dataset = screened_documents(config, &slr, &records)?;
    let slr_info = SlrInfo::load(&config.file_path_slr_infos, &slr)?;
    let composition = config.query_composition();
    let query = slr_info.query(composition);

    let started = Instant::now();
    let estimates = aggregate(&records)?;
    let scored = attach_estimates(&dataset, &estimates)?;
    let reranker = PointwiseReranker::new(scorer);
    let ranking = reranker.rerank(scored, &query).await?;
    let duration = started.elapsed().as_secs_f64();

    let reranker_name = match config.llm_client_config.path_to_reranker.trim() {
        "" => scorer.name().to_string(),
        path => path.to_string(),
    };
    let ranked = RankedOutput {
        reranker: reranker_name,
        timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
        query: composition.descriptor().to_string(),
        duration,
        ids: ranking.ids,
    };
    let path = store.save_ranking(&ranked)?;
    info!(
        slr,
        runs = records.len(),
        tie_groups = ranking.tie_groups,
        fallbacks = ranking.fallbacks,
        path = %path.display(),
        "Saved ranking"
    );
    Ok(ranked)
}

/// Rank a whole dataset with `scorer` alone, without any screening run.
pub async fn rank_with_scorer(
    config: &ExperimentConfig,
    slr: &str,
    scorer: &dyn RelevanceScorer,
) -> Result<(PathBuf, RankedOutput), ExperimentError> {
    let slr = slr.trim_end_matches(".csv");
    let dataset = Dataset::load(&config.folder_path_slrs, slr, config.schema())?
        .head(config.llm_client_config.count);
    let slr_info = SlrInfo::load(&config.file_path_slr_infos, slr)?;
    let composition = config.query_composition();

    let started = Instant::now();
    let texts: Vec<String> = dataset.documents.iter().map(|d| d.title_abstract()).collect();
    let ids: Vec<i64> = dataset.documents.iter().map(|d| d.id).collect();
    let scores = scorer.score(&slr_info.query(composition), &texts).await?;
    if scores.len() != ids.len() {
        return Err(ScorerError::Length {
            expected: ids.len(),
            found: scores.len(),
        }
        .into());
    }
    let ranked_ids = scorer.rank(&scores, &ids);
    let duration = started.elapsed().as_secs_f64();

    let model = scorer.name().replace('/', "_");
    let folder = run_folder_name(slr, false, &model, Local::now(), dataset.len(), 0);
    let store = RunStore::create(&config.output_directory, &folder)?;
    let ranked = RankedOutput {
        reranker: scorer.name().to_string(),
        timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
        query: composition.descriptor().to_string(),
        duration,
        ids: ranked_ids,
    };
    store.save_ranking(&ranked)?;
    Ok((store.dir().to_path_buf(), ranked))
}

// =============================================================================
// Evaluation
// =============================================================================

/// TAR metrics over every ranked run folder of `experiment_dir`, written to `<tag>_metrics.json`.
pub fn evaluate_experiment(
    config: &ExperimentConfig,
    experiment_dir: &Path,
    tag: &str,
    evaluator: &dyn TarEvaluator,
) -> Result<(MetricSet, PathBuf), ExperimentError> {
    let mut rankings = Vec::new();
    let mut labels_cache: HashMap<String, HashMap<i64, u8>> = HashMap::new();

    for run_dir in run_dirs(experiment_dir)? {
        let store = RunStore::open(&run_dir);
        if !store.has_ranking() {
            warn!(run_dir = %run_dir.display(), "Run folder has no ranking; skipped");
            continue;
        }
        let slr = run_slr(&run_dir)?;
        let ranked = store.load_ranking()?;
        if !labels_cache.contains_key(&slr) {
            let dataset = Dataset::load(&config.folder_path_slrs, &slr, config.schema())?;
            labels_cache.insert(slr.clone(), dataset.labels());
        }
        let labels = &labels_cache[&slr];
        rankings.push(TopicRanking::new(topic_name(&run_dir), &ranked.ids, labels)?);
    }

    let metrics = evaluate_runs(&rankings, evaluator, experiment_dir)?;
    let path = MetricSummary::from_sets(&[metrics])?.write(experiment_dir, tag)?;
    info!(topics = rankings.len(), path = %path.display(), "Wrote metric summary");
    Ok((metrics, path))
}

/// How the random baseline orders documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BaselineMode {
    /// Keep the aggregated estimates and shuffle only inside tie groups.
    Ties,
    /// Shuffle each screened dataset as a whole.
    Dataset,
}

/// Random baseline over the run folders of `experiment_dir`, one metric set per seed.
///
/// Writes the seed mean to `output_csv` and the mean±std summary next to it.
pub fn random_baseline(
    config: &ExperimentConfig,
    experiment_dir: &Path,
    runs: u64,
    mode: BaselineMode,
    evaluator: &dyn TarEvaluator,
    output_csv: &Path,
) -> Result<Vec<MetricSet>, ExperimentError> {
    let mut tie_topics = Vec::new();
    let mut dataset_topics = Vec::new();

    for run_dir in run_dirs(experiment_dir)? {
        let slr = run_slr(&run_dir)?;
        let records = match RunStore::open(&run_dir).load_all() {
            Ok(records) => records,
            Err(StoreError::Empty(dir)) => {
                warn!(run_dir = %dir.display(), "Run folder has no run logs; skipped");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let dataset = screened_documents(config, &slr, &records)?;
        match mode {
            BaselineMode::Ties => {
                let estimates = aggregate(&records)?;
                tie_topics.push(BaselineTopic {
                    topic: topic_name(&run_dir),
                    documents: attach_estimates(&dataset, &estimates)?,
                });
            }
            BaselineMode::Dataset => dataset_topics.push((topic_name(&run_dir), dataset)),
        }
    }

    let sets = match mode {
        BaselineMode::Ties => tie_shuffle_baseline(&tie_topics, runs, evaluator, experiment_dir)?,
        BaselineMode::Dataset => {
            shuffled_dataset_baseline(&dataset_topics, runs, evaluator, experiment_dir)?
        }
    };

    write_metrics_csv(output_csv, &[("random".to_string(), MetricSet::mean(&sets))])?;
    MetricSummary::from_sets(&sets)?.write(experiment_dir, "random")?;
    info!(runs, seeds = sets.len(), path = %output_csv.display(), "Wrote random baseline");
    Ok(sets)
}

// =============================================================================
// Helpers
// =============================================================================

/// Sub-folders of `experiment_dir` that look like run folders, sorted by name.
pub fn run_dirs(experiment_dir: &Path) -> Result<Vec<PathBuf>, ExperimentError> {
    let io_err = |source| ExperimentError::Io {
        path: experiment_dir.to_path_buf(),
        source,
    };
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(experiment_dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let is_run = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(slr_from_folder)
            .is_some();
        if path.is_dir() && is_run {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn run_slr(run_dir: &Path) -> Result<String, ExperimentError> {
    run_dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(slr_from_folder)
        .map(str::to_string)
        .ok_or_else(|| ExperimentError::UnknownRunFolder(run_dir.to_path_buf()))
}

/// TAR topic of a run: its folder name.
fn topic_name(run_dir: &Path) -> String {
    run_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The documents a run actually screened: exemplars removed, truncated to the logged count.
fn screened_documents(
    config: &ExperimentConfig,
    slr: &str,
    records: &[RunRecord],
) -> Result<Dataset, ExperimentError> {
    let exemplars: HashSet<i64> = records
        .iter()
        .filter_map(|r| r.few_shot_examples.as_ref())
        .flatten()
        .map(|e| e.id)
        .collect();
    let count = records.first().map(|r| r.count);
    Ok(Dataset::load(&config.folder_path_slrs, slr, config.schema())?
        .exclude(&exemplars)
        .head(count))
}
