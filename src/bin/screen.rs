#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use screening_harness::config::{ExperimentConfig, Preset, PresetKind};
use screening_harness::experiment::{self, BaselineMode};
use screening_harness::gateway::{
    ChatGateway, GatewayConfig, NoopUsageSink, ProviderGateway, StderrUsageSink,
};
use screening_harness::scoring::{build_scorer, ScorerKind, ScorerSpec};
use screening_harness::screening::{JsonlTraceSink, TraceSink};
use screening_harness::tar::TrecTarEvaluator;

#[derive(Parser)]
#[command(name = "screen", version, about = "LLM relevance screening for literature reviews")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Screen one SLR and write one run log per repetition
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Dataset name, with or without `.csv`
        #[arg(long)]
        slr: String,
        /// Few-shot candidate file index; also part of the run folder name
        #[arg(long, default_value_t = 0)]
        index: usize,
        /// Apply the `--preset-index`-th variant of this family to the config
        #[arg(long, value_enum, requires = "preset_index")]
        preset: Option<PresetKind>,
        #[arg(long)]
        preset_index: Option<usize>,
        /// JSONL trace of every attempt
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Log one usage record per provider call to stderr
        #[arg(long)]
        usage: bool,
    },
    /// Save confidently screened papers of a run as few-shot candidates
    DeriveExemplars {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long, default_value_t = 0)]
        index: usize,
    },
    /// Aggregate a run folder and write its tie-broken ranking
    Rank {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        run_dir: PathBuf,
        /// Overrides the kind inferred from `path_to_reranker`
        #[arg(long, value_enum)]
        scorer: Option<ScorerKind>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Rank a whole dataset with a scorer alone
    ScorerBaseline {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        slr: String,
        #[arg(long, value_enum, default_value_t = ScorerKind::Lexical)]
        scorer: ScorerKind,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// TAR metrics over every ranked run folder of an experiment
    Evaluate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        experiment_dir: PathBuf,
        /// Prefix of the written `<tag>_metrics.json`
        #[arg(long)]
        tag: String,
    },
    /// Seeded random orderings of the run folders of an experiment
    RandomBaseline {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        experiment_dir: PathBuf,
        #[arg(long, default_value_t = 10)]
        runs: u64,
        #[arg(long, value_enum, default_value_t = BaselineMode::Ties)]
        mode: BaselineMode,
        #[arg(long)]
        output: PathBuf,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            slr,
            index,
            preset,
            preset_index,
            trace,
            usage,
        } => {
            let mut config = ExperimentConfig::load(&config)?;
            if let (Some(kind), Some(i)) = (preset, preset_index) {
                config = Preset::new(kind, i)?.apply(&config)?;
            }
            let gateway_config =
                GatewayConfig::single_attempt(config.llm_client_config.batch_concurrency);
            let gateway = gateway(&config, usage, gateway_config)?;

            let (trace_sink, trace_worker) = if let Some(path) = trace {
                let (sink, worker) = JsonlTraceSink::new(path)?;
                (Some(sink), Some(worker))
            } else {
                (None, None)
            };
            let trace_ref = trace_sink.as_ref().map(|sink| sink as &dyn TraceSink);

            let outcome =
                experiment::run_screening(&config, &slr, index, gateway.as_ref(), trace_ref)
                    .await?;

            drop(trace_sink);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }
            println!("{}", outcome.run_dir.display());
        }
        Commands::DeriveExemplars {
            config,
            run_dir,
            index,
        } => {
            let config = ExperimentConfig::load(&config)?;
            let path = experiment::save_exemplars(&config, &run_dir, index)?;
            println!("{}", path.display());
        }
        Commands::Rank {
            config,
            run_dir,
            scorer,
            seed,
        } => {
            let config = ExperimentConfig::load(&config)?;
            let kind = scorer.unwrap_or_else(|| config.reranker_kind());
            let scorer = scorer_for(&config, kind, seed)?;
            let ranked = experiment::rank_run(&config, &run_dir, scorer.as_ref()).await?;
            println!("ranked {} documents with {}", ranked.ids.len(), ranked.reranker);
        }
        Commands::ScorerBaseline {
            config,
            slr,
            scorer,
            seed,
        } => {
            let config = ExperimentConfig::load(&config)?;
            let scorer = scorer_for(&config, scorer, seed)?;
            let (dir, _) = experiment::rank_with_scorer(&config, &slr, scorer.as_ref()).await?;
            println!("{}", dir.display());
        }
        Commands::Evaluate {
            config,
            experiment_dir,
            tag,
        } => {
            let config = ExperimentConfig::load(&config)?;
            let (metrics, path) =
                experiment::evaluate_experiment(&config, &experiment_dir, &tag, &TrecTarEvaluator)?;
            for (name, value) in metrics.named() {
                println!("{name}: {value:.2}");
            }
            println!("{}", path.display());
        }
        Commands::RandomBaseline {
            config,
            experiment_dir,
            runs,
            mode,
            output,
        } => {
            let config = ExperimentConfig::load(&config)?;
            let sets = experiment::random_baseline(
                &config,
                &experiment_dir,
                runs,
                mode,
                &TrecTarEvaluator,
                &output,
            )?;
            println!("{} seeds written to {}", sets.len(), output.display());
        }
    }

    Ok(())
}

fn gateway(
    config: &ExperimentConfig,
    usage: bool,
    gateway_config: GatewayConfig,
) -> Result<Arc<dyn ChatGateway>, Box<dyn Error>> {
    let llm = &config.llm_client_config;
    let base_url = llm.base_url.as_deref();
    let gateway: Arc<dyn ChatGateway> = if usage {
        Arc::new(ProviderGateway::from_env(
            base_url,
            Arc::new(StderrUsageSink),
            gateway_config,
        )?)
    } else {
        Arc::new(ProviderGateway::from_env(
            base_url,
            Arc::new(NoopUsageSink),
            gateway_config,
        )?)
    };
    Ok(gateway)
}

fn scorer_for(
    config: &ExperimentConfig,
    kind: ScorerKind,
    seed: u64,
) -> Result<Box<dyn screening_harness::RelevanceScorer>, Box<dyn Error>> {
    let gateway = match kind {
        ScorerKind::Generative => {
            let gateway_config = GatewayConfig {
                batch_concurrency: config.llm_client_config.batch_concurrency,
                ..GatewayConfig::default()
            };
            Some(gateway(config, false, gateway_config)?)
        }
        _ => None,
    };
    let spec = ScorerSpec {
        kind,
        path: config.llm_client_config.path_to_reranker.clone(),
        gateway,
        scale: config.scale(),
        seed,
    };
    Ok(build_scorer(spec)?)
}
