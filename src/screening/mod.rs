//! Screening core: decision extraction, the retry-orchestrated evaluation
//! loop, run logs, self-consistency aggregation and pointwise re-ranking.

pub mod aggregate;
pub mod decision;
pub mod pointwise;
pub mod record;
pub mod runner;
pub mod store;
pub mod trace;

pub use aggregate::{aggregate, attach_estimates, AggregateError, AggregatedEstimate, ScoredDocument};
pub use decision::{extract, is_valid, parse, Decision, ScaleConfig, INVALID};
pub use pointwise::{impute_invalid, PointwiseReranker, Ranking, RerankError};
pub use record::{
    failed_key, AttemptRecord, FailedAttempt, FewShotHeader, PaperRecord, RunHeader, RunRecord,
};
pub use runner::{
    AttemptOutcome, EvaluationLoop, EvaluationSettings, RunError, DEFAULT_MAX_TOKENS,
    RETRY_TEMPERATURE,
};
pub use store::{run_folder_name, slr_from_folder, RankedOutput, RunStore, StoreError, RANKED_OUTPUT_FILE};
pub use trace::{now_epoch_ms, AttemptTrace, JsonlTraceSink, TraceError, TraceSink, TraceWorker};
