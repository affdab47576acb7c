//! Daily chart pipeline: identity resolution, ingestion, ranking, freeze ledger and rollups.

pub const CRATE_NAME: &str = "chartkeep-pipeline";

pub mod config;
pub mod delta;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod pipeline;
pub mod ranking;
pub mod report;
pub mod resolver;
pub mod rollup;
pub mod scoring;

pub use config::{FreezePolicy, PipelineConfig, Policy, ScoringPolicy, ScoringWeights};
pub use error::PipelineError;
pub use ingest::{IngestReport, RowOutcome, RowReport};
pub use ledger::{Clock, FixedClock, RunLedger, RunRequest, SystemClock};
pub use pipeline::{DailyPipeline, DailyRequest, RunOutcome};
pub use ranking::{ComputedRanking, RankingEngine};
pub use resolver::{BatchResolution, DuplicateFault, IdentityResolver, ResolvedRow};
pub use rollup::RollupAggregator;
pub use scoring::{model_for, ScoringModel};
