//! Storage seams for chartkeep plus the in-memory and Postgres backends,
//! the raw feed archive and the feed downloader.

use async_trait::async_trait;
use chartkeep_core::{
    CumulativeRankingEntry, DailyStats, EntityId, ExternalIdentityMapping, RankingEntry,
    RunLogEntry, RunStatus, ServiceId, Snapshot, WeeklyRankingEntry,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod archive;
mod fetch;
mod memory;
mod postgres;

pub use archive::{feed_digest, ArchivedFeed, FeedArchive};
pub use fetch::{BackoffPolicy, FetchError, FetchedFeed, HttpClientConfig, HttpFetcher};
pub use memory::MemoryStore;
pub use postgres::{PgStore, PoolConfig};

pub const CRATE_NAME: &str = "chartkeep-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable or exhausted; callers may retry with backoff.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("run {run_id} is {status}, not running")]
    RunNotRunning { run_id: Uuid, status: RunStatus },
    /// Permanent backend fault such as rejected SQL or a protocol error.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Overwritten,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertedSnapshot {
    pub snapshot: Snapshot,
    pub outcome: UpsertOutcome,
}

/// Running total of daily scores for one entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreTotal {
    pub entity_id: EntityId,
    pub total_score: f64,
    pub days_counted: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Another run for the same date is already running.
    Busy { holder: Uuid },
}

/// Read-only view of the identity authority that owns canonical entities.
#[async_trait]
pub trait IdentityAuthority: Send + Sync {
    /// Every mapping row for the requested ids; an id may legitimately come back zero or several times.
    async fn lookup(
        &self,
        service: &ServiceId,
        external_ids: &[String],
    ) -> StoreResult<Vec<ExternalIdentityMapping>>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert or overwrite the row for `(snapshot_date, entity_id)`. The first `created_at` is kept.
    async fn upsert_snapshot(&self, snapshot: Snapshot) -> StoreResult<UpsertedSnapshot>;
    async fn snapshots_for(&self, date: NaiveDate) -> StoreResult<Vec<Snapshot>>;
    async fn snapshot_dates(&self) -> StoreResult<Vec<NaiveDate>>;
}

#[async_trait]
pub trait RankingStore: Send + Sync {
    /// Replace the ranking set of `date` with `entries` in one atomic write.
    /// Refused with `RunNotRunning` unless `run_id` is still running when the write lands.
    async fn publish_rankings(
        &self,
        run_id: Uuid,
        date: NaiveDate,
        entries: &[RankingEntry],
    ) -> StoreResult<u64>;
    /// Entries ordered by rank.
    async fn rankings_for(&self, date: NaiveDate) -> StoreResult<Vec<RankingEntry>>;
    /// Entries for `from..=to`, ordered by date then rank.
    async fn rankings_between(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<RankingEntry>>;
    async fn latest_ranking_date_before(&self, date: NaiveDate) -> StoreResult<Option<NaiveDate>>;
    async fn ranking_dates(&self) -> StoreResult<Vec<NaiveDate>>;
    async fn score_totals_through(&self, date: NaiveDate) -> StoreResult<Vec<ScoreTotal>>;
    async fn upsert_daily_stats(&self, stats: &DailyStats) -> StoreResult<()>;
    async fn daily_stats_for(&self, date: NaiveDate) -> StoreResult<Option<DailyStats>>;
}

#[async_trait]
pub trait RollupStore: Send + Sync {
    async fn publish_weekly(
        &self,
        week_end: NaiveDate,
        entries: &[WeeklyRankingEntry],
    ) -> StoreResult<u64>;
    async fn weekly_for(&self, week_end: NaiveDate) -> StoreResult<Vec<WeeklyRankingEntry>>;
    async fn weekly_dates(&self) -> StoreResult<Vec<NaiveDate>>;
    async fn publish_cumulative(
        &self,
        date: NaiveDate,
        entries: &[CumulativeRankingEntry],
    ) -> StoreResult<u64>;
    async fn cumulative_for(&self, date: NaiveDate) -> StoreResult<Vec<CumulativeRankingEntry>>;
    async fn latest_cumulative_date_before(&self, date: NaiveDate)
        -> StoreResult<Option<NaiveDate>>;
}

#[async_trait]
pub trait RunLedgerStore: Send + Sync {
    async fn insert_run(&self, run: &RunLogEntry) -> StoreResult<()>;
    /// Atomically move a pending run to running unless its date already has a running run.
    async fn try_start_run(&self, run_id: Uuid, started_at: DateTime<Utc>) -> StoreResult<StartOutcome>;
    /// Write the terminal fields of a run. Fails with `Conflict` if the run already finished.
    async fn finish_run(&self, run: &RunLogEntry) -> StoreResult<()>;
    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<RunLogEntry>>;
    /// Every attempt for the date, oldest first.
    async fn runs_for(&self, date: NaiveDate) -> StoreResult<Vec<RunLogEntry>>;
}

/// Everything the pipeline persists.
pub trait Store: SnapshotStore + RankingStore + RollupStore + RunLedgerStore {}

impl<T> Store for T where T: SnapshotStore + RankingStore + RollupStore + RunLedgerStore {}
