//! Postgres backend. Queries are built at runtime so the crate compiles without a live database.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chartkeep_core::{
    CumulativeRankingEntry, DailyStats, EntityId, ExternalIdentityMapping, MetricDeltas, Metrics,
    Movement, RankingEntry, RowIssue, RunLogEntry, RunStatus, ServiceId, Snapshot,
    WeeklyRankingEntry,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    BackoffPolicy, IdentityAuthority, RankingStore, RollupStore, RunLedgerStore, ScoreTotal,
    SnapshotStore, StartOutcome, StoreError, StoreResult, UpsertOutcome, UpsertedSnapshot,
};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn map_db_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            error!(error = %err, "postgres unavailable");
            return StoreError::Unavailable(err.to_string());
        }
        sqlx::Error::RowNotFound => return StoreError::NotFound(err.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            return StoreError::Serialization(err.to_string());
        }
        _ => {}
    }

    if let sqlx::Error::Database(db_err) = &err {
        let code = db_err.code();
        return map_sqlstate(code.as_deref(), db_err.message());
    }

    error!(error = %err, "postgres backend error");
    StoreError::Backend(err.to_string())
}

/// Only connection, resource, shutdown and serialization-retry classes are worth retrying.
fn map_sqlstate(code: Option<&str>, message: &str) -> StoreError {
    match code {
        Some("23505") => {
            warn!(detail = message, "unique constraint violation");
            StoreError::Conflict(message.to_string())
        }
        Some("23503" | "23502" | "23514") => {
            warn!(detail = message, "integrity constraint violation");
            StoreError::Integrity(message.to_string())
        }
        Some(code) if is_transient_sqlstate(code) => {
            error!(code, detail = message, "postgres unavailable");
            StoreError::Unavailable(message.to_string())
        }
        _ => {
            error!(code = ?code, detail = message, "postgres backend error");
            StoreError::Backend(message.to_string())
        }
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57P")
        || matches!(code, "40001" | "40P01")
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        map_db_error(err)
    }
}

impl PgStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, retrying transient failures with exponential backoff.
    pub async fn connect(
        database_url: &str,
        config: PoolConfig,
        backoff: BackoffPolicy,
    ) -> StoreResult<Self> {
        let mut attempt = 0usize;
        loop {
            let result = PgPoolOptions::new()
                .max_connections(config.max_connections.max(1))
                .acquire_timeout(config.acquire_timeout)
                .connect(database_url)
                .await
                .map_err(map_db_error);
            match result {
                Ok(pool) => return Ok(Self { pool }),
                Err(err) if err.is_retryable() && attempt < backoff.max_retries => {
                    warn!(error = %err, attempt, "retrying postgres connect");
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running chartkeep migrations")
    }
}

fn to_u32(value: i32, column: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Serialization(format!("{column} out of range: {value}")))
}

fn opt_u32(value: Option<i32>, column: &str) -> StoreResult<Option<u32>> {
    value.map(|v| to_u32(v, column)).transpose()
}

fn to_u64(value: i64, column: &str) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Serialization(format!("{column} out of range: {value}")))
}

fn movement(row: &PgRow) -> StoreResult<Movement> {
    let raw: String = row.try_get("movement")?;
    raw.parse().map_err(StoreError::Serialization)
}

fn snapshot_from_row(row: &PgRow) -> StoreResult<Snapshot> {
    Ok(Snapshot {
        snapshot_date: row.try_get("snapshot_date")?,
        entity_id: EntityId::new(row.try_get("entity_id")?),
        service: ServiceId::new(row.try_get::<String, _>("service")?),
        external_id: row.try_get("external_id")?,
        metrics: Metrics {
            popularity: row.try_get("popularity")?,
            followers: row.try_get("followers")?,
            track_popularity_sum: row.try_get("track_popularity_sum")?,
            release_count: row.try_get("release_count")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ranking_from_row(row: &PgRow) -> StoreResult<RankingEntry> {
    Ok(RankingEntry {
        snapshot_date: row.try_get("snapshot_date")?,
        entity_id: EntityId::new(row.try_get("entity_id")?),
        rank: to_u32(row.try_get("rank")?, "rank")?,
        prev_rank: opt_u32(row.try_get("prev_rank")?, "prev_rank")?,
        rank_delta: row.try_get("rank_delta")?,
        score: row.try_get("score")?,
        prev_score: row.try_get("prev_score")?,
        score_delta: row.try_get("score_delta")?,
        movement: movement(row)?,
        metrics: Metrics {
            popularity: row.try_get("popularity")?,
            followers: row.try_get("followers")?,
            track_popularity_sum: row.try_get("track_popularity_sum")?,
            release_count: row.try_get("release_count")?,
        },
        metric_deltas: MetricDeltas {
            popularity: row.try_get("popularity_delta")?,
            followers: row.try_get("followers_delta")?,
            track_popularity_sum: row.try_get("track_popularity_sum_delta")?,
            release_count: row.try_get("release_count_delta")?,
        },
        algorithm_version: row.try_get("algorithm_version")?,
        created_at: row.try_get("created_at")?,
    })
}

fn weekly_from_row(row: &PgRow) -> StoreResult<WeeklyRankingEntry> {
    Ok(WeeklyRankingEntry {
        week_end_date: row.try_get("week_end_date")?,
        entity_id: EntityId::new(row.try_get("entity_id")?),
        rank: to_u32(row.try_get("rank")?, "rank")?,
        prev_rank: opt_u32(row.try_get("prev_rank")?, "prev_rank")?,
        rank_delta: row.try_get("rank_delta")?,
        total_score: row.try_get("total_score")?,
        average_score: row.try_get("average_score")?,
        days_counted: to_u32(row.try_get("days_counted")?, "days_counted")?,
        latest_popularity: row.try_get("latest_popularity")?,
        movement: movement(row)?,
        created_at: row.try_get("created_at")?,
    })
}

fn cumulative_from_row(row: &PgRow) -> StoreResult<CumulativeRankingEntry> {
    Ok(CumulativeRankingEntry {
        snapshot_date: row.try_get("snapshot_date")?,
        entity_id: EntityId::new(row.try_get("entity_id")?),
        rank: to_u32(row.try_get("rank")?, "rank")?,
        prev_rank: opt_u32(row.try_get("prev_rank")?, "prev_rank")?,
        rank_delta: row.try_get("rank_delta")?,
        cumulative_score: row.try_get("cumulative_score")?,
        day_score: row.try_get("day_score")?,
        days_counted: to_u32(row.try_get("days_counted")?, "days_counted")?,
        created_at: row.try_get("created_at")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<RunLogEntry> {
    let status: String = row.try_get("status")?;
    let issues: Json<Vec<RowIssue>> = row.try_get("issues")?;
    Ok(RunLogEntry {
        run_id: row.try_get("run_id")?,
        snapshot_date: row.try_get("snapshot_date")?,
        status: status.parse::<RunStatus>().map_err(StoreError::Serialization)?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        rows_ingested: to_u64(row.try_get("rows_ingested")?, "rows_ingested")?,
        rows_rejected: to_u64(row.try_get("rows_rejected")?, "rows_rejected")?,
        rows_written: to_u64(row.try_get("rows_written")?, "rows_written")?,
        algorithm_version: row.try_get("algorithm_version")?,
        actor: row.try_get("actor")?,
        dry_run: row.try_get("dry_run")?,
        forced: row.try_get("forced")?,
        input_digest: row.try_get("input_digest")?,
        issues: issues.0,
        cause: row.try_get("cause")?,
    })
}

fn dates_from_rows(rows: Vec<PgRow>, column: &str) -> StoreResult<Vec<NaiveDate>> {
    rows.iter()
        .map(|row| row.try_get::<NaiveDate, _>(column).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl IdentityAuthority for PgStore {
    async fn lookup(
        &self,
        service: &ServiceId,
        external_ids: &[String],
    ) -> StoreResult<Vec<ExternalIdentityMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT service, external_id, entity_id
              FROM external_ids
             WHERE service = $1
               AND external_id = ANY($2)
             ORDER BY external_id, entity_id
            "#,
        )
        .bind(service.as_str())
        .bind(external_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ExternalIdentityMapping {
                    service: ServiceId::new(row.try_get::<String, _>("service")?),
                    external_id: row.try_get("external_id")?,
                    entity_id: EntityId::new(row.try_get("entity_id")?),
                })
            })
            .collect()
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn upsert_snapshot(&self, snapshot: Snapshot) -> StoreResult<UpsertedSnapshot> {
        // xmax = 0 only for freshly inserted tuples.
        let row = sqlx::query(
            r#"
            INSERT INTO snapshots (
                snapshot_date, entity_id, service, external_id,
                popularity, followers, track_popularity_sum, release_count,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (snapshot_date, entity_id) DO UPDATE SET
                service = EXCLUDED.service,
                external_id = EXCLUDED.external_id,
                popularity = EXCLUDED.popularity,
                followers = EXCLUDED.followers,
                track_popularity_sum = EXCLUDED.track_popularity_sum,
                release_count = EXCLUDED.release_count,
                updated_at = EXCLUDED.updated_at
            RETURNING snapshots.*, (xmax = 0) AS inserted
            "#,
        )
        .bind(snapshot.snapshot_date)
        .bind(snapshot.entity_id.as_uuid())
        .bind(snapshot.service.as_str())
        .bind(&snapshot.external_id)
        .bind(snapshot.metrics.popularity)
        .bind(snapshot.metrics.followers)
        .bind(snapshot.metrics.track_popularity_sum)
        .bind(snapshot.metrics.release_count)
        .bind(snapshot.created_at)
        .bind(snapshot.updated_at)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(UpsertedSnapshot {
            snapshot: snapshot_from_row(&row)?,
            outcome: if inserted {
                UpsertOutcome::Inserted
            } else {
                UpsertOutcome::Overwritten
            },
        })
    }

    async fn snapshots_for(&self, date: NaiveDate) -> StoreResult<Vec<Snapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM snapshots
             WHERE snapshot_date = $1
             ORDER BY entity_id
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn snapshot_dates(&self) -> StoreResult<Vec<NaiveDate>> {
        let rows = sqlx::query("SELECT DISTINCT snapshot_date FROM snapshots ORDER BY snapshot_date")
            .fetch_all(&self.pool)
            .await?;
        dates_from_rows(rows, "snapshot_date")
    }
}

#[async_trait]
impl RankingStore for PgStore {
    async fn publish_rankings(
        &self,
        run_id: Uuid,
        date: NaiveDate,
        entries: &[RankingEntry],
    ) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        // Row lock holds off a concurrent abort until the set is committed.
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM run_log WHERE run_id = $1 FOR UPDATE")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;
        let status = status
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?
            .parse::<RunStatus>()
            .map_err(StoreError::Serialization)?;
        if status != RunStatus::Running {
            return Err(StoreError::RunNotRunning { run_id, status });
        }
        let keep: Vec<Uuid> = entries.iter().map(|e| e.entity_id.as_uuid()).collect();
        sqlx::query("DELETE FROM daily_rankings WHERE snapshot_date = $1 AND NOT (entity_id = ANY($2))")
            .bind(date)
            .bind(&keep)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            if entry.snapshot_date != date {
                return Err(StoreError::Integrity(format!(
                    "ranking entry for {} dated {} published under {date}",
                    entry.entity_id, entry.snapshot_date
                )));
            }
            sqlx::query(
                r#"
                INSERT INTO daily_rankings (
                    snapshot_date, entity_id, rank, prev_rank, rank_delta,
                    score, prev_score, score_delta, movement,
                    popularity, followers, track_popularity_sum, release_count,
                    popularity_delta, followers_delta, track_popularity_sum_delta, release_count_delta,
                    algorithm_version, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                ON CONFLICT (snapshot_date, entity_id) DO UPDATE SET
                    rank = EXCLUDED.rank,
                    prev_rank = EXCLUDED.prev_rank,
                    rank_delta = EXCLUDED.rank_delta,
                    score = EXCLUDED.score,
                    prev_score = EXCLUDED.prev_score,
                    score_delta = EXCLUDED.score_delta,
                    movement = EXCLUDED.movement,
                    popularity = EXCLUDED.popularity,
                    followers = EXCLUDED.followers,
                    track_popularity_sum = EXCLUDED.track_popularity_sum,
                    release_count = EXCLUDED.release_count,
                    popularity_delta = EXCLUDED.popularity_delta,
                    followers_delta = EXCLUDED.followers_delta,
                    track_popularity_sum_delta = EXCLUDED.track_popularity_sum_delta,
                    release_count_delta = EXCLUDED.release_count_delta,
                    algorithm_version = EXCLUDED.algorithm_version,
                    created_at = EXCLUDED.created_at
                "#,
            )
            .bind(date)
            .bind(entry.entity_id.as_uuid())
            .bind(entry.rank as i32)
            .bind(entry.prev_rank.map(|r| r as i32))
            .bind(entry.rank_delta)
            .bind(entry.score)
            .bind(entry.prev_score)
            .bind(entry.score_delta)
            .bind(entry.movement.as_str())
            .bind(entry.metrics.popularity)
            .bind(entry.metrics.followers)
            .bind(entry.metrics.track_popularity_sum)
            .bind(entry.metrics.release_count)
            .bind(entry.metric_deltas.popularity)
            .bind(entry.metric_deltas.followers)
            .bind(entry.metric_deltas.track_popularity_sum)
            .bind(entry.metric_deltas.release_count)
            .bind(&entry.algorithm_version)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(entries.len() as u64)
    }

    async fn rankings_for(&self, date: NaiveDate) -> StoreResult<Vec<RankingEntry>> {
        let rows = sqlx::query("SELECT * FROM daily_rankings WHERE snapshot_date = $1 ORDER BY rank")
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(ranking_from_row).collect()
    }

    async fn rankings_between(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<RankingEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM daily_rankings
             WHERE snapshot_date BETWEEN $1 AND $2
             ORDER BY snapshot_date, rank
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ranking_from_row).collect()
    }

    async fn latest_ranking_date_before(&self, date: NaiveDate) -> StoreResult<Option<NaiveDate>> {
        let row = sqlx::query("SELECT MAX(snapshot_date) AS latest FROM daily_rankings WHERE snapshot_date < $1")
            .bind(date)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("latest")?)
    }

    async fn ranking_dates(&self) -> StoreResult<Vec<NaiveDate>> {
        let rows = sqlx::query("SELECT DISTINCT snapshot_date FROM daily_rankings ORDER BY snapshot_date")
            .fetch_all(&self.pool)
            .await?;
        dates_from_rows(rows, "snapshot_date")
    }

    async fn score_totals_through(&self, date: NaiveDate) -> StoreResult<Vec<ScoreTotal>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, SUM(score) AS total_score, COUNT(*) AS days_counted
              FROM daily_rankings
             WHERE snapshot_date <= $1
             GROUP BY entity_id
             ORDER BY entity_id
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let days: i64 = row.try_get("days_counted")?;
                Ok(ScoreTotal {
                    entity_id: EntityId::new(row.try_get("entity_id")?),
                    total_score: row.try_get("total_score")?,
                    days_counted: u32::try_from(days).map_err(|_| {
                        StoreError::Serialization(format!("days_counted out of range: {days}"))
                    })?,
                })
            })
            .collect()
    }

    async fn upsert_daily_stats(&self, stats: &DailyStats) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_stats (snapshot_date, payload) VALUES ($1, $2)
            ON CONFLICT (snapshot_date) DO UPDATE SET payload = EXCLUDED.payload
            "#,
        )
        .bind(stats.snapshot_date)
        .bind(Json(stats))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn daily_stats_for(&self, date: NaiveDate) -> StoreResult<Option<DailyStats>> {
        let row = sqlx::query("SELECT payload FROM daily_stats WHERE snapshot_date = $1")
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            row.try_get::<Json<DailyStats>, _>("payload")
                .map(|json| json.0)
                .map_err(StoreError::from)
        })
        .transpose()
    }
}

#[async_trait]
impl RollupStore for PgStore {
    async fn publish_weekly(
        &self,
        week_end: NaiveDate,
        entries: &[WeeklyRankingEntry],
    ) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let keep: Vec<Uuid> = entries.iter().map(|e| e.entity_id.as_uuid()).collect();
        sqlx::query("DELETE FROM weekly_rankings WHERE week_end_date = $1 AND NOT (entity_id = ANY($2))")
            .bind(week_end)
            .bind(&keep)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO weekly_rankings (
                    week_end_date, entity_id, rank, prev_rank, rank_delta, total_score,
                    average_score, days_counted, latest_popularity, movement, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (week_end_date, entity_id) DO UPDATE SET
                    rank = EXCLUDED.rank,
                    prev_rank = EXCLUDED.prev_rank,
                    rank_delta = EXCLUDED.rank_delta,
                    total_score = EXCLUDED.total_score,
                    average_score = EXCLUDED.average_score,
                    days_counted = EXCLUDED.days_counted,
                    latest_popularity = EXCLUDED.latest_popularity,
                    movement = EXCLUDED.movement,
                    created_at = EXCLUDED.created_at
                "#,
            )
            .bind(week_end)
            .bind(entry.entity_id.as_uuid())
            .bind(entry.rank as i32)
            .bind(entry.prev_rank.map(|r| r as i32))
            .bind(entry.rank_delta)
            .bind(entry.total_score)
            .bind(entry.average_score)
            .bind(entry.days_counted as i32)
            .bind(entry.latest_popularity)
            .bind(entry.movement.as_str())
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(entries.len() as u64)
    }

    async fn weekly_for(&self, week_end: NaiveDate) -> StoreResult<Vec<WeeklyRankingEntry>> {
        let rows = sqlx::query("SELECT * FROM weekly_rankings WHERE week_end_date = $1 ORDER BY rank")
            .bind(week_end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(weekly_from_row).collect()
    }

    async fn weekly_dates(&self) -> StoreResult<Vec<NaiveDate>> {
        let rows = sqlx::query("SELECT DISTINCT week_end_date FROM weekly_rankings ORDER BY week_end_date")
            .fetch_all(&self.pool)
            .await?;
        dates_from_rows(rows, "week_end_date")
    }

    async fn publish_cumulative(
        &self,
        date: NaiveDate,
        entries: &[CumulativeRankingEntry],
    ) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let keep: Vec<Uuid> = entries.iter().map(|e| e.entity_id.as_uuid()).collect();
        sqlx::query("DELETE FROM cumulative_rankings WHERE snapshot_date = $1 AND NOT (entity_id = ANY($2))")
            .bind(date)
            .bind(&keep)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO cumulative_rankings (
                    snapshot_date, entity_id, rank, prev_rank, rank_delta,
                    cumulative_score, day_score, days_counted, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (snapshot_date, entity_id) DO UPDATE SET
                    rank = EXCLUDED.rank,
                    prev_rank = EXCLUDED.prev_rank,
                    rank_delta = EXCLUDED.rank_delta,
                    cumulative_score = EXCLUDED.cumulative_score,
                    day_score = EXCLUDED.day_score,
                    days_counted = EXCLUDED.days_counted,
                    created_at = EXCLUDED.created_at
                "#,
            )
            .bind(date)
            .bind(entry.entity_id.as_uuid())
            .bind(entry.rank as i32)
            .bind(entry.prev_rank.map(|r| r as i32))
            .bind(entry.rank_delta)
            .bind(entry.cumulative_score)
            .bind(entry.day_score)
            .bind(entry.days_counted as i32)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(entries.len() as u64)
    }

    async fn cumulative_for(&self, date: NaiveDate) -> StoreResult<Vec<CumulativeRankingEntry>> {
        let rows = sqlx::query("SELECT * FROM cumulative_rankings WHERE snapshot_date = $1 ORDER BY rank")
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(cumulative_from_row).collect()
    }

    async fn latest_cumulative_date_before(
        &self,
        date: NaiveDate,
    ) -> StoreResult<Option<NaiveDate>> {
        let row = sqlx::query(
            "SELECT MAX(snapshot_date) AS latest FROM cumulative_rankings WHERE snapshot_date < $1",
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("latest")?)
    }
}

#[async_trait]
impl RunLedgerStore for PgStore {
    async fn insert_run(&self, run: &RunLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO run_log (
                run_id, snapshot_date, status, created_at, started_at, finished_at,
                rows_ingested, rows_rejected, rows_written, algorithm_version, actor,
                dry_run, forced, input_digest, issues, cause
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(run.run_id)
        .bind(run.snapshot_date)
        .bind(run.status.as_str())
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.rows_ingested as i64)
        .bind(run.rows_rejected as i64)
        .bind(run.rows_written as i64)
        .bind(&run.algorithm_version)
        .bind(&run.actor)
        .bind(run.dry_run)
        .bind(run.forced)
        .bind(&run.input_digest)
        .bind(Json(&run.issues))
        .bind(&run.cause)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_start_run(&self, run_id: Uuid, started_at: DateTime<Utc>) -> StoreResult<StartOutcome> {
        let result = sqlx::query(
            "UPDATE run_log SET status = 'running', started_at = $2 WHERE run_id = $1 AND status = 'pending'",
        )
        .bind(run_id)
        .bind(started_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error);

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(StartOutcome::Started),
            Ok(_) => Err(StoreError::Conflict(format!("run {run_id} is not pending"))),
            Err(StoreError::Conflict(_)) => {
                let holder = sqlx::query(
                    r#"
                    SELECT running.run_id
                      FROM run_log running
                      JOIN run_log me ON me.snapshot_date = running.snapshot_date
                     WHERE me.run_id = $1
                       AND running.status = 'running'
                     LIMIT 1
                    "#,
                )
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
                match holder {
                    Some(row) => Ok(StartOutcome::Busy {
                        holder: row.try_get("run_id")?,
                    }),
                    None => Err(StoreError::Conflict(format!(
                        "run {run_id} lost the start race to a run that already finished"
                    ))),
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn finish_run(&self, run: &RunLogEntry) -> StoreResult<()> {
        let done = sqlx::query(
            r#"
            UPDATE run_log SET
                status = $2,
                started_at = $3,
                finished_at = $4,
                rows_ingested = $5,
                rows_rejected = $6,
                rows_written = $7,
                forced = $8,
                input_digest = $9,
                issues = $10,
                cause = $11
             WHERE run_id = $1
               AND status IN ('pending', 'running')
            "#,
        )
        .bind(run.run_id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.rows_ingested as i64)
        .bind(run.rows_rejected as i64)
        .bind(run.rows_written as i64)
        .bind(run.forced)
        .bind(&run.input_digest)
        .bind(Json(&run.issues))
        .bind(&run.cause)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 1 {
            return Ok(());
        }
        match self.get_run(run.run_id).await? {
            Some(existing) => Err(StoreError::Conflict(format!(
                "run {} already finished as {}",
                run.run_id, existing.status
            ))),
            None => Err(StoreError::NotFound(format!("run {}", run.run_id))),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<RunLogEntry>> {
        let row = sqlx::query("SELECT * FROM run_log WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn runs_for(&self, date: NaiveDate) -> StoreResult<Vec<RunLogEntry>> {
        let rows = sqlx::query("SELECT * FROM run_log WHERE snapshot_date = $1 ORDER BY created_at, run_id")
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;

    #[test]
    fn sqlstates_split_transient_from_permanent_faults() {
        assert!(matches!(map_sqlstate(Some("23505"), "dup"), StoreError::Conflict(_)));
        assert!(matches!(map_sqlstate(Some("23514"), "check"), StoreError::Integrity(_)));
        assert!(map_sqlstate(Some("08006"), "connection failure").is_retryable());
        assert!(map_sqlstate(Some("57P01"), "admin shutdown").is_retryable());
        assert!(map_sqlstate(Some("40001"), "could not serialize").is_retryable());

        let syntax = map_sqlstate(Some("42601"), "syntax error at or near");
        assert!(matches!(syntax, StoreError::Backend(_)));
        assert!(!syntax.is_retryable());
        assert!(!map_sqlstate(None, "no sqlstate").is_retryable());
    }

    #[test]
    fn only_pool_and_io_faults_are_retryable() {
        assert!(map_db_error(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(map_db_error(sqlx::Error::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset
        )))
        .is_retryable());
        let protocol = map_db_error(sqlx::Error::Protocol("unexpected message".into()));
        assert!(matches!(protocol, StoreError::Backend(_)));
        assert!(!protocol.is_retryable());
        assert!(matches!(map_db_error(sqlx::Error::RowNotFound), StoreError::NotFound(_)));
    }

    async fn connect_db_from_env() -> Option<PgStore> {
        let database_url = std::env::var("DATABASE_URL").ok()?;
        let store = PgStore::connect(&database_url, PoolConfig::default(), BackoffPolicy::default())
            .await
            .ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    /// A date no other test run is likely to touch.
    fn scratch_date() -> NaiveDate {
        let offset = (Uuid::new_v4().as_u128() % 200_000) as u64;
        NaiveDate::from_ymd_opt(2200, 1, 1).expect("date") + Days::new(offset)
    }

    fn entry(date: NaiveDate, entity_id: EntityId, rank: u32, score: f64) -> RankingEntry {
        RankingEntry {
            snapshot_date: date,
            entity_id,
            rank,
            prev_rank: None,
            rank_delta: None,
            score,
            prev_score: None,
            score_delta: None,
            movement: Movement::New,
            metrics: Metrics::default(),
            metric_deltas: MetricDeltas::default(),
            algorithm_version: "popularity-v1".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn postgres_gate_admits_one_running_run_per_date() {
        let Some(store) = connect_db_from_env().await else {
            return;
        };
        let date = scratch_date();
        let first = RunLogEntry::pending(date, "v", "test", Utc::now());
        let second = RunLogEntry::pending(date, "v", "test", Utc::now());
        store.insert_run(&first).await.unwrap();
        store.insert_run(&second).await.unwrap();

        assert_eq!(
            store.try_start_run(first.run_id, Utc::now()).await.unwrap(),
            StartOutcome::Started
        );
        assert_eq!(
            store.try_start_run(second.run_id, Utc::now()).await.unwrap(),
            StartOutcome::Busy {
                holder: first.run_id
            }
        );
    }

    #[tokio::test]
    async fn postgres_publish_replaces_the_set_and_refuses_finished_runs() {
        let Some(store) = connect_db_from_env().await else {
            return;
        };
        let date = scratch_date();
        let mut run = RunLogEntry::pending(date, "popularity-v1", "test", Utc::now());
        store.insert_run(&run).await.unwrap();
        store.try_start_run(run.run_id, Utc::now()).await.unwrap();

        let (a, b, c) = (
            EntityId::new(Uuid::new_v4()),
            EntityId::new(Uuid::new_v4()),
            EntityId::new(Uuid::new_v4()),
        );
        let first = [entry(date, a, 1, 90.0), entry(date, b, 2, 80.0), entry(date, c, 3, 70.0)];
        assert_eq!(store.publish_rankings(run.run_id, date, &first).await.unwrap(), 3);

        // b and a swap ranks inside one transaction; c drops out.
        let second = [entry(date, b, 1, 95.0), entry(date, a, 2, 85.0)];
        assert_eq!(store.publish_rankings(run.run_id, date, &second).await.unwrap(), 2);
        let stored = store.rankings_for(date).await.unwrap();
        let ranks: Vec<(EntityId, u32)> = stored.iter().map(|e| (e.entity_id, e.rank)).collect();
        assert_eq!(ranks, vec![(b, 1), (a, 2)]);

        run.status = RunStatus::Failed;
        run.finished_at = Some(Utc::now());
        run.cause = Some("Aborted: operator".into());
        store.finish_run(&run).await.unwrap();
        let err = store.publish_rankings(run.run_id, date, &first).await.unwrap_err();
        assert!(matches!(err, StoreError::RunNotRunning { status: RunStatus::Failed, .. }));
        assert_eq!(store.rankings_for(date).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn postgres_upsert_reports_insert_then_overwrite() {
        let Some(store) = connect_db_from_env().await else {
            return;
        };
        let date = scratch_date();
        let snapshot = Snapshot {
            snapshot_date: date,
            entity_id: EntityId::new(Uuid::new_v4()),
            service: ServiceId::new("spotify"),
            external_id: "artist-a".into(),
            metrics: Metrics {
                popularity: 40,
                ..Metrics::default()
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let first = store.upsert_snapshot(snapshot.clone()).await.unwrap();
        assert_eq!(first.outcome, UpsertOutcome::Inserted);

        let mut changed = snapshot;
        changed.metrics.popularity = 41;
        changed.created_at = Utc::now() + chrono::Duration::hours(1);
        let second = store.upsert_snapshot(changed).await.unwrap();
        assert_eq!(second.outcome, UpsertOutcome::Overwritten);
        assert_eq!(second.snapshot.created_at, first.snapshot.created_at);
        assert_eq!(second.snapshot.metrics.popularity, 41);
        assert_eq!(store.snapshots_for(date).await.unwrap().len(), 1);
    }
}
