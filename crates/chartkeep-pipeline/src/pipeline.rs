//! One daily computation: ledger gate, optional feed ingestion, ranking,
//! publication, cumulative rollup and the run report.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chartkeep_core::{EntityId, RunLogEntry, RunStatus, Snapshot};
use chartkeep_feed::{adapter_for_location, ensure_target};
use chartkeep_storage::{FeedArchive, HttpFetcher, IdentityAuthority, Store};
use chrono::NaiveDate;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{PipelineConfig, Policy};
use crate::error::PipelineError;
use crate::ingest::{ingest_rows, validate_rows, IngestReport, RowOutcome};
use crate::ledger::{Clock, RunLedger, RunRequest};
use crate::ranking::{ComputedRanking, RankingEngine};
use crate::report::{write_run_report, FeedProvenance, RunReport};
use crate::resolver::{IdentityResolver, ResolvedRow};
use crate::rollup::RollupAggregator;
use crate::scoring::{model_for, ScoringModel};

/// What the operator asked for. The target date is always explicit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyRequest {
    pub snapshot_date: NaiveDate,
    /// Local path or http(s) URL of the day's measurement feed. Without one,
    /// the snapshots already stored for the date are ranked.
    pub feed: Option<String>,
    pub dry_run: bool,
    pub force: bool,
    pub algorithm_version: Option<String>,
    pub actor: String,
}

impl DailyRequest {
    pub fn new(snapshot_date: NaiveDate, actor: impl Into<String>) -> Self {
        Self {
            snapshot_date,
            feed: None,
            dry_run: false,
            force: false,
            algorithm_version: None,
            actor: actor.into(),
        }
    }

    pub fn with_feed(mut self, feed: impl Into<String>) -> Self {
        self.feed = Some(feed.into());
        self
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run: RunLogEntry,
    pub ranking: Option<ComputedRanking>,
    pub ingest: Option<IngestReport>,
    pub error: Option<PipelineError>,
    pub report_dir: Option<PathBuf>,
}

impl RunOutcome {
    /// 0 succeeded, 2 partial, 1 failed, 3 failed but worth retrying.
    pub fn exit_code(&self) -> i32 {
        match self.run.status {
            RunStatus::Succeeded => 0,
            RunStatus::Partial => 2,
            _ if self.error.as_ref().is_some_and(PipelineError::is_retryable) => 3,
            _ => 1,
        }
    }
}

#[derive(Default)]
struct RunState {
    feed: Option<FeedProvenance>,
    ingest: Option<IngestReport>,
    ranking: Option<ComputedRanking>,
    cumulative_entities: Option<usize>,
}

pub struct DailyPipeline {
    policy: Policy,
    store: Arc<dyn Store>,
    resolver: IdentityResolver,
    ledger: RunLedger,
    engine: RankingEngine,
    rollups: RollupAggregator,
    archive: FeedArchive,
    reports_dir: PathBuf,
    concurrency: usize,
    http: Option<Arc<HttpFetcher>>,
}

impl DailyPipeline {
    pub fn new(
        config: &PipelineConfig,
        policy: Policy,
        store: Arc<dyn Store>,
        identities: Arc<dyn IdentityAuthority>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            resolver: IdentityResolver::new(identities),
            ledger: RunLedger::new(Arc::clone(&store), Arc::clone(&clock), policy.freeze),
            engine: RankingEngine::new(Arc::clone(&store), policy.rising_threshold),
            rollups: RollupAggregator::new(Arc::clone(&store), clock),
            archive: FeedArchive::new(config.artifacts_dir.clone()),
            reports_dir: config.reports_dir.clone(),
            concurrency: config.concurrency,
            http: None,
            policy,
            store,
        }
    }

    pub fn with_http(mut self, http: Arc<HttpFetcher>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn rollups(&self) -> &RollupAggregator {
        &self.rollups
    }

    /// Run the daily computation for one date.
    ///
    /// Only failures that happen before a ledger row exists (unknown algorithm
    /// version, ledger unreachable) come back as `Err`; everything later is
    /// recorded on the run and returned in the outcome.
    pub async fn run(&self, request: DailyRequest) -> Result<RunOutcome, PipelineError> {
        let model = model_for(&self.policy.scoring, request.algorithm_version.as_deref())?;
        let mut run = self
            .ledger
            .open(&RunRequest {
                snapshot_date: request.snapshot_date,
                algorithm_version: model.version().to_string(),
                actor: request.actor.clone(),
                dry_run: request.dry_run,
                force: request.force,
            })
            .await?;

        let span = info_span!(
            "daily_run",
            run_id = %run.run_id,
            snapshot_date = %run.snapshot_date,
            dry_run = run.dry_run
        );
        let outcome = async move {
            if let Err(err) = self.ledger.start(&mut run).await {
                if !run.status.is_terminal() {
                    let cause = Some(err.cause());
                    if let Err(finish_err) = self.ledger.finish(&mut run, RunStatus::Failed, cause).await {
                        warn!(error = %finish_err, "could not record the failed start");
                    }
                }
                return RunOutcome {
                    run,
                    ranking: None,
                    ingest: None,
                    error: Some(err),
                    report_dir: None,
                };
            }

            let mut state = RunState::default();
            let (status, mut error) = match self.execute(&mut run, &request, model.as_ref(), &mut state).await {
                Ok(status) => (status, None),
                Err(err) => {
                    warn!(error = %err, code = err.code(), "run failed");
                    (RunStatus::Failed, Some(err))
                }
            };
            if status == RunStatus::Partial {
                warn!(rejected = run.rows_rejected, "run published with rejected rows; flagged for review");
            }

            let cause = error.as_ref().map(PipelineError::cause);
            if let Err(finish_err) = self.ledger.finish(&mut run, status, cause).await {
                warn!(error = %finish_err, "could not finish run");
                if let Ok(Some(stored)) = self.store.get_run(run.run_id).await {
                    run = stored;
                }
                error.get_or_insert(finish_err);
            }

            let report_dir = if run.dry_run {
                None
            } else {
                self.write_report(&run, &state).await
            };

            RunOutcome {
                run,
                ranking: state.ranking,
                ingest: state.ingest,
                error,
                report_dir,
            }
        }
        .instrument(span)
        .await;
        Ok(outcome)
    }

    async fn execute(
        &self,
        run: &mut RunLogEntry,
        request: &DailyRequest,
        model: &dyn ScoringModel,
        state: &mut RunState,
    ) -> Result<RunStatus, PipelineError> {
        let date = run.snapshot_date;
        if !run.dry_run {
            self.ledger.ensure_mutable(date, request.force).await?;
        }

        let mut staged: Vec<ResolvedRow> = Vec::new();
        let mut feed_rows = None;
        if let Some(location) = request.feed.as_deref() {
            let adapter = adapter_for_location(location, self.http.clone())?;
            let payload = adapter.load(run.run_id).await?;
            ensure_target(&payload.document, date)?;

            let digest = payload.digest();
            run.input_digest = Some(digest.clone());
            let artifact_path = if run.dry_run {
                None
            } else {
                let archived = self
                    .archive
                    .archive(date, payload.document.source.as_deref(), &payload.raw)
                    .await?;
                Some(archived.path.display().to_string())
            };
            let rows = payload.document.rows.len();
            info!(location = %payload.location, rows, %digest, "feed loaded");
            state.feed = Some(FeedProvenance {
                location: payload.location.clone(),
                source: payload.document.source.clone(),
                digest,
                artifact_path,
                rows,
            });
            feed_rows = Some(rows as u64);

            let resolution = self.resolver.resolve_batch(&payload.document.rows).await?;
            let mut report = if run.dry_run {
                validate_rows(&resolution.resolved)
            } else {
                ingest_rows(
                    Arc::clone(&self.store),
                    date,
                    resolution.resolved.clone(),
                    self.concurrency,
                    self.ledger.now(),
                )
                .await?
            };
            report.push_rejected(&resolution.unresolved);
            report.push_rejected(&resolution.halted);

            run.rows_ingested = report.ingested();
            run.rows_rejected = report.rejected();
            run.issues = report.issues();
            info!(
                inserted = report.inserted(),
                overwritten = report.overwritten(),
                rejected = report.rejected(),
                "feed ingested"
            );
            staged = accepted_rows(&resolution.resolved, &report);
            state.ingest = Some(report);

            if let Some(fault) = resolution.duplicates.first() {
                return Err(fault.to_error());
            }
        }

        if let Some(total) = feed_rows.filter(|total| *total > 0) {
            let ranked = run.rows_ingested;
            if (ranked as f64) / (total as f64) < self.policy.min_publish_ratio {
                return Err(PipelineError::BelowPublishRatio {
                    ranked,
                    total,
                    minimum: self.policy.min_publish_ratio,
                });
            }
        }

        let now = self.ledger.now();
        let computed = if run.dry_run {
            let snapshots = self.overlay(date, &staged).await?;
            self.engine.compute_from_snapshots(date, &snapshots, model, now).await?
        } else {
            self.engine.compute(date, model, now).await?
        };

        if !run.dry_run {
            run.rows_written = self.engine.publish(run.run_id, &computed).await?;
            info!(rows_written = run.rows_written, "ranking set published");
            match self.rollups.compute_cumulative(date).await {
                Ok(entries) => state.cumulative_entities = Some(entries.len()),
                Err(err) => warn!(error = %err, "cumulative rollup failed; daily set stays published"),
            }
        }
        state.ranking = Some(computed);

        Ok(if run.rows_rejected > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Succeeded
        })
    }

    /// The date's stored snapshots with this feed's accepted rows laid over them.
    async fn overlay(&self, date: NaiveDate, rows: &[ResolvedRow]) -> Result<Vec<Snapshot>, PipelineError> {
        let now = self.ledger.now();
        let mut by_entity: BTreeMap<EntityId, Snapshot> = self
            .store
            .snapshots_for(date)
            .await?
            .into_iter()
            .map(|snapshot| (snapshot.entity_id, snapshot))
            .collect();
        for resolved in rows {
            by_entity.insert(
                resolved.entity_id,
                Snapshot {
                    snapshot_date: date,
                    entity_id: resolved.entity_id,
                    service: resolved.row.service.clone(),
                    external_id: resolved.row.external_id.clone(),
                    metrics: resolved.row.metrics,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        Ok(by_entity.into_values().collect())
    }

    async fn write_report(&self, run: &RunLogEntry, state: &RunState) -> Option<PathBuf> {
        let report = RunReport {
            run,
            feed: state.feed.as_ref(),
            ingest: state.ingest.as_ref(),
            stats: state.ranking.as_ref().map(|r| &r.stats),
            cumulative_entities: state.cumulative_entities,
        };
        let published = state
            .ranking
            .as_ref()
            .filter(|_| run.is_published())
            .map(|r| r.entries.as_slice());
        match write_run_report(&self.reports_dir, &report, published).await {
            Ok(dir) => {
                info!(dir = %dir.display(), "run report written");
                Some(dir)
            }
            Err(err) => {
                warn!(error = %err, "writing run report failed");
                None
            }
        }
    }
}

fn accepted_rows(resolved: &[ResolvedRow], report: &IngestReport) -> Vec<ResolvedRow> {
    resolved
        .iter()
        .filter(|row| {
            report.rows.iter().any(|r| {
                r.service == row.row.service
                    && r.external_id == row.row.external_id
                    && !matches!(r.outcome, RowOutcome::Rejected { .. })
            })
        })
        .cloned()
        .collect()
}
