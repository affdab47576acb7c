//! Run ledger: the audit trail of every computation attempt, the per-date
//! mutual-exclusion gate, and the freeze check derived from both.

use std::sync::{Arc, Mutex};

use chartkeep_core::{RunLogEntry, RunStatus};
use chartkeep_storage::{StartOutcome, Store, StoreError};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::FreezePolicy;
use crate::error::PipelineError;

/// Source of "now" for freeze checks and timestamps. Never used to pick a target date.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        match self.now.lock() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.set(self.now() + by);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub snapshot_date: NaiveDate,
    pub algorithm_version: String,
    pub actor: String,
    pub dry_run: bool,
    pub force: bool,
}

pub struct RunLedger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    freeze: FreezePolicy,
}

impl RunLedger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, freeze: FreezePolicy) -> Self {
        Self {
            store,
            clock,
            freeze,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn deadline(&self, date: NaiveDate) -> Result<DateTime<Utc>, PipelineError> {
        self.freeze.deadline(date)
    }

    pub async fn runs_for(&self, date: NaiveDate) -> Result<Vec<RunLogEntry>, PipelineError> {
        Ok(self.store.runs_for(date).await?)
    }

    /// The most recent non-dry run whose output is currently published for `date`.
    pub async fn effective_run(&self, date: NaiveDate) -> Result<Option<RunLogEntry>, PipelineError> {
        let runs = self.store.runs_for(date).await?;
        Ok(runs
            .into_iter()
            .filter(RunLogEntry::is_published)
            .max_by_key(|run| (run.finished_at, run.created_at)))
    }

    /// A date freezes once it has published output and its adjustment window has closed.
    pub async fn is_frozen(&self, date: NaiveDate) -> Result<bool, PipelineError> {
        if self.effective_run(date).await?.is_none() {
            return Ok(false);
        }
        Ok(self.now() > self.deadline(date)?)
    }

    pub async fn ensure_mutable(&self, date: NaiveDate, force: bool) -> Result<(), PipelineError> {
        if !self.is_frozen(date).await? {
            return Ok(());
        }
        let deadline = self.deadline(date)?;
        if force {
            warn!(%date, %deadline, "overriding freeze on a published date");
            return Ok(());
        }
        Err(PipelineError::FrozenPeriod { date, deadline })
    }

    pub async fn open(&self, request: &RunRequest) -> Result<RunLogEntry, PipelineError> {
        let mut run = RunLogEntry::pending(
            request.snapshot_date,
            request.algorithm_version.clone(),
            request.actor.clone(),
            self.now(),
        );
        run.dry_run = request.dry_run;
        run.forced = request.force;
        self.store.insert_run(&run).await?;
        if request.force {
            warn!(run_id = %run.run_id, actor = %run.actor, date = %run.snapshot_date, "forced run opened");
        }
        Ok(run)
    }

    /// Take the per-date gate. Losing it finalizes `run` as failed with `RunInProgress`.
    pub async fn start(&self, run: &mut RunLogEntry) -> Result<(), PipelineError> {
        let started_at = self.now();
        match self.store.try_start_run(run.run_id, started_at).await? {
            StartOutcome::Started => {
                run.status = RunStatus::Running;
                run.started_at = Some(started_at);
                info!(run_id = %run.run_id, date = %run.snapshot_date, "run started");
                Ok(())
            }
            StartOutcome::Busy { holder } => {
                let err = PipelineError::RunInProgress {
                    date: run.snapshot_date,
                    holder,
                };
                warn!(run_id = %run.run_id, %holder, "another run holds the date");
                self.finish(run, RunStatus::Failed, Some(err.cause())).await?;
                Err(err)
            }
        }
    }

    /// Write the terminal state of `run`. Finish fields are set exactly once.
    pub async fn finish(
        &self,
        run: &mut RunLogEntry,
        status: RunStatus,
        cause: Option<String>,
    ) -> Result<(), PipelineError> {
        if !status.is_terminal() || !run.status.can_transition_to(status) {
            return Err(PipelineError::InvalidTransition {
                run_id: run.run_id,
                from: run.status,
                to: status,
            });
        }
        let previous = run.status;
        run.status = status;
        run.finished_at = Some(self.now());
        run.cause = cause;

        match self.store.finish_run(run).await {
            Ok(()) => {
                info!(run_id = %run.run_id, status = %status, "run finished");
                Ok(())
            }
            Err(StoreError::Conflict(_)) => {
                let actual = self
                    .store
                    .get_run(run.run_id)
                    .await?
                    .map(|stored| stored.status)
                    .unwrap_or(previous);
                Err(PipelineError::InvalidTransition {
                    run_id: run.run_id,
                    from: actual,
                    to: status,
                })
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Mark a pending or running run failed. Its partial snapshot writes stay; nothing is published.
    pub async fn abort(&self, run_id: Uuid, cause: &str) -> Result<RunLogEntry, PipelineError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| PipelineError::NoData(format!("run {run_id} not found")))?;
        self.finish(&mut run, RunStatus::Failed, Some(format!("Aborted: {cause}")))
            .await?;
        error!(%run_id, date = %run.snapshot_date, cause, "run aborted");
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartkeep_storage::{MemoryStore, RunLedgerStore};
    use chrono::TimeZone;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    fn request(force: bool) -> RunRequest {
        RunRequest {
            snapshot_date: date(),
            algorithm_version: "popularity-v1".into(),
            actor: "tester".into(),
            dry_run: false,
            force,
        }
    }

    fn ledger(clock: Arc<FixedClock>) -> (Arc<MemoryStore>, RunLedger) {
        let store = Arc::new(MemoryStore::new());
        let ledger = RunLedger::new(store.clone(), clock, FreezePolicy::default());
        (store, ledger)
    }

    #[tokio::test]
    async fn second_run_for_a_running_date_fails_fast() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()));
        let (store, ledger) = ledger(clock);

        let mut first = ledger.open(&request(false)).await.unwrap();
        ledger.start(&mut first).await.unwrap();

        let mut second = ledger.open(&request(false)).await.unwrap();
        let err = ledger.start(&mut second).await.unwrap_err();
        assert!(matches!(err, PipelineError::RunInProgress { holder, .. } if holder == first.run_id));

        let stored = store.get_run(second.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(stored.cause.unwrap().starts_with("RunInProgress"));
    }

    #[tokio::test]
    async fn published_date_freezes_after_the_deadline() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()));
        let (_store, ledger) = ledger(clock.clone());

        assert!(!ledger.is_frozen(date()).await.unwrap());
        let mut run = ledger.open(&request(false)).await.unwrap();
        ledger.start(&mut run).await.unwrap();
        ledger.finish(&mut run, RunStatus::Succeeded, None).await.unwrap();
        assert!(!ledger.is_frozen(date()).await.unwrap());

        clock.set(ledger.deadline(date()).unwrap() + chrono::Duration::seconds(1));
        assert!(ledger.is_frozen(date()).await.unwrap());
        assert!(matches!(
            ledger.ensure_mutable(date(), false).await,
            Err(PipelineError::FrozenPeriod { .. })
        ));
        assert!(ledger.ensure_mutable(date(), true).await.is_ok());
    }

    #[tokio::test]
    async fn unpublished_dates_never_freeze() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()));
        let (_store, ledger) = ledger(clock);
        let mut run = ledger.open(&request(false)).await.unwrap();
        ledger.start(&mut run).await.unwrap();
        ledger.finish(&mut run, RunStatus::Failed, Some("boom".into())).await.unwrap();
        assert!(!ledger.is_frozen(date()).await.unwrap());
    }

    #[tokio::test]
    async fn terminal_runs_reject_further_transitions() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()));
        let (_store, ledger) = ledger(clock);
        let mut run = ledger.open(&request(false)).await.unwrap();
        assert!(matches!(
            ledger.finish(&mut run, RunStatus::Succeeded, None).await,
            Err(PipelineError::InvalidTransition { from: RunStatus::Pending, .. })
        ));
        ledger.start(&mut run).await.unwrap();
        ledger.finish(&mut run, RunStatus::Partial, None).await.unwrap();
        assert!(ledger.abort(run.run_id, "too late").await.is_err());
    }

    #[tokio::test]
    async fn abort_releases_the_gate() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()));
        let (_store, ledger) = ledger(clock);
        let mut stuck = ledger.open(&request(false)).await.unwrap();
        ledger.start(&mut stuck).await.unwrap();

        let aborted = ledger.abort(stuck.run_id, "operator").await.unwrap();
        assert_eq!(aborted.status, RunStatus::Failed);
        assert_eq!(aborted.cause.as_deref(), Some("Aborted: operator"));

        let mut next = ledger.open(&request(false)).await.unwrap();
        ledger.start(&mut next).await.unwrap();
        assert_eq!(next.status, RunStatus::Running);
    }
}
