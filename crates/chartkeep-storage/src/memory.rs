use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chartkeep_core::{
    CumulativeRankingEntry, DailyStats, EntityId, ExternalIdentityMapping, RankingEntry,
    RunLogEntry, RunStatus, ServiceId, Snapshot, WeeklyRankingEntry,
};
use chrono::{DateTime, NaiveDate, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    IdentityAuthority, RankingStore, RollupStore, RunLedgerStore, ScoreTotal, SnapshotStore,
    StartOutcome, StoreError, StoreResult, UpsertOutcome, UpsertedSnapshot,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryState {
    #[serde(default)]
    identities: Vec<ExternalIdentityMapping>,
    #[serde(default)]
    snapshots: BTreeMap<NaiveDate, BTreeMap<EntityId, Snapshot>>,
    #[serde(default)]
    rankings: BTreeMap<NaiveDate, BTreeMap<EntityId, RankingEntry>>,
    #[serde(default)]
    stats: BTreeMap<NaiveDate, DailyStats>,
    #[serde(default)]
    weekly: BTreeMap<NaiveDate, BTreeMap<EntityId, WeeklyRankingEntry>>,
    #[serde(default)]
    cumulative: BTreeMap<NaiveDate, BTreeMap<EntityId, CumulativeRankingEntry>>,
    #[serde(default)]
    runs: Vec<RunLogEntry>,
}

/// State file a `MemoryStore` writes through to. The exclusive lock on the
/// sibling `.lock` file is held for the life of the store.
#[derive(Debug)]
struct Backing {
    path: PathBuf,
    _lock: File,
}

/// Process-local store. Serializable to a JSON state file so the CLI can run without a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    backing: Option<Backing>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities(identities: Vec<ExternalIdentityMapping>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                identities,
                ..MemoryState::default()
            }),
            backing: None,
        }
    }

    pub async fn add_identity(&self, mapping: ExternalIdentityMapping) {
        let mut state = self.state.lock().await;
        if !state.identities.contains(&mapping) {
            state.identities.push(mapping);
        }
    }

    /// Lock and load a state file; a missing file yields an empty store.
    ///
    /// While the store lives, ledger writes are flushed to the file as they
    /// happen and no other process can open it. A second opener gets
    /// `StoreError::Unavailable`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let lock = lock_state_file(&path).await?;
        let state = read_state(&path)
            .await
            .map_err(|err| StoreError::Serialization(format!("{err:#}")))?;
        Ok(Self {
            state: Mutex::new(state),
            backing: Some(Backing { path, _lock: lock }),
        })
    }

    /// Write the whole state to `path` atomically (temp file + rename).
    pub async fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let state = self.state.lock().await;
        write_state(path.as_ref(), &state).await
    }

    /// Flush to the state file this store was opened from. No-op for unbacked stores.
    pub async fn persist(&self) -> anyhow::Result<()> {
        match &self.backing {
            Some(backing) => self.save(&backing.path).await,
            None => Ok(()),
        }
    }

    async fn flush(&self, state: &MemoryState) -> StoreResult<()> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        write_state(&backing.path, state)
            .await
            .map_err(|err| StoreError::Unavailable(format!("{err:#}")))
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

async fn lock_state_file(path: &Path) -> StoreResult<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| StoreError::Unavailable(format!("creating {}: {err}", parent.display())))?;
    }
    let lock_path = lock_path(path);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|err| StoreError::Unavailable(format!("opening {}: {err}", lock_path.display())))?;
    file.try_lock_exclusive().map_err(|_| {
        StoreError::Unavailable(format!(
            "{} is in use by another chartkeep process",
            path.display()
        ))
    })?;
    Ok(file)
}

async fn read_state(path: &Path) -> anyhow::Result<MemoryState> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking state file {}", path.display()))?
    {
        return Ok(MemoryState::default());
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn write_state(path: &Path, state: &MemoryState) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(state).context("serializing memory store state")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()))?;
    Ok(())
}

#[async_trait]
impl IdentityAuthority for MemoryStore {
    async fn lookup(
        &self,
        service: &ServiceId,
        external_ids: &[String],
    ) -> StoreResult<Vec<ExternalIdentityMapping>> {
        let wanted: HashSet<&str> = external_ids.iter().map(String::as_str).collect();
        let state = self.state.lock().await;
        Ok(state
            .identities
            .iter()
            .filter(|m| &m.service == service && wanted.contains(m.external_id.as_str()))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn upsert_snapshot(&self, mut snapshot: Snapshot) -> StoreResult<UpsertedSnapshot> {
        let mut state = self.state.lock().await;
        let day = state.snapshots.entry(snapshot.snapshot_date).or_default();
        let outcome = match day.get(&snapshot.entity_id) {
            Some(existing) => {
                snapshot.created_at = existing.created_at;
                UpsertOutcome::Overwritten
            }
            None => UpsertOutcome::Inserted,
        };
        day.insert(snapshot.entity_id, snapshot.clone());
        Ok(UpsertedSnapshot { snapshot, outcome })
    }

    async fn snapshots_for(&self, date: NaiveDate) -> StoreResult<Vec<Snapshot>> {
        let state = self.state.lock().await;
        Ok(state
            .snapshots
            .get(&date)
            .map(|day| day.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn snapshot_dates(&self) -> StoreResult<Vec<NaiveDate>> {
        let state = self.state.lock().await;
        Ok(state
            .snapshots
            .iter()
            .filter(|(_, day)| !day.is_empty())
            .map(|(date, _)| *date)
            .collect())
    }
}

fn sorted_by_rank<T: Clone>(rows: &BTreeMap<EntityId, T>, rank: impl Fn(&T) -> u32) -> Vec<T> {
    let mut out = rows.values().cloned().collect::<Vec<_>>();
    out.sort_by_key(|row| rank(row));
    out
}

#[async_trait]
impl RankingStore for MemoryStore {
    async fn publish_rankings(
        &self,
        run_id: Uuid,
        date: NaiveDate,
        entries: &[RankingEntry],
    ) -> StoreResult<u64> {
        if let Some(stray) = entries.iter().find(|e| e.snapshot_date != date) {
            return Err(StoreError::Integrity(format!(
                "ranking entry for {} dated {} published under {date}",
                stray.entity_id, stray.snapshot_date
            )));
        }
        let mut state = self.state.lock().await;
        let status = state
            .runs
            .iter()
            .find(|r| r.run_id == run_id)
            .map(|r| r.status)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        if status != RunStatus::Running {
            return Err(StoreError::RunNotRunning { run_id, status });
        }
        if entries.is_empty() {
            state.rankings.remove(&date);
            return Ok(0);
        }
        let set = entries
            .iter()
            .map(|e| (e.entity_id, e.clone()))
            .collect::<BTreeMap<_, _>>();
        state.rankings.insert(date, set);
        Ok(entries.len() as u64)
    }

    async fn rankings_for(&self, date: NaiveDate) -> StoreResult<Vec<RankingEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .rankings
            .get(&date)
            .map(|set| sorted_by_rank(set, |e| e.rank))
            .unwrap_or_default())
    }

    async fn rankings_between(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<RankingEntry>> {
        if from > to {
            return Ok(Vec::new());
        }
        let state = self.state.lock().await;
        Ok(state
            .rankings
            .range(from..=to)
            .flat_map(|(_, set)| sorted_by_rank(set, |e| e.rank))
            .collect())
    }

    async fn latest_ranking_date_before(&self, date: NaiveDate) -> StoreResult<Option<NaiveDate>> {
        let state = self.state.lock().await;
        Ok(state
            .rankings
            .range(..date)
            .rev()
            .find(|(_, set)| !set.is_empty())
            .map(|(d, _)| *d))
    }

    async fn ranking_dates(&self) -> StoreResult<Vec<NaiveDate>> {
        let state = self.state.lock().await;
        Ok(state.rankings.keys().copied().collect())
    }

    async fn score_totals_through(&self, date: NaiveDate) -> StoreResult<Vec<ScoreTotal>> {
        let state = self.state.lock().await;
        let mut totals: BTreeMap<EntityId, ScoreTotal> = BTreeMap::new();
        for entry in state.rankings.range(..=date).flat_map(|(_, set)| set.values()) {
            let total = totals.entry(entry.entity_id).or_insert(ScoreTotal {
                entity_id: entry.entity_id,
                total_score: 0.0,
                days_counted: 0,
            });
            total.total_score += entry.score;
            total.days_counted += 1;
        }
        Ok(totals.into_values().collect())
    }

    async fn upsert_daily_stats(&self, stats: &DailyStats) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.stats.insert(stats.snapshot_date, stats.clone());
        Ok(())
    }

    async fn daily_stats_for(&self, date: NaiveDate) -> StoreResult<Option<DailyStats>> {
        let state = self.state.lock().await;
        Ok(state.stats.get(&date).cloned())
    }
}

#[async_trait]
impl RollupStore for MemoryStore {
    async fn publish_weekly(
        &self,
        week_end: NaiveDate,
        entries: &[WeeklyRankingEntry],
    ) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let set = entries
            .iter()
            .map(|e| (e.entity_id, e.clone()))
            .collect::<BTreeMap<_, _>>();
        if set.is_empty() {
            state.weekly.remove(&week_end);
        } else {
            state.weekly.insert(week_end, set);
        }
        Ok(entries.len() as u64)
    }

    async fn weekly_for(&self, week_end: NaiveDate) -> StoreResult<Vec<WeeklyRankingEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .weekly
            .get(&week_end)
            .map(|set| sorted_by_rank(set, |e| e.rank))
            .unwrap_or_default())
    }

    async fn weekly_dates(&self) -> StoreResult<Vec<NaiveDate>> {
        let state = self.state.lock().await;
        Ok(state.weekly.keys().copied().collect())
    }

    async fn publish_cumulative(
        &self,
        date: NaiveDate,
        entries: &[CumulativeRankingEntry],
    ) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let set = entries
            .iter()
            .map(|e| (e.entity_id, e.clone()))
            .collect::<BTreeMap<_, _>>();
        if set.is_empty() {
            state.cumulative.remove(&date);
        } else {
            state.cumulative.insert(date, set);
        }
        Ok(entries.len() as u64)
    }

    async fn cumulative_for(&self, date: NaiveDate) -> StoreResult<Vec<CumulativeRankingEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .cumulative
            .get(&date)
            .map(|set| sorted_by_rank(set, |e| e.rank))
            .unwrap_or_default())
    }

    async fn latest_cumulative_date_before(
        &self,
        date: NaiveDate,
    ) -> StoreResult<Option<NaiveDate>> {
        let state = self.state.lock().await;
        Ok(state.cumulative.range(..date).next_back().map(|(d, _)| *d))
    }
}

#[async_trait]
impl RunLedgerStore for MemoryStore {
    async fn insert_run(&self, run: &RunLogEntry) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.runs.iter().any(|r| r.run_id == run.run_id) {
            return Err(StoreError::Conflict(format!("run {} already recorded", run.run_id)));
        }
        state.runs.push(run.clone());
        self.flush(&state).await
    }

    async fn try_start_run(&self, run_id: Uuid, started_at: DateTime<Utc>) -> StoreResult<StartOutcome> {
        let mut state = self.state.lock().await;
        let (date, status) = state
            .runs
            .iter()
            .find(|r| r.run_id == run_id)
            .map(|r| (r.snapshot_date, r.status))
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        if status != RunStatus::Pending {
            return Err(StoreError::Conflict(format!("run {run_id} is {status}, not pending")));
        }
        if let Some(holder) = state
            .runs
            .iter()
            .find(|r| r.snapshot_date == date && r.status == RunStatus::Running)
        {
            return Ok(StartOutcome::Busy {
                holder: holder.run_id,
            });
        }
        if let Some(run) = state.runs.iter_mut().find(|r| r.run_id == run_id) {
            run.status = RunStatus::Running;
            run.started_at = Some(started_at);
        }
        self.flush(&state).await?;
        Ok(StartOutcome::Started)
    }

    async fn finish_run(&self, run: &RunLogEntry) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let existing = state
            .runs
            .iter_mut()
            .find(|r| r.run_id == run.run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {}", run.run_id)))?;
        if existing.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "run {} already finished as {}",
                run.run_id, existing.status
            )));
        }
        *existing = run.clone();
        self.flush(&state).await
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<RunLogEntry>> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn runs_for(&self, date: NaiveDate) -> StoreResult<Vec<RunLogEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.snapshot_date == date)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartkeep_core::Metrics;
    use tempfile::tempdir;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).expect("date")
    }

    fn snapshot(day: u32, entity_id: EntityId, popularity: i64) -> Snapshot {
        Snapshot {
            snapshot_date: date(day),
            entity_id,
            service: ServiceId::new("spotify"),
            external_id: format!("ext-{entity_id}"),
            metrics: Metrics {
                popularity,
                ..Metrics::default()
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_and_keeps_first_created_at() {
        let store = MemoryStore::new();
        let id = EntityId::new(Uuid::new_v4());
        let first = store.upsert_snapshot(snapshot(1, id, 40)).await.unwrap();
        let second = store.upsert_snapshot(snapshot(1, id, 41)).await.unwrap();

        assert_eq!(first.outcome, UpsertOutcome::Inserted);
        assert_eq!(second.outcome, UpsertOutcome::Overwritten);
        assert_eq!(second.snapshot.created_at, first.snapshot.created_at);

        let rows = store.snapshots_for(date(1)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metrics.popularity, 41);
    }

    #[tokio::test]
    async fn second_running_run_for_a_date_is_refused() {
        let store = MemoryStore::new();
        let first = RunLogEntry::pending(date(2), "v", "test", Utc::now());
        let second = RunLogEntry::pending(date(2), "v", "test", Utc::now());
        let other_day = RunLogEntry::pending(date(3), "v", "test", Utc::now());
        for run in [&first, &second, &other_day] {
            store.insert_run(run).await.unwrap();
        }

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
        assert_eq!(
            store.try_start_run(other_day.run_id, Utc::now()).await.unwrap(),
            StartOutcome::Started
        );
    }

    #[tokio::test]
    async fn finished_runs_cannot_be_rewritten() {
        let store = MemoryStore::new();
        let mut run = RunLogEntry::pending(date(2), "v", "test", Utc::now());
        store.insert_run(&run).await.unwrap();
        run.status = RunStatus::Failed;
        store.finish_run(&run).await.unwrap();

        run.status = RunStatus::Succeeded;
        let err = store.finish_run(&run).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn publishing_needs_the_run_to_still_be_running() {
        let store = MemoryStore::new();
        let mut run = RunLogEntry::pending(date(2), "v", "test", Utc::now());
        store.insert_run(&run).await.unwrap();

        let err = store.publish_rankings(run.run_id, date(2), &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::RunNotRunning { status: RunStatus::Pending, .. }));

        store.try_start_run(run.run_id, Utc::now()).await.unwrap();
        assert_eq!(store.publish_rankings(run.run_id, date(2), &[]).await.unwrap(), 0);

        run.status = RunStatus::Failed;
        run.cause = Some("Aborted: operator".into());
        store.finish_run(&run).await.unwrap();
        let err = store.publish_rankings(run.run_id, date(2), &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::RunNotRunning { status: RunStatus::Failed, .. }));
    }

    #[tokio::test]
    async fn state_file_is_held_by_one_store_at_a_time() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("chartkeep.json");

        let first = MemoryStore::open(&path).await.unwrap();
        let err = MemoryStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(err.is_retryable());

        drop(first);
        assert!(MemoryStore::open(&path).await.is_ok());
    }

    #[tokio::test]
    async fn ledger_writes_reach_the_state_file_without_an_explicit_save() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("chartkeep.json");
        let run = RunLogEntry::pending(date(5), "v", "test", Utc::now());

        {
            let store = MemoryStore::open(&path).await.unwrap();
            store.insert_run(&run).await.unwrap();
            store.try_start_run(run.run_id, Utc::now()).await.unwrap();
        }

        let reopened = MemoryStore::open(&path).await.unwrap();
        let stored = reopened.get_run(run.run_id).await.unwrap().expect("run row");
        assert_eq!(stored.status, RunStatus::Running);

        let second = RunLogEntry::pending(date(5), "v", "test", Utc::now());
        reopened.insert_run(&second).await.unwrap();
        assert_eq!(
            reopened.try_start_run(second.run_id, Utc::now()).await.unwrap(),
            StartOutcome::Busy { holder: run.run_id }
        );
    }

    #[tokio::test]
    async fn state_file_round_trips_snapshots_and_runs() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("chartkeep.json");
        let id = EntityId::new(Uuid::new_v4());

        let store = MemoryStore::new();
        store.upsert_snapshot(snapshot(4, id, 12)).await.unwrap();
        store
            .insert_run(&RunLogEntry::pending(date(4), "v", "test", Utc::now()))
            .await
            .unwrap();
        store.save(&path).await.unwrap();

        let reopened = MemoryStore::open(&path).await.unwrap();
        reopened.persist().await.unwrap();
        assert_eq!(reopened.snapshot_dates().await.unwrap(), vec![date(4)]);
        assert_eq!(reopened.runs_for(date(4)).await.unwrap().len(), 1);
    }
}
