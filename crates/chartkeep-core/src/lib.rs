//! Core domain model for chartkeep: canonical ids, daily measurements and the derived rankings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "chartkeep-core";

/// Canonical entity id. Every stored row references entities through this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for EntityId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Name of an external service that issues identifiers, e.g. `spotify`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ServiceId {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<ServiceId> for String {
    fn from(service: ServiceId) -> Self {
        service.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row owned by the identity authority: (service, external_id) -> entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIdentityMapping {
    pub service: ServiceId,
    pub external_id: String,
    pub entity_id: EntityId,
}

/// Raw daily measurement values for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub popularity: i64,
    pub followers: i64,
    pub track_popularity_sum: i64,
    pub release_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("metric `{field}` must be non-negative, got {value}")]
pub struct MetricViolation {
    pub field: &'static str,
    pub value: i64,
}

impl Metrics {
    pub fn validate(&self) -> Result<(), MetricViolation> {
        for (field, value) in [
            ("popularity", self.popularity),
            ("followers", self.followers),
            ("track_popularity_sum", self.track_popularity_sum),
            ("release_count", self.release_count),
        ] {
            if value < 0 {
                return Err(MetricViolation { field, value });
            }
        }
        Ok(())
    }

    pub fn delta_from(&self, previous: &Metrics) -> MetricDeltas {
        MetricDeltas {
            popularity: Some(self.popularity - previous.popularity),
            followers: Some(self.followers - previous.followers),
            track_popularity_sum: Some(self.track_popularity_sum - previous.track_popularity_sum),
            release_count: Some(self.release_count - previous.release_count),
        }
    }
}

/// Day-over-day change of each raw metric. All `None` on first appearance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricDeltas {
    pub popularity: Option<i64>,
    pub followers: Option<i64>,
    pub track_popularity_sum: Option<i64>,
    pub release_count: Option<i64>,
}

impl MetricDeltas {
    pub fn is_empty(&self) -> bool {
        self.popularity.is_none()
            && self.followers.is_none()
            && self.track_popularity_sum.is_none()
            && self.release_count.is_none()
    }
}

/// One day's measurement for one canonical entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_date: NaiveDate,
    pub entity_id: EntityId,
    pub service: ServiceId,
    /// Identifier the row was resolved from, kept for traceability only.
    pub external_id: String,
    pub metrics: Metrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Rising/falling indicator with a distinct state for entities that have no history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Movement {
    New,
    Rising,
    Falling,
    Steady,
}

impl Movement {
    pub fn classify(score_delta: Option<f64>, threshold: f64) -> Self {
        match score_delta {
            None => Self::New,
            Some(delta) if delta > threshold => Self::Rising,
            Some(delta) if delta < -threshold => Self::Falling,
            Some(_) => Self::Steady,
        }
    }

    /// Rollups carry no score threshold, so movement follows the rank.
    pub fn from_rank_delta(rank_delta: Option<i64>) -> Self {
        match rank_delta {
            None => Self::New,
            Some(d) if d > 0 => Self::Rising,
            Some(d) if d < 0 => Self::Falling,
            Some(_) => Self::Steady,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Rising => "rising",
            Self::Falling => "falling",
            Self::Steady => "steady",
        }
    }
}

impl FromStr for Movement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "rising" => Ok(Self::Rising),
            "falling" => Ok(Self::Falling),
            "steady" => Ok(Self::Steady),
            other => Err(format!("unknown movement `{other}`")),
        }
    }
}

/// One row of a daily ranking set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub snapshot_date: NaiveDate,
    pub entity_id: EntityId,
    pub rank: u32,
    pub prev_rank: Option<u32>,
    /// `prev_rank - rank`; positive means the entity climbed.
    pub rank_delta: Option<i64>,
    pub score: f64,
    pub prev_score: Option<f64>,
    pub score_delta: Option<f64>,
    pub movement: Movement,
    pub metrics: Metrics,
    pub metric_deltas: MetricDeltas,
    pub algorithm_version: String,
    pub created_at: DateTime<Utc>,
}

impl RankingEntry {
    pub fn is_first_appearance(&self) -> bool {
        self.prev_rank.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyRankingEntry {
    pub week_end_date: NaiveDate,
    pub entity_id: EntityId,
    pub rank: u32,
    pub prev_rank: Option<u32>,
    pub rank_delta: Option<i64>,
    pub total_score: f64,
    pub average_score: f64,
    pub days_counted: u32,
    pub latest_popularity: Option<i64>,
    pub movement: Movement,
    pub created_at: DateTime<Utc>,
}

impl WeeklyRankingEntry {
    pub fn week_start_date(&self) -> NaiveDate {
        self.week_end_date - chrono::Days::new(6)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CumulativeRankingEntry {
    pub snapshot_date: NaiveDate,
    pub entity_id: EntityId,
    pub rank: u32,
    pub prev_rank: Option<u32>,
    pub rank_delta: Option<i64>,
    pub cumulative_score: f64,
    /// The entity's own daily score on `snapshot_date`, if it was ranked that day.
    pub day_score: Option<f64>,
    pub days_counted: u32,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of one computation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Partial,
}

impl RunStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Partial)
    }

    /// Succeeded and partial runs publish a ranking set.
    pub const fn is_published(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Partial)
    }

    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Failed),
            Self::Running => matches!(target, Self::Succeeded | Self::Failed | Self::Partial),
            Self::Succeeded | Self::Failed | Self::Partial => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "partial" => Ok(Self::Partial),
            other => Err(format!("unknown run status `{other}`")),
        }
    }
}

/// An input row that was not ingested, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIssue {
    pub service: ServiceId,
    pub external_id: String,
    pub reason: String,
}

/// Audit row for a single computation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub run_id: Uuid,
    pub snapshot_date: NaiveDate,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_ingested: u64,
    pub rows_rejected: u64,
    pub rows_written: u64,
    pub algorithm_version: String,
    pub actor: String,
    pub dry_run: bool,
    pub forced: bool,
    /// SHA-256 of the raw feed payload the run consumed, if any.
    pub input_digest: Option<String>,
    #[serde(default)]
    pub issues: Vec<RowIssue>,
    pub cause: Option<String>,
}

impl RunLogEntry {
    pub fn pending(
        snapshot_date: NaiveDate,
        algorithm_version: impl Into<String>,
        actor: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            snapshot_date,
            status: RunStatus::Pending,
            created_at,
            started_at: None,
            finished_at: None,
            rows_ingested: 0,
            rows_rejected: 0,
            rows_written: 0,
            algorithm_version: algorithm_version.into(),
            actor: actor.into(),
            dry_run: false,
            forced: false,
            input_digest: None,
            issues: Vec::new(),
            cause: None,
        }
    }

    /// A dry run never counts as the effective result for its date.
    pub fn is_published(&self) -> bool {
        self.status.is_published() && !self.dry_run
    }
}

/// Aggregate health figures of one ranking set.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsCounts {
    pub entity_count: u64,
    pub avg_score: Option<f64>,
    pub count_pop_zero: u64,
    pub count_track_zero: u64,
    pub count_both_zero: u64,
}

impl StatsCounts {
    pub fn from_entries(entries: &[RankingEntry]) -> Self {
        let mut counts = Self {
            entity_count: entries.len() as u64,
            ..Self::default()
        };
        for entry in entries {
            let pop_zero = entry.metrics.popularity == 0;
            let track_zero = entry.metrics.track_popularity_sum == 0;
            counts.count_pop_zero += u64::from(pop_zero);
            counts.count_track_zero += u64::from(track_zero);
            counts.count_both_zero += u64::from(pop_zero && track_zero);
        }
        if !entries.is_empty() {
            let total: f64 = entries.iter().map(|e| e.score).sum();
            counts.avg_score = Some(total / entries.len() as f64);
        }
        counts
    }
}

/// Per-date stats compared against the preceding computed date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub snapshot_date: NaiveDate,
    pub current: StatsCounts,
    pub previous_date: Option<NaiveDate>,
    pub previous: Option<StatsCounts>,
}

impl DailyStats {
    pub fn avg_score_diff(&self) -> Option<f64> {
        let prev = self.previous?.avg_score?;
        Some(self.current.avg_score? - prev)
    }

    /// Percentage change of the average score; `None` without a non-zero baseline.
    pub fn avg_score_ratio(&self) -> Option<f64> {
        let prev = self.previous?.avg_score?;
        if prev == 0.0 {
            return None;
        }
        Some((self.current.avg_score? - prev) / prev * 100.0)
    }

    pub fn count_pop_zero_diff(&self) -> Option<i64> {
        self.previous
            .map(|p| self.current.count_pop_zero as i64 - p.count_pop_zero as i64)
    }

    pub fn count_track_zero_diff(&self) -> Option<i64> {
        self.previous
            .map(|p| self.current.count_track_zero as i64 - p.count_track_zero as i64)
    }

    pub fn count_both_zero_diff(&self) -> Option<i64> {
        self.previous
            .map(|p| self.current.count_both_zero as i64 - p.count_both_zero as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_reject_negative_counts() {
        let metrics = Metrics {
            popularity: 40,
            followers: -1,
            ..Metrics::default()
        };
        let err = metrics.validate().unwrap_err();
        assert_eq!(err.field, "followers");
        assert!(Metrics::default().validate().is_ok());
    }

    #[test]
    fn service_names_normalize_when_deserialized() {
        let mapping: ExternalIdentityMapping = serde_json::from_str(
            r#"{"service":" Spotify ","external_id":"a1","entity_id":"00000000-0000-0000-0000-00000000000a"}"#,
        )
        .unwrap();
        assert_eq!(mapping.service, ServiceId::new("spotify"));
        assert_eq!(serde_json::to_string(&mapping.service).unwrap(), r#""spotify""#);
    }

    #[test]
    fn movement_uses_distinct_new_state() {
        assert_eq!(Movement::classify(None, 50.0), Movement::New);
        assert_eq!(Movement::classify(Some(51.0), 50.0), Movement::Rising);
        assert_eq!(Movement::classify(Some(-60.0), 50.0), Movement::Falling);
        assert_eq!(Movement::classify(Some(10.0), 50.0), Movement::Steady);
        assert_eq!(Movement::from_rank_delta(Some(0)), Movement::Steady);
    }

    #[test]
    fn run_status_transitions_follow_the_ledger_state_machine() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Succeeded));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Partial));
        assert!(!RunStatus::Succeeded.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Running));
        assert_eq!("partial".parse::<RunStatus>().unwrap(), RunStatus::Partial);
    }

    #[test]
    fn service_ids_are_normalized() {
        assert_eq!(ServiceId::new(" Spotify "), ServiceId::from("spotify"));
        let json = serde_json::to_string(&ServiceId::new("spotify")).unwrap();
        assert_eq!(json, "\"spotify\"");
    }

    #[test]
    fn stats_counts_zero_popularity_and_track_sums() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let mk = |popularity, track_popularity_sum, score| RankingEntry {
            snapshot_date: date,
            entity_id: EntityId::new(Uuid::new_v4()),
            rank: 1,
            prev_rank: None,
            rank_delta: None,
            score,
            prev_score: None,
            score_delta: None,
            movement: Movement::New,
            metrics: Metrics {
                popularity,
                track_popularity_sum,
                ..Metrics::default()
            },
            metric_deltas: MetricDeltas::default(),
            algorithm_version: "test".into(),
            created_at: Utc::now(),
        };
        let counts = StatsCounts::from_entries(&[mk(0, 0, 10.0), mk(0, 5, 20.0), mk(3, 0, 30.0)]);
        assert_eq!(counts.entity_count, 3);
        assert_eq!(counts.count_pop_zero, 2);
        assert_eq!(counts.count_track_zero, 2);
        assert_eq!(counts.count_both_zero, 1);
        assert_eq!(counts.avg_score, Some(20.0));
    }
}
