use std::path::{Path, PathBuf};
use std::time::Duration;

use chartkeep_storage::HttpClientConfig;
use chrono::{DateTime, Days, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::scoring;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub policy_path: PathBuf,
    pub state_file: PathBuf,
    pub concurrency: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            artifacts_dir: PathBuf::from("./artifacts"),
            reports_dir: PathBuf::from("./reports"),
            policy_path: PathBuf::from("./config/policy.yaml"),
            state_file: PathBuf::from("./state/chartkeep.json"),
            concurrency: 8,
            http_timeout_secs: 20,
            user_agent: "chartkeep/0.1".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            artifacts_dir: std::env::var("CHARTKEEP_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            reports_dir: std::env::var("CHARTKEEP_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            policy_path: std::env::var("CHARTKEEP_POLICY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.policy_path),
            state_file: std::env::var("CHARTKEEP_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_file),
            concurrency: std::env::var("CHARTKEEP_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.concurrency),
            http_timeout_secs: std::env::var("CHARTKEEP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("CHARTKEEP_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            concurrency: self.concurrency,
            ..Default::default()
        }
    }

    pub fn load_policy(&self) -> Result<Policy, PipelineError> {
        Policy::load(&self.policy_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub popularity: f64,
    pub followers: f64,
    pub track_popularity_sum: f64,
    pub release_count: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            popularity: 3.0,
            followers: 2.0,
            track_popularity_sum: 1.0,
            release_count: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub version: String,
    pub weights: ScoringWeights,
    pub points_scale: f64,
    /// Entities at or below this popularity score zero under `weighted-v1`.
    pub low_popularity_cutoff: i64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            version: scoring::WEIGHTED_V1.to_string(),
            weights: ScoringWeights::default(),
            points_scale: 10.0,
            low_popularity_cutoff: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezePolicy {
    pub adjustment_window_hours: i64,
    pub business_utc_offset_minutes: i32,
}

impl Default for FreezePolicy {
    fn default() -> Self {
        Self {
            adjustment_window_hours: 48,
            business_utc_offset_minutes: 540,
        }
    }
}

/// Upper bound on `adjustment_window_hours`: one leap year.
pub const MAX_ADJUSTMENT_WINDOW_HOURS: i64 = 366 * 24;

impl FreezePolicy {
    pub fn business_offset(&self) -> Result<FixedOffset, PipelineError> {
        self.business_utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "business_utc_offset_minutes out of range: {}",
                    self.business_utc_offset_minutes
                ))
            })
    }

    /// End of the business day `date` plus the adjustment window.
    pub fn deadline(&self, date: NaiveDate) -> Result<DateTime<Utc>, PipelineError> {
        let offset = self.business_offset()?;
        let next_day = date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| PipelineError::Config(format!("date out of range: {date}")))?;
        let midnight = offset
            .from_local_datetime(&next_day.and_time(chrono::NaiveTime::MIN))
            .single()
            .ok_or_else(|| PipelineError::Config(format!("no local midnight after {date}")))?;
        chrono::Duration::try_hours(self.adjustment_window_hours)
            .and_then(|window| midnight.with_timezone(&Utc).checked_add_signed(window))
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "adjustment window of {} hours overflows the deadline of {date}",
                    self.adjustment_window_hours
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub scoring: ScoringPolicy,
    pub freeze: FreezePolicy,
    pub rising_threshold: f64,
    pub min_publish_ratio: f64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            scoring: ScoringPolicy::default(),
            freeze: FreezePolicy::default(),
            rising_threshold: 50.0,
            min_publish_ratio: 0.5,
        }
    }
}

impl Policy {
    /// A missing file yields the defaults; a malformed one is a configuration error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "policy file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|err| PipelineError::Config(format!("reading {}: {err}", path.display())))?;
        Self::from_yaml(&text)
            .map_err(|err| PipelineError::Config(format!("{}: {err}", path.display())))
    }

    pub fn from_yaml(text: &str) -> Result<Self, PipelineError> {
        let policy: Self = serde_yaml::from_str(text)
            .map_err(|err| PipelineError::Config(format!("parsing policy: {err}")))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::Config(msg));
        if !scoring::KNOWN_VERSIONS.contains(&self.scoring.version.as_str()) {
            return invalid(format!("unknown scoring version `{}`", self.scoring.version));
        }
        let w = &self.scoring.weights;
        if ![w.popularity, w.followers, w.track_popularity_sum, w.release_count]
            .iter()
            .all(|v| v.is_finite())
        {
            return invalid("scoring weights must be finite".to_string());
        }
        if !(self.scoring.points_scale.is_finite() && self.scoring.points_scale > 0.0) {
            return invalid(format!("points_scale must be positive, got {}", self.scoring.points_scale));
        }
        if !(self.rising_threshold.is_finite() && self.rising_threshold >= 0.0) {
            return invalid(format!("rising_threshold must be non-negative, got {}", self.rising_threshold));
        }
        if !(0.0..=1.0).contains(&self.min_publish_ratio) {
            return invalid(format!("min_publish_ratio must be within 0..=1, got {}", self.min_publish_ratio));
        }
        if !(0..=MAX_ADJUSTMENT_WINDOW_HOURS).contains(&self.freeze.adjustment_window_hours) {
            return invalid(format!(
                "adjustment_window_hours must be within 0..={MAX_ADJUSTMENT_WINDOW_HOURS}, got {}",
                self.freeze.adjustment_window_hours
            ));
        }
        self.freeze.business_offset()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn partial_policy_files_fall_back_to_defaults() {
        let policy = Policy::from_yaml("rising_threshold: 5\nscoring:\n  version: popularity-v1\n").unwrap();
        assert_eq!(policy.rising_threshold, 5.0);
        assert_eq!(policy.scoring.version, "popularity-v1");
        assert_eq!(policy.scoring.points_scale, 10.0);
        assert_eq!(policy.freeze, FreezePolicy::default());
        assert_eq!(policy.min_publish_ratio, 0.5);
    }

    #[test]
    fn unknown_scoring_versions_are_rejected() {
        let err = Policy::from_yaml("scoring:\n  version: magic-v9\n").unwrap_err();
        assert!(matches!(err, PipelineError::Config(msg) if msg.contains("magic-v9")));
        assert!(Policy::from_yaml("min_publish_ratio: 1.5\n").is_err());
    }

    #[test]
    fn missing_policy_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let policy = Policy::load(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(policy, Policy::default());
    }

    #[test]
    fn deadline_is_business_midnight_plus_window() {
        let freeze = FreezePolicy::default();
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        // 2026-03-02T00:00+09:00 is 2026-03-01T15:00Z, plus 48h.
        assert_eq!(
            freeze.deadline(date).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 3, 15, 0, 0).unwrap()
        );

        let utc_no_window = FreezePolicy {
            adjustment_window_hours: 0,
            business_utc_offset_minutes: 0,
        };
        assert_eq!(
            utc_no_window.deadline(date).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn oversized_windows_are_config_errors_not_panics() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let huge = FreezePolicy {
            adjustment_window_hours: i64::MAX,
            ..FreezePolicy::default()
        };
        assert!(matches!(huge.deadline(date), Err(PipelineError::Config(_))));

        let wild_offset = FreezePolicy {
            business_utc_offset_minutes: i32::MAX,
            ..FreezePolicy::default()
        };
        assert!(matches!(wild_offset.deadline(date), Err(PipelineError::Config(_))));

        let err = Policy::from_yaml("freeze:\n  adjustment_window_hours: 9223372036854775807\n").unwrap_err();
        assert!(matches!(err, PipelineError::Config(msg) if msg.contains("adjustment_window_hours")));
        assert!(Policy::from_yaml("freeze:\n  adjustment_window_hours: 8784\n").is_ok());
    }

    #[test]
    fn workspace_policy_file_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/policy.yaml");
        let policy = Policy::load(path).unwrap();
        assert_eq!(policy, Policy::default());
    }
}
