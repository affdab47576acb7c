//! Versioned scoring models. A model is a pure function of one day's metrics.

use chartkeep_core::Metrics;

use crate::config::{ScoringPolicy, ScoringWeights};
use crate::error::PipelineError;

pub const POPULARITY_V1: &str = "popularity-v1";
pub const WEIGHTED_V1: &str = "weighted-v1";
pub const KNOWN_VERSIONS: &[&str] = &[POPULARITY_V1, WEIGHTED_V1];

pub trait ScoringModel: Send + Sync {
    /// Stamped on every run and ranking row the model produces.
    fn version(&self) -> &str;
    fn score(&self, metrics: &Metrics) -> f64;
}

/// Raw popularity as the score.
#[derive(Debug, Default, Clone, Copy)]
pub struct PopularityModel;

impl ScoringModel for PopularityModel {
    fn version(&self) -> &str {
        POPULARITY_V1
    }

    fn score(&self, metrics: &Metrics) -> f64 {
        metrics.popularity as f64
    }
}

#[derive(Debug, Clone)]
pub struct WeightedModel {
    weights: ScoringWeights,
    points_scale: f64,
    low_popularity_cutoff: i64,
}

impl WeightedModel {
    pub fn new(policy: &ScoringPolicy) -> Self {
        Self {
            weights: policy.weights.clone(),
            points_scale: policy.points_scale,
            low_popularity_cutoff: policy.low_popularity_cutoff,
        }
    }
}

impl ScoringModel for WeightedModel {
    fn version(&self) -> &str {
        WEIGHTED_V1
    }

    fn score(&self, metrics: &Metrics) -> f64 {
        if metrics.popularity <= self.low_popularity_cutoff {
            return 0.0;
        }
        let w = &self.weights;
        let followers = ((metrics.followers.max(0) as f64) + 1.0).log10();
        let raw = metrics.popularity as f64 * w.popularity
            + followers * w.followers
            + metrics.track_popularity_sum as f64 * w.track_popularity_sum
            + metrics.release_count as f64 * w.release_count;
        raw * self.points_scale
    }
}

/// Resolve a model by version; `override_version` wins over the policy's choice.
pub fn model_for(
    policy: &ScoringPolicy,
    override_version: Option<&str>,
) -> Result<Box<dyn ScoringModel>, PipelineError> {
    let version = override_version.unwrap_or(&policy.version).trim();
    match version {
        POPULARITY_V1 => Ok(Box::new(PopularityModel)),
        WEIGHTED_V1 => Ok(Box::new(WeightedModel::new(policy))),
        other => Err(PipelineError::Config(format!(
            "unknown algorithm version `{other}` (known: {})",
            KNOWN_VERSIONS.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(popularity: i64, followers: i64, tps: i64, releases: i64) -> Metrics {
        Metrics {
            popularity,
            followers,
            track_popularity_sum: tps,
            release_count: releases,
        }
    }

    #[test]
    fn weighted_model_zeroes_low_popularity() {
        let model = WeightedModel::new(&ScoringPolicy::default());
        assert_eq!(model.score(&metrics(2, 1_000_000, 500, 3)), 0.0);
        assert!(model.score(&metrics(3, 0, 0, 0)) > 0.0);
    }

    #[test]
    fn weighted_model_applies_weights_and_scale() {
        let model = WeightedModel::new(&ScoringPolicy::default());
        // (50*3 + log10(100)*2 + 200*1 + 1*0.3) * 10
        let score = model.score(&metrics(50, 99, 200, 1));
        assert!((score - 3543.0).abs() < 1e-9, "score was {score}");
    }

    #[test]
    fn override_version_selects_model() {
        let policy = ScoringPolicy::default();
        assert_eq!(model_for(&policy, None).unwrap().version(), WEIGHTED_V1);
        let model = model_for(&policy, Some("popularity-v1")).unwrap();
        assert_eq!(model.version(), POPULARITY_V1);
        assert_eq!(model.score(&metrics(77, 5, 5, 5)), 77.0);
        assert!(matches!(
            model_for(&policy, Some("nope")),
            Err(PipelineError::Config(_))
        ));
    }
}
