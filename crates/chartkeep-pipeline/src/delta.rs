use std::collections::HashMap;

use chartkeep_core::{EntityId, MetricDeltas, Movement, RankingEntry};

/// Merge movement against the preceding computed ranking set into `entries`.
///
/// Entities missing from `previous` are first appearances: every delta stays
/// `None` and the movement is `New`.
pub fn apply_deltas(entries: &mut [RankingEntry], previous: &[RankingEntry], rising_threshold: f64) {
    let prior: HashMap<EntityId, &RankingEntry> =
        previous.iter().map(|entry| (entry.entity_id, entry)).collect();

    for entry in entries.iter_mut() {
        match prior.get(&entry.entity_id) {
            Some(prev) => {
                let score_delta = entry.score - prev.score;
                entry.prev_rank = Some(prev.rank);
                entry.rank_delta = Some(i64::from(prev.rank) - i64::from(entry.rank));
                entry.prev_score = Some(prev.score);
                entry.score_delta = Some(score_delta);
                entry.metric_deltas = entry.metrics.delta_from(&prev.metrics);
                entry.movement = Movement::classify(Some(score_delta), rising_threshold);
            }
            None => {
                entry.prev_rank = None;
                entry.rank_delta = None;
                entry.prev_score = None;
                entry.score_delta = None;
                entry.metric_deltas = MetricDeltas::default();
                entry.movement = Movement::New;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartkeep_core::Metrics;
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    fn entry(n: u128, rank: u32, score: f64, popularity: i64) -> RankingEntry {
        RankingEntry {
            snapshot_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            entity_id: EntityId::new(Uuid::from_u128(n)),
            rank,
            prev_rank: None,
            rank_delta: None,
            score,
            prev_score: None,
            score_delta: None,
            movement: Movement::New,
            metrics: Metrics {
                popularity,
                ..Metrics::default()
            },
            metric_deltas: MetricDeltas::default(),
            algorithm_version: "popularity-v1".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn climbing_entity_gets_positive_rank_delta() {
        let previous = vec![entry(1, 1, 90.0, 90), entry(2, 2, 80.0, 80)];
        let mut today = vec![entry(2, 1, 185.0, 85), entry(1, 2, 70.0, 70)];
        apply_deltas(&mut today, &previous, 50.0);

        assert_eq!(today[0].prev_rank, Some(2));
        assert_eq!(today[0].rank_delta, Some(1));
        assert_eq!(today[0].score_delta, Some(105.0));
        assert_eq!(today[0].movement, Movement::Rising);
        assert_eq!(today[0].metric_deltas.popularity, Some(5));

        assert_eq!(today[1].rank_delta, Some(-1));
        assert_eq!(today[1].score_delta, Some(-20.0));
        assert_eq!(today[1].movement, Movement::Steady);
    }

    #[test]
    fn first_appearance_has_no_deltas() {
        let previous = vec![entry(1, 1, 90.0, 90)];
        let mut today = vec![entry(3, 1, 60.0, 60)];
        apply_deltas(&mut today, &previous, 50.0);
        assert!(today[0].is_first_appearance());
        assert_eq!(today[0].score_delta, None);
        assert!(today[0].metric_deltas.is_empty());
        assert_eq!(today[0].movement, Movement::New);
    }
}
