//! Weekly and cumulative rollups derived from published daily ranking sets.
//! Rollups are never frozen and never write daily rows.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chartkeep_core::{CumulativeRankingEntry, EntityId, Movement, RankingEntry, WeeklyRankingEntry};
use chartkeep_storage::{ScoreTotal, Store};
use chrono::{DateTime, Days, NaiveDate, Utc};
use tracing::info;

use crate::error::PipelineError;
use crate::ledger::Clock;

pub const WEEK_DAYS: u64 = 7;

fn prior_ranks<T>(previous: &[T], key: impl Fn(&T) -> (EntityId, u32)) -> HashMap<EntityId, u32> {
    previous.iter().map(key).collect()
}

fn rank_delta(prev_rank: Option<u32>, rank: u32) -> Option<i64> {
    prev_rank.map(|prev| i64::from(prev) - i64::from(rank))
}

#[derive(Debug, Default)]
struct WeekAccumulator {
    total: f64,
    days: u32,
    latest: Option<(NaiveDate, i64)>,
}

/// Aggregate the daily entries of `[week_end - 6, week_end]`.
pub fn build_weekly(
    week_end: NaiveDate,
    daily: &[RankingEntry],
    previous: &[WeeklyRankingEntry],
    created_at: DateTime<Utc>,
) -> Vec<WeeklyRankingEntry> {
    let week_start = week_end - Days::new(WEEK_DAYS - 1);
    let mut by_entity: BTreeMap<EntityId, WeekAccumulator> = BTreeMap::new();
    for entry in daily
        .iter()
        .filter(|e| e.snapshot_date >= week_start && e.snapshot_date <= week_end)
    {
        let acc = by_entity.entry(entry.entity_id).or_default();
        acc.total += entry.score;
        acc.days += 1;
        if acc.latest.map_or(true, |(date, _)| entry.snapshot_date > date) {
            acc.latest = Some((entry.snapshot_date, entry.metrics.popularity));
        }
    }

    let mut totals: Vec<(EntityId, WeekAccumulator)> = by_entity.into_iter().collect();
    totals.sort_by(|(a, acc_a), (b, acc_b)| acc_b.total.total_cmp(&acc_a.total).then_with(|| a.cmp(b)));

    let prior = prior_ranks(previous, |e| (e.entity_id, e.rank));
    totals
        .into_iter()
        .enumerate()
        .map(|(index, (entity_id, acc))| {
            let rank = index as u32 + 1;
            let prev_rank = prior.get(&entity_id).copied();
            let delta = rank_delta(prev_rank, rank);
            WeeklyRankingEntry {
                week_end_date: week_end,
                entity_id,
                rank,
                prev_rank,
                rank_delta: delta,
                total_score: acc.total,
                average_score: acc.total / f64::from(acc.days.max(1)),
                days_counted: acc.days,
                latest_popularity: acc.latest.map(|(_, popularity)| popularity),
                movement: Movement::from_rank_delta(delta),
                created_at,
            }
        })
        .collect()
}

/// Re-rank running totals through `date`.
pub fn build_cumulative(
    date: NaiveDate,
    totals: &[ScoreTotal],
    today: &[RankingEntry],
    previous: &[CumulativeRankingEntry],
    created_at: DateTime<Utc>,
) -> Vec<CumulativeRankingEntry> {
    let day_scores: HashMap<EntityId, f64> = today.iter().map(|e| (e.entity_id, e.score)).collect();
    let mut sorted: Vec<&ScoreTotal> = totals.iter().collect();
    sorted.sort_by(|a, b| {
        b.total_score
            .total_cmp(&a.total_score)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });

    let prior = prior_ranks(previous, |e| (e.entity_id, e.rank));
    sorted
        .into_iter()
        .enumerate()
        .map(|(index, total)| {
            let rank = index as u32 + 1;
            let prev_rank = prior.get(&total.entity_id).copied();
            CumulativeRankingEntry {
                snapshot_date: date,
                entity_id: total.entity_id,
                rank,
                prev_rank,
                rank_delta: rank_delta(prev_rank, rank),
                cumulative_score: total.total_score,
                day_score: day_scores.get(&total.entity_id).copied(),
                days_counted: total.days_counted,
                created_at,
            }
        })
        .collect()
}

pub struct RollupAggregator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl RollupAggregator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn compute_weekly(&self, week_end: NaiveDate) -> Result<Vec<WeeklyRankingEntry>, PipelineError> {
        let week_start = week_end - Days::new(WEEK_DAYS - 1);
        let daily = self.store.rankings_between(week_start, week_end).await?;
        if daily.is_empty() {
            return Err(PipelineError::NoData(format!(
                "no daily rankings between {week_start} and {week_end}"
            )));
        }
        let previous = self
            .store
            .weekly_for(week_end - Days::new(WEEK_DAYS))
            .await?;
        let entries = build_weekly(week_end, &daily, &previous, self.clock.now());
        let written = self.store.publish_weekly(week_end, &entries).await?;
        info!(%week_end, written, "weekly rollup published");
        Ok(entries)
    }

    pub async fn compute_cumulative(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<CumulativeRankingEntry>, PipelineError> {
        let totals = self.store.score_totals_through(date).await?;
        if totals.is_empty() {
            return Err(PipelineError::NoData(format!("no daily rankings on or before {date}")));
        }
        let today = self.store.rankings_for(date).await?;
        let previous = match self.store.latest_cumulative_date_before(date).await? {
            Some(prev) => self.store.cumulative_for(prev).await?,
            None => Vec::new(),
        };
        let entries = build_cumulative(date, &totals, &today, &previous, self.clock.now());
        let written = self.store.publish_cumulative(date, &entries).await?;
        info!(%date, written, "cumulative rollup published");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartkeep_core::{MetricDeltas, Metrics};
    use uuid::Uuid;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn id(n: u128) -> EntityId {
        EntityId::new(Uuid::from_u128(n))
    }

    fn daily(d: u32, n: u128, rank: u32, score: f64, popularity: i64) -> RankingEntry {
        RankingEntry {
            snapshot_date: day(d),
            entity_id: id(n),
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
    fn weekly_window_sums_averages_and_ignores_outside_days() {
        let rows = vec![
            daily(1, 1, 1, 100.0, 60), // outside the window ending 3/8
            daily(2, 1, 1, 90.0, 61),
            daily(3, 1, 2, 50.0, 58),
            daily(2, 2, 2, 80.0, 70),
            daily(3, 2, 1, 80.0, 72),
            daily(8, 2, 1, 80.0, 75),
        ];
        let weekly = build_weekly(day(8), &rows, &[], Utc::now());
        assert_eq!(weekly.len(), 2);
        assert_eq!(weekly[0].entity_id, id(2));
        assert_eq!(weekly[0].total_score, 240.0);
        assert_eq!(weekly[0].days_counted, 3);
        assert_eq!(weekly[0].average_score, 80.0);
        assert_eq!(weekly[0].latest_popularity, Some(75));
        assert_eq!(weekly[1].total_score, 140.0);
        assert_eq!(weekly[1].average_score, 70.0);
        assert!(weekly.iter().all(|w| w.movement == Movement::New && w.prev_rank.is_none()));
        assert_eq!(weekly[0].week_start_date(), day(2));
    }

    #[test]
    fn weekly_rank_delta_uses_prior_week() {
        let prior = build_weekly(day(1), &[daily(1, 1, 1, 10.0, 1), daily(1, 2, 2, 5.0, 1)], &[], Utc::now());
        let rows = vec![daily(8, 1, 2, 1.0, 1), daily(8, 2, 1, 9.0, 1)];
        let weekly = build_weekly(day(8), &rows, &prior, Utc::now());
        assert_eq!(weekly[0].entity_id, id(2));
        assert_eq!(weekly[0].rank_delta, Some(1));
        assert_eq!(weekly[0].movement, Movement::Rising);
        assert_eq!(weekly[1].rank_delta, Some(-1));
    }

    #[test]
    fn cumulative_reranks_running_totals() {
        let totals = vec![
            ScoreTotal { entity_id: id(1), total_score: 160.0, days_counted: 2 },
            ScoreTotal { entity_id: id(2), total_score: 165.0, days_counted: 2 },
            ScoreTotal { entity_id: id(3), total_score: 60.0, days_counted: 1 },
        ];
        let today = vec![daily(2, 2, 1, 85.0, 85), daily(2, 1, 2, 70.0, 70), daily(2, 3, 3, 60.0, 60)];
        let previous = vec![CumulativeRankingEntry {
            snapshot_date: day(1),
            entity_id: id(1),
            rank: 1,
            prev_rank: None,
            rank_delta: None,
            cumulative_score: 90.0,
            day_score: Some(90.0),
            days_counted: 1,
            created_at: Utc::now(),
        }];
        let cumulative = build_cumulative(day(2), &totals, &today, &previous, Utc::now());
        let order: Vec<EntityId> = cumulative.iter().map(|c| c.entity_id).collect();
        assert_eq!(order, vec![id(2), id(1), id(3)]);
        assert_eq!(cumulative[1].prev_rank, Some(1));
        assert_eq!(cumulative[1].rank_delta, Some(-1));
        assert_eq!(cumulative[0].prev_rank, None);
        assert_eq!(cumulative[2].day_score, Some(60.0));
    }
}
