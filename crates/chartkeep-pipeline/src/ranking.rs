//! Ranking engine: score a day's snapshots, order them, and attach movement.

use std::sync::Arc;

use chartkeep_core::{DailyStats, MetricDeltas, Movement, RankingEntry, Snapshot, StatsCounts};
use chartkeep_storage::Store;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::info;
use uuid::Uuid;

use crate::delta::apply_deltas;
use crate::error::PipelineError;
use crate::scoring::ScoringModel;

/// Score and order snapshots. Ties on score break by entity id ascending.
pub fn rank_snapshots(
    snapshots: &[Snapshot],
    model: &dyn ScoringModel,
    created_at: DateTime<Utc>,
) -> Vec<RankingEntry> {
    let mut scored: Vec<(&Snapshot, f64)> = snapshots
        .iter()
        .map(|snapshot| (snapshot, model.score(&snapshot.metrics)))
        .collect();
    scored.sort_by(|(a, score_a), (b, score_b)| {
        score_b
            .total_cmp(score_a)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });

    scored
        .into_iter()
        .enumerate()
        .map(|(index, (snapshot, score))| RankingEntry {
            snapshot_date: snapshot.snapshot_date,
            entity_id: snapshot.entity_id,
            rank: index as u32 + 1,
            prev_rank: None,
            rank_delta: None,
            score,
            prev_score: None,
            score_delta: None,
            movement: Movement::New,
            metrics: snapshot.metrics,
            metric_deltas: MetricDeltas::default(),
            algorithm_version: model.version().to_string(),
            created_at,
        })
        .collect()
}

/// A ranking set computed for one date but not yet published.
#[derive(Debug, Clone)]
pub struct ComputedRanking {
    pub snapshot_date: NaiveDate,
    pub previous_date: Option<NaiveDate>,
    pub entries: Vec<RankingEntry>,
    pub stats: DailyStats,
}

pub struct RankingEngine {
    store: Arc<dyn Store>,
    rising_threshold: f64,
}

impl RankingEngine {
    pub fn new(store: Arc<dyn Store>, rising_threshold: f64) -> Self {
        Self {
            store,
            rising_threshold,
        }
    }

    pub async fn compute(
        &self,
        date: NaiveDate,
        model: &dyn ScoringModel,
        now: DateTime<Utc>,
    ) -> Result<ComputedRanking, PipelineError> {
        let snapshots = self.store.snapshots_for(date).await?;
        self.compute_from_snapshots(date, &snapshots, model, now).await
    }

    /// Rank an explicit snapshot set against the stored history. Dry runs use
    /// this with feed rows overlaid on what the store holds.
    pub async fn compute_from_snapshots(
        &self,
        date: NaiveDate,
        snapshots: &[Snapshot],
        model: &dyn ScoringModel,
        now: DateTime<Utc>,
    ) -> Result<ComputedRanking, PipelineError> {
        if snapshots.is_empty() {
            return Err(PipelineError::NoData(format!("no snapshots for {date}")));
        }

        let mut entries = rank_snapshots(snapshots, model, now);
        let previous_date = self.store.latest_ranking_date_before(date).await?;
        let previous = match previous_date {
            Some(prev) => self.store.rankings_for(prev).await?,
            None => Vec::new(),
        };
        apply_deltas(&mut entries, &previous, self.rising_threshold);

        let stats = DailyStats {
            snapshot_date: date,
            current: StatsCounts::from_entries(&entries),
            previous_date,
            previous: previous_date.map(|_| StatsCounts::from_entries(&previous)),
        };
        info!(
            %date,
            entities = entries.len(),
            previous_date = ?previous_date,
            algorithm = model.version(),
            "ranking computed"
        );
        Ok(ComputedRanking {
            snapshot_date: date,
            previous_date,
            entries,
            stats,
        })
    }

    /// Replace the date's ranking set and its stats row on behalf of a running run.
    pub async fn publish(&self, run_id: Uuid, computed: &ComputedRanking) -> Result<u64, PipelineError> {
        let written = self
            .store
            .publish_rankings(run_id, computed.snapshot_date, &computed.entries)
            .await?;
        self.store.upsert_daily_stats(&computed.stats).await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::PopularityModel;
    use chartkeep_core::{EntityId, Metrics, ServiceId};
    use uuid::Uuid;

    fn snapshot(n: u128, popularity: i64) -> Snapshot {
        let now = Utc::now();
        Snapshot {
            snapshot_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            entity_id: EntityId::new(Uuid::from_u128(n)),
            service: ServiceId::new("spotify"),
            external_id: format!("ext-{n}"),
            metrics: Metrics {
                popularity,
                ..Metrics::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn ties_break_by_entity_id_and_ranks_are_contiguous() {
        let snapshots = vec![snapshot(9, 50), snapshot(3, 70), snapshot(5, 50), snapshot(1, 10)];
        let ranked = rank_snapshots(&snapshots, &PopularityModel, Utc::now());
        let order: Vec<u128> = ranked.iter().map(|e| e.entity_id.as_uuid().as_u128()).collect();
        assert_eq!(order, vec![3, 5, 9, 1]);
        let ranks: Vec<u32> = ranked.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
        assert!(ranked.iter().all(|e| e.algorithm_version == "popularity-v1"));
    }

    #[test]
    fn input_order_does_not_change_the_ranking() {
        let forward = vec![snapshot(1, 40), snapshot(2, 40), snapshot(3, 40)];
        let mut backward = forward.clone();
        backward.reverse();
        let a = rank_snapshots(&forward, &PopularityModel, Utc::now());
        let b = rank_snapshots(&backward, &PopularityModel, Utc::now());
        let key = |v: &[RankingEntry]| v.iter().map(|e| (e.entity_id, e.rank)).collect::<Vec<_>>();
        assert_eq!(key(&a), key(&b));
    }
}
