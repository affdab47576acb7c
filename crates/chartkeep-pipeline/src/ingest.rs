//! Bulk snapshot ingestion: each row is an independent idempotent upsert.

use std::sync::Arc;

use chartkeep_core::{EntityId, RowIssue, ServiceId, Snapshot};
use chartkeep_storage::{Store, StoreError, UpsertOutcome};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::PipelineError;
use crate::resolver::ResolvedRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RowOutcome {
    Inserted,
    Overwritten,
    /// Validated by a dry run; never written.
    Accepted,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowReport {
    pub service: ServiceId,
    pub external_id: String,
    pub entity_id: Option<EntityId>,
    #[serde(flatten)]
    pub outcome: RowOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub rows: Vec<RowReport>,
}

impl IngestReport {
    pub fn inserted(&self) -> u64 {
        self.count(|o| matches!(o, RowOutcome::Inserted))
    }

    pub fn overwritten(&self) -> u64 {
        self.count(|o| matches!(o, RowOutcome::Overwritten))
    }

    pub fn rejected(&self) -> u64 {
        self.count(|o| matches!(o, RowOutcome::Rejected { .. }))
    }

    pub fn accepted(&self) -> u64 {
        self.count(|o| matches!(o, RowOutcome::Accepted))
    }

    /// Rows that reached the snapshot store, or would have in a dry run.
    pub fn ingested(&self) -> u64 {
        self.inserted() + self.overwritten() + self.accepted()
    }

    pub fn issues(&self) -> Vec<RowIssue> {
        self.rows
            .iter()
            .filter_map(|r| match &r.outcome {
                RowOutcome::Rejected { reason } => Some(RowIssue {
                    service: r.service.clone(),
                    external_id: r.external_id.clone(),
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn push_rejected(&mut self, issues: &[RowIssue]) {
        self.rows.extend(issues.iter().map(|issue| RowReport {
            service: issue.service.clone(),
            external_id: issue.external_id.clone(),
            entity_id: None,
            outcome: RowOutcome::Rejected {
                reason: issue.reason.clone(),
            },
        }));
    }

    fn count(&self, pred: impl Fn(&RowOutcome) -> bool) -> u64 {
        self.rows.iter().filter(|r| pred(&r.outcome)).count() as u64
    }
}

/// Upsert every resolved row for `date`, at most `concurrency` at a time.
///
/// Constraint violations reject the row only. An unavailable store aborts the
/// batch once in-flight rows settle; rows already written stay written.
pub async fn ingest_rows(
    store: Arc<dyn Store>,
    date: NaiveDate,
    rows: Vec<ResolvedRow>,
    concurrency: usize,
    now: DateTime<Utc>,
) -> Result<IngestReport, PipelineError> {
    let limit = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (index, resolved) in rows.into_iter().enumerate() {
        let store = Arc::clone(&store);
        let limit = Arc::clone(&limit);
        tasks.spawn(async move {
            let _permit = limit.acquire_owned().await;
            let outcome = ingest_one(store.as_ref(), date, &resolved, now).await;
            (index, resolved, outcome)
        });
    }

    let mut settled = Vec::new();
    let mut unavailable: Option<String> = None;
    while let Some(joined) = tasks.join_next().await {
        let (index, resolved, outcome) =
            joined.map_err(|err| PipelineError::Other(anyhow::anyhow!("ingest task failed: {err}")))?;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(StoreError::Unavailable(message)) => {
                unavailable.get_or_insert(message.clone());
                RowOutcome::Rejected {
                    reason: format!("StorageUnavailable: {message}"),
                }
            }
            Err(err) => RowOutcome::Rejected {
                reason: err.to_string(),
            },
        };
        if let RowOutcome::Rejected { reason } = &outcome {
            warn!(service = %resolved.row.service, external_id = %resolved.row.external_id, %reason, "row rejected");
        }
        settled.push((
            index,
            RowReport {
                service: resolved.row.service,
                external_id: resolved.row.external_id,
                entity_id: Some(resolved.entity_id),
                outcome,
            },
        ));
    }

    if let Some(message) = unavailable {
        return Err(PipelineError::StorageUnavailable(message));
    }

    settled.sort_by_key(|(index, _)| *index);
    Ok(IngestReport {
        rows: settled.into_iter().map(|(_, report)| report).collect(),
    })
}

/// Dry-run counterpart of [`ingest_rows`]: the same per-row checks, no writes.
pub fn validate_rows(rows: &[ResolvedRow]) -> IngestReport {
    IngestReport {
        rows: rows
            .iter()
            .map(|resolved| RowReport {
                service: resolved.row.service.clone(),
                external_id: resolved.row.external_id.clone(),
                entity_id: Some(resolved.entity_id),
                outcome: match resolved.row.metrics.validate() {
                    Ok(()) => RowOutcome::Accepted,
                    Err(violation) => RowOutcome::Rejected {
                        reason: violation.to_string(),
                    },
                },
            })
            .collect(),
    }
}

async fn ingest_one(
    store: &dyn Store,
    date: NaiveDate,
    resolved: &ResolvedRow,
    now: DateTime<Utc>,
) -> Result<RowOutcome, StoreError> {
    if let Err(violation) = resolved.row.metrics.validate() {
        return Ok(RowOutcome::Rejected {
            reason: violation.to_string(),
        });
    }
    let upserted = store
        .upsert_snapshot(Snapshot {
            snapshot_date: date,
            entity_id: resolved.entity_id,
            service: resolved.row.service.clone(),
            external_id: resolved.row.external_id.clone(),
            metrics: resolved.row.metrics,
            created_at: now,
            updated_at: now,
        })
        .await?;
    Ok(match upserted.outcome {
        UpsertOutcome::Inserted => RowOutcome::Inserted,
        UpsertOutcome::Overwritten => RowOutcome::Overwritten,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartkeep_core::Metrics;
    use chartkeep_feed::FeedRow;
    use chartkeep_storage::{MemoryStore, SnapshotStore};
    use uuid::Uuid;

    fn resolved(external_id: &str, n: u128, popularity: i64) -> ResolvedRow {
        ResolvedRow {
            row: FeedRow {
                service: ServiceId::new("spotify"),
                external_id: external_id.to_string(),
                metrics: Metrics {
                    popularity,
                    followers: 10,
                    ..Metrics::default()
                },
            },
            entity_id: EntityId::new(Uuid::from_u128(n)),
        }
    }

    #[tokio::test]
    async fn reingesting_overwrites_without_duplicating() {
        let store = Arc::new(MemoryStore::new());
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let rows = vec![resolved("a", 1, 90), resolved("b", 2, 80)];

        let first = ingest_rows(store.clone(), date, rows.clone(), 2, Utc::now()).await.unwrap();
        assert_eq!(first.inserted(), 2);
        let before = store.snapshots_for(date).await.unwrap();

        let second = ingest_rows(store.clone(), date, rows, 2, Utc::now()).await.unwrap();
        assert_eq!(second.overwritten(), 2);
        let after = store.snapshots_for(date).await.unwrap();
        assert_eq!(after.len(), 2);
        let metrics = |s: &[Snapshot]| s.iter().map(|s| s.metrics).collect::<Vec<_>>();
        assert_eq!(metrics(&before), metrics(&after));
    }

    #[tokio::test]
    async fn negative_metrics_reject_only_that_row() {
        let store = Arc::new(MemoryStore::new());
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let rows = vec![resolved("a", 1, 90), resolved("bad", 2, -5), resolved("c", 3, 70)];

        let report = ingest_rows(store.clone(), date, rows, 1, Utc::now()).await.unwrap();
        assert_eq!(report.ingested(), 2);
        assert_eq!(report.rejected(), 1);
        assert_eq!(report.rows[1].external_id, "bad");
        assert!(report.issues()[0].reason.contains("popularity"));
        assert_eq!(store.snapshots_for(date).await.unwrap().len(), 2);
    }

    #[test]
    fn validation_only_reports_accepted_rows() {
        let report = validate_rows(&[resolved("a", 1, 90), resolved("bad", 2, -1)]);
        assert_eq!(report.accepted(), 1);
        assert_eq!(report.ingested(), 1);
        assert_eq!(report.rejected(), 1);
        assert_eq!(report.inserted(), 0);
    }
}
