//! Maps feed rows keyed by external ids onto canonical entities.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chartkeep_core::{EntityId, RowIssue, ServiceId};
use chartkeep_feed::FeedRow;
use chartkeep_storage::IdentityAuthority;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRow {
    pub row: FeedRow,
    pub entity_id: EntityId,
}

/// A data-integrity fault that halts ingestion for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateFault {
    pub service: ServiceId,
    pub external_ids: Vec<String>,
    pub detail: String,
}

impl DuplicateFault {
    pub fn to_error(&self) -> PipelineError {
        PipelineError::DuplicateIdentity {
            service: self.service.clone(),
            detail: self.detail.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchResolution {
    pub resolved: Vec<ResolvedRow>,
    /// Rows without a mapping; excluded from ingestion.
    pub unresolved: Vec<RowIssue>,
    pub duplicates: Vec<DuplicateFault>,
    /// Rows of services halted by a duplicate fault.
    pub halted: Vec<RowIssue>,
}

impl BatchResolution {
    pub fn halted_services(&self) -> BTreeSet<ServiceId> {
        self.duplicates.iter().map(|f| f.service.clone()).collect()
    }
}

pub struct IdentityResolver {
    authority: Arc<dyn IdentityAuthority>,
}

impl IdentityResolver {
    pub fn new(authority: Arc<dyn IdentityAuthority>) -> Self {
        Self { authority }
    }

    pub async fn resolve(
        &self,
        service: &ServiceId,
        external_id: &str,
    ) -> Result<EntityId, PipelineError> {
        let mappings = self
            .authority
            .lookup(service, &[external_id.to_string()])
            .await?;
        let entities: BTreeSet<EntityId> = mappings.iter().map(|m| m.entity_id).collect();
        let count = entities.len();
        let mut iter = entities.into_iter();
        match (iter.next(), iter.next()) {
            (None, _) => Err(PipelineError::UnresolvedIdentity {
                service: service.clone(),
                external_id: external_id.to_string(),
            }),
            (Some(entity_id), None) => Ok(entity_id),
            (Some(_), Some(_)) => Err(PipelineError::DuplicateIdentity {
                service: service.clone(),
                detail: format!("{external_id} maps to {count} entities"),
            }),
        }
    }

    /// One authority lookup per service for the whole day's rows.
    pub async fn resolve_batch(&self, rows: &[FeedRow]) -> Result<BatchResolution, PipelineError> {
        let mut by_service: BTreeMap<ServiceId, Vec<&FeedRow>> = BTreeMap::new();
        for row in rows {
            by_service.entry(row.service.clone()).or_default().push(row);
        }

        let mut out = BatchResolution::default();
        let mut candidates: Vec<ResolvedRow> = Vec::new();

        for (service, service_rows) in &by_service {
            let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
            for row in service_rows {
                *seen.entry(row.external_id.as_str()).or_default() += 1;
            }
            let repeated: Vec<String> = seen
                .iter()
                .filter(|(_, count)| **count > 1)
                .map(|(id, _)| id.to_string())
                .collect();
            if !repeated.is_empty() {
                out.duplicates.push(DuplicateFault {
                    service: service.clone(),
                    detail: format!("external ids repeated in feed: {}", repeated.join(", ")),
                    external_ids: repeated,
                });
            }

            let ids: Vec<String> = seen.keys().map(|id| id.to_string()).collect();
            let mappings = self.authority.lookup(service, &ids).await?;
            let mut entities_by_id: BTreeMap<&str, BTreeSet<EntityId>> = BTreeMap::new();
            for mapping in &mappings {
                entities_by_id
                    .entry(mapping.external_id.as_str())
                    .or_default()
                    .insert(mapping.entity_id);
            }

            let ambiguous: Vec<String> = entities_by_id
                .iter()
                .filter(|(_, entities)| entities.len() > 1)
                .map(|(id, _)| id.to_string())
                .collect();
            if !ambiguous.is_empty() {
                out.duplicates.push(DuplicateFault {
                    service: service.clone(),
                    detail: format!("external ids mapped to several entities: {}", ambiguous.join(", ")),
                    external_ids: ambiguous,
                });
            }

            for row in service_rows {
                match entities_by_id
                    .get(row.external_id.as_str())
                    .and_then(|entities| entities.iter().next())
                {
                    Some(entity_id) => candidates.push(ResolvedRow {
                        row: (*row).clone(),
                        entity_id: *entity_id,
                    }),
                    None => {
                        warn!(%service, external_id = %row.external_id, "unresolved identity");
                        out.unresolved.push(RowIssue {
                            service: service.clone(),
                            external_id: row.external_id.clone(),
                            reason: format!("UnresolvedIdentity: no mapping for {service}/{}", row.external_id),
                        });
                    }
                }
            }
        }

        // Two distinct external ids landing on one entity would collapse onto one snapshot key.
        let mut claims: BTreeMap<EntityId, Vec<&ResolvedRow>> = BTreeMap::new();
        for candidate in &candidates {
            claims.entry(candidate.entity_id).or_default().push(candidate);
        }
        for (entity_id, claimants) in &claims {
            let keys: BTreeSet<(&ServiceId, &str)> = claimants
                .iter()
                .map(|c| (&c.row.service, c.row.external_id.as_str()))
                .collect();
            if keys.len() < 2 {
                continue;
            }
            let services: BTreeSet<&ServiceId> = keys.iter().map(|(s, _)| *s).collect();
            for service in services {
                out.duplicates.push(DuplicateFault {
                    service: service.clone(),
                    external_ids: keys
                        .iter()
                        .filter(|(s, _)| *s == service)
                        .map(|(_, id)| id.to_string())
                        .collect(),
                    detail: format!(
                        "entity {entity_id} claimed by {}",
                        keys.iter()
                            .map(|(s, id)| format!("{s}/{id}"))
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                });
            }
        }

        let halted = out.halted_services();
        for candidate in candidates {
            if halted.contains(&candidate.row.service) {
                out.halted.push(RowIssue {
                    service: candidate.row.service.clone(),
                    external_id: candidate.row.external_id.clone(),
                    reason: format!("DuplicateIdentity: service {} halted", candidate.row.service),
                });
            } else {
                out.resolved.push(candidate);
            }
        }
        for fault in &out.duplicates {
            warn!(service = %fault.service, detail = %fault.detail, "duplicate identity");
        }
        info!(
            resolved = out.resolved.len(),
            unresolved = out.unresolved.len(),
            halted = out.halted.len(),
            "identity resolution finished"
        );
        Ok(out)
    }
}
