//! Daily measurement feed contract and the adapters that load it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chartkeep_core::{EntityId, ExternalIdentityMapping, Metrics, ServiceId};
use chartkeep_storage::{feed_digest, FetchError, HttpFetcher};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "chartkeep-feed";

/// One measurement as delivered by the upstream feed, still keyed by the external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRow {
    pub service: ServiceId,
    pub external_id: String,
    #[serde(flatten)]
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedDocument {
    pub snapshot_date: NaiveDate,
    #[serde(default)]
    pub source: Option<String>,
    pub rows: Vec<FeedRow>,
}

impl FeedDocument {
    pub fn services(&self) -> BTreeSet<ServiceId> {
        self.rows.iter().map(|row| row.service.clone()).collect()
    }
}

/// A parsed feed together with the exact bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct FeedPayload {
    pub document: FeedDocument,
    pub raw: Vec<u8>,
    pub location: String,
    pub content_type: Option<String>,
}

impl FeedPayload {
    pub fn digest(&self) -> String {
        feed_digest(&self.raw)
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("reading feed {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing feed {location}: {source}")]
    Parse {
        location: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid feed: {0}")]
    Invalid(String),
    #[error("feed is dated {found} but the run targets {expected}")]
    DateMismatch { expected: NaiveDate, found: NaiveDate },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    JsonFile,
    HttpJson,
}

#[async_trait]
pub trait FeedAdapter: Send + Sync {
    fn kind(&self) -> FeedKind;
    fn location(&self) -> &str;
    async fn load(&self, run_id: Uuid) -> Result<FeedPayload, FeedError>;
}

pub struct JsonFileFeed {
    path: PathBuf,
    location: String,
}

impl JsonFileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let location = path.display().to_string();
        Self { path, location }
    }
}

#[async_trait]
impl FeedAdapter for JsonFileFeed {
    fn kind(&self) -> FeedKind {
        FeedKind::JsonFile
    }

    fn location(&self) -> &str {
        &self.location
    }

    async fn load(&self, _run_id: Uuid) -> Result<FeedPayload, FeedError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|source| FeedError::Io {
            path: self.path.clone(),
            source,
        })?;
        let document = parse_feed(&self.location, &raw)?;
        Ok(FeedPayload {
            document,
            raw,
            location: self.location.clone(),
            content_type: Some("application/json".to_string()),
        })
    }
}

pub struct HttpJsonFeed {
    url: String,
    http: Arc<HttpFetcher>,
}

impl HttpJsonFeed {
    pub fn new(url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl FeedAdapter for HttpJsonFeed {
    fn kind(&self) -> FeedKind {
        FeedKind::HttpJson
    }

    fn location(&self) -> &str {
        &self.url
    }

    async fn load(&self, run_id: Uuid) -> Result<FeedPayload, FeedError> {
        let fetched = self.http.fetch_feed(run_id, &self.url).await?;
        let document = parse_feed(&fetched.url, &fetched.body)?;
        Ok(FeedPayload {
            document,
            raw: fetched.body,
            location: fetched.url,
            content_type: fetched.content_type,
        })
    }
}

pub fn is_remote_location(location: &str) -> bool {
    let lower = location.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Pick the adapter for a feed location: URLs go over HTTP, anything else is a local file.
pub fn adapter_for_location(
    location: &str,
    http: Option<Arc<HttpFetcher>>,
) -> Result<Box<dyn FeedAdapter>, FeedError> {
    let location = location.trim();
    if location.is_empty() {
        return Err(FeedError::Invalid("empty feed location".to_string()));
    }
    if is_remote_location(location) {
        let http = http.ok_or_else(|| {
            FeedError::Invalid(format!("no http client configured for {location}"))
        })?;
        return Ok(Box::new(HttpJsonFeed::new(location, http)));
    }
    Ok(Box::new(JsonFileFeed::new(location)))
}

pub fn parse_feed(location: &str, bytes: &[u8]) -> Result<FeedDocument, FeedError> {
    let document: FeedDocument =
        serde_json::from_slice(bytes).map_err(|source| FeedError::Parse {
            location: location.to_string(),
            source,
        })?;
    for (index, row) in document.rows.iter().enumerate() {
        if row.service.as_str().is_empty() {
            return Err(FeedError::Invalid(format!("row {index} has no service")));
        }
        if row.external_id.trim().is_empty() {
            return Err(FeedError::Invalid(format!(
                "row {index} ({}) has a blank external_id",
                row.service
            )));
        }
    }
    Ok(document)
}

/// The feed must be dated for the date the caller asked for; the date is never taken from the feed alone.
pub fn ensure_target(document: &FeedDocument, target: NaiveDate) -> Result<(), FeedError> {
    if document.snapshot_date != target {
        return Err(FeedError::DateMismatch {
            expected: target,
            found: document.snapshot_date,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
struct IdentityFile {
    #[serde(default)]
    mappings: Vec<IdentityFileRow>,
}

#[derive(Debug, Clone, Deserialize)]
struct IdentityFileRow {
    service: String,
    external_id: String,
    entity_id: Uuid,
}

/// Seed mappings for the in-memory identity authority.
pub fn load_identity_file(path: impl AsRef<Path>) -> Result<Vec<ExternalIdentityMapping>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: IdentityFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file
        .mappings
        .into_iter()
        .map(|row| ExternalIdentityMapping {
            service: ServiceId::new(row.service),
            external_id: row.external_id.trim().to_string(),
            entity_id: EntityId::new(row.entity_id),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    #[test]
    fn missing_metrics_default_to_zero() {
        let doc = parse_feed(
            "inline",
            br#"{"snapshot_date":"2026-03-01","rows":[{"service":"Spotify","external_id":"x1","popularity":12}]}"#,
        )
        .unwrap();
        let row = &doc.rows[0];
        assert_eq!(row.service, ServiceId::new("spotify"));
        assert_eq!(row.metrics.popularity, 12);
        assert_eq!(row.metrics.followers, 0);
        assert_eq!(doc.source, None);
    }

    #[test]
    fn blank_external_ids_are_refused() {
        let err = parse_feed(
            "inline",
            br#"{"snapshot_date":"2026-03-01","rows":[{"service":"spotify","external_id":"  "}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, FeedError::Invalid(_)));
    }

    #[test]
    fn feed_dated_for_another_day_is_refused() {
        let doc = FeedDocument {
            snapshot_date: date(2),
            source: None,
            rows: Vec::new(),
        };
        assert!(ensure_target(&doc, date(2)).is_ok());
        let err = ensure_target(&doc, date(3)).unwrap_err();
        assert!(matches!(
            err,
            FeedError::DateMismatch { expected, found } if expected == date(3) && found == date(2)
        ));
    }

    #[test]
    fn urls_need_an_http_client() {
        assert!(is_remote_location("HTTPS://feeds.example.test/daily.json"));
        assert!(adapter_for_location("https://feeds.example.test/daily.json", None).is_err());
        let adapter = adapter_for_location("fixtures/feeds/2026-03-01.json", None).unwrap();
        assert_eq!(adapter.kind(), FeedKind::JsonFile);
        assert!(adapter_for_location("   ", None).is_err());
    }

    #[tokio::test]
    async fn fixture_feed_loads_with_its_raw_bytes() {
        let path = workspace_root().join("fixtures/feeds/2026-03-01.json");
        let adapter = adapter_for_location(path.to_str().unwrap(), None).unwrap();
        let payload = adapter.load(Uuid::new_v4()).await.unwrap();
        assert_eq!(payload.document.snapshot_date, date(1));
        assert_eq!(payload.document.rows.len(), 2);
        assert_eq!(payload.digest(), feed_digest(&std::fs::read(&path).unwrap()));
        assert_eq!(
            payload.document.services().into_iter().collect::<Vec<_>>(),
            vec![ServiceId::new("spotify")]
        );
    }

    #[tokio::test]
    async fn missing_feed_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let err = JsonFileFeed::new(&path).load(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, FeedError::Io { path: p, .. } if p == path));
    }

    #[test]
    fn identity_fixture_lists_canonical_mappings() {
        let mappings = load_identity_file(workspace_root().join("fixtures/identities.yaml")).unwrap();
        assert!(mappings.len() >= 3);
        assert!(mappings
            .iter()
            .all(|m| m.service == ServiceId::new("spotify") || m.service == ServiceId::new("deezer")));
        let a = mappings
            .iter()
            .find(|m| m.external_id == "artist-a")
            .expect("artist-a");
        assert_eq!(
            a.entity_id.to_string(),
            "00000000-0000-0000-0000-00000000000a"
        );
    }
}
