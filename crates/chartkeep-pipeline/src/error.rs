use chartkeep_core::{RunStatus, ServiceId};
use chartkeep_feed::FeedError;
use chartkeep_storage::StoreError;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no identity mapping for {service}/{external_id}")]
    UnresolvedIdentity {
        service: ServiceId,
        external_id: String,
    },
    #[error("duplicate identity mapping for service {service}: {detail}")]
    DuplicateIdentity { service: ServiceId, detail: String },
    #[error("{date} is frozen; its adjustment window closed at {deadline}")]
    FrozenPeriod {
        date: NaiveDate,
        deadline: DateTime<Utc>,
    },
    #[error("run {holder} is already running for {date}")]
    RunInProgress { date: NaiveDate, holder: Uuid },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("only {ranked} of {total} feed rows could be ranked, below the publish ratio {minimum}")]
    BelowPublishRatio {
        ranked: u64,
        total: u64,
        minimum: f64,
    },
    #[error("no data: {0}")]
    NoData(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => Self::StorageUnavailable(message),
            StoreError::RunNotRunning { run_id, status } => Self::InvalidTransition {
                run_id,
                from: status,
                to: RunStatus::Succeeded,
            },
            other => Self::Store(other),
        }
    }
}

impl PipelineError {
    /// Caller may retry later with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RunInProgress { .. } | Self::StorageUnavailable(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::UnresolvedIdentity { .. } => "UnresolvedIdentity",
            Self::DuplicateIdentity { .. } => "DuplicateIdentity",
            Self::FrozenPeriod { .. } => "FrozenPeriod",
            Self::RunInProgress { .. } => "RunInProgress",
            Self::StorageUnavailable(_) => "StorageUnavailable",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::BelowPublishRatio { .. } => "BelowPublishRatio",
            Self::NoData(_) => "NoData",
            Self::Config(_) => "Config",
            Self::Feed(_) => "Feed",
            Self::Store(_) => "Store",
            Self::Other(_) => "Internal",
        }
    }

    /// Human-readable cause recorded on the run row.
    pub fn cause(&self) -> String {
        format!("{}: {}", self.code(), self)
    }
}
