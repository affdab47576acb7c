//! Remote feed download: one shared client, a concurrency cap and backoff on transient failures.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

/// Exponential backoff shared by feed downloads and database connects.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Feeds larger than this are refused rather than buffered.
    pub max_feed_bytes: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            max_feed_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Body of a downloaded feed plus where it was finally served from.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("feed at {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    /// Throttling, server errors, timeouts and refused connections are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Status { status, .. } => StatusCode::from_u16(*status)
                .is_ok_and(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS),
            Self::TooLarge { .. } | Self::Closed => false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
    max_feed_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build().context("building feed http client")?,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
            max_feed_bytes: config.max_feed_bytes,
        })
    }

    /// Download one feed for `run_id`, retrying transient failures.
    pub async fn fetch_feed(&self, run_id: Uuid, url: &str) -> Result<FetchedFeed, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        async {
            let mut attempt = 0usize;
            loop {
                match self.attempt(url).await {
                    Err(err) if err.is_transient() && attempt < self.backoff.max_retries => {
                        warn!(error = %err, attempt, "retrying feed download");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                    }
                    result => return result,
                }
            }
        }
        .instrument(info_span!("feed_download", %run_id, url))
        .await
    }

    async fn attempt(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        let transport = |source: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().await.map_err(transport)?;
        let final_url = resp.url().to_string();
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let too_large = |url: String| FetchError::TooLarge {
            url,
            limit: self.max_feed_bytes,
        };
        if resp.content_length().is_some_and(|len| len > self.max_feed_bytes as u64) {
            return Err(too_large(final_url));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp.bytes().await.map_err(transport)?;
        if body.len() > self.max_feed_bytes {
            return Err(too_large(final_url));
        }
        Ok(FetchedFeed {
            url: final_url,
            content_type,
            body: body.to_vec(),
        })
    }
}
