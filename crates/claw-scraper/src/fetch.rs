//! Fetching exposition payloads over HTTP.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::StatusCode;
use tracing::trace;

use crate::error::{Result, ScraperError};

/// Default cap on a scraped payload: 1 MiB.
pub const DEFAULT_BODY_LIMIT: usize = 1 << 20;

/// Fetches a metrics payload from a URL.
///
/// Anything other than a 200 response is an error. Bodies longer than
/// `limit` bytes are truncated, not rejected.
pub trait MetricsFetcher: Send + Sync {
    /// Fetches `url`, reading at most `limit` bytes of body.
    fn fetch(&self, url: &str, limit: usize) -> impl Future<Output = Result<String>> + Send;
}

/// Builds the scrape URL for a pod or exporter address.
///
/// IPv6 addresses are bracketed.
#[must_use]
pub fn metrics_url(ip: &str, port: u16) -> String {
    if ip.contains(':') && !ip.starts_with('[') {
        format!("http://[{ip}]:{port}/metrics")
    } else {
        format!("http://{ip}:{port}/metrics")
    }
}

/// Fetcher backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Creates a fetcher whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("claw-scraper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl MetricsFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, limit: usize) -> Result<String> {
        let mut response = self.client.get(url).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ScraperError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let remaining = limit.saturating_sub(body.len());
            if chunk.len() >= remaining {
                body.extend_from_slice(&chunk[..remaining]);
                trace!(url, limit, "metrics body truncated");
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[derive(Debug, Clone)]
enum Canned {
    Body(String),
    Status(u16),
}

/// Fetcher answering from a fixed table of URLs.
///
/// Unknown URLs answer 404. Every call is counted so callers can check
/// which endpoints were hit.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    responses: RwLock<HashMap<String, Canned>>,
    requests: RwLock<HashMap<String, usize>>,
    delay: RwLock<Option<Duration>>,
    url_delays: RwLock<HashMap<String, Duration>>,
}

impl StaticFetcher {
    /// Creates an empty fetcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `body` at `url`.
    pub fn set_body(&self, url: impl Into<String>, body: impl Into<String>) {
        self.responses
            .write()
            .insert(url.into(), Canned::Body(body.into()));
    }

    /// Answers `url` with an error status.
    pub fn set_status(&self, url: impl Into<String>, status: u16) {
        self.responses
            .write()
            .insert(url.into(), Canned::Status(status));
    }

    /// Delays every response.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    /// Delays responses for one URL, on top of any global delay.
    pub fn delay_url(&self, url: impl Into<String>, delay: Duration) {
        self.url_delays.write().insert(url.into(), delay);
    }

    /// Returns how many times `url` was fetched.
    #[must_use]
    pub fn requests(&self, url: &str) -> usize {
        self.requests.read().get(url).copied().unwrap_or(0)
    }

    /// Returns the total number of fetches.
    #[must_use]
    pub fn total_requests(&self) -> usize {
        self.requests.read().values().sum()
    }
}

impl MetricsFetcher for StaticFetcher {
    async fn fetch(&self, url: &str, limit: usize) -> Result<String> {
        *self.requests.write().entry(url.to_string()).or_default() += 1;

        let delay = self.delay.read().unwrap_or_default()
            + self.url_delays.read().get(url).copied().unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let canned = self.responses.read().get(url).cloned();
        match canned {
            Some(Canned::Body(body)) => {
                let end = body.len().min(limit);
                Ok(String::from_utf8_lossy(&body.as_bytes()[..end]).into_owned())
            }
            Some(Canned::Status(status)) => Err(ScraperError::Status {
                url: url.to_string(),
                status,
            }),
            None => Err(ScraperError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}
