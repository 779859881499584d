//! Time-series sinks for pod rows and pool rollups.

use std::future::Future;
use std::time::Duration;

use claw_inference::{PodRow, PoolRollup};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::trace;

use crate::config::SinkConfig;
use crate::error::{Result, ScraperError};

/// Append-only destination for scraped metrics.
///
/// Implementations must tolerate concurrent inserts.
pub trait MetricsSink: Send + Sync {
    /// Appends one per-pod snapshot row.
    fn insert_pod_row(&self, row: &PodRow) -> impl Future<Output = Result<()>> + Send;

    /// Appends one pool rollup row.
    fn insert_pool_rollup(&self, rollup: &PoolRollup) -> impl Future<Output = Result<()>> + Send;
}

/// Sink that keeps rows in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pod_rows: Mutex<Vec<PodRow>>,
    rollups: Mutex<Vec<PoolRollup>>,
    failing: RwLock<bool>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every insert fail while set.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.write() = failing;
    }

    /// Returns a copy of the stored pod rows.
    #[must_use]
    pub fn pod_rows(&self) -> Vec<PodRow> {
        self.pod_rows.lock().clone()
    }

    /// Returns a copy of the stored rollups.
    #[must_use]
    pub fn rollups(&self) -> Vec<PoolRollup> {
        self.rollups.lock().clone()
    }

    /// Drops all stored rows.
    pub fn clear(&self) {
        self.pod_rows.lock().clear();
        self.rollups.lock().clear();
    }

    fn check(&self) -> Result<()> {
        if *self.failing.read() {
            return Err(ScraperError::Sink("memory sink set to fail".to_string()));
        }
        Ok(())
    }
}

impl MetricsSink for MemorySink {
    async fn insert_pod_row(&self, row: &PodRow) -> Result<()> {
        self.check()?;
        self.pod_rows.lock().push(row.clone());
        Ok(())
    }

    async fn insert_pool_rollup(&self, rollup: &PoolRollup) -> Result<()> {
        self.check()?;
        self.rollups.lock().push(rollup.clone());
        Ok(())
    }
}

/// Sink writing to ClickHouse over its HTTP interface, one
/// `JSONEachRow` insert per row.
#[derive(Debug, Clone)]
pub struct ClickHouseSink {
    client: reqwest::Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
    pod_table: String,
    rollup_table: String,
}

impl ClickHouseSink {
    /// Creates a sink from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            pod_table: config.pod_table.clone(),
            rollup_table: config.rollup_table.clone(),
        })
    }

    /// Builds the insert statement for a table.
    #[must_use]
    pub fn insert_query(table: &str) -> String {
        format!("INSERT INTO {table} FORMAT JSONEachRow")
    }

    async fn insert<T: Serialize + Sync>(&self, table: &str, row: &T) -> Result<()> {
        let mut body = serde_json::to_string(row)
            .map_err(|e| ScraperError::Sink(format!("encode row for {table}: {e}")))?;
        body.push('\n');

        let query = Self::insert_query(table);
        let mut request = self
            .client
            .post(format!("{}/", self.url))
            .query(&[
                ("query", query.as_str()),
                ("database", self.database.as_str()),
                ("date_time_input_format", "best_effort"),
            ])
            .body(body);
        if let Some(user) = &self.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ScraperError::Sink(format!(
                "insert into {table} returned {status}: {}",
                detail.trim()
            )));
        }
        trace!(table, "row inserted");
        Ok(())
    }
}

impl MetricsSink for ClickHouseSink {
    async fn insert_pod_row(&self, row: &PodRow) -> Result<()> {
        self.insert(&self.pod_table, row).await
    }

    async fn insert_pool_rollup(&self, rollup: &PoolRollup) -> Result<()> {
        self.insert(&self.rollup_table, rollup).await
    }
}

/// The sink chosen at startup.
#[derive(Debug)]
pub enum SinkBackend {
    /// ClickHouse over HTTP.
    ClickHouse(ClickHouseSink),
    /// In memory; used for dry runs.
    Memory(MemorySink),
}

impl MetricsSink for SinkBackend {
    async fn insert_pod_row(&self, row: &PodRow) -> Result<()> {
        match self {
            Self::ClickHouse(sink) => sink.insert_pod_row(row).await,
            Self::Memory(sink) => sink.insert_pod_row(row).await,
        }
    }

    async fn insert_pool_rollup(&self, rollup: &PoolRollup) -> Result<()> {
        match self {
            Self::ClickHouse(sink) => sink.insert_pool_rollup(rollup).await,
            Self::Memory(sink) => sink.insert_pool_rollup(rollup).await,
        }
    }
}
