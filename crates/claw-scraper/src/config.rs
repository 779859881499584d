//! Scraper configuration.
//!
//! Loaded from a TOML file:
//! - Scrape cadence, timeouts and ports at the top level
//! - `[sync]`: the `InferenceStack` pool sync loop
//! - `[sink]`: the ClickHouse endpoint rows are written to
//! - `[[clusters]]`: clusters to scrape, by kubeconfig context or in-cluster
//! - `[[pools]]`: pools known before the first sync

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ScraperError;
use crate::fetch::DEFAULT_BODY_LIMIT;
use crate::kubernetes::InferenceStackResource;
use crate::pools::Pool;
use crate::scraper::ScrapeSettings;
use crate::sync::SyncSettings;

/// Selector for the DCGM exporter daemonset pods.
pub const DEFAULT_GPU_EXPORTER_SELECTOR: &str = "app.kubernetes.io/name=dcgm-exporter";

/// Pool sync settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Whether to run the pool sync loop.
    pub enabled: bool,
    /// Seconds between syncs.
    pub interval_secs: u64,
    /// Per-cluster list timeout in seconds.
    pub timeout_secs: u64,
    /// The `InferenceStack` custom resource to list.
    pub inference_stack: InferenceStackResource,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 10,
            inference_stack: InferenceStackResource::default(),
        }
    }
}

/// ClickHouse sink settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SinkConfig {
    /// HTTP interface URL, e.g. `http://clickhouse:8123`.
    pub url: String,
    /// Database holding the metrics tables.
    pub database: String,
    /// User name, if authentication is enabled.
    pub user: Option<String>,
    /// Password, if authentication is enabled.
    pub password: Option<String>,
    /// Per-pod snapshot table.
    pub pod_table: String,
    /// Pool rollup table.
    pub rollup_table: String,
    /// Insert timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            user: None,
            password: None,
            pod_table: "ngf_pod_metrics".to_string(),
            rollup_table: "ngf_inference_metrics_1m".to_string(),
            timeout_secs: 10,
        }
    }
}

/// How to reach one cluster.
///
/// With neither `kubeconfig` nor `context` set the connection is inferred:
/// `$KUBECONFIG` or `~/.kube/config` if present, otherwise the in-cluster
/// service account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Cluster name used in rows and counter keys.
    pub name: String,
    /// Kubeconfig file to load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context; the file's current context when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ClusterConfig {
    /// Describes where the connection settings come from.
    #[must_use]
    pub fn source(&self) -> String {
        match (&self.kubeconfig, &self.context) {
            (Some(path), Some(context)) => format!("{} (context {context})", path.display()),
            (Some(path), None) => path.display().to_string(),
            (None, Some(context)) => format!("default kubeconfig (context {context})"),
            (None, None) => "inferred (kubeconfig or in-cluster)".to_string(),
        }
    }
}

/// Main scraper configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScraperConfig {
    /// Seconds between scrape cycles.
    pub interval_secs: u64,
    /// Seconds after which an unseen pod's counter state is dropped.
    pub staleness_secs: u64,
    /// Per-pod fetch timeout in seconds.
    pub pod_timeout_secs: u64,
    /// Pod discovery timeout in seconds.
    pub discovery_timeout_secs: u64,
    /// GPU exporter discovery timeout in seconds.
    pub gpu_discovery_timeout_secs: u64,
    /// Port the serving runtime exposes metrics on.
    pub metrics_port: u16,
    /// Port the GPU exporter listens on.
    pub gpu_exporter_port: u16,
    /// Label selector for GPU exporter pods.
    pub gpu_exporter_selector: String,
    /// Maximum bytes read from one metrics response.
    pub max_body_bytes: usize,
    /// Pods of one pool scraped at the same time.
    pub max_concurrent_pod_scrapes: usize,
    /// Pool sync loop.
    pub sync: SyncConfig,
    /// Time-series sink. Required unless running dry.
    pub sink: Option<SinkConfig>,
    /// Clusters to scrape.
    pub clusters: Vec<ClusterConfig>,
    /// Pools known ahead of the first sync.
    pub pools: Vec<Pool>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            staleness_secs: 600,
            pod_timeout_secs: 5,
            discovery_timeout_secs: 5,
            gpu_discovery_timeout_secs: 10,
            metrics_port: 8000,
            gpu_exporter_port: 9400,
            gpu_exporter_selector: DEFAULT_GPU_EXPORTER_SELECTOR.to_string(),
            max_body_bytes: DEFAULT_BODY_LIMIT,
            max_concurrent_pod_scrapes: 8,
            sync: SyncConfig::default(),
            sink: None,
            clusters: Vec::new(),
            pools: Vec::new(),
        }
    }
}

impl ScraperConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScraperError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ScraperError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ScraperError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ScraperError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ScraperError> {
        toml::to_string_pretty(self)
            .map_err(|e| ScraperError::Config(format!("failed to serialize config: {e}")))
    }

    /// A starting point for a new deployment.
    #[must_use]
    pub fn sample() -> Self {
        Self {
            sink: Some(SinkConfig::default()),
            clusters: vec![ClusterConfig {
                name: "local".to_string(),
                kubeconfig: None,
                context: None,
            }],
            ..Self::default()
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), ScraperError> {
        for (field, value) in [
            ("interval_secs", self.interval_secs),
            ("staleness_secs", self.staleness_secs),
            ("pod_timeout_secs", self.pod_timeout_secs),
            ("discovery_timeout_secs", self.discovery_timeout_secs),
            ("gpu_discovery_timeout_secs", self.gpu_discovery_timeout_secs),
        ] {
            if value == 0 {
                return Err(ScraperError::Config(format!(
                    "{field} must be greater than 0"
                )));
            }
        }

        if self.metrics_port == 0 || self.gpu_exporter_port == 0 {
            return Err(ScraperError::Config("ports must be non-zero".to_string()));
        }

        if self.max_body_bytes == 0 {
            return Err(ScraperError::Config(
                "max_body_bytes must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_pod_scrapes == 0 {
            return Err(ScraperError::Config(
                "max_concurrent_pod_scrapes must be greater than 0".to_string(),
            ));
        }

        if self.sync.enabled && (self.sync.interval_secs == 0 || self.sync.timeout_secs == 0) {
            return Err(ScraperError::Config(
                "sync.interval_secs and sync.timeout_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(sink) = &self.sink {
            if !is_http_url(&sink.url) {
                return Err(ScraperError::Config(
                    "sink.url must start with http:// or https://".to_string(),
                ));
            }
            if sink.pod_table.is_empty() || sink.rollup_table.is_empty() {
                return Err(ScraperError::Config(
                    "sink table names cannot be empty".to_string(),
                ));
            }
        }

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return Err(ScraperError::Config(
                    "cluster name cannot be empty".to_string(),
                ));
            }
            if cluster.name.contains('/') {
                return Err(ScraperError::Config(format!(
                    "cluster name '{}' cannot contain '/'",
                    cluster.name
                )));
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(ScraperError::Config(format!(
                    "duplicate cluster name '{}'",
                    cluster.name
                )));
            }
            if cluster.context.as_deref().is_some_and(str::is_empty) {
                return Err(ScraperError::Config(format!(
                    "cluster '{}' context cannot be empty",
                    cluster.name
                )));
            }
        }

        if self.pools.iter().any(|p| p.name.is_empty()) {
            return Err(ScraperError::Config("pool name cannot be empty".to_string()));
        }

        Ok(())
    }

    /// Settings for the scrape orchestrator.
    #[must_use]
    pub fn scrape_settings(&self) -> ScrapeSettings {
        ScrapeSettings {
            interval: Duration::from_secs(self.interval_secs),
            staleness: Duration::from_secs(self.staleness_secs),
            pod_timeout: Duration::from_secs(self.pod_timeout_secs),
            discovery_timeout: Duration::from_secs(self.discovery_timeout_secs),
            gpu_discovery_timeout: Duration::from_secs(self.gpu_discovery_timeout_secs),
            metrics_port: self.metrics_port,
            gpu_exporter_port: self.gpu_exporter_port,
            gpu_exporter_selector: self.gpu_exporter_selector.clone(),
            max_body_bytes: self.max_body_bytes,
            max_concurrent_pod_scrapes: self.max_concurrent_pod_scrapes,
        }
    }

    /// Settings for the pool sync loop.
    #[must_use]
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            interval: Duration::from_secs(self.sync.interval_secs),
            timeout: Duration::from_secs(self.sync.timeout_secs),
        }
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
