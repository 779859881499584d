//! Inference pod metrics scraper for Clawbernetes GPU clusters.
#![forbid(unsafe_code)]
//!
//! `claw-scraper` periodically discovers model-serving pods across clusters,
//! scrapes their Prometheus endpoints and the GPU exporters on their nodes,
//! reconciles counters into rates and writes per-pod rows and per-pool
//! rollups to a time-series sink.
//!
//! # Architecture
//!
//! ```text
//! PoolDirectory ─┐
//!                ├─> MetricsScraper ──> MetricsFetcher (pods, GPU exporters)
//! ClusterRegistry┘        │
//!                         └──> MetricsSink (pod rows, pool rollups)
//!
//! ClusterRegistry ──> PoolSync ──> PoolStore
//! ```
//!
//! Collaborators are traits; the crate ships networked implementations
//! ([`KubeCluster`], [`HttpFetcher`], [`ClickHouseSink`]) and in-memory ones
//! for tests and dry runs.

#![doc(html_root_url = "https://docs.rs/claw-scraper/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod fetch;
pub mod gpu;
pub mod kubernetes;
pub mod pools;
pub mod scraper;
pub mod sink;
pub mod sync;

// Re-export main types at crate root
pub use cluster::{ClusterHandle, ClusterRegistry, InMemoryCluster, PodInfo, StaticClusterRegistry};
pub use config::{ClusterConfig, ScraperConfig, SinkConfig, SyncConfig};
pub use error::{Result, ScraperError};
pub use fetch::{metrics_url, HttpFetcher, MetricsFetcher, StaticFetcher};
pub use gpu::{GpuCorrelator, GpuNodeMap};
pub use kubernetes::{InferenceStackResource, KubeCluster};
pub use pools::{InMemoryPoolDirectory, Pool, PoolDirectory, PoolStore};
pub use scraper::{
    shutdown_requested, Clock, CycleReport, ManualClock, MetricsScraper, ScrapeSettings,
    SystemClock,
};
pub use sink::{ClickHouseSink, MemorySink, MetricsSink, SinkBackend};
pub use sync::{pool_from_inference_stack, PoolSync, SyncReport, SyncSettings};
