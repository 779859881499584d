//! Per-pod rows and pool-level rollups.
//!
//! A pool rollup is built once per (cluster, pool, cycle) from every pod
//! sampled in that pass: gauges and latency are averaged, token deltas are
//! summed. A pass with no sampled pod produces no rollup at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decoder::PodSample;
use crate::reconciler::CounterDeltas;

/// Rounds `value` to `places` decimal places.
#[must_use]
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// A successfully scraped pod: its sample plus reconciled deltas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedPod {
    /// Decoded and GPU-enriched sample.
    pub sample: PodSample,
    /// Counter deltas since the previous scrape.
    pub deltas: CounterDeltas,
    /// Effective throughput for this pod.
    pub tokens_per_sec: f64,
}

impl ScrapedPod {
    /// Combines a sample with its deltas.
    ///
    /// Throughput is the reconciled rate; when that is zero (first scrape,
    /// reset, idle interval) the runtime's own gauge is used instead.
    #[must_use]
    pub fn new(sample: PodSample, deltas: CounterDeltas) -> Self {
        let tokens_per_sec = if deltas.tokens_per_sec > 0.0 {
            deltas.tokens_per_sec
        } else {
            sample.tokens_per_sec
        };
        Self {
            sample,
            deltas,
            tokens_per_sec,
        }
    }
}

/// One row of the per-pod snapshot table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodRow {
    /// Cycle timestamp.
    pub timestamp: DateTime<Utc>,
    /// Cluster name.
    pub cluster_name: String,
    /// Pool name.
    pub pool_name: String,
    /// Pod name.
    pub pod_name: String,
    /// Node name.
    pub node_name: String,
    /// GPU index on the node. Per-GPU attribution is not tracked; always 0.
    pub gpu_id: u8,
    /// GPU model from the pool definition.
    pub gpu_type: String,
    /// Requests waiting.
    pub queue_depth: u16,
    /// KV-cache utilization, 0-100.
    pub kv_cache_util_pct: f64,
    /// Prefix cache state; not reported by current runtimes, always 0.
    pub prefix_cache_state: u8,
    /// GPU utilization, 0-100.
    pub gpu_util_pct: f64,
    /// GPU memory in use, MB.
    pub gpu_mem_used_mb: u32,
    /// GPU memory total, MB.
    pub gpu_mem_total_mb: u32,
    /// GPU temperature, Celsius.
    pub gpu_temperature_c: u16,
    /// Requests running.
    pub requests_in_flight: u16,
}

impl PodRow {
    /// Builds the snapshot row for a scraped pod.
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, pool_name: &str, gpu_type: &str, pod: &ScrapedPod) -> Self {
        let sample = &pod.sample;
        Self {
            timestamp,
            cluster_name: sample.identity.cluster.clone(),
            pool_name: pool_name.to_string(),
            pod_name: sample.identity.pod.clone(),
            node_name: sample.identity.node.clone(),
            gpu_id: 0,
            gpu_type: gpu_type.to_string(),
            queue_depth: saturate_u16(u64::from(sample.queue_depth)),
            kv_cache_util_pct: sample.kv_cache_pct,
            prefix_cache_state: 0,
            gpu_util_pct: sample.gpu_util_pct,
            gpu_mem_used_mb: u32::try_from(sample.gpu_mem_used_mb).unwrap_or(u32::MAX),
            gpu_mem_total_mb: u32::try_from(sample.gpu_mem_total_mb).unwrap_or(u32::MAX),
            gpu_temperature_c: saturate_u16(sample.gpu_temperature_c.round() as u64),
            requests_in_flight: saturate_u16(u64::from(sample.requests_in_flight)),
        }
    }
}

fn saturate_u16(value: u64) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// One row of the pool-level one-minute table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRollup {
    /// Cycle timestamp.
    pub timestamp: DateTime<Utc>,
    /// Cluster name.
    pub cluster_name: String,
    /// Pool name.
    pub pool_name: String,
    /// Mean first-token latency across pods, ms.
    pub ttft_ms: f64,
    /// Mean per-pod throughput, tokens/sec.
    pub tps: f64,
    /// Tokens generated by the pool during the interval.
    pub total_tokens: u64,
    /// Mean queue depth, rounded to the nearest request.
    pub queue_depth: u32,
    /// Mean KV-cache utilization, 0-100.
    pub kv_cache_pct: f64,
    /// Prefix cache hit rate; not reported by current runtimes, always 0.
    pub prefix_cache_hit: u8,
    /// Mean GPU utilization, 0-100.
    pub gpu_util_pct: f64,
    /// Number of pods averaged. Not persisted.
    #[serde(skip)]
    pub pod_count: usize,
}

impl PoolRollup {
    /// Pool-wide throughput: the per-pod mean scaled back up by pod count.
    #[must_use]
    pub fn aggregate_tokens_per_sec(&self) -> f64 {
        self.tps * self.pod_count as f64
    }
}

/// Running sums for one (cluster, pool) pass.
#[derive(Debug, Clone, Default)]
pub struct RollupAccumulator {
    ttft_ms: f64,
    tokens_per_sec: f64,
    tokens: u64,
    queue_depth: f64,
    kv_cache_pct: f64,
    gpu_util_pct: f64,
    pods: usize,
}

impl RollupAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one scraped pod.
    pub fn add(&mut self, pod: &ScrapedPod) {
        self.ttft_ms += pod.deltas.avg_latency_ms;
        self.tokens_per_sec += pod.tokens_per_sec;
        self.tokens = self.tokens.saturating_add(pod.deltas.tokens);
        self.queue_depth += f64::from(pod.sample.queue_depth);
        self.kv_cache_pct += pod.sample.kv_cache_pct;
        self.gpu_util_pct += pod.sample.gpu_util_pct;
        self.pods += 1;
    }

    /// Returns the number of pods added.
    #[must_use]
    pub const fn pod_count(&self) -> usize {
        self.pods
    }

    /// Returns the unrounded sum of per-pod throughput.
    #[must_use]
    pub const fn summed_tokens_per_sec(&self) -> f64 {
        self.tokens_per_sec
    }

    /// Produces the rollup, or `None` if no pod was added.
    #[must_use]
    pub fn finish(
        &self,
        timestamp: DateTime<Utc>,
        cluster_name: &str,
        pool_name: &str,
    ) -> Option<PoolRollup> {
        if self.pods == 0 {
            return None;
        }
        let n = self.pods as f64;
        Some(PoolRollup {
            timestamp,
            cluster_name: cluster_name.to_string(),
            pool_name: pool_name.to_string(),
            ttft_ms: round_to(self.ttft_ms / n, 2),
            tps: round_to(self.tokens_per_sec / n, 2),
            total_tokens: self.tokens,
            queue_depth: (self.queue_depth / n).round() as u32,
            kv_cache_pct: round_to(self.kv_cache_pct / n, 2),
            prefix_cache_hit: 0,
            gpu_util_pct: round_to(self.gpu_util_pct / n, 2),
            pod_count: self.pods,
        })
    }
}

impl<'a> Extend<&'a ScrapedPod> for RollupAccumulator {
    fn extend<I: IntoIterator<Item = &'a ScrapedPod>>(&mut self, iter: I) {
        for pod in iter {
            self.add(pod);
        }
    }
}
