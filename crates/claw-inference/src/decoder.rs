//! Decoding of model-server exposition payloads into typed pod samples.
//!
//! Serving runtimes rename metrics between releases (vLLM moved from a
//! `vllm_` prefix to a `vllm:` namespace, and renamed the KV-cache gauge), so
//! every logical field is resolved through an ordered alias list.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::exposition::Exposition;

/// Identity of a scraped pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodIdentity {
    /// Cluster the pod runs in.
    pub cluster: String,
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub pod: String,
    /// Node the pod is scheduled on (may be empty).
    pub node: String,
}

impl PodIdentity {
    /// Creates a new pod identity.
    #[must_use]
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            pod: pod.into(),
            node: node.into(),
        }
    }
}

/// Cumulative counters read from a pod, in their raw monotonic form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Total generated tokens since the serving process started.
    pub tokens_total: f64,
    /// Sum of the first-token latency histogram, in seconds.
    pub latency_sum_seconds: f64,
    /// Observation count of the first-token latency histogram.
    pub latency_count: f64,
}

/// One pod's metrics for one scrape cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSample {
    /// Which pod this sample came from.
    pub identity: PodIdentity,
    /// Throughput gauge reported by the runtime (tokens/sec).
    pub tokens_per_sec: f64,
    /// Requests waiting to be scheduled.
    pub queue_depth: u32,
    /// Requests currently running.
    pub requests_in_flight: u32,
    /// KV-cache utilization, 0-100.
    pub kv_cache_pct: f64,
    /// GPU utilization, 0-100. Filled from GPU telemetry, not the runtime.
    pub gpu_util_pct: f64,
    /// GPU framebuffer memory in use, MB.
    pub gpu_mem_used_mb: u64,
    /// GPU framebuffer memory total, MB.
    pub gpu_mem_total_mb: u64,
    /// GPU temperature in Celsius.
    pub gpu_temperature_c: f64,
    /// Cumulative counters awaiting reconciliation.
    pub counters: CounterSnapshot,
}

/// Ordered alias lists for each logical metric a serving runtime exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricSchema {
    /// Generation throughput gauge.
    pub tokens_per_sec: &'static [&'static str],
    /// Waiting request gauge.
    pub queue_depth: &'static [&'static str],
    /// Running request gauge.
    pub requests_in_flight: &'static [&'static str],
    /// KV-cache usage as a 0-1 ratio.
    pub kv_cache_ratio: &'static [&'static str],
    /// Generated token counter.
    pub tokens_total: &'static [&'static str],
    /// First-token latency histogram sum.
    pub ttft_sum: &'static [&'static str],
    /// First-token latency histogram count.
    pub ttft_count: &'static [&'static str],
    /// End-to-end request latency histogram sum.
    pub e2e_sum: &'static [&'static str],
    /// End-to-end request latency histogram count.
    pub e2e_count: &'static [&'static str],
}

impl MetricSchema {
    /// vLLM metric names, newest convention first.
    pub const VLLM: Self = Self {
        tokens_per_sec: &[
            "vllm:avg_generation_throughput_toks_per_s",
            "vllm_avg_generation_throughput_toks_per_s",
        ],
        queue_depth: &["vllm:num_requests_waiting", "vllm_num_requests_waiting"],
        requests_in_flight: &["vllm:num_requests_running", "vllm_num_requests_running"],
        kv_cache_ratio: &[
            "vllm:kv_cache_usage_perc",
            "vllm:gpu_cache_usage_perc",
            "vllm_gpu_cache_usage_perc",
        ],
        tokens_total: &["vllm:generation_tokens_total", "vllm_generation_tokens_total"],
        ttft_sum: &[
            "vllm:time_to_first_token_seconds_sum",
            "vllm_time_to_first_token_seconds_sum",
        ],
        ttft_count: &[
            "vllm:time_to_first_token_seconds_count",
            "vllm_time_to_first_token_seconds_count",
        ],
        e2e_sum: &[
            "vllm:e2e_request_latency_seconds_sum",
            "vllm_e2e_request_latency_seconds_sum",
        ],
        e2e_count: &[
            "vllm:e2e_request_latency_seconds_count",
            "vllm_e2e_request_latency_seconds_count",
        ],
    };
}

impl Default for MetricSchema {
    fn default() -> Self {
        Self::VLLM
    }
}

/// Maps an exposition payload onto a [`PodSample`] using a [`MetricSchema`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PodMetricDecoder {
    schema: MetricSchema,
}

impl PodMetricDecoder {
    /// Creates a decoder for the given schema.
    #[must_use]
    pub const fn new(schema: MetricSchema) -> Self {
        Self { schema }
    }

    /// Returns the schema in use.
    #[must_use]
    pub const fn schema(&self) -> &MetricSchema {
        &self.schema
    }

    /// Decodes the workload-visible fields of a pod sample.
    ///
    /// GPU fields are left at zero; they come from the node's GPU exporter.
    /// When the first-token histogram has observations but a zero sum (the
    /// runtime does not stream, so the metric is never filled), the
    /// end-to-end latency histogram is used as the closest available proxy.
    #[must_use]
    pub fn decode(&self, payload: &str, identity: PodIdentity) -> PodSample {
        let metrics = Exposition::parse(payload);
        let schema = &self.schema;

        let ttft_sum = metrics.first_found(schema.ttft_sum);
        let ttft_count = metrics.first_found(schema.ttft_count);
        let (latency_sum, latency_count) = if first_token_unfilled(ttft_sum, ttft_count) {
            trace!(pod = %identity.pod, "first-token histogram empty, using end-to-end latency");
            (
                gauge(metrics.first_found(schema.e2e_sum)),
                gauge(metrics.first_found(schema.e2e_count)),
            )
        } else {
            (gauge(ttft_sum), gauge(ttft_count))
        };

        PodSample {
            tokens_per_sec: gauge(metrics.first_found(schema.tokens_per_sec)),
            queue_depth: gauge(metrics.first_found(schema.queue_depth)) as u32,
            requests_in_flight: gauge(metrics.first_found(schema.requests_in_flight)) as u32,
            kv_cache_pct: gauge(metrics.first_found(schema.kv_cache_ratio)) * 100.0,
            counters: CounterSnapshot {
                tokens_total: gauge(metrics.first_found(schema.tokens_total)),
                latency_sum_seconds: latency_sum,
                latency_count,
            },
            identity,
            ..PodSample::default()
        }
    }
}

/// Observations recorded with an exactly zero sum. Checked on raw values so
/// that a NaN or negative sum does not switch histograms.
#[allow(clippy::float_cmp)]
fn first_token_unfilled(sum: f64, count: f64) -> bool {
    count > 0.0 && sum == 0.0
}

/// Gauges and counters are never negative; NaN and infinities read as 0.
pub(crate) fn gauge(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}
