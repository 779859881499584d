//! Inference-serving metrics decoding and counter reconciliation.
#![forbid(unsafe_code)]
//!
//! `claw-inference` is the synchronous core of the Clawbernetes inference
//! scraper. It turns raw Prometheus text payloads scraped from model-serving
//! pods (and the GPU telemetry exporter running on their nodes) into typed
//! samples, reconciles cumulative counters into per-interval deltas, and
//! folds per-pod results into pool-level rollups.
//!
//! # Features
//!
//! - **Tolerant parsing**: label blocks containing spaces, trailing timestamps
//!   and comment lines are all handled without naive field splitting
//! - **Naming drift**: every logical metric resolves through an ordered alias list
//! - **Reset safety**: counter resets and first observations yield zero deltas,
//!   never negative or inflated values
//! - **Bounded state**: per-pod counter state is evicted after a staleness window
//!
//! # Example
//!
//! ```rust
//! use claw_inference::{CounterKey, CounterReconciler, PodIdentity, PodMetricDecoder};
//!
//! let payload = "vllm:generation_tokens_total 1000\nvllm:num_requests_waiting 2\n";
//! let identity = PodIdentity::new("prod-east", "inference", "llama-0", "gpu-node-1");
//!
//! let sample = PodMetricDecoder::default().decode(payload, identity);
//! assert_eq!(sample.queue_depth, 2);
//!
//! let reconciler = CounterReconciler::new();
//! let key = CounterKey::for_pod(&sample.identity).unwrap();
//! let deltas = reconciler.observe(&key, sample.counters);
//!
//! // The first observation of a pod never produces a delta.
//! assert_eq!(deltas.tokens, 0);
//! ```

#![doc(html_root_url = "https://docs.rs/claw-inference/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod decoder;
pub mod error;
pub mod exposition;
pub mod gpu;
pub mod reconciler;
pub mod rollup;

// Re-export main types at crate root
pub use decoder::{CounterSnapshot, MetricSchema, PodIdentity, PodMetricDecoder, PodSample};
pub use error::{InferenceError, Result};
pub use exposition::{first_found, parse_value, Exposition};
pub use gpu::GpuTelemetry;
pub use reconciler::{CounterDeltas, CounterKey, CounterReconciler, DEFAULT_STALENESS};
pub use rollup::{round_to, PodRow, PoolRollup, RollupAccumulator, ScrapedPod};
