//! GPU telemetry decoding from a node's GPU exporter payload.
//!
//! The DCGM exporter reports framebuffer memory in MiB as separate used and
//! free gauges; total is derived as their sum.

use serde::{Deserialize, Serialize};

use crate::decoder::{gauge, PodSample};
use crate::exposition::Exposition;

/// Utilization aliases, DCGM first.
pub const GPU_UTIL_METRICS: &[&str] = &["DCGM_FI_DEV_GPU_UTIL", "nvidia_gpu_duty_cycle"];
/// Framebuffer memory in use (MiB).
pub const GPU_MEM_USED_METRICS: &[&str] = &["DCGM_FI_DEV_FB_USED"];
/// Framebuffer memory free (MiB).
pub const GPU_MEM_FREE_METRICS: &[&str] = &["DCGM_FI_DEV_FB_FREE"];
/// Core temperature (Celsius).
pub const GPU_TEMP_METRICS: &[&str] = &["DCGM_FI_DEV_GPU_TEMP"];

/// Telemetry read from one node's GPU exporter.
///
/// Every field is optional: a missing metric leaves the corresponding pod
/// field untouched when applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuTelemetry {
    /// GPU utilization, 0-100.
    pub utilization_pct: Option<f64>,
    /// Framebuffer memory in use, MB.
    pub memory_used_mb: Option<u64>,
    /// Framebuffer memory total, MB.
    pub memory_total_mb: Option<u64>,
    /// Temperature in Celsius.
    pub temperature_c: Option<f64>,
}

impl GpuTelemetry {
    /// Decodes telemetry from a GPU exporter payload.
    #[must_use]
    pub fn decode(payload: &str) -> Self {
        let metrics = Exposition::parse(payload);

        let used = metrics.find(GPU_MEM_USED_METRICS).map(gauge);
        let free = metrics.find(GPU_MEM_FREE_METRICS).map(gauge);
        let total = used.zip(free).map(|(used, free)| used + free);

        Self {
            utilization_pct: metrics.find(GPU_UTIL_METRICS).map(gauge),
            memory_used_mb: used.map(|mb| mb.round() as u64),
            memory_total_mb: total.map(|mb| mb.round() as u64),
            temperature_c: metrics.find(GPU_TEMP_METRICS).map(gauge),
        }
    }

    /// Returns true if no GPU metric was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Copies the fields that were found onto a pod sample.
    ///
    /// Exporter utilization replaces whatever the sample carried.
    pub fn apply_to(&self, sample: &mut PodSample) {
        if let Some(util) = self.utilization_pct {
            sample.gpu_util_pct = util;
        }
        if let Some(used) = self.memory_used_mb {
            sample.gpu_mem_used_mb = used;
        }
        if let Some(total) = self.memory_total_mb {
            sample.gpu_mem_total_mb = total;
        }
        if let Some(temp) = self.temperature_c {
            sample.gpu_temperature_c = temp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DCGM_PAYLOAD: &str = r#"# HELP DCGM_FI_DEV_GPU_UTIL GPU utilization (in %).
# TYPE DCGM_FI_DEV_GPU_UTIL gauge
DCGM_FI_DEV_GPU_UTIL{gpu="0",UUID="GPU-1a2b",device="nvidia0",modelName="Tesla T4",Hostname="gpu-node-1"} 87
# HELP DCGM_FI_DEV_FB_FREE Framebuffer memory free (in MiB).
# TYPE DCGM_FI_DEV_FB_FREE gauge
DCGM_FI_DEV_FB_FREE{gpu="0",UUID="GPU-1a2b",device="nvidia0",modelName="Tesla T4",Hostname="gpu-node-1"} 3012
# HELP DCGM_FI_DEV_FB_USED Framebuffer memory used (in MiB).
# TYPE DCGM_FI_DEV_FB_USED gauge
DCGM_FI_DEV_FB_USED{gpu="0",UUID="GPU-1a2b",device="nvidia0",modelName="Tesla T4",Hostname="gpu-node-1"} 12348
# HELP DCGM_FI_DEV_GPU_TEMP GPU temperature (in C).
# TYPE DCGM_FI_DEV_GPU_TEMP gauge
DCGM_FI_DEV_GPU_TEMP{gpu="0",UUID="GPU-1a2b",device="nvidia0",modelName="Tesla T4",Hostname="gpu-node-1"} 64
"#;

    #[test]
    fn decode_dcgm_payload() {
        let telemetry = GpuTelemetry::decode(DCGM_PAYLOAD);
        assert_eq!(telemetry.utilization_pct, Some(87.0));
        assert_eq!(telemetry.memory_used_mb, Some(12_348));
        assert_eq!(telemetry.memory_total_mb, Some(15_360));
        assert_eq!(telemetry.temperature_c, Some(64.0));
        assert!(!telemetry.is_empty());
    }

    #[test]
    fn total_requires_both_used_and_free() {
        let telemetry = GpuTelemetry::decode("DCGM_FI_DEV_FB_USED 100\n");
        assert_eq!(telemetry.memory_used_mb, Some(100));
        assert_eq!(telemetry.memory_total_mb, None);
    }

    #[test]
    fn duty_cycle_fallback() {
        let telemetry = GpuTelemetry::decode("nvidia_gpu_duty_cycle 55\n");
        assert_eq!(telemetry.utilization_pct, Some(55.0));
    }

    #[test]
    fn unrelated_payload_is_empty() {
        let telemetry = GpuTelemetry::decode("node_cpu_seconds_total 1\n");
        assert!(telemetry.is_empty());
    }

    #[test]
    fn apply_overrides_found_fields_only() {
        let mut sample = PodSample {
            gpu_util_pct: 12.0,
            gpu_mem_used_mb: 7,
            gpu_temperature_c: 40.0,
            ..PodSample::default()
        };
        let telemetry = GpuTelemetry {
            utilization_pct: Some(90.0),
            memory_used_mb: None,
            memory_total_mb: Some(16_000),
            temperature_c: None,
        };

        telemetry.apply_to(&mut sample);

        assert!((sample.gpu_util_pct - 90.0).abs() < f64::EPSILON);
        assert_eq!(sample.gpu_mem_used_mb, 7);
        assert_eq!(sample.gpu_mem_total_mb, 16_000);
        assert!((sample.gpu_temperature_c - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_telemetry_leaves_sample_untouched() {
        let mut sample = PodSample {
            gpu_util_pct: 33.0,
            ..PodSample::default()
        };
        let before = sample.clone();
        GpuTelemetry::default().apply_to(&mut sample);
        assert_eq!(sample, before);
    }
}
