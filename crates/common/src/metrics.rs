//! Metrics collection for Patchloop
//!
//! This module provides Prometheus metrics for the hotpatch layers.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for Patchloop
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub hotpatch: HotpatchMetrics,
    pub pipeline: PipelineMetrics,
}

/// Memory and byte layer metrics
#[derive(Debug, Clone)]
pub struct HotpatchMetrics {
    /// Patches applied
    pub patches_applied: IntCounter,

    /// Patches reverted
    pub patches_reverted: IntCounter,

    /// Failed apply/revert attempts
    pub patches_failed: IntCounter,

    /// Registrations rejected by conflict detection
    pub conflicts_detected: IntCounter,

    /// Checksum or magic mismatches
    pub integrity_failures: IntCounter,

    /// OS protection failures (both phases)
    pub protection_failures: IntCounter,

    /// Bytes written by patches and direct writes
    pub bytes_modified: IntCounter,

    /// Currently attached region size
    pub attached_bytes: IntGauge,

    /// Apply duration
    pub apply_duration: Histogram,
}

/// Proxy and server pipeline metrics
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    /// Requests processed
    pub requests_processed: IntCounter,

    /// Responses processed
    pub responses_processed: IntCounter,

    /// Stream chunks processed
    pub chunks_processed: IntCounter,

    /// Streams terminated early
    pub streams_terminated: IntCounter,

    /// Cache hits
    pub cache_hits: IntCounter,

    /// Cache misses
    pub cache_misses: IntCounter,

    /// Agent outputs failing validation
    pub validation_failures: IntCounter,

    /// Processing duration
    pub processing_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Hotpatch metrics
        let patches_applied = IntCounter::new(
            "hotpatch_patches_applied_total",
            "Total number of patches applied",
        )
        .unwrap();

        let patches_reverted = IntCounter::new(
            "hotpatch_patches_reverted_total",
            "Total number of patches reverted",
        )
        .unwrap();

        let patches_failed = IntCounter::new(
            "hotpatch_patches_failed_total",
            "Total number of failed patch operations",
        )
        .unwrap();

        let conflicts_detected = IntCounter::new(
            "hotpatch_conflicts_detected_total",
            "Total number of patch registrations rejected as conflicts",
        )
        .unwrap();

        let integrity_failures = IntCounter::new(
            "hotpatch_integrity_failures_total",
            "Total number of checksum or signature mismatches",
        )
        .unwrap();

        let protection_failures = IntCounter::new(
            "hotpatch_protection_failures_total",
            "Total number of page protection failures",
        )
        .unwrap();

        let bytes_modified = IntCounter::new(
            "hotpatch_bytes_modified_total",
            "Total number of bytes written by patches",
        )
        .unwrap();

        let attached_bytes = IntGauge::new(
            "hotpatch_attached_bytes",
            "Size of the currently attached model region",
        )
        .unwrap();

        let apply_duration = Histogram::with_opts(
            HistogramOpts::new(
                "hotpatch_apply_duration_seconds",
                "Patch apply duration in seconds",
            )
            .buckets(vec![0.000001, 0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]),
        )
        .unwrap();

        // Pipeline metrics
        let requests_processed = IntCounter::new(
            "pipeline_requests_processed_total",
            "Total number of requests processed",
        )
        .unwrap();

        let responses_processed = IntCounter::new(
            "pipeline_responses_processed_total",
            "Total number of responses processed",
        )
        .unwrap();

        let chunks_processed = IntCounter::new(
            "pipeline_chunks_processed_total",
            "Total number of stream chunks processed",
        )
        .unwrap();

        let streams_terminated = IntCounter::new(
            "pipeline_streams_terminated_total",
            "Total number of streams terminated early",
        )
        .unwrap();

        let cache_hits = IntCounter::new("pipeline_cache_hits_total", "Total response cache hits")
            .unwrap();

        let cache_misses =
            IntCounter::new("pipeline_cache_misses_total", "Total response cache misses").unwrap();

        let validation_failures = IntCounter::new(
            "pipeline_validation_failures_total",
            "Total number of agent outputs failing validation",
        )
        .unwrap();

        let processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pipeline_processing_duration_seconds",
                "Request/response processing duration in seconds",
            )
            .buckets(vec![0.00001, 0.0001, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )
        .unwrap();

        // Register all metrics
        registry.register(Box::new(patches_applied.clone())).unwrap();
        registry.register(Box::new(patches_reverted.clone())).unwrap();
        registry.register(Box::new(patches_failed.clone())).unwrap();
        registry.register(Box::new(conflicts_detected.clone())).unwrap();
        registry.register(Box::new(integrity_failures.clone())).unwrap();
        registry.register(Box::new(protection_failures.clone())).unwrap();
        registry.register(Box::new(bytes_modified.clone())).unwrap();
        registry.register(Box::new(attached_bytes.clone())).unwrap();
        registry.register(Box::new(apply_duration.clone())).unwrap();

        registry.register(Box::new(requests_processed.clone())).unwrap();
        registry.register(Box::new(responses_processed.clone())).unwrap();
        registry.register(Box::new(chunks_processed.clone())).unwrap();
        registry.register(Box::new(streams_terminated.clone())).unwrap();
        registry.register(Box::new(cache_hits.clone())).unwrap();
        registry.register(Box::new(cache_misses.clone())).unwrap();
        registry.register(Box::new(validation_failures.clone())).unwrap();
        registry.register(Box::new(processing_duration.clone())).unwrap();

        let hotpatch = HotpatchMetrics {
            patches_applied,
            patches_reverted,
            patches_failed,
            conflicts_detected,
            integrity_failures,
            protection_failures,
            bytes_modified,
            attached_bytes,
            apply_duration,
        };

        let pipeline = PipelineMetrics {
            requests_processed,
            responses_processed,
            chunks_processed,
            streams_terminated,
            cache_hits,
            cache_misses,
            validation_failures,
            processing_duration,
        };

        MetricsRegistry {
            registry,
            hotpatch,
            pipeline,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.hotpatch.patches_applied.inc();
        metrics.hotpatch.bytes_modified.inc_by(32);
        metrics.pipeline.cache_hits.inc();

        let output = metrics.gather();
        assert!(output.contains("hotpatch_patches_applied_total"));
        assert!(output.contains("hotpatch_bytes_modified_total 32"));
        assert!(output.contains("pipeline_cache_hits_total 1"));
    }
}
