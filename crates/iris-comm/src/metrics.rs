//! ---
//! iris_section: "03-persistence-logging"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Prometheus instrumentation of comm links."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    self, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};

use crate::error::FaultClass;

/// Shared registry type used across links.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Metrics published by every poller.
#[derive(Clone)]
pub struct PollerMetrics {
    registry: SharedRegistry,
    operations_total: IntCounterVec,
    faults_total: IntCounterVec,
    retries_total: IntCounterVec,
    phase_seconds: HistogramVec,
    queue_depth: IntGaugeVec,
    line_load: prometheus::GaugeVec,
}

impl PollerMetrics {
    /// Register the poller metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let operations_total = IntCounterVec::new(
            Opts::new(
                "iris_comm_operations_total",
                "Operations cleaned up, by link and outcome",
            ),
            &["link", "outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let faults_total = IntCounterVec::new(
            Opts::new(
                "iris_comm_faults_total",
                "Faults raised while polling, by link and fault class",
            ),
            &["link", "class"],
        )?;
        registry.register(Box::new(faults_total.clone()))?;

        let retries_total = IntCounterVec::new(
            Opts::new("iris_comm_retries_total", "Phase retries scheduled per link"),
            &["link"],
        )?;
        registry.register(Box::new(retries_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "iris_comm_phase_seconds",
            "Duration of one phase round trip",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 14)?);
        let phase_seconds = HistogramVec::new(histogram_opts, &["link"])?;
        registry.register(Box::new(phase_seconds.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("iris_comm_queue_depth", "Operations waiting on a link"),
            &["link"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let line_load = prometheus::GaugeVec::new(
            Opts::new(
                "iris_comm_line_load",
                "Fraction of the last sampling interval spent polling",
            ),
            &["link"],
        )?;
        registry.register(Box::new(line_load.clone()))?;

        Ok(Self {
            registry,
            operations_total,
            faults_total,
            retries_total,
            phase_seconds,
            queue_depth,
            line_load,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Count a cleaned-up operation.
    pub fn record_operation(&self, link: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.operations_total
            .with_label_values(&[link, outcome])
            .inc();
    }

    /// Count a fault.
    pub fn record_fault(&self, link: &str, class: FaultClass) {
        self.faults_total
            .with_label_values(&[link, class.as_str()])
            .inc();
    }

    /// Count a scheduled retry.
    pub fn record_retry(&self, link: &str) {
        self.retries_total.with_label_values(&[link]).inc();
    }

    /// Record the duration of one phase.
    pub fn observe_phase(&self, link: &str, duration: Duration) {
        self.phase_seconds
            .with_label_values(&[link])
            .observe(duration.as_secs_f64());
    }

    /// Publish the current queue depth.
    pub fn set_queue_depth(&self, link: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[link])
            .set(depth as i64);
    }

    /// Publish the latest line load sample.
    pub fn set_line_load(&self, link: &str, load: f32) {
        self.line_load.with_label_values(&[link]).set(load as f64);
    }
}

impl std::fmt::Debug for PollerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_count() {
        let registry = new_registry();
        let metrics = PollerMetrics::new(registry.clone()).unwrap();
        metrics.record_operation("line-1", true);
        metrics.record_fault("line-1", FaultClass::Decode);
        metrics.set_queue_depth("line-1", 3);

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"iris_comm_operations_total".to_string()));
        assert!(names.contains(&"iris_comm_faults_total".to_string()));
        assert!(names.contains(&"iris_comm_queue_depth".to_string()));
        assert!(PollerMetrics::new(registry).is_err());
    }
}
