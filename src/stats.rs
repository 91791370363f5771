//! Internal telemetry of the discovery engine.

use std::time::Duration;

use metrics::{Counter, Metric, Registry, exponential_buckets};

/// Receives the engine's RPC observations.
pub trait Metrics: Send + Sync + 'static {
    /// A catalog call failed.
    fn rpc_failure(&self);

    /// A catalog call finished, successfully or not.
    fn rpc_duration(&self, endpoint: &'static str, call: &'static str, elapsed: Duration);
}

/// Drops every observation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn rpc_failure(&self) {}

    fn rpc_duration(&self, _endpoint: &'static str, _call: &'static str, _elapsed: Duration) {}
}

/// Records observations into a [`Registry`].
#[derive(Clone)]
pub struct RegistryMetrics {
    failures: Counter,
    durations: Metric<metrics::Histogram>,
}

impl RegistryMetrics {
    pub fn new(registry: &Registry) -> Self {
        let failures = registry
            .register_counter(
                "sd_consul_rpc_failures_total",
                "The number of Consul RPC call failures.",
            )
            .recorder(metrics::Attributes::default());
        let durations = registry.register_histogram(
            "sd_consul_rpc_duration_seconds",
            "The duration of a Consul RPC call in seconds.",
            &exponential_buckets(0.005, 2.0, 14),
        );

        RegistryMetrics {
            failures,
            durations,
        }
    }
}

impl Metrics for RegistryMetrics {
    fn rpc_failure(&self) {
        self.failures.inc(1);
    }

    fn rpc_duration(&self, endpoint: &'static str, call: &'static str, elapsed: Duration) {
        self.durations
            .recorder([("endpoint", endpoint), ("call", call)])
            .record(elapsed.as_secs_f64());
    }
}
