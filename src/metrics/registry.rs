use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for retry/backoff wait times (seconds).
const BACKOFF_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Must be called **once** at startup before any `counter!` / `gauge!` /
    /// `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_wait_seconds".to_string()),
                BACKOFF_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- registration ---
        describe_gauge!(
            "mesh_registration_state",
            Unit::Count,
            "Registration agent state (0=Starting 1=Advertising 2=Reconciling 3=WaitingDone 4=Retrying 5=Stopped)"
        );
        describe_counter!(
            "mesh_lease_renewals_total",
            Unit::Count,
            "Total successful lease keepalive renewals"
        );
        describe_counter!(
            "mesh_lease_lost_total",
            Unit::Count,
            "Total times the lease was lost and a re-registration was required"
        );
        describe_counter!(
            "mesh_retry_attempts_total",
            Unit::Count,
            "Total registration retry-loop probe attempts"
        );
        describe_histogram!(
            "mesh_retry_wait_seconds",
            Unit::Seconds,
            "Backoff wait between retry-loop probe attempts"
        );

        // --- discovery ---
        describe_gauge!(
            "mesh_discovered_instances",
            Unit::Count,
            "Number of healthy instances known per service"
        );
        describe_counter!(
            "mesh_discovery_watch_events_total",
            Unit::Count,
            "Total watch events applied to the discovery client"
        );
        describe_counter!(
            "mesh_discovery_reconnects_total",
            Unit::Count,
            "Total watch stream reconnects"
        );

        // --- load balancing ---
        describe_counter!(
            "mesh_balancer_selections_total",
            Unit::Count,
            "Total instance selections per balancer kind"
        );
        describe_counter!(
            "mesh_balancer_no_healthy_total",
            Unit::Count,
            "Total selections that failed because no healthy instance was available"
        );

        // --- connection pool ---
        describe_gauge!(
            "mesh_pool_channels_active",
            Unit::Count,
            "Number of dialed channels currently held per service"
        );
        describe_counter!(
            "mesh_pool_dials_total",
            Unit::Count,
            "Total channels dialed"
        );
        describe_counter!(
            "mesh_pool_idle_reaps_total",
            Unit::Count,
            "Total channels closed by the idle reaper"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
