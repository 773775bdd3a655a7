use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static DESCRIBED: OnceCell<()> = OnceCell::new();

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and describe the pipeline metrics.
    pub fn init() -> Result<Self, BuildError> {
        // Use default buckets to avoid API differences across crate versions.
        let handle = PrometheusBuilder::new().install_recorder()?;
        describe();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// Register descriptions once per process.
pub fn describe() {
    DESCRIBED.get_or_init(|| {
        describe_counter!("autoupdate_cycles_total", "Orchestrator cycles started");
        describe_counter!("autoupdate_commits_total", "Auto-update versions committed");
        describe_counter!("autoupdate_rejections_total", "Candidates rejected, by stage");
        describe_counter!("autoupdate_rollbacks_total", "Health-triggered rollbacks");
        describe_counter!("autoupdate_fetch_errors_total", "Failed source fetches");
        describe_gauge!("autoupdate_active_version", "Version id of the active snapshot");
        describe_gauge!("autoupdate_pattern_count", "Patterns in the active snapshot");
        describe_histogram!(
            "autoupdate_validation_ms",
            Unit::Milliseconds,
            "Validation time per candidate"
        );
    });
}
