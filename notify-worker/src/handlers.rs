use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use notify_common::health::HealthRegistry;
use notify_common::metrics::{setup_metrics_routes, track_metrics};

/// The worker's HTTP surface: an index, the Kubernetes probes and, when a recorder is
/// installed, `/metrics`.
pub fn app(name: &str, liveness: HealthRegistry, metrics: Option<PrometheusHandle>) -> Router {
    let index = format!("notify worker {name}");
    let router = Router::new()
        .route("/", routing::get(move || std::future::ready(index)))
        .route("/_readiness", routing::get(|| async { "ok" }))
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        );

    match metrics {
        Some(recorder_handle) => setup_metrics_routes(router, recorder_handle),
        None => router.layer(axum::middleware::from_fn(track_metrics)),
    }
}
