use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on `bind` and serve `router` until `shutdown` resolves.
pub async fn serve<F>(router: Router, bind: &str, shutdown: F) -> Result<(), std::io::Error>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Add a `/metrics` route rendering `recorder_handle`, and track HTTP metrics for every route.
pub fn setup_metrics_routes(router: Router, recorder_handle: PrometheusHandle) -> Router {
    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()?;

    describe_engine_metrics();
    Ok(handle)
}

fn describe_engine_metrics() {
    describe_counter!(
        "notify_fetched_total",
        "Notifications returned by the discovery loop's repository polls"
    );
    describe_counter!(
        "notify_rejected_total",
        "Notifications permanently rejected by the rule engine"
    );
    describe_counter!(
        "notify_queued_total",
        "Notifications admitted into the processing queue"
    );
    describe_counter!(
        "notify_completed_total",
        "Notifications whose pipeline completed"
    );
    describe_counter!(
        "notify_failed_total",
        "Processing failures, labelled by the state they led to"
    );
    describe_counter!(
        "notify_rule_evaluations_total",
        "Rule engine evaluations, labelled by outcome"
    );
    describe_counter!(
        "notify_audit_events_dropped",
        "Audit events that could not be written"
    );
    describe_counter!(
        "notify_ingested_total",
        "Notifications created by ingestion adapters, labelled by channel"
    );
    describe_counter!(
        "notify_ruleset_reloads_total",
        "Ruleset reload attempts, labelled by result"
    );
    describe_counter!(
        "notify_step_failures_total",
        "Pipeline step failures, labelled by step"
    );
    describe_gauge!(
        "notify_workers_busy",
        "Processing workers currently running a pipeline"
    );
    describe_gauge!("notify_queue_depth", "Notifications waiting in the queue");
    describe_histogram!(
        "notify_pipeline_duration_seconds",
        Unit::Seconds,
        "Time spent running the whole pipeline for one notification"
    );
    describe_histogram!(
        "notify_step_duration_seconds",
        Unit::Seconds,
        "Time spent in a single pipeline step"
    );
}

/// Middleware to record some common HTTP metrics.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
