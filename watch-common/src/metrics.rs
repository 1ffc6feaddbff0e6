use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Add a `/metrics` route rendering the installed Prometheus recorder.
/// Installing a global recorder is process-wide, so this should only be called once.
pub fn with_metrics_route(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router.route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    ))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Delivery calls are slow compared to HTTP handling, and backoff can keep
    // an event queued for tens of seconds.
    const DELIVERY_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets(DELIVERY_SECONDS)?
        .install_recorder()?;

    describe_watch_metrics();

    Ok(handle)
}

fn describe_watch_metrics() {
    describe_counter!(
        "watch_messages_total",
        "Messages received by the pipeline, by type and outcome."
    );
    describe_counter!(
        "watch_events_skipped_total",
        "Candidate events rejected by the suppression window."
    );
    describe_counter!(
        "watch_events_queued_total",
        "Candidate events accepted into the delivery queue."
    );
    describe_counter!(
        "watch_delivery_attempts_total",
        "Delivery attempts against the collector, by result."
    );
    describe_counter!(
        "watch_events_delivered_total",
        "Events acknowledged by the collector."
    );
    describe_counter!(
        "watch_events_dropped_total",
        "Events dropped after exhausting their delivery attempts."
    );
    describe_histogram!(
        "watch_delivery_duration_seconds",
        Unit::Seconds,
        "Time spent in a single delivery attempt."
    );
    describe_gauge!(
        "watch_queue_depth",
        "Events currently held by the delivery queue."
    );
    describe_counter!(
        "watch_observer_evaluations_total",
        "Evaluations run by the observer, by result."
    );
    describe_counter!(
        "watch_sideload_total",
        "Document resources posted to the collector, by result."
    );
}

/// Middleware to record some common HTTP metrics
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
