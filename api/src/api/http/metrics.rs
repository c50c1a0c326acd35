use axum::{http::header, response::IntoResponse};
use ringkeeper_core::METRICS;

/// GET /metrics - Prometheus-formatted metrics endpoint
///
/// Served from in-memory atomic counters; a scrape never touches the store.
pub async fn metrics() -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        METRICS.to_prometheus(),
    )
}
