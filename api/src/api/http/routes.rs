use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::api::http::{instances, metrics};
use crate::state::AppState;

/// Build the full router: the membership surface under `/v1/instances` plus
/// health and metrics.
pub fn app_routes(state: AppState) -> Router {
    tracing::debug!("Building routes");

    let instance_routes = Router::new()
        .route(
            "/v1/instances",
            get(instances::list_instances).post(instances::create_instance),
        )
        .route(
            "/v1/instances/:id",
            get(instances::get_instance).delete(instances::delete_instance),
        )
        .with_state(state);

    Router::new()
        .merge(instance_routes)
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics))
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "OK"
}
