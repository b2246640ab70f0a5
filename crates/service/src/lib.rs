//! Relay service: runs the outbox publisher and inbox processor for one
//! service's message store and exposes operational endpoints.

pub mod config;
pub mod routes;
pub mod workers;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, LogFormat};
pub use workers::Workers;

/// Creates the operational router: `/health` and `/metrics`.
pub fn create_app(metrics_handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/health", get(routes::health::check))
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
