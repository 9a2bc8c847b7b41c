//! HTTP gateway - synchronous submit + diagnostic queries
//!
//! Transport wiring is deliberately thin: the handlers delegate to the
//! pipeline and the stores, and every response uses the standard envelope.

pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;

use axum::{routing::get, routing::post, Router};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

/// Build the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/trades", post(handlers::submit_trade))
        .route("/api/v1/positions", get(handlers::search_positions))
        .route(
            "/api/v1/positions/by-upi/{upi}",
            get(handlers::get_position_by_upi),
        )
        .route(
            "/api/v1/positions/{position_key}",
            get(handlers::get_position),
        )
        .route(
            "/api/v1/positions/{position_key}/events",
            get(handlers::get_position_events),
        )
        .route(
            "/api/v1/positions/{position_key}/upi-history",
            get(handlers::get_upi_history),
        )
        .route("/healthz", get(handlers::health))
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", openapi::ApiDoc::openapi()),
        )
        .with_state(state)
}
