mod admin;
mod error;
mod routes;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Builds the full axum router: the public payment/request surface, plus an
/// admin-guarded surface for logs, autonomy, and live events (spec §6).
pub fn router(state: Arc<AppState>) -> Router<()> {
    let cors = if state.config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new().allow_origin(
            state
                .config
                .allowed_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect::<Vec<_>>(),
        )
    };

    let admin_routes = Router::new()
        .route("/logs/ledger", get(routes::query_ledger))
        .route("/logs/ledger/export", get(routes::export_ledger))
        .route("/sessions/{id}", get(routes::get_session))
        .route("/autonomy/queue", get(routes::autonomy_queue))
        .route("/events/stream", get(routes::events_stream))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin::require_admin));

    Router::new()
        .route("/request", post(routes::request_endpoint))
        .route("/payments/execute", post(routes::execute_payment))
        .route("/payments/balance", get(routes::get_balance))
        .route(
            "/payments/facilitator/callback",
            post(routes::facilitator_callback),
        )
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
