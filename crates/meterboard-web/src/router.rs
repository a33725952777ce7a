//! Web router using Axum

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use meterboard_core::Meter;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{self, NodeAuthenticator, SharedTokenAuth};
use crate::error::blocking;
use crate::node_api;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub meter: Arc<Meter>,
    pub auth: Arc<dyn NodeAuthenticator>,
}

/// Create the router, authenticating nodes with the configured shared token
pub fn create_router(meter: Arc<Meter>) -> Router {
    let auth = Arc::new(SharedTokenAuth::new(meter.config().node.server_token.clone()));
    create_router_with_auth(meter, auth)
}

pub fn create_router_with_auth(meter: Arc<Meter>, auth: Arc<dyn NodeAuthenticator>) -> Router {
    let state = AppState { meter, auth };

    let node_routes = Router::new()
        .route("/config", get(node_api::config))
        .route("/user", get(node_api::users))
        .route("/push", post(node_api::push))
        .route("/alive", post(node_api::alive))
        .route("/alivelist", get(node_api::alive_list))
        .route("/status", post(node_api::status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate_node,
        ));

    Router::new()
        .nest("/api/v1/server/UniProxy", node_routes.clone())
        .nest("/api/v2/server", node_routes)
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store = Arc::clone(state.meter.store());
    match blocking(move || store.read(|ledger| ledger.schema_version())).await {
        Ok(version) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "schema_version": version,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "error": e.message,
            })),
        ),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.meter.render_metrics(),
    )
}
