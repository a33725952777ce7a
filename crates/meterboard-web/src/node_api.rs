//! Handlers for the relay-node protocol

use crate::error::{blocking, ApiError};
use crate::router::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use meterboard_core::models::{Node, SubscriberId};
use meterboard_core::Conditional;
use meterboard_types::{Acknowledgement, AliveList, NodeStatusReport};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Serve `payload` with an `ETag`, or 304 when the node already has it
fn conditional_json<T: Serialize>(headers: &HeaderMap, payload: &T) -> Result<Response, ApiError> {
    let validator = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok());
    let conditional = Conditional::evaluate(payload, validator)?;
    let etag = HeaderValue::from_str(&conditional.tag().header_value())
        .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))?;

    let response = match conditional {
        Conditional::NotModified { .. } => (StatusCode::NOT_MODIFIED, [(ETAG, etag)]).into_response(),
        Conditional::Fresh { body, .. } => (
            StatusCode::OK,
            [
                (ETAG, etag),
                (CONTENT_TYPE, HeaderValue::from_static("application/json")),
            ],
            body,
        )
            .into_response(),
    };
    Ok(response)
}

/// `GET config`
pub async fn config(
    State(state): State<AppState>,
    Extension(node): Extension<Node>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let config = state.meter.runtime_config(&node);
    conditional_json(&headers, &config)
}

/// `GET user`
pub async fn users(
    State(state): State<AppState>,
    Extension(node): Extension<Node>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let meter = Arc::clone(&state.meter);
    let node_id = node.id;
    let users = blocking(move || meter.authorized_users(node_id, Utc::now())).await?;
    conditional_json(&headers, &users)
}

/// `POST push`
pub async fn push(
    State(state): State<AppState>,
    Extension(node): Extension<Node>,
    body: Bytes,
) -> Result<Json<Acknowledgement>, ApiError> {
    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        debug!(node_id = node.id, error = %e, "Undecodable traffic push");
        ApiError::invalid_data()
    })?;

    let outcome = state.meter.ingest().ingest(node.id, payload).await?;
    if !outcome.is_clean() {
        info!(
            node_id = node.id,
            received = outcome.received,
            applied = outcome.applied,
            malformed = outcome.malformed,
            rejected = outcome.rejected,
            failed = outcome.failed,
            "Traffic push partially applied"
        );
    }
    Ok(Json(Acknowledgement::ok("ok")))
}

/// `POST alive`
pub async fn alive(
    State(state): State<AppState>,
    Extension(node): Extension<Node>,
    body: Bytes,
) -> Result<Json<Acknowledgement>, ApiError> {
    let alive: BTreeMap<SubscriberId, Vec<String>> =
        serde_json::from_slice(&body).map_err(|_| ApiError::invalid_data())?;

    let devices = Arc::clone(state.meter.devices());
    let node_id = node.id;
    blocking(move || devices.record_batch(node_id, &alive, Utc::now())).await?;
    Ok(Json(Acknowledgement::bare()))
}

/// `GET alivelist`
pub async fn alive_list(State(state): State<AppState>) -> Result<Json<AliveList>, ApiError> {
    let devices = Arc::clone(state.meter.devices());
    let alive = blocking(move || devices.all_device_counts(Utc::now())).await?;
    Ok(Json(AliveList { alive }))
}

/// `POST status`
pub async fn status(
    State(state): State<AppState>,
    Extension(node): Extension<Node>,
    body: Bytes,
) -> Result<Json<Acknowledgement>, ApiError> {
    let report: NodeStatusReport =
        serde_json::from_slice(&body).map_err(|_| ApiError::invalid_data())?;

    let meter = Arc::clone(&state.meter);
    let node_id = node.id;
    blocking(move || meter.record_status(node_id, &report, Utc::now())).await?;
    Ok(Json(Acknowledgement::ok("success")))
}
