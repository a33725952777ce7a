//! Node authentication
//!
//! Every node request carries `token`, `node_id` and optionally `node_type`
//! as query parameters. The middleware resolves the node once and hands it to
//! handlers as an `Extension<Node>`.

use crate::error::{blocking, ApiError};
use crate::router::AppState;
use axum::extract::{Query, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use meterboard_core::models::{Node, NodeId};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Decides whether a presented node token is valid
pub trait NodeAuthenticator: Send + Sync {
    fn verify(&self, node_id: NodeId, token: &str) -> bool;
}

/// One secret shared by every node
pub struct SharedTokenAuth {
    token: String,
}

impl SharedTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        if token.is_empty() {
            warn!("No node token configured; every node request will be refused");
        }
        Self { token }
    }
}

impl NodeAuthenticator for SharedTokenAuth {
    fn verify(&self, _node_id: NodeId, token: &str) -> bool {
        if self.token.is_empty() || token.len() != self.token.len() {
            return false;
        }
        // Compare every byte regardless of where the first mismatch is
        token
            .bytes()
            .zip(self.token.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct NodeQuery {
    pub token: Option<String>,
    pub node_id: Option<String>,
    pub node_type: Option<String>,
}

/// Map protocol aliases onto the name stored for the node
pub fn normalize_node_type(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "v2ray" => "vmess".to_string(),
        "hysteria2" => "hysteria".to_string(),
        _ => lowered,
    }
}

/// Authenticate the node, then attach it to the request
pub async fn authenticate_node(
    State(state): State<AppState>,
    Query(query): Query<NodeQuery>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let node_id = match query.node_id.as_deref().map(str::trim) {
        None | Some("") => return Err(ApiError::bad_request("node_id is required")),
        Some(raw) => raw
            .parse::<NodeId>()
            .map_err(|_| ApiError::bad_request(format!("invalid node_id: {raw}")))?,
    };

    let token = query.token.as_deref().unwrap_or_default();
    if !state.auth.verify(node_id, token) {
        debug!(node_id, "Rejected node token");
        return Err(ApiError::unauthorized("invalid token"));
    }

    let meter = Arc::clone(&state.meter);
    let node: Node = blocking(move || meter.node(node_id)).await?;

    if let Some(requested) = query.node_type.as_deref().filter(|t| !t.trim().is_empty()) {
        let requested = normalize_node_type(requested);
        if requested != normalize_node_type(&node.node_type) {
            warn!(node_id, requested = %requested, actual = %node.node_type, "Node type mismatch");
            return Err(ApiError::bad_request("node type mismatch"));
        }
    }

    request.extensions_mut().insert(node);
    Ok(next.run(request).await)
}
