//! meterboard-web - Node-facing HTTP API for meterboard using Axum

pub mod auth;
pub mod error;
pub mod node_api;
pub mod router;

pub use auth::{NodeAuthenticator, SharedTokenAuth};
pub use error::ApiError;
pub use router::{create_router, create_router_with_auth, AppState};

use anyhow::{Context, Result};
use meterboard_core::Meter;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Run the web server until `shutdown` resolves
pub async fn run(
    meter: Arc<Meter>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(meter);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Web server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
