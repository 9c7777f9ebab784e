//! HTTP scrape endpoint.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast;
use tracing::info;

use super::prometheus::metrics_handler;

/// Router serving `GET /metrics`.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serves `app` on `addr` until a shutdown signal is broadcast.
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}
