//! HTTP Listener Plumbing
//!
//! Bind-and-serve shared by the public (webhook) and health listeners.

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serve `app` on all interfaces until `cancel` fires.
///
/// # Errors
///
/// Returns `HttpServerError` if binding fails or the server stops with
/// an I/O error.
pub async fn serve(
    name: &'static str,
    port: u16,
    app: Router,
    cancel: CancellationToken,
) -> Result<(), HttpServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| HttpServerError::BindFailed(port, e.to_string()))?;

    tracing::info!(server = name, port, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

    tracing::info!(server = name, "HTTP server stopped");
    Ok(())
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}
