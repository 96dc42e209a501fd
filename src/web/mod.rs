//! HTTP control surface.
//!
//! ## Endpoints
//!
//! - `GET /backups` - list backups known to the backend
//! - `POST /backups` - trigger a backup (`202`, or `409` while one runs)
//! - `GET /backups/{id}` - backup status
//! - `DELETE /backups/{id}` - cancel the running backup or delete a stored one
//! - `GET /status` - daemon status and the outcome of the last run

mod routes;

use axum::{Router, routing::get};
use std::net::SocketAddr;
use tokio::sync::broadcast;

use crate::context::AppContext;

pub use routes::DaemonStatus;

/// Build the API router over the given context.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route(
            "/backups",
            get(routes::list_backups).post(routes::create_backup),
        )
        .route(
            "/backups/{id}",
            get(routes::get_backup).delete(routes::delete_backup),
        )
        .route("/status", get(routes::daemon_status))
        .with_state(ctx)
}

/// HTTP server for the control API.
pub struct WebServer {
    bind_addr: SocketAddr,
    ctx: AppContext,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebServer {
    /// Create a new web server bound to the given address.
    pub fn new(ctx: AppContext, bind_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            bind_addr,
            ctx,
            shutdown_tx,
        }
    }

    /// Start the web server. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let app = router(self.ctx.clone());

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "Listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
