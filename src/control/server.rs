//! Control-plane HTTP server
//!
//! A small façade for external automation, kept wire-compatible with the
//! bridge's legacy API: a status probe, a global volume setter, and a
//! reserved speech-injection endpoint. The interactive UI does not go
//! through HTTP; it holds a read handle on the state directly.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::group::GroupManager;
use crate::state::AppState;

/// Shared state handed to all request handlers.
#[derive(Clone)]
pub struct ControlState {
    pub app: AppState,
    pub manager: Arc<GroupManager>,
}

/// The control-plane server.
pub struct ControlServer {
    state: ControlState,
}

impl ControlServer {
    pub fn new(app: AppState, manager: Arc<GroupManager>) -> Self {
        Self {
            state: ControlState { app, manager },
        }
    }

    /// Build the router; split out so tests can drive it without a socket.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/status", get(super::handlers::get_status))
            .route("/api/volume", post(super::handlers::set_volume))
            .route("/api/speak", post(super::handlers::speak))
            .with_state(self.state.clone())
    }

    /// Bind on all interfaces and serve until the task is aborted.
    pub async fn serve(self, port: u16) -> std::io::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Control API listening on http://{}", addr);
        axum::serve(listener, self.router()).await
    }
}
