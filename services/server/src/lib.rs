// server: Library entry point.
// Exposes modules for integration testing.

pub mod commands;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod filter;
pub mod session;
pub mod state;
pub mod stats;

use axum::{Router, routing::get};
use std::net::SocketAddr;

use state::AppState;

/// The subscriber-facing WebSocket router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(session::ws_subscriber_handler))
        .with_state(state)
}

/// Serve the subscriber endpoint on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
