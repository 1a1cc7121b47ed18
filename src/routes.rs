use axum::{routing::get, Router};
use std::time::Duration;

use crate::chat::presence;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the axum Router: the WebSocket upgrade plus the presence endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::ws_upgrade))
        .route(
            "/api/presence",
            get(presence::get_presence).put(presence::update_presence),
        )
        .route("/api/presence/{user_id}", get(presence::get_user_presence))
        .with_state(state)
}

/// Periodically drop throttle state for users who have gone quiet.
pub fn spawn_throttle_cleanup(state: &AppState, every: Duration) -> tokio::task::JoinHandle<()> {
    let router = state.router.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            let pruned = router.throttle().prune_idle();
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned idle throttle state");
            }
        }
    })
}
