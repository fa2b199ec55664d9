pub mod health;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// All hub routes: the health probe and the WebSocket gateway.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .route("/ws", get(ws::ws_handler))
}
