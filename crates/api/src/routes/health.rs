use axum::extract::State;
use axum::{routing::get, Json, Router};

use crate::query::HubHealth;
use crate::state::AppState;

/// GET /health -- buffer sizes, alert count and live connections.
async fn health_check(State(state): State<AppState>) -> Json<HubHealth> {
    Json(state.query.health())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
