use axum::{extract::State, middleware, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::{auth::require_auth, AppState};

pub fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/positions", get(get_positions))
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

// ─── Positions ────────────────────────────────────────────────────────────────

/// Open positions as of the last finished cycle.
async fn get_positions(State(state): State<AppState>) -> Json<Value> {
    let positions = state.engine.positions().await;
    Json(json!({
        "total_open": positions.len(),
        "positions": positions,
    }))
}
