use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Liveness probe, also reporting how many saves and requests are in flight.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "pending_saves": state.engine.pending_count(),
        "pending_requests": state.request_log.open_count(),
    }))
}
