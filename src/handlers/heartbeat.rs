use axum::Json;
use axum::extract::State;
use std::sync::Arc;

use crate::models::HeartbeatAck;
use crate::state::AppState;

// Liveness pulse from the remote worker
pub async fn heartbeat_handler(State(state): State<Arc<AppState>>) -> Json<HeartbeatAck> {
    let receipt = state.service.heartbeat().await;
    Json(HeartbeatAck {
        status: "ok".to_string(),
        timestamp: receipt.last_heartbeat,
        degraded: receipt.degraded,
    })
}
