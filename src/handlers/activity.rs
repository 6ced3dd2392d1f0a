use axum::Json;
use axum::extract::State;
use std::sync::Arc;

use crate::activity::ActivityReport;
use crate::state::AppState;

pub async fn activity_check_handler(State(state): State<Arc<AppState>>) -> Json<ActivityReport> {
    Json(state.activity.report(state.idle_timeout).await)
}
