use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::control::ControlCommand;
use crate::error::ControlError;
use crate::models::ActionRequest;
use crate::state::AppState;

async fn run(state: &AppState, command: ControlCommand) -> Result<Response, ControlError> {
    let response = state.service.execute(command).await?;
    Ok((response.http_status(), Json(response)).into_response())
}

pub async fn control_status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Response, ControlError> {
    run(&state, ControlCommand::Status).await
}

// POST /control/{action}
pub async fn control_action_handler(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
) -> Result<Response, ControlError> {
    let command: ControlCommand = action.parse()?;
    run(&state, command).await
}

// POST /control with {"action": "..."}
pub async fn control_body_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ActionRequest>,
) -> Result<Response, ControlError> {
    let command: ControlCommand = body.action.parse()?;
    run(&state, command).await
}
