//! Idle-aware lifecycle controller for one on-demand compute instance.
//!
//! Client requests pass through a sliding-window rate limiter and are
//! recorded as activity; the remote worker reports liveness through
//! heartbeats; a periodic decision loop stops the instance when both
//! signals say nobody needs it.

pub mod activity;
pub mod clock;
pub mod config;
pub mod control;
pub mod control_plane;
pub mod error;
pub mod handlers;
pub mod heartbeat;
pub mod instance;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod state;
pub mod store;
pub mod worker;

use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

use crate::handlers::{
    activity_check_handler, chat_handler, control_action_handler, control_body_handler,
    control_status_handler, health_handler, heartbeat_handler, metrics_handler,
};
use crate::state::AppState;

// creating the router with routes
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/chat", post(chat_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/activity/check", get(activity_check_handler))
        .route("/control", post(control_body_handler))
        .route(
            "/control/status",
            get(control_status_handler).post(control_status_handler),
        )
        .route("/control/{action}", post(control_action_handler))
        .with_state(state)
}
