use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use agent_lifecycle::build_router;
use agent_lifecycle::clock::ManualClock;
use agent_lifecycle::config::Settings;
use agent_lifecycle::control_plane::{InstanceState, SimulatedControlPlane};
use agent_lifecycle::instance::WaitPolicy;
use agent_lifecycle::state::AppState;
use agent_lifecycle::store::MemoryStore;

struct Harness {
    clock: Arc<ManualClock>,
    plane: Arc<SimulatedControlPlane>,
    state: Arc<AppState>,
    router: Router,
}

fn harness(initial: InstanceState, configure: impl FnOnce(&mut Settings)) -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 8, 15, 14, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let plane = Arc::new(
        SimulatedControlPlane::new("i-life", initial, clock.clone()).with_transition_polls(2),
    );

    let mut settings = Settings::new("i-life");
    settings.store_timeout = Duration::from_millis(200);
    settings.wait = WaitPolicy::new(Duration::from_millis(1), Duration::from_millis(100));
    configure(&mut settings);

    let state = Arc::new(AppState::assemble(&settings, store, plane.clone(), clock.clone()).unwrap());
    Harness {
        clock,
        plane,
        router: build_router(state.clone()),
        state,
    }
}

async fn post(router: &Router, uri: &str, forwarded_for: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method("POST").uri(uri);
    if let Some(ip) = forwarded_for {
        builder = builder.header("x-forwarded-for", ip);
    }
    // /chat wants a message, the control routes take no body
    let body = if uri == "/chat" {
        builder = builder.header("content-type", "application/json");
        Body::from(r#"{"message":"hi"}"#)
    } else {
        Body::empty()
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn silent_worker_without_clients_is_stopped() {
    let h = harness(InstanceState::Running, |_| {});
    post(&h.router, "/heartbeat", None).await;

    h.clock.advance(chrono::Duration::minutes(4));
    let (status, eval) = post(&h.router, "/control/check", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(eval["action"], "noop");
    assert_eq!(eval["status"], "ok");

    h.clock.advance(chrono::Duration::minutes(2));
    let (_, eval) = post(&h.router, "/control/check", None).await;
    assert_eq!(eval["action"], "stop_triggered");
    assert_eq!(eval["status"], "idle");
    assert_eq!(eval["stop"]["status"], "stopped");
    assert_eq!(h.plane.stop_calls(), 1);
}

#[tokio::test]
async fn recent_client_keeps_instance_up_past_heartbeat_timeout() {
    let h = harness(InstanceState::Running, |_| {});
    post(&h.router, "/heartbeat", None).await;

    h.clock.advance(chrono::Duration::seconds(354));
    let (status, _) = post(&h.router, "/chat", Some("192.0.2.10")).await;
    assert_eq!(status, StatusCode::OK);
    h.clock.advance(chrono::Duration::seconds(6));

    let (_, eval) = post(&h.router, "/control/check", None).await;
    assert_eq!(eval["action"], "noop");
    assert_eq!(eval["status"], "heartbeat_timeout");
    assert_eq!(eval["has_activity"], true);
    assert_eq!(h.plane.stop_calls(), 0);
}

#[tokio::test]
async fn decision_loop_is_idempotent_once_stopped() {
    let h = harness(InstanceState::Running, |_| {});

    h.clock.advance(chrono::Duration::minutes(10));
    let eval = h.state.decisions.evaluate().await.unwrap();
    assert_eq!(eval.status.as_str(), "orphaned");
    assert_eq!(h.plane.stop_calls(), 1);

    let eval = h.state.decisions.evaluate().await.unwrap();
    assert_eq!(eval.status.as_str(), "not_running");
    assert_eq!(h.plane.stop_calls(), 1);
}

#[tokio::test]
async fn operator_start_counts_as_first_heartbeat() {
    let h = harness(InstanceState::Stopped, |_| {});

    let (status, start) = post(&h.router, "/control/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(start["status"], "started");

    h.clock.advance(chrono::Duration::minutes(3));
    let (_, eval) = post(&h.router, "/control/check", None).await;
    assert_eq!(eval["status"], "ok");
    assert_eq!(eval["minutes_since_heartbeat"], 3.0);
}

#[tokio::test]
async fn wake_on_activity_restarts_a_stopped_instance() {
    let h = harness(InstanceState::Stopped, |s| s.wake_on_activity = true);

    let (status, _) = post(&h.router, "/chat", Some("192.0.2.20")).await;
    assert_eq!(status, StatusCode::OK);

    let (_, eval) = post(&h.router, "/control/check", None).await;
    assert_eq!(eval["action"], "start_triggered");
    assert_eq!(eval["status"], "woken");
    assert_eq!(eval["start"]["status"], "started");
    assert_eq!(h.plane.start_calls(), 1);
}

#[tokio::test]
async fn operator_cooldown_limits_start_stop() {
    let h = harness(InstanceState::Running, |s| s.action_cooldown = Duration::from_secs(60));

    let (status, _) = post(&h.router, "/control/stop", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post(&h.router, "/control/stop", None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["status"], "rate_limited");
    assert_eq!(body["retry_after"], 60);
    assert_eq!(body["instance_id"], "i-life");
    assert_eq!(body["action"], "stop");

    h.clock.advance(chrono::Duration::seconds(61));
    let (status, body) = post(&h.router, "/control/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_stopped");
}
