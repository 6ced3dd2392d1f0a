use axum::Json;
use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::metrics::REQUEST_TOTAL;
use crate::models::{RateLimitInfo, RateLimitRejection};
use crate::rate_limit::RateLimitDecision;
use crate::state::{AppState, CHAT_SCOPE};
use crate::store::Outcome;

const MAX_BODY_BYTES: usize = 1024 * 1024;

// First X-Forwarded-For hop, else the peer address, else "unknown"
pub(crate) fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (forwarded, peer) {
        (Some(hop), _) => hop.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

// The payload must be a JSON object carrying a non-blank `message`
fn parse_payload(body: &[u8]) -> Result<Value, String> {
    let payload: Value = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    match payload.get("message").and_then(Value::as_str) {
        Some(message) if !message.trim().is_empty() => Ok(payload),
        Some(_) => Err("message must not be empty".to_string()),
        None => Err("message is required".to_string()),
    }
}

// Rate-limited client action. Only well-formed requests reach the limiter;
// admitted ones count as activity and are forwarded to the upstream service
// when one is configured.
pub async fn chat_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    REQUEST_TOTAL.inc();

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => return bad_request(&e.to_string()),
    };
    let payload = match parse_payload(&body) {
        Ok(payload) => payload,
        Err(message) => {
            debug!(%message, "rejecting malformed chat request");
            return bad_request(&message);
        }
    };

    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = client_identity(&parts.headers, peer);
    let now = state.clock.now();

    let (decision, degraded) = match state
        .limiter
        .check_and_admit(CHAT_SCOPE, &identity, state.rate_limit, state.rate_window, now)
        .await
    {
        Outcome::Ok(decision) => (decision, false),
        Outcome::Degraded { value, .. } => (value, true),
    };

    if !decision.allowed {
        let retry_after = decision.retry_after_secs(now);
        let body = RateLimitRejection::new(decision.reset_at, retry_after);
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        decorate(response.headers_mut(), &decision, degraded);
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    state.activity.touch(&identity).await;

    let limit = RateLimitInfo::from(&decision);
    let mut response = match &state.upstream_url {
        Some(upstream) => forward(&state.client, upstream, &payload, limit).await,
        None => (
            StatusCode::OK,
            Json(json!({ "status": "accepted", "rate_limit": limit })),
        )
            .into_response(),
    };
    decorate(response.headers_mut(), &decision, degraded);
    response
}

async fn forward(client: &reqwest::Client, upstream: &str, payload: &Value, limit: RateLimitInfo) -> Response {
    let url = format!("{}/chat", upstream);
    let result = client.post(&url).json(payload).send().await;

    let res = match result {
        Ok(res) => res,
        Err(e) => {
            warn!(%url, error = %e, "upstream request failed");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "upstream_unavailable", "message": e.to_string() })),
            )
                .into_response();
        }
    };

    let status = StatusCode::from_u16(res.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut answer = match res.json::<Value>().await {
        Ok(answer) => answer,
        Err(e) => {
            warn!(%url, error = %e, "upstream returned a non-JSON answer");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "invalid_upstream_response", "message": e.to_string() })),
            )
                .into_response();
        }
    };
    debug!(%url, %status, "upstream answered");

    match answer.as_object_mut() {
        Some(object) => {
            object.insert("rate_limit".to_string(), json!(limit));
        }
        None => answer = json!({ "response": answer, "rate_limit": limit }),
    }
    (status, Json(answer)).into_response()
}

fn decorate(headers: &mut HeaderMap, decision: &RateLimitDecision, degraded: bool) {
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(decision.reset_at.timestamp()),
    );
    if degraded {
        headers.insert("x-ratelimit-degraded", HeaderValue::from_static("true"));
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "invalid_request", "message": message })),
    )
        .into_response()
}
