use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitDecision;

// Attached to every admitted /chat answer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub reset_at: DateTime<Utc>,
}

impl From<&RateLimitDecision> for RateLimitInfo {
    fn from(decision: &RateLimitDecision) -> Self {
        Self {
            remaining: decision.remaining,
            reset_at: decision.reset_at,
        }
    }
}

// 429 body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRejection {
    pub error: String,
    pub message: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub reset_at: DateTime<Utc>,
    pub remaining: u32,
}

impl RateLimitRejection {
    pub fn new(reset_at: DateTime<Utc>, retry_after_secs: u64) -> Self {
        Self {
            error: "rate_limit_exceeded".to_string(),
            message: format!("Too many requests. Try again in {} seconds.", retry_after_secs),
            reset_at,
            remaining: 0,
        }
    }
}

// Answer to POST /heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

// POST /control body
#[derive(Debug, Clone, Deserialize)]
pub struct ActionRequest {
    pub action: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}
