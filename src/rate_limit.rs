use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::metrics::{RATE_LIMITED_TOTAL, RATE_LIMIT_DEGRADED_TOTAL};
use crate::store::{KvStore, Outcome, WindowRequest, bounded, identity_digest};

// Result of one sliding-window admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    // seconds until reset, never below one while limited
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let secs = (self.reset_at - now).num_milliseconds().max(0) as u64;
        secs.div_ceil(1000).max(1)
    }
}

// Sliding-window limiter over the shared store.
//
// Each check is one atomic store primitive (prune, count, conditional
// insert), so concurrent callers on the same identity can never both slip
// in under the bound. When the store is unreachable the limiter fails open
// and says so through `Outcome::Degraded`.
pub struct SlidingWindowLimiter {
    store: Arc<dyn KvStore>,
    timeout: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn KvStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn check_and_admit(
        &self,
        scope: &str,
        identity: &str,
        max_requests: u32,
        window_seconds: u64,
        now: DateTime<Utc>,
    ) -> Outcome<RateLimitDecision> {
        let window_ms = (window_seconds as i64).saturating_mul(1000);
        let now_ms = now.timestamp_millis();
        let key = format!("rate_limit:{}:{}", scope, identity_digest(identity));
        let request = WindowRequest {
            now_ms,
            window_ms,
            max_requests,
            member: format!("{}-{:016x}", now_ms, rand::random::<u64>()),
        };

        let snapshot = match bounded(self.timeout, self.store.window_admit(&key, request)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                RATE_LIMIT_DEGRADED_TOTAL.inc();
                warn!(%scope, error = %e, "rate limiter store unavailable, allowing request");
                return Outcome::Degraded {
                    value: RateLimitDecision {
                        allowed: true,
                        remaining: max_requests,
                        reset_at: now + chrono::Duration::milliseconds(window_ms),
                    },
                    reason: e.to_string(),
                };
            }
        };

        if !snapshot.admitted {
            RATE_LIMITED_TOTAL.inc();
            let oldest_ms = snapshot.oldest_ms.unwrap_or(now_ms);
            let reset_at = DateTime::<Utc>::from_timestamp_millis(oldest_ms + window_ms)
                .unwrap_or(now + chrono::Duration::milliseconds(window_ms));
            debug!(%scope, count = snapshot.count, %reset_at, "rate limit exceeded");
            return Outcome::Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            });
        }

        Outcome::Ok(RateLimitDecision {
            allowed: true,
            remaining: max_requests.saturating_sub(snapshot.count + 1),
            reset_at: now + chrono::Duration::milliseconds(window_ms),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CooldownDecision {
    pub allowed: bool,
    pub retry_after_secs: u64,
}

impl CooldownDecision {
    fn open() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
        }
    }
}

// One action per cooldown period, keyed by action name. Used to throttle
// operator start/stop commands.
pub struct CooldownLimiter {
    store: Arc<dyn KvStore>,
    timeout: Duration,
}

impl CooldownLimiter {
    pub fn new(store: Arc<dyn KvStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    // Consumes the cooldown when allowed
    pub async fn check(
        &self,
        action: &str,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Outcome<CooldownDecision> {
        if cooldown.is_zero() {
            return Outcome::Ok(CooldownDecision::open());
        }
        let key = format!("cooldown:{action}");
        let stamp = now.timestamp_millis().to_string();

        match bounded(self.timeout, self.store.set_nx_ex(&key, stamp, cooldown)).await {
            Ok(None) => Outcome::Ok(CooldownDecision::open()),
            Ok(Some(previous)) => Outcome::Ok(remaining_cooldown(&previous, cooldown, now)),
            Err(e) => {
                RATE_LIMIT_DEGRADED_TOTAL.inc();
                warn!(%action, error = %e, "cooldown store unavailable, allowing action");
                Outcome::Degraded {
                    value: CooldownDecision::open(),
                    reason: e.to_string(),
                }
            }
        }
    }

    // Reports availability without consuming anything
    pub async fn status(
        &self,
        action: &str,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Outcome<CooldownDecision> {
        if cooldown.is_zero() {
            return Outcome::Ok(CooldownDecision::open());
        }
        let key = format!("cooldown:{action}");

        match bounded(self.timeout, self.store.get(&key)).await {
            Ok(None) => Outcome::Ok(CooldownDecision::open()),
            Ok(Some(previous)) => Outcome::Ok(remaining_cooldown(&previous, cooldown, now)),
            Err(e) => Outcome::Degraded {
                value: CooldownDecision::open(),
                reason: e.to_string(),
            },
        }
    }
}

fn remaining_cooldown(previous: &str, cooldown: Duration, now: DateTime<Utc>) -> CooldownDecision {
    let Ok(previous_ms) = previous.parse::<i64>() else {
        return CooldownDecision::open();
    };
    let elapsed_ms = now.timestamp_millis() - previous_ms;
    let remaining_ms = cooldown.as_millis() as i64 - elapsed_ms;
    if remaining_ms <= 0 {
        return CooldownDecision::open();
    }
    CooldownDecision {
        allowed: false,
        retry_after_secs: (remaining_ms as u64).div_ceil(1000),
    }
}
