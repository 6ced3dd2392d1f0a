use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::StoreResult;
use crate::store::{KvStore, Outcome, bounded, identity_digest};

const ACTIVITY_PREFIX: &str = "activity:";
const SCAN_PAGE_SIZE: usize = 100;

// Body of GET /activity/check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityReport {
    pub has_activity: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub idle_minutes: Option<f64>,
    pub should_shutdown: bool,
}

// Last-seen timestamps per client identity, expiring after `idle_ttl`.
// Store failures are logged; reads then report no activity.
pub struct ActivityTracker {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    idle_ttl: Duration,
    timeout: Duration,
}

impl ActivityTracker {
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        idle_ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            idle_ttl,
            timeout,
        }
    }

    pub async fn touch(&self, identity: &str) {
        let key = format!("{}{}", ACTIVITY_PREFIX, identity_digest(identity));
        let stamp = self.clock.now().timestamp_millis().to_string();

        if let Err(e) = bounded(self.timeout, self.store.set_ex(&key, stamp, self.idle_ttl)).await {
            warn!(error = %e, "failed to record client activity");
        }
    }

    // Most recent activity across all tracked identities.
    pub async fn snapshot(&self) -> Outcome<Option<DateTime<Utc>>> {
        match self.scan_latest().await {
            Ok(latest) => Outcome::Ok(latest),
            Err(e) => {
                warn!(error = %e, "failed to read client activity");
                Outcome::Degraded {
                    value: None,
                    reason: e.to_string(),
                }
            }
        }
    }

    pub async fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.snapshot().await.into_value()
    }

    pub async fn has_any_activity(&self) -> bool {
        self.last_activity().await.is_some()
    }

    // None when nobody is tracked
    pub async fn idle_duration(&self) -> Option<chrono::Duration> {
        let last = self.last_activity().await?;
        Some((self.clock.now() - last).max(chrono::Duration::zero()))
    }

    pub async fn report(&self, idle_timeout: Duration) -> ActivityReport {
        let Some(last) = self.last_activity().await else {
            return ActivityReport {
                has_activity: false,
                last_activity: None,
                idle_minutes: None,
                should_shutdown: false,
            };
        };

        let idle = (self.clock.now() - last).max(chrono::Duration::zero());
        let idle_minutes = idle.num_milliseconds() as f64 / 60_000.0;
        let timeout_minutes = idle_timeout.as_secs_f64() / 60.0;

        ActivityReport {
            has_activity: true,
            last_activity: Some(last),
            idle_minutes: Some((idle_minutes * 10.0).round() / 10.0),
            should_shutdown: idle_minutes >= timeout_minutes,
        }
    }

    // Cursor-paginated walk over activity:* so no single call enumerates
    // the whole key space.
    async fn scan_latest(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let pattern = format!("{ACTIVITY_PREFIX}*");
        let mut cursor: Option<String> = None;
        let mut latest_ms: Option<i64> = None;
        let mut pages = 0usize;

        loop {
            let page = bounded(
                self.timeout,
                self.store.scan(cursor.as_deref(), &pattern, SCAN_PAGE_SIZE),
            )
            .await?;
            pages += 1;

            for key in &page.keys {
                let Some(value) = bounded(self.timeout, self.store.get(key)).await? else {
                    // expired between scan and read
                    continue;
                };
                match value.parse::<i64>() {
                    Ok(ms) => latest_ms = Some(latest_ms.map_or(ms, |current| current.max(ms))),
                    Err(_) => debug!(%key, "ignoring malformed activity value"),
                }
            }

            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }

        debug!(pages, ?latest_ms, "activity scan complete");
        Ok(latest_ms.and_then(DateTime::<Utc>::from_timestamp_millis))
    }
}
