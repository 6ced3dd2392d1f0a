use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::metrics::HEARTBEATS_TOTAL;
use crate::store::{KvStore, Outcome, bounded};

// Last liveness pulse of the remote worker for one managed resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub resource_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl HeartbeatRecord {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.last_heartbeat).max(chrono::Duration::zero())
    }
}

// Absent means "never reported alive in this generation", stale means
// "was alive, now silent beyond tolerance".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Absent,
    Fresh(chrono::Duration),
    Stale(chrono::Duration),
}

pub struct HeartbeatStore {
    store: Arc<dyn KvStore>,
    heartbeat_timeout: Duration,
    timeout: Duration,
}

impl HeartbeatStore {
    pub fn new(store: Arc<dyn KvStore>, heartbeat_timeout: Duration, timeout: Duration) -> Self {
        Self {
            store,
            heartbeat_timeout,
            timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    // Write a fresh record. The record outlives the heartbeat timeout by a
    // factor of two so a single missed pulse is observed as stale rather
    // than evicted.
    pub async fn record_heartbeat(
        &self,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> Outcome<HeartbeatRecord> {
        let retention = self.heartbeat_timeout * 2;
        let record = HeartbeatRecord {
            resource_id: resource_id.to_string(),
            last_heartbeat: now,
            expires_at: now
                + chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero()),
        };

        let result = match serde_json::to_string(&record) {
            Ok(json) => bounded(self.timeout, self.store.set_ex(&key(resource_id), json, retention)).await,
            Err(e) => Err(StoreError::Corrupt {
                key: key(resource_id),
                reason: e.to_string(),
            }),
        };

        match result {
            Ok(()) => {
                HEARTBEATS_TOTAL.inc();
                debug!(%resource_id, "heartbeat recorded");
                Outcome::Ok(record)
            }
            Err(e) => {
                warn!(%resource_id, error = %e, "failed to record heartbeat");
                Outcome::Degraded {
                    value: record,
                    reason: e.to_string(),
                }
            }
        }
    }

    pub async fn get_heartbeat(&self, resource_id: &str) -> StoreResult<Option<HeartbeatRecord>> {
        let key = key(resource_id);
        let Some(json) = bounded(self.timeout, self.store.get(&key)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key,
                reason: e.to_string(),
            })
    }

    pub async fn freshness(&self, resource_id: &str, now: DateTime<Utc>) -> StoreResult<Freshness> {
        let Some(record) = self.get_heartbeat(resource_id).await? else {
            return Ok(Freshness::Absent);
        };
        let age = record.age(now);
        let tolerance =
            chrono::Duration::from_std(self.heartbeat_timeout).unwrap_or(chrono::Duration::MAX);
        if age > tolerance {
            Ok(Freshness::Stale(age))
        } else {
            Ok(Freshness::Fresh(age))
        }
    }
}

fn key(resource_id: &str) -> String {
    format!("heartbeat:{resource_id}")
}
