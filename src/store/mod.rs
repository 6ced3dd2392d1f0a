mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// Result of a call whose failure policy is "keep going with a default".
///
/// `Degraded` carries the value the caller should act on together with the
/// reason the real answer could not be obtained, so "limiter says no" and
/// "limiter is down and defaulting to yes" stay distinguishable.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Ok(T),
    Degraded { value: T, reason: String },
}

impl<T> Outcome<T> {
    pub fn value(&self) -> &T {
        match self {
            Outcome::Ok(value) => value,
            Outcome::Degraded { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Outcome::Ok(value) => value,
            Outcome::Degraded { value, .. } => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded { .. })
    }
}

// One sliding-window admission, executed atomically by the store.
#[derive(Debug, Clone)]
pub struct WindowRequest {
    pub now_ms: i64,
    pub window_ms: i64,
    pub max_requests: u32,
    // unique member for the inserted token
    pub member: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub admitted: bool,
    // cardinality after pruning, before any insert
    pub count: u32,
    // score of the oldest surviving token, if any
    pub oldest_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    // last key returned; None once the walk is complete
    pub cursor: Option<String>,
    pub keys: Vec<String>,
}

/// The shared, TTL-capable key-value store.
///
/// Every operation is atomic per key. Callers never lock around these calls;
/// compound read-modify-write logic must live inside a single store primitive.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Prune, count and conditionally insert into the sorted set at `key`,
    /// refreshing its expiry to the window on insert.
    async fn window_admit(&self, key: &str, req: WindowRequest) -> StoreResult<WindowSnapshot>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()>;

    /// Set `key` only when absent (or expired). Returns the value that was
    /// already there when the write did not happen.
    async fn set_nx_ex(&self, key: &str, value: String, ttl: Duration)
    -> StoreResult<Option<String>>;

    /// Incremental key scan resuming strictly after the `after` cursor.
    /// `pattern` supports `*` wildcards; `count` is the page size. Keys live
    /// for the whole walk are returned exactly once.
    async fn scan(&self, after: Option<&str>, pattern: &str, count: usize) -> StoreResult<ScanPage>;
}

// Bound a store call by a fixed timeout; elapsing is a transient store failure.
pub async fn bounded<T, F>(timeout: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

// Hash a client identity (usually an IP) before it becomes part of a key
pub fn identity_digest(identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_digest_is_stable_and_opaque() {
        let a = identity_digest("10.0.0.1");
        assert_eq!(a, identity_digest("10.0.0.1"));
        assert_ne!(a, identity_digest("10.0.0.2"));
        assert_eq!(a.len(), 64);
        assert!(!a.contains("10.0.0.1"));
    }

    #[test]
    fn outcome_exposes_value_either_way() {
        let ok: Outcome<u32> = Outcome::Ok(3);
        let degraded = Outcome::Degraded {
            value: 7,
            reason: "down".to_string(),
        };
        assert_eq!(*ok.value(), 3);
        assert!(!ok.is_degraded());
        assert!(degraded.is_degraded());
        assert_eq!(degraded.into_value(), 7);
    }

    #[tokio::test]
    async fn bounded_times_out_slow_calls() {
        let result: StoreResult<()> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
