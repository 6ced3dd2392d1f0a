use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{KvStore, ScanPage, WindowRequest, WindowSnapshot};
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};

const DEFAULT_SCAN_COUNT: usize = 100;

enum Value {
    Str(String),
    // (score ms, member) ordered by score first
    Window(BTreeSet<(i64, String)>),
}

struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn window() -> Self {
        Self {
            value: Value::Window(BTreeSet::new()),
            expires_at: None,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// In-process `KvStore` backed by a sharded concurrent map.
//
// Per-key atomicity comes from the map's entry lock: each primitive holds
// the key's shard for its whole read-modify-write. Expired entries are
// invisible to readers and are physically dropped by `sweep_expired`.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            offline: AtomicBool::new(false),
        }
    }

    // Simulate an outage: every call fails with `Unavailable` until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "swept expired store entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn window_admit(&self, key: &str, req: WindowRequest) -> StoreResult<WindowSnapshot> {
        self.ensure_online()?;
        let now = self.clock.now();
        let ttl = Duration::from_millis(req.window_ms.max(0) as u64);
        let expires_at = self.expiry(ttl);

        // holds the shard lock until the end of the function
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(Entry::window);
        if slot.is_expired(now) {
            *slot = Entry::window();
        }
        let entry = &mut *slot;
        let set = match &mut entry.value {
            Value::Window(set) => set,
            Value::Str(_) => return Err(StoreError::WrongType(key.to_string())),
        };

        let cutoff = req.now_ms - req.window_ms;
        set.retain(|(score, _)| *score > cutoff);

        let count = set.len() as u32;
        let oldest_ms = set.first().map(|(score, _)| *score);

        if count >= req.max_requests {
            return Ok(WindowSnapshot {
                admitted: false,
                count,
                oldest_ms,
            });
        }

        set.insert((req.now_ms, req.member));
        entry.expires_at = Some(expires_at);

        Ok(WindowSnapshot {
            admitted: true,
            count,
            oldest_ms: oldest_ms.or(Some(req.now_ms)),
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_online()?;
        let now = self.clock.now();

        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                return match &entry.value {
                    Value::Str(value) => Ok(Some(value.clone())),
                    Value::Window(_) => Err(StoreError::WrongType(key.to_string())),
                };
            }
        };

        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        self.ensure_online()?;
        let expires_at = self.expiry(ttl);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> StoreResult<Option<String>> {
        self.ensure_online()?;
        let now = self.clock.now();
        let fresh = Entry {
            value: Value::Str(value),
            expires_at: Some(self.expiry(ttl)),
        };

        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    return Ok(None);
                }
                match &occupied.get().value {
                    Value::Str(existing) => Ok(Some(existing.clone())),
                    Value::Window(_) => Err(StoreError::WrongType(key.to_string())),
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(None)
            }
        }
    }

    // Keys come back in lexical order and the cursor is the last key handed
    // out, so removals between pages never shift a live key out of the walk.
    async fn scan(&self, after: Option<&str>, pattern: &str, count: usize) -> StoreResult<ScanPage> {
        self.ensure_online()?;
        let now = self.clock.now();
        let count = if count == 0 { DEFAULT_SCAN_COUNT } else { count };

        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|item| after.is_none_or(|after| item.key().as_str() > after))
            .filter(|item| !item.value().is_expired(now) && glob_match(pattern, item.key()))
            .map(|item| item.key().clone())
            .collect();
        keys.sort_unstable();

        let cursor = if keys.len() > count {
            keys.truncate(count);
            keys.last().cloned()
        } else {
            None
        };
        Ok(ScanPage { cursor, keys })
    }
}

// `*` matches any run of characters, everything else is literal
fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        // no wildcard at all
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
