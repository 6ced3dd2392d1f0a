use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::store::MemoryStore;

// Worker-side pulse: POST {controller_url}/heartbeat every `every`.
// Only changes between reachable and unreachable are logged at info/warn.
pub async fn heartbeat_emitter(
    client: reqwest::Client,
    controller_url: String,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = format!("{}/heartbeat", controller_url.trim_end_matches('/'));
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut was_ok: Option<bool> = None;

    info!(%url, interval = ?every, "heartbeat emitter started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let result = client.post(&url).send().await;
        let is_ok = match &result {
            Ok(res) => res.status().is_success(),
            Err(_) => false,
        };

        // log status changes
        if was_ok != Some(is_ok) {
            match (&result, is_ok) {
                (_, true) => info!(%url, "controller is accepting heartbeats"),
                (Ok(res), false) => warn!(%url, status = %res.status(), "controller rejected heartbeat"),
                (Err(e), false) => warn!(%url, error = %e, "controller unreachable"),
            }
        } else {
            debug!(%url, ok = is_ok, "heartbeat sent");
        }
        was_ok = Some(is_ok);
    }
    info!("heartbeat emitter stopped");
}

// Evicts expired keys so idle identities and windows don't pile up.
pub async fn store_sweeper(
    store: Arc<MemoryStore>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let removed = store.sweep_expired();
        if removed > 0 {
            debug!(removed, remaining = store.len(), "swept expired store entries");
        }
    }
}
