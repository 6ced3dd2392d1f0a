use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::activity::ActivityTracker;
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::ConfigError;
use crate::control::LifecycleService;
use crate::control_plane::{ControlPlane, HttpControlPlane, InstanceState, SimulatedControlPlane};
use crate::error::ControlPlaneError;
use crate::heartbeat::HeartbeatStore;
use crate::instance::InstanceController;
use crate::lifecycle::{DecisionPolicy, LifecycleDecisionLoop};
use crate::rate_limit::{CooldownLimiter, SlidingWindowLimiter};
use crate::store::KvStore;

// rate limit scope of the chat endpoint
pub const CHAT_SCOPE: &str = "ai_chat";

// app's shared state
pub struct AppState {
    pub client: reqwest::Client,
    pub clock: Arc<dyn Clock>,
    pub limiter: SlidingWindowLimiter,
    pub activity: Arc<ActivityTracker>,
    pub service: LifecycleService,
    pub decisions: Arc<LifecycleDecisionLoop>,
    pub rate_limit: u32,    // max requests allowed
    pub rate_window: u64,   // window length in seconds
    pub idle_timeout: Duration,
    pub upstream_url: Option<String>,
}

impl AppState {
    // Wire every component over one store, one control plane and one clock.
    pub fn assemble(
        settings: &Settings,
        store: Arc<dyn KvStore>,
        plane: Arc<dyn ControlPlane>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(settings.upstream_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("upstream client: {e}")))?;
        let controller = Arc::new(InstanceController::new(
            plane,
            &settings.instance_id,
            settings.control_plane_timeout,
        ));
        let heartbeats = Arc::new(HeartbeatStore::new(
            store.clone(),
            settings.heartbeat_timeout,
            settings.store_timeout,
        ));
        let activity = Arc::new(ActivityTracker::new(
            store.clone(),
            clock.clone(),
            settings.idle_timeout,
            settings.store_timeout,
        ));
        let decisions = Arc::new(LifecycleDecisionLoop::new(
            controller.clone(),
            heartbeats.clone(),
            activity.clone(),
            clock.clone(),
            DecisionPolicy {
                heartbeat_timeout: settings.heartbeat_timeout,
                idle_timeout: settings.idle_timeout,
                start_grace: settings.start_grace,
                wake_on_activity: settings.wake_on_activity,
            },
            settings.wait,
        ));
        let service = LifecycleService::new(
            controller,
            heartbeats,
            decisions.clone(),
            CooldownLimiter::new(store.clone(), settings.store_timeout),
            clock.clone(),
            settings.action_cooldown,
            settings.wait,
        );

        Ok(Self {
            client,
            clock,
            limiter: SlidingWindowLimiter::new(store, settings.store_timeout),
            activity,
            service,
            decisions,
            rate_limit: settings.max_requests,
            rate_window: settings.window_seconds,
            idle_timeout: settings.idle_timeout,
            upstream_url: settings
                .upstream_url
                .as_deref()
                .map(|url| url.trim_end_matches('/').to_string()),
        })
    }
}

// Control plane selected by the settings: simulated, or the REST client.
pub fn control_plane(
    settings: &Settings,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn ControlPlane>, ControlPlaneError> {
    if settings.simulate {
        info!(instance_id = %settings.instance_id, "using simulated control plane");
        return Ok(Arc::new(SimulatedControlPlane::new(
            &settings.instance_id,
            InstanceState::Stopped,
            clock,
        )));
    }
    let url = settings
        .control_plane_url
        .as_deref()
        .ok_or_else(|| ControlPlaneError::permanent("MissingEndpoint", "no control plane url configured"))?;
    info!(%url, "using control plane");
    Ok(Arc::new(HttpControlPlane::new(
        url,
        settings.control_plane_token.clone(),
        settings.control_plane_timeout,
    )?))
}
