use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

use crate::activity::ActivityTracker;
use crate::clock::Clock;
use crate::control_plane::InstanceState;
use crate::error::ControlPlaneError;
use crate::heartbeat::{Freshness, HeartbeatStore};
use crate::instance::{InstanceController, StartResult, StopResult, WaitPolicy};
use crate::metrics::{DECISIONS_TOTAL, IDLE_MINUTES};
use crate::store::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Noop,
    StopTriggered,
    StartTriggered,
}

// Why the loop did (or did not) act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    NotRunning,
    AwaitingFirstHeartbeat,
    Orphaned,
    Idle,
    NoHeartbeat,
    HeartbeatTimeout,
    Ok,
    Woken,
    StoreUnavailable,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::NotRunning => "not_running",
            DecisionStatus::AwaitingFirstHeartbeat => "awaiting_first_heartbeat",
            DecisionStatus::Orphaned => "orphaned",
            DecisionStatus::Idle => "idle",
            DecisionStatus::NoHeartbeat => "no_heartbeat",
            DecisionStatus::HeartbeatTimeout => "heartbeat_timeout",
            DecisionStatus::Ok => "ok",
            DecisionStatus::Woken => "woken",
            DecisionStatus::StoreUnavailable => "store_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionPolicy {
    pub heartbeat_timeout: Duration,
    pub idle_timeout: Duration,
    // suppresses the orphan stop right after a launch
    pub start_grace: Duration,
    pub wake_on_activity: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub action: Action,
    pub status: DecisionStatus,
    pub instance_id: String,
    pub state: InstanceState,
    pub minutes_since_heartbeat: Option<f64>,
    pub has_activity: bool,
    pub idle_minutes: Option<f64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<StartResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Stop(DecisionStatus),
    Hold(DecisionStatus),
}

// Shutdown needs both signals to agree, except when neither ever existed.
// First match wins.
fn decide(
    heartbeat: Freshness,
    idle: Option<chrono::Duration>,
    running_for: Option<chrono::Duration>,
    policy: &DecisionPolicy,
) -> Verdict {
    let idle_timeout = to_chrono(policy.idle_timeout);
    let idle_enough = idle.is_none_or(|idle| idle >= idle_timeout);

    match heartbeat {
        Freshness::Absent if idle.is_none() => {
            let grace = to_chrono(policy.start_grace);
            if running_for.is_some_and(|up| up < grace) {
                Verdict::Hold(DecisionStatus::AwaitingFirstHeartbeat)
            } else {
                Verdict::Stop(DecisionStatus::Orphaned)
            }
        }
        Freshness::Absent | Freshness::Stale(_) if idle_enough => Verdict::Stop(DecisionStatus::Idle),
        Freshness::Absent => Verdict::Hold(DecisionStatus::NoHeartbeat),
        Freshness::Stale(_) => Verdict::Hold(DecisionStatus::HeartbeatTimeout),
        Freshness::Fresh(_) => Verdict::Hold(DecisionStatus::Ok),
    }
}

// Periodic idle-shutdown decision for the managed instance.
pub struct LifecycleDecisionLoop {
    controller: Arc<InstanceController>,
    heartbeats: Arc<HeartbeatStore>,
    activity: Arc<ActivityTracker>,
    clock: Arc<dyn Clock>,
    policy: DecisionPolicy,
    wait: WaitPolicy,
}

impl LifecycleDecisionLoop {
    pub fn new(
        controller: Arc<InstanceController>,
        heartbeats: Arc<HeartbeatStore>,
        activity: Arc<ActivityTracker>,
        clock: Arc<dyn Clock>,
        policy: DecisionPolicy,
        wait: WaitPolicy,
    ) -> Self {
        Self {
            controller,
            heartbeats,
            activity,
            clock,
            policy,
            wait,
        }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub async fn evaluate(&self) -> Result<Evaluation, ControlPlaneError> {
        let info = self.controller.describe().await?;
        let now = self.clock.now();
        let instance_id = self.controller.instance_id().to_string();

        let mut evaluation = Evaluation {
            action: Action::Noop,
            status: DecisionStatus::Ok,
            instance_id,
            state: info.state,
            minutes_since_heartbeat: None,
            has_activity: false,
            idle_minutes: None,
            message: String::new(),
            stop: None,
            start: None,
        };

        let last_activity = match self.activity.snapshot().await {
            Outcome::Ok(last) => last,
            Outcome::Degraded { reason, .. } => {
                return Ok(self.finish(evaluation, DecisionStatus::StoreUnavailable, reason));
            }
        };
        let idle = last_activity.map(|last| (now - last).max(chrono::Duration::zero()));
        evaluation.has_activity = idle.is_some();
        evaluation.idle_minutes = idle.map(minutes);
        if let Some(idle_minutes) = evaluation.idle_minutes {
            IDLE_MINUTES.set(idle_minutes);
        }

        if info.state != InstanceState::Running {
            let recently_active = idle.is_some_and(|idle| idle < to_chrono(self.policy.idle_timeout));
            if self.policy.wake_on_activity && info.state == InstanceState::Stopped && recently_active {
                info!(instance_id = %evaluation.instance_id, "client activity while stopped, waking instance");
                let start = self.controller.start(self.wait).await?;
                evaluation.action = Action::StartTriggered;
                let message = start.message.clone();
                evaluation.start = Some(start);
                return Ok(self.finish(evaluation, DecisionStatus::Woken, message));
            }
            let message = format!("instance is {}, nothing to do", info.state);
            return Ok(self.finish(evaluation, DecisionStatus::NotRunning, message));
        }

        let freshness = match self
            .heartbeats
            .freshness(&evaluation.instance_id, now)
            .await
        {
            Ok(freshness) => freshness,
            Err(e) => {
                warn!(error = %e, "heartbeat unreadable, skipping decision");
                return Ok(self.finish(evaluation, DecisionStatus::StoreUnavailable, e.to_string()));
            }
        };
        evaluation.minutes_since_heartbeat = match freshness {
            Freshness::Absent => None,
            Freshness::Fresh(age) | Freshness::Stale(age) => Some(minutes(age)),
        };

        let running_for = info
            .launched_at
            .map(|at| (now - at).max(chrono::Duration::zero()));

        match decide(freshness, idle, running_for, &self.policy) {
            Verdict::Hold(status) => {
                let message = match status {
                    DecisionStatus::HeartbeatTimeout => {
                        warn!(instance_id = %evaluation.instance_id, minutes = ?evaluation.minutes_since_heartbeat, "heartbeat timeout but client is active");
                        "worker silent but a client is active, not stopping".to_string()
                    }
                    DecisionStatus::NoHeartbeat => {
                        warn!(instance_id = %evaluation.instance_id, "no heartbeat recorded but client is active");
                        "no heartbeat recorded but a client is active, not stopping".to_string()
                    }
                    DecisionStatus::AwaitingFirstHeartbeat => {
                        "instance recently launched, waiting for its first heartbeat".to_string()
                    }
                    _ => "worker healthy".to_string(),
                };
                Ok(self.finish(evaluation, status, message))
            }
            Verdict::Stop(status) => {
                info!(
                    instance_id = %evaluation.instance_id,
                    reason = status.as_str(),
                    idle_minutes = ?evaluation.idle_minutes,
                    "stopping idle instance"
                );
                let stop = self.controller.stop(self.wait).await?;
                evaluation.action = Action::StopTriggered;
                let message = stop.message.clone();
                evaluation.stop = Some(stop);
                Ok(self.finish(evaluation, status, message))
            }
        }
    }

    // Evaluate every `every` until `shutdown` flips to true. Failed
    // evaluations are logged and the loop carries on.
    pub async fn run(&self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?every, instance_id = %self.controller.instance_id(), "decision loop started");

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

            match self.evaluate().await {
                Ok(evaluation) if evaluation.action != Action::Noop => {
                    info!(action = ?evaluation.action, status = evaluation.status.as_str(), message = %evaluation.message, "lifecycle action taken");
                }
                Ok(evaluation) => {
                    info!(status = evaluation.status.as_str(), idle_minutes = ?evaluation.idle_minutes, "lifecycle check");
                }
                Err(e) => error!(error = %e, "lifecycle evaluation failed"),
            }
        }
        info!("decision loop stopped");
    }

    fn finish(&self, mut evaluation: Evaluation, status: DecisionStatus, message: String) -> Evaluation {
        DECISIONS_TOTAL.with_label_values(&[status.as_str()]).inc();
        evaluation.status = status;
        evaluation.message = message;
        evaluation
    }
}

// rounded to one decimal, the way the control surface reports durations
pub(crate) fn minutes(d: chrono::Duration) -> f64 {
    let minutes = d.num_milliseconds() as f64 / 60_000.0;
    (minutes * 10.0).round() / 10.0
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::control_plane::SimulatedControlPlane;
    use crate::instance::StopStatus;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        plane: Arc<SimulatedControlPlane>,
        heartbeats: Arc<HeartbeatStore>,
        activity: Arc<ActivityTracker>,
        decisions: LifecycleDecisionLoop,
    }

    fn fixture(initial: InstanceState, policy: DecisionPolicy) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let plane = Arc::new(
            SimulatedControlPlane::new("i-test", initial, clock.clone()).with_transition_polls(1),
        );
        let controller = Arc::new(InstanceController::new(
            plane.clone(),
            "i-test",
            Duration::from_secs(1),
        ));
        let timeout = Duration::from_millis(200);
        let heartbeats = Arc::new(HeartbeatStore::new(store.clone(), policy.heartbeat_timeout, timeout));
        let activity = Arc::new(ActivityTracker::new(
            store.clone(),
            clock.clone(),
            policy.idle_timeout,
            timeout,
        ));
        let decisions = LifecycleDecisionLoop::new(
            controller,
            heartbeats.clone(),
            activity.clone(),
            clock.clone(),
            policy,
            WaitPolicy::new(Duration::from_millis(1), Duration::from_millis(50)),
        );
        Fixture {
            clock,
            store,
            plane,
            heartbeats,
            activity,
            decisions,
        }
    }

    #[tokio::test]
    async fn heartbeat_age_drives_the_stop() {
        let f = fixture(InstanceState::Running, policy());
        f.heartbeats.record_heartbeat("i-test", f.clock.now()).await;

        f.clock.advance(mins(4));
        let eval = f.decisions.evaluate().await.unwrap();
        assert_eq!(eval.action, Action::Noop);
        assert_eq!(eval.status, DecisionStatus::Ok);
        assert_eq!(eval.minutes_since_heartbeat, Some(4.0));

        f.clock.advance(mins(2));
        let eval = f.decisions.evaluate().await.unwrap();
        assert_eq!(eval.action, Action::StopTriggered);
        assert_eq!(eval.status, DecisionStatus::Idle);
        assert_eq!(eval.stop.unwrap().status, StopStatus::Stopped);
        assert_eq!(f.plane.stop_calls(), 1);
    }

    #[tokio::test]
    async fn recent_activity_holds_off_a_stale_heartbeat() {
        let f = fixture(InstanceState::Running, policy());
        f.heartbeats.record_heartbeat("i-test", f.clock.now()).await;

        f.clock.advance(chrono::Duration::seconds(354));
        f.activity.touch("203.0.113.7").await;
        f.clock.advance(chrono::Duration::seconds(6));

        let eval = f.decisions.evaluate().await.unwrap();
        assert_eq!(eval.action, Action::Noop);
        assert_eq!(eval.status, DecisionStatus::HeartbeatTimeout);
        assert!(eval.has_activity);
        assert_eq!(eval.idle_minutes, Some(0.1));
        assert_eq!(f.plane.stop_calls(), 0);
    }

    #[tokio::test]
    async fn fresh_launch_waits_for_first_heartbeat() {
        let f = fixture(InstanceState::Running, policy());

        f.clock.advance(mins(1));
        let eval = f.decisions.evaluate().await.unwrap();
        assert_eq!(eval.status, DecisionStatus::AwaitingFirstHeartbeat);

        f.clock.advance(mins(5));
        let eval = f.decisions.evaluate().await.unwrap();
        assert_eq!(eval.status, DecisionStatus::Orphaned);
        assert_eq!(eval.action, Action::StopTriggered);
    }

    #[tokio::test]
    async fn stopped_instance_is_left_alone() {
        let f = fixture(InstanceState::Stopped, policy());
        f.activity.touch("203.0.113.7").await;

        let eval = f.decisions.evaluate().await.unwrap();
        assert_eq!(eval.action, Action::Noop);
        assert_eq!(eval.status, DecisionStatus::NotRunning);
        assert_eq!(f.plane.start_calls(), 0);
    }

    #[tokio::test]
    async fn wake_on_activity_starts_a_stopped_instance() {
        let mut p = policy();
        p.wake_on_activity = true;
        let f = fixture(InstanceState::Stopped, p);

        let eval = f.decisions.evaluate().await.unwrap();
        assert_eq!(eval.status, DecisionStatus::NotRunning);

        f.activity.touch("203.0.113.7").await;
        let eval = f.decisions.evaluate().await.unwrap();
        assert_eq!(eval.action, Action::StartTriggered);
        assert_eq!(eval.status, DecisionStatus::Woken);
        assert_eq!(f.plane.start_calls(), 1);
    }

    #[tokio::test]
    async fn unreadable_store_skips_the_decision() {
        let f = fixture(InstanceState::Running, policy());
        f.store.set_offline(true);

        let eval = f.decisions.evaluate().await.unwrap();
        assert_eq!(eval.action, Action::Noop);
        assert_eq!(eval.status, DecisionStatus::StoreUnavailable);
        assert_eq!(f.plane.stop_calls(), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let f = fixture(InstanceState::Stopped, policy());
        let (tx, rx) = watch::channel(false);
        let decisions = Arc::new(f.decisions);

        let handle = tokio::spawn({
            let decisions = decisions.clone();
            async move { decisions.run(Duration::from_millis(5), rx).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    fn policy() -> DecisionPolicy {
        DecisionPolicy {
            heartbeat_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(300),
            start_grace: Duration::from_secs(300),
            wake_on_activity: false,
        }
    }

    fn mins(m: i64) -> chrono::Duration {
        chrono::Duration::minutes(m)
    }

    #[test]
    fn orphaned_instance_is_stopped_after_grace() {
        let p = policy();
        assert_eq!(
            decide(Freshness::Absent, None, Some(mins(2)), &p),
            Verdict::Hold(DecisionStatus::AwaitingFirstHeartbeat)
        );
        assert_eq!(
            decide(Freshness::Absent, None, Some(mins(6)), &p),
            Verdict::Stop(DecisionStatus::Orphaned)
        );
        assert_eq!(
            decide(Freshness::Absent, None, None, &p),
            Verdict::Stop(DecisionStatus::Orphaned)
        );
    }

    #[test]
    fn absent_heartbeat_with_activity_depends_on_idle_time() {
        let p = policy();
        assert_eq!(
            decide(Freshness::Absent, Some(mins(1)), None, &p),
            Verdict::Hold(DecisionStatus::NoHeartbeat)
        );
        assert_eq!(
            decide(Freshness::Absent, Some(mins(5)), None, &p),
            Verdict::Stop(DecisionStatus::Idle)
        );
    }

    #[test]
    fn stale_heartbeat_needs_idle_corroboration() {
        let p = policy();
        assert_eq!(
            decide(Freshness::Stale(mins(6)), None, None, &p),
            Verdict::Stop(DecisionStatus::Idle)
        );
        assert_eq!(
            decide(Freshness::Stale(mins(6)), Some(mins(7)), None, &p),
            Verdict::Stop(DecisionStatus::Idle)
        );
        assert_eq!(
            decide(Freshness::Stale(mins(6)), Some(chrono::Duration::seconds(6)), None, &p),
            Verdict::Hold(DecisionStatus::HeartbeatTimeout)
        );
    }

    #[test]
    fn fresh_heartbeat_never_stops() {
        let p = policy();
        assert_eq!(
            decide(Freshness::Fresh(mins(1)), None, None, &p),
            Verdict::Hold(DecisionStatus::Ok)
        );
        assert_eq!(
            decide(Freshness::Fresh(mins(1)), Some(mins(30)), None, &p),
            Verdict::Hold(DecisionStatus::Ok)
        );
    }

    #[test]
    fn minutes_round_to_one_decimal() {
        assert_eq!(minutes(chrono::Duration::seconds(90)), 1.5);
        assert_eq!(minutes(chrono::Duration::seconds(100)), 1.7);
        assert_eq!(minutes(chrono::Duration::zero()), 0.0);
    }
}
