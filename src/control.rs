use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::control_plane::InstanceState;
use crate::error::ControlError;
use crate::heartbeat::HeartbeatStore;
use crate::instance::{InstanceController, StartResult, StartStatus, StopResult, StopStatus, WaitPolicy};
use crate::lifecycle::{Evaluation, LifecycleDecisionLoop, minutes};
use crate::rate_limit::CooldownLimiter;
use crate::store::Outcome;

// Operator command, parsed once at the edge (HTTP path or body, CLI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ControlCommand {
    Status,
    Start,
    Stop,
    Heartbeat,
    Check,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Status => "status",
            ControlCommand::Start => "start",
            ControlCommand::Stop => "stop",
            ControlCommand::Heartbeat => "heartbeat",
            ControlCommand::Check => "check",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlCommand {
    type Err = ControlError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "status" => Ok(ControlCommand::Status),
            "start" => Ok(ControlCommand::Start),
            "stop" => Ok(ControlCommand::Stop),
            "heartbeat" => Ok(ControlCommand::Heartbeat),
            "check" => Ok(ControlCommand::Check),
            _ => Err(ControlError::UnknownAction(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatHealth {
    Active,
    Timeout,
    Unknown,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatSummary {
    pub status: HeartbeatHealth,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub minutes_ago: Option<f64>,
    // minutes left before the worker counts as silent
    pub will_stop_in: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub instance_id: String,
    pub state: InstanceState,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub heartbeat: HeartbeatSummary,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatReceipt {
    pub status: &'static str,
    pub instance_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub message: &'static str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CooldownRejection {
    pub status: &'static str,
    pub instance_id: String,
    pub action: &'static str,
    pub retry_after: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Status(StatusReport),
    Start(StartResult),
    Stop(StopResult),
    Heartbeat(HeartbeatReceipt),
    Check(Box<Evaluation>),
    RateLimited(CooldownRejection),
}

impl ControlResponse {
    pub fn http_status(&self) -> StatusCode {
        match self {
            ControlResponse::Start(StartResult {
                status: StartStatus::Conflict,
                ..
            })
            | ControlResponse::Stop(StopResult {
                status: StopStatus::Conflict,
                ..
            }) => StatusCode::CONFLICT,
            ControlResponse::Start(StartResult {
                status: StartStatus::Error,
                retryable,
                ..
            })
            | ControlResponse::Stop(StopResult {
                status: StopStatus::Error,
                retryable,
                ..
            }) => {
                if *retryable {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::CONFLICT
                }
            }
            ControlResponse::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::OK,
        }
    }
}

// Operator-facing surface over the controller, the heartbeat store and the
// decision loop. Shared by the HTTP control routes and the CLI.
pub struct LifecycleService {
    controller: Arc<InstanceController>,
    heartbeats: Arc<HeartbeatStore>,
    decisions: Arc<LifecycleDecisionLoop>,
    cooldown: CooldownLimiter,
    clock: Arc<dyn Clock>,
    action_cooldown: Duration,
    wait: WaitPolicy,
}

impl LifecycleService {
    pub fn new(
        controller: Arc<InstanceController>,
        heartbeats: Arc<HeartbeatStore>,
        decisions: Arc<LifecycleDecisionLoop>,
        cooldown: CooldownLimiter,
        clock: Arc<dyn Clock>,
        action_cooldown: Duration,
        wait: WaitPolicy,
    ) -> Self {
        Self {
            controller,
            heartbeats,
            decisions,
            cooldown,
            clock,
            action_cooldown,
            wait,
        }
    }

    pub fn instance_id(&self) -> &str {
        self.controller.instance_id()
    }

    pub async fn execute(&self, command: ControlCommand) -> Result<ControlResponse, ControlError> {
        info!(%command, instance_id = %self.instance_id(), "control command");
        match command {
            ControlCommand::Status => Ok(ControlResponse::Status(self.status().await?)),
            ControlCommand::Start => {
                if let Some(rejection) = self.cooled_down(command).await {
                    return Ok(ControlResponse::RateLimited(rejection));
                }
                let result = self.controller.start(self.wait).await?;
                if result.status == StartStatus::Started {
                    // counts as the first sign of life for the new run
                    self.heartbeats
                        .record_heartbeat(self.instance_id(), self.clock.now())
                        .await;
                }
                Ok(ControlResponse::Start(result))
            }
            ControlCommand::Stop => {
                if let Some(rejection) = self.cooled_down(command).await {
                    return Ok(ControlResponse::RateLimited(rejection));
                }
                Ok(ControlResponse::Stop(self.controller.stop(self.wait).await?))
            }
            ControlCommand::Heartbeat => Ok(ControlResponse::Heartbeat(self.heartbeat().await)),
            ControlCommand::Check => Ok(ControlResponse::Check(Box::new(
                self.decisions.evaluate().await?,
            ))),
        }
    }

    pub async fn heartbeat(&self) -> HeartbeatReceipt {
        let outcome = self
            .heartbeats
            .record_heartbeat(self.instance_id(), self.clock.now())
            .await;
        let degraded = outcome.is_degraded();
        let record = outcome.into_value();
        HeartbeatReceipt {
            status: "ok",
            instance_id: record.resource_id,
            last_heartbeat: record.last_heartbeat,
            message: if degraded {
                "heartbeat accepted but not persisted"
            } else {
                "heartbeat recorded"
            },
            degraded,
        }
    }

    async fn status(&self) -> Result<StatusReport, ControlError> {
        let info = self.controller.describe().await?;
        let heartbeat = self.heartbeat_summary().await;
        Ok(StatusReport {
            status: "ok",
            message: format!("instance is {}", info.state),
            instance_id: info.instance_id,
            state: info.state,
            private_ip: info.private_ip,
            public_ip: info.public_ip,
            heartbeat,
        })
    }

    async fn heartbeat_summary(&self) -> HeartbeatSummary {
        let now = self.clock.now();
        let record = match self.heartbeats.get_heartbeat(self.instance_id()).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "heartbeat unreadable for status");
                return HeartbeatSummary {
                    status: HeartbeatHealth::Error,
                    last_heartbeat: None,
                    minutes_ago: None,
                    will_stop_in: None,
                };
            }
        };
        let Some(record) = record else {
            return HeartbeatSummary {
                status: HeartbeatHealth::Unknown,
                last_heartbeat: None,
                minutes_ago: None,
                will_stop_in: None,
            };
        };

        let age = record.age(now);
        let timeout = chrono::Duration::from_std(self.heartbeats.heartbeat_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let (status, will_stop_in) = if age > timeout {
            (HeartbeatHealth::Timeout, None)
        } else {
            (HeartbeatHealth::Active, Some(minutes(timeout - age)))
        };
        HeartbeatSummary {
            status,
            last_heartbeat: Some(record.last_heartbeat),
            minutes_ago: Some(minutes(age)),
            will_stop_in,
        }
    }

    // None when the action may proceed
    async fn cooled_down(&self, command: ControlCommand) -> Option<CooldownRejection> {
        let decision = match self
            .cooldown
            .check(command.as_str(), self.action_cooldown, self.clock.now())
            .await
        {
            Outcome::Ok(decision) => decision,
            Outcome::Degraded { value, .. } => value,
        };
        if decision.allowed {
            return None;
        }
        warn!(action = command.as_str(), retry_after = decision.retry_after_secs, "control action in cooldown");
        Some(CooldownRejection {
            status: "rate_limited",
            instance_id: self.instance_id().to_string(),
            action: command.as_str(),
            retry_after: decision.retry_after_secs,
            message: format!(
                "{} was requested recently, retry in {}s",
                command,
                decision.retry_after_secs
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityTracker;
    use crate::clock::ManualClock;
    use crate::control_plane::SimulatedControlPlane;
    use crate::error::ControlPlaneError;
    use crate::lifecycle::DecisionPolicy;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn service(
        initial: InstanceState,
        cooldown: Duration,
    ) -> (Arc<ManualClock>, Arc<SimulatedControlPlane>, LifecycleService) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let plane = Arc::new(
            SimulatedControlPlane::new("i-ctl", initial, clock.clone()).with_transition_polls(1),
        );
        let controller = Arc::new(InstanceController::new(
            plane.clone(),
            "i-ctl",
            Duration::from_secs(1),
        ));
        let timeout = Duration::from_millis(200);
        let policy = DecisionPolicy {
            heartbeat_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(300),
            start_grace: Duration::from_secs(300),
            wake_on_activity: false,
        };
        let heartbeats = Arc::new(HeartbeatStore::new(store.clone(), policy.heartbeat_timeout, timeout));
        let activity = Arc::new(ActivityTracker::new(
            store.clone(),
            clock.clone(),
            policy.idle_timeout,
            timeout,
        ));
        let wait = WaitPolicy::new(Duration::from_millis(1), Duration::from_millis(50));
        let decisions = Arc::new(LifecycleDecisionLoop::new(
            controller.clone(),
            heartbeats.clone(),
            activity,
            clock.clone(),
            policy,
            wait,
        ));
        let service = LifecycleService::new(
            controller,
            heartbeats,
            decisions,
            CooldownLimiter::new(store, timeout),
            clock.clone(),
            cooldown,
            wait,
        );
        (clock, plane, service)
    }

    #[test]
    fn parses_actions_case_insensitively() {
        assert_eq!("Start".parse::<ControlCommand>().unwrap(), ControlCommand::Start);
        assert_eq!(" check ".parse::<ControlCommand>().unwrap(), ControlCommand::Check);
        assert!(matches!(
            "reboot".parse::<ControlCommand>(),
            Err(ControlError::UnknownAction(a)) if a == "reboot"
        ));
    }

    #[tokio::test]
    async fn status_reports_heartbeat_countdown() {
        let (clock, _plane, service) = service(InstanceState::Running, Duration::ZERO);

        let ControlResponse::Status(report) = service.execute(ControlCommand::Status).await.unwrap() else {
            panic!("expected status");
        };
        assert_eq!(report.heartbeat.status, HeartbeatHealth::Unknown);

        service.execute(ControlCommand::Heartbeat).await.unwrap();
        clock.advance(chrono::Duration::seconds(90));
        let ControlResponse::Status(report) = service.execute(ControlCommand::Status).await.unwrap() else {
            panic!("expected status");
        };
        assert_eq!(report.state, InstanceState::Running);
        assert_eq!(report.message, "instance is running");
        assert_eq!(report.heartbeat.status, HeartbeatHealth::Active);
        assert_eq!(report.heartbeat.minutes_ago, Some(1.5));
        assert_eq!(report.heartbeat.will_stop_in, Some(3.5));

        clock.advance(chrono::Duration::minutes(5));
        let ControlResponse::Status(report) = service.execute(ControlCommand::Status).await.unwrap() else {
            panic!("expected status");
        };
        assert_eq!(report.heartbeat.status, HeartbeatHealth::Timeout);
        assert_eq!(report.heartbeat.will_stop_in, None);
    }

    #[tokio::test]
    async fn started_instance_gets_an_initial_heartbeat() {
        let (_clock, _plane, service) = service(InstanceState::Stopped, Duration::ZERO);

        let response = service.execute(ControlCommand::Start).await.unwrap();
        assert_eq!(response.http_status(), StatusCode::OK);
        let ControlResponse::Start(result) = response else {
            panic!("expected start");
        };
        assert_eq!(result.status, StartStatus::Started);

        let ControlResponse::Status(report) = service.execute(ControlCommand::Status).await.unwrap() else {
            panic!("expected status");
        };
        assert_eq!(report.heartbeat.status, HeartbeatHealth::Active);
    }

    #[tokio::test]
    async fn conflicting_stop_maps_to_409() {
        let (_clock, plane, service) = service(InstanceState::Stopped, Duration::ZERO);
        plane.set_state(InstanceState::Pending);

        let response = service.execute(ControlCommand::Stop).await.unwrap();
        assert_eq!(response.http_status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn cooldown_rejects_repeated_actions() {
        let (clock, plane, service) = service(InstanceState::Running, Duration::from_secs(30));

        let first = service.execute(ControlCommand::Stop).await.unwrap();
        assert_eq!(first.http_status(), StatusCode::OK);

        clock.advance(chrono::Duration::seconds(10));
        let second = service.execute(ControlCommand::Stop).await.unwrap();
        assert_eq!(second.http_status(), StatusCode::TOO_MANY_REQUESTS);
        let ControlResponse::RateLimited(rejection) = second else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.retry_after, 20);
        assert_eq!(rejection.instance_id, "i-ctl");
        assert_eq!(plane.stop_calls(), 1);
    }

    #[tokio::test]
    async fn permanent_errors_surface_as_control_errors() {
        let (_clock, plane, service) = service(InstanceState::Running, Duration::ZERO);
        plane.fail_next(ControlPlaneError::permanent("UnauthorizedOperation", "denied"));

        let err = service.execute(ControlCommand::Status).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::ControlPlane(ControlPlaneError::Permanent { ref code, .. }) if code == "UnauthorizedOperation"
        ));
    }
}
