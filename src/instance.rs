use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::control_plane::{ControlPlane, InstanceInfo, InstanceState};
use crate::error::ControlPlaneError;
use crate::metrics::CONTROL_PLANE_CALLS_TOTAL;

// How long a start/stop call waits for the instance to settle.
//
// Running out of time is not an error: the caller gets a "still in
// progress" status and may poll again later. Dropping the returned future
// cancels the wait without touching the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub deadline: Duration,
}

impl WaitPolicy {
    pub fn new(poll_interval: Duration, deadline: Duration) -> Self {
        Self {
            poll_interval,
            deadline,
        }
    }

    // Issue the call and return without polling
    pub fn no_wait() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }
}

impl Default for WaitPolicy {
    // 12 polls, 5 seconds apart
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    AlreadyRunning,
    Starting,
    Started,
    Conflict,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    AlreadyStopped,
    Stopping,
    Stopped,
    Conflict,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartResult {
    pub status: StartStatus,
    pub instance_id: String,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopResult {
    pub status: StopStatus,
    pub instance_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

enum Settle {
    Reached(InstanceInfo),
    // deadline hit or transient error while polling
    InProgress(String),
    // the instance went somewhere other than the target
    Diverted(InstanceInfo),
}

// Drives the managed instance through start/stop. Every decision starts from
// a fresh `describe`; transitions through one controller are serialized.
pub struct InstanceController {
    plane: Arc<dyn ControlPlane>,
    instance_id: String,
    call_timeout: Duration,
    // held from the first describe until the wait ends
    transition: Mutex<()>,
}

impl InstanceController {
    pub fn new(plane: Arc<dyn ControlPlane>, instance_id: &str, call_timeout: Duration) -> Self {
        Self {
            plane,
            instance_id: instance_id.to_string(),
            call_timeout,
            transition: Mutex::new(()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn describe(&self) -> Result<InstanceInfo, ControlPlaneError> {
        let info = self
            .call("describe", self.plane.describe(&self.instance_id))
            .await?;
        debug!(instance_id = %self.instance_id, state = %info.state, "instance described");
        Ok(info)
    }

    pub async fn current_state(&self) -> Result<InstanceState, ControlPlaneError> {
        Ok(self.describe().await?.state)
    }

    pub async fn start(&self, wait: WaitPolicy) -> Result<StartResult, ControlPlaneError> {
        let _transition = self.transition.lock().await;
        let info = self.describe().await?;

        match info.state {
            InstanceState::Running => {
                info!(instance_id = %self.instance_id, "instance already running");
                return Ok(self.start_result(StartStatus::AlreadyRunning, Some(&info), "instance is already running"));
            }
            InstanceState::Pending => {
                return Ok(self.start_result(StartStatus::Starting, Some(&info), "instance is already starting"));
            }
            InstanceState::Stopping => {
                warn!(instance_id = %self.instance_id, "start requested while stopping");
                return Ok(self.start_result(
                    StartStatus::Conflict,
                    Some(&info),
                    "instance is currently stopping, retry once it has stopped",
                ));
            }
            InstanceState::StoppedTerminal | InstanceState::Unknown => {
                return Ok(self.start_result(
                    StartStatus::Error,
                    Some(&info),
                    &format!("cannot start instance in state: {}", info.state),
                ));
            }
            InstanceState::Stopped => {}
        }

        info!(instance_id = %self.instance_id, "starting instance");
        match self
            .call("start", self.plane.start_instance(&self.instance_id))
            .await
        {
            Ok(()) => {}
            Err(ControlPlaneError::Transient(reason)) => {
                let mut result = self.start_result(
                    StartStatus::Error,
                    None,
                    &format!("start request failed, retry later: {reason}"),
                );
                result.retryable = true;
                return Ok(result);
            }
            Err(e) => return Err(e),
        }

        match self
            .settle(InstanceState::Running, InstanceState::Pending, InstanceState::Stopped, wait)
            .await?
        {
            Settle::Reached(info) => {
                info!(instance_id = %self.instance_id, "instance started");
                Ok(self.start_result(StartStatus::Started, Some(&info), "instance started successfully"))
            }
            Settle::InProgress(reason) => Ok(self.start_result(
                StartStatus::Starting,
                None,
                &format!("instance is starting: {reason}"),
            )),
            Settle::Diverted(info) => Ok(self.start_result(
                StartStatus::Error,
                Some(&info),
                &format!("instance entered {} while starting", info.state),
            )),
        }
    }

    pub async fn stop(&self, wait: WaitPolicy) -> Result<StopResult, ControlPlaneError> {
        let _transition = self.transition.lock().await;
        let info = self.describe().await?;

        match info.state {
            InstanceState::Stopped => {
                info!(instance_id = %self.instance_id, "instance already stopped");
                return Ok(self.stop_result(StopStatus::AlreadyStopped, "instance is already stopped"));
            }
            InstanceState::Stopping => {
                return Ok(self.stop_result(StopStatus::Stopping, "instance is already stopping"));
            }
            InstanceState::Pending => {
                warn!(instance_id = %self.instance_id, "stop requested while starting");
                return Ok(self.stop_result(
                    StopStatus::Conflict,
                    "instance is currently starting, retry once it is running",
                ));
            }
            InstanceState::StoppedTerminal | InstanceState::Unknown => {
                return Ok(self.stop_result(
                    StopStatus::Error,
                    &format!("cannot stop instance in state: {}", info.state),
                ));
            }
            InstanceState::Running => {}
        }

        info!(instance_id = %self.instance_id, "stopping instance");
        match self
            .call("stop", self.plane.stop_instance(&self.instance_id))
            .await
        {
            Ok(()) => {}
            Err(ControlPlaneError::Transient(reason)) => {
                let mut result = self.stop_result(
                    StopStatus::Error,
                    &format!("stop request failed, retry later: {reason}"),
                );
                result.retryable = true;
                return Ok(result);
            }
            Err(e) => return Err(e),
        }

        match self
            .settle(InstanceState::Stopped, InstanceState::Stopping, InstanceState::Running, wait)
            .await?
        {
            Settle::Reached(_) => {
                info!(instance_id = %self.instance_id, "instance stopped");
                Ok(self.stop_result(StopStatus::Stopped, "instance stopped successfully"))
            }
            Settle::InProgress(reason) => Ok(self.stop_result(
                StopStatus::Stopping,
                &format!("instance is stopping: {reason}"),
            )),
            Settle::Diverted(info) => Ok(self.stop_result(
                StopStatus::Error,
                &format!("instance entered {} while stopping", info.state),
            )),
        }
    }

    // Bounded polling until `target`. `transit` and `origin` (the state before
    // the power call, which a lagging control plane may still report) mean
    // "keep waiting"; terminal or opposite states end the wait as diverted.
    async fn settle(
        &self,
        target: InstanceState,
        transit: InstanceState,
        origin: InstanceState,
        wait: WaitPolicy,
    ) -> Result<Settle, ControlPlaneError> {
        let deadline = Instant::now() + wait.deadline;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.describe().await {
                Ok(info) if info.state == target => return Ok(Settle::Reached(info)),
                Ok(info)
                    if info.state == transit
                        || info.state == origin
                        || info.state == InstanceState::Unknown =>
                {
                    debug!(instance_id = %self.instance_id, attempts, state = %info.state, "still transitioning");
                }
                Ok(info) => return Ok(Settle::Diverted(info)),
                Err(e) if e.is_transient() => {
                    warn!(instance_id = %self.instance_id, error = %e, "poll failed, leaving transition in progress");
                    return Ok(Settle::InProgress(e.to_string()));
                }
                Err(e) => return Err(e),
            }

            if wait.poll_interval.is_zero() || Instant::now() + wait.poll_interval > deadline {
                return Ok(Settle::InProgress(format!(
                    "not {} after {} polls",
                    target, attempts
                )));
            }
            tokio::time::sleep(wait.poll_interval).await;
        }
    }

    async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T, ControlPlaneError>
    where
        F: Future<Output = Result<T, ControlPlaneError>>,
    {
        let result = match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ControlPlaneError::Transient(format!(
                "{} timed out after {:?}",
                operation, self.call_timeout
            ))),
        };
        let label = match &result {
            Ok(_) => "ok",
            Err(ControlPlaneError::Transient(_)) => "transient",
            Err(ControlPlaneError::Permanent { .. }) => "permanent",
        };
        CONTROL_PLANE_CALLS_TOTAL
            .with_label_values(&[operation, label])
            .inc();
        result
    }

    fn start_result(&self, status: StartStatus, info: Option<&InstanceInfo>, message: &str) -> StartResult {
        StartResult {
            status,
            instance_id: self.instance_id.clone(),
            private_ip: info.and_then(|i| i.private_ip.clone()),
            public_ip: info.and_then(|i| i.public_ip.clone()),
            message: message.to_string(),
            retryable: false,
        }
    }

    fn stop_result(&self, status: StopStatus, message: &str) -> StopResult {
        StopResult {
            status,
            instance_id: self.instance_id.clone(),
            message: message.to_string(),
            retryable: false,
        }
    }
}
