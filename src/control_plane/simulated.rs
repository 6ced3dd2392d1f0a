use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use super::{ControlPlane, InstanceInfo, InstanceState};
use crate::clock::Clock;
use crate::error::ControlPlaneError;

// Kind of call targeted by an injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Describe,
    Start,
    Stop,
}

struct Injected {
    // None matches any call
    call: Option<Call>,
    skip: u32,
    error: ControlPlaneError,
}

struct Machine {
    state: InstanceState,
    // describes left before a transient state settles
    polls_left: u32,
    launched_at: Option<DateTime<Utc>>,
    public_ip: Option<String>,
}

// In-memory control plane for one instance.
//
// Transitions settle after a fixed number of `describe` calls, which makes
// the pending/stopping phases observable without real provisioning. Errors
// can be queued to exercise the transient/permanent paths.
pub struct SimulatedControlPlane {
    instance_id: String,
    private_ip: String,
    clock: Arc<dyn Clock>,
    transition_polls: u32,
    machine: Mutex<Machine>,
    failures: Mutex<Vec<Injected>>,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
}

impl SimulatedControlPlane {
    pub fn new(instance_id: &str, initial: InstanceState, clock: Arc<dyn Clock>) -> Self {
        let running = initial == InstanceState::Running;
        let now = clock.now();
        Self {
            instance_id: instance_id.to_string(),
            private_ip: "10.0.1.10".to_string(),
            clock,
            transition_polls: 2,
            machine: Mutex::new(Machine {
                state: initial,
                polls_left: 0,
                launched_at: running.then_some(now),
                public_ip: running.then(|| "203.0.113.10".to_string()),
            }),
            failures: Mutex::new(Vec::new()),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
        }
    }

    pub fn with_transition_polls(mut self, polls: u32) -> Self {
        self.transition_polls = polls;
        self
    }

    // Out-of-band change, e.g. someone clicking in the provider console.
    // A pending/stopping state set this way stays put until changed again.
    pub fn set_state(&self, state: InstanceState) {
        let mut machine = self.machine();
        machine.state = state;
        machine.polls_left = u32::MAX;
        if state == InstanceState::Running && machine.launched_at.is_none() {
            machine.launched_at = Some(self.clock.now());
            machine.public_ip = Some("203.0.113.10".to_string());
        }
    }

    pub fn set_launched_at(&self, at: Option<DateTime<Utc>>) {
        self.machine().launched_at = at;
    }

    // The next call (of any kind) fails with `error`
    pub fn fail_next(&self, error: ControlPlaneError) {
        self.inject(None, 0, error);
    }

    // Let `skip` calls of this kind through, then fail the next one
    pub fn fail_call(&self, call: Call, skip: u32, error: ControlPlaneError) {
        self.inject(Some(call), skip, error);
    }

    fn inject(&self, call: Option<Call>, skip: u32, error: ControlPlaneError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Injected { call, skip, error });
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_call(&self, call: Call, instance_id: &str) -> Result<(), ControlPlaneError> {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(idx) = failures
            .iter()
            .position(|f| f.call.is_none_or(|c| c == call))
        {
            if failures[idx].skip == 0 {
                return Err(failures.remove(idx).error);
            }
            failures[idx].skip -= 1;
        }
        drop(failures);

        if instance_id != self.instance_id {
            return Err(ControlPlaneError::permanent(
                "InvalidInstanceID.NotFound",
                format!("instance {} does not exist", instance_id),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for SimulatedControlPlane {
    async fn describe(&self, instance_id: &str) -> Result<InstanceInfo, ControlPlaneError> {
        self.check_call(Call::Describe, instance_id)?;
        let mut machine = self.machine();

        if matches!(machine.state, InstanceState::Pending | InstanceState::Stopping) {
            machine.polls_left = machine.polls_left.saturating_sub(1);
            if machine.polls_left == 0 {
                machine.state = match machine.state {
                    InstanceState::Pending => InstanceState::Running,
                    _ => InstanceState::Stopped,
                };
                info!(instance_id = %self.instance_id, state = %machine.state, "simulated instance settled");
            }
        }

        Ok(InstanceInfo {
            instance_id: self.instance_id.clone(),
            state: machine.state,
            private_ip: Some(self.private_ip.clone()),
            public_ip: machine.public_ip.clone(),
            launched_at: machine.launched_at,
        })
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), ControlPlaneError> {
        self.check_call(Call::Start, instance_id)?;
        let mut machine = self.machine();
        if machine.state != InstanceState::Stopped {
            return Err(ControlPlaneError::permanent(
                "IncorrectInstanceState",
                format!("cannot start instance in state {}", machine.state),
            ));
        }
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        machine.state = InstanceState::Pending;
        machine.polls_left = self.transition_polls;
        machine.launched_at = Some(self.clock.now());
        machine.public_ip = Some("203.0.113.10".to_string());
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), ControlPlaneError> {
        self.check_call(Call::Stop, instance_id)?;
        let mut machine = self.machine();
        if !matches!(machine.state, InstanceState::Running | InstanceState::Pending) {
            return Err(ControlPlaneError::permanent(
                "IncorrectInstanceState",
                format!("cannot stop instance in state {}", machine.state),
            ));
        }
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        machine.state = InstanceState::Stopping;
        machine.polls_left = self.transition_polls;
        machine.launched_at = None;
        machine.public_ip = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[tokio::test]
    async fn start_settles_after_transition_polls() {
        let plane = SimulatedControlPlane::new("i-1", InstanceState::Stopped, Arc::new(SystemClock))
            .with_transition_polls(2);

        plane.start_instance("i-1").await.unwrap();
        assert_eq!(plane.describe("i-1").await.unwrap().state, InstanceState::Pending);
        let info = plane.describe("i-1").await.unwrap();
        assert_eq!(info.state, InstanceState::Running);
        assert!(info.launched_at.is_some());
        assert_eq!(plane.start_calls(), 1);
    }

    #[tokio::test]
    async fn rejects_unknown_instance_and_queued_failures() {
        let plane = SimulatedControlPlane::new("i-1", InstanceState::Running, Arc::new(SystemClock));
        assert!(!plane.describe("i-2").await.unwrap_err().is_transient());

        plane.fail_next(ControlPlaneError::Transient("throttled".into()));
        assert!(plane.describe("i-1").await.unwrap_err().is_transient());
        assert!(plane.describe("i-1").await.is_ok());

        plane.fail_call(Call::Describe, 1, ControlPlaneError::Transient("later".into()));
        assert!(plane.describe("i-1").await.is_ok());
        assert!(plane.describe("i-1").await.is_err());
        assert!(plane.describe("i-1").await.is_ok());
    }

    #[tokio::test]
    async fn start_on_running_instance_is_rejected() {
        let plane = SimulatedControlPlane::new("i-1", InstanceState::Running, Arc::new(SystemClock));
        assert!(plane.start_instance("i-1").await.is_err());
        assert_eq!(plane.start_calls(), 0);
    }
}
