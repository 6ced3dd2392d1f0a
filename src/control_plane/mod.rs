mod http;
mod simulated;

pub use http::HttpControlPlane;
pub use simulated::{Call, SimulatedControlPlane};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ControlPlaneError;

/// Power state of the managed instance as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Stopped,
    Pending,
    Running,
    Stopping,
    StoppedTerminal,
    Unknown,
}

impl InstanceState {
    // Accepts the provider's wording as well as our own
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stopped" => InstanceState::Stopped,
            "pending" | "starting" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "stopping" => InstanceState::Stopping,
            "terminated" | "shutting-down" | "stopped_terminal" => InstanceState::StoppedTerminal,
            _ => InstanceState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Stopped => "stopped",
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::StoppedTerminal => "stopped_terminal",
            InstanceState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub state: InstanceState,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    // start of the current run, when the provider reports it
    pub launched_at: Option<DateTime<Utc>>,
}

/// The compute control plane. Single source of truth for instance state;
/// implementations never cache it.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn describe(&self, instance_id: &str) -> Result<InstanceInfo, ControlPlaneError>;

    async fn start_instance(&self, instance_id: &str) -> Result<(), ControlPlaneError>;

    async fn stop_instance(&self, instance_id: &str) -> Result<(), ControlPlaneError>;
}
