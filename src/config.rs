use clap::{Args, Parser, Subcommand};
use std::time::Duration;

use crate::control::ControlCommand;
use crate::error::ConfigError;
use crate::instance::WaitPolicy;

// CLI argument structure
#[derive(Parser, Debug)]
#[command(name = "agent-lifecycle")]
#[command(about = "Idle-aware lifecycle controller for an on-demand compute instance")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    // Run the gateway, the decision loop and the store sweeper.
    Serve(ServeArgs),

    // Send one control command to a running controller and print the result.
    Control(ControlArgs),

    // Worker side: keep posting heartbeats to the controller.
    EmitHeartbeat(EmitHeartbeatArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    // Managed instance
    #[arg(long, env = "INSTANCE_ID")]
    pub instance_id: String,

    #[arg(long, env = "CONTROL_PLANE_URL", required_unless_present = "simulate")]
    pub control_plane_url: Option<String>,

    #[arg(long, env = "CONTROL_PLANE_TOKEN", hide_env_values = true)]
    pub control_plane_token: Option<String>,

    // In-process control plane, no real instance behind it
    #[arg(long, env = "SIMULATE_CONTROL_PLANE")]
    pub simulate: bool,

    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Where admitted /chat requests are forwarded
    #[arg(long, env = "UPSTREAM_URL")]
    pub upstream_url: Option<String>,

    #[arg(long, env = "UPSTREAM_TIMEOUT_SECONDS", default_value_t = 30)]
    pub upstream_timeout_seconds: u64,

    // Rate limit max requests per window
    #[arg(long, env = "AI_CHAT_MAX_REQUESTS", default_value_t = 10)]
    pub max_requests: u32,

    #[arg(long, env = "AI_CHAT_WINDOW_SECONDS", default_value_t = 60)]
    pub window_seconds: u64,

    #[arg(long, env = "AI_CHAT_IDLE_TIMEOUT_MINUTES", default_value_t = 5)]
    pub idle_timeout_minutes: u64,

    #[arg(long, env = "HEARTBEAT_TIMEOUT_MINUTES", default_value_t = 5)]
    pub heartbeat_timeout_minutes: u64,

    #[arg(long, env = "START_GRACE_MINUTES", default_value_t = 5)]
    pub start_grace_minutes: u64,

    #[arg(long, env = "WAKE_ON_ACTIVITY")]
    pub wake_on_activity: bool,

    // 0 disables the operator cooldown
    #[arg(long, env = "ACTION_COOLDOWN_SECONDS", default_value_t = 0)]
    pub action_cooldown_seconds: u64,

    #[arg(long, env = "POLL_INTERVAL_SECONDS", default_value_t = 5)]
    pub poll_interval_seconds: u64,

    #[arg(long, env = "MAX_WAIT_SECONDS", default_value_t = 60)]
    pub max_wait_seconds: u64,

    #[arg(long, env = "CONTROL_PLANE_TIMEOUT_SECONDS", default_value_t = 10)]
    pub control_plane_timeout_seconds: u64,

    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 5000)]
    pub store_timeout_ms: u64,

    #[arg(long, env = "DECISION_INTERVAL_SECONDS", default_value_t = 120)]
    pub decision_interval_seconds: u64,

    #[arg(long, env = "SWEEP_INTERVAL_SECONDS", default_value_t = 30)]
    pub sweep_interval_seconds: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ControlArgs {
    #[arg(value_enum)]
    pub action: ControlCommand,

    #[arg(long, env = "CONTROLLER_URL", default_value = "http://localhost:8080")]
    pub controller_url: String,

    // Generous: start/stop wait for the instance to settle
    #[arg(long, default_value_t = 120)]
    pub timeout_seconds: u64,
}

#[derive(Args, Debug, Clone)]
pub struct EmitHeartbeatArgs {
    #[arg(long, env = "CONTROLLER_URL")]
    pub controller_url: String,

    #[arg(long, env = "HEARTBEAT_INTERVAL_SECONDS", default_value_t = 60)]
    pub interval_seconds: u64,

    #[arg(long, default_value_t = 10)]
    pub timeout_seconds: u64,
}

// Resolved runtime settings, checked once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub instance_id: String,
    pub control_plane_url: Option<String>,
    pub control_plane_token: Option<String>,
    pub simulate: bool,
    pub port: u16,
    pub upstream_url: Option<String>,
    pub upstream_timeout: Duration,
    pub max_requests: u32,
    pub window_seconds: u64,
    pub idle_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub start_grace: Duration,
    pub wake_on_activity: bool,
    pub action_cooldown: Duration,
    pub wait: WaitPolicy,
    pub control_plane_timeout: Duration,
    pub store_timeout: Duration,
    pub decision_interval: Duration,
    pub sweep_interval: Duration,
}

impl Settings {
    // Defaults for a simulated instance
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            control_plane_url: None,
            control_plane_token: None,
            simulate: true,
            port: 8080,
            upstream_url: None,
            upstream_timeout: Duration::from_secs(30),
            max_requests: 10,
            window_seconds: 60,
            idle_timeout: minutes(5),
            heartbeat_timeout: minutes(5),
            start_grace: minutes(5),
            wake_on_activity: false,
            action_cooldown: Duration::ZERO,
            wait: WaitPolicy::default(),
            control_plane_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_millis(5000),
            decision_interval: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::Invalid("instance id must not be empty".into()));
        }
        if !self.simulate && self.control_plane_url.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Invalid(
                "control plane url is required unless simulating".into(),
            ));
        }
        if self.max_requests == 0 {
            return Err(ConfigError::Invalid("max requests must be at least 1".into()));
        }
        if self.window_seconds == 0 {
            return Err(ConfigError::Invalid("rate window must be at least 1 second".into()));
        }
        for (name, value) in [
            ("idle timeout", self.idle_timeout),
            ("heartbeat timeout", self.heartbeat_timeout),
            ("decision interval", self.decision_interval),
            ("sweep interval", self.sweep_interval),
            ("store timeout", self.store_timeout),
            ("control plane timeout", self.control_plane_timeout),
            ("upstream timeout", self.upstream_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.wait.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll interval must be greater than zero".into()));
        }
        if self.wait.deadline < self.wait.poll_interval {
            return Err(ConfigError::Invalid(format!(
                "max wait ({:?}) is shorter than the poll interval ({:?})",
                self.wait.deadline, self.wait.poll_interval
            )));
        }
        Ok(())
    }
}

impl TryFrom<ServeArgs> for Settings {
    type Error = ConfigError;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let settings = Settings {
            instance_id: args.instance_id,
            control_plane_url: args.control_plane_url,
            control_plane_token: args.control_plane_token,
            simulate: args.simulate,
            port: args.port,
            upstream_url: args.upstream_url.filter(|url| !url.trim().is_empty()),
            upstream_timeout: Duration::from_secs(args.upstream_timeout_seconds),
            max_requests: args.max_requests,
            window_seconds: args.window_seconds,
            idle_timeout: minutes(args.idle_timeout_minutes),
            heartbeat_timeout: minutes(args.heartbeat_timeout_minutes),
            start_grace: minutes(args.start_grace_minutes),
            wake_on_activity: args.wake_on_activity,
            action_cooldown: Duration::from_secs(args.action_cooldown_seconds),
            wait: WaitPolicy::new(
                Duration::from_secs(args.poll_interval_seconds),
                Duration::from_secs(args.max_wait_seconds),
            ),
            control_plane_timeout: Duration::from_secs(args.control_plane_timeout_seconds),
            store_timeout: Duration::from_millis(args.store_timeout_ms),
            decision_interval: Duration::from_secs(args.decision_interval_seconds),
            sweep_interval: Duration::from_secs(args.sweep_interval_seconds),
        };
        settings.validate()?;
        Ok(settings)
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(60))
}
