//! agent-lifecycle: gateway, heartbeat receiver and idle-shutdown loop for
//! one on-demand compute instance.
//!
//! # Usage
//!
//! ```text
//! agent-lifecycle serve --instance-id i-0abc --control-plane-url http://cp:9000
//! agent-lifecycle control status --controller-url http://localhost:8080
//! agent-lifecycle emit-heartbeat --controller-url http://controller:8080
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use agent_lifecycle::build_router;
use agent_lifecycle::clock::{Clock, SystemClock};
use agent_lifecycle::config::{Cli, Command, ControlArgs, EmitHeartbeatArgs, ServeArgs, Settings};
use agent_lifecycle::control::ControlCommand;
use agent_lifecycle::state::{AppState, control_plane};
use agent_lifecycle::store::MemoryStore;
use agent_lifecycle::worker::{heartbeat_emitter, store_sweeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,agent_lifecycle=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Control(args) => control(args).await,
        Command::EmitHeartbeat(args) => emit_heartbeat(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let settings = Settings::try_from(args)?;
    info!(instance_id = %settings.instance_id, "agent lifecycle controller starting");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let plane = control_plane(&settings, clock.clone())?;
    let state = Arc::new(AppState::assemble(&settings, store.clone(), plane, clock)?);

    info!(
        max_requests = settings.max_requests,
        window_seconds = settings.window_seconds,
        idle_timeout = ?settings.idle_timeout,
        heartbeat_timeout = ?settings.heartbeat_timeout,
        upstream = ?settings.upstream_url,
        upstream_timeout = ?settings.upstream_timeout,
        "limits configured"
    );

    // shutdown signal for the background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let decisions = state.decisions.clone();
    let decision_interval = settings.decision_interval;
    let decision_shutdown = shutdown_rx.clone();
    let decision_handle = tokio::spawn(async move {
        decisions.run(decision_interval, decision_shutdown).await;
    });

    let sweep_handle = tokio::spawn(store_sweeper(store, settings.sweep_interval, shutdown_rx));

    let router = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "gateway listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        wait_for_ctrl_c().await;
        let _ = shutdown_tx.send(true);
    })
    .await?;

    let _ = decision_handle.await;
    let _ = sweep_handle.await;
    info!("agent lifecycle controller stopped");
    Ok(())
}

async fn control(args: ControlArgs) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout_seconds))
        .build()?;
    let base = args.controller_url.trim_end_matches('/');

    let request = match args.action {
        ControlCommand::Status => client.get(format!("{base}/control/status")),
        action => client.post(format!("{base}/control/{action}")),
    };
    let res = request
        .send()
        .await
        .with_context(|| format!("controller at {base} unreachable"))?;

    let status = res.status();
    let body: serde_json::Value = res.json().await.context("controller sent a non-JSON answer")?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        anyhow::bail!("{} failed with {}", args.action, status);
    }
    Ok(())
}

async fn emit_heartbeat(args: EmitHeartbeatArgs) -> anyhow::Result<()> {
    if args.interval_seconds == 0 {
        anyhow::bail!("heartbeat interval must be greater than zero");
    }
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout_seconds))
        .build()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let emitter = tokio::spawn(heartbeat_emitter(
        client,
        args.controller_url,
        Duration::from_secs(args.interval_seconds),
        shutdown_rx,
    ));

    wait_for_ctrl_c().await;
    let _ = shutdown_tx.send(true);
    let _ = emitter.await;
    Ok(())
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for ctrl-c, shutting down"),
    }
}
