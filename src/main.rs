mod config;
mod device;
mod mqtt;
mod sync;

use tracing::{error, info, warn};

use crate::device::state::TransitionKind;
use crate::device::CommandRequest;
use crate::sync::{Ack, SessionPhase, SyncEngine};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let (mode, confirm) = parse_args();

    info!(
        "Starting z2m-sync (mqtt={}:{}, family={}, status_topic={})",
        config.broker.host, config.broker.port, config.device.family, config.device.status_topic,
    );

    let engine = SyncEngine::new(config.clone());

    match mode.as_str() {
        "check" => run_check(&engine, &config).await,
        "on" | "off" => run_command(&engine, &config, &mode, confirm).await,
        "monitor" => run_monitor(&engine, &config).await,
        other => {
            error!("Unknown mode `{other}` (expected check, on, off, or monitor)");
            std::process::exit(2);
        }
    }
}

/// First non-flag argument selects the mode; `--confirm` makes commands wait
/// for the device to report the commanded state.
fn parse_args() -> (String, bool) {
    let mut mode = None;
    let mut confirm = false;
    for arg in std::env::args().skip(1) {
        if arg == "--confirm" {
            confirm = true;
        } else if mode.is_none() {
            mode = Some(arg);
        }
    }
    (mode.unwrap_or_else(|| "monitor".to_string()), confirm)
}

/// One-shot state check: connect, wait for the prompted status push, report.
async fn run_check(engine: &SyncEngine, config: &config::Config) {
    if let Err(e) = engine.start().await {
        error!("Failed to connect: {}", e);
        std::process::exit(1);
    }

    let result = engine.query_state(config.wait.query_timeout).await;
    engine.stop().await;

    match result {
        Ok(state) => info!("Device state: {state}"),
        Err(e) => {
            warn!("No state received. Is the device online? ({e})");
            std::process::exit(1);
        }
    }
}

async fn run_command(engine: &SyncEngine, config: &config::Config, command: &str, confirm: bool) {
    if let Err(e) = engine.start().await {
        error!("Failed to connect: {}", e);
        std::process::exit(1);
    }

    let result = engine
        .send_command(
            &CommandRequest::new(command),
            confirm,
            config.wait.confirm_timeout,
        )
        .await;
    engine.stop().await;

    match result {
        Ok(Ack::Sent) => info!("Command `{command}` sent"),
        Ok(Ack::Confirmed) => info!("Command `{command}` confirmed by the device"),
        Err(e) => {
            error!("Command `{command}` failed: {e}");
            std::process::exit(1);
        }
    }
}

/// Long-running monitor: log the initial state and every change until
/// SIGINT/SIGTERM, bailing out if the broker session dies.
async fn run_monitor(engine: &SyncEngine, config: &config::Config) {
    engine.set_transition_listener(|event| match event.kind {
        TransitionKind::InitialObservation => info!("Initial state: {}", event.value),
        TransitionKind::Changed => {
            if let Some(previous) = event.previous {
                info!("State changed: {previous} -> {}", event.value);
            }
        }
        TransitionKind::Unchanged => {}
    });

    if let Err(e) = engine.start().await {
        error!("Failed to connect: {}", e);
        std::process::exit(1);
    }

    if engine.query_state(config.wait.query_timeout).await.is_err() {
        warn!("No state received. Is the device online and configured?");
    }

    let mut health = tokio::time::interval(std::time::Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = async {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).expect("Failed to register SIGTERM handler");
                sigterm.recv().await;
            } => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = health.tick() => {
                if engine.phase() == SessionPhase::Failed {
                    error!("Broker session lost, exiting");
                    std::process::exit(1);
                }
            }
        }
    }

    engine.stop().await;
    info!("z2m-sync monitor stopped");
}
