//! orbit-controller entry point.
//!
//! - `watch <target>`: elect a leader, then run one watch module
//! - `webhook`: serve the mutating admission webhooks
//! - `crd`: print the CRDs as YAML
//!
//! Every long-running mode also serves health probes and metrics.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, Config};
use tokio::signal;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use orbit_controller::config::{Cli, Command, OperatorConfig};
use orbit_controller::health::{HealthState, run_health_server};
use orbit_controller::leader::LeaderElector;
use orbit_controller::{crd_yaml, run_watch, run_webhook};

/// Grace period for in-flight events to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.config;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_directives())),
        )
        .json()
        .init();

    if let Command::Crd = cli.command {
        print!("{}", crd_yaml()?);
        return Ok(());
    }

    config.validate(&cli.command)?;
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let client = connect(&config).await?;
    info!(in_cluster = config.in_cluster, "Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!(error = %e, "Health server error");
            }
        })
    };

    let work = {
        let health_state = health_state.clone();
        let config = config.clone();
        let command = cli.command.clone();
        tokio::spawn(async move { run(client, config, command, health_state).await })
    };

    tokio::select! {
        result = work => work_outcome(result)?,
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false).await;
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
            info!("Grace period complete, shutting down");
        }
    }

    info!("orbit-controller stopped");
    Ok(())
}

/// A failed or panicked work task ends the process with an error.
fn work_outcome(result: Result<Result<(), String>, JoinError>) -> Result<(), Box<dyn std::error::Error>> {
    match result {
        Ok(Ok(())) => {
            info!("Work loop finished");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Work loop failed");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Work loop panicked");
            Err(e.into())
        }
    }
}

async fn connect(config: &OperatorConfig) -> Result<Client, Box<dyn std::error::Error>> {
    let kube_config = if config.in_cluster {
        Config::incluster()?
    } else {
        Config::infer().await?
    };
    Ok(Client::try_from(kube_config)?)
}

async fn run(
    client: Client,
    config: OperatorConfig,
    command: Command,
    health_state: Arc<HealthState>,
) -> Result<(), String> {
    match command {
        Command::Watch { target, workers } => {
            let holder = config.pod_name.clone().unwrap_or_else(|| {
                hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unknown".to_string())
            });
            let namespace = config
                .pod_namespace
                .clone()
                .unwrap_or_else(|| config.system_namespace.clone());
            let elector = LeaderElector::new(client.clone(), &namespace, target.lease_name(), holder);
            elector.acquire().await;
            health_state.set_ready(true).await;

            tokio::select! {
                result = run_watch(client, &config, target, workers, Some(health_state)) => {
                    result.map_err(|e| e.to_string())
                }
                reason = elector.hold() => {
                    error!(holder = %elector.holder(), reason = %reason, "Lost leadership");
                    Err(format!("lost leadership: {reason}"))
                }
            }
        }
        Command::Webhook(args) => run_webhook(client, &config, &args, Some(health_state))
            .await
            .map_err(|e| e.to_string()),
        Command::Crd => Ok(()),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal; the process cannot shut down
/// gracefully without them.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
