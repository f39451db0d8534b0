use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use pgbouncer_operator::health::{HealthState, run_health_server};
use pgbouncer_operator::{Cli, Command, LogFormat, OperatorConfig, run_controller, run_webhook_server};

/// Lease configuration
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

fn init_tracing(format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("pgbouncer_operator=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Cli {
        command: Command::Run(config),
    } = Cli::parse();

    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    init_tracing(config.log_format)?;
    info!("Starting pgbouncer-operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    run(client, config).await
}

async fn run(client: Client, config: OperatorConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Get pod identity for leader election
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let pod_namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });

    let health_state = Arc::new(HealthState::new());

    // Health endpoints must answer even as non-leader
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Admission requests are served regardless of leadership
    let webhook_handle = if config.enable_webhooks {
        for path in [&config.webhook_cert, &config.webhook_key] {
            if !Path::new(path).exists() {
                return Err(format!("webhook TLS file {} not found", path).into());
            }
        }
        let webhook_client = client.clone();
        let (port, cert, key) = (
            config.webhook_port,
            config.webhook_cert.clone(),
            config.webhook_key.clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = run_webhook_server(webhook_client, port, &cert, &key).await {
                error!("Webhook server error: {}", e);
            }
        }))
    } else {
        info!("Webhook server disabled");
        None
    };

    let lease_renewal_handle = if config.enable_leader_election {
        Some(acquire_leadership(&client, &pod_namespace, &pod_name, &config.lease_name).await)
    } else {
        info!("Leader election disabled");
        None
    };

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let controller_handle = {
        let health_state = health_state.clone();
        let controller_client = client.clone();
        let namespace = config.namespace.clone();
        let controller_config = config.controller_config();
        let workers = config.workers;
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            run_controller(
                controller_client,
                Some(health_state),
                namespace.as_deref(),
                controller_config,
                workers,
                shutdown,
            )
            .await;
        })
    };

    let webhook_future = async {
        match webhook_handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Webhook server task panicked: {}", e);
                }
            }
            None => std::future::pending::<()>().await,
        }
    };
    let lease_future = async {
        match lease_renewal_handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Lease renewal task panicked: {}", e);
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        _ = webhook_future => {}
        _ = lease_future => {}
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false);
            let _ = shutdown_tx.send(true);

            info!(
                "Waiting {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

fn lease_lock(client: &Client, namespace: &str, holder_id: &str, lease_name: &str) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: lease_name.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    )
}

/// Block until this instance holds the lease, then keep renewing it.
///
/// Losing the lease exits the process so Kubernetes restarts it into a
/// fresh election.
async fn acquire_leadership(
    client: &Client,
    namespace: &str,
    holder_id: &str,
    lease_name: &str,
) -> tokio::task::JoinHandle<()> {
    info!(
        holder_id,
        namespace,
        lease_name,
        "Initializing leader election"
    );
    let lock = lease_lock(client, namespace, holder_id, lease_name);

    info!("Waiting to acquire leadership...");
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                break;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
            match lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership! Shutting down...");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!("Failed to renew lease: {}. Shutting down...", e);
                    std::process::exit(1);
                }
            }
        }
    })
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
