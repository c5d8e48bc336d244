//! cockroach-operator - A Kubernetes operator for CockroachDB clusters.
//!
//! This is the main entry point that:
//! - Parses command line flags and installs feature gates
//! - Initializes structured logging
//! - Provisions webhook certificates and starts the webhook server
//! - Runs leader election (required for HA deployments)
//! - Starts the controller and the health/metrics server

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use cockroach_operator::features::{install_feature_gates, parse_feature_gates};
use cockroach_operator::health::{HealthState, run_health_server};
use cockroach_operator::webhooks::bootstrap::ensure_webhook_certificates;
use cockroach_operator::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, run_controller_scoped, run_webhook_server,
    watch_namespaces,
};

const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[derive(Parser, Debug)]
#[command(name = "cockroach-operator", about = "Kubernetes operator for CockroachDB")]
struct Args {
    /// Address the health and metrics server binds to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_addr: std::net::SocketAddr,

    /// Comma-separated feature gates, e.g. "AutoPrunePVC=true,AffinityRules=true".
    #[arg(long, default_value = "")]
    feature_gates: String,

    /// Enable leader election for high-availability deployments.
    #[arg(long)]
    enable_leader_election: bool,

    /// Lease name used for leader election.
    #[arg(long, default_value = "crdb-operator.cockroachlabs.com")]
    leader_election_id: String,

    /// Skip webhook certificate provisioning and the webhook server. Meant
    /// for local runs outside a cluster.
    #[arg(long)]
    skip_webhook_config: bool,

    /// Log level directive for the operator's own crates.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("cockroach_operator={}", args.log_level).parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    info!("Starting cockroach-operator");

    let gates = match parse_feature_gates(&args.feature_gates) {
        Ok(gates) => gates,
        Err(e) => {
            // Setup failure, not a runtime error.
            error!("Invalid --feature-gates: {}", e);
            std::process::exit(1);
        }
    };
    install_feature_gates(gates);

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    // Get pod identity for leader election
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| {
        warn!("NAMESPACE not set, using 'default'");
        "default".to_string()
    });

    // Create shared health state
    let health_state = Arc::new(HealthState::new());

    // Track leadership status
    let is_leader = Arc::new(AtomicBool::new(false));

    // Start health server immediately (probes should work even as non-leader)
    let health_handle = {
        let health_state = health_state.clone();
        let metrics_addr = args.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, metrics_addr).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Provision webhook PKI and start the admission server before taking
    // leadership: every replica serves admissions, only the leader reconciles.
    let webhook_handle = if args.skip_webhook_config {
        info!("--skip-webhook-config set, webhook server disabled");
        None
    } else {
        if let Err(e) = ensure_webhook_certificates(client.clone()).await {
            error!("Failed to provision webhook certificates: {}", e);
            std::process::exit(1);
        }
        let webhook_client = client.clone();
        Some(tokio::spawn(async move {
            if let Err(e) =
                run_webhook_server(webhook_client, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH).await
            {
                error!("Webhook server error: {}", e);
            }
        }))
    };

    // Acquire leadership before starting the controller
    let lease_renewal_handle = if args.enable_leader_election {
        info!(
            holder_id = %pod_name,
            namespace = %namespace,
            lease_name = %args.leader_election_id,
            "Initializing leader election"
        );
        let lease_lock = LeaseLock::new(
            client.clone(),
            &namespace,
            LeaseLockParams {
                holder_id: pod_name.clone(),
                lease_name: args.leader_election_id.clone(),
                lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
            },
        );

        info!("Waiting to acquire leadership...");
        loop {
            match lease_lock.try_acquire_or_renew().await {
                Ok(result) => {
                    if result.acquired_lease {
                        info!("Acquired leadership");
                        is_leader.store(true, Ordering::SeqCst);
                        break;
                    } else {
                        info!("Another instance is leader, waiting...");
                    }
                }
                Err(e) => {
                    warn!("Failed to acquire lease: {}, retrying...", e);
                }
            }
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
        }

        let is_leader = is_leader.clone();
        #[allow(clippy::exit)]
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;

                match lease_lock.try_acquire_or_renew().await {
                    Ok(result) => {
                        if !result.acquired_lease {
                            error!("Lost leadership! Shutting down...");
                            is_leader.store(false, Ordering::SeqCst);
                            // Exit so Kubernetes restarts us and we re-enter election
                            std::process::exit(2);
                        }
                    }
                    Err(e) => {
                        error!("Failed to renew lease: {}. Shutting down...", e);
                        is_leader.store(false, Ordering::SeqCst);
                        std::process::exit(2);
                    }
                }
            }
        }))
    } else {
        is_leader.store(true, Ordering::SeqCst);
        None
    };

    // Start one controller per watched namespace (usually just one).
    let controller_handle = {
        let health_state = health_state.clone();
        let controller_client = client.clone();
        tokio::spawn(async move {
            let scopes = watch_namespaces();
            let mut tasks = Vec::new();
            for scope in scopes {
                let client = controller_client.clone();
                let health_state = health_state.clone();
                tasks.push(tokio::spawn(async move {
                    run_controller_scoped(client, Some(health_state), scope.as_deref()).await;
                }));
            }
            for task in tasks {
                let _ = task.await;
            }
        })
    };

    // Wait for any task to stop, or a shutdown signal. The long-running
    // tasks never finish on their own, so any of these branches is a
    // runtime failure and the process exits 2; only a signal-driven
    // shutdown exits 0.
    #[allow(clippy::exit)]
    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            } else {
                error!("Controller task stopped unexpectedly");
            }
            std::process::exit(2);
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            } else {
                error!("Health server stopped unexpectedly");
            }
            std::process::exit(2);
        }
        result = async {
            match webhook_handle {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                error!("Webhook server task panicked: {}", e);
            } else {
                error!("Webhook server stopped unexpectedly");
            }
            std::process::exit(2);
        }
        // Lease renewal task only exits via process::exit() or panic
        // so this branch is only reached on panic
        result = async {
            match lease_renewal_handle {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                error!("Lease renewal task panicked: {}", e);
            }
            std::process::exit(2);
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Mark as not ready to stop receiving new work
            health_state.set_ready(false).await;
            info!("Marked operator as not ready");

            // Give in-flight reconciliations time to complete
            info!(
                "Waiting {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

            info!("Grace period complete, shutting down");
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the operator cannot shut down
/// gracefully without them. Using expect() here is intentional.
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
