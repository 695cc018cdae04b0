//! StackSet Kubernetes Operator
//!
//! Manages StackSets: families of versioned application stacks with weighted
//! traffic switching between them.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! stackset-operator
//!
//! # Run with custom log level
//! RUST_LOG=debug stackset-operator
//!
//! # Show or change traffic weights of a stackset
//! stackset-operator traffic my-app
//! stackset-operator traffic my-app my-app-v2 80
//! ```

use clap::{Parser, Subcommand};
use kube::Client;
use stackset_operator::leader_election::{self, LeaderElector};
use stackset_operator::{ControllerConfig, StackSetController, Switcher};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// StackSet Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "stackset-operator")]
#[command(version, about = "Kubernetes operator for StackSets with weighted traffic switching")]
struct Args {
    /// Controller ID; only StackSets annotated with this ID (or unannotated) are reconciled
    #[arg(long, default_value = "")]
    controller_id: String,

    /// Annotation key under which available backend weights are written
    #[arg(long, default_value = "zalando.org/backend-weights")]
    backend_weights_key: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, default_value = "")]
    namespace: String,

    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List or set traffic weights for a stackset
    Traffic {
        /// Name of the stackset
        stackset: String,
        /// Stack to change the weight of; weights are listed when omitted
        stack: Option<String>,
        /// New weight for the stack
        weight: Option<f64>,
        /// Namespace of the stackset
        #[arg(long, default_value = "default")]
        namespace: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    // Create Kubernetes client
    let client = Client::try_default().await?;

    if let Some(Command::Traffic {
        stackset,
        stack,
        weight,
        namespace,
    }) = args.command
    {
        return run_traffic_command(
            client,
            &args.backend_weights_key,
            &stackset,
            stack.as_deref(),
            weight,
            &namespace,
        )
        .await;
    }

    info!("Starting StackSet Kubernetes Operator");
    info!(
        "Watching namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );
    if !args.controller_id.is_empty() {
        info!("Controller ID: {}", args.controller_id);
    }

    // Leader election — acquire lease before starting the controller
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = LeaderElector::new(client.clone(), &ns);
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let config = ControllerConfig {
        controller_id: if args.controller_id.is_empty() {
            None
        } else {
            Some(args.controller_id)
        },
        backend_weights_annotation_key: args.backend_weights_key,
        namespace: if args.namespace.is_empty() {
            None
        } else {
            Some(args.namespace)
        },
    };

    let controller = Arc::new(StackSetController::new(client.clone(), config));

    let controller_handle = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("StackSet controller error: {}", e);
            }
        })
    };

    // Periodic lease renewal (no-op future when leader election is disabled)
    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => loop {
                tokio::time::sleep(e.renew_interval()).await;
                match e.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("Lost leader lease");
                        break;
                    }
                    Err(err) => {
                        error!("Failed to renew leader lease: {}", err);
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = controller_handle => {
            if let Err(e) = result {
                error!("StackSet controller task failed: {}", e);
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    // Release the lease before exiting so a standby replica can take over immediately
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("StackSet Operator shutting down");
    Ok(())
}

/// Lists or sets traffic weights through the shared switcher.
async fn run_traffic_command(
    client: Client,
    backend_weights_key: &str,
    stackset: &str,
    stack: Option<&str>,
    weight: Option<f64>,
    namespace: &str,
) -> anyhow::Result<()> {
    let switcher = Switcher::new(client, backend_weights_key);

    let weights = match (stack, weight) {
        (Some(stack), Some(weight)) => switcher.switch(stackset, stack, namespace, weight).await?,
        (None, None) => switcher.traffic_weights(stackset, namespace).await?,
        _ => anyhow::bail!("a stack name and a weight must be given together"),
    };

    println!("{:<40} {:>10} {:>10}", "STACK", "WEIGHT", "ACTUAL");
    for entry in weights {
        println!(
            "{:<40} {:>9.1}% {:>9.1}%",
            entry.name, entry.weight, entry.actual_weight
        );
    }
    Ok(())
}
