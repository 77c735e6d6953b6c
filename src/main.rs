use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use fleetd::config::{FleetConfig, Secrets};
use fleetd::identity_verify::IdentityVerifier;
use fleetd::lifecycle::{ConvergenceOutcome, Transition};
use fleetd::provider::{ProviderAdapter, ProviderCredentials};
use fleetd::pool::{PoolConfig, PoolMaintainer};
use fleetd::rest::routes::redeploy::run_redeploy;
use fleetd::storage::NodeStore;
use fleetd::sweeper::{HttpPaymentGateway, Sweeper};
use fleetd::FleetContext;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet Host — node-lifecycle orchestrator for single-tenant agent compute nodes", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// REST API port
    #[arg(long, env = "FLEETD_PORT")]
    port: Option<u16>,

    /// Data directory for the SQLite database and config.toml
    #[arg(long, env = "FLEETD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FLEETD_LOG")]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the orchestrator (default when no subcommand given).
    Serve,
    /// Run a single pool-maintenance pass and exit. Useful for cron-driven
    /// deployments that don't want a long-lived maintenance loop.
    PoolTick,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    setup_logging(&log_level);

    match args.command {
        Some(Command::PoolTick) => run_pool_tick(args.data_dir).await,
        None | Some(Command::Serve) => run_server(args.port, args.data_dir, args.log).await,
    }
}

fn setup_logging(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(log_level.to_string())
        .compact()
        .init();
}

async fn build_context(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
) -> Result<(Arc<FleetConfig>, Arc<FleetContext>, Secrets)> {
    let secrets = match Secrets::load_from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    let config = Arc::new(FleetConfig::new(port, data_dir, log));
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        "config loaded"
    );

    let store = Arc::new(NodeStore::new(&config.data_dir).await?);
    let recovered = store.recover_stale_nodes().await.unwrap_or_default();

    let provider = Arc::new(ProviderAdapter::new(ProviderCredentials {
        node_provider_base_url: secrets.node_provider_base_url.clone(),
        node_provider_api_token: secrets.node_provider_api_token.clone(),
        model_router_base_url: secrets.model_router_base_url.clone(),
        model_router_admin_key: secrets.model_router_admin_key.clone(),
    }));

    let identity = Arc::new(IdentityVerifier::new(
        secrets.google_oauth_client_id.clone(),
        secrets.apple_oauth_bundle_id.clone(),
    ));

    let ctx = Arc::new(FleetContext::new(
        config.clone(),
        store,
        provider,
        identity,
        secrets.rest_bearer_token.clone(),
        secrets.payment_gateway_webhook_secret.clone(),
        secrets.admin_chat_webhook_url.clone(),
        secrets.sales_chatbot_webhook_url.clone(),
    ));

    if !recovered.is_empty() {
        warn!(
            count = recovered.len(),
            "recovered nodes stranded in a transient deployment stage — requeuing for convergence"
        );
        for node in recovered {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = requeue_stranded_node(&ctx, &node.id, node.binding_user.as_deref()).await {
                    error!(node_id = %node.id, err = %e, "failed to requeue stranded node");
                }
            });
        }
    }

    Ok((config, ctx, secrets))
}

/// Drives a node stranded mid-deploy (crash between `Bind` and `MarkReady`)
/// the rest of the way: advances its stage up to `configuring_search`, then
/// re-runs the full deploy and marks it ready or error from the outcome —
/// the same tail `AssignmentCoordinator::mint_and_deploy` runs for a fresh
/// assignment.
async fn requeue_stranded_node(
    ctx: &FleetContext,
    node_id: &str,
    binding_user: Option<&str>,
) -> Result<()> {
    let Some(user_id) = binding_user else {
        // No user bound yet — nothing to rebuild a DesiredSpec from. The
        // pool maintainer's stuck-node reaper will clean this one up.
        return Ok(());
    };

    loop {
        let node = ctx
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("node disappeared during requeue"))?;
        if node.deployment_stage == "configuring_search" || node.deployment_stage == "ready" {
            break;
        }
        ctx.lifecycle.apply(node_id, Transition::AdvanceStage).await?;
    }

    match run_redeploy(ctx, node_id, user_id).await {
        Ok(()) => {
            ctx.lifecycle
                .apply(node_id, Transition::MarkReady(ConvergenceOutcome::Verified))
                .await?;
        }
        Err(e) => {
            ctx.store.set_node_error(node_id, &e.to_string()).await?;
            ctx.lifecycle
                .apply(node_id, Transition::MarkReady(ConvergenceOutcome::Failed))
                .await?;
        }
    }
    Ok(())
}

async fn run_pool_tick(data_dir: Option<std::path::PathBuf>) -> Result<()> {
    let (config, ctx, _secrets) = build_context(None, data_dir, None).await?;
    let pool = PoolMaintainer::new(
        ctx.store.clone(),
        ctx.provider.clone(),
        ctx.lifecycle.clone(),
        PoolConfig {
            min_available: config.min_available,
            max_total: config.max_total,
            node_os_tag: config.node_os_tag.clone(),
        },
    );
    pool.run_once().await?;
    Ok(())
}

async fn run_server(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "fleetd starting");

    let (config, ctx, secrets) = build_context(port, data_dir, log).await?;

    let payment_gateway = Arc::new(HttpPaymentGateway::new(
        secrets.payment_gateway_base_url.clone(),
        secrets.payment_gateway_api_key.clone(),
    ));

    let config_watcher = fleetd::config::ConfigWatcher::start(&config.data_dir);

    let mut pool = PoolMaintainer::new(
        ctx.store.clone(),
        ctx.provider.clone(),
        ctx.lifecycle.clone(),
        PoolConfig {
            min_available: config.min_available,
            max_total: config.max_total,
            node_os_tag: config.node_os_tag.clone(),
        },
    );
    if let Some(watcher) = &config_watcher {
        pool = pool.with_hot_config(watcher.hot.clone());
    }
    Arc::new(pool).spawn();

    let sweeper = Arc::new(Sweeper::new(
        ctx.store.clone(),
        ctx.provider.clone(),
        payment_gateway,
    ));
    sweeper.spawn();

    let router = fleetd::rest::build_router(ctx.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "REST API listening");

    if let Err(e) = axum::serve(listener, router).await {
        error!(err = %e, "REST server exited");
    }

    Ok(())
}
