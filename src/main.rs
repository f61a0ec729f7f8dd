//! Swap Router - cross-chain swap orchestration
//!
//! The router records detected deposits as intents, verifies them against
//! their chain and drives every accepted deposit to exactly one terminal
//! outcome: paid out on the destination chain, recalled to its sender, or
//! rejected with a recorded reason.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod admin;
mod api;
mod chain;
mod config;
mod error;
mod ledger;
mod metrics;
mod orchestrator;
mod registration;
mod stages;
mod tx;

use admin::AdminService;
use api::AppState;
use chain::ChainRegistry;
use config::Settings;
use ledger::Ledger;
use metrics::MetricsServer;
use orchestrator::Orchestrator;
use registration::Registrar;
use stages::StageContext;
use tx::{RpcSigningCoordinator, SigningCoordinator, SwapSender};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Arc::new(Settings::load()?);

    // Initialize logging
    init_logging(settings.router.log_json);

    info!(
        "Starting Swap Router v{} ({})",
        env!("CARGO_PKG_VERSION"),
        settings.router.instance_id
    );
    info!(
        "Loaded configuration for {} chains and {} pairs",
        settings.chains.len(),
        settings.pairs.len()
    );

    // Initialize the swap ledger (runs migrations)
    let ledger = Ledger::connect(&settings.database).await?;
    info!("Swap ledger ready");

    // Initialize chain adapters
    let chains = Arc::new(ChainRegistry::from_settings(&settings).await?);
    info!("Chain connections initialized");

    // Payout signing
    let coordinator: Option<Arc<dyn SigningCoordinator>> = match &settings.signing.rpc_url {
        Some(url) => Some(Arc::new(RpcSigningCoordinator::new(url)?)),
        None => None,
    };
    let router = &settings.router;
    let sender = Arc::new(SwapSender::new(
        coordinator,
        router.sign_retry.policy(),
        router.send_retry.policy(),
        router.rpc_retry.policy(),
    ));

    let ctx = Arc::new(StageContext::new(
        settings.clone(),
        ledger.clone(),
        chains.clone(),
        sender,
    ));

    // Start stages
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::new(ctx);
    let stage_handles = orchestrator.spawn(shutdown_rx);
    info!("Started {} stages", stage_handles.len());

    // Start API server
    let state = AppState {
        settings: settings.clone(),
        ledger: ledger.clone(),
        chains: chains.clone(),
        registrar: Arc::new(Registrar::new(
            settings.clone(),
            ledger.clone(),
            chains.clone(),
        )),
        admin: Arc::new(AdminService::new(&settings.admin, ledger.clone())?),
    };
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let chains = chains.clone();
        let ledger = ledger.clone();
        let interval = settings.router.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                for (chain, healthy) in chains.health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", chain);
                    }
                }

                if let Err(e) = ledger.health_check().await {
                    warn!("Swap ledger health check failed: {}", e);
                }
            }
        }
    });

    info!("Swap Router is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Let every stage finish its current iteration
    let _ = shutdown_tx.send(true);
    for handle in stage_handles {
        if let Err(e) = handle.await {
            error!("Stage task failed: {}", e);
        }
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Swap Router stopped");
    Ok(())
}

fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_router=debug,sqlx=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
