mod api;
mod application;
mod config;
mod error;
mod infrastructure;
mod registry;
mod state;
mod workers;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use error::DeployError;
use state::AppContext;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bluegreend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting bluegreend {}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Registry at {}, proxy at {}, runtime '{}'",
        config.registry_root.display(),
        config.proxy_root.display(),
        config.runtime_bin
    );

    let bind_addr = config.bind_addr;
    let context = match AppContext::new(config).await {
        Ok(context) => context,
        Err(DeployError::RegistryCorrupt(msg)) => {
            error!("Registry corruption detected, refusing to start: {}", msg);
            std::process::exit(2);
        }
        Err(e) => {
            error!("Startup failed: {:#}", e);
            std::process::exit(1);
        }
    };
    info!("Application state initialized");

    // Background workers: drift repair (startup + hourly) and the grace
    // expiry sweep (every 15 minutes).
    tokio::spawn(workers::run_reconciler(context.clone()));
    tokio::spawn(workers::run_grace_sweeper(context.clone()));

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", bind_addr, e);
            std::process::exit(1);
        }
    };
    info!("API listening on {}", bind_addr);

    let app = api::router(context);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Shutting down...");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
