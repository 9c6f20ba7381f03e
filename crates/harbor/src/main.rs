//! Harbor Server
//!
//! Plugin host serving a control plane and a data plane on separate ports.

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use harbor::config::{HostArgs, HostConfig};
use harbor::gateway::{control_router, data_router, DataPlane};
use harbor::loader::PluginLoader;
use harbor::registry::Registry;
use harbor::sandbox::ProcessLauncher;
use harbor::scanner::PluginScanner;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = HostArgs::parse();
    let config = HostConfig::try_from(args).context("invalid configuration")?;

    init_tracing(config.log_json);

    info!("Starting Harbor v{}", env!("CARGO_PKG_VERSION"));
    info!("Plugins directory: {}", config.plugins_dir.display());

    let loader = PluginLoader::new(
        &config.plugins_dir,
        &config.work_dir,
        Arc::new(ProcessLauncher::new()),
    )
    .with_stop_grace(config.drain_grace);
    let registry = Arc::new(Registry::new(loader, config.registry_config()));

    let report = registry
        .initialize()
        .await
        .context("failed to prepare plugin directories")?;
    info!("Discovered {} plugin archive(s)", report.added.len());

    if config.autoload {
        registry.autoload().await;
    }

    if config.auth_token.is_none() {
        if config.allow_anonymous {
            warn!("AUTH_TOKEN is not set; the data plane accepts unauthenticated invocations");
        } else {
            warn!("AUTH_TOKEN is not set; the data plane will reject all invocations");
        }
    }

    let control = control_router(registry.clone(), config.max_body_bytes);
    let data = data_router(
        DataPlane::new(registry.clone())
            .with_timeouts(config.invoke_timeout, config.max_invoke_timeout)
            .with_auth_token(config.auth_token.clone())
            .with_anonymous_access(config.allow_anonymous)
            .with_body_limit(config.max_body_bytes),
    );

    let internal = TcpListener::bind(config.internal_addr)
        .await
        .with_context(|| format!("failed to bind control plane on {}", config.internal_addr))?;
    let external = TcpListener::bind(config.external_addr)
        .await
        .with_context(|| format!("failed to bind data plane on {}", config.external_addr))?;

    info!("Control plane listening on http://{}", config.internal_addr);
    info!("Data plane listening on http://{}", config.external_addr);

    // Start the scanner; a watcher failure falls back to polling
    let mut scanner = PluginScanner::new(registry.clone(), config.scan_interval);
    if config.watch {
        scanner = match scanner.watch() {
            Ok(watching) => watching,
            Err(e) => {
                error!("Failed to start file watcher: {}", e);
                PluginScanner::new(registry.clone(), config.scan_interval)
            }
        };
    }
    let scanner = scanner.spawn();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let served = tokio::try_join!(
        axum::serve(internal, control)
            .with_graceful_shutdown(wait_for(shutdown_rx.clone()))
            .into_future(),
        axum::serve(external, data)
            .with_graceful_shutdown(wait_for(shutdown_rx))
            .into_future(),
    );

    scanner.abort();

    info!("Shutting down plugins...");
    registry.shutdown().await;

    served.context("server error")?;
    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("harbor=info,tower_http=info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
