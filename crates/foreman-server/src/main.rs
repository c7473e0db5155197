//! # Foreman Server
//!
//! Main entry point for the Foreman job broker.

use foreman_config::ConfigLoader;
use foreman_core::{init_logging, ForemanResult};
use foreman_server::{startup, AppBuilder};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Application error: {}", e);
        eprintln!("foreman-server: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> ForemanResult<()> {
    // Load configuration
    let config = ConfigLoader::from_default_location()?.into_config();

    init_logging(&config.logging)?;
    startup::print_banner();

    info!("Starting Foreman broker...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.environment);

    let shutdown = CancellationToken::new();
    let app = AppBuilder::new()
        .with_config(config)
        .with_shutdown(shutdown.clone())
        .build()
        .await?;

    startup::print_startup_info(&app.config, app.server.local_addr()?.port());

    tokio::spawn(shutdown_signal(shutdown));
    app.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Cancels `shutdown` on Ctrl+C or SIGTERM. Returns early if something
/// else (the `shutdown` admin command) cancelled it first.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        () = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
        () = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}
