//! Server startup utilities.

use foreman_config::AppConfig;
use tracing::info;

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
    ______
   / ____/___  ________  ____ ___  ____ _____
  / /_  / __ \/ ___/ _ \/ __ `__ \/ __ `/ __ \
 / __/ / /_/ / /  /  __/ / / / / / /_/ / / / /
/_/    \____/_/   \___/_/ /_/ /_/\__,_/_/ /_/

                   job broker
    "#);
}

/// Prints server startup information.
pub fn print_startup_info(config: &AppConfig, port: u16) {
    let separator = "=".repeat(60);
    info!("{}", separator);
    info!("Broker:       {}:{}", config.server.host, port);
    info!("Persistence:  {}", config.persistence.backend);
    info!("Handles:      H:{}:<seq>", config.engine.hostname);
    info!("Long poll:    {}s", config.engine.long_poll_interval_secs);
    info!("On worker disconnect: {}", config.engine.worker_disconnect_policy);
    info!("{}", separator);
}
