//! TCP listener and accept loop.

use crate::connection::{Connection, ConnectionSettings};
use foreman_config::ServerConfig;
use foreman_core::{ForemanError, ForemanResult};
use foreman_jobs::JobManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// The broker's listening socket.
pub struct BrokerServer {
    listener: TcpListener,
    manager: Arc<JobManager>,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
}

impl BrokerServer {
    /// Binds the configured address. Port 0 picks a free port.
    pub async fn bind(
        config: &ServerConfig,
        manager: Arc<JobManager>,
        shutdown: CancellationToken,
    ) -> ForemanResult<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ForemanError::Bind {
                addr: addr.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            listener,
            manager,
            settings: ConnectionSettings {
                max_payload: config.max_packet_size,
                max_line: config.max_text_line,
            },
            shutdown,
        })
    }

    pub fn local_addr(&self) -> ForemanResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the accept loop and every connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts connections until shutdown, then waits for open
    /// connections to wind down.
    pub async fn serve(self) -> ForemanResult<()> {
        let addr = self.local_addr()?;
        info!(%addr, "Broker listening");

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            error!(%peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let connection = Connection::new(
                            stream,
                            peer,
                            self.manager.clone(),
                            self.settings,
                            self.shutdown.clone(),
                        );
                        tracker.spawn(connection.run());
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        tracker.close();
        info!(open = tracker.len(), "Waiting for connections to close");
        tracker.wait().await;
        info!("Broker stopped");
        Ok(())
    }
}
