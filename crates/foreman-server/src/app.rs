//! Application builder.

use anyhow::Context;
use foreman_config::{AppConfig, PersistenceBackend};
use foreman_core::ForemanResult;
use foreman_jobs::{create_pool, JobManager, MemoryPersistenceEngine, PersistenceEngine, RedisPersistenceEngine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::server::BrokerServer;

/// Application builder for constructing the broker.
pub struct AppBuilder {
    config: Option<AppConfig>,
    shutdown: CancellationToken,
}

impl AppBuilder {
    /// Creates a new application builder.
    pub fn new() -> Self {
        Self {
            config: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses an externally owned shutdown token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Builds the persistence engine and job manager, rehydrates persisted
    /// jobs, and binds the listener.
    pub async fn build(self) -> ForemanResult<App> {
        let config = self.config.unwrap_or_default();

        let engine = build_engine(&config).await?;
        info!(engine = engine.name(), "Persistence engine ready");

        let manager = Arc::new(JobManager::new(config.engine.clone(), engine));
        let restored = manager.load_persisted_jobs().await?;
        if restored > 0 {
            info!(restored, "Restored persisted jobs");
        }

        let server = BrokerServer::bind(&config.server, manager.clone(), self.shutdown).await?;
        Ok(App {
            config,
            manager,
            server,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A built broker, ready to serve.
pub struct App {
    pub config: AppConfig,
    pub manager: Arc<JobManager>,
    pub server: BrokerServer,
}

impl App {
    pub async fn run(self) -> ForemanResult<()> {
        self.server.serve().await
    }
}

/// Creates the configured persistence engine.
pub async fn build_engine(config: &AppConfig) -> ForemanResult<Arc<dyn PersistenceEngine>> {
    match config.persistence.backend {
        PersistenceBackend::Memory => Ok(Arc::new(MemoryPersistenceEngine::new())),
        PersistenceBackend::Redis => {
            let redis = &config.persistence.redis;
            let pool = create_pool(redis)
                .await
                .with_context(|| format!("Failed to connect to Redis at {}", redis.url))?;
            Ok(Arc::new(RedisPersistenceEngine::new(pool, &redis.key_prefix)))
        }
    }
}
