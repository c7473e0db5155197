//! Redis-backed persistence.
//!
//! Jobs live as JSON in one hash per function (`{prefix}:jobs:{function}`,
//! field = unique id). The set `{prefix}:functions` lists every function
//! that has had a job stored, so startup can find them all.

use super::PersistenceEngine;
use crate::error::{JobError, JobResult};
use crate::job::{Job, QueuedJob};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use foreman_config::RedisConfig;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

/// Create a Redis connection pool and check it with a PING.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    info!("Creating Redis connection pool for job persistence...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder for job persistence.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Hash of unique id to job JSON for one function.
    pub fn jobs(&self, function_name: &str) -> String {
        format!("{}:jobs:{}", self.prefix, function_name)
    }

    /// Set of function names with stored jobs.
    pub fn functions(&self) -> String {
        format!("{}:functions", self.prefix)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("foreman")
    }
}

/// Redis persistence engine.
pub struct RedisPersistenceEngine {
    pool: Pool,
    keys: RedisKeys,
}

impl RedisPersistenceEngine {
    pub fn new(pool: Pool, key_prefix: &str) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
        }
    }

    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    fn parse_all(function_name: &str, values: Vec<String>) -> Vec<QueuedJob> {
        values
            .iter()
            .filter_map(|json| match Job::from_json(json) {
                Ok(job) => Some(QueuedJob::from(&job)),
                Err(e) => {
                    warn!(function = %function_name, error = %e, "Skipping unreadable job record");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl PersistenceEngine for RedisPersistenceEngine {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn write(&self, job: &Job) -> JobResult<bool> {
        let json = job.to_json()?;
        let mut conn = self.conn().await?;

        let _: () = redis::pipe()
            .atomic()
            .hset(self.keys.jobs(&job.function_name), &job.unique_id, &json)
            .ignore()
            .sadd(self.keys.functions(), &job.function_name)
            .ignore()
            .query_async(&mut *conn)
            .await?;

        debug!(function = %job.function_name, unique_id = %job.unique_id, "Persisted job");
        Ok(true)
    }

    async fn delete_by_id(&self, function_name: &str, unique_id: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hdel(self.keys.jobs(function_name), unique_id).await?;
        Ok(())
    }

    async fn delete_all(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let functions: Vec<String> = conn.smembers(self.keys.functions()).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for function_name in &functions {
            pipe.del(self.keys.jobs(function_name)).ignore();
        }
        pipe.del(self.keys.functions()).ignore();
        let _: () = pipe.query_async(&mut *conn).await?;

        info!(functions = functions.len(), "Deleted all persisted jobs");
        Ok(())
    }

    async fn find_job(&self, function_name: &str, unique_id: &str) -> JobResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let json: Option<String> = conn.hget(self.keys.jobs(function_name), unique_id).await?;
        json.map(|j| Job::from_json(&j)).transpose()
    }

    async fn read_all(&self) -> JobResult<Vec<QueuedJob>> {
        let mut conn = self.conn().await?;
        let functions: Vec<String> = conn.smembers(self.keys.functions()).await?;

        let mut all = Vec::new();
        for function_name in functions {
            let values: Vec<String> = conn.hvals(self.keys.jobs(&function_name)).await?;
            all.extend(Self::parse_all(&function_name, values));
        }
        Ok(all)
    }

    async fn get_all_for_function(&self, function_name: &str) -> JobResult<Vec<QueuedJob>> {
        let mut conn = self.conn().await?;
        let values: Vec<String> = conn.hvals(self.keys.jobs(function_name)).await?;
        Ok(Self::parse_all(function_name, values))
    }
}
