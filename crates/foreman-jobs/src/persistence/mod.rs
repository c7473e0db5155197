//! Durable job storage.
//!
//! The queue writes a job here before admitting it and resolves the full
//! record again when a worker polls it. Implementations must be safe for
//! concurrent use from many queues.

mod memory;
mod redis;

pub use self::memory::MemoryPersistenceEngine;
pub use self::redis::{create_pool, RedisKeys, RedisPersistenceEngine};

use crate::error::JobResult;
use crate::job::{Job, QueuedJob};
use async_trait::async_trait;

/// Storage contract shared by every backend.
#[async_trait]
pub trait PersistenceEngine: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Stores the job. `Ok(false)` means the backend declined it.
    async fn write(&self, job: &Job) -> JobResult<bool>;

    async fn delete(&self, job: &Job) -> JobResult<()> {
        self.delete_by_id(&job.function_name, &job.unique_id).await
    }

    async fn delete_by_id(&self, function_name: &str, unique_id: &str) -> JobResult<()>;

    async fn delete_all(&self) -> JobResult<()>;

    async fn find_job(&self, function_name: &str, unique_id: &str) -> JobResult<Option<Job>>;

    /// Every stored job, used to rehydrate queues at startup.
    async fn read_all(&self) -> JobResult<Vec<QueuedJob>>;

    async fn get_all_for_function(&self, function_name: &str) -> JobResult<Vec<QueuedJob>>;
}
