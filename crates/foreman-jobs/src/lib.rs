//! Foreman Jobs - job engine for the Foreman broker
//!
//! Everything between the wire and the workers:
//! - Per-function queues with three priority lanes plus epoch-gated jobs
//! - Deduplication of identical submissions by `(function, unique id)`
//! - Worker pools with sleep/wake (PRE_SLEEP / NOOP) bookkeeping
//! - Result fan-out to every client waiting on a job
//! - Pluggable persistence (in-memory or Redis) with restart rehydration
//! - Cluster event hooks for peer brokers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         JobManager                            │
//! │                                                               │
//! │  submit ──► FunctionEntry("resize")                           │
//! │             ┌──────────────────────────────────────────────┐  │
//! │             │ JobQueue    high │ future(epoch) │ mid │ low │  │
//! │             │ WorkerPool  workers + sleepers               │  │
//! │             │ ClientRegistry  unique id ──► waiting clients│  │
//! │             └──────────────────────────────────────────────┘  │
//! │                                                               │
//! │  JobIndex: key ──► job, handle ──► key                        │
//! │                                                               │
//! │  PersistenceEngine (memory | redis)   ClusterEvent channel    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use foreman_jobs::{Job, JobManager, MemoryPersistenceEngine, Priority};
//! use std::sync::Arc;
//!
//! let manager = JobManager::new(EngineConfig::default(), Arc::new(MemoryPersistenceEngine::new()));
//! let job = manager
//!     .store_job_for_client(Job::new("resize", "img-42", payload).with_priority(Priority::High), None)
//!     .await?;
//! println!("queued as {}", job.handle);
//! ```

pub mod client_registry;
pub mod clock;
pub mod cluster;
pub mod error;
pub mod id;
pub mod job;
pub mod manager;
pub mod persistence;
pub mod queue;
pub mod session;
pub mod worker_pool;

pub use client_registry::ClientRegistry;
pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{ClusterEvent, ClusterEventKind};
pub use error::{JobError, JobResult};
pub use foreman_protocol::Priority;
pub use id::{IdGenerator, JobHandleFactory, UniqueIdFactory};
pub use job::{Job, JobKey, JobState, JobStatus, QueuedJob};
pub use manager::{FunctionEntry, FunctionStats, JobManager};
pub use persistence::{
    create_pool, MemoryPersistenceEngine, PersistenceEngine, RedisKeys, RedisPersistenceEngine,
};
pub use queue::JobQueue;
pub use session::{Session, SessionId};
pub use worker_pool::WorkerPool;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::job::{Job, JobState, JobStatus};
    pub use crate::manager::JobManager;
    pub use crate::persistence::PersistenceEngine;
    pub use crate::session::Session;
    pub use crate::{JobError, JobResult, Priority};
}
