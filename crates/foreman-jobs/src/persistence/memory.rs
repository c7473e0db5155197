//! In-process persistence. Nothing survives a restart.

use super::PersistenceEngine;
use crate::error::JobResult;
use crate::job::{Job, QueuedJob};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Map of function name to unique id to job.
#[derive(Debug, Default)]
pub struct MemoryPersistenceEngine {
    jobs: RwLock<HashMap<String, HashMap<String, Job>>>,
}

impl MemoryPersistenceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs across all functions.
    pub fn len(&self) -> usize {
        self.jobs.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistenceEngine for MemoryPersistenceEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, job: &Job) -> JobResult<bool> {
        self.jobs
            .write()
            .entry(job.function_name.clone())
            .or_default()
            .insert(job.unique_id.clone(), job.clone());
        Ok(true)
    }

    async fn delete_by_id(&self, function_name: &str, unique_id: &str) -> JobResult<()> {
        let mut jobs = self.jobs.write();
        if let Some(by_unique) = jobs.get_mut(function_name) {
            by_unique.remove(unique_id);
            if by_unique.is_empty() {
                jobs.remove(function_name);
            }
        }
        Ok(())
    }

    async fn delete_all(&self) -> JobResult<()> {
        self.jobs.write().clear();
        Ok(())
    }

    async fn find_job(&self, function_name: &str, unique_id: &str) -> JobResult<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .get(function_name)
            .and_then(|by_unique| by_unique.get(unique_id))
            .cloned())
    }

    async fn read_all(&self) -> JobResult<Vec<QueuedJob>> {
        Ok(self
            .jobs
            .read()
            .values()
            .flat_map(HashMap::values)
            .map(QueuedJob::from)
            .collect())
    }

    async fn get_all_for_function(&self, function_name: &str) -> JobResult<Vec<QueuedJob>> {
        Ok(self
            .jobs
            .read()
            .get(function_name)
            .map(|by_unique| by_unique.values().map(QueuedJob::from).collect())
            .unwrap_or_default())
    }
}
