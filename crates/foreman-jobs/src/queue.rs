//! Per-function priority queue.
//!
//! Three FIFO deques (high, normal, low) plus a due-time heap for normal
//! jobs gated on an epoch. All mutation happens under one async mutex so
//! the dedup set and the counters never disagree; the persistence write
//! completes before a job is admitted.

use crate::clock::Clock;
use crate::error::{JobError, JobResult};
use crate::job::{Job, QueuedJob};
use crate::persistence::PersistenceEngine;
use foreman_protocol::Priority;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const SECONDS_PER_HOUR: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FutureEntry {
    time_to_run: i64,
    seq: u64,
    unique_id: String,
}

impl Ord for FutureEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.time_to_run, self.seq).cmp(&(other.time_to_run, other.seq))
    }
}

impl PartialOrd for FutureEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    high: VecDeque<String>,
    mid: VecDeque<String>,
    low: VecDeque<String>,
    future: BinaryHeap<Reverse<FutureEntry>>,
    in_use: HashMap<String, QueuedJob>,
    seq: u64,
}

impl QueueState {
    fn push(&mut self, queued: QueuedJob) {
        let unique_id = queued.unique_id.clone();
        if queued.is_future() {
            self.seq += 1;
            self.future.push(Reverse(FutureEntry {
                time_to_run: queued.time_to_run,
                seq: self.seq,
                unique_id: unique_id.clone(),
            }));
        } else {
            match queued.priority {
                Priority::High => self.high.push_back(unique_id.clone()),
                Priority::Normal => self.mid.push_back(unique_id.clone()),
                Priority::Low => self.low.push_back(unique_id.clone()),
            }
        }
        self.in_use.insert(unique_id, queued);
    }

    fn future_due(&self, now: i64) -> bool {
        self.future
            .peek()
            .is_some_and(|Reverse(entry)| entry.time_to_run <= now)
    }

    fn pop_next(&mut self, now: i64) -> Option<QueuedJob> {
        let unique_id = if let Some(id) = self.high.pop_front() {
            id
        } else if self.future_due(now) {
            self.future.pop().map(|Reverse(entry)| entry.unique_id)?
        } else if let Some(id) = self.mid.pop_front() {
            id
        } else {
            self.low.pop_front()?
        };
        self.in_use.remove(&unique_id)
    }

    fn take(&mut self, unique_id: &str) -> Option<QueuedJob> {
        let queued = self.in_use.remove(unique_id)?;
        if queued.is_future() {
            self.future.retain(|Reverse(entry)| entry.unique_id != unique_id);
        } else {
            let deque = match queued.priority {
                Priority::High => &mut self.high,
                Priority::Normal => &mut self.mid,
                Priority::Low => &mut self.low,
            };
            deque.retain(|id| id != unique_id);
        }
        Some(queued)
    }

    fn has_ready(&self, now: i64) -> bool {
        !self.high.is_empty() || !self.mid.is_empty() || !self.low.is_empty() || self.future_due(now)
    }
}

/// Per-priority counters, readable without the queue lock.
#[derive(Debug, Default)]
struct Counters {
    high: AtomicUsize,
    normal: AtomicUsize,
    low: AtomicUsize,
}

impl Counters {
    fn for_priority(&self, priority: Priority) -> &AtomicUsize {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }
}

/// Priority queue for one function name.
pub struct JobQueue {
    function_name: String,
    engine: Arc<dyn PersistenceEngine>,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    counters: Counters,
    /// 0 = unlimited.
    max_size: AtomicUsize,
}

impl JobQueue {
    pub fn new(
        function_name: impl Into<String>,
        engine: Arc<dyn PersistenceEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            engine,
            clock,
            state: Mutex::new(QueueState::default()),
            counters: Counters::default(),
            max_size: AtomicUsize::new(0),
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Sets the capacity; 0 removes the limit.
    pub fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size, Ordering::Relaxed);
    }

    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Persists and admits a job.
    ///
    /// Returns `Ok(false)` when the unique id is already queued. A failed
    /// persistence write is reported as [`JobError::Enqueue`] and leaves
    /// the queue untouched.
    pub async fn enqueue(&self, job: &Job) -> JobResult<bool> {
        let mut state = self.state.lock().await;

        if state.in_use.contains_key(&job.unique_id) {
            debug!(function = %self.function_name, unique_id = %job.unique_id, "Duplicate submission");
            return Ok(false);
        }

        let capacity = self.max_size();
        if capacity > 0 && state.in_use.len() >= capacity {
            return Err(JobError::QueueFull {
                function: self.function_name.clone(),
                capacity,
            });
        }

        match self.engine.write(job).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(self.enqueue_error(job, "rejected by persistence engine".to_string()))
            }
            Err(e) => return Err(self.enqueue_error(job, e.to_string())),
        }

        self.admit(&mut state, QueuedJob::from(job));
        debug!(
            function = %self.function_name,
            unique_id = %job.unique_id,
            priority = %job.priority,
            time_to_run = job.time_to_run,
            "Enqueued job"
        );
        Ok(true)
    }

    /// Admits a job that is already persisted (startup rehydration and
    /// requeue after a worker disconnect).
    pub async fn reinstate(&self, queued: QueuedJob) -> bool {
        let mut state = self.state.lock().await;
        if state.in_use.contains_key(&queued.unique_id) {
            return false;
        }
        self.admit(&mut state, queued);
        true
    }

    fn admit(&self, state: &mut QueueState, queued: QueuedJob) {
        self.counters
            .for_priority(queued.priority)
            .fetch_add(1, Ordering::SeqCst);
        state.push(queued);
    }

    fn enqueue_error(&self, job: &Job, reason: String) -> JobError {
        JobError::Enqueue {
            function: self.function_name.clone(),
            unique_id: job.unique_id.clone(),
            reason,
        }
    }

    /// Takes the next ready job: high, then a due epoch job, then normal,
    /// then low. The full record is resolved from persistence; a failed
    /// lookup is logged and yields `None`.
    pub async fn poll(&self) -> Option<Job> {
        let queued = self.take_next().await?;
        self.resolve(&queued).await
    }

    /// Pops the next ready entry without touching persistence.
    pub async fn take_next(&self) -> Option<QueuedJob> {
        let mut state = self.state.lock().await;
        let queued = state.pop_next(self.clock.now())?;
        self.counters
            .for_priority(queued.priority)
            .fetch_sub(1, Ordering::SeqCst);
        Some(queued)
    }

    /// Loads the full record for a popped entry.
    pub async fn resolve(&self, queued: &QueuedJob) -> Option<Job> {
        match self
            .engine
            .find_job(&self.function_name, &queued.unique_id)
            .await
        {
            Ok(Some(job)) => Some(job),
            Ok(None) => {
                warn!(
                    function = %self.function_name,
                    unique_id = %queued.unique_id,
                    "Queued job missing from persistence"
                );
                None
            }
            Err(e) => {
                warn!(
                    function = %self.function_name,
                    unique_id = %queued.unique_id,
                    error = %e,
                    "Failed to load queued job"
                );
                None
            }
        }
    }

    /// Removes a queued job from the queue and from persistence.
    pub async fn remove(&self, job: &Job) -> bool {
        let mut state = self.state.lock().await;
        let Some(queued) = state.take(&job.unique_id) else {
            return false;
        };
        self.counters
            .for_priority(queued.priority)
            .fetch_sub(1, Ordering::SeqCst);

        if let Err(e) = self.engine.delete(job).await {
            warn!(
                function = %self.function_name,
                unique_id = %job.unique_id,
                error = %e,
                "Failed to delete removed job from persistence"
            );
        }
        true
    }

    /// Total queued jobs.
    pub fn size(&self) -> usize {
        Priority::ALL.iter().map(|p| self.size_of(*p)).sum()
    }

    /// Queued jobs of one priority (normal includes epoch jobs).
    pub fn size_of(&self, priority: Priority) -> usize {
        self.counters.for_priority(priority).load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub async fn unique_id_in_use(&self, unique_id: &str) -> bool {
        self.state.lock().await.in_use.contains_key(unique_id)
    }

    pub async fn find_queued(&self, unique_id: &str) -> Option<QueuedJob> {
        self.state.lock().await.in_use.get(unique_id).cloned()
    }

    /// Every queued job, in no particular order.
    pub async fn get_all_jobs(&self) -> Vec<QueuedJob> {
        self.state.lock().await.in_use.values().cloned().collect()
    }

    /// Pending epoch jobs bucketed by whole hours until due; bucket 0
    /// holds anything already due.
    pub async fn future_counts(&self) -> BTreeMap<i64, usize> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for Reverse(entry) in &state.future {
            let bucket = ((entry.time_to_run - now) / SECONDS_PER_HOUR).max(0);
            *counts.entry(bucket).or_insert(0) += 1;
        }
        counts
    }

    /// True if `poll` would find something right now.
    pub async fn has_ready_jobs(&self) -> bool {
        let now = self.clock.now();
        self.state.lock().await.has_ready(now)
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("function_name", &self.function_name)
            .field("engine", &self.engine.name())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::MemoryPersistenceEngine;
    use async_trait::async_trait;

    const NOW: i64 = 1_700_000_000;

    fn queue() -> (JobQueue, Arc<ManualClock>, Arc<MemoryPersistenceEngine>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let engine = Arc::new(MemoryPersistenceEngine::new());
        let queue = JobQueue::new("reverse", engine.clone(), clock.clone());
        (queue, clock, engine)
    }

    fn job(unique: &str, priority: Priority) -> Job {
        Job::new("reverse", unique, unique.as_bytes().to_vec()).with_priority(priority)
    }

    /// Engine whose writes always fail or are declined.
    struct FailingEngine {
        decline: bool,
    }

    #[async_trait]
    impl PersistenceEngine for FailingEngine {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn write(&self, _job: &Job) -> JobResult<bool> {
            if self.decline {
                Ok(false)
            } else {
                Err(JobError::Persistence("disk on fire".into()))
            }
        }
        async fn delete_by_id(&self, _f: &str, _u: &str) -> JobResult<()> {
            Ok(())
        }
        async fn delete_all(&self) -> JobResult<()> {
            Ok(())
        }
        async fn find_job(&self, _f: &str, _u: &str) -> JobResult<Option<Job>> {
            Err(JobError::Persistence("unreachable".into()))
        }
        async fn read_all(&self) -> JobResult<Vec<QueuedJob>> {
            Ok(Vec::new())
        }
        async fn get_all_for_function(&self, _f: &str) -> JobResult<Vec<QueuedJob>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_priority_order() {
        let (queue, _, _) = queue();
        assert!(queue.enqueue(&job("low", Priority::Low)).await.unwrap());
        assert!(queue.enqueue(&job("normal", Priority::Normal)).await.unwrap());
        assert!(queue.enqueue(&job("high", Priority::High)).await.unwrap());

        assert_eq!(queue.poll().await.unwrap().unique_id, "high");
        assert_eq!(queue.poll().await.unwrap().unique_id, "normal");
        assert_eq!(queue.poll().await.unwrap().unique_id, "low");
        assert!(queue.poll().await.is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let (queue, _, _) = queue();
        for id in ["a", "b", "c"] {
            queue.enqueue(&job(id, Priority::Normal)).await.unwrap();
        }
        for id in ["a", "b", "c"] {
            assert_eq!(queue.poll().await.unwrap().unique_id, id);
        }
    }

    #[tokio::test]
    async fn test_epoch_gating() {
        let (queue, clock, _) = queue();
        let epoch = job("later", Priority::Normal).run_at(NOW + 40);
        assert!(queue.enqueue(&epoch).await.unwrap());
        assert!(queue.poll().await.is_none());
        assert!(!queue.has_ready_jobs().await);
        assert_eq!(queue.size(), 1);

        queue.enqueue(&job("now", Priority::Normal)).await.unwrap();
        assert_eq!(queue.poll().await.unwrap().unique_id, "now");

        clock.advance(41);
        assert!(queue.has_ready_jobs().await);
        assert_eq!(queue.poll().await.unwrap().unique_id, "later");
        assert!(queue.poll().await.is_none());
    }

    #[tokio::test]
    async fn test_due_epoch_job_beats_mid_but_not_high() {
        let (queue, clock, _) = queue();
        queue
            .enqueue(&job("epoch", Priority::Normal).run_at(NOW + 10))
            .await
            .unwrap();
        queue.enqueue(&job("mid", Priority::Normal)).await.unwrap();
        queue.enqueue(&job("high", Priority::High)).await.unwrap();
        clock.advance(10);

        assert_eq!(queue.poll().await.unwrap().unique_id, "high");
        assert_eq!(queue.poll().await.unwrap().unique_id, "epoch");
        assert_eq!(queue.poll().await.unwrap().unique_id, "mid");
    }

    #[tokio::test]
    async fn test_epoch_jobs_ordered_by_due_time() {
        let (queue, clock, _) = queue();
        queue
            .enqueue(&job("second", Priority::Normal).run_at(NOW + 20))
            .await
            .unwrap();
        queue
            .enqueue(&job("first", Priority::Normal).run_at(NOW + 10))
            .await
            .unwrap();
        clock.advance(30);

        assert_eq!(queue.poll().await.unwrap().unique_id, "first");
        assert_eq!(queue.poll().await.unwrap().unique_id, "second");
    }

    #[tokio::test]
    async fn test_dedup_is_idempotent() {
        let (queue, _, _) = queue();
        assert!(queue.enqueue(&job("same", Priority::Normal)).await.unwrap());
        assert!(!queue.enqueue(&job("same", Priority::Normal)).await.unwrap());
        assert_eq!(queue.size(), 1);
        assert!(queue.unique_id_in_use("same").await);

        assert!(queue.poll().await.is_some());
        assert!(!queue.unique_id_in_use("same").await);
        assert!(queue.poll().await.is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let (queue, _, engine) = queue();
        let a = job("a", Priority::Low);
        queue.enqueue(&a).await.unwrap();
        queue.enqueue(&job("b", Priority::Low)).await.unwrap();

        assert!(queue.remove(&a).await);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.size_of(Priority::Low), 1);
        assert!(engine.find_job("reverse", "a").await.unwrap().is_none());

        assert!(!queue.remove(&a).await);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.poll().await.unwrap().unique_id, "b");
    }

    #[tokio::test]
    async fn test_remove_epoch_job() {
        let (queue, clock, _) = queue();
        let epoch = job("e", Priority::Normal).run_at(NOW + 5);
        queue.enqueue(&epoch).await.unwrap();
        assert!(queue.remove(&epoch).await);
        clock.advance(10);
        assert!(queue.poll().await.is_none());
        assert!(queue.future_counts().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_queue_untouched() {
        let clock = Arc::new(ManualClock::new(NOW));
        for decline in [false, true] {
            let queue = JobQueue::new("f", Arc::new(FailingEngine { decline }), clock.clone());
            let err = queue.enqueue(&job("x", Priority::High)).await.unwrap_err();
            assert!(matches!(err, JobError::Enqueue { .. }));
            assert!(queue.is_empty());
            assert!(!queue.unique_id_in_use("x").await);
        }
    }

    #[tokio::test]
    async fn test_poll_with_unreadable_persistence_yields_none() {
        let clock = Arc::new(ManualClock::new(NOW));
        let queue = JobQueue::new("f", Arc::new(FailingEngine { decline: false }), clock);
        let queued = QueuedJob::from(&job("x", Priority::Normal));
        assert!(queue.reinstate(queued).await);

        assert!(queue.poll().await.is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_capacity() {
        let (queue, _, engine) = queue();
        queue.set_max_size(2);
        queue.enqueue(&job("a", Priority::Normal)).await.unwrap();
        queue.enqueue(&job("b", Priority::Normal)).await.unwrap();

        let err = queue.enqueue(&job("c", Priority::Normal)).await.unwrap_err();
        assert!(matches!(err, JobError::QueueFull { capacity: 2, .. }));
        assert_eq!(queue.size(), 2);
        assert!(engine.find_job("reverse", "c").await.unwrap().is_none());

        // Duplicates are still answered while full.
        assert!(!queue.enqueue(&job("a", Priority::Normal)).await.unwrap());

        queue.set_max_size(0);
        assert!(queue.enqueue(&job("c", Priority::Normal)).await.unwrap());
    }

    #[tokio::test]
    async fn test_future_counts() {
        let (queue, clock, _) = queue();
        queue
            .enqueue(&job("soon", Priority::Normal).run_at(NOW + 60))
            .await
            .unwrap();
        queue
            .enqueue(&job("two-hours", Priority::Normal).run_at(NOW + 2 * 3600 + 5))
            .await
            .unwrap();
        queue
            .enqueue(&job("also-soon", Priority::Normal).run_at(NOW + 120))
            .await
            .unwrap();

        let counts = queue.future_counts().await;
        assert_eq!(counts.get(&0), Some(&2));
        assert_eq!(counts.get(&2), Some(&1));

        clock.advance(3 * 3600);
        let counts = queue.future_counts().await;
        assert_eq!(counts.get(&0), Some(&3));
    }

    #[tokio::test]
    async fn test_sizes_by_priority_and_listing() {
        let (queue, _, _) = queue();
        queue.enqueue(&job("h", Priority::High)).await.unwrap();
        queue.enqueue(&job("n", Priority::Normal)).await.unwrap();
        queue
            .enqueue(&job("e", Priority::Normal).run_at(NOW + 100))
            .await
            .unwrap();
        queue.enqueue(&job("l", Priority::Low)).await.unwrap();

        assert_eq!(queue.size_of(Priority::High), 1);
        assert_eq!(queue.size_of(Priority::Normal), 2);
        assert_eq!(queue.size_of(Priority::Low), 1);
        assert_eq!(queue.get_all_jobs().await.len(), 4);
        assert_eq!(
            queue.find_queued("e").await.map(|q| q.time_to_run),
            Some(NOW + 100)
        );
    }

    #[tokio::test]
    async fn test_concurrent_identical_enqueue_admits_once() {
        let (queue, _, _) = queue();
        let queue = Arc::new(queue);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.enqueue(&job("race", Priority::Normal)).await.unwrap()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(queue.size(), 1);
    }
}
