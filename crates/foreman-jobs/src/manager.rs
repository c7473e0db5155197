//! Job orchestration.
//!
//! The manager owns one [`FunctionEntry`] (queue, worker pool, client
//! registry) per function name and an index of every live job, queued or
//! working, by key and by handle. Each function is its own contention
//! domain; nothing takes a lock across functions while awaiting.

use crate::client_registry::ClientRegistry;
use crate::clock::{Clock, SystemClock};
use crate::cluster::{ClusterEvent, ClusterEventKind};
use crate::error::{JobError, JobResult};
use crate::id::{IdGenerator, JobHandleFactory, UniqueIdFactory};
use crate::job::{Job, JobKey, JobState, JobStatus, QueuedJob};
use crate::persistence::PersistenceEngine;
use crate::queue::JobQueue;
use crate::session::{Session, SessionId};
use crate::worker_pool::WorkerPool;
use bytes::Bytes;
use foreman_config::{EngineConfig, WorkerDisconnectPolicy};
use foreman_protocol::{Packet, PacketBody, Priority};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Everything the broker keeps for one function name.
#[derive(Debug)]
pub struct FunctionEntry {
    pub queue: JobQueue,
    pub workers: WorkerPool,
    pub clients: ClientRegistry,
    /// Serializes dedup check and admission for this function.
    admission: tokio::sync::Mutex<()>,
}

/// Per-function counters for admin output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionStats {
    pub function_name: String,
    pub queued: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub running: usize,
    pub workers: usize,
    pub sleeping: usize,
    pub max_queue: usize,
}

#[derive(Debug, Clone)]
struct LiveJob {
    job: Job,
    worker: Option<SessionId>,
}

#[derive(Debug, Default)]
struct JobIndex {
    jobs: HashMap<JobKey, LiveJob>,
    handles: HashMap<String, JobKey>,
}

impl JobIndex {
    fn insert(&mut self, job: Job, worker: Option<SessionId>) {
        let key = job.key();
        self.handles.insert(job.handle.clone(), key.clone());
        self.jobs.insert(key, LiveJob { job, worker });
    }

    fn by_handle(&self, handle: &str) -> Option<&LiveJob> {
        self.handles.get(handle).and_then(|key| self.jobs.get(key))
    }

    fn by_handle_mut(&mut self, handle: &str) -> Option<&mut LiveJob> {
        let key = self.handles.get(handle)?;
        self.jobs.get_mut(key)
    }

    fn remove(&mut self, key: &JobKey) -> Option<LiveJob> {
        let live = self.jobs.remove(key)?;
        self.handles.remove(&live.job.handle);
        Some(live)
    }
}

enum Outcome {
    Complete(Bytes),
    Fail,
    Exception(Bytes),
}

impl Outcome {
    fn state(&self) -> JobState {
        match self {
            Outcome::Complete(_) => JobState::Complete,
            Outcome::Fail | Outcome::Exception(_) => JobState::Failed,
        }
    }

    fn packet_for(&self, handle: &str, waiter: &Session) -> Packet {
        let handle = handle.to_string();
        let body = match self {
            Outcome::Complete(data) => PacketBody::WorkComplete {
                handle,
                data: data.clone(),
            },
            Outcome::Exception(data) if waiter.wants_exceptions() => PacketBody::WorkException {
                handle,
                data: data.clone(),
            },
            Outcome::Fail | Outcome::Exception(_) => PacketBody::WorkFail { handle },
        };
        Packet::response(body)
    }
}

fn ensure_state(job: &Job, expected: JobState) -> JobResult<()> {
    if job.state == expected {
        Ok(())
    } else {
        Err(JobError::IllegalStateTransition {
            handle: job.handle.clone(),
            expected: expected.to_string(),
            actual: job.state.to_string(),
        })
    }
}

/// The job engine.
pub struct JobManager {
    config: EngineConfig,
    engine: Arc<dyn PersistenceEngine>,
    clock: Arc<dyn Clock>,
    handles: Arc<dyn IdGenerator>,
    unique_ids: Arc<dyn IdGenerator>,
    functions: RwLock<HashMap<String, Arc<FunctionEntry>>>,
    index: Mutex<JobIndex>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    cluster: Option<mpsc::UnboundedSender<ClusterEvent>>,
}

impl JobManager {
    pub fn new(config: EngineConfig, engine: Arc<dyn PersistenceEngine>) -> Self {
        let handles = Arc::new(JobHandleFactory::new(config.hostname.clone()));
        Self {
            config,
            engine,
            clock: Arc::new(SystemClock),
            handles,
            unique_ids: Arc::new(UniqueIdFactory),
            functions: RwLock::new(HashMap::new()),
            index: Mutex::new(JobIndex::default()),
            sessions: RwLock::new(HashMap::new()),
            cluster: None,
        }
    }

    /// Must be set before any queue exists.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_handle_generator(mut self, handles: Arc<dyn IdGenerator>) -> Self {
        self.handles = handles;
        self
    }

    pub fn with_unique_id_generator(mut self, unique_ids: Arc<dyn IdGenerator>) -> Self {
        self.unique_ids = unique_ids;
        self
    }

    /// Publishes submit, data and completion events to peers.
    pub fn with_cluster(mut self, outbound: mpsc::UnboundedSender<ClusterEvent>) -> Self {
        self.cluster = Some(outbound);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Returns the function's entry, creating it on first use.
    pub fn entry(&self, function_name: &str) -> Arc<FunctionEntry> {
        if let Some(entry) = self.functions.read().get(function_name) {
            return entry.clone();
        }
        let mut functions = self.functions.write();
        functions
            .entry(function_name.to_string())
            .or_insert_with(|| {
                debug!(function = %function_name, "Creating function queue");
                let queue = JobQueue::new(function_name, self.engine.clone(), self.clock.clone());
                queue.set_max_size(self.config.max_queue_size);
                Arc::new(FunctionEntry {
                    queue,
                    workers: WorkerPool::new(function_name),
                    clients: ClientRegistry::new(),
                    admission: tokio::sync::Mutex::new(()),
                })
            })
            .clone()
    }

    pub fn function(&self, function_name: &str) -> Option<Arc<FunctionEntry>> {
        self.functions.read().get(function_name).cloned()
    }

    fn all_functions(&self) -> Vec<Arc<FunctionEntry>> {
        self.functions.read().values().cloned().collect()
    }

    // ============ Sessions ============

    pub fn register_session(&self, session: Arc<Session>) {
        debug!(session = %session.id(), peer = %session.peer(), "Session registered");
        self.sessions.write().insert(session.id(), session);
    }

    /// Cleans up after a disconnect: pools, wait lists and in-flight jobs.
    pub async fn unregister_session(&self, session: &Arc<Session>) {
        let id = session.id();
        self.sessions.write().remove(&id);

        for entry in self.all_functions() {
            entry.workers.remove_worker(id);
            entry.clients.remove_session(id);
        }
        session.clear_abilities();

        for handle in session.take_assigned() {
            self.abandon(&handle).await;
        }
        debug!(session = %id, "Session unregistered");
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Every connected session, oldest first.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    async fn abandon(&self, handle: &str) {
        match self.config.worker_disconnect_policy {
            WorkerDisconnectPolicy::Requeue => {
                let Ok(key) = self.key_for_handle(handle) else {
                    return;
                };
                let entry = self.entry(&key.function_name);
                let admission = entry.admission.lock().await;

                let job = {
                    let mut index = self.index.lock();
                    let Some(live) = index.by_handle_mut(handle) else {
                        return;
                    };
                    if live.job.state != JobState::Working {
                        return;
                    }
                    live.job.state = JobState::Queued;
                    live.job.numerator = 0;
                    live.job.denominator = 0;
                    live.worker = None;
                    live.job.clone()
                };
                entry.queue.reinstate(QueuedJob::from(&job)).await;
                drop(admission);
                entry.workers.wake_sleepers();
                warn!(job_handle = %handle, function = %job.function_name, "Requeued job from disconnected worker");
            }
            WorkerDisconnectPolicy::Fail => match self.finish(handle, Outcome::Fail).await {
                Ok(job) => {
                    warn!(job_handle = %handle, function = %job.function_name, "Failed job from disconnected worker");
                }
                Err(e) => debug!(job_handle = %handle, error = %e, "Nothing to fail on disconnect"),
            },
        }
    }

    // ============ Submission ============

    /// Admits a job, or joins an identical one already live.
    ///
    /// Foreground submissions register `client` as a waiter either way.
    /// Sleeping workers for the function are woken only on a fresh
    /// admission.
    pub async fn store_job_for_client(
        &self,
        mut job: Job,
        client: Option<&Arc<Session>>,
    ) -> JobResult<Job> {
        if job.unique_id.is_empty() {
            job.unique_id = self.unique_ids.next_id();
        }
        let entry = self.entry(&job.function_name);
        let key = job.key();

        let admission = entry.admission.lock().await;

        let existing = self.index.lock().jobs.get(&key).map(|live| live.job.clone());
        if let Some(existing) = existing {
            if !job.background {
                if let Some(client) = client {
                    entry.clients.register(&key.unique_id, client.clone());
                }
            }
            debug!(job_handle = %existing.handle, key = %key, "Joined existing job");
            return Ok(existing);
        }

        job.handle = self.handles.next_id();
        job.state = JobState::Queued;
        job.numerator = 0;
        job.denominator = 0;

        if !entry.queue.enqueue(&job).await? {
            return Err(JobError::Internal(format!(
                "{} is queued but has no live record",
                key
            )));
        }

        self.index.lock().insert(job.clone(), None);
        if !job.background {
            if let Some(client) = client {
                entry.clients.register(&key.unique_id, client.clone());
            }
        }
        drop(admission);

        entry.workers.wake_sleepers();
        self.publish(ClusterEvent::new(
            ClusterEventKind::SubmitJob,
            &job.function_name,
            &job.unique_id,
            Vec::new(),
        ));

        info!(
            job_handle = %job.handle,
            function = %job.function_name,
            priority = %job.priority,
            background = job.background,
            "Job submitted"
        );
        Ok(job)
    }

    // ============ Workers ============

    pub fn register_worker_ability(
        &self,
        session: &Arc<Session>,
        function_name: &str,
        timeout: Option<u32>,
    ) {
        session.add_ability(function_name, timeout);
        self.entry(function_name).workers.add_worker(session.clone());
    }

    pub fn unregister_worker_ability(&self, session: &Arc<Session>, function_name: &str) -> bool {
        let removed = session.remove_ability(function_name);
        if let Some(entry) = self.function(function_name) {
            entry.workers.remove_worker(session.id());
        }
        removed
    }

    pub fn reset_abilities(&self, session: &Arc<Session>) {
        for function_name in session.clear_abilities() {
            if let Some(entry) = self.function(&function_name) {
                entry.workers.remove_worker(session.id());
            }
        }
    }

    /// Hands the worker the first ready job among its abilities, in
    /// registration order, and marks it working.
    pub async fn next_job_for_worker(&self, session: &Arc<Session>) -> Option<Job> {
        for function_name in session.abilities() {
            let Some(entry) = self.function(&function_name) else {
                continue;
            };

            // Held until the job shows as working, so an identical
            // submission in between joins it instead of being admitted.
            let admission = entry.admission.lock().await;
            let Some(queued) = entry.queue.take_next().await else {
                continue;
            };
            let Some(resolved) = entry.queue.resolve(&queued).await else {
                self.drop_lost_job(&entry, &queued);
                continue;
            };

            let job = {
                let mut index = self.index.lock();
                match index.jobs.get_mut(&queued.key()) {
                    Some(live) => {
                        live.job.state = JobState::Working;
                        live.worker = Some(session.id());
                        live.job.clone()
                    }
                    None => {
                        let mut job = resolved;
                        job.state = JobState::Working;
                        index.insert(job.clone(), Some(session.id()));
                        job
                    }
                }
            };
            drop(admission);

            session.assign(&job.handle);
            debug!(
                job_handle = %job.handle,
                function = %function_name,
                session = %session.id(),
                "Job assigned"
            );
            return Some(job);
        }
        None
    }

    /// A popped entry whose record is gone from persistence cannot run.
    /// Its waiters are told it failed.
    fn drop_lost_job(&self, entry: &FunctionEntry, queued: &QueuedJob) {
        let removed = self.index.lock().remove(&queued.key());
        let Some(live) = removed else {
            return;
        };
        let waiters = entry.clients.release(&queued.unique_id);
        for waiter in &waiters {
            waiter.send(Packet::response(PacketBody::WorkFail {
                handle: live.job.handle.clone(),
            }));
        }
        warn!(
            job_handle = %live.job.handle,
            function = %queued.function_name,
            waiters = waiters.len(),
            "Dropped job lost from persistence"
        );
    }

    /// Puts the worker to sleep on all of its functions. If one of them
    /// already has ready work the worker is woken straight away.
    pub async fn sleeping_worker(&self, session: &Arc<Session>) {
        session.sleep_until(Instant::now() + self.config.long_poll_interval());

        let mut ready = false;
        for function_name in session.abilities() {
            let entry = self.entry(&function_name);
            entry.workers.mark_sleeping(session.clone());
            if !ready && entry.queue.has_ready_jobs().await {
                ready = true;
            }
        }

        if ready {
            self.wake_worker(session);
        }
    }

    /// Wakes one worker and drops it from every sleep set.
    pub fn wake_worker(&self, session: &Arc<Session>) -> bool {
        for function_name in session.abilities() {
            if let Some(entry) = self.function(&function_name) {
                entry.workers.remove_sleeper(session.id());
            }
        }
        session.wake()
    }

    // ============ Results ============

    pub async fn handle_work_completion(&self, handle: &str, data: Bytes) -> JobResult<Job> {
        self.finish(handle, Outcome::Complete(data)).await
    }

    pub async fn handle_work_failure(&self, handle: &str) -> JobResult<Job> {
        self.finish(handle, Outcome::Fail).await
    }

    /// Waiters that asked for exceptions get WORK_EXCEPTION, the rest
    /// WORK_FAIL.
    pub async fn handle_work_exception(&self, handle: &str, data: Bytes) -> JobResult<Job> {
        self.finish(handle, Outcome::Exception(data)).await
    }

    fn key_for_handle(&self, handle: &str) -> JobResult<JobKey> {
        self.index
            .lock()
            .handles
            .get(handle)
            .cloned()
            .ok_or_else(|| JobError::JobNotFound(handle.to_string()))
    }

    async fn finish(&self, handle: &str, outcome: Outcome) -> JobResult<Job> {
        let entry = self.entry(&self.key_for_handle(handle)?.function_name);
        // A resubmission of the same key is admitted only once the finished
        // record is gone from persistence.
        let admission = entry.admission.lock().await;

        let mut live = {
            let mut index = self.index.lock();
            let job = &index
                .by_handle(handle)
                .ok_or_else(|| JobError::JobNotFound(handle.to_string()))?
                .job;
            ensure_state(job, JobState::Working)?;
            let key = job.key();
            index
                .remove(&key)
                .ok_or_else(|| JobError::JobNotFound(handle.to_string()))?
        };
        live.job.state = outcome.state();

        if let Some(worker) = live.worker.and_then(|id| self.session(id)) {
            worker.release(handle);
        }

        let waiters = entry.clients.release(&live.job.unique_id);
        for waiter in &waiters {
            waiter.send(outcome.packet_for(handle, waiter));
        }

        if let Err(e) = self.engine.delete(&live.job).await {
            warn!(job_handle = %handle, error = %e, "Failed to delete finished job from persistence");
        }
        drop(admission);

        if let Outcome::Complete(data) = &outcome {
            self.publish(ClusterEvent::new(
                ClusterEventKind::WorkComplete,
                &live.job.function_name,
                &live.job.unique_id,
                data.to_vec(),
            ));
        }

        info!(
            job_handle = %handle,
            function = %live.job.function_name,
            state = %live.job.state,
            waiters = waiters.len(),
            "Job finished"
        );
        Ok(live.job)
    }

    /// Records progress and forwards it to waiters.
    pub fn handle_work_status(&self, handle: &str, numerator: u32, denominator: u32) -> JobResult<()> {
        let key = {
            let mut index = self.index.lock();
            let live = index
                .by_handle_mut(handle)
                .ok_or_else(|| JobError::JobNotFound(handle.to_string()))?;
            ensure_state(&live.job, JobState::Working)?;
            live.job.numerator = numerator;
            live.job.denominator = denominator;
            live.job.key()
        };
        self.notify_waiters(
            &key,
            &Packet::response(PacketBody::WorkStatus {
                handle: handle.to_string(),
                numerator,
                denominator,
            }),
        );
        Ok(())
    }

    pub fn handle_work_data(&self, handle: &str, data: Bytes) -> JobResult<()> {
        let key = self.working_key(handle)?;
        self.publish(ClusterEvent::new(
            ClusterEventKind::WorkData,
            &key.function_name,
            &key.unique_id,
            data.to_vec(),
        ));
        self.notify_waiters(
            &key,
            &Packet::response(PacketBody::WorkData {
                handle: handle.to_string(),
                data,
            }),
        );
        Ok(())
    }

    pub fn handle_work_warning(&self, handle: &str, data: Bytes) -> JobResult<()> {
        let key = self.working_key(handle)?;
        self.notify_waiters(
            &key,
            &Packet::response(PacketBody::WorkWarning {
                handle: handle.to_string(),
                data,
            }),
        );
        Ok(())
    }

    fn working_key(&self, handle: &str) -> JobResult<JobKey> {
        let index = self.index.lock();
        let live = index
            .by_handle(handle)
            .ok_or_else(|| JobError::JobNotFound(handle.to_string()))?;
        ensure_state(&live.job, JobState::Working)?;
        Ok(live.job.key())
    }

    fn notify_waiters(&self, key: &JobKey, packet: &Packet) -> usize {
        let Some(entry) = self.function(&key.function_name) else {
            return 0;
        };
        let waiters = entry.clients.waiters(&key.unique_id);
        for waiter in &waiters {
            waiter.send(packet.clone());
        }
        waiters.len()
    }

    // ============ Status ============

    pub fn get_status(&self, handle: &str) -> JobStatus {
        self.index
            .lock()
            .by_handle(handle)
            .map_or_else(|| JobStatus::unknown(handle), |live| live.job.status())
    }

    /// Status of the first live job with this unique id, plus how many
    /// clients wait on it.
    pub fn get_status_unique(&self, unique_id: &str) -> (JobStatus, usize) {
        let found = self
            .index
            .lock()
            .jobs
            .values()
            .find(|live| live.job.unique_id == unique_id)
            .map(|live| live.job.clone());

        match found {
            Some(job) => {
                let waiting = self
                    .function(&job.function_name)
                    .map_or(0, |entry| entry.clients.waiting_count(unique_id));
                (job.status(), waiting)
            }
            None => (JobStatus::unknown(String::new()), 0),
        }
    }

    fn live_job(&self, key: &JobKey) -> Option<Job> {
        self.index.lock().jobs.get(key).map(|live| live.job.clone())
    }

    pub fn find_job(&self, handle: &str) -> Option<Job> {
        self.index.lock().by_handle(handle).map(|live| live.job.clone())
    }

    /// Number of live jobs, queued or working.
    pub fn live_job_count(&self) -> usize {
        self.index.lock().jobs.len()
    }

    // ============ Administration ============

    /// Removes a queued job. Returns false if a worker took it first.
    pub async fn remove_job(&self, handle: &str) -> JobResult<bool> {
        let job = self
            .find_job(handle)
            .ok_or_else(|| JobError::JobNotFound(handle.to_string()))?;
        ensure_state(&job, JobState::Queued)?;

        let entry = self.entry(&job.function_name);
        let admission = entry.admission.lock().await;
        if !entry.queue.remove(&job).await {
            return Ok(false);
        }
        self.index.lock().remove(&job.key());
        let waiters = entry.clients.release(&job.unique_id);
        drop(admission);

        for waiter in &waiters {
            waiter.send(Packet::response(PacketBody::WorkFail {
                handle: handle.to_string(),
            }));
        }
        info!(job_handle = %handle, function = %job.function_name, "Job removed");
        Ok(true)
    }

    /// Sets a function's queue capacity; 0 means unlimited.
    pub fn set_max_queue(&self, function_name: &str, max_size: usize) {
        self.entry(function_name).queue.set_max_size(max_size);
        info!(function = %function_name, max_size, "Queue capacity changed");
    }

    /// Counters for every known function, sorted by name.
    pub fn function_stats(&self) -> Vec<FunctionStats> {
        let mut running: HashMap<String, usize> = HashMap::new();
        for live in self.index.lock().jobs.values() {
            if live.job.state == JobState::Working {
                *running.entry(live.job.function_name.clone()).or_insert(0) += 1;
            }
        }

        let mut entries: Vec<(String, Arc<FunctionEntry>)> = self
            .functions
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        entries
            .into_iter()
            .map(|(name, entry)| FunctionStats {
                queued: entry.queue.size(),
                high: entry.queue.size_of(Priority::High),
                normal: entry.queue.size_of(Priority::Normal),
                low: entry.queue.size_of(Priority::Low),
                running: running.get(&name).copied().unwrap_or(0),
                workers: entry.workers.worker_count(),
                sleeping: entry.workers.sleeper_count(),
                max_queue: entry.queue.max_size(),
                function_name: name,
            })
            .collect()
    }

    /// Reinstates every persisted job into its queue. Handles issued by the
    /// previous run are kept and never reissued.
    pub async fn load_persisted_jobs(&self) -> JobResult<usize> {
        let queued = self.engine.read_all().await?;

        let mut jobs = Vec::with_capacity(queued.len());
        for summary in queued {
            match self
                .engine
                .find_job(&summary.function_name, &summary.unique_id)
                .await
            {
                Ok(Some(job)) => {
                    self.handles.observe(&job.handle);
                    jobs.push(job);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    function = %summary.function_name,
                    unique_id = %summary.unique_id,
                    error = %e,
                    "Skipping unreadable persisted job"
                ),
            }
        }

        let mut restored = 0;
        for mut job in jobs {
            if job.handle.is_empty() {
                job.handle = self.handles.next_id();
            }
            job.state = JobState::Queued;
            job.numerator = 0;
            job.denominator = 0;

            let entry = self.entry(&job.function_name);
            if entry.queue.reinstate(QueuedJob::from(&job)).await {
                self.index.lock().insert(job, None);
                restored += 1;
            }
        }

        info!(restored, engine = self.engine.name(), "Rehydrated persisted jobs");
        Ok(restored)
    }

    // ============ Cluster ============

    fn publish(&self, event: ClusterEvent) {
        if let Some(outbound) = &self.cluster {
            if outbound.send(event).is_err() {
                debug!("Cluster channel closed, event dropped");
            }
        }
    }

    /// Applies an event published by a peer broker.
    pub async fn handle_cluster_event(&self, event: ClusterEvent) {
        debug!(kind = %event.kind, function = %event.function_name, unique_id = %event.unique_id, "Cluster event");
        let Some(entry) = self.function(&event.function_name) else {
            return;
        };
        let key = JobKey::new(&event.function_name, &event.unique_id);

        match event.kind {
            ClusterEventKind::SubmitJob => {
                entry.workers.wake_sleepers();
            }
            ClusterEventKind::WorkData => {
                let found = self.live_job(&key);
                let Some(job) = found else {
                    return;
                };
                let packet = Packet::response(PacketBody::WorkData {
                    handle: job.handle,
                    data: Bytes::from(event.data),
                });
                for waiter in entry.clients.waiters(&event.unique_id) {
                    waiter.send(packet.clone());
                }
            }
            ClusterEventKind::WorkComplete => {
                let admission = entry.admission.lock().await;
                let found = self.live_job(&key);
                let Some(job) = found else {
                    return;
                };
                if job.state == JobState::Working {
                    // Running here too; the local worker reports.
                    return;
                }
                if entry.queue.remove(&job).await {
                    self.index.lock().remove(&key);
                }
                let waiters = entry.clients.release(&event.unique_id);
                drop(admission);

                let packet = Packet::response(PacketBody::WorkComplete {
                    handle: job.handle,
                    data: Bytes::from(event.data),
                });
                for waiter in &waiters {
                    waiter.send(packet.clone());
                }
            }
        }
    }

    /// Consumes peer events until the channel closes.
    pub async fn run_cluster_listener(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<ClusterEvent>,
    ) {
        info!("Cluster listener started");
        while let Some(event) = inbound.recv().await {
            self.handle_cluster_event(event).await;
        }
        info!("Cluster listener stopped");
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("engine", &self.engine.name())
            .field("functions", &self.functions.read().len())
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::MemoryPersistenceEngine;
    use async_trait::async_trait;
    use foreman_protocol::PacketType;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000;

    struct Harness {
        manager: Arc<JobManager>,
        engine: Arc<MemoryPersistenceEngine>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let engine = Arc::new(MemoryPersistenceEngine::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let manager = JobManager::new(config, engine.clone()).with_clock(clock.clone());
        Harness {
            manager: Arc::new(manager),
            engine,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default())
    }

    fn connect(manager: &JobManager) -> (Arc<Session>, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new("127.0.0.1:1", tx));
        manager.register_session(session.clone());
        (session, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            out.push(packet);
        }
        out
    }

    #[tokio::test]
    async fn test_handles_are_assigned_in_order() {
        let h = harness();
        let a = h
            .manager
            .store_job_for_client(Job::new("f", "a", Vec::new()), None)
            .await
            .unwrap();
        let b = h
            .manager
            .store_job_for_client(Job::new("f", "b", Vec::new()), None)
            .await
            .unwrap();
        assert_eq!(a.handle, "H:localhost:1");
        assert_eq!(b.handle, "H:localhost:2");
        assert_eq!(h.engine.len(), 2);
    }

    #[tokio::test]
    async fn test_fan_out_to_identical_submissions() {
        let h = harness();
        let (c1, mut r1) = connect(&h.manager);
        let (c2, mut r2) = connect(&h.manager);
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "reverse", None);

        let j1 = h
            .manager
            .store_job_for_client(Job::new("reverse", "same", b"abc".to_vec()), Some(&c1))
            .await
            .unwrap();
        let j2 = h
            .manager
            .store_job_for_client(Job::new("reverse", "same", b"abc".to_vec()), Some(&c2))
            .await
            .unwrap();
        assert_eq!(j1.handle, j2.handle);
        assert_eq!(h.manager.function("reverse").unwrap().queue.size(), 1);

        let assigned = h.manager.next_job_for_worker(&worker).await.unwrap();
        assert_eq!(assigned.handle, j1.handle);
        assert!(h.manager.next_job_for_worker(&worker).await.is_none());

        // Submitting again while working still joins the same execution.
        let (c3, mut r3) = connect(&h.manager);
        let j3 = h
            .manager
            .store_job_for_client(Job::new("reverse", "same", Vec::new()), Some(&c3))
            .await
            .unwrap();
        assert_eq!(j3.handle, j1.handle);
        assert_eq!(j3.state, JobState::Working);

        h.manager
            .handle_work_completion(&j1.handle, Bytes::from_static(b"cba"))
            .await
            .unwrap();

        for rx in [&mut r1, &mut r2, &mut r3] {
            let packets = drain(rx);
            assert_eq!(packets.len(), 1);
            match &packets[0].body {
                PacketBody::WorkComplete { handle, data } => {
                    assert_eq!(handle, &j1.handle);
                    assert_eq!(&data[..], b"cba");
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(h.manager.live_job_count(), 0);
        assert!(h.engine.is_empty());
        assert_eq!(worker.assigned_count(), 0);
    }

    #[tokio::test]
    async fn test_background_job_has_no_waiters() {
        let h = harness();
        let (client, mut rx) = connect(&h.manager);
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "f", None);

        let job = h
            .manager
            .store_job_for_client(Job::new("f", "bg", Vec::new()).with_background(true), Some(&client))
            .await
            .unwrap();
        assert_eq!(h.manager.function("f").unwrap().clients.waiting_count("bg"), 0);

        h.manager.next_job_for_worker(&worker).await.unwrap();
        h.manager
            .handle_work_completion(&job.handle, Bytes::new())
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_empty_unique_id_is_generated() {
        let h = harness();
        let a = h
            .manager
            .store_job_for_client(Job::new("f", "", Vec::new()), None)
            .await
            .unwrap();
        let b = h
            .manager
            .store_job_for_client(Job::new("f", "", Vec::new()), None)
            .await
            .unwrap();
        assert!(!a.unique_id.is_empty());
        assert_ne!(a.unique_id, b.unique_id);
        assert_ne!(a.handle, b.handle);
    }

    #[tokio::test]
    async fn test_matching_follows_ability_order() {
        let h = harness();
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "second", None);
        h.manager.register_worker_ability(&worker, "first", None);

        h.manager
            .store_job_for_client(Job::new("first", "f1", Vec::new()), None)
            .await
            .unwrap();
        h.manager
            .store_job_for_client(Job::new("second", "s1", Vec::new()), None)
            .await
            .unwrap();

        assert_eq!(h.manager.next_job_for_worker(&worker).await.unwrap().unique_id, "s1");
        assert_eq!(h.manager.next_job_for_worker(&worker).await.unwrap().unique_id, "f1");
        assert!(h.manager.next_job_for_worker(&worker).await.is_none());
    }

    #[tokio::test]
    async fn test_worker_without_ability_gets_nothing() {
        let h = harness();
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "f", None);
        h.manager
            .store_job_for_client(Job::new("f", "1", Vec::new()), None)
            .await
            .unwrap();

        h.manager.unregister_worker_ability(&worker, "f");
        assert!(h.manager.next_job_for_worker(&worker).await.is_none());

        h.manager.register_worker_ability(&worker, "f", Some(10));
        h.manager.reset_abilities(&worker);
        assert!(h.manager.next_job_for_worker(&worker).await.is_none());
        assert_eq!(h.manager.function("f").unwrap().workers.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_wakes_sleeping_worker() {
        let h = harness();
        let (worker, mut wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "f", None);

        h.manager.sleeping_worker(&worker).await;
        assert!(worker.is_sleeping());
        assert!(drain(&mut wr).is_empty());

        h.manager
            .store_job_for_client(Job::new("f", "1", Vec::new()), None)
            .await
            .unwrap();
        let packets = drain(&mut wr);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type(), PacketType::Noop);
        assert!(!worker.is_sleeping());

        // Duplicate submission wakes nobody.
        h.manager.sleeping_worker(&worker).await;
        drain(&mut wr);
        h.manager.next_job_for_worker(&worker).await;
        h.manager.sleeping_worker(&worker).await;
        h.manager
            .store_job_for_client(Job::new("f", "1", Vec::new()), None)
            .await
            .unwrap();
        assert!(drain(&mut wr).is_empty());
    }

    #[tokio::test]
    async fn test_sleep_with_ready_work_wakes_immediately() {
        let h = harness();
        let (worker, mut wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "f", None);
        h.manager
            .store_job_for_client(Job::new("f", "1", Vec::new()), None)
            .await
            .unwrap();

        h.manager.sleeping_worker(&worker).await;
        assert!(!worker.is_sleeping());
        assert_eq!(drain(&mut wr)[0].packet_type(), PacketType::Noop);
        assert_eq!(h.manager.function("f").unwrap().workers.sleeper_count(), 0);
    }

    #[tokio::test]
    async fn test_sleep_deadline_is_long_poll_interval() {
        let h = harness();
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "f", None);

        let before = Instant::now();
        h.manager.sleeping_worker(&worker).await;
        let deadline = worker.sleep_deadline().unwrap();
        assert!(deadline >= before + Duration::from_secs(30));
        assert!(deadline <= Instant::now() + Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_epoch_job_waits_for_clock() {
        let h = harness();
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "f", None);
        h.manager
            .store_job_for_client(Job::new("f", "later", Vec::new()).run_at(NOW + 40), None)
            .await
            .unwrap();

        assert!(h.manager.next_job_for_worker(&worker).await.is_none());
        h.clock.advance(40);
        assert_eq!(
            h.manager.next_job_for_worker(&worker).await.unwrap().unique_id,
            "later"
        );
    }

    #[tokio::test]
    async fn test_status_and_progress() {
        let h = harness();
        let (client, mut rx) = connect(&h.manager);
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "f", None);
        let job = h
            .manager
            .store_job_for_client(Job::new("f", "u", Vec::new()), Some(&client))
            .await
            .unwrap();

        // Progress on a queued job is rejected.
        let err = h.manager.handle_work_status(&job.handle, 1, 2).unwrap_err();
        assert!(matches!(err, JobError::IllegalStateTransition { .. }));

        let status = h.manager.get_status(&job.handle);
        assert!(status.is_known());
        assert!(!status.running());

        h.manager.next_job_for_worker(&worker).await.unwrap();
        h.manager.handle_work_status(&job.handle, 1, 2).unwrap();
        h.manager
            .handle_work_data(&job.handle, Bytes::from_static(b"partial"))
            .unwrap();
        h.manager
            .handle_work_warning(&job.handle, Bytes::from_static(b"careful"))
            .unwrap();

        let status = h.manager.get_status(&job.handle);
        assert!(status.running());
        assert_eq!((status.numerator, status.denominator), (1, 2));

        let (unique_status, waiting) = h.manager.get_status_unique("u");
        assert!(unique_status.running());
        assert_eq!(waiting, 1);

        let types: Vec<PacketType> = drain(&mut rx).iter().map(Packet::packet_type).collect();
        assert_eq!(
            types,
            vec![PacketType::WorkStatus, PacketType::WorkData, PacketType::WorkWarning]
        );

        assert!(!h.manager.get_status("H:localhost:999").is_known());
        assert!(matches!(
            h.manager.handle_work_status("H:localhost:999", 1, 1),
            Err(JobError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_completion_requires_working() {
        let h = harness();
        let job = h
            .manager
            .store_job_for_client(Job::new("f", "u", Vec::new()), None)
            .await
            .unwrap();

        let err = h
            .manager
            .handle_work_completion(&job.handle, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::IllegalStateTransition { .. }));
        assert_eq!(h.manager.get_status(&job.handle).state, Some(JobState::Queued));

        assert!(matches!(
            h.manager.handle_work_failure("H:nope:1").await,
            Err(JobError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exception_respects_client_option() {
        let h = harness();
        let (plain, mut plain_rx) = connect(&h.manager);
        let (wants, mut wants_rx) = connect(&h.manager);
        wants.set_exceptions(true);
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "f", None);

        let job = h
            .manager
            .store_job_for_client(Job::new("f", "u", Vec::new()), Some(&plain))
            .await
            .unwrap();
        h.manager
            .store_job_for_client(Job::new("f", "u", Vec::new()), Some(&wants))
            .await
            .unwrap();
        h.manager.next_job_for_worker(&worker).await.unwrap();

        let finished = h
            .manager
            .handle_work_exception(&job.handle, Bytes::from_static(b"boom"))
            .await
            .unwrap();
        assert_eq!(finished.state, JobState::Failed);

        assert_eq!(drain(&mut plain_rx)[0].packet_type(), PacketType::WorkFail);
        assert_eq!(drain(&mut wants_rx)[0].packet_type(), PacketType::WorkException);
    }

    #[tokio::test]
    async fn test_disconnect_requeues_in_flight_job() {
        let h = harness();
        let (client, mut rx) = connect(&h.manager);
        let (w1, _r1) = connect(&h.manager);
        let (w2, _r2) = connect(&h.manager);
        h.manager.register_worker_ability(&w1, "f", None);
        h.manager.register_worker_ability(&w2, "f", None);

        let job = h
            .manager
            .store_job_for_client(Job::new("f", "u", b"x".to_vec()), Some(&client))
            .await
            .unwrap();
        h.manager.next_job_for_worker(&w1).await.unwrap();
        h.manager.unregister_session(&w1).await;

        let status = h.manager.get_status(&job.handle);
        assert_eq!(status.state, Some(JobState::Queued));
        assert_eq!(h.manager.function("f").unwrap().workers.worker_count(), 1);

        let again = h.manager.next_job_for_worker(&w2).await.unwrap();
        assert_eq!(again.handle, job.handle);
        h.manager
            .handle_work_completion(&job.handle, Bytes::from_static(b"done"))
            .await
            .unwrap();
        assert_eq!(drain(&mut rx)[0].packet_type(), PacketType::WorkComplete);
    }

    #[tokio::test]
    async fn test_disconnect_fail_policy() {
        let config = EngineConfig {
            worker_disconnect_policy: WorkerDisconnectPolicy::Fail,
            ..EngineConfig::default()
        };
        let h = harness_with(config);
        let (client, mut rx) = connect(&h.manager);
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "f", None);

        let job = h
            .manager
            .store_job_for_client(Job::new("f", "u", Vec::new()), Some(&client))
            .await
            .unwrap();
        h.manager.next_job_for_worker(&worker).await.unwrap();
        h.manager.unregister_session(&worker).await;

        assert_eq!(drain(&mut rx)[0].packet_type(), PacketType::WorkFail);
        assert!(!h.manager.get_status(&job.handle).is_known());
        assert!(h.engine.is_empty());
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_waiter() {
        let h = harness();
        let (client, _rx) = connect(&h.manager);
        h.manager
            .store_job_for_client(Job::new("f", "u", Vec::new()), Some(&client))
            .await
            .unwrap();
        assert_eq!(h.manager.get_status_unique("u").1, 1);

        h.manager.unregister_session(&client).await;
        assert_eq!(h.manager.get_status_unique("u").1, 0);
        assert!(h.manager.sessions().is_empty());
        // The job itself survives its submitter.
        assert!(h.manager.get_status_unique("u").0.is_known());
    }

    #[tokio::test]
    async fn test_remove_job() {
        let h = harness();
        let (client, mut rx) = connect(&h.manager);
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "f", None);

        let queued = h
            .manager
            .store_job_for_client(Job::new("f", "a", Vec::new()), Some(&client))
            .await
            .unwrap();
        let working = h
            .manager
            .store_job_for_client(Job::new("f", "b", Vec::new()), None)
            .await
            .unwrap();

        assert!(h.manager.remove_job(&queued.handle).await.unwrap());
        assert_eq!(drain(&mut rx)[0].packet_type(), PacketType::WorkFail);
        assert!(matches!(
            h.manager.remove_job(&queued.handle).await,
            Err(JobError::JobNotFound(_))
        ));

        h.manager.next_job_for_worker(&worker).await.unwrap();
        assert!(matches!(
            h.manager.remove_job(&working.handle).await,
            Err(JobError::IllegalStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_queue_full_surfaces_to_submitter() {
        let h = harness();
        h.manager.set_max_queue("f", 1);
        h.manager
            .store_job_for_client(Job::new("f", "1", Vec::new()), None)
            .await
            .unwrap();
        let err = h
            .manager
            .store_job_for_client(Job::new("f", "2", Vec::new()), None)
            .await
            .unwrap_err();
        assert!(err.is_admission_error());
        assert_eq!(h.manager.live_job_count(), 1);
    }

    /// Engine that refuses every write.
    struct ReadOnlyEngine;

    #[async_trait]
    impl PersistenceEngine for ReadOnlyEngine {
        fn name(&self) -> &'static str {
            "read-only"
        }
        async fn write(&self, _job: &Job) -> JobResult<bool> {
            Err(JobError::Persistence("read-only".into()))
        }
        async fn delete_by_id(&self, _f: &str, _u: &str) -> JobResult<()> {
            Ok(())
        }
        async fn delete_all(&self) -> JobResult<()> {
            Ok(())
        }
        async fn find_job(&self, _f: &str, _u: &str) -> JobResult<Option<Job>> {
            Ok(None)
        }
        async fn read_all(&self) -> JobResult<Vec<QueuedJob>> {
            Ok(Vec::new())
        }
        async fn get_all_for_function(&self, _f: &str) -> JobResult<Vec<QueuedJob>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_enqueue_failure_mutates_nothing() {
        let manager = JobManager::new(EngineConfig::default(), Arc::new(ReadOnlyEngine));
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = Arc::new(Session::new("peer", tx));

        let err = manager
            .store_job_for_client(Job::new("f", "u", Vec::new()), Some(&client))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Enqueue { .. }));
        assert_eq!(manager.live_job_count(), 0);
        assert_eq!(manager.function("f").unwrap().clients.waiting_count("u"), 0);
        assert!(manager.function("f").unwrap().queue.is_empty());
    }

    #[tokio::test]
    async fn test_load_persisted_jobs() {
        let h = harness();
        let mut old = Job::new("f", "persisted", b"data".to_vec());
        old.handle = "H:localhost:41".to_string();
        h.engine.write(&old).await.unwrap();

        assert_eq!(h.manager.load_persisted_jobs().await.unwrap(), 1);
        assert_eq!(h.manager.function("f").unwrap().queue.size(), 1);
        assert!(h.manager.get_status("H:localhost:41").is_known());

        let fresh = h
            .manager
            .store_job_for_client(Job::new("f", "new", Vec::new()), None)
            .await
            .unwrap();
        assert_eq!(fresh.handle, "H:localhost:42");

        // Resubmitting a rehydrated job joins it.
        let joined = h
            .manager
            .store_job_for_client(Job::new("f", "persisted", Vec::new()), None)
            .await
            .unwrap();
        assert_eq!(joined.handle, "H:localhost:41");
    }

    #[tokio::test]
    async fn test_function_stats() {
        let h = harness();
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "b", None);
        h.manager
            .store_job_for_client(Job::new("b", "1", Vec::new()).with_priority(Priority::High), None)
            .await
            .unwrap();
        h.manager
            .store_job_for_client(Job::new("b", "2", Vec::new()), None)
            .await
            .unwrap();
        h.manager
            .store_job_for_client(Job::new("a", "1", Vec::new()).with_priority(Priority::Low), None)
            .await
            .unwrap();
        h.manager.next_job_for_worker(&worker).await.unwrap();

        let stats = h.manager.function_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].function_name, "a");
        assert_eq!(stats[0].low, 1);
        assert_eq!(stats[1].function_name, "b");
        assert_eq!(stats[1].queued, 1);
        assert_eq!(stats[1].normal, 1);
        assert_eq!(stats[1].running, 1);
        assert_eq!(stats[1].workers, 1);
    }

    #[tokio::test]
    async fn test_cluster_publish_and_apply() {
        let (tx, mut published) = mpsc::unbounded_channel();
        let engine = Arc::new(MemoryPersistenceEngine::new());
        let manager = Arc::new(JobManager::new(EngineConfig::default(), engine).with_cluster(tx));
        let (client, mut rx) = connect(&manager);
        let (worker, mut wr) = connect(&manager);
        manager.register_worker_ability(&worker, "f", None);

        let job = manager
            .store_job_for_client(Job::new("f", "u", Vec::new()), Some(&client))
            .await
            .unwrap();
        let event = published.try_recv().unwrap();
        assert_eq!(event.kind, ClusterEventKind::SubmitJob);
        assert_eq!(event.unique_id, "u");

        // A peer announces work for this function: sleepers wake.
        manager.sleeping_worker(&worker).await;
        drain(&mut wr);
        worker.sleep_until(Instant::now() + Duration::from_secs(30));
        manager.function("f").unwrap().workers.mark_sleeping(worker.clone());
        manager
            .handle_cluster_event(ClusterEvent::new(ClusterEventKind::SubmitJob, "f", "other", Vec::new()))
            .await;
        assert_eq!(drain(&mut wr)[0].packet_type(), PacketType::Noop);

        // A peer finished the job: local waiters get the result, the local
        // copy is dropped.
        manager
            .handle_cluster_event(ClusterEvent::new(
                ClusterEventKind::WorkComplete,
                "f",
                "u",
                b"remote".to_vec(),
            ))
            .await;
        let packets = drain(&mut rx);
        match &packets[0].body {
            PacketBody::WorkComplete { handle, data } => {
                assert_eq!(handle, &job.handle);
                assert_eq!(&data[..], b"remote");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(manager.live_job_count(), 0);
        assert!(manager.next_job_for_worker(&worker).await.is_none());
    }

    #[tokio::test]
    async fn test_cluster_listener_drains_channel() {
        let h = harness();
        let (client, mut rx) = connect(&h.manager);
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "f", None);
        h.manager
            .store_job_for_client(Job::new("f", "u", Vec::new()), Some(&client))
            .await
            .unwrap();

        let (tx, inbound) = mpsc::unbounded_channel();
        let listener = tokio::spawn(h.manager.clone().run_cluster_listener(inbound));
        tx.send(ClusterEvent::new(ClusterEventKind::WorkData, "f", "u", b"chunk".to_vec()))
            .unwrap();
        drop(tx);
        listener.await.unwrap();

        assert_eq!(drain(&mut rx)[0].packet_type(), PacketType::WorkData);
    }

    #[tokio::test]
    async fn test_job_lost_from_persistence_fails_its_waiters() {
        let h = harness();
        let (client, mut rx) = connect(&h.manager);
        let (worker, _wr) = connect(&h.manager);
        h.manager.register_worker_ability(&worker, "f", None);
        let job = h
            .manager
            .store_job_for_client(Job::new("f", "u", Vec::new()), Some(&client))
            .await
            .unwrap();
        h.engine.delete_by_id("f", "u").await.unwrap();

        assert!(h.manager.next_job_for_worker(&worker).await.is_none());
        assert_eq!(
            drain(&mut rx)[0].body,
            PacketBody::WorkFail {
                handle: job.handle.clone()
            }
        );
        assert_eq!(h.manager.live_job_count(), 0);

        let again = h
            .manager
            .store_job_for_client(Job::new("f", "u", Vec::new()), None)
            .await
            .unwrap();
        assert_ne!(again.handle, job.handle);
        assert_eq!(
            h.manager.next_job_for_worker(&worker).await.unwrap().handle,
            again.handle
        );
    }

    /// Memory engine with slow reads and deletes.
    struct SlowEngine {
        inner: MemoryPersistenceEngine,
        read_delay: Duration,
        delete_delay: Duration,
    }

    impl SlowEngine {
        fn new(read_delay: Duration, delete_delay: Duration) -> Self {
            Self {
                inner: MemoryPersistenceEngine::new(),
                read_delay,
                delete_delay,
            }
        }
    }

    #[async_trait]
    impl PersistenceEngine for SlowEngine {
        fn name(&self) -> &'static str {
            "slow"
        }
        async fn write(&self, job: &Job) -> JobResult<bool> {
            self.inner.write(job).await
        }
        async fn delete_by_id(&self, f: &str, u: &str) -> JobResult<()> {
            tokio::time::sleep(self.delete_delay).await;
            self.inner.delete_by_id(f, u).await
        }
        async fn delete_all(&self) -> JobResult<()> {
            self.inner.delete_all().await
        }
        async fn find_job(&self, f: &str, u: &str) -> JobResult<Option<Job>> {
            tokio::time::sleep(self.read_delay).await;
            self.inner.find_job(f, u).await
        }
        async fn read_all(&self) -> JobResult<Vec<QueuedJob>> {
            self.inner.read_all().await
        }
        async fn get_all_for_function(&self, f: &str) -> JobResult<Vec<QueuedJob>> {
            self.inner.get_all_for_function(f).await
        }
    }

    #[tokio::test]
    async fn test_resubmission_during_grab_joins_grabbed_job() {
        let engine = Arc::new(SlowEngine::new(Duration::from_millis(50), Duration::ZERO));
        let manager = Arc::new(JobManager::new(EngineConfig::default(), engine));
        let (w1, _r1) = connect(&manager);
        let (w2, _r2) = connect(&manager);
        manager.register_worker_ability(&w1, "f", None);
        manager.register_worker_ability(&w2, "f", None);

        let first = manager
            .store_job_for_client(Job::new("f", "same", Vec::new()), None)
            .await
            .unwrap();

        let grab = {
            let manager = manager.clone();
            let w1 = w1.clone();
            tokio::spawn(async move { manager.next_job_for_worker(&w1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = manager
            .store_job_for_client(Job::new("f", "same", Vec::new()), None)
            .await
            .unwrap();
        let w1_got = grab.await.unwrap();
        let w2_got = manager.next_job_for_worker(&w2).await;

        assert_eq!(second.handle, first.handle);
        assert_eq!(second.state, JobState::Working);
        assert_eq!(w1_got.map(|job| job.handle), Some(first.handle.clone()));
        assert!(w2_got.is_none());
        assert_eq!(manager.live_job_count(), 1);
        assert!(manager.function("f").unwrap().queue.is_empty());
    }

    #[tokio::test]
    async fn test_resubmission_during_completion_is_not_lost() {
        let engine = Arc::new(SlowEngine::new(Duration::ZERO, Duration::from_millis(50)));
        let manager = Arc::new(JobManager::new(EngineConfig::default(), engine.clone()));
        let (client, mut rx) = connect(&manager);
        let (worker, _wr) = connect(&manager);
        manager.register_worker_ability(&worker, "f", None);

        let first = manager
            .store_job_for_client(Job::new("f", "same", b"one".to_vec()), None)
            .await
            .unwrap();
        manager.next_job_for_worker(&worker).await.unwrap();

        let completion = {
            let manager = manager.clone();
            let handle = first.handle.clone();
            tokio::spawn(async move {
                manager
                    .handle_work_completion(&handle, Bytes::from_static(b"done"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = manager
            .store_job_for_client(Job::new("f", "same", b"two".to_vec()), Some(&client))
            .await
            .unwrap();
        completion.await.unwrap().unwrap();

        assert_ne!(second.handle, first.handle);
        assert!(engine.inner.find_job("f", "same").await.unwrap().is_some());

        let grabbed = manager.next_job_for_worker(&worker).await.unwrap();
        assert_eq!(grabbed.handle, second.handle);
        assert_eq!(grabbed.data, b"two".to_vec());

        manager
            .handle_work_completion(&second.handle, Bytes::from_static(b"again"))
            .await
            .unwrap();
        let packets = drain(&mut rx);
        assert_eq!(packets.len(), 1);
        assert_eq!(
            packets[0].body,
            PacketBody::WorkComplete {
                handle: second.handle,
                data: Bytes::from_static(b"again"),
            }
        );
    }
}
