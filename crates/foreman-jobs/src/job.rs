//! Job records and status snapshots.

use crate::error::JobResult;
use foreman_protocol::Priority;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a job: unique per function, not globally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub function_name: String,
    pub unique_id: String,
}

impl JobKey {
    pub fn new(function_name: impl Into<String>, unique_id: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            unique_id: unique_id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.function_name, self.unique_id)
    }
}

/// Lifecycle state: `Queued -> Working -> {Complete, Failed}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Queued,
    Working,
    Complete,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Working => write!(f, "working"),
            JobState::Complete => write!(f, "complete"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// A submitted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub function_name: String,
    pub unique_id: String,
    /// Assigned once by the broker, empty until then.
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub background: bool,
    /// Epoch seconds before which the job is not ready; -1 runs immediately.
    #[serde(default = "immediate")]
    pub time_to_run: i64,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub reducer: Option<String>,
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub numerator: u32,
    #[serde(default)]
    pub denominator: u32,
}

fn immediate() -> i64 {
    -1
}

impl Job {
    /// Creates a foreground, normal priority job that runs immediately.
    pub fn new(
        function_name: impl Into<String>,
        unique_id: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            unique_id: unique_id.into(),
            handle: String::new(),
            priority: Priority::Normal,
            background: false,
            time_to_run: immediate(),
            data: data.into(),
            reducer: None,
            state: JobState::Queued,
            numerator: 0,
            denominator: 0,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    /// Gates the job until the given epoch second.
    pub fn run_at(mut self, epoch: i64) -> Self {
        self.time_to_run = epoch;
        self
    }

    pub fn with_reducer(mut self, reducer: impl Into<String>) -> Self {
        self.reducer = Some(reducer.into());
        self
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(&self.function_name, &self.unique_id)
    }

    /// True once `time_to_run` has arrived (or was never set).
    pub fn is_ready(&self, now: i64) -> bool {
        self.time_to_run <= now
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            handle: self.handle.clone(),
            state: Some(self.state),
            numerator: self.numerator,
            denominator: self.denominator,
        }
    }

    pub fn to_json(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> JobResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// The queue-resident summary of a job; payload stays in persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub function_name: String,
    pub unique_id: String,
    pub handle: String,
    pub priority: Priority,
    pub time_to_run: i64,
}

impl QueuedJob {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.function_name, &self.unique_id)
    }

    /// Normal jobs with a positive run time wait in the future sub-queue.
    pub fn is_future(&self) -> bool {
        self.priority == Priority::Normal && self.time_to_run > 0
    }
}

impl From<&Job> for QueuedJob {
    fn from(job: &Job) -> Self {
        Self {
            function_name: job.function_name.clone(),
            unique_id: job.unique_id.clone(),
            handle: job.handle.clone(),
            priority: job.priority,
            time_to_run: job.time_to_run,
        }
    }
}

/// Read-only status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub handle: String,
    /// `None` when the broker holds no job under this handle.
    pub state: Option<JobState>,
    pub numerator: u32,
    pub denominator: u32,
}

impl JobStatus {
    pub fn unknown(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            state: None,
            numerator: 0,
            denominator: 0,
        }
    }

    /// The broker holds the job.
    pub fn is_known(&self) -> bool {
        self.state.is_some()
    }

    pub fn running(&self) -> bool {
        self.state == Some(JobState::Working)
    }

    /// Progress has been reported.
    pub fn status_known(&self) -> bool {
        self.denominator != 0
    }
}
