use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Jobs
// =============================================================================

/// Lifecycle status of a [`Job`].
///
/// `Finished` and `Aborted` are terminal. The only legal edges are
/// waiting→started, started→{finished, waiting, aborted} and waiting→aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Started,
    Finished,
    Aborted,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Waiting,
        JobStatus::Started,
        JobStatus::Finished,
        JobStatus::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobStatus::Waiting),
            "started" => Some(JobStatus::Started),
            "finished" => Some(JobStatus::Finished),
            "aborted" => Some(JobStatus::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Aborted)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Waiting, JobStatus::Started)
                | (JobStatus::Waiting, JobStatus::Aborted)
                | (JobStatus::Started, JobStatus::Finished)
                | (JobStatus::Started, JobStatus::Waiting)
                | (JobStatus::Started, JobStatus::Aborted)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// Name of the [`PriorityGroup`] this job belongs to.
    pub priority_group: String,
    /// Key into the task registry selecting the handler.
    pub task_name: String,
    pub status: JobStatus,
    /// Number of transient failures recorded so far.
    pub errors: u32,
    /// Ordered opaque references handed to the task.
    pub key_data: Vec<String>,
    pub text_data: Option<String>,
    /// Earliest instant at which a retried job is dispatched again.
    pub retry_after: Option<DateTime<Utc>>,
    /// Incremented on every write; conditional updates compare against it.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Job {
    /// The mutable part of the job, as seen by the transition engine.
    pub fn state(&self) -> JobState {
        JobState {
            status: self.status,
            errors: self.errors,
            retry_after: self.retry_after,
        }
    }
}

/// Fields the transition engine is allowed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobState {
    pub status: JobStatus,
    pub errors: u32,
    pub retry_after: Option<DateTime<Utc>>,
}

/// What a producer supplies to create a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub priority_group: String,
    pub task_name: String,
    #[serde(default)]
    pub key_data: Vec<String>,
    #[serde(default)]
    pub text_data: Option<String>,
}

impl NewJob {
    pub fn new(priority_group: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            priority_group: priority_group.into(),
            task_name: task_name.into(),
            key_data: Vec::new(),
            text_data: None,
        }
    }

    pub fn with_key_data<I, S>(mut self, key_data: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_data = key_data.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_text_data(mut self, text_data: impl Into<String>) -> Self {
        self.text_data = Some(text_data.into());
        self
    }
}

// =============================================================================
// Priority groups
// =============================================================================

/// Named bucket of jobs. Groups with a higher `priority` are dispatched first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityGroup {
    pub id: i64,
    pub name: String,
    pub priority: i64,
    pub label: String,
}

pub const EMAIL_GROUP: &str = "email";
pub const CONVERT_GROUP: &str = "convert";

// =============================================================================
// Continuations
// =============================================================================

/// A continuation waiting in the queue for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedContinuation {
    pub id: i64,
    pub runner: String,
    pub checkpoint: Option<serde_json::Value>,
    pub params: serde_json::Value,
    pub attempts: u32,
    pub not_before: DateTime<Utc>,
}
