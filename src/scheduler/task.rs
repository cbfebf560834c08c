use crate::job_store::{Job, JobStore};
use crate::timekeeper::{DeadlineExceeded, Timekeeper};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How a unit of work reports that it did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Worth retrying; counted against the job's error budget.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Will never succeed; the job is aborted straight away.
    #[error("fatal failure: {0}")]
    Fatal(String),
    /// The time budget ran out; the job is released without penalty.
    #[error("time budget exhausted")]
    DeadlineExceeded,
}

impl TaskError {
    pub fn transient(reason: impl std::fmt::Display) -> Self {
        TaskError::Transient(reason.to_string())
    }

    pub fn fatal(reason: impl std::fmt::Display) -> Self {
        TaskError::Fatal(reason.to_string())
    }
}

impl From<DeadlineExceeded> for TaskError {
    fn from(_: DeadlineExceeded) -> Self {
        TaskError::DeadlineExceeded
    }
}

/// Context handed to a task while it runs a job.
#[derive(Clone)]
pub struct TaskContext {
    /// Guard of the dispatch cycle the job runs in.
    pub timekeeper: Timekeeper,

    pub job_store: Arc<dyn JobStore>,
}

impl TaskContext {
    pub fn new(timekeeper: Timekeeper, job_store: Arc<dyn JobStore>) -> Self {
        Self {
            timekeeper,
            job_store,
        }
    }

    /// Remaining budget, or [`TaskError::DeadlineExceeded`] once it is spent.
    pub fn ping(&self) -> Result<Duration, TaskError> {
        Ok(self.timekeeper.ping()?)
    }
}

/// An executable unit of work selected by a job's task name.
///
/// Tasks run synchronously on the dispatching thread. Long loops should call
/// [`TaskContext::ping`] and give up with `?` once the budget is spent.
pub trait Task: Send + Sync {
    fn run(&self, job: &Job, ctx: &TaskContext) -> Result<(), TaskError>;
}

impl<F> Task for F
where
    F: Fn(&Job, &TaskContext) -> Result<(), TaskError> + Send + Sync,
{
    fn run(&self, job: &Job, ctx: &TaskContext) -> Result<(), TaskError> {
        self(job, ctx)
    }
}
