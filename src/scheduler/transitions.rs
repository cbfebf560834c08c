//! Atomic state transitions on a single job.
//!
//! Every operation reads the job, decides the next state from what it read and
//! writes it back conditionally on the version it saw. A write that changes no
//! rows lost a race against another writer; the operation then re-reads and
//! decides again, so a claim racing another claim ends up as a no-op.

use super::retry_policy::RetryPolicy;
use crate::job_store::{Job, JobState, JobStatus, JobStore};
use anyhow::{bail, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, warn};

const MAX_WRITE_ATTEMPTS: usize = 8;

/// Result of a transition request.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The job moved from `from` to the state carried by `job`.
    Applied { from: JobStatus, job: Job },
    /// The job was not in a state the operation applies to; nothing was written.
    Skipped { current: JobStatus },
    /// No job with this id.
    Missing,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    /// Status after the request, if the job exists.
    pub fn status(&self) -> Option<JobStatus> {
        match self {
            Transition::Applied { job, .. } => Some(job.status),
            Transition::Skipped { current } => Some(*current),
            Transition::Missing => None,
        }
    }
}

/// The only writer of job lifecycle state.
#[derive(Clone)]
pub struct TransitionEngine {
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
}

impl TransitionEngine {
    pub fn new(store: Arc<dyn JobStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// waiting → started. Anything else is "already taken".
    pub fn claim(&self, id: i64) -> Result<Transition> {
        self.apply(id, "claim", |job| {
            (job.status == JobStatus::Waiting).then(|| JobState {
                status: JobStatus::Started,
                ..job.state()
            })
        })
    }

    /// started → waiting without touching the error count.
    pub fn free(&self, id: i64) -> Result<Transition> {
        self.apply(id, "free", |job| {
            (job.status == JobStatus::Started).then(|| JobState {
                status: JobStatus::Waiting,
                ..job.state()
            })
        })
    }

    /// Records a transient failure of a started job. The job goes back to
    /// waiting, or to aborted once the policy's error budget is used up.
    pub fn fail(&self, id: i64) -> Result<Transition> {
        let policy = &self.policy;
        let transition = self.apply(id, "fail", |job| {
            if job.status != JobStatus::Started {
                return None;
            }
            let errors = job.errors.saturating_add(1);
            if policy.should_abort(errors) {
                Some(JobState {
                    status: JobStatus::Aborted,
                    errors,
                    retry_after: None,
                })
            } else {
                Some(JobState {
                    status: JobStatus::Waiting,
                    errors,
                    retry_after: policy.retry_after(errors, Utc::now()),
                })
            }
        })?;

        if let Transition::Applied { job, .. } = &transition {
            if job.status == JobStatus::Aborted {
                error!(
                    "Job {} ({}) aborted after {} failures",
                    job.id, job.task_name, job.errors
                );
            } else {
                warn!(
                    "Job {} ({}) failed, {} of {} errors used",
                    job.id, job.task_name, job.errors, policy.max_errors
                );
            }
        }
        Ok(transition)
    }

    /// started → finished.
    pub fn finish(&self, id: i64) -> Result<Transition> {
        self.apply(id, "finish", |job| {
            (job.status == JobStatus::Started).then(|| JobState {
                status: JobStatus::Finished,
                retry_after: None,
                ..job.state()
            })
        })
    }

    /// waiting or started → aborted.
    pub fn abort(&self, id: i64) -> Result<Transition> {
        let transition = self.apply(id, "abort", |job| {
            matches!(job.status, JobStatus::Waiting | JobStatus::Started).then(|| JobState {
                status: JobStatus::Aborted,
                retry_after: None,
                ..job.state()
            })
        })?;
        if let Transition::Applied { job, .. } = &transition {
            error!("Job {} ({}) aborted", job.id, job.task_name);
        }
        Ok(transition)
    }

    fn apply<F>(&self, id: i64, op: &str, plan: F) -> Result<Transition>
    where
        F: Fn(&Job) -> Option<JobState>,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(job) = self.store.get_job(id)? else {
                debug!("{} of job {}: no such job", op, id);
                return Ok(Transition::Missing);
            };

            let Some(next) = plan(&job) else {
                debug!("{} of job {} skipped, status is {}", op, id, job.status);
                return Ok(Transition::Skipped {
                    current: job.status,
                });
            };
            debug_assert!(job.status.can_transition_to(next.status));

            if self.store.write_job_state(&job, &next)? {
                debug!("{} of job {}: {} -> {}", op, id, job.status, next.status);
                let from = job.status;
                let job = Job {
                    status: next.status,
                    errors: next.errors,
                    retry_after: next.retry_after,
                    version: job.version + 1,
                    ..job
                };
                return Ok(Transition::Applied { from, job });
            }
            debug!("{} of job {} lost a write race, retrying", op, id);
        }
        bail!(
            "{} of job {} gave up after {} conflicting writes",
            op,
            id,
            MAX_WRITE_ATTEMPTS
        )
    }
}
