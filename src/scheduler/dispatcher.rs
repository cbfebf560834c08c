use super::registry::TaskRegistry;
use super::retry_policy::RetryPolicy;
use super::task::{TaskContext, TaskError};
use super::transitions::{Transition, TransitionEngine};
use crate::job_store::{JobStatus, JobStore};
use crate::server::metrics;
use crate::timekeeper::Timekeeper;
use chrono::Utc;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What happened to a single job handed to [`Dispatcher::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The job was not waiting (or did not exist); someone else has it.
    AlreadyTaken,
    Finished,
    /// Transient failure, back to waiting.
    Retrying,
    /// Fatal failure, or a transient one past the error budget.
    Aborted,
    /// No task registered under the job's task name.
    UnknownTask,
    /// The budget ran out inside the task; the job was released.
    DeadlineHit,
    /// Persistence failed; the job is left as it is.
    StoreError,
}

impl HandleOutcome {
    /// Whether the dispatch cycle may go on with the next job.
    pub fn continues_cycle(&self) -> bool {
        !matches!(self, HandleOutcome::DeadlineHit | HandleOutcome::StoreError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandleOutcome::AlreadyTaken => "already_taken",
            HandleOutcome::Finished => "finished",
            HandleOutcome::Retrying => "retrying",
            HandleOutcome::Aborted => "aborted",
            HandleOutcome::UnknownTask => "unknown_task",
            HandleOutcome::DeadlineHit => "deadline",
            HandleOutcome::StoreError => "store_error",
        }
    }
}

/// Aggregate of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Groups whose due jobs were all handled.
    pub groups_completed: usize,
    /// Jobs for which the cycle went on afterwards.
    pub jobs_completed: usize,
    pub finished: usize,
    pub retrying: usize,
    pub aborted: usize,
    pub unknown_task: usize,
    pub already_taken: usize,
    /// The cycle ended early because the time budget ran out.
    pub deadline_hit: bool,
    /// The cycle ended early because the store failed.
    pub store_error: bool,
}

impl DispatchSummary {
    fn record(&mut self, outcome: HandleOutcome) {
        match outcome {
            HandleOutcome::AlreadyTaken => self.already_taken += 1,
            HandleOutcome::Finished => self.finished += 1,
            HandleOutcome::Retrying => self.retrying += 1,
            HandleOutcome::Aborted => self.aborted += 1,
            HandleOutcome::UnknownTask => self.unknown_task += 1,
            HandleOutcome::DeadlineHit => self.deadline_hit = true,
            HandleOutcome::StoreError => self.store_error = true,
        }
        if outcome.continues_cycle() {
            self.jobs_completed += 1;
        }
    }
}

impl std::fmt::Display for DispatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Completed {} jobs in {} priority groups.",
            self.jobs_completed, self.groups_completed
        )
    }
}

/// Runs waiting jobs through their tasks, highest priority group first.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: TaskRegistry,
    engine: TransitionEngine,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, registry: TaskRegistry, policy: RetryPolicy) -> Self {
        let engine = TransitionEngine::new(store.clone(), policy);
        Self {
            store,
            registry,
            engine,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &TransitionEngine {
        &self.engine
    }

    /// Claims and runs one job. Returns false when the dispatch cycle must
    /// stop: the time budget ran out or the store failed.
    pub fn handle(&self, id: i64, timekeeper: &Timekeeper) -> bool {
        self.handle_job(id, timekeeper).continues_cycle()
    }

    /// Like [`Dispatcher::handle`] but reports what happened to the job.
    pub fn handle_job(&self, id: i64, timekeeper: &Timekeeper) -> HandleOutcome {
        let outcome = match self.try_handle(id, timekeeper) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Store failure while handling job {}: {:#}", id, e);
                HandleOutcome::StoreError
            }
        };
        debug!("Job {} handled: {}", id, outcome.as_str());
        outcome
    }

    fn try_handle(&self, id: i64, timekeeper: &Timekeeper) -> anyhow::Result<HandleOutcome> {
        let job = match self.engine.claim(id)? {
            Transition::Applied { job, .. } => job,
            Transition::Skipped { .. } | Transition::Missing => {
                return Ok(HandleOutcome::AlreadyTaken)
            }
        };

        let Some(task) = self.registry.get(&job.task_name) else {
            error!(
                "Job {} references unknown task '{}', aborting",
                job.id, job.task_name
            );
            self.engine.abort(id)?;
            metrics::record_job_outcome(&job.task_name, HandleOutcome::UnknownTask.as_str());
            return Ok(HandleOutcome::UnknownTask);
        };

        let ctx = TaskContext::new(timekeeper.clone(), self.store.clone());
        let started = Instant::now();
        let result = match catch_unwind(AssertUnwindSafe(|| task.run(&job, &ctx))) {
            Ok(result) => result,
            Err(payload) => Err(TaskError::Transient(panic_message(payload.as_ref()))),
        };
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(()) => {
                if let Transition::Skipped { current } = self.engine.finish(id)? {
                    warn!(
                        "Job {} completed but was already {} when finishing",
                        id, current
                    );
                }
                HandleOutcome::Finished
            }
            Err(TaskError::DeadlineExceeded) => {
                info!(
                    "Job {} ({}) ran out of time after {:?}, releasing",
                    id, job.task_name, elapsed
                );
                self.engine.free(id)?;
                HandleOutcome::DeadlineHit
            }
            Err(TaskError::Fatal(reason)) => {
                error!("Job {} ({}) failed fatally: {}", id, job.task_name, reason);
                self.engine.abort(id)?;
                HandleOutcome::Aborted
            }
            Err(TaskError::Transient(reason)) => {
                warn!("Job {} ({}) failed: {}", id, job.task_name, reason);
                match self.engine.fail(id)?.status() {
                    Some(JobStatus::Aborted) => HandleOutcome::Aborted,
                    _ => HandleOutcome::Retrying,
                }
            }
        };

        metrics::record_job_outcome(&job.task_name, outcome.as_str());
        metrics::record_job_duration(&job.task_name, elapsed);
        Ok(outcome)
    }

    /// Runs one dispatch cycle over every priority group.
    ///
    /// Groups are visited by descending priority and their due waiting jobs
    /// handled one by one. The guard is checked before each job; the cycle
    /// ends as soon as it trips or a job reports that the cycle must stop.
    pub fn poke(&self, timekeeper: &Timekeeper) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        let groups = match self.store.list_groups_by_priority() {
            Ok(groups) => groups,
            Err(e) => {
                error!("Failed to list priority groups: {:#}", e);
                summary.store_error = true;
                metrics::record_dispatch_cycle(&summary);
                return summary;
            }
        };

        'groups: for group in groups {
            let jobs = match self.store.list_waiting_jobs(&group.name, Utc::now()) {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!("Failed to list jobs of group '{}': {:#}", group.name, e);
                    summary.store_error = true;
                    break;
                }
            };
            debug!(
                "Group '{}' (priority {}): {} due jobs",
                group.name,
                group.priority,
                jobs.len()
            );

            for job in jobs {
                if let Err(e) = timekeeper.ping() {
                    info!("Dispatch cycle stopped: {}", e);
                    summary.deadline_hit = true;
                    break 'groups;
                }
                let outcome = self.handle_job(job.id, timekeeper);
                summary.record(outcome);
                if !outcome.continues_cycle() {
                    break 'groups;
                }
            }
            summary.groups_completed += 1;
        }

        info!("{}", summary);
        metrics::record_dispatch_cycle(&summary);
        summary
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}
