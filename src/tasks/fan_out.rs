//! Fan-out setup task.
//!
//! Walks every entity of one kind and creates a job per entity in a target
//! group. Creation is deduplicated on the task name and the entity key, so a
//! slice that is repeated after a crash or a retry enqueues nothing twice.
//!
//! The walk runs either as a job (the checkpoint is written back into the
//! job's key data after every slice) or as a continuation runner.

use crate::batch::{next_slice, CheckpointedBatch, EntityKeys, NextSlice, SliceExit, SliceReport};
use crate::job_store::{EntityIndex, Job, JobStore, NewJob};
use crate::scheduler::{Task, TaskContext, TaskError};
use crate::timekeeper::Timekeeper;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info};

pub const FAN_OUT_TASK: &str = "fanOut";

/// What to walk and what to create for each entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutParams {
    /// Entity kind to walk.
    pub kind: String,
    /// Priority group of the created jobs.
    pub group: String,
    /// Task name of the created jobs.
    pub task: String,
}

pub struct FanOut {
    index: Arc<dyn EntityIndex>,
    store: Arc<dyn JobStore>,
    batch_size: usize,
}

impl FanOut {
    pub fn new(index: Arc<dyn EntityIndex>, store: Arc<dyn JobStore>, batch_size: usize) -> Self {
        Self {
            index,
            store,
            batch_size,
        }
    }

    /// One slice of the walk, creating a job for each entity after `checkpoint`.
    pub fn slice(
        &self,
        params: &FanOutParams,
        checkpoint: Option<String>,
        timekeeper: &Timekeeper,
    ) -> Result<SliceReport<String>> {
        let source = EntityKeys::new(self.index.clone(), params.kind.clone());
        let mut created = 0;
        let report = next_slice(&source, checkpoint, self.batch_size, timekeeper, |key, _| {
            let new_job = NewJob::new(&params.group, &params.task)
                .with_key_data([params.kind.as_str(), key.as_str()]);
            let (_, is_new) = self
                .store
                .create_job_unique(&new_job)
                .map_err(|e| TaskError::transient(format!("{:#}", e)))?;
            if is_new {
                created += 1;
            }
            Ok(())
        })?;

        debug!(
            "Fan-out over {}: {} entities, {} new {} jobs, exit {:?}",
            params.kind, report.processed, created, params.task, report.exit
        );
        Ok(report)
    }
}

impl CheckpointedBatch for FanOut {
    type Key = String;

    fn name(&self) -> &'static str {
        FAN_OUT_TASK
    }

    fn run_slice(
        &self,
        checkpoint: Option<String>,
        params: &JsonValue,
        timekeeper: &Timekeeper,
    ) -> Result<SliceReport<String>> {
        let params: FanOutParams =
            serde_json::from_value(params.clone()).context("Invalid fan-out parameters")?;
        self.slice(&params, checkpoint, timekeeper)
    }
}

/// As a job: the parameters are the job's text data (JSON) and the
/// checkpoint is the first element of its key data.
impl Task for FanOut {
    fn run(&self, job: &Job, ctx: &TaskContext) -> Result<(), TaskError> {
        let text = job
            .text_data
            .as_deref()
            .ok_or_else(|| TaskError::fatal("fan-out job carries no parameters"))?;
        let params: FanOutParams = serde_json::from_str(text)
            .map_err(|e| TaskError::fatal(format!("invalid fan-out parameters: {}", e)))?;

        let mut checkpoint = job.key_data.first().cloned();
        loop {
            let report = self
                .slice(&params, checkpoint.clone(), &ctx.timekeeper)
                .map_err(|e| TaskError::transient(format!("{:#}", e)))?;

            if let NextSlice::Resume(Some(key)) = &report.next {
                if checkpoint.as_ref() != Some(key) {
                    ctx.job_store
                        .update_key_data(job.id, std::slice::from_ref(key))
                        .map_err(|e| TaskError::transient(format!("{:#}", e)))?;
                    checkpoint = Some(key.clone());
                }
            }

            match report.exit {
                SliceExit::Drained => {
                    info!("Fan-out job {} walked all {} entities", job.id, params.kind);
                    return Ok(());
                }
                SliceExit::BatchFull => continue,
                SliceExit::DeadlineHit => return Err(TaskError::DeadlineExceeded),
                SliceExit::ItemFailed(reason) => return Err(TaskError::Transient(reason)),
                SliceExit::ItemFatal(reason) => return Err(TaskError::Fatal(reason)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::{JobStatus, SqliteJobStore, EMAIL_GROUP};
    use crate::timekeeper::ManualClock;
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestFanOut {
        fan_out: FanOut,
        store: Arc<SqliteJobStore>,
        _temp_dir: TempDir,
    }

    fn create_test_fan_out(entities: usize, batch_size: usize) -> TestFanOut {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap());
        let keys: Vec<String> = (1..=entities).map(|i| format!("user{:03}", i)).collect();
        store.insert_entity_keys("user", &keys).unwrap();
        TestFanOut {
            fan_out: FanOut::new(store.clone(), store.clone(), batch_size),
            store,
            _temp_dir: temp_dir,
        }
    }

    fn params() -> FanOutParams {
        FanOutParams {
            kind: "user".to_string(),
            group: EMAIL_GROUP.to_string(),
            task: "welcomeMail".to_string(),
        }
    }

    fn waiting_count(store: &SqliteJobStore) -> usize {
        store
            .list_waiting_jobs(EMAIL_GROUP, chrono::Utc::now())
            .unwrap()
            .len()
    }

    #[test]
    fn test_repeated_slice_creates_no_duplicates() {
        let t = create_test_fan_out(5, 10);
        let timekeeper = Timekeeper::new(Duration::from_secs(60));

        t.fan_out.slice(&params(), None, &timekeeper).unwrap();
        t.fan_out.slice(&params(), None, &timekeeper).unwrap();

        assert_eq!(waiting_count(&t.store), 5);
        let job = t
            .store
            .find_job("welcomeMail", &["user".to_string(), "user003".to_string()])
            .unwrap();
        assert!(job.is_some());
    }

    #[test]
    fn test_job_walks_everything_within_budget() {
        let t = create_test_fan_out(23, 5);
        let setup = t
            .store
            .create_job(
                &NewJob::new("setup", FAN_OUT_TASK)
                    .with_text_data(serde_json::to_string(&params()).unwrap()),
            )
            .unwrap();
        let ctx = TaskContext::new(Timekeeper::new(Duration::from_secs(60)), t.store.clone());

        assert_eq!(t.fan_out.run(&setup, &ctx), Ok(()));
        assert_eq!(waiting_count(&t.store), 23);
        let stored = t.store.get_job(setup.id).unwrap().unwrap();
        assert_eq!(stored.key_data, vec!["user020"]);
    }

    #[test]
    fn test_job_resumes_from_stored_checkpoint_and_stops_on_spent_budget() {
        let t = create_test_fan_out(12, 4);
        let setup = t
            .store
            .create_job(
                &NewJob::new("setup", FAN_OUT_TASK)
                    .with_key_data(["user004"])
                    .with_text_data(serde_json::to_string(&params()).unwrap()),
            )
            .unwrap();

        let clock = ManualClock::new();
        let timekeeper =
            Timekeeper::with_clock(Duration::from_millis(100), Arc::new(clock.clone()));
        let ctx = TaskContext::new(timekeeper, t.store.clone());
        clock.advance(Duration::from_millis(100));

        assert_eq!(t.fan_out.run(&setup, &ctx), Err(TaskError::DeadlineExceeded));
        assert_eq!(waiting_count(&t.store), 0);
        assert_eq!(
            t.store.get_job(setup.id).unwrap().unwrap().key_data,
            vec!["user004"]
        );

        let fresh = TaskContext::new(Timekeeper::new(Duration::from_secs(60)), t.store.clone());
        assert_eq!(t.fan_out.run(&setup, &fresh), Ok(()));
        // user005..user012 only
        assert_eq!(waiting_count(&t.store), 8);
    }

    #[test]
    fn test_job_without_parameters_is_fatal() {
        let t = create_test_fan_out(1, 5);
        let setup = t
            .store
            .create_job(&NewJob::new("setup", FAN_OUT_TASK))
            .unwrap();
        let ctx = TaskContext::new(Timekeeper::new(Duration::from_secs(60)), t.store.clone());

        assert!(matches!(t.fan_out.run(&setup, &ctx), Err(TaskError::Fatal(_))));
        assert_eq!(setup.status, JobStatus::Waiting);
    }
}
