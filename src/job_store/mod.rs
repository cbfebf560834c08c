mod models;
mod schema;
mod sqlite_job_store;

pub use models::*;
pub use schema::JOB_STORE_VERSIONED_SCHEMAS;
pub use sqlite_job_store::SqliteJobStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

/// Persistence collaborator for jobs and priority groups.
///
/// All job writes made by the scheduler go through [`JobStore::write_job_state`],
/// a single-row conditional update: it only applies if the row still carries the
/// version that was read, which makes read-check-write sequences atomic without
/// holding locks across calls.
pub trait JobStore: Send + Sync {
    // Priority groups

    /// Returns the group called `name`, creating it with `priority` and `label`
    /// if it does not exist yet. An existing group is returned unchanged.
    fn get_or_create_group(&self, name: &str, priority: i64, label: &str)
        -> Result<PriorityGroup>;
    fn get_group(&self, name: &str) -> Result<Option<PriorityGroup>>;
    /// All groups, highest priority first.
    fn list_groups_by_priority(&self) -> Result<Vec<PriorityGroup>>;

    // Jobs

    fn create_job(&self, job: &NewJob) -> Result<Job>;
    /// Creates `job` unless a job with the same task name and key data already
    /// exists. Returns the job and whether it was newly created.
    fn create_job_unique(&self, job: &NewJob) -> Result<(Job, bool)>;
    fn find_job(&self, task_name: &str, key_data: &[String]) -> Result<Option<Job>>;
    fn get_job(&self, id: i64) -> Result<Option<Job>>;
    /// Waiting jobs of `group` whose retry delay (if any) has elapsed at `now`.
    fn list_waiting_jobs(&self, group: &str, now: DateTime<Utc>) -> Result<Vec<Job>>;
    fn count_jobs_by_status(&self) -> Result<Vec<(JobStatus, usize)>>;

    /// Writes `next` over `expected` if the stored version still equals
    /// `expected.version`. Returns false when zero rows changed.
    fn write_job_state(&self, expected: &Job, next: &JobState) -> Result<bool>;
    /// Replaces the key data of a job, used by tasks persisting a checkpoint.
    fn update_key_data(&self, id: i64, key_data: &[String]) -> Result<bool>;
}

/// Ordered, read-only view over the keys of application entities.
pub trait EntityIndex: Send + Sync {
    /// Up to `limit` keys of `kind` strictly greater than `after`, ascending.
    fn keys_after(&self, kind: &str, after: Option<&str>, limit: usize) -> Result<Vec<String>>;
}

/// Host-side view of the continuation queue.
pub trait ContinuationInbox: Send + Sync {
    fn due_continuations(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<QueuedContinuation>>;
    /// Removes a delivered continuation.
    fn complete_continuation(&self, id: i64) -> Result<()>;
    /// Puts a continuation back for another attempt at `not_before`.
    fn reschedule_continuation(&self, id: i64, not_before: DateTime<Utc>) -> Result<()>;
}
