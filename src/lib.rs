//! Checkpointed priority job scheduler.
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod batch;
pub mod config;
pub mod job_store;
pub mod scheduler;
pub mod server;
pub mod sqlite_persistence;
pub mod tasks;
pub mod timekeeper;

// Re-export commonly used types for convenience
pub use job_store::{Job, JobStatus, JobStore, NewJob, PriorityGroup, SqliteJobStore};
pub use scheduler::{DispatchSummary, Dispatcher, RetryPolicy, Task, TaskError, TaskRegistry};
pub use server::{run_server, RequestsLoggingLevel};
pub use timekeeper::{DeadlineExceeded, Timekeeper};
