//! Task implementations with fixed behavior.

#![allow(dead_code)]

use cron_dispatch::job_store::Job;
use cron_dispatch::scheduler::{TaskContext, TaskError};
use cron_dispatch::timekeeper::ManualClock;
use std::time::Duration;

pub const ALWAYS_OK: &str = "alwaysOk";
pub const ALWAYS_TRANSIENT: &str = "alwaysTransient";
pub const ALWAYS_FATAL: &str = "alwaysFatal";
pub const EXCEEDS_DEADLINE: &str = "exceedsDeadline";

pub fn always_ok(_: &Job, _: &TaskContext) -> Result<(), TaskError> {
    Ok(())
}

pub fn always_transient(job: &Job, _: &TaskContext) -> Result<(), TaskError> {
    Err(TaskError::transient(format!("job {} is flaky", job.id)))
}

pub fn always_fatal(job: &Job, _: &TaskContext) -> Result<(), TaskError> {
    Err(TaskError::fatal(format!("job {} cannot be done", job.id)))
}

/// A task that uses up the whole budget of its guard, then checks it.
/// The guard must read `clock`.
pub fn exceeds_deadline(
    clock: ManualClock,
) -> impl Fn(&Job, &TaskContext) -> Result<(), TaskError> + Send + Sync {
    move |_, ctx| {
        clock.advance(ctx.timekeeper.budget());
        ctx.ping()?;
        Ok(())
    }
}

/// A task that spends `step` of `clock` time, then checks the guard.
pub fn spends(
    clock: ManualClock,
    step: Duration,
) -> impl Fn(&Job, &TaskContext) -> Result<(), TaskError> + Send + Sync {
    move |_, ctx| {
        clock.advance(step);
        ctx.ping()?;
        Ok(())
    }
}
