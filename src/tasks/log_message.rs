use crate::job_store::Job;
use crate::scheduler::{Task, TaskContext, TaskError};
use tracing::info;

pub const LOG_MESSAGE_TASK: &str = "logMessage";

/// Writes the job's payload to the log. Handy for checking that jobs flow
/// through the dispatcher end to end.
pub struct LogMessage;

impl Task for LogMessage {
    fn run(&self, job: &Job, ctx: &TaskContext) -> Result<(), TaskError> {
        ctx.ping()?;
        match job.text_data.as_deref() {
            Some(text) => info!("Job {} says: {}", job.id, text),
            None => info!("Job {} says nothing, keys {:?}", job.id, job.key_data),
        }
        Ok(())
    }
}
