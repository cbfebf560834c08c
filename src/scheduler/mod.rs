//! Job lifecycle and priority dispatch.
//!
//! Jobs are claimed, run through the task registered under their task name and
//! moved to their next state by the [`TransitionEngine`]. A [`Dispatcher`] owns
//! the registry and runs one dispatch cycle per [`Dispatcher::poke`].

mod dispatcher;
mod registry;
mod retry_policy;
mod task;
mod transitions;

pub use dispatcher::{DispatchSummary, Dispatcher, HandleOutcome};
pub use registry::TaskRegistry;
pub use retry_policy::{Backoff, RetryPolicy};
pub use task::{Task, TaskContext, TaskError};
pub use transitions::{Transition, TransitionEngine};
