//! Tasks shipped with the scheduler.

mod fan_out;
mod log_message;

pub use fan_out::{FanOut, FanOutParams, FAN_OUT_TASK};
pub use log_message::{LogMessage, LOG_MESSAGE_TASK};
