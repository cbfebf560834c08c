//! Abort threshold and optional backoff for jobs that fail transiently.

use crate::config::RetrySettings;
use chrono::{DateTime, Utc};

/// Exponential backoff between retries of the same job.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay after the first failure, in seconds.
    pub initial_backoff_secs: u64,
    /// Cap for exponential growth, in seconds.
    pub max_backoff_secs: u64,
    /// Multiplier applied to the delay after each further failure.
    pub backoff_multiplier: f64,
}

/// What to do with a job whose task failed transiently.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Number of failures tolerated; the failure after that aborts the job.
    pub max_errors: u32,
    /// When absent, failed jobs are eligible again immediately.
    pub backoff: Option<Backoff>,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        let backoff = if settings.initial_backoff_secs > 0 {
            Some(Backoff {
                initial_backoff_secs: settings.initial_backoff_secs,
                max_backoff_secs: settings.max_backoff_secs,
                backoff_multiplier: settings.backoff_multiplier,
            })
        } else {
            None
        };
        Self {
            max_errors: settings.max_errors,
            backoff,
        }
    }

    /// Whether a job that has now failed `errors` times must be aborted.
    pub fn should_abort(&self, errors: u32) -> bool {
        errors > self.max_errors
    }

    /// Backoff in seconds after the `errors`-th failure, 0 without backoff.
    ///
    /// `initial_backoff * multiplier^(errors - 1)`, capped at `max_backoff_secs`.
    pub fn backoff_secs(&self, errors: u32) -> u64 {
        match &self.backoff {
            Some(backoff) => {
                let exponent = errors.saturating_sub(1).min(i32::MAX as u32) as i32;
                let delay =
                    backoff.initial_backoff_secs as f64 * backoff.backoff_multiplier.powi(exponent);
                delay.min(backoff.max_backoff_secs as f64) as u64
            }
            None => 0,
        }
    }

    /// Earliest re-dispatch instant after the `errors`-th failure.
    pub fn retry_after(&self, errors: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.backoff
            .as_ref()
            .map(|_| now + chrono::Duration::seconds(self.backoff_secs(errors) as i64))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_errors: 5,
            backoff: None,
        }
    }
}
