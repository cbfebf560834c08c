//! Host side of the continuation queue: delivers due continuations to their
//! batch tasks and queues whatever follows.

use super::continuation::{follow_up, ContinuationQueue, ContinuationRegistry};
use super::runner::{NextSlice, SliceExit};
use crate::job_store::{ContinuationInbox, QueuedContinuation};
use crate::server::metrics;
use crate::timekeeper::Timekeeper;
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PumpSummary {
    /// Continuations handed to a batch task.
    pub delivered: usize,
    /// Slices after which the walk went on.
    pub continued: usize,
    /// Walks that reached the end of their collection.
    pub drained: usize,
    /// Walks given up on a fatal item or an unknown runner.
    pub abandoned: usize,
    /// Deliveries that failed and were put back for later.
    pub rescheduled: usize,
    pub deadline_hit: bool,
}

/// Drains due continuations into a [`ContinuationRegistry`].
pub struct ContinuationPump {
    registry: ContinuationRegistry,
    inbox: Arc<dyn ContinuationInbox>,
    queue: Arc<dyn ContinuationQueue>,
    /// Delay before a slice that hit a failing item, or failed outright, runs again.
    retry_delay: Duration,
    /// Deliveries of one continuation that may fail before it is dropped.
    max_attempts: u32,
}

impl ContinuationPump {
    pub fn new(
        registry: ContinuationRegistry,
        inbox: Arc<dyn ContinuationInbox>,
        queue: Arc<dyn ContinuationQueue>,
        retry_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            registry,
            inbox,
            queue,
            retry_delay,
            max_attempts,
        }
    }

    pub fn registry(&self) -> &ContinuationRegistry {
        &self.registry
    }

    /// Queues the first slice of the batch task `runner`.
    pub fn start(&self, runner: &str, params: JsonValue) -> Result<i64> {
        let id = self.registry.start(self.queue.as_ref(), runner, params)?;
        info!("Started batch task {} as continuation {}", runner, id);
        Ok(id)
    }

    /// Delivers up to `limit` due continuations while `timekeeper` allows.
    ///
    /// A follow-up is queued before the delivered continuation is removed, so
    /// a crash in between re-delivers the same slice instead of losing it.
    pub fn run_due(&self, timekeeper: &Timekeeper, limit: usize) -> Result<PumpSummary> {
        let mut summary = PumpSummary::default();
        let due = self.inbox.due_continuations(Utc::now(), limit)?;
        debug!("{} continuations due", due.len());

        for step in timekeeper.iterate(due) {
            let Ok((_, continuation)) = step else {
                summary.deadline_hit = true;
                break;
            };
            summary.delivered += 1;
            self.deliver(&continuation, timekeeper, &mut summary)?;
        }

        if summary.delivered > 0 {
            info!(
                "Delivered {} continuations: {} continued, {} drained, {} abandoned, {} rescheduled",
                summary.delivered,
                summary.continued,
                summary.drained,
                summary.abandoned,
                summary.rescheduled
            );
        }
        Ok(summary)
    }

    fn deliver(
        &self,
        continuation: &QueuedContinuation,
        timekeeper: &Timekeeper,
        summary: &mut PumpSummary,
    ) -> Result<()> {
        let Some(runner) = self.registry.get(&continuation.runner) else {
            error!(
                "Dropping continuation {} for unknown batch task '{}'",
                continuation.id, continuation.runner
            );
            summary.abandoned += 1;
            return self.inbox.complete_continuation(continuation.id);
        };

        let report = match runner.run_slice_json(
            continuation.checkpoint.as_ref(),
            &continuation.params,
            timekeeper,
        ) {
            Ok(report) => report,
            Err(e) => return self.put_back(continuation, &format!("{:#}", e), summary),
        };
        metrics::record_slice(&continuation.runner, &report.exit, report.processed);

        match &report.next {
            NextSlice::Done => {
                info!(
                    "Batch task {} finished its walk ({} items in last slice)",
                    continuation.runner, report.processed
                );
                summary.drained += 1;
            }
            NextSlice::Abandon => {
                let reason = match &report.exit {
                    SliceExit::ItemFatal(reason) => reason.as_str(),
                    _ => "abandoned",
                };
                error!(
                    "Batch task {} abandoned its walk: {}",
                    continuation.runner, reason
                );
                summary.abandoned += 1;
            }
            NextSlice::Resume(_) => {
                if let Some(next) = follow_up(
                    &continuation.runner,
                    &continuation.params,
                    &report,
                    self.retry_delay,
                ) {
                    self.queue.enqueue(&next)?;
                }
                summary.continued += 1;
            }
        }
        self.inbox.complete_continuation(continuation.id)
    }

    fn put_back(
        &self,
        continuation: &QueuedContinuation,
        reason: &str,
        summary: &mut PumpSummary,
    ) -> Result<()> {
        if continuation.attempts + 1 >= self.max_attempts {
            error!(
                "Dropping continuation {} of {} after {} failed deliveries: {}",
                continuation.id,
                continuation.runner,
                continuation.attempts + 1,
                reason
            );
            summary.abandoned += 1;
            return self.inbox.complete_continuation(continuation.id);
        }

        warn!(
            "Continuation {} of {} failed, retrying in {:?}: {}",
            continuation.id, continuation.runner, self.retry_delay, reason
        );
        let not_before = Utc::now()
            + chrono::Duration::from_std(self.retry_delay)
                .unwrap_or_else(|_| chrono::Duration::zero());
        summary.rescheduled += 1;
        self.inbox
            .reschedule_continuation(continuation.id, not_before)
    }
}
