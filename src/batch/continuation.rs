use super::runner::{NextSlice, SliceExit, SliceReport};
use crate::timekeeper::Timekeeper;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A request to run one more slice of a batch task, at least once, soon.
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    /// Name of the [`BatchTask`] that runs the slice.
    pub runner: String,
    /// Key of the last fully processed item, `None` to start from the beginning.
    pub checkpoint: Option<JsonValue>,
    /// Parameters passed unchanged from slice to slice.
    pub params: JsonValue,
    /// How long to wait before delivery.
    pub delay: Duration,
}

impl Continuation {
    /// The first slice of a fresh walk.
    pub fn start(runner: impl Into<String>, params: JsonValue) -> Self {
        Self {
            runner: runner.into(),
            checkpoint: None,
            params,
            delay: Duration::ZERO,
        }
    }
}

/// Where continuations go. Delivery is at least once; runners must tolerate
/// seeing the same checkpoint twice.
pub trait ContinuationQueue: Send + Sync {
    /// Queues `continuation` and returns its queue id.
    fn enqueue(&self, continuation: &Continuation) -> Result<i64>;
}

/// A batch walk over an ordered collection with a typed checkpoint.
///
/// Implementations usually build their slice with [`super::next_slice`].
pub trait CheckpointedBatch: Send + Sync {
    type Key: Serialize + DeserializeOwned + Clone + Send;

    fn name(&self) -> &'static str;

    fn run_slice(
        &self,
        checkpoint: Option<Self::Key>,
        params: &JsonValue,
        timekeeper: &Timekeeper,
    ) -> Result<SliceReport<Self::Key>>;
}

/// Object-safe form of [`CheckpointedBatch`] with the checkpoint as JSON.
pub trait BatchTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn run_slice_json(
        &self,
        checkpoint: Option<&JsonValue>,
        params: &JsonValue,
        timekeeper: &Timekeeper,
    ) -> Result<SliceReport<JsonValue>>;
}

impl<T: CheckpointedBatch> BatchTask for T {
    fn name(&self) -> &'static str {
        CheckpointedBatch::name(self)
    }

    fn run_slice_json(
        &self,
        checkpoint: Option<&JsonValue>,
        params: &JsonValue,
        timekeeper: &Timekeeper,
    ) -> Result<SliceReport<JsonValue>> {
        let checkpoint = checkpoint
            .map(|value| serde_json::from_value::<T::Key>(value.clone()))
            .transpose()
            .with_context(|| {
                format!(
                    "Invalid checkpoint for batch task {}",
                    CheckpointedBatch::name(self)
                )
            })?;

        let report = self.run_slice(checkpoint, params, timekeeper)?;
        let next = match report.next {
            NextSlice::Resume(Some(key)) => NextSlice::Resume(Some(
                serde_json::to_value(key).context("Failed to encode checkpoint")?,
            )),
            other => other.map(|_| JsonValue::Null),
        };
        Ok(SliceReport {
            processed: report.processed,
            exit: report.exit,
            next,
        })
    }
}

/// Follow-up for a slice report, `None` when the walk is over.
///
/// A slice that hit a failing item resumes after `retry_delay`, anything else
/// that wants to go on resumes straight away.
pub fn follow_up(
    runner: &str,
    params: &JsonValue,
    report: &SliceReport<JsonValue>,
    retry_delay: Duration,
) -> Option<Continuation> {
    let NextSlice::Resume(checkpoint) = &report.next else {
        return None;
    };
    let delay = match report.exit {
        SliceExit::ItemFailed(_) => retry_delay,
        _ => Duration::ZERO,
    };
    Some(Continuation {
        runner: runner.to_string(),
        checkpoint: checkpoint.clone(),
        params: params.clone(),
        delay,
    })
}

/// Batch tasks that continuations can name.
#[derive(Default, Clone)]
pub struct ContinuationRegistry {
    runners: HashMap<&'static str, Arc<dyn BatchTask>>,
}

impl ContinuationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner: Arc<dyn BatchTask>) -> &mut Self {
        info!("Registering batch task: {}", runner.name());
        self.runners.insert(runner.name(), runner);
        self
    }

    pub fn with(mut self, runner: Arc<dyn BatchTask>) -> Self {
        self.register(runner);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BatchTask>> {
        self.runners.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.runners.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Queues the first slice of `runner`.
    pub fn start(
        &self,
        queue: &dyn ContinuationQueue,
        runner: &str,
        params: JsonValue,
    ) -> Result<i64> {
        if !self.runners.contains_key(runner) {
            anyhow::bail!("Unknown batch task: {}", runner);
        }
        queue.enqueue(&Continuation::start(runner, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{next_slice, BatchSource};
    use serde_json::json;

    struct Letters;

    impl BatchSource for Letters {
        type Item = char;
        type Key = char;

        fn fetch_after(&self, after: Option<&char>, limit: usize) -> Result<Vec<char>> {
            Ok(('a'..='e')
                .filter(|c| after.map_or(true, |a| c > a))
                .take(limit)
                .collect())
        }

        fn key_of(&self, item: &char) -> char {
            *item
        }
    }

    struct LetterWalk;

    impl CheckpointedBatch for LetterWalk {
        type Key = char;

        fn name(&self) -> &'static str {
            "letters"
        }

        fn run_slice(
            &self,
            checkpoint: Option<char>,
            params: &JsonValue,
            timekeeper: &Timekeeper,
        ) -> Result<SliceReport<char>> {
            let batch_size = params["batch_size"].as_u64().unwrap_or(2) as usize;
            next_slice(&Letters, checkpoint, batch_size, timekeeper, |_, _| Ok(()))
        }
    }

    #[test]
    fn test_adapter_round_trips_checkpoint_as_json() {
        let task = LetterWalk;
        let timekeeper = Timekeeper::new(Duration::from_secs(60));
        let params = json!({"batch_size": 2});

        let first = task.run_slice_json(None, &params, &timekeeper).unwrap();
        assert_eq!(first.next, NextSlice::Resume(Some(json!("b"))));

        let second = task
            .run_slice_json(first.checkpoint(), &params, &timekeeper)
            .unwrap();
        assert_eq!(second.next, NextSlice::Resume(Some(json!("d"))));
    }

    #[test]
    fn test_adapter_rejects_malformed_checkpoint() {
        let timekeeper = Timekeeper::new(Duration::from_secs(60));
        let result =
            LetterWalk.run_slice_json(Some(&json!({"not": "a char"})), &json!({}), &timekeeper);
        assert!(result.is_err());
    }

    #[test]
    fn test_follow_up_delays_only_failed_items() {
        let params = json!({});
        let full = SliceReport {
            processed: 2,
            exit: SliceExit::BatchFull,
            next: NextSlice::Resume(Some(json!("b"))),
        };
        let failed = SliceReport {
            processed: 0,
            exit: SliceExit::ItemFailed("smtp".into()),
            next: NextSlice::Resume(Some(json!("b"))),
        };
        let done = SliceReport {
            processed: 1,
            exit: SliceExit::Drained,
            next: NextSlice::Done,
        };

        let retry = Duration::from_secs(30);
        assert_eq!(
            follow_up("letters", &params, &full, retry).unwrap().delay,
            Duration::ZERO
        );
        assert_eq!(
            follow_up("letters", &params, &failed, retry).unwrap().delay,
            retry
        );
        assert!(follow_up("letters", &params, &done, retry).is_none());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ContinuationRegistry::new().with(Arc::new(LetterWalk));
        assert!(registry.get("letters").is_some());
        assert!(registry.get("numbers").is_none());
        assert_eq!(registry.names(), vec!["letters"]);
    }
}
