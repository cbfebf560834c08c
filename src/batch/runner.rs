//! One bounded slice of work over an ordered collection.

use crate::job_store::EntityIndex;
use crate::scheduler::TaskError;
use crate::timekeeper::Timekeeper;
use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// An ordered collection that can be read in pages after a key.
pub trait BatchSource {
    type Item;
    type Key: Clone;

    /// Up to `limit` items with a key strictly greater than `after`, in key order.
    fn fetch_after(&self, after: Option<&Self::Key>, limit: usize) -> Result<Vec<Self::Item>>;

    fn key_of(&self, item: &Self::Item) -> Self::Key;
}

/// Keys of one entity kind in an [`EntityIndex`].
#[derive(Clone)]
pub struct EntityKeys {
    index: Arc<dyn EntityIndex>,
    kind: String,
}

impl EntityKeys {
    pub fn new(index: Arc<dyn EntityIndex>, kind: impl Into<String>) -> Self {
        Self {
            index,
            kind: kind.into(),
        }
    }
}

impl BatchSource for EntityKeys {
    type Item = String;
    type Key = String;

    fn fetch_after(&self, after: Option<&String>, limit: usize) -> Result<Vec<String>> {
        self.index
            .keys_after(&self.kind, after.map(String::as_str), limit)
    }

    fn key_of(&self, item: &String) -> String {
        item.clone()
    }
}

/// Why a slice stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "exit", content = "reason")]
pub enum SliceExit {
    /// Fewer items than the batch size were left.
    Drained,
    /// A full batch was processed; more may follow.
    BatchFull,
    /// The time budget ran out before the batch was done.
    DeadlineHit,
    /// An item failed transiently and will be retried by the next slice.
    ItemFailed(String),
    /// An item failed for good; the whole walk is given up.
    ItemFatal(String),
}

/// What should happen after a slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextSlice<K> {
    /// The collection is exhausted.
    Done,
    /// Run another slice starting strictly after this checkpoint
    /// (`None` starts from the beginning).
    Resume(Option<K>),
    /// Do not continue.
    Abandon,
}

impl<K> NextSlice<K> {
    pub fn map<U>(self, f: impl FnOnce(K) -> U) -> NextSlice<U> {
        match self {
            NextSlice::Done => NextSlice::Done,
            NextSlice::Resume(key) => NextSlice::Resume(key.map(f)),
            NextSlice::Abandon => NextSlice::Abandon,
        }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, NextSlice::Resume(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceReport<K> {
    /// Items fully processed in this slice.
    pub processed: usize,
    pub exit: SliceExit,
    pub next: NextSlice<K>,
}

impl<K> SliceReport<K> {
    /// Checkpoint to resume from, if a continuation is wanted.
    pub fn checkpoint(&self) -> Option<&K> {
        match &self.next {
            NextSlice::Resume(key) => key.as_ref(),
            _ => None,
        }
    }
}

/// Processes the next slice of `source` after `checkpoint`.
///
/// Reads at most `batch_size` items with a key greater than `checkpoint` and
/// hands them to `process` one at a time. The checkpoint only advances past an
/// item once `process` returned `Ok` for it, so a slice that stops early for
/// any reason resumes at the first item that was not fully processed.
pub fn next_slice<S, F>(
    source: &S,
    checkpoint: Option<S::Key>,
    batch_size: usize,
    timekeeper: &Timekeeper,
    mut process: F,
) -> Result<SliceReport<S::Key>>
where
    S: BatchSource + ?Sized,
    F: FnMut(&S::Item, &Timekeeper) -> Result<(), TaskError>,
{
    if batch_size == 0 {
        bail!("Batch size must be positive");
    }

    if timekeeper.is_exhausted() {
        return Ok(SliceReport {
            processed: 0,
            exit: SliceExit::DeadlineHit,
            next: NextSlice::Resume(checkpoint),
        });
    }

    let items = source.fetch_after(checkpoint.as_ref(), batch_size)?;
    let fetched = items.len();
    let mut last_done = checkpoint;
    let mut processed = 0;

    for step in timekeeper.iterate(items.iter()) {
        let Ok((_, item)) = step else {
            return Ok(stopped(processed, SliceExit::DeadlineHit, last_done));
        };

        match process(item, timekeeper) {
            Ok(()) => {
                last_done = Some(source.key_of(item));
                processed += 1;
            }
            Err(TaskError::DeadlineExceeded) => {
                return Ok(stopped(processed, SliceExit::DeadlineHit, last_done));
            }
            Err(TaskError::Transient(reason)) => {
                debug!("Slice item failed after {} processed: {}", processed, reason);
                return Ok(stopped(processed, SliceExit::ItemFailed(reason), last_done));
            }
            Err(TaskError::Fatal(reason)) => {
                return Ok(SliceReport {
                    processed,
                    exit: SliceExit::ItemFatal(reason),
                    next: NextSlice::Abandon,
                });
            }
        }
    }

    if fetched < batch_size {
        Ok(SliceReport {
            processed,
            exit: SliceExit::Drained,
            next: NextSlice::Done,
        })
    } else {
        Ok(stopped(processed, SliceExit::BatchFull, last_done))
    }
}

fn stopped<K>(processed: usize, exit: SliceExit, last_done: Option<K>) -> SliceReport<K> {
    SliceReport {
        processed,
        exit,
        next: NextSlice::Resume(last_done),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timekeeper::ManualClock;
    use std::time::Duration;

    struct Numbers(Vec<u32>);

    impl BatchSource for Numbers {
        type Item = u32;
        type Key = u32;

        fn fetch_after(&self, after: Option<&u32>, limit: usize) -> Result<Vec<u32>> {
            Ok(self
                .0
                .iter()
                .copied()
                .filter(|n| after.map_or(true, |a| n > a))
                .take(limit)
                .collect())
        }

        fn key_of(&self, item: &u32) -> u32 {
            *item
        }
    }

    fn generous() -> Timekeeper {
        Timekeeper::new(Duration::from_secs(60))
    }

    #[test]
    fn test_transient_item_resumes_at_failed_item() {
        let source = Numbers((1..=10).collect());
        let report = next_slice(&source, None, 5, &generous(), |n, _| {
            if *n == 3 {
                Err(TaskError::transient("flaky"))
            } else {
                Ok(())
            }
        })
        .unwrap();

        assert_eq!(report.processed, 2);
        assert_eq!(report.exit, SliceExit::ItemFailed("flaky".to_string()));
        assert_eq!(report.next, NextSlice::Resume(Some(2)));
    }

    #[test]
    fn test_fatal_item_abandons() {
        let source = Numbers((1..=10).collect());
        let report = next_slice(&source, Some(4), 5, &generous(), |n, _| {
            if *n == 6 {
                Err(TaskError::fatal("corrupt"))
            } else {
                Ok(())
            }
        })
        .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.next, NextSlice::Abandon);
        assert_eq!(report.checkpoint(), None);
    }

    #[test]
    fn test_item_deadline_keeps_last_completed_key() {
        let source = Numbers((1..=10).collect());
        let report = next_slice(&source, None, 10, &generous(), |n, _| {
            if *n == 2 {
                Err(TaskError::DeadlineExceeded)
            } else {
                Ok(())
            }
        })
        .unwrap();

        assert_eq!(report.exit, SliceExit::DeadlineHit);
        assert_eq!(report.next, NextSlice::Resume(Some(1)));
    }

    #[test]
    fn test_spent_guard_returns_incoming_checkpoint_without_reading() {
        let clock = ManualClock::new();
        let timekeeper = Timekeeper::with_clock(Duration::from_millis(5), Arc::new(clock.clone()));
        clock.advance(Duration::from_millis(5));

        let source = Numbers((1..=10).collect());
        let report = next_slice(&source, Some(7), 3, &timekeeper, |_, _| {
            panic!("nothing should be processed")
        })
        .unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(report.next, NextSlice::Resume(Some(7)));
    }

    #[test]
    fn test_short_batch_spending_budget_on_last_item_is_drained() {
        let clock = ManualClock::new();
        let timekeeper =
            Timekeeper::with_clock(Duration::from_millis(100), Arc::new(clock.clone()));
        let source = Numbers((1..=5).collect());

        let report = next_slice(&source, None, 10, &timekeeper, |_, _| {
            clock.advance(Duration::from_millis(20));
            Ok(())
        })
        .unwrap();

        assert!(timekeeper.is_exhausted());
        assert_eq!(report.processed, 5);
        assert_eq!(report.exit, SliceExit::Drained);
        assert_eq!(report.next, NextSlice::Done);
    }

    #[test]
    fn test_empty_collection_is_drained() {
        let source = Numbers(Vec::new());
        let report = next_slice(&source, None, 10, &generous(), |_, _| Ok(())).unwrap();
        assert_eq!(report.exit, SliceExit::Drained);
        assert_eq!(report.next, NextSlice::Done);
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let source = Numbers(vec![1]);
        assert!(next_slice(&source, None, 0, &generous(), |_, _| Ok(())).is_err());
    }

    #[test]
    fn test_next_slice_map() {
        let next: NextSlice<u32> = NextSlice::Resume(Some(4));
        assert_eq!(next.map(|k| k.to_string()), NextSlice::Resume(Some("4".to_string())));
    }
}
