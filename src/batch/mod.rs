//! Checkpointed batch processing.
//!
//! Unbounded collections are walked in slices that each fit in one time
//! budget. A slice reports the key of the last item it fully processed; the
//! next slice starts strictly after it, carried by a [`Continuation`].

mod continuation;
mod pump;
mod runner;

pub use continuation::{
    follow_up, BatchTask, CheckpointedBatch, Continuation, ContinuationQueue,
    ContinuationRegistry,
};
pub use pump::{ContinuationPump, PumpSummary};
pub use runner::{next_slice, BatchSource, EntityKeys, NextSlice, SliceExit, SliceReport};
