//! End-to-end tests for claiming, handling and dispatching jobs against a
//! real SQLite database.

mod common;

use common::*;
use cron_dispatch::job_store::{JobStatus, JobStore, NewJob};
use cron_dispatch::scheduler::{
    HandleOutcome, RetryPolicy, TaskRegistry, Transition, TransitionEngine,
};
use cron_dispatch::timekeeper::{ManualClock, Timekeeper};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn generous() -> Timekeeper {
    Timekeeper::new(Duration::from_secs(60))
}

/// A 60s guard on `clock`, for jobs of the registry built with the same clock.
fn on_clock(clock: &ManualClock) -> Timekeeper {
    Timekeeper::with_clock(Duration::from_secs(60), Arc::new(clock.clone()))
}

fn standard_registry(clock: &ManualClock) -> TaskRegistry {
    TaskRegistry::new()
        .with(ALWAYS_OK, Arc::new(always_ok))
        .with(ALWAYS_TRANSIENT, Arc::new(always_transient))
        .with(ALWAYS_FATAL, Arc::new(always_fatal))
        .with(EXCEEDS_DEADLINE, Arc::new(exceeds_deadline(clock.clone())))
}

#[test]
fn test_second_claim_is_already_taken() {
    let t = TestScheduler::with_groups(&[("email", 10)]);
    let engine = t.engine();
    let job = t.add_job("email", ALWAYS_OK);

    assert!(engine.claim(job.id).unwrap().is_applied());
    assert_eq!(
        engine.claim(job.id).unwrap(),
        Transition::Skipped {
            current: JobStatus::Started
        }
    );
    assert_eq!(t.job(job.id).status, JobStatus::Started);
}

#[test]
fn test_concurrent_claims_on_separate_connections_pick_one_winner() {
    let t = TestScheduler::with_groups(&[("email", 10)]);

    for _ in 0..10 {
        let job = t.add_job("email", ALWAYS_OK);
        let id = job.id;
        let stores = [t.open_another_store(), t.open_another_store()];
        let barrier = Arc::new(Barrier::new(stores.len()));

        let handles: Vec<_> = stores
            .into_iter()
            .map(|store| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let engine = TransitionEngine::new(store, RetryPolicy::default());
                    barrier.wait();
                    engine.claim(id).unwrap()
                })
            })
            .collect();

        let applied = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Transition::is_applied)
            .count();
        assert_eq!(applied, 1);

        let stored = t.job(job.id);
        assert_eq!(stored.status, JobStatus::Started);
        assert_eq!(stored.version, job.version + 1);
    }
}

#[test]
fn test_handle_of_claimed_job_does_not_run_task() {
    let t = TestScheduler::with_groups(&[("email", 10)]);
    let dispatcher = t.dispatcher(standard_registry(&ManualClock::new()));
    let job = t.add_job("email", ALWAYS_FATAL);
    dispatcher.engine().claim(job.id).unwrap();

    assert!(dispatcher.handle(job.id, &generous()));
    let stored = t.job(job.id);
    assert_eq!(stored.status, JobStatus::Started);
    assert_eq!(stored.errors, 0);
}

#[test]
fn test_handle_of_missing_job_is_already_taken() {
    let t = TestScheduler::with_groups(&[("email", 10)]);
    let dispatcher = t.dispatcher(standard_registry(&ManualClock::new()));

    assert_eq!(
        dispatcher.handle_job(4242, &generous()),
        HandleOutcome::AlreadyTaken
    );
}

#[test]
fn test_unknown_task_is_aborted_without_error_count() {
    let t = TestScheduler::with_groups(&[("email", 10)]);
    let dispatcher = t.dispatcher(standard_registry(&ManualClock::new()));
    let job = t.add_job("email", "noSuchTask");

    assert!(dispatcher.handle(job.id, &generous()));
    let stored = t.job(job.id);
    assert_eq!(stored.status, JobStatus::Aborted);
    assert_eq!(stored.errors, 0);
}

#[test]
fn test_transient_failure_under_budget_goes_back_to_waiting() {
    let t = TestScheduler::with_groups(&[("email", 10)]);
    let dispatcher = t.dispatcher(standard_registry(&ManualClock::new()));
    let job = t.add_job("email", ALWAYS_TRANSIENT);

    let engine = t.engine();
    for _ in 0..4 {
        engine.claim(job.id).unwrap();
        engine.fail(job.id).unwrap();
    }
    let stored = t.job(job.id);
    assert_eq!(stored.status, JobStatus::Waiting);
    assert_eq!(stored.errors, 4);

    assert!(dispatcher.handle(job.id, &generous()));
    let stored = t.job(job.id);
    assert_eq!(stored.status, JobStatus::Waiting);
    assert_eq!(stored.errors, 5);

    assert_eq!(
        dispatcher.handle_job(job.id, &generous()),
        HandleOutcome::Aborted
    );
    let stored = t.job(job.id);
    assert_eq!(stored.status, JobStatus::Aborted);
    assert_eq!(stored.errors, 6);
}

#[test]
fn test_fatal_failure_aborts() {
    let t = TestScheduler::with_groups(&[("email", 10)]);
    let dispatcher = t.dispatcher(standard_registry(&ManualClock::new()));
    let job = t.add_job("email", ALWAYS_FATAL);

    assert!(dispatcher.handle(job.id, &generous()));
    let stored = t.job(job.id);
    assert_eq!(stored.status, JobStatus::Aborted);
    assert_eq!(stored.errors, 0);
}

#[test]
fn test_deadline_inside_task_frees_job_and_stops_cycle() {
    let t = TestScheduler::with_groups(&[("email", 10)]);
    let clock = ManualClock::new();
    let dispatcher = t.dispatcher(standard_registry(&clock));
    let job = t.add_job("email", EXCEEDS_DEADLINE);
    let timekeeper = on_clock(&clock);

    assert!(!dispatcher.handle(job.id, &timekeeper));
    assert!(timekeeper.is_exhausted());
    let stored = t.job(job.id);
    assert_eq!(stored.status, JobStatus::Waiting);
    assert_eq!(stored.errors, 0);
}

#[test]
fn test_poke_runs_groups_by_descending_priority_until_budget_ends() {
    let t = TestScheduler::with_groups(&[("low", 1), ("high", 10), ("mid", 5)]);
    let clock = ManualClock::new();
    let dispatcher = t.dispatcher(
        TaskRegistry::new().with("slow", Arc::new(spends(clock.clone(), Duration::from_millis(60)))),
    );
    let low = t.add_job("low", "slow");
    let mid = t.add_job("mid", "slow");
    let high = t.add_job("high", "slow");

    let timekeeper = Timekeeper::with_clock(Duration::from_millis(100), Arc::new(clock.clone()));
    let summary = dispatcher.poke(&timekeeper);

    assert_eq!(summary.groups_completed, 1);
    assert_eq!(summary.jobs_completed, 1);
    assert!(summary.deadline_hit);
    assert_eq!(summary.to_string(), "Completed 1 jobs in 1 priority groups.");

    assert_eq!(t.job(high.id).status, JobStatus::Finished);
    let mid = t.job(mid.id);
    assert_eq!(mid.status, JobStatus::Waiting);
    assert_eq!(mid.errors, 0);
    assert_eq!(t.job(low.id).status, JobStatus::Waiting);
}

#[test]
fn test_poke_handles_every_outcome_in_one_cycle() {
    let t = TestScheduler::with_groups(&[("email", 10), ("convert", 5)]);
    let dispatcher = t.dispatcher(standard_registry(&ManualClock::new()));
    let ok = t.add_job("email", ALWAYS_OK);
    let flaky = t.add_job("email", ALWAYS_TRANSIENT);
    let broken = t.add_job("convert", ALWAYS_FATAL);
    let unknown = t.add_job("convert", "noSuchTask");

    let summary = dispatcher.poke(&generous());

    assert_eq!(summary.groups_completed, 2);
    assert_eq!(summary.jobs_completed, 4);
    assert_eq!(summary.finished, 1);
    assert_eq!(summary.retrying, 1);
    assert_eq!(summary.aborted, 1);
    assert_eq!(summary.unknown_task, 1);
    assert!(!summary.deadline_hit);

    assert_eq!(t.job(ok.id).status, JobStatus::Finished);
    assert_eq!(t.job(flaky.id).status, JobStatus::Waiting);
    assert_eq!(t.job(broken.id).status, JobStatus::Aborted);
    assert_eq!(t.job(unknown.id).status, JobStatus::Aborted);
}

#[test]
fn test_poke_stops_at_first_deadline_job() {
    let t = TestScheduler::with_groups(&[("email", 10), ("convert", 5)]);
    let clock = ManualClock::new();
    let dispatcher = t.dispatcher(standard_registry(&clock));
    let first = t.add_job("email", EXCEEDS_DEADLINE);
    let second = t.add_job("email", ALWAYS_OK);
    let other = t.add_job("convert", ALWAYS_OK);

    let summary = dispatcher.poke(&on_clock(&clock));

    assert!(summary.deadline_hit);
    assert_eq!(summary.jobs_completed, 0);
    assert_eq!(summary.groups_completed, 0);
    assert_eq!(t.job(first.id).status, JobStatus::Waiting);
    assert_eq!(t.job(second.id).status, JobStatus::Waiting);
    assert_eq!(t.job(other.id).status, JobStatus::Waiting);
}

#[test]
fn test_poke_skips_terminal_and_started_jobs() {
    let t = TestScheduler::with_groups(&[("email", 10)]);
    let dispatcher = t.dispatcher(standard_registry(&ManualClock::new()));
    let started = t.add_job("email", ALWAYS_OK);
    dispatcher.engine().claim(started.id).unwrap();
    let finished = t.add_job("email", ALWAYS_OK);
    dispatcher.handle(finished.id, &generous());

    let summary = dispatcher.poke(&generous());

    assert_eq!(summary.jobs_completed, 0);
    assert_eq!(summary.groups_completed, 1);
    assert_eq!(t.job(started.id).status, JobStatus::Started);
}

#[test]
fn test_unique_creation_reuses_existing_job() {
    let t = TestScheduler::with_groups(&[("email", 10)]);
    let new_job = NewJob::new("email", ALWAYS_OK).with_key_data(["user", "42"]);

    let (first, created) = t.store.create_job_unique(&new_job).unwrap();
    assert!(created);
    let (second, created) = t.store.create_job_unique(&new_job).unwrap();
    assert!(!created);
    assert_eq!(first.id, second.id);
}
