//! Scheduler and router fixtures backed by a temporary SQLite database.

#![allow(dead_code)]

use axum::body::Body;
use axum::Router;
use cron_dispatch::batch::{ContinuationPump, ContinuationRegistry};
use cron_dispatch::job_store::{Job, JobStore, NewJob, SqliteJobStore};
use cron_dispatch::scheduler::{Dispatcher, RetryPolicy, TaskRegistry, TransitionEngine};
use cron_dispatch::server::{make_app, ServerConfig, ServerState};
use cron_dispatch::tasks::{FanOut, LogMessage, FAN_OUT_TASK, LOG_MESSAGE_TASK};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A store, plus whatever is built on it, living in its own temp directory.
pub struct TestScheduler {
    pub store: Arc<SqliteJobStore>,
    pub db_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestScheduler {
    /// Creates an empty database with the given `(name, priority)` groups.
    pub fn with_groups(groups: &[(&str, i64)]) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("scheduler.db");
        let store = Arc::new(SqliteJobStore::new(&db_path).unwrap());
        for (name, priority) in groups {
            store.get_or_create_group(name, *priority, name).unwrap();
        }
        TestScheduler {
            store,
            db_path,
            _temp_dir: temp_dir,
        }
    }

    /// A second, independent connection to the same database file.
    pub fn open_another_store(&self) -> Arc<SqliteJobStore> {
        Arc::new(SqliteJobStore::new(&self.db_path).unwrap())
    }

    pub fn dispatcher(&self, registry: TaskRegistry) -> Dispatcher {
        Dispatcher::new(self.store.clone(), registry, RetryPolicy::default())
    }

    pub fn engine(&self) -> TransitionEngine {
        TransitionEngine::new(self.store.clone(), RetryPolicy::default())
    }

    pub fn add_job(&self, group: &str, task: &str) -> Job {
        self.store.create_job(&NewJob::new(group, task)).unwrap()
    }

    pub fn job(&self, id: i64) -> Job {
        self.store.get_job(id).unwrap().unwrap()
    }

    pub fn add_entities(&self, kind: &str, count: usize) -> Vec<String> {
        let keys: Vec<String> = (1..=count).map(|i| format!("{}{:03}", kind, i)).collect();
        self.store.insert_entity_keys(kind, &keys).unwrap();
        keys
    }

    pub fn continuation_pump(&self, batch_size: usize, retry_delay: Duration) -> ContinuationPump {
        let fan_out = Arc::new(FanOut::new(self.store.clone(), self.store.clone(), batch_size));
        ContinuationPump::new(
            ContinuationRegistry::new().with(fan_out),
            self.store.clone(),
            self.store.clone(),
            retry_delay,
            3,
        )
    }
}

/// The HTTP router wired the way the binary wires it.
pub struct TestApp {
    pub app: Router,
    pub scheduler: TestScheduler,
}

impl TestApp {
    pub fn new() -> Self {
        let scheduler = TestScheduler::with_groups(&[("email", 10), ("convert", 5)]);
        let store = scheduler.store.clone();

        let fan_out = Arc::new(FanOut::new(store.clone(), store.clone(), 10));
        let tasks = TaskRegistry::new()
            .with(LOG_MESSAGE_TASK, Arc::new(LogMessage))
            .with(FAN_OUT_TASK, fan_out.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            tasks,
            RetryPolicy::default(),
        ));
        let pump = Arc::new(ContinuationPump::new(
            ContinuationRegistry::new().with(fan_out),
            store.clone(),
            store.clone(),
            Duration::ZERO,
            3,
        ));

        let config = ServerConfig {
            poke_interval_secs: 0,
            pump_interval_secs: 0,
            ..ServerConfig::default()
        };
        let job_store: Arc<dyn JobStore> = store;
        let state = ServerState::new(config, job_store, dispatcher, pump);

        TestApp {
            app: make_app(state),
            scheduler,
        }
    }
}

pub async fn body_text(body: Body) -> String {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
