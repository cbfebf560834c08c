use crate::batch::ContinuationPump;
use crate::job_store::JobStore;
use crate::scheduler::Dispatcher;
use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;

pub type GuardedJobStore = Arc<dyn JobStore>;
pub type GuardedDispatcher = Arc<Dispatcher>;
pub type GuardedContinuationPump = Arc<ContinuationPump>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub job_store: GuardedJobStore,
    pub dispatcher: GuardedDispatcher,
    pub continuation_pump: GuardedContinuationPump,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        job_store: GuardedJobStore,
        dispatcher: GuardedDispatcher,
        continuation_pump: GuardedContinuationPump,
    ) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            job_store,
            dispatcher,
            continuation_pump,
        }
    }
}

impl FromRef<ServerState> for GuardedJobStore {
    fn from_ref(input: &ServerState) -> Self {
        input.job_store.clone()
    }
}

impl FromRef<ServerState> for GuardedDispatcher {
    fn from_ref(input: &ServerState) -> Self {
        input.dispatcher.clone()
    }
}

impl FromRef<ServerState> for GuardedContinuationPump {
    fn from_ref(input: &ServerState) -> Self {
        input.continuation_pump.clone()
    }
}
