use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{log_requests, metrics, state::*};
use crate::job_store::NewJob;
use crate::timekeeper::Timekeeper;

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub tasks: Vec<String>,
    pub batch_tasks: Vec<String>,
}

fn format_uptime(duration: Duration) -> String {
    let secs = duration.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        tasks: state
            .dispatcher
            .registry()
            .names()
            .into_iter()
            .map(String::from)
            .collect(),
        batch_tasks: state
            .continuation_pump
            .registry()
            .names()
            .into_iter()
            .map(String::from)
            .collect(),
    };
    Json(stats)
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> Response {
    error!("{}: {}", context, e);
    (StatusCode::INTERNAL_SERVER_ERROR, context.to_string()).into_response()
}

/// Runs one dispatch cycle and answers with its summary line.
async fn poke(State(state): State<ServerState>) -> Response {
    let timekeeper = Timekeeper::new(state.config.time_budget);
    let dispatcher = state.dispatcher.clone();
    match tokio::task::spawn_blocking(move || dispatcher.poke(&timekeeper)).await {
        Ok(summary) => summary.to_string().into_response(),
        Err(e) => internal_error("Dispatch cycle panicked", e),
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct AddJobQuery {
    /// Reuse an existing job with the same task name and key data.
    unique: bool,
}

async fn add_job(
    State(state): State<ServerState>,
    Query(query): Query<AddJobQuery>,
    Json(new_job): Json<NewJob>,
) -> Response {
    match state.job_store.get_group(&new_job.priority_group) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Unknown priority group: {}", new_job.priority_group),
            )
                .into_response()
        }
        Err(e) => return internal_error("Failed to look up priority group", e),
    }
    if !state.dispatcher.registry().contains(&new_job.task_name) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Unknown task: {}", new_job.task_name),
        )
            .into_response();
    }

    let created = if query.unique {
        state.job_store.create_job_unique(&new_job)
    } else {
        state.job_store.create_job(&new_job).map(|job| (job, true))
    };
    match created {
        Ok((job, true)) => {
            info!(
                "Created job {} ({} in {})",
                job.id, job.task_name, job.priority_group
            );
            (StatusCode::CREATED, Json(job)).into_response()
        }
        Ok((job, false)) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => internal_error("Failed to create job", e),
    }
}

async fn get_job(State(job_store): State<GuardedJobStore>, Path(id): Path<i64>) -> Response {
    match job_store.get_job(id) {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error("Failed to read job", e),
    }
}

async fn get_groups(State(job_store): State<GuardedJobStore>) -> Response {
    match job_store.list_groups_by_priority() {
        Ok(groups) => Json(groups).into_response(),
        Err(e) => internal_error("Failed to list priority groups", e),
    }
}

async fn get_stats(State(job_store): State<GuardedJobStore>) -> Response {
    match job_store.count_jobs_by_status() {
        Ok(counts) => {
            let mut by_status = BTreeMap::new();
            for (status, count) in counts {
                metrics::set_jobs_by_status(status.as_str(), count);
                by_status.insert(status.as_str(), count);
            }
            Json(by_status).into_response()
        }
        Err(e) => internal_error("Failed to count jobs", e),
    }
}

#[derive(Deserialize)]
struct StartBatchBody {
    runner: String,
    #[serde(default)]
    params: JsonValue,
}

#[derive(Serialize)]
struct StartBatchResponse {
    id: i64,
}

async fn start_continuation(
    State(pump): State<GuardedContinuationPump>,
    Json(body): Json<StartBatchBody>,
) -> Response {
    if pump.registry().get(&body.runner).is_none() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Unknown batch task: {}", body.runner),
        )
            .into_response();
    }
    match pump.start(&body.runner, body.params) {
        Ok(id) => (StatusCode::CREATED, Json(StartBatchResponse { id })).into_response(),
        Err(e) => internal_error("Failed to queue batch task", e),
    }
}

/// Delivers due continuations, one slice each.
async fn run_continuations(State(state): State<ServerState>) -> Response {
    let timekeeper = Timekeeper::new(state.config.pump_time_budget);
    let pump = state.continuation_pump.clone();
    let limit = state.config.pump_max_deliveries;
    match tokio::task::spawn_blocking(move || pump.run_due(&timekeeper, limit)).await {
        Ok(Ok(summary)) => Json(summary).into_response(),
        Ok(Err(e)) => internal_error("Continuation pump failed", format!("{:#}", e)),
        Err(e) => internal_error("Continuation pump panicked", e),
    }
}

pub fn make_app(state: ServerState) -> Router {
    let cron_routes: Router = Router::new()
        .route("/poke", get(poke).post(poke))
        .route("/jobs", post(add_job))
        .route("/jobs/{id}", get(get_job))
        .route("/groups", get(get_groups))
        .route("/stats", get(get_stats))
        .with_state(state.clone());

    let task_routes: Router = Router::new()
        .route("/continuations", post(start_continuation))
        .route("/continuations/run", post(run_continuations))
        .with_state(state.clone());

    let app: Router = Router::new()
        .route("/", get(home))
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(state.clone())
        .nest("/cron", cron_routes)
        .nest("/tasks", task_routes);

    app.layer(middleware::from_fn_with_state(state, log_requests))
}

/// Runs `tick` every `interval` until `shutdown` fires. The first tick is
/// skipped so the loop waits one interval after startup.
fn spawn_ticker<F>(
    name: &'static str,
    interval: Duration,
    shutdown: CancellationToken,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("{} tick", name);
                    let tick = tick.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || tick()).await {
                        error!("{} tick panicked: {}", name, e);
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("{} loop stopped", name);
                    break;
                }
            }
        }
    })
}

/// Starts the periodic dispatch loop and continuation pump configured in
/// `state`. An interval of 0 leaves the corresponding loop off.
pub fn spawn_background_loops(
    state: &ServerState,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let config = &state.config;

    if config.poke_interval_secs > 0 {
        info!(
            "Dispatch loop every {}s with a {:?} budget",
            config.poke_interval_secs, config.time_budget
        );
        let dispatcher = state.dispatcher.clone();
        let budget = config.time_budget;
        handles.push(spawn_ticker(
            "Dispatch",
            Duration::from_secs(config.poke_interval_secs),
            shutdown.clone(),
            move || {
                dispatcher.poke(&Timekeeper::new(budget));
            },
        ));
    }

    if config.pump_interval_secs > 0 {
        info!(
            "Continuation pump every {}s with a {:?} budget",
            config.pump_interval_secs, config.pump_time_budget
        );
        let pump = state.continuation_pump.clone();
        let budget = config.pump_time_budget;
        let limit = config.pump_max_deliveries;
        handles.push(spawn_ticker(
            "Continuation pump",
            Duration::from_secs(config.pump_interval_secs),
            shutdown,
            move || {
                if let Err(e) = pump.run_due(&Timekeeper::new(budget), limit) {
                    error!("Continuation pump failed: {:#}", e);
                }
            },
        ));
    }

    handles
}

pub async fn run_server(state: ServerState, shutdown: CancellationToken) -> Result<()> {
    let port = state.config.port;
    let background = spawn_background_loops(&state, shutdown.clone());
    let app = make_app(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Listening on 127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    for handle in background {
        let _ = handle.await;
    }
    Ok(())
}
