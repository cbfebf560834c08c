use crate::batch::SliceExit;
use crate::scheduler::DispatchSummary;
use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all scheduler metrics
const PREFIX: &str = "cron";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Job Metrics
    pub static ref JOB_OUTCOMES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_outcomes_total"), "Handled jobs by task and outcome"),
        &["task", "outcome"]
    ).expect("Failed to create job_outcomes_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Time spent inside a task per job"
        )
        .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        &["task"]
    ).expect("Failed to create job_duration_seconds metric");

    pub static ref JOBS_BY_STATUS: IntGaugeVec = IntGaugeVec::new(
        Opts::new(format!("{PREFIX}_jobs"), "Jobs in the store by status"),
        &["status"]
    ).expect("Failed to create jobs metric");

    // Dispatch Metrics
    pub static ref DISPATCH_CYCLES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_dispatch_cycles_total"), "Dispatch cycles by how they ended"),
        &["end"]
    ).expect("Failed to create dispatch_cycles_total metric");

    pub static ref DISPATCHED_JOBS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_dispatched_jobs_total"),
        "Jobs completed by dispatch cycles"
    ).expect("Failed to create dispatched_jobs_total metric");

    // Batch Metrics
    pub static ref SLICES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_slices_total"), "Batch slices by runner and exit"),
        &["runner", "exit"]
    ).expect("Failed to create slices_total metric");

    pub static ref SLICE_ITEMS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_slice_items_total"), "Items fully processed by batch slices"),
        &["runner"]
    ).expect("Failed to create slice_items_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_OUTCOMES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_BY_STATUS.clone()));
    let _ = REGISTRY.register(Box::new(DISPATCH_CYCLES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DISPATCHED_JOBS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SLICES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SLICE_ITEMS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

pub fn record_job_outcome(task: &str, outcome: &str) {
    JOB_OUTCOMES_TOTAL.with_label_values(&[task, outcome]).inc();
}

pub fn record_job_duration(task: &str, duration: Duration) {
    JOB_DURATION_SECONDS
        .with_label_values(&[task])
        .observe(duration.as_secs_f64());
}

pub fn set_jobs_by_status(status: &str, count: usize) {
    JOBS_BY_STATUS
        .with_label_values(&[status])
        .set(count as i64);
}

/// Record the end of a dispatch cycle
pub fn record_dispatch_cycle(summary: &DispatchSummary) {
    let end = if summary.store_error {
        "store_error"
    } else if summary.deadline_hit {
        "deadline"
    } else {
        "complete"
    };
    DISPATCH_CYCLES_TOTAL.with_label_values(&[end]).inc();
    DISPATCHED_JOBS_TOTAL.inc_by(summary.jobs_completed as f64);
}

pub fn record_slice(runner: &str, exit: &SliceExit, processed: usize) {
    let exit = match exit {
        SliceExit::Drained => "drained",
        SliceExit::BatchFull => "batch_full",
        SliceExit::DeadlineHit => "deadline",
        SliceExit::ItemFailed(_) => "item_failed",
        SliceExit::ItemFatal(_) => "item_fatal",
    };
    SLICES_TOTAL.with_label_values(&[runner, exit]).inc();
    SLICE_ITEMS_TOTAL
        .with_label_values(&[runner])
        .inc_by(processed as f64);
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered_and_gathered() {
        init_metrics();
        record_job_outcome("sendMail", "finished");
        record_slice("fanOut", &SliceExit::BatchFull, 10);

        let families = REGISTRY.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"cron_job_outcomes_total".to_string()));
        assert!(names.contains(&"cron_slices_total".to_string()));
    }

    #[test]
    fn test_dispatch_cycle_end_label() {
        init_metrics();
        let before = DISPATCH_CYCLES_TOTAL
            .with_label_values(&["deadline"])
            .get();
        record_dispatch_cycle(&DispatchSummary {
            deadline_hit: true,
            ..Default::default()
        });
        let after = DISPATCH_CYCLES_TOTAL
            .with_label_values(&["deadline"])
            .get();
        assert!(after >= before + 1.0);
    }
}
