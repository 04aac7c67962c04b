use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus scrape endpoint: pipeline counters, inference and persist
/// latency histograms, accelerator slot gauge.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the worker emits.
pub fn describe() {
    metrics::describe_counter!("frames_received_total", "Frame-jobs taken from the queue");
    metrics::describe_counter!(
        "frames_terminal_total",
        "Frame-jobs that reached a terminal state, by outcome"
    );
    metrics::describe_counter!("frames_dead_lettered_total", "Frame-jobs dead-lettered, by failure kind");
    metrics::describe_counter!("frame_retries_total", "Failed attempts scheduled for retry, by failure kind");
    metrics::describe_counter!(
        "frame_conflicts_total",
        "Redelivered frames that were already processed"
    );
    metrics::describe_counter!(
        "frame_ack_failures_total",
        "Deliveries whose ack still failed after every try"
    );
    metrics::describe_counter!("frame_status_failures_total", "Status replies that could not be published");
    metrics::describe_histogram!("inference_seconds", "Detector latency per frame while holding a slot");
    metrics::describe_histogram!("persist_seconds", "Time to commit one frame's results");
    metrics::describe_gauge!("inference_slots_in_use", "Accelerator slots currently held");
}
