//! Metrics for the serving system, following Prometheus naming
//! conventions. All metric names live in one enum so call sites never
//! carry magic strings.

use std::fmt;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::info;

/// Every metric name used by the serving system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Serving boundary
    RequestsSuccess,
    RequestsError,
    RequestDuration,
    RequestPayloadBytes,
    ResponseBytes,

    // Pipeline execution
    PipelineExecutions,
    PipelineFailures,
    StepDuration,

    // Model runner
    InferenceCalls,
    InferenceTimeouts,
    InferenceQueueWait,

    // Script runner
    ScriptTransforms,
    ScriptTransformFailures,
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricName::RequestsSuccess => "serving_requests_success_total",
            MetricName::RequestsError => "serving_requests_error_total",
            MetricName::RequestDuration => "serving_request_duration_seconds",
            MetricName::RequestPayloadBytes => "serving_request_payload_bytes",
            MetricName::ResponseBytes => "serving_response_bytes",
            MetricName::PipelineExecutions => "serving_pipeline_executions_total",
            MetricName::PipelineFailures => "serving_pipeline_failures_total",
            MetricName::StepDuration => "serving_step_duration_seconds",
            MetricName::InferenceCalls => "serving_inference_calls_total",
            MetricName::InferenceTimeouts => "serving_inference_timeouts_total",
            MetricName::InferenceQueueWait => "serving_inference_queue_wait_seconds",
            MetricName::ScriptTransforms => "serving_script_transforms_total",
            MetricName::ScriptTransformFailures => "serving_script_transform_failures_total",
        };
        write!(f, "{name}")
    }
}

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Installs the Prometheus recorder once and returns the scrape handle.
/// Later calls return the already-installed handle.
pub fn install_recorder() -> &'static PrometheusHandle {
    PROMETHEUS.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install prometheus recorder");
        info!("prometheus metrics recorder installed");
        handle
    })
}

pub fn request_success() {
    metrics::counter!(MetricName::RequestsSuccess.to_string()).increment(1);
}

pub fn request_error(kind: &'static str) {
    metrics::counter!(MetricName::RequestsError.to_string(), "kind" => kind).increment(1);
}

pub fn request_duration(seconds: f64) {
    metrics::histogram!(MetricName::RequestDuration.to_string()).record(seconds);
}

pub fn request_payload_bytes(bytes: u64) {
    metrics::histogram!(MetricName::RequestPayloadBytes.to_string()).record(bytes as f64);
}

pub fn response_bytes(bytes: u64) {
    metrics::histogram!(MetricName::ResponseBytes.to_string()).record(bytes as f64);
}

pub fn pipeline_execution() {
    metrics::counter!(MetricName::PipelineExecutions.to_string()).increment(1);
}

pub fn pipeline_failure(kind: &'static str) {
    metrics::counter!(MetricName::PipelineFailures.to_string(), "kind" => kind).increment(1);
}
