use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{FromRequest, Multipart},
    http::{header::CONTENT_TYPE, Method, Request, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use chrono::Utc;
use hyper::Server;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::codec::{archive, npy};
use crate::config::{OutputFormat, ServingConfig};
use crate::error::{Result, ServingError};
use crate::observability::metrics as obs;
use crate::pipeline::executor::PipelineExecutor;
use crate::pipeline::Batch;
use crate::record::{NdArray, Record, Value};
use crate::schema::Schema;

/// Shared server state: the compiled pipeline plus serving parameters.
pub struct AppState {
    pub executor: PipelineExecutor,
    pub serving: ServingConfig,
}

#[derive(Serialize)]
struct ErrorPayload {
    error: &'static str,
    message: String,
    timestamp: chrono::DateTime<Utc>,
}

fn error_response(err: &ServingError) -> Response {
    let status = match err {
        ServingError::Codec(_) | ServingError::EmptyRecord(_) => StatusCode::BAD_REQUEST,
        ServingError::InferenceTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ServingError::RunnerClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    obs::request_error(err.kind());
    (
        status,
        Json(ErrorPayload {
            error: err.kind(),
            message: err.to_string(),
            timestamp: Utc::now(),
        }),
    )
        .into_response()
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "inference-serving",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Prometheus scrape endpoint
async fn metrics_handler() -> impl IntoResponse {
    obs::install_recorder().render()
}

/// Builds one record carrying a single ndarray column named after the
/// input it is aligned to.
fn array_record(name: &str, array: NdArray) -> Result<Record> {
    let schema = Schema::builder().ndarray(name, array.shape.clone()).build()?;
    let mut values = HashMap::new();
    values.insert(name.to_string(), Value::NdArray(array));
    Record::new(schema, values)
}

/// Aligns request payloads to the first step's declared input names: named
/// multipart parts match by name; a raw body serves a single-input
/// pipeline.
fn build_input_batch(
    input_names: &[String],
    mut parts: Vec<(String, Bytes)>,
    raw_body: Option<Bytes>,
) -> Result<Batch> {
    if input_names.is_empty() {
        return Err(ServingError::Configuration(
            "pipeline declares no inputs".to_string(),
        ));
    }
    let mut records = Vec::with_capacity(input_names.len());
    for name in input_names {
        let named = parts
            .iter()
            .position(|(n, _)| n == name)
            .map(|index| parts.swap_remove(index).1);
        // A raw body, or a single anonymous part, serves a single-input
        // pipeline; multi-input pipelines need one named part per input.
        let fallback = || {
            if input_names.len() != 1 {
                return None;
            }
            raw_body.clone().or_else(|| {
                if parts.len() == 1 {
                    parts.first().map(|(_, b)| b.clone())
                } else {
                    None
                }
            })
        };
        let payload = match named.or_else(fallback) {
            Some(bytes) => bytes,
            None => {
                return Err(ServingError::Codec(format!(
                    "request carries no payload for input '{name}'"
                )))
            }
        };
        obs::request_payload_bytes(payload.len() as u64);
        let array = npy::decode(&payload)?;
        records.push(array_record(name, array)?);
    }
    Batch::new(input_names.to_vec(), records)
}

/// Extracts the ordered `(name, array)` pairs of the final batch.
fn output_arrays(batch: &Batch) -> Result<Vec<(String, NdArray)>> {
    let mut outputs = Vec::with_capacity(batch.len());
    for (name, record) in batch.names().iter().zip(batch.records()) {
        let array = match record.get(name) {
            Some(Value::NdArray(array)) => array.clone(),
            _ => {
                let mut arrays = record.values().values().filter_map(|v| match v {
                    Value::NdArray(a) => Some(a),
                    _ => None,
                });
                match (arrays.next(), arrays.next()) {
                    (Some(array), None) => array.clone(),
                    _ => {
                        return Err(ServingError::Codec(format!(
                            "output '{name}' carries no unambiguous ndarray value"
                        )))
                    }
                }
            }
        };
        outputs.push((name.clone(), array));
    }
    Ok(outputs)
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    name: &'a str,
    array: &'a NdArray,
}

fn encode_response(format: OutputFormat, outputs: &[(String, NdArray)]) -> Result<Response> {
    match format {
        OutputFormat::Numpy => {
            let bytes = archive::encode_outputs(outputs)?;
            obs::response_bytes(bytes.len() as u64);
            Ok((
                StatusCode::OK,
                [(CONTENT_TYPE, "application/zip")],
                bytes,
            )
                .into_response())
        }
        OutputFormat::Json => {
            let body: Vec<JsonOutput<'_>> = outputs
                .iter()
                .map(|(name, array)| JsonOutput { name, array })
                .collect();
            Ok(Json(body).into_response())
        }
    }
}

async fn run_pipeline(state: &AppState, batch: Batch) -> Result<Response> {
    let produced = state.executor.execute(batch).await?;
    obs::pipeline_execution();
    let outputs = output_arrays(&produced)?;
    encode_response(state.serving.output_format, &outputs)
}

/// `POST /nd4j/numpy`: raw npy body (single-input pipelines) or multipart
/// with one named npy part per declared input. Success is a zip archive
/// with one entry per declared output name, in declared order.
async fn numpy_handler(
    Extension(state): Extension<Arc<AppState>>,
    req: Request<Body>,
) -> Response {
    let request_id = Uuid::new_v4();
    let span = info_span!("predict", %request_id);
    let started = Instant::now();

    let result = async {
        let is_multipart = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("multipart/form-data"))
            .unwrap_or(false);

        let (parts, raw_body) = if is_multipart {
            let mut multipart = Multipart::from_request(req, &()).await.map_err(|e| {
                ServingError::Codec(format!("malformed multipart request: {e}"))
            })?;
            let mut parts = Vec::new();
            while let Some(field) = multipart
                .next_field()
                .await
                .map_err(|e| ServingError::Codec(format!("multipart read: {e}")))?
            {
                let name = field.name().unwrap_or("").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServingError::Codec(format!("multipart part '{name}': {e}")))?;
                parts.push((name, bytes));
            }
            (parts, None)
        } else {
            let bytes = hyper::body::to_bytes(req.into_body())
                .await
                .map_err(|e| ServingError::Codec(format!("body read: {e}")))?;
            (Vec::new(), Some(bytes))
        };

        let batch = build_input_batch(&state.executor.input_names(), parts, raw_body)?;
        run_pipeline(&state, batch).await
    }
    .instrument(span)
    .await;

    obs::request_duration(started.elapsed().as_secs_f64());
    match result {
        Ok(response) => {
            obs::request_success();
            response
        }
        Err(err) => {
            error!(%request_id, kind = err.kind(), "request failed: {err}");
            if !err.is_build_time() {
                obs::pipeline_failure(err.kind());
            }
            error_response(&err)
        }
    }
}

/// Create the HTTP server with all routes.
pub fn create_server(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/nd4j/numpy", post(numpy_handler))
        .layer(Extension(state))
        .layer(ServiceBuilder::new().layer(cors))
}

/// Start the HTTP server on the configured port.
pub async fn start_server(state: Arc<AppState>) -> anyhow::Result<()> {
    obs::install_recorder();
    let port = state.serving.http_port;
    let app = create_server(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "inference server listening");
    println!("🚀 Inference server running on http://localhost:{port}");
    println!("💚 Health check: http://localhost:{port}/health");
    println!("📈 Metrics:      http://localhost:{port}/metrics");
    println!("🔮 Predict:      POST http://localhost:{port}/nd4j/numpy");

    Server::bind(&addr).serve(app.into_make_service()).await?;

    Ok(())
}
