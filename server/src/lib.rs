pub mod config;
pub mod error;
pub mod metrics;
pub mod validation;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use tts_core::{
    BufferTransport, ChannelTransport, DeliveryMode, EncoderSpec, PipelineError, SpeechModel,
    SpeechPipeline, SpeechRequest, StreamSummary, FRAMING,
};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::metrics::{
    AppMetrics, DetailedMetricsResponse, EndpointMetrics, EndpointMetricsResponse, EndpointStats,
    SystemMetrics,
};
use crate::validation::validate_speech_request;

/// Header naming the framing of an incremental `/speak` body.
pub const FRAMING_HEADER: &str = "x-audio-framing";
/// Chunks buffered between the pipeline and a slow client.
const STREAM_CHANNEL_CAPACITY: usize = 8;

static START_TIME: OnceLock<Instant> = OnceLock::new();

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SpeechPipeline>,
    pub encoder: EncoderSpec,
    pub metrics: AppMetrics,
    pub request_count: Arc<AtomicU64>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(model: Arc<dyn SpeechModel>, config: ServerConfig) -> Self {
        let _ = START_TIME.get_or_init(Instant::now);
        Self {
            pipeline: Arc::new(SpeechPipeline::new(model, config.pipeline_config())),
            encoder: config.encoder_spec(),
            metrics: AppMetrics::new(),
            request_count: Arc::new(AtomicU64::new(0)),
            config,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SpeechRequestBody {
    pub text: String,
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    pub speed: Option<f32>,
}

impl SpeechRequestBody {
    fn into_request(self) -> SpeechRequest {
        SpeechRequest {
            text: self.text,
            sample_rate: self.sample_rate,
            speed: self.speed,
            mode: DeliveryMode::from_stream_flag(self.stream),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub device: String,
    pub sample_rate: u32,
    pub speed: f32,
    pub segment_limit: usize,
    pub framing: String,
}

/// Routes plus the full middleware stack.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    // Rate limiting is global: all clients share one quota, which behaves
    // predictably behind proxies where peer addresses are not meaningful.
    let per_minute = config.rate_limit_per_minute.max(1);
    let governor = GovernorConfigBuilder::default()
        .per_millisecond((60_000 / per_minute as u64).max(1))
        .burst_size(per_minute)
        .key_extractor(GlobalKeyExtractor)
        .finish();

    let api = Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
        .route("/speak", post(speak_endpoint))
        .route("/tts", post(tts_endpoint))
        .route("/metrics", get(metrics_endpoint));

    let router = Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .fallback(not_found)
        .layer(axum::middleware::from_fn(add_request_id));

    let router = match governor {
        Some(conf) => router.layer(GovernorLayer::new(Arc::new(conf))),
        None => {
            warn!("Invalid rate limit configuration, rate limiting disabled");
            router
        }
    };

    // The timeout bounds producing the response head; an incremental body
    // keeps streaming after it.
    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors_layer(config))
        .into_inner();

    router.layer(middleware_stack).with_state(state)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let base = CorsLayer::new()
        .allow_methods(methods)
        .allow_headers(tower_http::cors::Any)
        .expose_headers([header::HeaderName::from_static(FRAMING_HEADER)])
        .allow_credentials(false);

    let Some(allowed_origins) = &config.cors_allowed_origins else {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        return base.allow_origin(tower_http::cors::Any);
    };

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
        base.allow_origin(tower_http::cors::Any)
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        base.allow_origin(tower_http::cors::AllowOrigin::list(origins))
    }
}

/// Tag request and response with a fresh `x-request-id`.
async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = &value {
        request.headers_mut().insert("x-request-id", value.clone());
    }
    let mut response = next.run(request).await;
    if let Some(value) = value {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn not_found(request: Request) -> ApiError {
    ApiError::NotFound(format!("no route for {} {}", request.method(), request.uri().path()))
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let info = state.pipeline.model_info();
    let config = state.pipeline.config();
    Json(HealthResponse {
        status: "ok".to_string(),
        model: info.name,
        device: info.device,
        sample_rate: info.sample_rate,
        speed: config.default_speed,
        segment_limit: config.segment_limit,
        framing: FRAMING.to_string(),
    })
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<DetailedMetricsResponse> {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let cpu_usage = system.global_cpu_info().cpu_usage();
    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);

    let system_load = {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/proc/loadavg").ok().and_then(|loadavg| {
                loadavg
                    .split_whitespace()
                    .next()
                    .and_then(|s| s.parse::<f64>().ok())
            })
        }
        #[cfg(not(unix))]
        None
    };

    Json(DetailedMetricsResponse {
        timestamp: chrono::Utc::now(),
        system: SystemMetrics {
            cpu_usage_percent: cpu_usage,
            memory_used_mb: memory_used / 1024 / 1024,
            memory_total_mb: memory_total / 1024 / 1024,
            memory_usage_percent,
            request_count: state.request_count.load(Ordering::Relaxed),
            uptime_seconds: uptime,
            system_load,
        },
        endpoints: EndpointMetricsResponse {
            speak: EndpointStats::from(&state.metrics.speak),
            tts: EndpointStats::from(&state.metrics.tts),
        },
        pipeline: state.metrics.pipeline.snapshot(),
    })
}

/// WAV delivery: one container, or `wav-l32be` frames when `stream` is set.
pub async fn speak_endpoint(
    State(state): State<AppState>,
    Json(body): Json<SpeechRequestBody>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let result = speak(&state, body).await;
    record_endpoint(&state.metrics.speak, started, &result);
    result
}

async fn speak(state: &AppState, body: SpeechRequestBody) -> Result<Response, ApiError> {
    let req = accept(state, body)?;

    match req.mode {
        DeliveryMode::Buffered => {
            let mut buffer = BufferTransport::default();
            let result = state.pipeline.stream_wav(&req, &mut buffer).await;
            record_pipeline(state, &result);
            result?;
            audio_response(Body::from(buffer.bytes), "audio/wav", "no-store", None)
        }
        DeliveryMode::Incremental => {
            let pipeline = Arc::clone(&state.pipeline);
            let task_state = state.clone();
            let body = stream_body(move |mut transport| async move {
                let result = pipeline.stream_wav(&req, &mut transport).await;
                record_pipeline(&task_state, &result);
                result
            })
            .await?;
            audio_response(body, "application/octet-stream", "no-store", Some(FRAMING))
        }
    }
}

/// Compressed delivery through the external encoder.
pub async fn tts_endpoint(
    State(state): State<AppState>,
    Json(body): Json<SpeechRequestBody>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let result = tts(&state, body).await;
    record_endpoint(&state.metrics.tts, started, &result);
    result
}

async fn tts(state: &AppState, body: SpeechRequestBody) -> Result<Response, ApiError> {
    let req = accept(state, body)?;
    let content_type = state.encoder.content_type.clone();

    match req.mode {
        DeliveryMode::Buffered => {
            let mut buffer = BufferTransport::default();
            let result = state
                .pipeline
                .stream_encoded(&req, &state.encoder, &mut buffer)
                .await;
            record_pipeline(state, &result);
            result?;
            audio_response(Body::from(buffer.bytes), &content_type, "no-cache", None)
        }
        DeliveryMode::Incremental => {
            let pipeline = Arc::clone(&state.pipeline);
            let encoder = state.encoder.clone();
            let task_state = state.clone();
            let body = stream_body(move |mut transport| async move {
                let result = pipeline
                    .stream_encoded(&req, &encoder, &mut transport)
                    .await;
                record_pipeline(&task_state, &result);
                result
            })
            .await?;
            audio_response(body, &content_type, "no-cache", None)
        }
    }
}

fn accept(state: &AppState, body: SpeechRequestBody) -> Result<SpeechRequest, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    validate_speech_request(
        &body.text,
        body.sample_rate,
        body.speed,
        state.config.max_text_length,
    )?;
    debug!(
        chars = body.text.chars().count(),
        stream = body.stream,
        sample_rate = ?body.sample_rate,
        speed = ?body.speed,
        "Speech request accepted"
    );
    Ok(body.into_request())
}

/// Run `job` in the background and turn its output into a response body.
///
/// The response is committed only once the first chunk exists, so a
/// failure before any audio is produced still becomes a normal error
/// response. Later failures arrive as a body error and reset the stream.
async fn stream_body<F, Fut>(job: F) -> Result<Body, ApiError>
where
    F: FnOnce(ChannelTransport) -> Fut,
    Fut: Future<Output = Result<StreamSummary, PipelineError>> + Send + 'static,
{
    let (transport, mut rx) = ChannelTransport::new(STREAM_CHANNEL_CAPACITY);
    let task = tokio::spawn(job(transport));

    match rx.recv().await {
        Some(Ok(first)) => {
            let head = futures_util::stream::once(async move { Ok::<_, PipelineError>(first) });
            Ok(Body::from_stream(head.chain(ReceiverStream::new(rx))))
        }
        Some(Err(err)) => Err(err.into()),
        None => match task.await {
            Ok(Ok(_)) => Ok(Body::empty()),
            Ok(Err(err)) => Err(err.into()),
            Err(e) => Err(ApiError::InternalError(format!("stream task failed: {e}"))),
        },
    }
}

fn audio_response(
    body: Body,
    content_type: &str,
    cache_control: &'static str,
    framing: Option<&'static str>,
) -> Result<Response, ApiError> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, cache_control);
    if let Some(framing) = framing {
        builder = builder.header(FRAMING_HEADER, framing);
    }
    builder
        .body(body)
        .map_err(|e| ApiError::InternalError(format!("building response: {e}")))
}

fn record_pipeline(state: &AppState, result: &Result<StreamSummary, PipelineError>) {
    match result {
        Ok(summary) => {
            state.metrics.pipeline.record_completed(summary);
            info!(
                units = summary.units,
                chunks = summary.chunks,
                bytes = summary.bytes,
                synthesis_ms = summary.synthesis.as_millis() as u64,
                "Speech delivered"
            );
        }
        Err(err) => state.metrics.pipeline.record_failure(err),
    }
}

fn record_endpoint(metrics: &EndpointMetrics, started: Instant, result: &Result<Response, ApiError>) {
    metrics.record_request(started.elapsed().as_millis() as u64);
    if result.is_err() {
        metrics.record_error();
    }
}
