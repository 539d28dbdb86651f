//! Common utilities for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use serde_json::Value;
use server::{build_router, config::ServerConfig, AppState};
use tower::ServiceExt;
use tts_core::{ModelInfo, SpeechModel, ToneModel, Waveform};

pub const TEST_SAMPLE_RATE: u32 = 16_000;

/// Config with `cat` standing in for the MP3 encoder.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        encoder: "cat".to_string(),
        encoder_args: Some(Vec::new()),
        sample_rate: TEST_SAMPLE_RATE,
        ..ServerConfig::default()
    }
}

pub fn create_test_app() -> Router {
    create_app_with(Arc::new(ToneModel::new(TEST_SAMPLE_RATE)), test_config())
}

pub fn create_app_with(model: Arc<dyn SpeechModel>, config: ServerConfig) -> Router {
    build_router(AppState::new(model, config))
}

/// Tone model that fails on one specific call, or just takes its time.
pub struct FlakyModel {
    inner: ToneModel,
    calls: AtomicUsize,
    fail_on: usize,
    delay: Duration,
}

impl FlakyModel {
    pub fn failing_on(call: usize) -> Self {
        Self {
            inner: ToneModel::new(TEST_SAMPLE_RATE),
            calls: AtomicUsize::new(0),
            fail_on: call,
            delay: Duration::ZERO,
        }
    }

    /// Never fails; every call sleeps for `delay` first.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::failing_on(0)
        }
    }
}

impl SpeechModel for FlakyModel {
    fn synthesize(&self, text: &str) -> anyhow::Result<Waveform> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if call == self.fail_on {
            anyhow::bail!("voice failed on call {call}");
        }
        self.inner.synthesize(text)
    }

    fn info(&self) -> ModelInfo {
        self.inner.info()
    }
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response<Body> {
    app.oneshot(
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
