//! Common utilities for integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, Response},
    Router,
};
use synth_core::chatterbox::load_reference;
use synth_core::{GenerateOptions, SpeechModel, Waveform};
use tempfile::TempDir;
use tts_server::config::{ProxyAuth, ServerConfig};
use tts_server::{build_router, AppState};

pub const SAMPLE_RATE: u32 = 24_000;

/// Stand-in model: a short sine tone, remembering what it was asked for.
/// Voice prompts are decoded the same way the real model does it.
#[derive(Default)]
pub struct FakeModel {
    pub calls: Mutex<Vec<(String, GenerateOptions)>>,
    pub fail: bool,
    pub delay: Option<Duration>,
}

impl FakeModel {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn last_call(&self) -> Option<(String, GenerateOptions)> {
        self.calls.lock().unwrap().last().cloned()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl SpeechModel for FakeModel {
    fn generate(&self, text: &str, opts: &GenerateOptions) -> anyhow::Result<Waveform> {
        self.calls.lock().unwrap().push((text.to_string(), opts.clone()));
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(prompt) = &opts.audio_prompt {
            load_reference(prompt)?;
        }
        if self.fail {
            anyhow::bail!("decoder exploded");
        }
        let samples = (0..SAMPLE_RATE / 4)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / SAMPLE_RATE as f32).sin() * 0.5)
            .collect();
        Ok(Waveform::new(samples, SAMPLE_RATE))
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

pub struct TestApp {
    pub router: Router,
    pub model: Arc<FakeModel>,
    pub bucket: TempDir,
    pub state: AppState,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with(FakeModel::default(), None)
    }

    pub fn with(model: FakeModel, proxy_auth: Option<ProxyAuth>) -> Self {
        Self::with_config(
            model,
            ServerConfig {
                proxy_auth,
                ..ServerConfig::default()
            },
        )
    }

    pub fn with_config(model: FakeModel, config: ServerConfig) -> Self {
        let bucket = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bucket_mount: bucket.path().to_path_buf(),
            ..config
        };
        let model = Arc::new(model);
        let state = AppState::new(model.clone(), config);
        let router = build_router(state.clone()).unwrap();
        Self {
            router,
            model,
            bucket,
            state,
        }
    }

    /// Place an object in the bucket, as an upload through the platform would.
    pub fn put_object(&self, key: &str, bytes: &[u8]) {
        let path = self.bucket.path().join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }
}

/// A short 16 kHz mono clip, encoded as WAV.
pub fn prompt_wav() -> Vec<u8> {
    let samples: Vec<f32> = (0..16_000).map(|i| (i as f32 * 0.05).sin() * 0.3).collect();
    synth_core::encode_wav(&samples, 16_000).unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}
