use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use synth_core::{encode_wav, AudioError, GenerateOptions, SUPPORTED_LANGUAGES};
use tracing::info;

use crate::error::ApiError;
use crate::metrics::{EndpointMetricsResponse, MetricsResponse, SystemMetrics};
use crate::storage::BucketStore;
use crate::validation::validate_speech_request;
use crate::AppState;

fn default_language() -> String {
    "en".to_string()
}

fn default_exaggeration() -> f32 {
    0.5
}

fn default_cfg_weight() -> f32 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    /// Bucket key of a reference clip to clone.
    #[serde(default)]
    pub voice_s3_key: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_exaggeration")]
    pub exaggeration: f32,
    #[serde(default = "default_cfg_weight")]
    pub cfg_weight: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpeechResponse {
    #[serde(rename = "s3_Key")]
    pub s3_key: String,
}

#[derive(Serialize)]
pub struct LanguageInfo {
    code: &'static str,
    name: &'static str,
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn list_languages() -> Json<Vec<LanguageInfo>> {
    Json(
        SUPPORTED_LANGUAGES
            .iter()
            .map(|&(code, name)| LanguageInfo { code, name })
            .collect(),
    )
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    let request_count = state.request_count.load(Ordering::Relaxed);
    let uptime = state.started_at.elapsed().as_secs();

    Json(MetricsResponse {
        timestamp: chrono::Utc::now(),
        system: SystemMetrics::collect(request_count, uptime),
        endpoints: EndpointMetricsResponse {
            generate_speech: state.metrics.generate_speech.stats(),
        },
        synthesis: state.metrics.synthesis.stats(),
    })
}

/// Synthesize `text` and store the WAV in the bucket, returning its key.
pub async fn generate_speech(
    State(state): State<AppState>,
    Json(req): Json<SpeechRequest>,
) -> Result<Json<SpeechResponse>, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let timer = state.metrics.generate_speech.start_request();

    let response = synthesize_and_store(&state, req).await?;
    timer.succeed();
    Ok(Json(response))
}

async fn synthesize_and_store(state: &AppState, req: SpeechRequest) -> Result<SpeechResponse, ApiError> {
    // A blank key means "no prompt", same as omitting it.
    let voice_key = req.voice_s3_key.as_deref().filter(|k| !k.trim().is_empty());
    validate_speech_request(
        &req.text,
        &req.language,
        req.exaggeration,
        req.cfg_weight,
        voice_key,
    )?;

    let audio_prompt = match voice_key {
        Some(key) => {
            if !state.store.exists(key).await? {
                return Err(ApiError::NotFound(format!("Prompt audio not found: {key}")));
            }
            Some(state.store.path_for(key)?)
        }
        None => None,
    };

    info!(
        "Speech request: {} chars, language={}, voice={}",
        req.text.chars().count(),
        req.language,
        voice_key.unwrap_or("default")
    );

    let opts = GenerateOptions {
        language: req.language,
        exaggeration: req.exaggeration,
        cfg_weight: req.cfg_weight,
        audio_prompt,
    };

    let model = state.model.clone();
    let text = req.text;
    let synth_started = Instant::now();
    let waveform = tokio::task::spawn_blocking(move || model.generate(&text, &opts))
        .await
        .map_err(|e| ApiError::Internal(format!("Task join error: {e}")))?
        .map_err(|e| match (voice_key, audio_error(&e)) {
            (Some(key), Some(audio)) => {
                ApiError::InvalidInput(format!("Prompt audio {key} could not be used: {audio}"))
            }
            _ => ApiError::Synthesis(e),
        })?;
    state.metrics.synthesis.record_synthesis(
        synth_started.elapsed().as_millis() as u64,
        waveform.duration_ms(),
    );

    let wav_bytes = encode_wav(&waveform.samples, waveform.sample_rate)
        .map_err(|e| ApiError::Synthesis(e.context("WAV encoding failed")))?;

    let key = BucketStore::new_output_key(&state.config.output_prefix);
    state.store.put(&key, &wav_bytes).await?;
    state.metrics.synthesis.record_stored(wav_bytes.len());
    info!("Saved audio to object storage: {key}");

    Ok(SpeechResponse { s3_key: key })
}

/// The prompt-audio problem behind a model failure, if that is what it was.
fn audio_error(err: &anyhow::Error) -> Option<&AudioError> {
    err.chain().find_map(|e| e.downcast_ref::<AudioError>())
}
