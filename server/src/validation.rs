use synth_core::is_supported_language;

use crate::error::ApiError;
use crate::storage::validate_key;

/// Maximum text length for speech requests, in characters
const MAX_TEXT_LENGTH: usize = 5000;
const EXAGGERATION_RANGE: std::ops::RangeInclusive<f32> = 0.25..=2.0;
const CFG_WEIGHT_RANGE: std::ops::RangeInclusive<f32> = 0.0..=1.0;

/// Validate a speech request before any storage or model work
pub fn validate_speech_request(
    text: &str,
    language: &str,
    exaggeration: f32,
    cfg_weight: f32,
    voice_key: Option<&str>,
) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::InvalidInput("Text cannot be empty".to_string()));
    }
    if text.chars().count() > MAX_TEXT_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Text too long (max {} characters)",
            MAX_TEXT_LENGTH
        )));
    }

    if !is_supported_language(language) {
        return Err(ApiError::InvalidInput(format!(
            "Unsupported language: {}. Use /languages to list supported codes",
            language
        )));
    }

    if !EXAGGERATION_RANGE.contains(&exaggeration) {
        return Err(ApiError::InvalidInput(format!(
            "exaggeration must be between {} and {}",
            EXAGGERATION_RANGE.start(),
            EXAGGERATION_RANGE.end()
        )));
    }
    if !CFG_WEIGHT_RANGE.contains(&cfg_weight) {
        return Err(ApiError::InvalidInput(format!(
            "cfg_weight must be between {} and {}",
            CFG_WEIGHT_RANGE.start(),
            CFG_WEIGHT_RANGE.end()
        )));
    }

    if let Some(key) = voice_key {
        validate_key(key)?;
    }

    Ok(())
}
