use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Per-request generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Language code from the supported table (e.g. "en", "fr").
    pub language: String,
    /// Emotion/intensity control; 0.5 is neutral.
    pub exaggeration: f32,
    /// Classifier-free guidance weight; 0 disables the unconditional pass.
    pub cfg_weight: f32,
    /// Reference audio to clone. `None` uses the model's built-in voice.
    pub audio_prompt: Option<PathBuf>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            exaggeration: 0.5,
            cfg_weight: 0.5,
            audio_prompt: None,
        }
    }
}

/// Mono PCM audio.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as f64 / self.sample_rate as f64 * 1000.0) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A pretrained text-to-speech model.
///
/// `generate` blocks for the whole utterance; async callers should run it on
/// a blocking thread.
pub trait SpeechModel: Send + Sync {
    fn generate(&self, text: &str, opts: &GenerateOptions) -> anyhow::Result<Waveform>;

    /// Output sample rate of every waveform this model produces.
    fn sample_rate(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = GenerateOptions::default();
        assert_eq!(opts.language, "en");
        assert_eq!(opts.exaggeration, 0.5);
        assert_eq!(opts.cfg_weight, 0.5);
        assert!(opts.audio_prompt.is_none());
    }

    #[test]
    fn test_waveform_duration() {
        let wav = Waveform::new(vec![0.0; 36_000], 24_000);
        assert_eq!(wav.duration_ms(), 1500);
        assert_eq!(Waveform::default().duration_ms(), 0);
    }
}
