//! Chatterbox Multilingual inference over its exported ONNX graphs.
//!
//! The model directory holds four graphs plus the tokenizer, the Cangjie
//! table used to spell Chinese text and a default reference voice:
//!
//! - `speech_encoder.onnx`: reference audio -> conditioning embedding, prompt
//!   speech tokens, speaker embedding and speaker features
//! - `embed_tokens.onnx`: text/speech token ids -> input embeddings
//! - `language_model.onnx`: autoregressive transformer with a key/value cache
//! - `conditional_decoder.onnx`: speech tokens + speaker info -> 24 kHz audio

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{bail, Context};
use ndarray::{concatenate, s, Array1, Array2, Array3, Array4, ArrayD, Axis, Ix3};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue};
use ort::value::{DynValue, Tensor};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::model::{GenerateOptions, SpeechModel, Waveform};
use crate::sampling::{apply_cfg, Sampler, SamplingConfig};
use crate::text::{normalize_punctuation, prepare_for_tokenizer, CangjieTable};
use crate::wav::{read_audio, resample, AudioError};

/// Output (and reference) sample rate of the decoder.
pub const S3GEN_SAMPLE_RATE: u32 = 24_000;
/// Longest reference clip handed to the speech encoder.
pub const MAX_REFERENCE_SECS: usize = 10;

pub const START_TEXT_TOKEN: i64 = 255;
pub const STOP_TEXT_TOKEN: i64 = 0;
pub const START_SPEECH_TOKEN: i64 = 6561;
pub const STOP_SPEECH_TOKEN: i64 = 6562;

const SPEECH_ENCODER_FILE: &str = "speech_encoder.onnx";
const EMBED_TOKENS_FILE: &str = "embed_tokens.onnx";
const LANGUAGE_MODEL_FILE: &str = "language_model.onnx";
const DECODER_FILE: &str = "conditional_decoder.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";
const CANGJIE_FILE: &str = "Cangjie5_TC.json";
const DEFAULT_VOICE_FILE: &str = "default_voice.wav";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(i32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            other => match other.strip_prefix("cuda:") {
                Some(id) => id
                    .parse()
                    .map(Device::Cuda)
                    .with_context(|| format!("invalid CUDA device id in '{other}'")),
                None => bail!("unknown device '{other}' (expected cpu, cuda or cuda:<id>)"),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatterboxConfig {
    pub model_dir: PathBuf,
    pub device: Device,
    pub intra_threads: usize,
    /// Upper bound on generated speech tokens per request.
    pub max_new_tokens: usize,
    pub sampling: SamplingConfig,
    pub num_hidden_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl Default for ChatterboxConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("/root/.cache/huggingface/chatterbox-multilingual"),
            device: Device::Cuda(0),
            intra_threads: 4,
            max_new_tokens: 1000,
            sampling: SamplingConfig::default(),
            num_hidden_layers: 30,
            num_kv_heads: 16,
            head_dim: 64,
        }
    }
}

/// Resolved paths of every file the model needs.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub speech_encoder: PathBuf,
    pub embed_tokens: PathBuf,
    pub language_model: PathBuf,
    pub decoder: PathBuf,
    pub tokenizer: PathBuf,
    pub cangjie: PathBuf,
    pub default_voice: PathBuf,
}

impl ModelFiles {
    /// Resolve the model files under `dir`, failing on the first missing one.
    pub fn resolve<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let file = |name: &str| -> anyhow::Result<PathBuf> {
            let path = dir.join(name);
            if !path.is_file() {
                bail!("model file not found: {}", path.display());
            }
            Ok(path)
        };

        Ok(Self {
            speech_encoder: file(SPEECH_ENCODER_FILE)?,
            embed_tokens: file(EMBED_TOKENS_FILE)?,
            language_model: file(LANGUAGE_MODEL_FILE)?,
            decoder: file(DECODER_FILE)?,
            tokenizer: file(TOKENIZER_FILE)?,
            cangjie: file(CANGJIE_FILE)?,
            default_voice: file(DEFAULT_VOICE_FILE)?,
        })
    }
}

/// Speech-encoder outputs for one reference clip.
struct VoiceConditioning {
    cond_emb: Array3<f32>,
    prompt_tokens: Array2<i64>,
    speaker_embeddings: ArrayD<f32>,
    speaker_features: ArrayD<f32>,
}

/// One autoregressive branch: its attention mask and key/value cache.
struct DecoderBranch {
    attention_len: usize,
    past: Vec<(String, Array4<f32>)>,
}

impl DecoderBranch {
    fn new(config: &ChatterboxConfig) -> Self {
        let mut past = Vec::with_capacity(config.num_hidden_layers * 2);
        for layer in 0..config.num_hidden_layers {
            for kv in ["key", "value"] {
                past.push((
                    format!("past_key_values.{layer}.{kv}"),
                    Array4::zeros((1, config.num_kv_heads, 0, config.head_dim)),
                ));
            }
        }
        Self {
            attention_len: 0,
            past,
        }
    }
}

pub struct ChatterboxModel {
    config: ChatterboxConfig,
    speech_encoder: Session,
    embed_tokens: Session,
    language_model: Session,
    decoder: Session,
    tokenizer: Tokenizer,
    cangjie: CangjieTable,
    default_voice: Vec<f32>,
}

impl ChatterboxModel {
    /// Load every graph, the tokenizer and the default voice.
    pub fn load(config: ChatterboxConfig) -> anyhow::Result<Self> {
        let files = ModelFiles::resolve(&config.model_dir)?;
        let started = Instant::now();
        info!(
            "Loading Chatterbox Multilingual from {} on {}",
            config.model_dir.display(),
            config.device
        );

        let speech_encoder = build_session(&files.speech_encoder, &config)?;
        let embed_tokens = build_session(&files.embed_tokens, &config)?;
        let language_model = build_session(&files.language_model, &config)?;
        let decoder = build_session(&files.decoder, &config)?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(|e| {
            anyhow::anyhow!("Failed to load tokenizer {}: {e}", files.tokenizer.display())
        })?;
        let cangjie = CangjieTable::load(&files.cangjie)?;
        debug!("Loaded {} Cangjie entries", cangjie.len());

        let default_voice = load_reference(&files.default_voice)
            .context("Failed to load the built-in default voice")?;

        info!("Chatterbox loaded in {:.2}s", started.elapsed().as_secs_f64());

        Ok(Self {
            config,
            speech_encoder,
            embed_tokens,
            language_model,
            decoder,
            tokenizer,
            cangjie,
            default_voice,
        })
    }

    pub fn config(&self) -> &ChatterboxConfig {
        &self.config
    }

    fn tokenize(&self, text: &str, language: &str) -> anyhow::Result<Vec<i64>> {
        let prepared = prepare_for_tokenizer(&normalize_punctuation(text), language, &self.cangjie);
        let encoding = self
            .tokenizer
            .encode(prepared.as_str(), false)
            .map_err(|e| anyhow::anyhow!("tokenizer error: {e}"))?;
        let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if ids.is_empty() {
            bail!("text produced no tokens");
        }
        Ok(ids)
    }

    fn encode_voice(&self, reference: &[f32]) -> anyhow::Result<VoiceConditioning> {
        let audio = Array2::from_shape_vec((1, reference.len()), reference.to_vec())?;
        let outputs = self
            .speech_encoder
            .run(vec![("audio_values", input(audio)?)])
            .context("speech encoder failed")?;

        // Outputs are positional: cond_emb, prompt_token, speaker embedding, speaker features
        let cond_name = output_name(&self.speech_encoder, 0)?;
        let prompt_name = output_name(&self.speech_encoder, 1)?;
        let embed_name = output_name(&self.speech_encoder, 2)?;
        let feat_name = output_name(&self.speech_encoder, 3)?;

        let cond_emb = tensor_f32(outputs.get(cond_name), cond_name)?
            .into_dimensionality()
            .context("unexpected conditioning embedding rank")?;
        let prompt_tokens = tensor_i64(outputs.get(prompt_name), prompt_name)?
            .into_dimensionality()
            .context("unexpected prompt token rank")?;
        let speaker_embeddings = tensor_f32(outputs.get(embed_name), embed_name)?;
        let speaker_features = tensor_f32(outputs.get(feat_name), feat_name)?;

        Ok(VoiceConditioning {
            cond_emb,
            prompt_tokens,
            speaker_embeddings,
            speaker_features,
        })
    }

    fn embed(&self, ids: Vec<i64>, positions: Vec<i64>, exaggeration: f32) -> anyhow::Result<Array3<f32>> {
        let len = ids.len();
        let outputs = self
            .embed_tokens
            .run(vec![
                ("input_ids", input(Array2::from_shape_vec((1, len), ids)?)?),
                ("position_ids", input(Array2::from_shape_vec((1, len), positions)?)?),
                ("exaggeration", input(Array1::from_vec(vec![exaggeration]))?),
            ])
            .context("token embedding failed")?;
        let name = output_name(&self.embed_tokens, 0)?;
        Ok(tensor_f32(outputs.get(name), name)?
            .into_dimensionality()
            .context("unexpected embedding rank")?)
    }

    /// Run one language-model step and return the last-position logits.
    fn step(&self, branch: &mut DecoderBranch, inputs_embeds: Array3<f32>) -> anyhow::Result<Vec<f32>> {
        branch.attention_len += inputs_embeds.shape()[1];
        let attention_mask = Array2::<i64>::ones((1, branch.attention_len));

        let mut inputs: Vec<(String, SessionInputValue<'static>)> =
            Vec::with_capacity(branch.past.len() + 2);
        inputs.push(("inputs_embeds".to_string(), input(inputs_embeds)?));
        inputs.push(("attention_mask".to_string(), input(attention_mask)?));
        for (name, cache) in branch.past.drain(..) {
            inputs.push((name, input(cache)?));
        }

        let outputs = self
            .language_model
            .run(inputs)
            .context("language model step failed")?;

        let logits = tensor_f32(outputs.get("logits"), "logits")?
            .into_dimensionality::<Ix3>()
            .context("unexpected logits rank")?;
        let last = logits.shape()[1].saturating_sub(1);
        let last_logits = logits.slice(s![0, last, ..]).to_vec();

        for layer in 0..self.config.num_hidden_layers {
            for kv in ["key", "value"] {
                let present = outputs
                    .get(format!("present.{layer}.{kv}").as_str())
                    .with_context(|| format!("missing present.{layer}.{kv}"))?
                    .try_extract_tensor::<f32>()?
                    .to_owned()
                    .into_dimensionality()
                    .context("unexpected key/value cache rank")?;
                branch
                    .past
                    .push((format!("past_key_values.{layer}.{kv}"), present));
            }
        }

        Ok(last_logits)
    }

    fn decode(&self, voice: &VoiceConditioning, speech_tokens: Array2<i64>) -> anyhow::Result<Vec<f32>> {
        let outputs = self
            .decoder
            .run(vec![
                ("speech_tokens", input(speech_tokens)?),
                ("speaker_embeddings", input(voice.speaker_embeddings.clone())?),
                ("speaker_features", input(voice.speaker_features.clone())?),
            ])
            .context("conditional decoder failed")?;
        let name = output_name(&self.decoder, 0)?;
        let wav = tensor_f32(outputs.get(name), name)?;
        Ok(wav.iter().copied().collect())
    }
}

impl SpeechModel for ChatterboxModel {
    fn generate(&self, text: &str, opts: &GenerateOptions) -> anyhow::Result<Waveform> {
        let started = Instant::now();

        let reference = match &opts.audio_prompt {
            Some(path) => load_reference(path)?,
            None => self.default_voice.clone(),
        };
        let voice = self.encode_voice(&reference)?;

        let text_ids = self.tokenize(text, &opts.language)?;
        let (ids, positions, text_len) = build_prefix(&text_ids);
        let prefix = self.embed(ids, positions, opts.exaggeration)?;
        let cond_len = voice.cond_emb.shape()[1];
        let cond_prefix = concatenate(Axis(1), &[voice.cond_emb.view(), prefix.view()])?;

        let use_cfg = cfg_enabled(opts.cfg_weight);
        let mut cond_branch = DecoderBranch::new(&self.config);
        let mut uncond_branch = use_cfg.then(|| DecoderBranch::new(&self.config));
        let mut next_uncond = use_cfg.then(|| unconditional_prefix(&cond_prefix, cond_len, text_len));
        let mut next_embeds = cond_prefix;

        let mut sampler = Sampler::new(self.config.sampling.clone());
        let mut tokens = SpeechTokenLoop::new(self.config.max_new_tokens);

        while !tokens.is_finished() {
            let mut logits = self.step(&mut cond_branch, next_embeds)?;
            if let (Some(branch), Some(embeds)) = (uncond_branch.as_mut(), next_uncond.take()) {
                let uncond_logits = self.step(branch, embeds)?;
                apply_cfg(&mut logits, &uncond_logits, opts.cfg_weight);
            }

            let token = sampler.sample(&logits, tokens.generated());
            tokens.push(token);
            if tokens.is_finished() {
                break;
            }

            let embeds = self.embed(vec![token], vec![tokens.next_position()], opts.exaggeration)?;
            if use_cfg {
                next_uncond = Some(embeds.clone());
            }
            next_embeds = embeds;
        }
        let generated = tokens.generated();

        let speech_tokens = finalize_speech_tokens(&voice.prompt_tokens, generated)?;
        debug!(
            "Generated {} speech tokens ({} prompt tokens)",
            generated.len().saturating_sub(1),
            voice.prompt_tokens.len()
        );

        let samples = self.decode(&voice, speech_tokens)?;
        let waveform = Waveform::new(samples, S3GEN_SAMPLE_RATE);
        info!(
            "Synthesized {}ms of audio in {:.2}s (language={}, cfg_weight={}, exaggeration={})",
            waveform.duration_ms(),
            started.elapsed().as_secs_f64(),
            opts.language,
            opts.cfg_weight,
            opts.exaggeration
        );
        Ok(waveform)
    }

    fn sample_rate(&self) -> u32 {
        S3GEN_SAMPLE_RATE
    }
}

fn build_session(path: &Path, config: &ChatterboxConfig) -> anyhow::Result<Session> {
    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(config.intra_threads)?;
    if let Device::Cuda(id) = config.device {
        builder = builder
            .with_execution_providers([CUDAExecutionProvider::default().with_device_id(id).build()])?;
    }
    builder
        .commit_from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))
}

fn input<T, D>(array: ndarray::Array<T, D>) -> anyhow::Result<SessionInputValue<'static>>
where
    T: ort::tensor::PrimitiveTensorElementType + fmt::Debug + Clone + 'static,
    D: ndarray::Dimension + 'static,
{
    Ok(Tensor::from_array(array)?.into())
}

fn output_name(session: &Session, index: usize) -> anyhow::Result<&str> {
    session
        .outputs
        .get(index)
        .map(|o| o.name.as_str())
        .with_context(|| format!("graph has no output #{index}"))
}

fn tensor_f32(value: Option<&DynValue>, name: &str) -> anyhow::Result<ArrayD<f32>> {
    Ok(value
        .with_context(|| format!("missing output '{name}'"))?
        .try_extract_tensor::<f32>()?
        .to_owned())
}

fn tensor_i64(value: Option<&DynValue>, name: &str) -> anyhow::Result<ArrayD<i64>> {
    Ok(value
        .with_context(|| format!("missing output '{name}'"))?
        .try_extract_tensor::<i64>()?
        .to_owned())
}

/// Load a reference clip as 24 kHz mono, capped at [`MAX_REFERENCE_SECS`].
pub fn load_reference<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<f32>> {
    let path = path.as_ref();
    let wav = read_audio(path)?;
    if wav.is_empty() {
        return Err(AudioError::Empty).with_context(|| format!("Reference {}", path.display()));
    }
    let mut samples = resample(&wav.samples, wav.sample_rate, S3GEN_SAMPLE_RATE)?;
    samples.truncate(MAX_REFERENCE_SECS * S3GEN_SAMPLE_RATE as usize);
    Ok(samples)
}

/// Wrap text ids in start/stop text tokens and append the start-speech token.
///
/// Returns the ids, their position ids (text positions count from 0, the
/// speech token restarts at 0) and the number of text positions.
pub fn build_prefix(text_ids: &[i64]) -> (Vec<i64>, Vec<i64>, usize) {
    let mut ids = Vec::with_capacity(text_ids.len() + 3);
    ids.push(START_TEXT_TOKEN);
    ids.extend_from_slice(text_ids);
    ids.push(STOP_TEXT_TOKEN);
    let text_len = ids.len();

    let mut positions: Vec<i64> = (0..text_len as i64).collect();
    ids.push(START_SPEECH_TOKEN);
    positions.push(0);

    (ids, positions, text_len)
}

/// Guidance needs the second, text-free branch only for a positive weight.
pub fn cfg_enabled(cfg_weight: f32) -> bool {
    cfg_weight > 0.0
}

/// Prefix for the unconditional branch: the conditioning prefix with the
/// text-token rows (`cond_len..cond_len + text_len`) zeroed.
pub fn unconditional_prefix(cond_prefix: &Array3<f32>, cond_len: usize, text_len: usize) -> Array3<f32> {
    let mut prefix = cond_prefix.clone();
    let end = (cond_len + text_len).min(prefix.shape()[1]);
    let start = cond_len.min(end);
    prefix.slice_mut(s![.., start..end, ..]).fill(0.0);
    prefix
}

/// Bookkeeping for the autoregressive speech-token loop.
///
/// Starts from the start-speech token and finishes on the stop token or once
/// `max_new_tokens` tokens have been sampled.
#[derive(Debug, Clone)]
pub struct SpeechTokenLoop {
    generated: Vec<i64>,
    max_new_tokens: usize,
}

impl SpeechTokenLoop {
    pub fn new(max_new_tokens: usize) -> Self {
        Self {
            generated: vec![START_SPEECH_TOKEN],
            max_new_tokens,
        }
    }

    pub fn push(&mut self, token: i64) {
        self.generated.push(token);
    }

    /// Every token so far, including the leading start-speech token.
    pub fn generated(&self) -> &[i64] {
        &self.generated
    }

    pub fn new_tokens(&self) -> usize {
        self.generated.len() - 1
    }

    pub fn is_finished(&self) -> bool {
        self.new_tokens() >= self.max_new_tokens || self.generated.last() == Some(&STOP_SPEECH_TOKEN)
    }

    /// Position id of the most recent token when it is fed back in. The
    /// start-speech token sits at 0 and each sampled token follows it.
    pub fn next_position(&self) -> i64 {
        self.new_tokens() as i64
    }
}

/// Prompt tokens followed by the generated tokens, with the start/stop
/// markers and any out-of-vocabulary ids dropped.
pub fn finalize_speech_tokens(prompt: &Array2<i64>, generated: &[i64]) -> anyhow::Result<Array2<i64>> {
    let generated: Vec<i64> = generated
        .iter()
        .copied()
        .filter(|&t| (0..START_SPEECH_TOKEN).contains(&t))
        .collect();
    if generated.is_empty() {
        bail!("model produced no speech tokens");
    }
    let generated = Array2::from_shape_vec((1, generated.len()), generated)?;
    Ok(concatenate(Axis(1), &[prompt.view(), generated.view()])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:2".parse::<Device>().unwrap(), Device::Cuda(2));
        assert!("cuda:x".parse::<Device>().is_err());
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }

    #[test]
    fn test_model_files_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelFiles::resolve(dir.path()).unwrap_err();
        assert!(err.to_string().contains("speech_encoder.onnx"));
    }

    #[test]
    fn test_model_files_resolve() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            SPEECH_ENCODER_FILE,
            EMBED_TOKENS_FILE,
            LANGUAGE_MODEL_FILE,
            DECODER_FILE,
            TOKENIZER_FILE,
            CANGJIE_FILE,
            DEFAULT_VOICE_FILE,
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let files = ModelFiles::resolve(dir.path()).unwrap();
        assert!(files.decoder.ends_with(DECODER_FILE));
        assert!(files.cangjie.ends_with(CANGJIE_FILE));

        std::fs::remove_file(dir.path().join(CANGJIE_FILE)).unwrap();
        let err = ModelFiles::resolve(dir.path()).unwrap_err();
        assert!(err.to_string().contains(CANGJIE_FILE));
    }

    #[test]
    fn test_model_load_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatterboxConfig {
            model_dir: dir.path().to_path_buf(),
            device: Device::Cpu,
            ..Default::default()
        };
        assert!(ChatterboxModel::load(config).is_err());
    }

    #[test]
    fn test_build_prefix() {
        let (ids, positions, text_len) = build_prefix(&[10, 11, 12]);
        assert_eq!(ids, vec![START_TEXT_TOKEN, 10, 11, 12, STOP_TEXT_TOKEN, START_SPEECH_TOKEN]);
        assert_eq!(positions, vec![0, 1, 2, 3, 4, 0]);
        assert_eq!(text_len, 5);
    }

    #[test]
    fn test_finalize_speech_tokens() {
        let prompt = Array2::from_shape_vec((1, 2), vec![1, 2]).unwrap();
        let tokens =
            finalize_speech_tokens(&prompt, &[START_SPEECH_TOKEN, 5, 6, STOP_SPEECH_TOKEN]).unwrap();
        assert_eq!(tokens.shape(), &[1, 4]);
        assert_eq!(tokens.row(0).to_vec(), vec![1, 2, 5, 6]);
    }

    #[test]
    fn test_finalize_rejects_empty_generation() {
        let prompt = Array2::from_shape_vec((1, 1), vec![1]).unwrap();
        assert!(finalize_speech_tokens(&prompt, &[START_SPEECH_TOKEN, STOP_SPEECH_TOKEN]).is_err());
    }

    #[test]
    fn test_cfg_enabled() {
        assert!(cfg_enabled(0.5));
        assert!(cfg_enabled(1.0));
        assert!(!cfg_enabled(0.0));
    }

    #[test]
    fn test_unconditional_prefix_zeroes_text_rows() {
        // 2 conditioning rows, 3 text rows, 1 start-speech row
        let cond = Array3::<f32>::ones((1, 6, 4));
        let uncond = unconditional_prefix(&cond, 2, 3);

        assert_eq!(uncond.shape(), cond.shape());
        for row in 0..6 {
            let expected = if (2..5).contains(&row) { 0.0 } else { 1.0 };
            assert!(uncond.slice(s![0, row, ..]).iter().all(|&v| v == expected), "row {row}");
        }
        assert!(cond.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_unconditional_prefix_clamps_to_length() {
        let cond = Array3::<f32>::ones((1, 3, 2));
        let uncond = unconditional_prefix(&cond, 2, 10);
        assert_eq!(uncond.slice(s![0, 2, ..]).to_vec(), vec![0.0, 0.0]);
        assert_eq!(uncond.slice(s![0, 1, ..]).to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_token_loop_positions_follow_steps() {
        let mut tokens = SpeechTokenLoop::new(10);
        assert!(!tokens.is_finished());
        assert_eq!(tokens.generated(), &[START_SPEECH_TOKEN]);

        let mut positions = Vec::new();
        for token in [7, 8, 9] {
            tokens.push(token);
            positions.push(tokens.next_position());
        }
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(tokens.new_tokens(), 3);
        assert!(!tokens.is_finished());
    }

    #[test]
    fn test_token_loop_stops_on_stop_token() {
        let mut tokens = SpeechTokenLoop::new(10);
        tokens.push(42);
        tokens.push(STOP_SPEECH_TOKEN);
        assert!(tokens.is_finished());
        assert_eq!(tokens.generated(), &[START_SPEECH_TOKEN, 42, STOP_SPEECH_TOKEN]);
    }

    #[test]
    fn test_token_loop_stops_at_max_new_tokens() {
        let mut tokens = SpeechTokenLoop::new(2);
        tokens.push(1);
        assert!(!tokens.is_finished());
        tokens.push(2);
        assert!(tokens.is_finished());

        assert!(SpeechTokenLoop::new(0).is_finished());
    }

    #[test]
    fn test_load_reference_rejects_empty_clip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: S3GEN_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        hound::WavWriter::create(&path, spec).unwrap().finalize().unwrap();

        let err = load_reference(&path).unwrap_err();
        assert!(err.chain().any(|e| matches!(e.downcast_ref::<AudioError>(), Some(AudioError::Empty))));
    }

    #[test]
    fn test_load_reference_truncates_and_resamples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: S3GEN_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..(12 * S3GEN_SAMPLE_RATE) {
            writer.write_sample(((i % 100) as i16) * 100).unwrap();
        }
        writer.finalize().unwrap();

        let samples = load_reference(&path).unwrap();
        assert_eq!(samples.len(), MAX_REFERENCE_SECS * S3GEN_SAMPLE_RATE as usize);
    }
}
