//! WAV encoding for synthesized speech and audio decoding for voice prompts.

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::Context;
use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::model::Waveform;

/// Frames fed to the FFT resampler per call.
const RESAMPLE_CHUNK: usize = 1024;

/// Encode PCM f32 samples as a mono 16-bit PCM WAV (RIFF) file.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    // WAV header (44 bytes) + 2 bytes per sample
    let mut cursor = Cursor::new(Vec::<u8>::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| anyhow::anyhow!("wav write err: {e}"))?;

        const I16_MAX_F32: f32 = i16::MAX as f32;
        for &s in samples {
            let v = (s.clamp(-1.0, 1.0) * I16_MAX_F32) as i16;
            writer
                .write_sample(v)
                .map_err(|e| anyhow::anyhow!("wav sample err: {e}"))?;
        }
        writer
            .finalize()
            .map_err(|e| anyhow::anyhow!("wav finalize err: {e}"))?;
    }

    Ok(cursor.into_inner())
}

/// Why a voice prompt could not be turned into samples.
///
/// These are problems with the caller's audio rather than with the model.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("unsupported or corrupt audio: {0}")]
    Decode(String),

    #[error("invalid sample rate: {0} Hz")]
    InvalidSampleRate(u32),

    #[error("audio contains no samples")]
    Empty,
}

/// Decode an audio file into mono f32 samples in [-1.0, 1.0].
///
/// RIFF/WAVE files go through hound; anything else (MP3, FLAC, Ogg Vorbis,
/// AAC/M4A) is probed and decoded with symphonia. Multi-channel audio is
/// averaged down to a single channel.
pub fn read_audio<P: AsRef<Path>>(path: P) -> anyhow::Result<Waveform> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open audio file: {}", path.display()))?;

    let mut magic = [0u8; 12];
    let is_wav = file.read_exact(&mut magic).is_ok() && &magic[0..4] == b"RIFF" && &magic[8..12] == b"WAVE";
    file.seek(SeekFrom::Start(0))
        .with_context(|| format!("Failed to rewind {}", path.display()))?;

    let decoded = if is_wav {
        decode_wav(BufReader::new(file))
    } else {
        decode_compressed(file, path.extension().and_then(|e| e.to_str()))
    };
    let wav = decoded.with_context(|| format!("Failed to decode {}", path.display()))?;

    if wav.sample_rate == 0 {
        return Err(AudioError::InvalidSampleRate(0))
            .with_context(|| format!("Failed to decode {}", path.display()));
    }
    Ok(wav)
}

fn decode_wav<R: Read>(reader: R) -> Result<Waveform, AudioError> {
    let decode_err = |e: hound::Error| AudioError::Decode(e.to_string());
    let mut reader = hound::WavReader::new(reader).map_err(decode_err)?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(decode_err)?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(decode_err)?
        }
    };

    Ok(Waveform {
        samples: downmix(&interleaved, spec.channels as usize),
        sample_rate: spec.sample_rate,
    })
}

fn decode_compressed(file: File, extension: Option<&str>) -> Result<Waveform, AudioError> {
    let decode_err = |e: SymphoniaError| AudioError::Decode(e.to_string());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }
    let stream = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(&hint, stream, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(decode_err)?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioError::Decode("no audio track".to_string()))?;
    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    if sample_rate == 0 {
        return Err(AudioError::InvalidSampleRate(0));
    }
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(decode_err)?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(decode_err(e)),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // A corrupt frame is skipped, as players do
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(decode_err(e)),
        };
        let spec = *decoded.spec();
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend(downmix(buffer.samples(), spec.channels.count()));
    }

    Ok(Waveform {
        samples,
        sample_rate,
    })
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono audio between sample rates.
///
/// Uses rubato's FFT resampler; very short inputs fall back to linear
/// interpolation.
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> anyhow::Result<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        anyhow::bail!("invalid resample rates {from_rate} -> {to_rate}");
    }
    if from_rate == to_rate || input.is_empty() {
        return Ok(input.to_vec());
    }
    if input.len() < 64 {
        return Ok(resample_linear(input, from_rate, to_rate));
    }

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 2, 1)
            .with_context(|| format!("Failed to build resampler {from_rate} -> {to_rate}"))?;

    let samples: Vec<f64> = input.iter().map(|&s| s as f64).collect();
    let expected = (input.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let delay = resampler.output_delay();
    let mut out: Vec<f64> = Vec::with_capacity(expected + delay);

    let mut pos = 0usize;
    while samples.len() - pos >= resampler.input_frames_next() {
        let n = resampler.input_frames_next();
        let frames = resampler.process(&[&samples[pos..pos + n]], None)?;
        out.extend_from_slice(&frames[0]);
        pos += n;
    }
    if pos < samples.len() {
        let frames = resampler.process_partial(Some(&[&samples[pos..]][..]), None)?;
        out.extend_from_slice(&frames[0]);
    }
    // Flush the filter delay
    while out.len() < expected + delay {
        let frames = resampler.process_partial(None::<&[&[f64]]>, None)?;
        if frames[0].is_empty() {
            break;
        }
        out.extend_from_slice(&frames[0]);
    }

    Ok(out
        .into_iter()
        .skip(delay)
        .take(expected)
        .map(|s| s as f32)
        .collect())
}

fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (input.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = (src_idx.floor() as usize).min(input.len() - 1);
        let idx_ceil = (idx_floor + 1).min(input.len() - 1);
        let frac = (src_idx - idx_floor as f64) as f32;
        output.push(input[idx_floor] * (1.0 - frac) + input[idx_ceil] * frac);
    }

    output
}
