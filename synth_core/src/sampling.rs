//! Speech-token sampling for the autoregressive decoder.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Logit temperature; 0 means argmax.
    pub temperature: f32,
    /// Nucleus cutoff (1.0 = disabled).
    pub top_p: f32,
    /// Drop tokens whose probability is below `min_p * max_prob` (0 = disabled).
    pub min_p: f32,
    /// Repetition penalty (1.0 = disabled).
    pub repetition_penalty: f32,
    /// Random seed (None = from entropy).
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 1.0,
            min_p: 0.05,
            repetition_penalty: 2.0,
            seed: None,
        }
    }
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            min_p: 0.0,
            repetition_penalty: 1.0,
            seed: Some(0),
        }
    }
}

/// Apply repetition penalty to logits of previously generated tokens.
///
/// Negative logits are multiplied by the penalty and positive ones divided,
/// so both move away from being picked again.
pub fn apply_repetition_penalty(logits: &mut [f32], generated_tokens: &[i64], penalty: f32) {
    if (penalty - 1.0).abs() < f32::EPSILON {
        return;
    }

    let mut seen = vec![false; logits.len()];
    for &token in generated_tokens {
        let Ok(idx) = usize::try_from(token) else {
            continue;
        };
        if idx >= logits.len() || seen[idx] {
            continue;
        }
        seen[idx] = true;
        if logits[idx] < 0.0 {
            logits[idx] *= penalty;
        } else {
            logits[idx] /= penalty;
        }
    }
}

/// Token sampler holding its own RNG.
#[derive(Debug)]
pub struct Sampler {
    config: SamplingConfig,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Pick the next token given raw logits and the tokens generated so far.
    pub fn sample(&mut self, logits: &[f32], generated_tokens: &[i64]) -> i64 {
        if logits.is_empty() {
            return 0;
        }

        let mut logits = logits.to_vec();
        apply_repetition_penalty(&mut logits, generated_tokens, self.config.repetition_penalty);

        if self.config.temperature < f32::EPSILON {
            return argmax(&logits) as i64;
        }

        for l in logits.iter_mut() {
            *l /= self.config.temperature;
        }
        let mut probs = softmax(&logits);

        if self.config.min_p > 0.0 {
            let max_p = probs.iter().copied().fold(0.0f32, f32::max);
            let threshold = self.config.min_p * max_p;
            for p in probs.iter_mut() {
                if *p < threshold {
                    *p = 0.0;
                }
            }
        }

        if self.config.top_p < 1.0 {
            let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
            indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

            let total: f32 = indexed.iter().map(|(_, p)| p).sum();
            let mut cumsum = 0.0;
            let mut keep = vec![false; probs.len()];
            for (idx, p) in indexed {
                keep[idx] = true;
                cumsum += p / total.max(f32::MIN_POSITIVE);
                if cumsum >= self.config.top_p {
                    break;
                }
            }
            for (p, k) in probs.iter_mut().zip(keep) {
                if !k {
                    *p = 0.0;
                }
            }
        }

        match WeightedIndex::new(&probs) {
            Ok(dist) => dist.sample(&mut self.rng) as i64,
            Err(_) => argmax(&probs) as i64,
        }
    }
}

/// Classifier-free guidance: push the conditional logits away from the
/// unconditional ones by `weight`.
pub fn apply_cfg(cond: &mut [f32], uncond: &[f32], weight: f32) {
    for (c, u) in cond.iter_mut().zip(uncond) {
        *c += weight * (*c - *u);
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.into_iter().map(|e| e / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}
