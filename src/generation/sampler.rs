// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token sampling from one row of logits.

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, SteerError};

use super::params::GenerationParams;

/// A sampled token and whether it ends the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampledToken {
    /// Token id.
    pub token: u32,
    /// The token is the end-of-sequence token.
    pub eos: bool,
}

/// Picks the next token from one row of logits.
pub trait TokenSampler: Send {
    /// Sample from `logits` given the ids already in this row.
    ///
    /// # Shapes
    /// - `logits`: `[vocab]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Generation`] if no token can be sampled.
    fn sample(&mut self, logits: &Tensor, history: &[u32]) -> Result<SampledToken>;
}

/// Sampler with bans, repetition penalty, temperature, top-k, top-p and
/// min-p filtering. Temperature `0` is greedy.
pub struct LogitsSampler {
    /// Sampling knobs.
    params: GenerationParams,
    /// Tokens forced to zero probability.
    banned: Vec<u32>,
    /// End-of-sequence id.
    eos: Option<u32>,
    /// Random source.
    rng: StdRng,
}

impl LogitsSampler {
    /// Build a sampler from request parameters.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if `custom_token_bans` is malformed.
    pub fn new(params: &GenerationParams, eos: Option<u32>) -> Result<Self> {
        let mut banned = params.banned_tokens()?;
        if params.ban_eos_token {
            banned.extend(eos);
        }
        let rng = params
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Ok(Self {
            params: params.clone(),
            banned,
            eos,
            rng,
        })
    }

    /// Apply bans and the repetition penalty in place.
    fn adjust(&self, logits: &mut [f32], history: &[u32]) {
        for &id in &self.banned {
            if let Some(l) = usize::try_from(id).ok().and_then(|i| logits.get_mut(i)) {
                *l = f32::NEG_INFINITY;
            }
        }

        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let penalty = self.params.repetition_penalty as f32;
        if (penalty - 1.0).abs() > f32::EPSILON {
            let range = self.params.repetition_penalty_range;
            let start = if range == 0 {
                0
            } else {
                history.len().saturating_sub(range)
            };
            let mut seen: Vec<u32> = history.get(start..).unwrap_or_default().to_vec();
            seen.sort_unstable();
            seen.dedup();
            for id in seen {
                if let Some(l) = usize::try_from(id).ok().and_then(|i| logits.get_mut(i)) {
                    *l = if *l > 0.0 { *l / penalty } else { *l * penalty };
                }
            }
        }
    }

    /// Temperature softmax followed by top-k, top-p and min-p filtering.
    /// Returns `(index, probability)` pairs sorted by probability.
    fn candidates(&self, logits: &[f32]) -> Vec<(usize, f32)> {
        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let temperature = self.params.temperature as f32;
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut probs: Vec<(usize, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (i, ((l - max) / temperature).exp()))
            .filter(|(_, p)| *p > 0.0)
            .collect();
        probs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if self.params.top_k > 0 {
            probs.truncate(self.params.top_k);
        }

        let total: f32 = probs.iter().map(|(_, p)| p).sum();
        for (_, p) in &mut probs {
            *p /= total;
        }

        if self.params.top_p < 1.0 {
            #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
            let top_p = self.params.top_p as f32;
            let mut cumulative = 0.0;
            let mut keep = 0;
            for (_, p) in &probs {
                keep += 1;
                cumulative += p;
                if cumulative >= top_p {
                    break;
                }
            }
            probs.truncate(keep.max(1));
        }

        if self.params.min_p > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
            let floor = self.params.min_p as f32 * probs.first().map_or(0.0, |(_, p)| *p);
            probs.retain(|(_, p)| *p >= floor);
        }

        probs
    }

    /// Wrap an index as a [`SampledToken`].
    fn token(&self, index: usize) -> Result<SampledToken> {
        let token = u32::try_from(index)
            .map_err(|_| SteerError::Generation(format!("token index {index} overflows u32")))?;
        Ok(SampledToken {
            token,
            eos: self.eos == Some(token),
        })
    }
}

impl TokenSampler for LogitsSampler {
    fn sample(&mut self, logits: &Tensor, history: &[u32]) -> Result<SampledToken> {
        let mut values: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        self.adjust(&mut values, history);

        if self.params.temperature <= 0.0 {
            let (index, _) = values
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .ok_or_else(|| SteerError::Generation("empty logits".into()))?;
            return self.token(index);
        }

        let candidates = self.candidates(&values);
        let total: f32 = candidates.iter().map(|(_, p)| p).sum();
        if candidates.is_empty() || total <= 0.0 {
            return Err(SteerError::Generation("every token was filtered out".into()));
        }

        let r: f32 = self.rng.r#gen::<f32>() * total;
        let mut cumulative = 0.0;
        for &(index, p) in &candidates {
            cumulative += p;
            if r < cumulative {
                return self.token(index);
            }
        }
        // Floating-point rounding: fall back to the least likely survivor.
        let (index, _) = candidates
            .last()
            .copied()
            .ok_or_else(|| SteerError::Generation("every token was filtered out".into()))?;
        self.token(index)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn greedy_picks_argmax_and_flags_eos() {
        let mut sampler = LogitsSampler::new(&GenerationParams::greedy(), Some(2)).unwrap();
        let picked = sampler.sample(&logits(&[0.1, 0.5, 3.0]), &[]).unwrap();
        assert_eq!(picked, SampledToken { token: 2, eos: true });
    }

    #[test]
    fn banned_eos_is_never_picked() {
        let params = GenerationParams {
            ban_eos_token: true,
            ..GenerationParams::greedy()
        };
        let mut sampler = LogitsSampler::new(&params, Some(2)).unwrap();
        let picked = sampler.sample(&logits(&[0.1, 0.5, 3.0]), &[]).unwrap();
        assert_eq!(picked.token, 1);
        assert!(!picked.eos);
    }

    #[test]
    fn repetition_penalty_demotes_history() {
        let params = GenerationParams {
            repetition_penalty: 10.0,
            ..GenerationParams::greedy()
        };
        let mut sampler = LogitsSampler::new(&params, None).unwrap();
        let picked = sampler.sample(&logits(&[1.0, 2.0, 0.5]), &[1]).unwrap();
        assert_eq!(picked.token, 0);
    }

    #[test]
    fn top_k_one_is_deterministic() {
        let params = GenerationParams {
            temperature: 1.0,
            top_k: 1,
            seed: Some(7),
            ..GenerationParams::default()
        };
        let mut sampler = LogitsSampler::new(&params, None).unwrap();
        for _ in 0..10 {
            let picked = sampler.sample(&logits(&[0.0, 4.0, 1.0]), &[]).unwrap();
            assert_eq!(picked.token, 1);
        }
    }

    #[test]
    fn seeded_samplers_agree() {
        let params = GenerationParams {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            seed: Some(42),
            ..GenerationParams::default()
        };
        let row = logits(&[0.3, 0.2, 0.1, 0.4]);
        let mut a = LogitsSampler::new(&params, None).unwrap();
        let mut b = LogitsSampler::new(&params, None).unwrap();
        for _ in 0..8 {
            assert_eq!(a.sample(&row, &[]).unwrap(), b.sample(&row, &[]).unwrap());
        }
    }
}
