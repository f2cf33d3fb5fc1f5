// SPDX-License-Identifier: MIT OR Apache-2.0

//! Speculative decoding with a small draft model.
//!
//! The draft proposes `k` tokens greedily; the main model scores them in
//! one forward pass. Proposals are accepted while they match what the main
//! model's sampler picks; the first mismatch is replaced by the main
//! model's token. Both caches are rolled back to the accepted length.
//! Only single-row, unsteered requests use this path.

use std::sync::Arc;

use candle_core::{D, IndexOp, Tensor};

use crate::backend::{CausalLm, ForwardOptions};
use crate::cache::KVCache;
use crate::error::{Result, SteerError};
use crate::lora::LoraSet;

use super::sampler::{SampledToken, TokenSampler};

/// A draft model and its private single-row cache.
pub struct DraftModel {
    /// Draft model sharing the main model's vocabulary.
    model: Arc<dyn CausalLm>,
    /// Draft cache.
    cache: KVCache,
    /// Tokens proposed per step.
    num_tokens: usize,
}

impl DraftModel {
    /// Wrap a draft model proposing `num_tokens` tokens per step.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if `num_tokens` is zero.
    pub fn new(model: Arc<dyn CausalLm>, num_tokens: usize) -> Result<Self> {
        if num_tokens == 0 {
            return Err(SteerError::Config("draft must propose at least one token".into()));
        }
        let cache = model.new_cache(1);
        Ok(Self {
            model,
            cache,
            num_tokens,
        })
    }

    /// Tokens proposed per step.
    #[must_use]
    pub const fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// Clear the draft cache.
    pub(crate) fn reset(&mut self) {
        self.cache.clear();
    }

    /// Clear the cache and prefill it with `input` (`[1, seq]`).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] if the forward pass fails.
    pub(crate) fn prefill(&mut self, input: &Tensor) -> Result<()> {
        self.cache.clear();
        let input = input.to_device(self.model.device())?;
        self.model
            .prefill(&input, &mut self.cache, &ForwardOptions::default())
    }

    /// Feed one token to the draft and return its greedy continuation.
    fn propose(&mut self, token: u32) -> Result<u32> {
        let input = Tensor::new(&[[token]], self.model.device())?;
        let logits = self
            .model
            .forward(&input, &mut self.cache, &ForwardOptions::default().last_only())?;
        Ok(logits.i((0, 0))?.argmax(D::Minus1)?.to_scalar::<u32>()?)
    }

    /// Run one draft-and-verify step.
    ///
    /// `last` is the token not yet fed to either model. Returns the accepted
    /// proposals followed by the main model's correction (or bonus) token,
    /// at most `budget` tokens.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] on forward failures and propagates
    /// sampler errors.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn step(
        &mut self,
        main: &dyn CausalLm,
        main_cache: &mut KVCache,
        loras: Option<&LoraSet>,
        last: u32,
        history: &[u32],
        sampler: &mut dyn TokenSampler,
        budget: usize,
    ) -> Result<Vec<SampledToken>> {
        let base = main_cache.seq_len()?;
        let k = self.num_tokens.min(budget.saturating_sub(1)).max(1);

        let mut proposals = Vec::with_capacity(k);
        let mut feed = last;
        for _ in 0..k {
            feed = self.propose(feed)?;
            proposals.push(feed);
        }

        let mut verify_ids = Vec::with_capacity(k + 1);
        verify_ids.push(last);
        verify_ids.extend_from_slice(&proposals);
        let input = Tensor::from_vec(verify_ids, (1, k + 1), main.device())?;
        let mut options = ForwardOptions::default();
        if let Some(loras) = loras {
            options = options.with_loras(loras);
        }
        let logits = main.forward(&input, main_cache, &options)?.i(0)?;

        let mut context = history.to_vec();
        let mut out = Vec::with_capacity(k + 1);
        let mut accepted = 0;
        for (position, &proposal) in proposals.iter().enumerate() {
            let picked = sampler.sample(&logits.i(position)?, &context)?;
            out.push(picked);
            if picked.token != proposal || picked.eos {
                break;
            }
            accepted += 1;
            context.push(proposal);
        }
        if accepted == k {
            out.push(sampler.sample(&logits.i(k)?, &context)?);
        }
        out.truncate(budget.max(1));

        // Cache keeps `last` plus the accepted proposals; the correction
        // token is fed at the next step.
        let keep = base + 1 + accepted;
        main_cache.truncate(keep)?;
        if self.cache.seq_len()? < keep {
            if let Some(&tail) = proposals.last() {
                self.propose(tail)?;
            }
        }
        self.cache.truncate(keep)?;

        tracing::trace!(proposed = k, accepted, "speculative step");
        Ok(out)
    }
}

impl std::fmt::Debug for DraftModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DraftModel")
            .field("num_tokens", &self.num_tokens)
            .finish_non_exhaustive()
    }
}
