// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generation parameters as sent by the host.

use serde::Deserialize;

use crate::error::{Result, SteerError};

/// Sampling and length settings for one request.
///
/// Deserializes from the host's JSON settings; every field has a default.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate.
    pub max_new_tokens: usize,
    /// Derive `max_new_tokens` from the room left after the prompt.
    pub auto_max_new_tokens: bool,
    /// Context length available to prompt plus completion.
    pub truncation_length: usize,
    /// Prefix every prompt with the tokenizer's BOS token.
    pub add_bos_token: bool,
    /// Ban the end-of-sequence token.
    pub ban_eos_token: bool,
    /// Comma-separated token ids that are never sampled.
    pub custom_token_bans: String,
    /// Treat special-token strings in prompts as special ids.
    pub encode_special_tokens: bool,
    /// Softmax temperature. `0` selects greedy decoding.
    pub temperature: f64,
    /// Keep the `top_k` most likely tokens. `0` disables.
    pub top_k: usize,
    /// Nucleus threshold. `1.0` disables.
    pub top_p: f64,
    /// Drop tokens below `min_p * p_max`. `0` disables.
    pub min_p: f64,
    /// Penalty applied to recently generated tokens. `1.0` disables.
    pub repetition_penalty: f64,
    /// Number of recent tokens the penalty looks at. `0` means all.
    pub repetition_penalty_range: usize,
    /// RNG seed. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 200,
            auto_max_new_tokens: false,
            truncation_length: 2048,
            add_bos_token: true,
            ban_eos_token: false,
            custom_token_bans: String::new(),
            encode_special_tokens: true,
            temperature: 0.7,
            top_k: 20,
            top_p: 0.9,
            min_p: 0.0,
            repetition_penalty: 1.15,
            repetition_penalty_range: 1024,
            seed: None,
        }
    }
}

impl GenerationParams {
    /// Greedy decoding with no penalties.
    #[must_use]
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            ..Self::default()
        }
    }

    /// Longest prompt, in tokens, that still leaves room for the completion.
    #[must_use]
    pub const fn max_prompt_length(&self) -> usize {
        if self.auto_max_new_tokens {
            self.truncation_length
        } else {
            self.truncation_length.saturating_sub(self.max_new_tokens)
        }
    }

    /// Token budget for a prompt of `prompt_len` tokens.
    #[must_use]
    pub const fn max_new_tokens_for(&self, prompt_len: usize) -> usize {
        if self.auto_max_new_tokens {
            self.truncation_length.saturating_sub(prompt_len)
        } else {
            self.max_new_tokens
        }
    }

    /// Parse [`custom_token_bans`](Self::custom_token_bans).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if an entry is not a token id.
    pub fn banned_tokens(&self) -> Result<Vec<u32>> {
        self.custom_token_bans
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u32>()
                    .map_err(|_| SteerError::Config(format!("invalid token ban '{s}'")))
            })
            .collect()
    }
}
