// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generation session: the owner of the cache and of the steering state
//! attached for one request.
//!
//! A request follows a fixed lifecycle:
//!
//! 1. [`GenerationSession::attach`] binds a [`PromptBatch`] and a
//!    [`SteeringConfiguration`], reallocating the cache when its batch
//!    dimension differs.
//! 2. [`GenerationSession::generate`] encodes every row, prefills the cache
//!    and returns a [`TextStream`].
//! 3. Each decode step samples row 0 only and replays its token into every
//!    row, so all rows share one appended sequence.
//! 4. When the stream ends (completion, stop signal, error or drop) the
//!    steering state is detached.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{IndexOp, Tensor};

use crate::backend::{CausalLm, ForwardOptions};
use crate::cache::KVCache;
use crate::error::{Result, SteerError};
use crate::lora::LoraSet;
use crate::prompt::PromptBatch;
use crate::steering::{ActiveSteering, SteeringConfiguration};
use crate::tokenizer::{TextTokenizer, encode_batch};

use super::params::GenerationParams;
use super::sampler::{LogitsSampler, TokenSampler};
use super::speculative::DraftModel;
use super::stream::TextStream;

// ---------------------------------------------------------------------------
// StopSignal
// ---------------------------------------------------------------------------

/// Shared flag that ends generation at the next decode step.
///
/// The session lowers the flag when a request ends. A signal raised while
/// no request is running (for example between [`prepare`](crate::prepare)
/// and [`GenerationSession::generate`]) cancels the next request before
/// its first token.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// New, unraised signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the signal is raised.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Lower the signal.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// OtherPromptOutputs
// ---------------------------------------------------------------------------

/// Continuations the extra rows sampled on their own, keyed by row index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OtherPromptOutputs {
    /// Extra positive rows `1..numpos`.
    pub positive: Vec<(usize, String)>,
    /// Negative rows `numpos..negend`.
    pub negative: Vec<(usize, String)>,
}

// ---------------------------------------------------------------------------
// Attached steering
// ---------------------------------------------------------------------------

/// Steering state bound to a session for one request.
struct AttachedSteering {
    /// Rendered prompts and row layout.
    batch: PromptBatch,
    /// Rule table.
    config: SteeringConfiguration,
    /// Sample every row independently for diagnostics.
    sample_other_prompts: bool,
}

// ---------------------------------------------------------------------------
// DecodeState
// ---------------------------------------------------------------------------

/// Mutable state of one running request.
pub(crate) struct DecodeState {
    /// Left padding of each row.
    padding: Vec<usize>,
    /// Token fed to each row at the next step.
    next_input: Vec<u32>,
    /// Unpadded prompt plus appended ids, per row.
    histories: Vec<Vec<u32>>,
    /// Ids appended to each row's running sequence.
    appended: Vec<Vec<u32>>,
    /// Ids each extra row sampled on its own (diagnostics).
    other_tokens: Vec<Vec<u32>>,
    /// Samplers for the extra rows (diagnostics only).
    other_samplers: Vec<LogitsSampler>,
    /// Sampler for row 0.
    sampler: LogitsSampler,
    /// Tokens emitted so far.
    generated: usize,
    /// Token budget.
    max_new_tokens: usize,
    /// No further steps will run.
    finished: bool,
}

impl DecodeState {
    /// Ids appended to every row so far.
    pub(crate) fn appended(&self) -> &[Vec<u32>] {
        &self.appended
    }

    /// Replay `token` into every row.
    fn append(&mut self, token: u32) {
        for (history, appended) in self.histories.iter_mut().zip(&mut self.appended) {
            history.push(token);
            appended.push(token);
        }
        self.next_input.iter_mut().for_each(|t| *t = token);
        self.generated += 1;
    }
}

// ---------------------------------------------------------------------------
// GenerationSession
// ---------------------------------------------------------------------------

/// A model, its tokenizer and cache, plus the steering state of the
/// request in flight.
pub struct GenerationSession {
    /// Main model.
    model: Arc<dyn CausalLm>,
    /// Tokenizer shared by every row.
    tokenizer: Arc<dyn TextTokenizer>,
    /// Key/value cache sized to the current batch.
    cache: KVCache,
    /// Steering state for the request in flight.
    steering: Option<AttachedSteering>,
    /// Adapters applied on every forward pass.
    loras: Option<LoraSet>,
    /// Optional speculative draft model.
    draft: Option<DraftModel>,
    /// External stop flag.
    stop: StopSignal,
    /// Diagnostics of the last steered request.
    other_outputs: Option<OtherPromptOutputs>,
    /// A steering fallback has already been reported.
    fallback_reported: bool,
}

impl GenerationSession {
    /// Create a session with a single-row cache.
    #[must_use]
    pub fn new(model: Arc<dyn CausalLm>, tokenizer: Arc<dyn TextTokenizer>) -> Self {
        let cache = model.new_cache(1);
        Self {
            model,
            tokenizer,
            cache,
            steering: None,
            loras: None,
            draft: None,
            stop: StopSignal::new(),
            other_outputs: None,
            fallback_reported: false,
        }
    }

    /// Use `draft` for speculative decoding on unsteered requests.
    #[must_use]
    pub fn with_draft(mut self, draft: DraftModel) -> Self {
        self.draft = Some(draft);
        self
    }

    /// Apply `loras` on every forward pass.
    #[must_use]
    pub fn with_loras(mut self, loras: LoraSet) -> Self {
        self.loras = Some(loras);
        self
    }

    /// The main model.
    #[must_use]
    pub fn model(&self) -> &dyn CausalLm {
        self.model.as_ref()
    }

    /// The tokenizer.
    #[must_use]
    pub fn tokenizer(&self) -> &dyn TextTokenizer {
        self.tokenizer.as_ref()
    }

    /// Handle to the stop flag, for another thread to raise.
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Whether a draft model is configured.
    #[must_use]
    pub const fn has_draft(&self) -> bool {
        self.draft.is_some()
    }

    /// Whether steering state is attached.
    #[must_use]
    pub const fn is_steering_attached(&self) -> bool {
        self.steering.is_some()
    }

    /// Batch dimension of the current cache.
    #[must_use]
    pub const fn cache_batch_size(&self) -> usize {
        self.cache.batch_size()
    }

    /// Diagnostics gathered by the last steered request that sampled the
    /// other prompts.
    #[must_use]
    pub const fn other_prompt_outputs(&self) -> Option<&OtherPromptOutputs> {
        self.other_outputs.as_ref()
    }

    /// Report, once per session, that steering fell back to a single prompt.
    pub(crate) fn report_fallback(&mut self, reason: &str) {
        if !self.fallback_reported {
            self.fallback_reported = true;
            tracing::warn!(reason, "steering unavailable, generating from the plain prompt");
        }
    }

    /// Attach a prompt batch and rule table for the next request.
    ///
    /// The cache is reallocated when its batch dimension differs from the
    /// batch size.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`] if the model cannot steer, a draft
    /// model is configured, or the table was resolved for a different
    /// layer count.
    pub fn attach(
        &mut self,
        batch: PromptBatch,
        config: SteeringConfiguration,
        sample_other_prompts: bool,
    ) -> Result<()> {
        if self.model.as_steering_capable().is_none() {
            return Err(SteerError::Steering("model does not support steering".into()));
        }
        if self.draft.is_some() {
            return Err(SteerError::Steering(
                "steering cannot run alongside speculative decoding".into(),
            ));
        }
        if config.num_layers() != self.model.num_layers() {
            return Err(SteerError::Steering(format!(
                "steering table has {} layers, model has {}",
                config.num_layers(),
                self.model.num_layers()
            )));
        }
        self.resize_cache(batch.batch_size());
        tracing::debug!(
            numpos = batch.numpos(),
            numneg = batch.numneg(),
            "steering attached"
        );
        self.steering = Some(AttachedSteering {
            batch,
            config,
            sample_other_prompts,
        });
        Ok(())
    }

    /// Remove the attached steering state. A no-op when nothing is attached.
    pub fn detach(&mut self) {
        if self.steering.take().is_some() {
            tracing::debug!("steering detached");
        }
    }

    /// Start generating from `prompt`, or from the attached batch when
    /// steering is attached (row 0 of the batch replaces `prompt`).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if encoding fails and
    /// [`SteerError::Model`] if the prefill pass fails. The steering state
    /// is detached and the stop signal lowered before an error is returned.
    ///
    /// A stop signal raised before this call is honoured: the stream then
    /// ends without producing a token.
    pub fn generate(&mut self, prompt: &str, params: &GenerationParams) -> Result<TextStream<'_>> {
        match self.begin(prompt, params) {
            Ok(state) => Ok(TextStream::new(self, state)),
            Err(e) => {
                self.stop.reset();
                self.detach();
                Err(e)
            }
        }
    }

    /// Run [`generate`](Self::generate) to completion and collect the text.
    ///
    /// # Errors
    ///
    /// Propagates the first error of the stream.
    pub fn generate_text(&mut self, prompt: &str, params: &GenerationParams) -> Result<String> {
        self.generate(prompt, params)?.collect()
    }

    /// Replace the cache when its batch dimension differs.
    fn resize_cache(&mut self, batch_size: usize) {
        if self.cache.batch_size() != batch_size {
            tracing::info!(
                from = self.cache.batch_size(),
                to = batch_size,
                "reallocating KV cache for batch size"
            );
            self.cache = self.model.new_cache(batch_size);
        }
    }

    /// Encode, prefill and build the decode state.
    fn begin(&mut self, prompt: &str, params: &GenerationParams) -> Result<DecodeState> {
        self.other_outputs = None;

        let prompts: Vec<String> = match &self.steering {
            Some(attached) => attached.batch.prompts().to_vec(),
            None => vec![prompt.to_owned()],
        };
        let pad_id = self
            .tokenizer
            .pad_token_id()
            .or_else(|| self.tokenizer.eos_token_id())
            .unwrap_or(0);
        let encoded = encode_batch(
            self.tokenizer.as_ref(),
            &prompts,
            params.add_bos_token,
            params.encode_special_tokens,
            pad_id,
            params.max_prompt_length(),
        )?;
        let rows = encoded.rows();
        let width = encoded.width();

        self.resize_cache(rows);
        self.cache.clear();

        let histories: Vec<Vec<u32>> = (0..rows)
            .map(|r| {
                let pad = encoded.padding().get(r).copied().unwrap_or(0);
                encoded
                    .row(r)
                    .map(|ids| ids.get(pad..).unwrap_or_default().to_vec())
                    .unwrap_or_default()
            })
            .collect();
        let next_input: Vec<u32> = (0..rows)
            .filter_map(|r| encoded.row(r).and_then(<[u32]>::last).copied())
            .collect();

        if width > 1 {
            let prefix: Vec<u32> = (0..rows)
                .filter_map(|r| encoded.row(r))
                .flat_map(|ids| ids.iter().take(width - 1).copied())
                .collect();
            let input = Tensor::from_vec(prefix, (rows, width - 1), self.model.device())?;
            let options =
                forward_options(self.loras.as_ref(), self.steering.as_ref(), encoded.padding());
            self.model.prefill(&input, &mut self.cache, &options)?;
            if let Some(draft) = self.draft.as_mut() {
                draft.prefill(&input)?;
            }
        } else if let Some(draft) = self.draft.as_mut() {
            draft.reset();
        }

        let eos = self.tokenizer.eos_token_id();
        let sampler = LogitsSampler::new(params, eos)?;
        let sample_others = self
            .steering
            .as_ref()
            .is_some_and(|attached| attached.sample_other_prompts);
        let other_samplers = if sample_others {
            (1..rows)
                .map(|r| {
                    let mut row_params = params.clone();
                    let offset = u64::try_from(r).unwrap_or(u64::MAX);
                    row_params.seed = params.seed.map(|s| s.wrapping_add(offset));
                    LogitsSampler::new(&row_params, eos)
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        tracing::debug!(rows, width, steered = self.steering.is_some(), "generation started");

        Ok(DecodeState {
            padding: encoded.padding().to_vec(),
            next_input,
            histories,
            appended: vec![Vec::new(); rows],
            other_tokens: vec![Vec::new(); rows],
            other_samplers,
            sampler,
            generated: 0,
            max_new_tokens: params.max_new_tokens_for(width),
            finished: false,
        })
    }

    /// Run one decode step and return the tokens emitted to the caller.
    ///
    /// Returns `Ok(None)` once generation has finished.
    pub(crate) fn step(&mut self, state: &mut DecodeState) -> Result<Option<Vec<u32>>> {
        if state.finished {
            return Ok(None);
        }
        if self.stop.is_stopped() || state.generated >= state.max_new_tokens {
            state.finished = true;
            return Ok(None);
        }

        if self.draft.is_some() && self.steering.is_none() {
            return self.speculative_step(state);
        }

        let rows = state.next_input.len();
        let input = Tensor::from_vec(state.next_input.clone(), (rows, 1), self.model.device())?;
        let options =
            forward_options(self.loras.as_ref(), self.steering.as_ref(), &state.padding);
        let logits = self.model.forward(&input, &mut self.cache, &options)?;
        // [rows, 1, vocab] -> [rows, vocab]
        let logits = logits.squeeze(1)?;

        let row0 = logits.i(0)?;
        let history0 = state.histories.first().map(Vec::as_slice).unwrap_or_default();
        let picked = state.sampler.sample(&row0, history0)?;

        for (offset, sampler) in state.other_samplers.iter_mut().enumerate() {
            let row = offset + 1;
            let history = state.histories.get(row).map(Vec::as_slice).unwrap_or_default();
            let own = sampler.sample(&logits.i(row)?, history)?;
            if let Some(tokens) = state.other_tokens.get_mut(row) {
                tokens.push(own.token);
            }
        }

        if picked.eos {
            state.finished = true;
            return Ok(None);
        }
        state.append(picked.token);
        Ok(Some(vec![picked.token]))
    }

    /// Draft-and-verify step for unsteered single-row requests.
    fn speculative_step(&mut self, state: &mut DecodeState) -> Result<Option<Vec<u32>>> {
        let Some(draft) = self.draft.as_mut() else {
            return Ok(None);
        };
        let last = state.next_input.first().copied().unwrap_or(0);
        let history = state.histories.first().cloned().unwrap_or_default();
        let budget = state.max_new_tokens - state.generated;
        let accepted = draft.step(
            self.model.as_ref(),
            &mut self.cache,
            self.loras.as_ref(),
            last,
            &history,
            &mut state.sampler,
            budget,
        )?;

        let mut emitted = Vec::with_capacity(accepted.len());
        for picked in accepted {
            if picked.eos {
                state.finished = true;
                break;
            }
            state.append(picked.token);
            emitted.push(picked.token);
        }
        if emitted.is_empty() {
            state.finished = true;
            return Ok(None);
        }
        Ok(Some(emitted))
    }

    /// End the request: decode diagnostics, lower the stop signal, then
    /// detach.
    pub(crate) fn finish(&mut self, state: &mut DecodeState) {
        state.finished = true;
        self.stop.reset();
        if let Some(attached) = &self.steering {
            if attached.sample_other_prompts {
                let outputs = self.decode_other_outputs(attached.batch.numpos(), state);
                for (row, text) in &outputs.positive {
                    tracing::info!(row, text = %text, "extra positive prompt continuation");
                }
                for (row, text) in &outputs.negative {
                    tracing::info!(row, text = %text, "negative prompt continuation");
                }
                self.other_outputs = Some(outputs);
            }
        }
        self.detach();
    }

    /// Decode each extra row's own samples, grouped by polarity.
    fn decode_other_outputs(&self, numpos: usize, state: &DecodeState) -> OtherPromptOutputs {
        let mut outputs = OtherPromptOutputs::default();
        for (row, tokens) in state.other_tokens.iter().enumerate().skip(1) {
            let text = match self.tokenizer.decode(tokens) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(row, error = %e, "failed to decode diagnostic row");
                    continue;
                }
            };
            if row < numpos {
                outputs.positive.push((row, text));
            } else {
                outputs.negative.push((row, text));
            }
        }
        outputs
    }
}

/// Forward options for the request in flight.
fn forward_options<'a>(
    loras: Option<&'a LoraSet>,
    steering: Option<&'a AttachedSteering>,
    padding: &'a [usize],
) -> ForwardOptions<'a> {
    let mut options = ForwardOptions::default().with_padding(padding).last_only();
    if let Some(loras) = loras {
        options = options.with_loras(loras);
    }
    if let Some(attached) = steering {
        options = options.with_steering(ActiveSteering::new(
            &attached.config,
            attached.batch.layout(),
        ));
    }
    options
}

impl std::fmt::Debug for GenerationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSession")
            .field("cache_batch_size", &self.cache.batch_size())
            .field("steering_attached", &self.steering.is_some())
            .field("draft", &self.draft.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_is_shared() {
        let signal = StopSignal::new();
        let handle = signal.clone();
        assert!(!signal.is_stopped());
        handle.stop();
        assert!(signal.is_stopped());
        signal.reset();
        assert!(!handle.is_stopped());
    }

    #[test]
    fn append_replays_token_into_every_row() {
        let mut state = DecodeState {
            padding: vec![0, 1],
            next_input: vec![5, 6],
            histories: vec![vec![5], vec![6]],
            appended: vec![Vec::new(); 2],
            other_tokens: vec![Vec::new(); 2],
            other_samplers: Vec::new(),
            sampler: LogitsSampler::new(&GenerationParams::greedy(), None).unwrap(),
            generated: 0,
            max_new_tokens: 4,
            finished: false,
        };
        state.append(9);
        state.append(3);
        assert_eq!(state.next_input, vec![3, 3]);
        assert_eq!(state.appended()[0], state.appended()[1]);
        assert_eq!(state.histories[1], vec![6, 9, 3]);
        assert_eq!(state.generated, 2);
    }
}
