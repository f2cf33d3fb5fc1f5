// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-steer
//!
//! Contrastive prompt steering for batched transformer generation, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! A chat turn is rendered into a batch of prompt variants: one primary
//! positive prompt, optional extra positive variants, and negative variants
//! described by `[[NAME]]` regions in the character context and system
//! message. The batch runs through the model in lock-step. At configured
//! layer sites (hidden input, query, key, value, attention output, residual)
//! the negative rows are blended into the positive rows, classifier-free
//! guidance style. Only row 0 is sampled; its token is replayed into every
//! row.
//!
//! ## Pipeline
//!
//! - [`prompt`]: region parsing, chat rendering and prompt batch building.
//! - [`steering`]: per-layer, per-site rule tables and their JSON settings.
//! - [`transformer`]: a generic `LLaMA`/Mistral/`Qwen2`/Gemma forward pass
//!   with the steering sites built in (feature: `transformer`).
//! - [`generation`]: the session, sampler and text stream.
//! - [`request`]: glue from chat state to a prepared session.

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod generation;
pub mod lora;
pub mod prompt;
pub mod request;
pub mod steering;
pub mod tokenizer;
#[cfg(feature = "transformer")]
pub mod transformer;
pub mod util;

pub use backend::{CausalLm, ForwardOptions, SteeringCapable};
pub use cache::KVCache;
pub use config::{Activation, ModelFamily, NormType, TransformerConfig};
pub use error::{Result, SteerError};
pub use generation::{
    DraftModel, GenerationParams, GenerationSession, LogitsSampler, OtherPromptOutputs,
    SampledToken, StopSignal, TextStream, TokenSampler,
};
pub use lora::{LoraAdapter, LoraSet, LoraTarget};
pub use prompt::{
    ChatMessage, ChatMlTemplate, ChatMode, ChatRenderer, ChatState, ChatTemplate,
    NamedChatTemplate, ParsedRegions, PromptBatch, RenderOptions, Role,
};
pub use request::{ChipOptions, SteeringRequest, prepare};
pub use steering::{
    ActiveSteering, AttentionSteering, BatchLayout, CombineFn, LayerSelector, SteeringConfiguration,
    SteeringPoint, SteeringRule, SteeringSettings, SteeringSite, default_blend,
};
pub use tokenizer::{EncodedBatch, HfTokenizer, TextTokenizer, encode_batch};
#[cfg(feature = "transformer")]
pub use transformer::GenericTransformer;
