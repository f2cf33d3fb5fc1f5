// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generic decoder-only transformer with a steered, batched forward pass.
//!
//! One implementation covers `LLaMA`, Mistral, `Qwen2` and Gemma,
//! parameterized by [`TransformerConfig`]. Every layer exposes the six
//! steering sites of [`SteeringSite`] in forward order:
//!
//! ```text
//! h   -> input norm -> q, k, v (after rope) -> attention -> + residual -> a
//!     -> post-attention norm -> MLP -> + residual -> r
//! ```

pub(crate) mod attention;
pub(crate) mod mlp;
pub(crate) mod norm;
pub(crate) mod rope;

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

use crate::backend::{CausalLm, ForwardOptions, SteeringCapable};
use crate::cache::KVCache;
use crate::config::TransformerConfig;
use crate::error::{Result, SteerError};
use crate::steering::{ActiveSteering, SteeringPoint, SteeringSite};
use crate::util::masks;

use self::attention::{Attention, AttentionInput};
use self::mlp::Mlp;
use self::norm::Norm;
use self::rope::{RopeCache, RotaryTables};

// ---------------------------------------------------------------------------
// TransformerLayer
// ---------------------------------------------------------------------------

/// A single transformer decoder layer and the device it lives on.
struct TransformerLayer {
    /// Pre-attention norm.
    input_norm: Norm,
    /// Self-attention block.
    attention: Attention,
    /// Pre-MLP norm (`post_attention_layernorm`).
    post_attention_norm: Norm,
    /// MLP block.
    mlp: Mlp,
    /// Device holding this layer's weights and cache entries.
    device: Device,
}

impl TransformerLayer {
    /// Load a single decoder layer from weights.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            input_norm: Norm::load(
                config.norm_type,
                config.hidden_size,
                config.norm_eps,
                vb.pp("input_layernorm"),
            )?,
            attention: Attention::load(config, vb.pp("self_attn"))?,
            post_attention_norm: Norm::load(
                config.norm_type,
                config.hidden_size,
                config.norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(config, vb.pp("mlp"))?,
            device: vb.device().clone(),
        })
    }

    /// Copy of this layer on `device`.
    fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            input_norm: self.input_norm.to_device(device)?,
            attention: self.attention.to_device(device)?,
            post_attention_norm: self.post_attention_norm.to_device(device)?,
            mlp: self.mlp.to_device(device)?,
            device: device.clone(),
        })
    }

    /// Run the layer, applying any steering rules bound for `layer`.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, q_len, hidden_size]`
    /// - returns: `[batch, q_len, hidden_size]`
    fn forward(
        &self,
        hidden: &Tensor,
        layer: usize,
        input: &AttentionInput<'_>,
        cache: &mut KVCache,
    ) -> Result<Tensor> {
        let steer = |site: SteeringSite, x: Tensor| -> Result<Tensor> {
            match input.steering {
                Some(steering) => steering.apply(SteeringPoint::new(layer, site), &x),
                None => Ok(x),
            }
        };

        let hidden = steer(SteeringSite::Hidden, hidden.clone())?;

        let attn = self
            .attention
            .forward(&self.input_norm.forward(&hidden)?, layer, input, cache)?;
        let hidden = steer(SteeringSite::AttnOut, (hidden + attn)?)?;

        let mlp = self.mlp.forward(&self.post_attention_norm.forward(&hidden)?)?;
        steer(SteeringSite::Residual, (hidden + mlp)?)
    }
}

// ---------------------------------------------------------------------------
// GenericTransformer
// ---------------------------------------------------------------------------

/// Config-driven decoder-only transformer implementing [`CausalLm`] and
/// [`SteeringCapable`].
///
/// Every layer exposes the attention sites, so
/// [`attention_layers`](SteeringCapable::attention_layers) lists all layers.
pub struct GenericTransformer {
    /// Token embedding matrix.
    embed_tokens: Embedding,
    /// Decoder layers.
    layers: Vec<TransformerLayer>,
    /// Final normalization before the LM head.
    final_norm: Norm,
    /// LM head. `None` when tied to `embed_tokens`.
    lm_head: Option<Linear>,
    /// Pre-computed `RoPE` cos/sin cache (on the embedding device).
    rope_cache: RopeCache,
    /// Model configuration.
    config: TransformerConfig,
    /// Device of the embedding, final norm and head.
    device: Device,
    /// Compute dtype.
    dtype: DType,
    /// Number of trailing vocabulary columns that are padding.
    head_padding: usize,
}

impl GenericTransformer {
    /// Load a generic transformer from a [`VarBuilder`].
    ///
    /// The caller constructs the `VarBuilder` (safe, mmap, or a `VarMap`)
    /// and provides the parsed `TransformerConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] if weight loading fails or dimensions
    /// are inconsistent.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        config: TransformerConfig,
        device: &Device,
        dtype: DType,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let vb_model = vb.pp("model");

        let embed_tokens = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(TransformerLayer::load(&config, vb_model.pp(format!("layers.{i}")))?);
        }

        let final_norm = Norm::load(
            config.norm_type,
            config.hidden_size,
            config.norm_eps,
            vb_model.pp("norm"),
        )?;

        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(candle_nn::linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        let rope_cache = RopeCache::new(
            config.head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            device,
            dtype,
        )?;

        tracing::debug!(
            family = %config.family,
            layers = config.num_layers,
            hidden = config.hidden_size,
            "transformer loaded"
        );

        Ok(Self {
            embed_tokens,
            layers,
            final_norm,
            lm_head,
            rope_cache,
            config,
            device: device.clone(),
            dtype,
            head_padding: 0,
        })
    }

    /// Load, then place decoder layer `i` on `layer_devices[i]`.
    ///
    /// Weights are read on `device` and copied to their layer's device.
    /// The embedding, final norm and head stay on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if `layer_devices` does not have one
    /// entry per layer, and [`SteerError::Model`] if loading or copying fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load_with_devices(
        config: TransformerConfig,
        device: &Device,
        dtype: DType,
        vb: VarBuilder<'_>,
        layer_devices: &[Device],
    ) -> Result<Self> {
        if layer_devices.len() != config.num_layers {
            return Err(SteerError::Config(format!(
                "{} layer devices given for {} layers",
                layer_devices.len(),
                config.num_layers
            )));
        }
        let mut model = Self::load(config, device, dtype, vb)?;
        for (layer, target) in model.layers.iter_mut().zip(layer_devices) {
            if !layer.device.same_device(target) {
                *layer = layer.to_device(target)?;
            }
        }
        Ok(model)
    }

    /// Mark the last `columns` vocabulary entries as padding; their logits
    /// are forced to the dtype's negative-infinity sentinel.
    #[must_use]
    pub fn with_head_padding(mut self, columns: usize) -> Self {
        self.head_padding = columns.min(self.config.vocab_size);
        self
    }

    /// Access the model configuration.
    #[must_use]
    pub const fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Compute dtype.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// Run the layers, returning the final hidden state on the embedding
    /// device.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, q_len]`
    /// - returns: `[batch, q_len, hidden_size]`
    fn run_layers(
        &self,
        input_ids: &Tensor,
        cache: &mut KVCache,
        options: &ForwardOptions<'_>,
    ) -> Result<Tensor> {
        let (batch, q_len) = input_ids.dims2()?;
        let past_len = cache.seq_len()?;

        let no_padding;
        let padding = match options.padding {
            Some(padding) if padding.len() == batch => padding,
            Some(padding) => {
                return Err(SteerError::Steering(format!(
                    "padding has {} rows but the batch has {batch}",
                    padding.len()
                )));
            }
            None => {
                no_padding = vec![0; batch];
                &no_padding
            }
        };

        let mut mask = masks::batch_attention_mask(
            padding,
            q_len,
            past_len,
            self.config.sliding_window,
            &self.device,
            self.dtype,
        )?;
        let positions = masks::row_positions(padding, q_len, past_len, &self.device)?;
        let mut rotary: RotaryTables = self.rope_cache.gather(&positions)?;

        let mut hidden = self
            .embed_tokens
            .forward(&input_ids.to_device(&self.device)?)?;
        if let Some(scale) = self.config.embedding_scale {
            hidden = (hidden * scale)?;
        }

        let steering: Option<&ActiveSteering<'_>> = options.steering.as_ref();
        let mut current = self.device.clone();
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            if !layer.device.same_device(&current) {
                hidden = hidden.to_device(&layer.device)?;
                mask = mask.to_device(&layer.device)?;
                rotary = rotary.to_device(&layer.device)?;
                current = layer.device.clone();
            }
            let input = AttentionInput {
                mask: &mask,
                rotary: &rotary,
                loras: options.loras,
                steering,
            };
            hidden = layer.forward(&hidden, layer_idx, &input, cache)?;
        }

        Ok(hidden.to_device(&self.device)?)
    }

    /// Project hidden states to vocabulary logits.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, vocab_size]`
    fn project_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let logits = if let Some(head) = &self.lm_head {
            head.forward(hidden)?
        } else {
            // Tied embeddings: logits = hidden @ embed_tokens^T
            hidden.broadcast_matmul(&self.embed_tokens.embeddings().t()?)?
        };
        self.mask_head_padding(logits)
    }

    /// Force the padding columns to the negative-infinity sentinel.
    fn mask_head_padding(&self, logits: Tensor) -> Result<Tensor> {
        if self.head_padding == 0 {
            return Ok(logits);
        }
        let vocab = logits.dim(D::Minus1)?;
        let real = vocab.saturating_sub(self.head_padding);
        let mut pad_shape = logits.dims().to_vec();
        if let Some(last) = pad_shape.last_mut() {
            *last = vocab - real;
        }
        let sentinel = Tensor::full(negative_infinity(logits.dtype()), pad_shape, logits.device())?
            .to_dtype(logits.dtype())?;
        let kept = logits.narrow(D::Minus1, 0, real)?;
        Ok(Tensor::cat(&[&kept, &sentinel], D::Minus1)?)
    }
}

/// Most negative value `dtype` can hold for masking: `-65504` for F16,
/// `-inf` otherwise.
#[must_use]
pub fn negative_infinity(dtype: DType) -> f32 {
    if dtype == DType::F16 {
        -65504.0
    } else {
        f32::NEG_INFINITY
    }
}

// ---------------------------------------------------------------------------
// CausalLm / SteeringCapable implementation
// ---------------------------------------------------------------------------

impl CausalLm for GenericTransformer {
    fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        cache: &mut KVCache,
        options: &ForwardOptions<'_>,
    ) -> Result<Tensor> {
        let hidden = self.run_layers(input_ids, cache, options)?;
        let hidden = if options.last_only {
            let seq = hidden.dim(1)?;
            hidden.narrow(1, seq.saturating_sub(1), 1)?
        } else {
            hidden
        };
        let hidden = self.final_norm.forward(&hidden)?;
        self.project_logits(&hidden)
    }

    fn prefill(
        &self,
        input_ids: &Tensor,
        cache: &mut KVCache,
        options: &ForwardOptions<'_>,
    ) -> Result<()> {
        self.run_layers(input_ids, cache, options)?;
        Ok(())
    }

    fn as_steering_capable(&self) -> Option<&dyn SteeringCapable> {
        Some(self)
    }
}

impl SteeringCapable for GenericTransformer {
    fn attention_layers(&self) -> Vec<usize> {
        (0..self.config.num_layers).collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Copy a linear layer's weight and bias to `device`.
pub(crate) fn linear_to_device(linear: &Linear, device: &Device) -> Result<Linear> {
    let weight = linear.weight().to_device(device)?;
    let bias = linear.bias().map(|b| b.to_device(device)).transpose()?;
    Ok(Linear::new(weight, bias))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
