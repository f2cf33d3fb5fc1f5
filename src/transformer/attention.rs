// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batched multi-head attention with GQA, a KV cache and steering sites.
//!
//! Queries, keys and values are steered after projection and rotary
//! embedding, before the keys and values enter the cache, so cached
//! entries already carry the blended signal of every earlier step.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::cache::KVCache;
use crate::config::TransformerConfig;
use crate::error::Result;
use crate::lora::{LoraSet, LoraTarget, apply_lora};
use crate::steering::{ActiveSteering, SteeringPoint, SteeringSite};

use super::linear_to_device;
use super::rope::RotaryTables;

// ---------------------------------------------------------------------------
// AttentionInput
// ---------------------------------------------------------------------------

/// Per-step state shared by every attention layer on one device.
pub(crate) struct AttentionInput<'a> {
    /// Additive mask: `[batch, 1, q_len, past_len + q_len]`.
    pub mask: &'a Tensor,
    /// Rotary tables gathered for this step's positions.
    pub rotary: &'a RotaryTables,
    /// Optional low-rank adapters.
    pub loras: Option<&'a LoraSet>,
    /// Optional steering bound to the batch layout.
    pub steering: Option<&'a ActiveSteering<'a>>,
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

/// Multi-head attention layer with separate Q/K/V projections.
pub struct Attention {
    /// Query projection.
    q_proj: Linear,
    /// Key projection.
    k_proj: Linear,
    /// Value projection.
    v_proj: Linear,
    /// Output projection.
    o_proj: Linear,
    /// Number of query heads.
    num_attention_heads: usize,
    /// Number of key/value heads.
    num_kv_heads: usize,
    /// Dimension per head.
    head_dim: usize,
    /// `1 / sqrt(head_dim)`.
    scale: f64,
}

impl Attention {
    /// Load attention weights from a [`VarBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) if weight
    /// loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let q_dim = config.num_attention_heads * config.head_dim;
        let kv_dim = config.num_kv_heads * config.head_dim;
        let hidden = config.hidden_size;

        let projection = |out: usize, name: &str| -> Result<Linear> {
            if config.qkv_bias {
                Ok(candle_nn::linear(hidden, out, vb.pp(name))?)
            } else {
                Ok(candle_nn::linear_no_bias(hidden, out, vb.pp(name))?)
            }
        };

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = 1.0 / (config.head_dim as f64).sqrt();

        Ok(Self {
            q_proj: projection(q_dim, "q_proj")?,
            k_proj: projection(kv_dim, "k_proj")?,
            v_proj: projection(kv_dim, "v_proj")?,
            o_proj: candle_nn::linear_no_bias(q_dim, hidden, vb.pp("o_proj"))?,
            num_attention_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
            scale,
        })
    }

    /// Copy of this layer on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) if the copy fails.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            q_proj: linear_to_device(&self.q_proj, device)?,
            k_proj: linear_to_device(&self.k_proj, device)?,
            v_proj: linear_to_device(&self.v_proj, device)?,
            o_proj: linear_to_device(&self.o_proj, device)?,
            num_attention_heads: self.num_attention_heads,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
            scale: self.scale,
        })
    }

    /// Run attention for one step, appending this step's keys and values to
    /// `cache`.
    ///
    /// # Shapes
    /// - `x`: `[batch, q_len, hidden_size]` (already normalized)
    /// - returns: `[batch, q_len, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) on tensor
    /// failures and [`SteerError::Steering`](crate::SteerError::Steering) if
    /// a steering rule or the cache rejects the batch.
    pub(crate) fn forward(
        &self,
        x: &Tensor,
        layer: usize,
        input: &AttentionInput<'_>,
        cache: &mut KVCache,
    ) -> Result<Tensor> {
        let (batch, q_len, _hidden) = x.dims3()?;

        let q = apply_lora(input.loras, layer, LoraTarget::Query, x, self.q_proj.forward(x)?)?;
        let k = apply_lora(input.loras, layer, LoraTarget::Key, x, self.k_proj.forward(x)?)?;
        let v = apply_lora(input.loras, layer, LoraTarget::Value, x, self.v_proj.forward(x)?)?;

        // [batch, q_len, heads * head_dim] -> [batch, heads, q_len, head_dim]
        let q = q
            .reshape((batch, q_len, self.num_attention_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((batch, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((batch, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = input.rotary.apply(&q.contiguous()?)?;
        let k = input.rotary.apply(&k.contiguous()?)?;

        let (q, k, v) = match input.steering {
            Some(steering) => (
                steering.apply(SteeringPoint::new(layer, SteeringSite::Query), &q)?,
                steering.apply(SteeringPoint::new(layer, SteeringSite::Key), &k)?,
                steering.apply(SteeringPoint::new(layer, SteeringSite::Value), &v)?,
            ),
            None => (q, k, v),
        };

        let (k, v) = cache.append(layer, &k, &v)?;

        let k = repeat_kv(k, self.num_attention_heads, self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_attention_heads, self.num_kv_heads)?;

        // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
        let k_t = k.contiguous()?.transpose(2, 3)?;
        let scores = (q.contiguous()?.matmul(&k_t)? * self.scale)?;
        let scores = scores.broadcast_add(input.mask)?;

        // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
        let original_dtype = scores.dtype();
        let pattern = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
            .to_dtype(original_dtype)?;

        let attn_output = pattern.matmul(&v.contiguous()?)?;
        let attn_output = attn_output.transpose(1, 2)?.contiguous()?.reshape((
            batch,
            q_len,
            self.num_attention_heads * self.head_dim,
        ))?;

        let out = self.o_proj.forward(&attn_output)?;
        apply_lora(input.loras, layer, LoraTarget::Output, &attn_output, out)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Expand key/value tensors from `n_kv_heads` to `n_heads` for GQA.
///
/// # Shapes
/// - `x`: `[batch, n_kv_heads, seq, head_dim]`
/// - returns: `[batch, n_heads, seq, head_dim]`
///
/// When `n_heads == n_kv_heads` (MHA), returns the input unchanged.
fn repeat_kv(x: Tensor, n_heads: usize, n_kv_heads: usize) -> Result<Tensor> {
    if n_heads == n_kv_heads {
        return Ok(x);
    }
    let repeats = n_heads / n_kv_heads;
    let (batch, _kv_heads, seq_len, head_dim) = x.dims4()?;

    // [batch, n_kv_heads, 1, seq, head_dim] -> [batch, n_heads, seq, head_dim]
    let x = x
        .unsqueeze(2)?
        .expand((batch, n_kv_heads, repeats, seq_len, head_dim))?
        .reshape((batch, n_heads, seq_len, head_dim))?;
    Ok(x)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn repeat_kv_groups_heads() {
        let x = Tensor::new(&[[[[1_f32]], [[2.0]]]], &Device::Cpu).unwrap();
        let y = repeat_kv(x, 4, 2).unwrap();
        assert_eq!(y.dims(), &[1, 4, 1, 1]);
        assert_eq!(
            y.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 1.0, 2.0, 2.0]
        );
    }
}
