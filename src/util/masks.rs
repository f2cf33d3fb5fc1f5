// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention masks and rotary positions for left-padded batches.
//!
//! Rows of a steering batch have different prompt lengths and are
//! left-padded to a common width. Row `b` has `padding[b]` pad tokens at
//! the start of its cache, which no query may attend to. A pad query
//! attends only to itself, so softmax never sees an all-masked row.

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, SteerError};

/// Build the additive attention mask for a batch step.
///
/// Query `i` sits at absolute position `past_len + i`. It may attend key
/// `j` when `j <= past_len + i`, `j` is not padding, and (with a window)
/// `past_len + i - j <= window`. Disallowed entries are `-inf`.
///
/// # Shapes
/// - returns: `[batch, 1, q_len, past_len + q_len]`
///
/// # Errors
///
/// Returns [`SteerError::Model`] on tensor creation failure.
pub fn batch_attention_mask(
    padding: &[usize],
    q_len: usize,
    past_len: usize,
    window: Option<usize>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let kv_len = past_len + q_len;
    let mut data = Vec::with_capacity(padding.len() * q_len * kv_len);
    for &pad in padding {
        for i in 0..q_len {
            let pos = past_len + i;
            for j in 0..kv_len {
                let causal = j <= pos;
                let real = j >= pad || j == pos;
                let in_window = window.is_none_or(|w| pos - j.min(pos) <= w);
                data.push(if causal && real && in_window {
                    0.0_f32
                } else {
                    f32::NEG_INFINITY
                });
            }
        }
    }
    Ok(Tensor::from_vec(data, (padding.len(), 1, q_len, kv_len), device)?.to_dtype(dtype)?)
}

/// Rotary positions for each row: `past_len + i - padding[b]`, clamped at 0
/// for pad tokens.
///
/// # Shapes
/// - returns: `[batch, q_len]` of `u32`
///
/// # Errors
///
/// Returns [`SteerError::Model`] if a position does not fit in `u32`.
pub fn row_positions(
    padding: &[usize],
    q_len: usize,
    past_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut data = Vec::with_capacity(padding.len() * q_len);
    for &pad in padding {
        for i in 0..q_len {
            let pos = (past_len + i).saturating_sub(pad);
            data.push(u32::try_from(pos).map_err(|_| {
                SteerError::Model(candle_core::Error::Msg(format!(
                    "position {pos} overflows u32"
                )))
            })?);
        }
    }
    Ok(Tensor::from_vec(data, (padding.len(), q_len), device)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
