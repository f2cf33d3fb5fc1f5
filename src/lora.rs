// SPDX-License-Identifier: MIT OR Apache-2.0

//! Low-rank adapters on the attention projections.
//!
//! An adapter adds `scale * (x @ A^T) @ B^T` to the output of the projection
//! it targets. Adapters are supplied per call, so one loaded model can serve
//! requests with different adapter sets.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::{Result, SteerError};

/// Attention projection an adapter attaches to.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoraTarget {
    /// `q_proj`.
    Query,
    /// `k_proj`.
    Key,
    /// `v_proj`.
    Value,
    /// `o_proj`.
    Output,
}

/// One low-rank adapter.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    /// Down projection `A`: `[rank, in_features]`.
    a: Tensor,
    /// Up projection `B`: `[out_features, rank]`.
    b: Tensor,
    /// Output scale (`alpha / rank`).
    scale: f64,
}

impl LoraAdapter {
    /// Create an adapter.
    ///
    /// # Shapes
    /// - `a`: `[rank, in_features]`
    /// - `b`: `[out_features, rank]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if the ranks of `a` and `b` differ.
    pub fn new(a: Tensor, b: Tensor, scale: f64) -> Result<Self> {
        let (rank_a, _) = a.dims2()?;
        let (_, rank_b) = b.dims2()?;
        if rank_a != rank_b {
            return Err(SteerError::Config(format!(
                "LoRA rank mismatch: A has {rank_a}, B has {rank_b}"
            )));
        }
        Ok(Self { a, b, scale })
    }

    /// Adapter delta for `x`.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, in_features]`
    /// - returns: `[batch, seq, out_features]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) on shape mismatch.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let a = self.a.to_device(x.device())?.to_dtype(x.dtype())?;
        let b = self.b.to_device(x.device())?.to_dtype(x.dtype())?;
        let low = x.broadcast_matmul(&a.t()?)?;
        Ok((low.broadcast_matmul(&b.t()?)? * self.scale)?)
    }
}

/// Adapters keyed by `(layer, target)`.
#[derive(Debug, Clone, Default)]
pub struct LoraSet {
    /// Installed adapters.
    adapters: HashMap<(usize, LoraTarget), LoraAdapter>,
}

impl LoraSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an adapter, replacing any previous one at the same slot.
    pub fn insert(&mut self, layer: usize, target: LoraTarget, adapter: LoraAdapter) {
        self.adapters.insert((layer, target), adapter);
    }

    /// Adapter at `(layer, target)`.
    #[must_use]
    pub fn get(&self, layer: usize, target: LoraTarget) -> Option<&LoraAdapter> {
        self.adapters.get(&(layer, target))
    }

    /// Number of adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Add the adapter delta for `(layer, target)` to `projected`, if any.
///
/// # Errors
///
/// Propagates adapter shape errors.
pub(crate) fn apply_lora(
    loras: Option<&LoraSet>,
    layer: usize,
    target: LoraTarget,
    input: &Tensor,
    projected: Tensor,
) -> Result<Tensor> {
    match loras.and_then(|set| set.get(layer, target)) {
        Some(adapter) => Ok((projected + adapter.forward(input)?)?),
        None => Ok(projected),
    }
}
