// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gated MLP: `down(act(gate(x)) * up(x))`.

use candle_core::{Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::{Activation, TransformerConfig};
use crate::error::Result;

use super::linear_to_device;

/// Gated feed-forward block.
pub struct Mlp {
    /// Gate projection: `[hidden_size, intermediate_size]`.
    gate_proj: Linear,
    /// Up projection: `[hidden_size, intermediate_size]`.
    up_proj: Linear,
    /// Down projection: `[intermediate_size, hidden_size]`.
    down_proj: Linear,
    /// Gate activation.
    activation: Activation,
}

impl Mlp {
    /// Load `gate_proj`, `up_proj` and `down_proj` (no bias).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) if weight
    /// loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        Ok(Self {
            gate_proj: candle_nn::linear_no_bias(hidden, inter, vb.pp("gate_proj"))?,
            up_proj: candle_nn::linear_no_bias(hidden, inter, vb.pp("up_proj"))?,
            down_proj: candle_nn::linear_no_bias(inter, hidden, vb.pp("down_proj"))?,
            activation: config.activation,
        })
    }

    /// Copy of this block on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) if the copy fails.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_to_device(&self.gate_proj, device)?,
            up_proj: linear_to_device(&self.up_proj, device)?,
            down_proj: linear_to_device(&self.down_proj, device)?,
            activation: self.activation,
        })
    }

    /// Run the MLP.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) on tensor
    /// operation failures.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?;
        let gate = match self.activation {
            Activation::Silu => candle_nn::ops::silu(&gate)?,
            Activation::GeluApprox => gate.gelu()?,
        };
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}
