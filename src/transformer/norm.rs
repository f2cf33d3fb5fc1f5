// SPDX-License-Identifier: MIT OR Apache-2.0

//! RMS normalization, standard and Gemma-style (`weight + 1`).

use candle_core::{D, DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::NormType;
use crate::error::Result;

/// An RMS normalization layer, selected at load time by [`NormType`].
pub struct Norm {
    /// Learned weight vector: `[hidden_size]`.
    weight: Tensor,
    /// Epsilon for numerical stability.
    eps: f64,
    /// Standard or Gemma (`weight + 1`) scaling.
    norm_type: NormType,
}

impl Norm {
    /// Load a norm of the given type from a [`VarBuilder`] providing `weight`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) if the weight
    /// cannot be loaded.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(norm_type: NormType, hidden_size: usize, eps: f64, vb: VarBuilder<'_>) -> Result<Self> {
        // Fresh (non-checkpoint) weights start as the identity scale.
        let init = match norm_type {
            NormType::RmsNorm => candle_nn::Init::Const(1.0),
            NormType::GemmaRmsNorm => candle_nn::Init::Const(0.0),
        };
        Ok(Self {
            weight: vb.get_with_hints(hidden_size, "weight", init)?,
            eps,
            norm_type,
        })
    }

    /// Copy of this norm on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) if the copy fails.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: self.weight.to_device(device)?,
            eps: self.eps,
            norm_type: self.norm_type,
        })
    }

    /// Normalize over the last dimension.
    ///
    /// # Shapes
    /// - `xs`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) on tensor
    /// operation failures.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        // PROMOTE: variance of F16/BF16 activations overflows; compute in F32
        let xs32 = xs.to_dtype(DType::F32)?;
        let rms = (xs32.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        let scale = match self.norm_type {
            NormType::RmsNorm => self.weight.to_dtype(DType::F32)?,
            NormType::GemmaRmsNorm => (self.weight.to_dtype(DType::F32)? + 1.0)?,
        };
        Ok(xs32.broadcast_div(&rms)?.broadcast_mul(&scale)?.to_dtype(dtype)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn norm(norm_type: NormType, weight: f32) -> Norm {
        Norm {
            weight: Tensor::new(&[weight, weight], &Device::Cpu).unwrap(),
            eps: 0.0,
            norm_type,
        }
    }

    #[test]
    fn standard_scales_by_weight() {
        let x = Tensor::new(&[[[3_f32, 4.0]]], &Device::Cpu).unwrap();
        let y = norm(NormType::RmsNorm, 2.0).forward(&x).unwrap();
        let v = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // rms = sqrt((9 + 16) / 2)
        let rms = 12.5_f32.sqrt();
        assert!((v[0] - 2.0 * 3.0 / rms).abs() < 1e-5);
        assert!((v[1] - 2.0 * 4.0 / rms).abs() < 1e-5);
    }

    #[test]
    fn gemma_adds_one_to_weight() {
        let x = Tensor::new(&[[[1_f32, 1.0]]], &Device::Cpu).unwrap();
        let y = norm(NormType::GemmaRmsNorm, 0.0).forward(&x).unwrap();
        let v = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(v.iter().all(|&x| (x - 1.0).abs() < 1e-6));
    }
}
