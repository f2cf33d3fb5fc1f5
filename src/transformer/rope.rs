// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotary position embeddings (`RoPE`) with per-row positions.
//!
//! Left-padded rows start their positions at their first real token, so
//! positions differ per row. The cos/sin tables are gathered once per
//! forward pass into [`RotaryTables`] and reused by every layer.

use candle_core::{D, DType, Device, Tensor};

use crate::error::Result;

// ---------------------------------------------------------------------------
// RoPE cache: pre-computed cos/sin
// ---------------------------------------------------------------------------

/// Pre-computed cosine and sine tables.
pub struct RopeCache {
    /// Cosine values: `[max_position, head_dim / 2]`.
    cos: Tensor,
    /// Sine values: `[max_position, head_dim / 2]`.
    sin: Tensor,
}

impl RopeCache {
    /// Pre-compute the tables.
    ///
    /// # Shapes
    /// - `cos`, `sin`: `[max_position, head_dim / 2]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) on tensor
    /// operation failures.
    pub fn new(
        head_dim: usize,
        max_position: usize,
        theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let half_dim = head_dim / 2;

        // theta^(-2i/d) for i in 0..half_dim
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| {
                #[allow(
                    clippy::cast_precision_loss,
                    clippy::cast_possible_truncation,
                    clippy::as_conversions
                )]
                let freq = (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32;
                freq
            })
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..max_position)
            .map(|p| {
                #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
                let pf = p as f32;
                pf
            })
            .collect();
        let positions = Tensor::from_vec(positions, (max_position, 1), device)?;

        // Outer product: [max_position, half_dim]
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    /// Gather the tables for a `[batch, seq]` grid of positions.
    ///
    /// # Shapes
    /// - `positions`: `[batch, seq]` of `u32`
    /// - returns: tables shaped `[batch, 1, seq, head_dim / 2]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) if a position
    /// exceeds the pre-computed range.
    pub fn gather(&self, positions: &Tensor) -> Result<RotaryTables> {
        let (batch, seq) = positions.dims2()?;
        let flat = positions.to_device(self.cos.device())?.flatten_all()?;
        let half_dim = self.cos.dim(1)?;
        let cos = self
            .cos
            .index_select(&flat, 0)?
            .reshape((batch, 1, seq, half_dim))?;
        let sin = self
            .sin
            .index_select(&flat, 0)?
            .reshape((batch, 1, seq, half_dim))?;
        Ok(RotaryTables { cos, sin })
    }
}

// ---------------------------------------------------------------------------
// RotaryTables: per-step gathered cos/sin
// ---------------------------------------------------------------------------

/// Cos/sin gathered for the positions of one forward pass.
#[derive(Debug, Clone)]
pub struct RotaryTables {
    /// `[batch, 1, seq, head_dim / 2]`.
    cos: Tensor,
    /// `[batch, 1, seq, head_dim / 2]`.
    sin: Tensor,
}

impl RotaryTables {
    /// Move the tables to `device` (no-op when already there).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) if the copy fails.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            cos: self.cos.to_device(device)?,
            sin: self.sin.to_device(device)?,
        })
    }

    /// Rotate a query or key tensor.
    ///
    /// # Shapes
    /// - `x`: `[batch, n_heads, seq, head_dim]`
    /// - returns: `[batch, n_heads, seq, head_dim]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) on shape errors.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let half_dim = x.dim(D::Minus1)? / 2;
        let x1 = x.narrow(D::Minus1, 0, half_dim)?;
        let x2 = x.narrow(D::Minus1, half_dim, half_dim)?;

        // [x1*cos - x2*sin, x1*sin + x2*cos]
        let rotated_x1 = (x1.broadcast_mul(&self.cos)? - x2.broadcast_mul(&self.sin)?)?;
        let rotated_x2 = (x1.broadcast_mul(&self.sin)? + x2.broadcast_mul(&self.cos)?)?;
        Ok(Tensor::cat(&[&rotated_x1, &rotated_x2], D::Minus1)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn position_zero_is_identity() {
        let rope = RopeCache::new(4, 16, 10_000.0, &Device::Cpu, DType::F32).unwrap();
        let positions = Tensor::zeros((1, 1), DType::U32, &Device::Cpu).unwrap();
        let tables = rope.gather(&positions).unwrap();
        let x = Tensor::new(&[[[[1_f32, 2.0, 3.0, 4.0]]]], &Device::Cpu).unwrap();
        let y = tables.apply(&x).unwrap();
        assert_eq!(
            y.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn rows_use_their_own_positions() {
        let rope = RopeCache::new(4, 16, 10_000.0, &Device::Cpu, DType::F32).unwrap();
        let positions = Tensor::new(&[[3_u32], [0]], &Device::Cpu).unwrap();
        let tables = rope.gather(&positions).unwrap();
        let x = Tensor::ones((2, 1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let y = tables.apply(&x).unwrap();
        let rows = y.reshape((2, 4)).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[1], vec![1.0, 1.0, 1.0, 1.0]);
        assert!((rows[0][0] - 1.0).abs() > 1e-3);
    }
}
