// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batch-sized KV-cache for steered generation.
//!
//! Every row of a steering batch (positive base, extras, negatives) keeps its
//! own keys and values, so the cache is allocated for a fixed batch size.
//! A session whose batch size changes must allocate a new cache; appending a
//! tensor with a different batch dimension is an error.
//!
//! ## Memory Layout
//!
//! Each layer stores:
//! - keys: `[batch, num_kv_heads, seq_len, head_dim]`
//! - values: `[batch, num_kv_heads, seq_len, head_dim]`
//!
//! Memory grows linearly with the batch: a 7B model with 8 KV heads of
//! dimension 128 in BF16 needs 128KB per token per row, so three steering
//! rows over 2048 tokens take ~768MB.

use candle_core::Tensor;

use crate::error::{Result, SteerError};

/// Per-layer key/value cache with a fixed batch dimension.
///
/// # Shapes
///
/// - `keys[i]`: `[batch, num_kv_heads, seq_len, head_dim]`
/// - `values[i]`: `[batch, num_kv_heads, seq_len, head_dim]`
#[derive(Debug, Clone)]
pub struct KVCache {
    /// Cached key tensors per layer.
    keys: Vec<Option<Tensor>>,
    /// Cached value tensors per layer.
    values: Vec<Option<Tensor>>,
    /// Number of rows every cached tensor must have.
    batch_size: usize,
}

impl KVCache {
    /// Create an empty cache for `n_layers` layers and `batch_size` rows.
    #[must_use]
    pub fn new(n_layers: usize, batch_size: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
            batch_size,
        }
    }

    /// Number of rows this cache was allocated for.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of layers in the cache.
    #[must_use]
    pub const fn n_layers(&self) -> usize {
        self.keys.len()
    }

    /// Current sequence length (0 if empty).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] if a cached tensor has an unexpected shape.
    pub fn seq_len(&self) -> Result<usize> {
        match self.keys.iter().find_map(Option::as_ref) {
            Some(k) => Ok(k.dim(2)?),
            None => Ok(0),
        }
    }

    /// Whether no layer has been populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(Option::is_none)
    }

    /// Drop every cached tensor, keeping the layer count and batch size.
    pub fn clear(&mut self) {
        self.keys.iter_mut().for_each(|k| *k = None);
        self.values.iter_mut().for_each(|v| *v = None);
    }

    /// Append new keys and values for `layer` along the sequence axis and
    /// return the full cached tensors.
    ///
    /// # Shapes
    ///
    /// - `k`, `v`: `[batch, num_kv_heads, new_len, head_dim]`
    /// - returns: `[batch, num_kv_heads, past_len + new_len, head_dim]` twice
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`] if `layer` is out of range or the
    /// batch dimension does not match, and [`SteerError::Model`] if the
    /// concatenation fails.
    pub fn append(&mut self, layer: usize, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        if layer >= self.keys.len() {
            return Err(SteerError::Steering(format!(
                "layer {layer} out of range for KV cache with {} layers",
                self.keys.len()
            )));
        }
        let rows = k.dim(0)?;
        if rows != self.batch_size {
            return Err(SteerError::Steering(format!(
                "KV cache allocated for batch {} but layer {layer} produced {rows} rows",
                self.batch_size
            )));
        }

        // Bounds checked above.
        #[allow(clippy::indexing_slicing)]
        let (slot_k, slot_v) = (&mut self.keys[layer], &mut self.values[layer]);

        let full_k = match slot_k.as_ref() {
            // CONTIGUOUS: cat along dim 2 requires matching layouts
            Some(prev) => Tensor::cat(&[prev, &k.contiguous()?], 2)?,
            None => k.contiguous()?,
        };
        let full_v = match slot_v.as_ref() {
            Some(prev) => Tensor::cat(&[prev, &v.contiguous()?], 2)?,
            None => v.contiguous()?,
        };
        *slot_k = Some(full_k.clone());
        *slot_v = Some(full_v.clone());
        Ok((full_k, full_v))
    }

    /// Keep only the first `len` positions of every layer.
    ///
    /// Used to roll back rejected speculative tokens. A no-op when the cache
    /// is already at most `len` long.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] if tensor operations fail.
    pub fn truncate(&mut self, len: usize) -> Result<()> {
        if self.seq_len()? <= len {
            return Ok(());
        }
        for tensor in self.keys.iter_mut().chain(self.values.iter_mut()).flatten() {
            *tensor = tensor.narrow(2, 0, len)?;
        }
        Ok(())
    }

    /// Total bytes held by all cached tensors.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.keys
            .iter()
            .chain(self.values.iter())
            .filter_map(Option::as_ref)
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}

impl Default for KVCache {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn kv(batch: usize, len: usize) -> Tensor {
        Tensor::ones((batch, 2, len, 4), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn new_cache() {
        let cache = KVCache::new(4, 3);
        assert_eq!(cache.n_layers(), 4);
        assert_eq!(cache.batch_size(), 3);
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len().unwrap(), 0);
        assert_eq!(cache.memory_usage(), 0);
    }

    #[test]
    fn append_grows_sequence() {
        let mut cache = KVCache::new(2, 3);
        let (k, v) = cache.append(0, &kv(3, 5), &kv(3, 5)).unwrap();
        assert_eq!(k.dims(), &[3, 2, 5, 4]);
        assert_eq!(v.dims(), &[3, 2, 5, 4]);
        let (k, _) = cache.append(0, &kv(3, 1), &kv(3, 1)).unwrap();
        assert_eq!(k.dim(2).unwrap(), 6);
        assert_eq!(cache.seq_len().unwrap(), 6);
        assert_eq!(cache.memory_usage(), 2 * 3 * 2 * 6 * 4 * 4);
    }

    #[test]
    fn append_rejects_batch_mismatch() {
        let mut cache = KVCache::new(2, 3);
        assert!(cache.append(0, &kv(1, 2), &kv(1, 2)).is_err());
    }

    #[test]
    fn append_rejects_out_of_range_layer() {
        let mut cache = KVCache::new(2, 1);
        assert!(cache.append(5, &kv(1, 2), &kv(1, 2)).is_err());
    }

    #[test]
    fn truncate_rolls_back() {
        let mut cache = KVCache::new(2, 1);
        cache.append(0, &kv(1, 7), &kv(1, 7)).unwrap();
        cache.append(1, &kv(1, 7), &kv(1, 7)).unwrap();
        cache.truncate(4).unwrap();
        assert_eq!(cache.seq_len().unwrap(), 4);
        cache.truncate(10).unwrap();
        assert_eq!(cache.seq_len().unwrap(), 4);
    }

    #[test]
    fn clear_keeps_shape() {
        let mut cache = KVCache::new(2, 2);
        cache.append(1, &kv(2, 3), &kv(2, 3)).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.batch_size(), 2);
        assert_eq!(cache.n_layers(), 2);
    }
}
