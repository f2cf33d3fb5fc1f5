// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model contract for batched, steerable generation.
//!
//! [`CausalLm`] is what the generation loop needs from a model: a cached
//! forward pass over a batch of rows. Models that can apply steering rules
//! inside their forward pass also implement [`SteeringCapable`] and expose
//! it through [`CausalLm::as_steering_capable`]; everything else falls back
//! to plain single-prompt generation.

use candle_core::{DType, Device, Tensor};

use crate::cache::KVCache;
use crate::error::{Result, SteerError};
use crate::lora::LoraSet;
use crate::steering::ActiveSteering;

// ---------------------------------------------------------------------------
// ForwardOptions
// ---------------------------------------------------------------------------

/// Per-call options threaded through a forward pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions<'a> {
    /// Left-padding length of each row. `None` means no padding.
    pub padding: Option<&'a [usize]>,
    /// Low-rank adapters applied to the attention projections.
    pub loras: Option<&'a LoraSet>,
    /// Steering rules bound to the batch layout. Ignored by models that are
    /// not [`SteeringCapable`].
    pub steering: Option<ActiveSteering<'a>>,
    /// Project only the last position to the vocabulary.
    pub last_only: bool,
}

impl<'a> ForwardOptions<'a> {
    /// Options with padding set.
    #[must_use]
    pub const fn with_padding(mut self, padding: &'a [usize]) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Options with steering set.
    #[must_use]
    pub const fn with_steering(mut self, steering: ActiveSteering<'a>) -> Self {
        self.steering = Some(steering);
        self
    }

    /// Options with adapters set.
    #[must_use]
    pub const fn with_loras(mut self, loras: &'a LoraSet) -> Self {
        self.loras = Some(loras);
        self
    }

    /// Options projecting only the last position.
    #[must_use]
    pub const fn last_only(mut self) -> Self {
        self.last_only = true;
        self
    }
}

// ---------------------------------------------------------------------------
// CausalLm / SteeringCapable
// ---------------------------------------------------------------------------

/// A decoder-only language model with a key/value cache.
pub trait CausalLm: Send + Sync {
    /// Number of decoder layers.
    fn num_layers(&self) -> usize;

    /// Vocabulary size (output width of [`forward`](Self::forward)).
    fn vocab_size(&self) -> usize;

    /// Device the inputs must live on (the device of the embedding).
    fn device(&self) -> &Device;

    /// Allocate an empty cache for `batch_size` rows.
    fn new_cache(&self, batch_size: usize) -> KVCache {
        KVCache::new(self.num_layers(), batch_size)
    }

    /// Run the model over `input_ids`, extending `cache`.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - returns: `[batch, seq, vocab]`, or `[batch, 1, vocab]` with
    ///   [`ForwardOptions::last_only`]
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] on tensor failures.
    fn forward(
        &self,
        input_ids: &Tensor,
        cache: &mut KVCache,
        options: &ForwardOptions<'_>,
    ) -> Result<Tensor>;

    /// Run the model over `input_ids` only to fill `cache`.
    ///
    /// The default runs [`forward`](Self::forward) and discards the logits.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] on tensor failures.
    fn prefill(
        &self,
        input_ids: &Tensor,
        cache: &mut KVCache,
        options: &ForwardOptions<'_>,
    ) -> Result<()> {
        self.forward(input_ids, cache, &options.last_only())?;
        Ok(())
    }

    /// Steering capability of this model, if any.
    fn as_steering_capable(&self) -> Option<&dyn SteeringCapable> {
        None
    }
}

/// A model whose forward pass honours [`ForwardOptions::steering`].
pub trait SteeringCapable: CausalLm {
    /// Layers that expose the per-attention sites (`h`, `q`, `k`, `v`, `a`).
    fn attention_layers(&self) -> Vec<usize>;
}

// ---------------------------------------------------------------------------
// Device selection
// ---------------------------------------------------------------------------

/// Select the best available device (CUDA GPU 0, or CPU fallback).
///
/// # Errors
///
/// Returns [`SteerError::Model`] on device detection failure.
pub fn select_device() -> Result<Device> {
    Ok(Device::cuda_if_available(0)?)
}

/// Default compute dtype for `device`: `BF16` on CUDA, `F32` elsewhere.
#[must_use]
pub fn default_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::BF16
    } else {
        DType::F32
    }
}

// ---------------------------------------------------------------------------
// Loading from a local directory
// ---------------------------------------------------------------------------

/// Load a [`GenericTransformer`](crate::transformer::GenericTransformer) from
/// a local `HuggingFace`-style directory holding `config.json` and either
/// `model.safetensors` or a sharded `model.safetensors.index.json`.
///
/// # Errors
///
/// Returns [`SteerError::Io`] if a file cannot be read,
/// [`SteerError::Config`] if the configuration is unsupported, and
/// [`SteerError::Model`] if weight loading fails.
#[cfg(feature = "transformer")]
pub fn load_from_dir(
    dir: &std::path::Path,
    device: &Device,
    dtype: DType,
) -> Result<crate::transformer::GenericTransformer> {
    use crate::config::TransformerConfig;
    use crate::transformer::GenericTransformer;

    let config_str = std::fs::read_to_string(dir.join("config.json"))?;
    let json: serde_json::Value = serde_json::from_str(&config_str)?;
    let config = TransformerConfig::from_hf_config(&json)?;

    let weights_paths = resolve_safetensors_paths(dir)?;
    tracing::info!(
        dir = %dir.display(),
        family = %config.family,
        layers = config.num_layers,
        shards = weights_paths.len(),
        "loading model"
    );
    let vb = open_weights(&weights_paths, dtype, device)?;
    GenericTransformer::load(config, device, dtype, vb)
}

/// Index structure for sharded safetensors models.
#[cfg(feature = "transformer")]
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name to shard filename.
    weight_map: std::collections::HashMap<String, String>,
}

/// Resolve safetensors file paths inside `dir`.
///
/// Tries `model.safetensors.index.json` first (sharded), falls back to
/// single `model.safetensors`.
#[cfg(feature = "transformer")]
fn resolve_safetensors_paths(dir: &std::path::Path) -> Result<Vec<std::path::PathBuf>> {
    let index_path = dir.join("model.safetensors.index.json");
    if index_path.is_file() {
        let index_str = std::fs::read_to_string(&index_path)?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

        let mut shard_names: Vec<String> = index.weight_map.into_values().collect();
        shard_names.sort();
        shard_names.dedup();

        let mut paths = Vec::with_capacity(shard_names.len());
        for shard_name in &shard_names {
            let path = dir.join(shard_name);
            if !path.is_file() {
                return Err(SteerError::Config(format!(
                    "shard {shard_name} listed in index but missing from {}",
                    dir.display()
                )));
            }
            paths.push(path);
        }
        return Ok(paths);
    }

    let path = dir.join("model.safetensors");
    if !path.is_file() {
        return Err(SteerError::Config(format!(
            "no model.safetensors or index in {}",
            dir.display()
        )));
    }
    Ok(vec![path])
}

/// Open the weight files as a `VarBuilder`.
///
/// Without the `mmap` feature the single file is read into memory; sharded
/// checkpoints need `mmap`.
#[cfg(feature = "transformer")]
fn open_weights(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        // SAFETY: the weight files must stay unchanged while the model lives.
        #[allow(unsafe_code)]
        let vb = unsafe { candle_nn::VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
        Ok(vb)
    }
    #[cfg(not(feature = "mmap"))]
    {
        let [path] = paths else {
            return Err(SteerError::Config(format!(
                "{} weight shards found; enable the `mmap` feature to load sharded checkpoints",
                paths.len()
            )));
        };
        let bytes = std::fs::read(path)?;
        Ok(candle_nn::VarBuilder::from_buffered_safetensors(bytes, dtype, device)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn options_builders_compose() {
        let padding = [1_usize, 0];
        let options = ForwardOptions::default().with_padding(&padding).last_only();
        assert_eq!(options.padding, Some(&padding[..]));
        assert!(options.last_only);
        assert!(options.steering.is_none());
    }

    #[test]
    fn cpu_defaults_to_f32() {
        assert_eq!(default_dtype(&Device::Cpu), DType::F32);
    }

    #[cfg(feature = "transformer")]
    #[test]
    fn missing_weights_is_config_error() {
        let dir = std::env::temp_dir().join("candle_steer_no_weights");
        std::fs::create_dir_all(&dir).unwrap();
        let err = resolve_safetensors_paths(&dir).unwrap_err();
        assert!(matches!(err, SteerError::Config(_)));
    }

    #[cfg(all(feature = "transformer", not(feature = "mmap")))]
    #[test]
    fn sharded_weights_need_mmap() {
        let dir = std::env::temp_dir().join("candle_steer_sharded_weights");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("model.safetensors.index.json"),
            r#"{"weight_map": {"a": "part-1.safetensors", "b": "part-2.safetensors"}}"#,
        )
        .unwrap();
        std::fs::write(dir.join("part-1.safetensors"), b"").unwrap();
        std::fs::write(dir.join("part-2.safetensors"), b"").unwrap();

        let paths = resolve_safetensors_paths(&dir).unwrap();
        assert_eq!(paths.len(), 2);
        let Err(err) = open_weights(&paths, DType::F32, &Device::Cpu) else {
            panic!("expected open_weights to fail");
        };
        assert!(matches!(err, SteerError::Config(_)));
    }
}
