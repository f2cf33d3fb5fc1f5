// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transformer configuration and `HuggingFace` `config.json` parsing.
//!
//! [`TransformerConfig`] covers the decoder-only families the steered
//! forward pass supports: `LLaMA`, Mistral, `Qwen2`, and Gemma. They share
//! separate Q/K/V projections, a gated MLP and rotary embeddings, and
//! differ in a handful of axes captured as fields.
//!
//! # Usage
//!
//! ```
//! use candle_steer::TransformerConfig;
//!
//! let config_str = r#"{"model_type": "llama", "hidden_size": 2048,
//!     "num_hidden_layers": 16, "num_attention_heads": 32,
//!     "num_key_value_heads": 8, "intermediate_size": 8192,
//!     "vocab_size": 32000, "rms_norm_eps": 1e-5,
//!     "rope_theta": 500000.0, "max_position_embeddings": 131072}"#;
//! let json: serde_json::Value = serde_json::from_str(config_str).unwrap();
//! let config = TransformerConfig::from_hf_config(&json).unwrap();
//! assert_eq!(config.num_layers, 16);
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::{Result, SteerError};

// ---------------------------------------------------------------------------
// Configuration enums
// ---------------------------------------------------------------------------

/// Supported model family, from the `model_type` field.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// `LLaMA` 1/2/3 and derivatives.
    Llama,
    /// Mistral (sliding-window attention).
    Mistral,
    /// `Qwen2` / `Qwen2.5` (QKV bias).
    Qwen2,
    /// Gemma 1 (`GemmaRmsNorm`, scaled embeddings, tied head).
    Gemma,
}

impl ModelFamily {
    /// Map a `model_type` string to a family.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] for unsupported model types.
    pub fn from_model_type(model_type: &str) -> Result<Self> {
        match model_type {
            "llama" => Ok(Self::Llama),
            "mistral" => Ok(Self::Mistral),
            "qwen2" => Ok(Self::Qwen2),
            "gemma" => Ok(Self::Gemma),
            other => Err(SteerError::Config(format!(
                "unsupported model_type: '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llama => write!(f, "llama"),
            Self::Mistral => write!(f, "mistral"),
            Self::Qwen2 => write!(f, "qwen2"),
            Self::Gemma => write!(f, "gemma"),
        }
    }
}

/// Layer normalization variant.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormType {
    /// `x * weight / sqrt(mean(x^2) + eps)`.
    RmsNorm,
    /// Gemma variant applying `(weight + 1)`.
    GemmaRmsNorm,
}

/// Activation of the MLP gate.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Sigmoid Linear Unit (`SwiGLU`).
    Silu,
    /// GELU, tanh approximation (`gelu_pytorch_tanh`).
    GeluApprox,
}

// ---------------------------------------------------------------------------
// TransformerConfig
// ---------------------------------------------------------------------------

/// Configuration for a generic decoder-only transformer.
///
/// | Family | Differences from the `LLaMA` baseline |
/// |--------|---------------------------------------|
/// | Mistral | sliding-window attention |
/// | `Qwen2` | QKV bias, larger rope theta |
/// | Gemma | `GemmaRmsNorm`, `sqrt(d)` embedding scale, GELU, tied head |
#[derive(Debug, Clone)]
pub struct TransformerConfig {
    /// Model family.
    pub family: ModelFamily,

    // --- Dimensions ----------------------------------------------------------
    /// Hidden dimension (`d_model`).
    pub hidden_size: usize,
    /// Number of decoder layers.
    pub num_layers: usize,
    /// Number of query heads.
    pub num_attention_heads: usize,
    /// Number of key/value heads (GQA when < `num_attention_heads`).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// MLP intermediate dimension.
    pub intermediate_size: usize,
    /// Vocabulary size (rows of the embedding matrix).
    pub vocab_size: usize,

    // --- Architecture axes ---------------------------------------------------
    /// Normalization variant.
    pub norm_type: NormType,
    /// Epsilon for normalization layers.
    pub norm_eps: f64,
    /// MLP activation.
    pub activation: Activation,
    /// Whether Q, K, V projections carry bias.
    pub qkv_bias: bool,
    /// Embedding scale (`Some(sqrt(hidden_size))` for Gemma).
    pub embedding_scale: Option<f64>,
    /// Whether the LM head shares the token embedding.
    pub tie_word_embeddings: bool,

    // --- Positional encoding -------------------------------------------------
    /// Rotary base frequency.
    pub rope_theta: f64,
    /// Maximum sequence length for the rotary tables.
    pub max_position_embeddings: usize,
    /// Sliding attention window. `None` for global attention.
    pub sliding_window: Option<usize>,

    // --- Special tokens ------------------------------------------------------
    /// Beginning-of-sequence token, if declared.
    pub bos_token_id: Option<u32>,
    /// End-of-sequence tokens declared by the model (may be several).
    pub eos_token_ids: Vec<u32>,
    /// Padding token, if declared.
    pub pad_token_id: Option<u32>,
}

impl TransformerConfig {
    /// Parse a [`TransformerConfig`] from a `HuggingFace` `config.json` value.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if `model_type` is missing or
    /// unsupported, or a required dimension is absent.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let f = HfFields(config);
        let family = ModelFamily::from_model_type(
            f.str("model_type")
                .ok_or_else(|| SteerError::Config("missing 'model_type' field".into()))?,
        )?;

        let hidden_size = f.require("hidden_size")?;
        let num_attention_heads = f.require("num_attention_heads")?;
        let num_kv_heads = f.usize("num_key_value_heads").unwrap_or(num_attention_heads);
        if num_kv_heads == 0 || num_attention_heads % num_kv_heads != 0 {
            return Err(SteerError::Config(format!(
                "num_attention_heads {num_attention_heads} is not a multiple of \
                 num_key_value_heads {num_kv_heads}"
            )));
        }
        let head_dim = match f.usize("head_dim") {
            Some(head_dim) => head_dim,
            None if num_attention_heads > 0 => hidden_size / num_attention_heads,
            None => {
                return Err(SteerError::Config(
                    "num_attention_heads is 0, cannot derive head_dim".into(),
                ));
            }
        };

        // Family defaults for fields a config.json may leave out.
        let (eps, theta, max_positions) = match family {
            ModelFamily::Llama => (1e-5, 10_000.0, 4096),
            ModelFamily::Mistral => (1e-5, 10_000.0, 32_768),
            ModelFamily::Qwen2 => (1e-6, 1_000_000.0, 32_768),
            ModelFamily::Gemma => (1e-6, 10_000.0, 8192),
        };
        let gemma = family == ModelFamily::Gemma;

        let sliding_window = match family {
            ModelFamily::Mistral => f.usize("sliding_window"),
            // Qwen2 configs declare a window but gate it behind a switch.
            ModelFamily::Qwen2 if f.bool("use_sliding_window").unwrap_or(false) => {
                f.usize("sliding_window")
            }
            _ => None,
        };

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        // PROMOTE: sqrt(hidden_size) in f64; exact for any realistic d_model
        let embedding_scale = gemma.then(|| (hidden_size as f64).sqrt());

        Ok(Self {
            family,
            hidden_size,
            num_layers: f.require("num_hidden_layers")?,
            num_attention_heads,
            num_kv_heads,
            head_dim,
            intermediate_size: f.require("intermediate_size")?,
            vocab_size: f.require("vocab_size")?,

            norm_type: if gemma {
                NormType::GemmaRmsNorm
            } else {
                NormType::RmsNorm
            },
            norm_eps: f.f64("rms_norm_eps").unwrap_or(eps),
            activation: if gemma {
                Activation::GeluApprox
            } else {
                Activation::Silu
            },
            qkv_bias: f
                .bool("attention_bias")
                .unwrap_or(family == ModelFamily::Qwen2),
            embedding_scale,
            tie_word_embeddings: f.bool("tie_word_embeddings").unwrap_or(gemma),

            rope_theta: f.f64("rope_theta").unwrap_or(theta),
            max_position_embeddings: f.usize("max_position_embeddings").unwrap_or(max_positions),
            sliding_window,

            bos_token_id: f.u32("bos_token_id"),
            eos_token_ids: f.u32_list("eos_token_id"),
            pad_token_id: f.u32("pad_token_id"),
        })
    }
}

// ---------------------------------------------------------------------------
// Field access
// ---------------------------------------------------------------------------

/// Typed lookups into a `config.json` object. Absent fields and values of
/// the wrong type both read as `None`.
#[derive(Clone, Copy)]
struct HfFields<'a>(&'a Value);

impl<'a> HfFields<'a> {
    fn str(self, key: &str) -> Option<&'a str> {
        self.0.get(key).and_then(Value::as_str)
    }

    fn usize(self, key: &str) -> Option<usize> {
        self.0
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| usize::try_from(v).ok())
    }

    fn u32(self, key: &str) -> Option<u32> {
        self.0
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    fn f64(self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    fn bool(self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// A dimension that must be present.
    fn require(self, key: &str) -> Result<usize> {
        self.usize(key)
            .ok_or_else(|| SteerError::Config(format!("missing or invalid field '{key}'")))
    }

    /// `eos_token_id` and friends: one id or a list of ids.
    fn u32_list(self, key: &str) -> Vec<u32> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|v| u32::try_from(v).ok())
                .collect(),
            _ => self.u32(key).into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn base_json(model_type: &str) -> Value {
        serde_json::json!({
            "model_type": model_type,
            "hidden_size": 2048,
            "num_hidden_layers": 16,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "intermediate_size": 8192,
            "vocab_size": 32000,
            "eos_token_id": 2,
            "bos_token_id": 1
        })
    }

    #[test]
    fn parse_llama_basic() {
        let config = TransformerConfig::from_hf_config(&base_json("llama")).unwrap();
        assert_eq!(config.family, ModelFamily::Llama);
        assert_eq!(config.num_layers, 16);
        assert_eq!(config.num_kv_heads, 8);
        assert_eq!(config.head_dim, 64);
        assert_eq!(config.norm_type, NormType::RmsNorm);
        assert_eq!(config.activation, Activation::Silu);
        assert!(!config.qkv_bias);
        assert!(config.embedding_scale.is_none());
        assert!(config.sliding_window.is_none());
        assert_eq!(config.eos_token_ids, vec![2]);
        assert_eq!(config.bos_token_id, Some(1));
    }

    #[test]
    fn parse_mistral_sliding_window() {
        let mut json = base_json("mistral");
        json["sliding_window"] = 4096.into();
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert_eq!(config.sliding_window, Some(4096));
    }

    #[test]
    fn parse_qwen2_bias_and_window_switch() {
        let mut json = base_json("qwen2");
        json["sliding_window"] = 4096.into();
        json["eos_token_id"] = serde_json::json!([151_643, 151_645]);
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert!(config.qkv_bias);
        assert!(config.sliding_window.is_none());
        assert_eq!(config.eos_token_ids, vec![151_643, 151_645]);

        json["use_sliding_window"] = true.into();
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert_eq!(config.sliding_window, Some(4096));
    }

    #[test]
    fn parse_gemma_extensions() {
        let mut json = base_json("gemma");
        json["head_dim"] = 256.into();
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert_eq!(config.norm_type, NormType::GemmaRmsNorm);
        assert_eq!(config.activation, Activation::GeluApprox);
        assert_eq!(config.head_dim, 256);
        assert!(config.tie_word_embeddings);
        let scale = config.embedding_scale.unwrap();
        assert!((scale - 2048_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(TransformerConfig::from_hf_config(&serde_json::json!({ "hidden_size": 8 })).is_err());
        assert!(TransformerConfig::from_hf_config(&base_json("bert")).is_err());
        let mut json = base_json("llama");
        json["num_key_value_heads"] = 5.into();
        assert!(TransformerConfig::from_hf_config(&json).is_err());
        let mut json = base_json("llama");
        json.as_object_mut().unwrap().remove("vocab_size");
        assert!(TransformerConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn field_text_outlives_lookup_key() {
        let json = base_json("mistral");
        let fields = HfFields(&json);
        let model_type = {
            let key = String::from("model_type");
            fields.str(&key)
        };
        assert_eq!(model_type, Some("mistral"));
        assert_eq!(fields.str("hidden_size"), None);
    }
}
