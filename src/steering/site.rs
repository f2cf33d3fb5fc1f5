// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steering sites: the tensors in a decoder layer where a rule may blend
//! negative rows into positive rows.
//!
//! Points use the `TransformerLens` hook naming convention via
//! [`Display`](std::fmt::Display) and [`FromStr`]:
//!
//! ```
//! use candle_steer::{SteeringPoint, SteeringSite};
//!
//! let point = SteeringPoint::new(3, SteeringSite::Query);
//! assert_eq!(point.to_string(), "blocks.3.attn.hook_q");
//!
//! let parsed: SteeringPoint = "blocks.3.attn.hook_q".parse().unwrap();
//! assert_eq!(parsed, point);
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::SteerError;

// ---------------------------------------------------------------------------
// SteeringSite
// ---------------------------------------------------------------------------

/// One instrumented tensor within a decoder layer, in forward order.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SteeringSite {
    /// Residual stream entering the layer, before the attention norm.
    Hidden,
    /// Query heads after projection and rotary embedding.
    Query,
    /// Key heads after projection and rotary embedding, before caching.
    Key,
    /// Value heads after projection, before caching.
    Value,
    /// Residual stream right after the attention block is added back.
    AttnOut,
    /// Residual stream leaving the layer.
    Residual,
}

impl SteeringSite {
    /// The five sites owned by the attention block, in forward order.
    pub const ATTENTION: [Self; 5] = [
        Self::Hidden,
        Self::Query,
        Self::Key,
        Self::Value,
        Self::AttnOut,
    ];

    /// Single-letter code used in settings files (`h`, `q`, `k`, `v`, `a`, `r`).
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::Hidden => "h",
            Self::Query => "q",
            Self::Key => "k",
            Self::Value => "v",
            Self::AttnOut => "a",
            Self::Residual => "r",
        }
    }

    /// Whether the site belongs to the attention block.
    #[must_use]
    pub const fn is_attention(self) -> bool {
        !matches!(self, Self::Residual)
    }

    /// Parse a single-letter site code.
    #[must_use]
    pub fn from_short_name(code: &str) -> Option<Self> {
        match code {
            "h" => Some(Self::Hidden),
            "q" => Some(Self::Query),
            "k" => Some(Self::Key),
            "v" => Some(Self::Value),
            "a" => Some(Self::AttnOut),
            "r" => Some(Self::Residual),
            _ => None,
        }
    }

    /// Hook-name suffix following `blocks.{i}.`.
    const fn hook_suffix(self) -> &'static str {
        match self {
            Self::Hidden => "hook_resid_pre",
            Self::Query => "attn.hook_q",
            Self::Key => "attn.hook_k",
            Self::Value => "attn.hook_v",
            Self::AttnOut => "hook_resid_mid",
            Self::Residual => "hook_resid_post",
        }
    }

    /// Inverse of [`hook_suffix`](Self::hook_suffix).
    fn from_hook_suffix(suffix: &str) -> Option<Self> {
        [
            Self::Hidden,
            Self::Query,
            Self::Key,
            Self::Value,
            Self::AttnOut,
            Self::Residual,
        ]
        .into_iter()
        .find(|site| site.hook_suffix() == suffix)
    }
}

impl fmt::Display for SteeringSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

// ---------------------------------------------------------------------------
// SteeringPoint
// ---------------------------------------------------------------------------

/// A `(layer, site)` pair addressing one instrumented tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SteeringPoint {
    /// Decoder layer index.
    pub layer: usize,
    /// Site within the layer.
    pub site: SteeringSite,
}

impl SteeringPoint {
    /// Create a point.
    #[must_use]
    pub const fn new(layer: usize, site: SteeringSite) -> Self {
        Self { layer, site }
    }
}

impl fmt::Display for SteeringPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blocks.{}.{}", self.layer, self.site.hook_suffix())
    }
}

/// Parse `blocks.{layer}.{suffix}`.
impl FromStr for SteeringPoint {
    type Err = SteerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let unknown = || SteerError::Steering(format!("unknown steering point '{s}'"));
        let rest = s.strip_prefix("blocks.").ok_or_else(unknown)?;
        let (layer, suffix) = rest.split_once('.').ok_or_else(unknown)?;
        let layer = layer.parse::<usize>().map_err(|_| unknown())?;
        let site = SteeringSite::from_hook_suffix(suffix).ok_or_else(unknown)?;
        Ok(Self { layer, site })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
