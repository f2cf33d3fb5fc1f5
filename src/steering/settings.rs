// SPDX-License-Identifier: MIT OR Apache-2.0

//! User-facing steering settings, parsed from JSON.
//!
//! ```json
//! {
//!   "residual":  [ { "layers": "all", "weight": 0.2 } ],
//!   "attention": [
//!     { "layers": { "start": 4, "end": -4 }, "site": "v", "weight": 0.5 },
//!     { "site": "blocks.2.attn.hook_q", "weight": 1.0 }
//!   ]
//! }
//! ```
//!
//! Layer selectors are `"all"`, an index, a list of indices, or an inclusive
//! `{start, end}` range; negative indices count back from the last layer.
//! Entries are applied in order, so a later entry overrides an earlier one
//! at the same point.

use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SteerError};

use super::rule::{SteeringConfiguration, SteeringRule};
use super::site::{SteeringPoint, SteeringSite};

// ---------------------------------------------------------------------------
// LayerSelector
// ---------------------------------------------------------------------------

/// Which layers an entry applies to.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LayerSelector {
    /// One layer; negative counts from the end.
    Index(i64),
    /// Several layers.
    List(Vec<i64>),
    /// Inclusive range.
    Range {
        /// First layer.
        start: i64,
        /// Last layer (inclusive).
        end: i64,
    },
    /// The keyword `"all"`.
    Keyword(String),
}

impl Default for LayerSelector {
    fn default() -> Self {
        Self::Keyword("all".into())
    }
}

impl LayerSelector {
    /// Resolve to concrete layer indices, restricted to `eligible` when the
    /// selector is `"all"`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] on an unknown keyword, an out-of-range
    /// index, or an empty range.
    pub fn resolve(&self, num_layers: usize, eligible: &[usize]) -> Result<Vec<usize>> {
        match self {
            Self::Keyword(word) if word.eq_ignore_ascii_case("all") => Ok(eligible.to_vec()),
            Self::Keyword(word) => Err(SteerError::Config(format!(
                "unknown layer selector '{word}' (expected \"all\", an index, a list or a range)"
            ))),
            Self::Index(i) => Ok(vec![normalize_index(*i, num_layers)?]),
            Self::List(list) => list
                .iter()
                .map(|&i| normalize_index(i, num_layers))
                .collect(),
            Self::Range { start, end } => {
                let start = normalize_index(*start, num_layers)?;
                let end = normalize_index(*end, num_layers)?;
                if start > end {
                    return Err(SteerError::Config(format!(
                        "empty layer range {start}..={end}"
                    )));
                }
                Ok((start..=end).collect())
            }
        }
    }
}

/// Map a possibly negative index into `0..num_layers`.
fn normalize_index(index: i64, num_layers: usize) -> Result<usize> {
    let out_of_range =
        || SteerError::Config(format!("layer {index} out of range for {num_layers} layers"));
    let n = i64::try_from(num_layers).map_err(|_| out_of_range())?;
    let resolved = if index < 0 { n + index } else { index };
    if resolved < 0 || resolved >= n {
        return Err(out_of_range());
    }
    usize::try_from(resolved).map_err(|_| out_of_range())
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A residual-stream (end-of-layer) entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResidualEntry {
    /// Target layers (default: all).
    #[serde(default)]
    pub layers: LayerSelector,
    /// Blend weight.
    pub weight: f64,
}

/// An attention-site entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttentionEntry {
    /// Target layers (default: all attention layers). Must be absent when
    /// `site` is a full hook name.
    #[serde(default)]
    pub layers: Option<LayerSelector>,
    /// Site code (`h`, `q`, `k`, `v`, `a`) or hook name such as
    /// `blocks.3.attn.hook_v`.
    pub site: String,
    /// Blend weight.
    pub weight: f64,
}

// ---------------------------------------------------------------------------
// SteeringSettings
// ---------------------------------------------------------------------------

/// Steering weights as written by the user.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SteeringSettings {
    /// End-of-layer residual rules.
    #[serde(default)]
    pub residual: Vec<ResidualEntry>,
    /// Attention-site rules.
    #[serde(default)]
    pub attention: Vec<AttentionEntry>,
}

impl SteeringSettings {
    /// Parse settings from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Json`] on malformed JSON or unknown fields.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.residual.is_empty() && self.attention.is_empty()
    }

    /// Build a rule table for a model with `num_layers` layers.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] on invalid selectors or site names and
    /// [`SteerError::Steering`] when a site does not exist on a layer.
    pub fn resolve(
        &self,
        num_layers: usize,
        attention_layers: &[usize],
    ) -> Result<SteeringConfiguration> {
        let mut config = SteeringConfiguration::new(num_layers, attention_layers.to_vec());
        let all_layers: Vec<usize> = (0..num_layers).collect();

        for entry in &self.residual {
            for layer in entry.layers.resolve(num_layers, &all_layers)? {
                config.set(
                    SteeringPoint::new(layer, SteeringSite::Residual),
                    SteeringRule::new(entry.weight),
                )?;
            }
        }

        for entry in &self.attention {
            for point in attention_points(entry, num_layers, config.attention_layers())? {
                config.set(point, SteeringRule::new(entry.weight))?;
            }
        }

        debug!(
            rules = config.points().count(),
            num_layers, "resolved steering settings"
        );
        Ok(config)
    }
}

/// Expand one attention entry into concrete points.
fn attention_points(
    entry: &AttentionEntry,
    num_layers: usize,
    attention_layers: &[usize],
) -> Result<Vec<SteeringPoint>> {
    if let Some(site) = SteeringSite::from_short_name(&entry.site) {
        if !site.is_attention() {
            return Err(SteerError::Config(format!(
                "site '{}' is not an attention site; use a residual entry",
                entry.site
            )));
        }
        let layers = entry
            .layers
            .clone()
            .unwrap_or_default()
            .resolve(num_layers, attention_layers)?;
        return Ok(layers
            .into_iter()
            .map(|layer| SteeringPoint::new(layer, site))
            .collect());
    }

    let point: SteeringPoint = entry
        .site
        .parse()
        .map_err(|_| SteerError::Config(format!("unknown steering site '{}'", entry.site)))?;
    if entry.layers.is_some() {
        return Err(SteerError::Config(format!(
            "'{}' already names a layer; drop the `layers` field",
            entry.site
        )));
    }
    if !point.site.is_attention() {
        return Err(SteerError::Config(format!(
            "'{point}' is not an attention site; use a residual entry"
        )));
    }
    Ok(vec![point])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
