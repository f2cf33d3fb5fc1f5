// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steering rules and the per-layer rule table.
//!
//! A [`SteeringRule`] rewrites the whole batch tensor at one
//! [`SteeringPoint`]. The default blend subtracts the scaled difference
//! between the mean negative row and row 0 from every row:
//!
//! ```text
//! delta = weight * (mean(x[numpos..negend]) - x[0])
//! x'    = x - delta            (broadcast over all rows)
//! ```
//!
//! `delta` is computed once from the unmodified input, so every row sees
//! the same correction.

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Tensor};

use crate::error::{Result, SteerError};

use super::site::{SteeringPoint, SteeringSite};

// ---------------------------------------------------------------------------
// BatchLayout
// ---------------------------------------------------------------------------

/// Row layout of a steering batch.
///
/// Rows `[0, numpos)` are positive variants (row 0 is the stream that is
/// actually generated); rows `[numpos, negend)` are negative variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLayout {
    /// Number of positive rows (at least 1).
    pub numpos: usize,
    /// Number of negative rows.
    pub numneg: usize,
}

impl BatchLayout {
    /// Create a layout.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`] if `numpos` is zero.
    pub fn new(numpos: usize, numneg: usize) -> Result<Self> {
        if numpos == 0 {
            return Err(SteerError::Steering(
                "a steering batch needs at least one positive row".into(),
            ));
        }
        Ok(Self { numpos, numneg })
    }

    /// Layout of a plain single-prompt request.
    #[must_use]
    pub const fn single() -> Self {
        Self {
            numpos: 1,
            numneg: 0,
        }
    }

    /// End of the negative rows, `numpos + numneg`.
    #[must_use]
    pub const fn negend(&self) -> usize {
        self.numpos + self.numneg
    }

    /// Total number of rows.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.negend()
    }
}

// ---------------------------------------------------------------------------
// SteeringRule
// ---------------------------------------------------------------------------

/// Custom combination function: `(batch tensor, weight, layout) -> batch tensor`.
///
/// The returned tensor must keep the input's shape.
// TRAIT_OBJECT: user-supplied closures of arbitrary type
pub type CombineFn = Arc<dyn Fn(&Tensor, f64, &BatchLayout) -> Result<Tensor> + Send + Sync>;

/// Blend rule for one steering point.
#[derive(Clone)]
pub struct SteeringRule {
    /// Strength of the default blend (also passed to `combine`).
    weight: f64,
    /// Replaces the default blend when set.
    combine: Option<CombineFn>,
}

impl SteeringRule {
    /// Default blend with the given weight.
    #[must_use]
    pub const fn new(weight: f64) -> Self {
        Self {
            weight,
            combine: None,
        }
    }

    /// Replace the default blend with `combine`.
    #[must_use]
    pub fn with_combine(mut self, combine: CombineFn) -> Self {
        self.combine = Some(combine);
        self
    }

    /// Blend weight.
    #[must_use]
    pub const fn weight(&self) -> f64 {
        self.weight
    }

    /// Whether a custom combine function is installed.
    #[must_use]
    pub const fn is_custom(&self) -> bool {
        self.combine.is_some()
    }

    /// Apply the rule to a batch tensor whose dim 0 is the batch.
    ///
    /// Without negative rows the input is returned unchanged, for custom
    /// functions too. With the default blend a zero weight is also a no-op.
    ///
    /// # Shapes
    /// - `x`: `[batch, ...]`
    /// - returns: same shape as `x`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`] if dim 0 does not match the layout,
    /// or whatever the custom function returns.
    pub fn apply(&self, x: &Tensor, layout: &BatchLayout) -> Result<Tensor> {
        if layout.numneg == 0 {
            return Ok(x.clone());
        }
        let rows = x.dim(0)?;
        if rows != layout.batch_size() {
            return Err(SteerError::Steering(format!(
                "tensor has {rows} rows but the steering batch has {}",
                layout.batch_size()
            )));
        }
        match &self.combine {
            Some(combine) => {
                let out = combine(x, self.weight, layout)?;
                if out.dims() != x.dims() {
                    return Err(SteerError::Steering(format!(
                        "combine function changed shape {:?} to {:?}",
                        x.dims(),
                        out.dims()
                    )));
                }
                Ok(out)
            }
            None if self.weight == 0.0 => Ok(x.clone()),
            None => default_blend(x, self.weight, layout),
        }
    }
}

impl fmt::Debug for SteeringRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SteeringRule")
            .field("weight", &self.weight)
            .field("custom", &self.combine.is_some())
            .finish()
    }
}

/// `x - weight * (mean(x[numpos..negend]) - x[0])`, broadcast over rows.
///
/// # Shapes
/// - `x`: `[batch, ...]`
/// - returns: same shape as `x`
///
/// # Errors
///
/// Returns [`SteerError::Model`] on tensor operation failures.
pub fn default_blend(x: &Tensor, weight: f64, layout: &BatchLayout) -> Result<Tensor> {
    let dtype = x.dtype();
    // PROMOTE: mean over a few F16/BF16 rows loses precision; accumulate in F32
    let x32 = if dtype == DType::F32 {
        x.clone()
    } else {
        x.to_dtype(DType::F32)?
    };
    let neg_mean = x32.narrow(0, layout.numpos, layout.numneg)?.mean_keepdim(0)?;
    let base = x32.narrow(0, 0, 1)?;
    let delta = ((neg_mean - base)? * weight)?.to_dtype(dtype)?;
    Ok(x.broadcast_sub(&delta)?)
}

// ---------------------------------------------------------------------------
// AttentionSteering
// ---------------------------------------------------------------------------

/// Up to five rules for the sites of one attention block.
#[derive(Debug, Clone, Default)]
pub struct AttentionSteering {
    /// Rule for [`SteeringSite::Hidden`].
    pub hidden: Option<SteeringRule>,
    /// Rule for [`SteeringSite::Query`].
    pub query: Option<SteeringRule>,
    /// Rule for [`SteeringSite::Key`].
    pub key: Option<SteeringRule>,
    /// Rule for [`SteeringSite::Value`].
    pub value: Option<SteeringRule>,
    /// Rule for [`SteeringSite::AttnOut`].
    pub attn_out: Option<SteeringRule>,
}

impl AttentionSteering {
    /// Rule for an attention site (`None` for [`SteeringSite::Residual`]).
    #[must_use]
    pub const fn get(&self, site: SteeringSite) -> Option<&SteeringRule> {
        match site {
            SteeringSite::Hidden => self.hidden.as_ref(),
            SteeringSite::Query => self.query.as_ref(),
            SteeringSite::Key => self.key.as_ref(),
            SteeringSite::Value => self.value.as_ref(),
            SteeringSite::AttnOut => self.attn_out.as_ref(),
            SteeringSite::Residual => None,
        }
    }

    /// Mutable slot for an attention site.
    fn slot_mut(&mut self, site: SteeringSite) -> Option<&mut Option<SteeringRule>> {
        match site {
            SteeringSite::Hidden => Some(&mut self.hidden),
            SteeringSite::Query => Some(&mut self.query),
            SteeringSite::Key => Some(&mut self.key),
            SteeringSite::Value => Some(&mut self.value),
            SteeringSite::AttnOut => Some(&mut self.attn_out),
            SteeringSite::Residual => None,
        }
    }

    /// Whether no site has a rule.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        SteeringSite::ATTENTION.iter().all(|s| self.get(*s).is_none())
    }
}

// ---------------------------------------------------------------------------
// SteeringConfiguration
// ---------------------------------------------------------------------------

/// Per-layer rule table, read-only while a request runs.
///
/// Residual-stream rules are indexed by layer; attention rules exist only
/// for the model's attention layers.
#[derive(Debug, Clone)]
pub struct SteeringConfiguration {
    /// [`SteeringSite::Residual`] rule per layer.
    layer_rules: Vec<Option<SteeringRule>>,
    /// Sorted indices of layers that own an attention block.
    attention_layers: Vec<usize>,
    /// Attention rules, parallel to `attention_layers`.
    attn_rules: Vec<Option<AttentionSteering>>,
}

impl SteeringConfiguration {
    /// Empty table for a model with `num_layers` layers of which
    /// `attention_layers` carry attention.
    #[must_use]
    pub fn new(num_layers: usize, mut attention_layers: Vec<usize>) -> Self {
        attention_layers.retain(|&l| l < num_layers);
        attention_layers.sort_unstable();
        attention_layers.dedup();
        let attn_rules = vec![None; attention_layers.len()];
        Self {
            layer_rules: vec![None; num_layers],
            attention_layers,
            attn_rules,
        }
    }

    /// Number of layers the table covers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layer_rules.len()
    }

    /// Layers that accept attention-site rules.
    #[must_use]
    pub fn attention_layers(&self) -> &[usize] {
        &self.attention_layers
    }

    /// Install `rule` at `point`, replacing any earlier rule there.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`] if the layer is out of range or an
    /// attention site is addressed on a layer without attention.
    pub fn set(&mut self, point: SteeringPoint, rule: SteeringRule) -> Result<()> {
        let num_layers = self.num_layers();
        if point.layer >= num_layers {
            return Err(SteerError::Steering(format!(
                "{point}: layer {} out of range for {num_layers} layers",
                point.layer
            )));
        }
        if !point.site.is_attention() {
            if let Some(slot) = self.layer_rules.get_mut(point.layer) {
                *slot = Some(rule);
            }
            return Ok(());
        }
        let idx = self
            .attention_layers
            .binary_search(&point.layer)
            .map_err(|_| {
                SteerError::Steering(format!("{point}: layer {} has no attention", point.layer))
            })?;
        let entry = self
            .attn_rules
            .get_mut(idx)
            .ok_or_else(|| SteerError::Steering(format!("{point}: attention table out of sync")))?
            .get_or_insert_with(AttentionSteering::default);
        if let Some(slot) = entry.slot_mut(point.site) {
            *slot = Some(rule);
        }
        Ok(())
    }

    /// Rule installed at `point`, if any.
    #[must_use]
    pub fn rule(&self, point: SteeringPoint) -> Option<&SteeringRule> {
        if point.site.is_attention() {
            let idx = self.attention_layers.binary_search(&point.layer).ok()?;
            self.attn_rules.get(idx)?.as_ref()?.get(point.site)
        } else {
            self.layer_rules.get(point.layer)?.as_ref()
        }
    }

    /// Attention rules of one layer, if any.
    #[must_use]
    pub fn attention(&self, layer: usize) -> Option<&AttentionSteering> {
        let idx = self.attention_layers.binary_search(&layer).ok()?;
        self.attn_rules.get(idx)?.as_ref()
    }

    /// All installed rules in layer order, attention sites first.
    pub fn points(&self) -> impl Iterator<Item = (SteeringPoint, &SteeringRule)> + '_ {
        (0..self.num_layers()).flat_map(move |layer| {
            SteeringSite::ATTENTION
                .into_iter()
                .chain(std::iter::once(SteeringSite::Residual))
                .filter_map(move |site| {
                    let point = SteeringPoint::new(layer, site);
                    self.rule(point).map(|rule| (point, rule))
                })
        })
    }

    /// Whether no rule is installed anywhere.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points().next().is_none()
    }
}

// ---------------------------------------------------------------------------
// ActiveSteering
// ---------------------------------------------------------------------------

/// A rule table bound to the batch layout of the running request.
///
/// Threaded through the forward pass; every instrumented site calls
/// [`apply`](Self::apply).
#[derive(Debug, Clone, Copy)]
pub struct ActiveSteering<'a> {
    /// Rule table.
    pub config: &'a SteeringConfiguration,
    /// Row layout of the batch being run.
    pub layout: BatchLayout,
}

impl<'a> ActiveSteering<'a> {
    /// Bind a table to a layout.
    #[must_use]
    pub const fn new(config: &'a SteeringConfiguration, layout: BatchLayout) -> Self {
        Self { config, layout }
    }

    /// Apply the rule at `point` to `x`, or return `x` unchanged.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`SteeringRule::apply`].
    pub fn apply(&self, point: SteeringPoint, x: &Tensor) -> Result<Tensor> {
        match self.config.rule(point) {
            Some(rule) => rule.apply(x, &self.layout),
            None => Ok(x.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn rows(data: &[&[f32]]) -> Tensor {
        let width = data[0].len();
        let flat: Vec<f32> = data.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (data.len(), width), &Device::Cpu).unwrap()
    }

    #[test]
    fn no_negative_rows_is_noop() {
        let x = rows(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let layout = BatchLayout::new(2, 0).unwrap();
        for weight in [0.0, 1.0, -3.5, 100.0] {
            let out = SteeringRule::new(weight).apply(&x, &layout).unwrap();
            assert_eq!(out.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
        }
    }

    #[test]
    fn custom_combine_skipped_without_negatives() {
        let x = rows(&[&[1.0, 2.0]]);
        let rule = SteeringRule::new(1.0).with_combine(Arc::new(|t, _, _| Ok((t * 0.0)?)));
        let out = rule.apply(&x, &BatchLayout::single()).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0]]);
    }

    #[test]
    fn custom_combine_replaces_default_blend() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let rule = SteeringRule::new(0.25).with_combine(Arc::new(move |t, weight, layout| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert!((weight - 0.25).abs() < f64::EPSILON);
            assert_eq!(layout.numneg, 1);
            Ok((t + 10.0)?)
        }));
        let x = rows(&[&[1.0, 2.0], &[5.0, 7.0]]);
        let out = rule.apply(&x, &BatchLayout::new(1, 1).unwrap()).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The default blend would give row 0 = [0, 0.75]; the combine output wins.
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![11.0, 12.0], vec![15.0, 17.0]]
        );
    }

    #[test]
    fn custom_combine_must_keep_shape() {
        let rule = SteeringRule::new(1.0)
            .with_combine(Arc::new(|t, _, _| Ok(t.narrow(0, 0, 1)?)));
        let x = rows(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let err = rule.apply(&x, &BatchLayout::new(1, 1).unwrap()).unwrap_err();
        assert!(matches!(err, SteerError::Steering(_)));
    }

    #[test]
    fn negative_equal_to_base_is_noop() {
        let x = rows(&[&[1.0, -2.0, 0.5], &[1.0, -2.0, 0.5]]);
        let layout = BatchLayout::new(1, 1).unwrap();
        let out = SteeringRule::new(1.0).apply(&x, &layout).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn default_blend_uses_snapshot_of_negative_mean() {
        // row0 = [0, 0], extra = [1, 1], negatives = [2, 4] and [4, 8]
        let x = rows(&[&[0.0, 0.0], &[1.0, 1.0], &[2.0, 4.0], &[4.0, 8.0]]);
        let layout = BatchLayout::new(2, 2).unwrap();
        let out = SteeringRule::new(0.5).apply(&x, &layout).unwrap();
        // neg_mean = [3, 6]; delta = 0.5 * ([3, 6] - [0, 0]) = [1.5, 3]
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![
                vec![-1.5, -3.0],
                vec![-0.5, -2.0],
                vec![0.5, 1.0],
                vec![2.5, 5.0],
            ]
        );
    }

    #[test]
    fn default_blend_on_head_tensors() {
        let x = Tensor::arange(0_f32, 24.0, &Device::Cpu)
            .unwrap()
            .reshape((2, 2, 3, 2))
            .unwrap();
        let layout = BatchLayout::new(1, 1).unwrap();
        let out = SteeringRule::new(1.0).apply(&x, &layout).unwrap();
        assert_eq!(out.dims(), &[2, 2, 3, 2]);
        // delta = row1 - row0 = 12 everywhere; row0 becomes -12..-1
        let first: Vec<f32> = out.get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!((first[0] + 12.0).abs() < 1e-6);
    }

    #[test]
    fn row_count_mismatch_errors() {
        let x = rows(&[&[1.0], &[2.0]]);
        let layout = BatchLayout::new(2, 1).unwrap();
        assert!(SteeringRule::new(1.0).apply(&x, &layout).is_err());
    }

    #[test]
    fn zero_positive_rows_rejected() {
        assert!(BatchLayout::new(0, 2).is_err());
    }

    #[test]
    fn configuration_routes_sites() {
        let mut config = SteeringConfiguration::new(4, vec![0, 2]);
        config
            .set(SteeringPoint::new(2, SteeringSite::Key), SteeringRule::new(0.3))
            .unwrap();
        config
            .set(SteeringPoint::new(1, SteeringSite::Residual), SteeringRule::new(0.7))
            .unwrap();
        assert!(
            config
                .set(SteeringPoint::new(1, SteeringSite::Query), SteeringRule::new(1.0))
                .is_err()
        );
        assert!(
            config
                .set(SteeringPoint::new(9, SteeringSite::Residual), SteeringRule::new(1.0))
                .is_err()
        );

        let key = config.rule(SteeringPoint::new(2, SteeringSite::Key)).unwrap();
        assert!((key.weight() - 0.3).abs() < f64::EPSILON);
        assert!(config.rule(SteeringPoint::new(2, SteeringSite::Query)).is_none());
        let points: Vec<_> = config.points().map(|(p, _)| p.to_string()).collect();
        assert_eq!(points, ["blocks.1.hook_resid_post", "blocks.2.attn.hook_k"]);
    }

    #[test]
    fn later_rule_replaces_earlier() {
        let mut config = SteeringConfiguration::new(2, vec![0, 1]);
        let point = SteeringPoint::new(0, SteeringSite::Hidden);
        config.set(point, SteeringRule::new(1.0)).unwrap();
        config.set(point, SteeringRule::new(2.0)).unwrap();
        assert!((config.rule(point).unwrap().weight() - 2.0).abs() < f64::EPSILON);
    }
}
