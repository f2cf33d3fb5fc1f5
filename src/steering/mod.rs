// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steering configuration: sites, rules, and user settings.
//!
//! - [`SteeringSite`] / [`SteeringPoint`]: where a rule applies.
//! - [`SteeringRule`]: default blend or custom [`CombineFn`].
//! - [`SteeringConfiguration`]: per-layer rule table for one request.
//! - [`SteeringSettings`]: JSON form resolved into a table.

pub mod rule;
pub mod settings;
pub mod site;

pub use rule::{
    ActiveSteering, AttentionSteering, BatchLayout, CombineFn, SteeringConfiguration,
    SteeringRule, default_blend,
};
pub use settings::{AttentionEntry, LayerSelector, ResidualEntry, SteeringSettings};
pub use site::{SteeringPoint, SteeringSite};
