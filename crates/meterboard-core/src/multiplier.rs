//! Billing multiplier composition
//!
//! `node.multiplier x plan.base_multiplier x product(plan override for each node label)`.
//! Labels the plan has no override for contribute exactly 1.0. Factors
//! compose without a cap; operators stack them deliberately.

use crate::directory::Directory;
use crate::error::{CoreError, Result};
use crate::models::{Node, NodeId, Plan, SubscriberId, NEUTRAL_MULTIPLIER};
use std::sync::Arc;

/// Compose the multiplier for traffic on `node` under `plan`
pub fn compose_multiplier(node: &Node, plan: Option<&Plan>) -> f64 {
    match plan {
        // No plan: no markup, no discount, regardless of node
        None => NEUTRAL_MULTIPLIER,
        Some(plan) => node
            .labels
            .iter()
            .map(|label| plan.label_multiplier(*label))
            .fold(node.multiplier * plan.base_multiplier, |acc, factor| acc * factor),
    }
}

/// Billable bytes for `real` bytes, rounded down
///
/// Whole multipliers stay in integer arithmetic and are exact. Fractional
/// ones go through `f64`, exact only while `real` is below 2^53.
pub fn billable_bytes(real: u64, multiplier: f64) -> u64 {
    if multiplier.fract() == 0.0 && multiplier >= 0.0 && multiplier < u64::MAX as f64 {
        return real.saturating_mul(multiplier as u64);
    }
    // `as` saturates at u64::MAX for out-of-range floats
    (real as f64 * multiplier).floor() as u64
}

/// Looks up the catalog entities and composes their multiplier
pub struct MultiplierCalculator {
    directory: Arc<dyn Directory>,
}

impl MultiplierCalculator {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Multiplier for `subscriber_id` on `node_id`.
    ///
    /// Missing subscribers, nodes and plans propagate as not-found; only a
    /// missing label override is treated as neutral.
    pub fn compute(&self, subscriber_id: SubscriberId, node_id: NodeId) -> Result<f64> {
        let subscriber = self.directory.subscriber(subscriber_id)?;
        let node = self.directory.node(node_id)?;
        let plan = match subscriber.plan_id {
            Some(plan_id) => Some(self.directory.plan(plan_id)?),
            None => None,
        };
        checked(subscriber_id, &node, plan.as_ref())
    }
}

/// Compose and reject anything that isn't a positive finite factor
pub fn checked(subscriber_id: SubscriberId, node: &Node, plan: Option<&Plan>) -> Result<f64> {
    let value = compose_multiplier(node, plan);
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(CoreError::InvalidMultiplier {
            subscriber_id,
            node_id: node.id,
            value,
        })
    }
}
