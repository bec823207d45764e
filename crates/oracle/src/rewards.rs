//! Reward fee math and balance accumulation.
//!
//! Rewards are positional: the reward-account datum holds one balance per
//! registered node, in settings registration order. Accumulation never
//! reorders or drops entries, and the total paid out of a round equals the
//! node fee times the number of accepted nodes.

use std::collections::{BTreeMap, BTreeSet};

use feedline_core::{FeeSchedule, NodeId};

/// Minimum fee a round must pay into the transport:
/// `platform_fee + node_fee * node_count`.
pub fn min_fee(fee: &FeeSchedule, node_count: u64) -> u64 {
    fee.platform_fee + fee.node_fee * node_count
}

/// Flat per-node distribution over the accepted set.
pub fn distribute(accepted: &BTreeSet<NodeId>, node_fee: u64) -> BTreeMap<NodeId, u64> {
    accepted.iter().map(|id| (*id, node_fee)).collect()
}

/// Adds a distribution onto the positional balance list.
///
/// `node_order` is the settings registration order; balances missing from
/// a shorter `current` list count as zero, so a freshly registered node
/// extends the list in place.
pub fn accumulate(
    current: &[u64],
    distribution: &BTreeMap<NodeId, u64>,
    node_order: &[NodeId],
) -> Vec<u64> {
    node_order
        .iter()
        .enumerate()
        .map(|(index, node)| {
            current.get(index).copied().unwrap_or(0)
                + distribution.get(node).copied().unwrap_or(0)
        })
        .collect()
}

/// Conservation check: every unit distributed lands in the new balances.
pub fn conserves(old: &[u64], new: &[u64], distribution: &BTreeMap<NodeId, u64>) -> bool {
    let old_total: u64 = old.iter().sum();
    let new_total: u64 = new.iter().sum();
    let distributed: u64 = distribution.values().sum();
    new_total == old_total + distributed
}
