//! Datums carried by the oracle record UTxOs.
//!
//! The four records (settings, reward account, reward transport, aggregation
//! state) are each identified on chain by a policy token and carry one of
//! these closed sum types as their datum. Illegal states are not
//! representable: a transport is either `Empty` or `Pending` with a full
//! aggregation payload, never a half-filled record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, PosixTime};

/// A registered oracle node: the key that signs feeds and the key that gets
/// paid, which may differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub feed_key: NodeId,
    pub payment_key: NodeId,
}

/// Per-round fee schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Flat fee owed to each node whose feed enters consensus.
    pub node_fee: u64,
    /// Fee retained by the platform each round.
    pub platform_fee: u64,
}

/// Oracle configuration held by the settings record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleSettings {
    /// Registered nodes; the order of this list fixes the positional layout
    /// of the reward-account balance list.
    pub nodes: Vec<Node>,
    /// Minimum number of node signatures an aggregation needs.
    pub required_signatures: u64,
    pub fee: FeeSchedule,
    /// How long a published aggregation stays live, in milliseconds.
    pub aggregation_liveness: u64,
    /// Width of the transaction validity window, in milliseconds.
    pub time_uncertainty: u64,
    /// IQR fence multiplier, percent (150 = 1.5 x IQR).
    pub iqr_fence_multiplier: u64,
    /// Median-divergence fallback bound, per mille of the median.
    pub median_divergence_factor: u64,
    pub paused_at: Option<PosixTime>,
    pub closed_at: Option<PosixTime>,
}

impl OracleSettings {
    /// Feed keys in registration order; this is the positional order of the
    /// reward-account balances.
    pub fn node_order(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.feed_key).collect()
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some() || self.closed_at.is_some()
    }

    pub fn is_registered(&self, node: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.feed_key == node)
    }
}

/// The set of node feeds behind one aggregation round, ordered by
/// `(feed value, node id)` so the on-chain representation is canonical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateMessage {
    pub node_feeds: Vec<(NodeId, u64)>,
    pub count: u64,
    pub timestamp: PosixTime,
}

impl AggregateMessage {
    /// Builds the canonical message from collected feeds, sorting by
    /// `(feed value, node id)`.
    pub fn from_feeds(feeds: &BTreeMap<NodeId, u64>, timestamp: PosixTime) -> Self {
        let mut node_feeds: Vec<(NodeId, u64)> =
            feeds.iter().map(|(id, feed)| (*id, *feed)).collect();
        node_feeds.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));
        AggregateMessage {
            count: node_feeds.len() as u64,
            node_feeds,
            timestamp,
        }
    }

    /// Feed values in canonical (ascending) order.
    pub fn feed_values(&self) -> Vec<u64> {
        self.node_feeds.iter().map(|(_, feed)| *feed).collect()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.node_feeds.iter().map(|(id, _)| *id).collect()
    }

    /// Count matches and feeds are sorted by `(feed value, node id)`.
    pub fn is_well_formed(&self) -> bool {
        self.count as usize == self.node_feeds.len()
            && self
                .node_feeds
                .windows(2)
                .all(|w| (w[0].1, w[0].0) <= (w[1].1, w[1].0))
    }
}

/// Payload of a pending reward transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    /// Consensus value committed by this round.
    pub oracle_feed: u64,
    pub message: AggregateMessage,
    /// Node fee frozen at aggregation time; reward processing pays this
    /// even if settings change in between.
    pub node_reward_price: u64,
    /// Total fee paid into the transport for this round.
    pub rewards_amount_paid: u64,
}

/// State of a reward transport record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    Empty,
    Pending(Aggregation),
}

/// State of an aggregation state record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggState {
    Empty,
    Published {
        oracle_feed: u64,
        created_at: PosixTime,
        expiry: PosixTime,
    },
}

impl AggState {
    /// Published and past its expiry at `now`; eligible for reuse.
    pub fn is_expired(&self, now: PosixTime) -> bool {
        matches!(self, AggState::Published { expiry, .. } if *expiry <= now)
    }
}

/// Per-node reward balances, positionally aligned with the settings node
/// list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardAccount {
    pub balances: Vec<u64>,
}

impl RewardAccount {
    pub fn total(&self) -> u64 {
        self.balances.iter().sum()
    }
}

/// Closed sum of every datum an oracle record can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OracleDatum {
    Settings(OracleSettings),
    RewardAccount(RewardAccount),
    Transport(TransportState),
    AggState(AggState),
}

/// Redeemers accepted by the oracle validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OracleRedeemer {
    /// Spend a transport and commit the round's feeds into it.
    Aggregate(AggregateMessage),
    /// Spend the aggregation state and publish the consensus value.
    PublishFeed,
    /// Spend pending transports and the reward account to pay nodes out.
    ProcessRewards,
}
