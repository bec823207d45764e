//! Feedline Oracle
//!
//! The aggregation-and-rewards engine: classifies the oracle's record
//! UTxOs, computes the consensus value over collected node feeds, and
//! builds the aggregation and reward-processing transactions.

pub mod builder;
pub mod collect;
pub mod consensus;
pub mod rewards;
pub mod state;

#[cfg(test)]
mod tests;

use thiserror::Error;

pub use builder::{AggregateRound, OracleTxBuilder, RewardsRound};
pub use collect::{FeedCollector, FeedRequest, NodeEndpoint};

use feedline_chain::ChainError;

/// Errors raised by the aggregation engine.
#[derive(Debug, Error)]
pub enum OracleError {
    /// The on-chain records are not in a state the operation can work
    /// with: missing settings, no matching pair, paused oracle.
    #[error("state validation failed: {0}")]
    State(String),

    #[error("consensus failed: {0}")]
    Consensus(String),

    #[error("signature verification failed: {0}")]
    Signature(String),

    #[error("aggregation failed: {0}")]
    Aggregation(String),

    #[error(transparent)]
    Chain(#[from] ChainError),
}
