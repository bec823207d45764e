//! Feedline Chain
//!
//! Everything that talks to the ledger: slot/time conversion, the pluggable
//! query backends, the caching query facade with confirmation and collateral
//! handling, and the transaction builder/signer.

pub mod backend;
pub mod network;
pub mod query;
pub mod tx;

use thiserror::Error;

pub use backend::{ChainBackend, IndexerBackend, NodeBackend};
pub use network::{NetworkEpoch, NetworkKind, NetworkTime};
pub use query::{ChainQuery, ChainQueryConfig, SubmitStatus};
pub use tx::{
    PartialSignedTx, ScriptTx, Tx, TxBody, TxConfig, TxInput, TxManager, ValidityWindow,
    VkeyWitness, TX_FEE,
};

/// Errors raised by the chain layer.
///
/// A confirmation timeout is deliberately not here: it is an outcome
/// (`SubmitStatus::TimedOut`), not a failure.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid network configuration: {0}")]
    Config(String),

    #[error("time conversion failed: {0}")]
    Time(String),

    #[error("ledger query failed: {0}")]
    Query(String),

    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transaction submission failed: {0}")]
    Submission(String),

    #[error("collateral unavailable: {0}")]
    Collateral(String),

    #[error("transaction build failed: {0}")]
    Build(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ChainError {
    fn from(err: bincode::Error) -> Self {
        ChainError::Serialization(err.to_string())
    }
}
