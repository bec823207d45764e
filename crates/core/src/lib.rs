//! Feedline Core
//!
//! Shared ledger and oracle domain types. Everything the chain layer and the
//! aggregation engine need to agree on lives here: the UTxO value model, the
//! closed datum sum types the oracle records carry, and the signed feed
//! messages node operators produce.

pub mod datum;
pub mod message;
pub mod types;

pub use datum::{
    AggState, AggregateMessage, Aggregation, FeeSchedule, Node, OracleDatum, OracleRedeemer,
    OracleSettings, RewardAccount, TransportState,
};
pub use message::{NodeFeedMessage, SignedNodeMessage};
pub use types::{
    Address, AssetName, NodeId, OutputRef, PolicyId, PosixTime, Script, ScriptHash, SlotNo, TxId,
    TxOut, Utxo, Value,
};
