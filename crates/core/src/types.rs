//! Ledger primitives: output references, multi-asset values, UTxOs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::datum::OracleDatum;

/// Minting policy identifier (script hash of the policy).
pub type PolicyId = [u8; 32];

/// Hash of a validator script.
pub type ScriptHash = [u8; 32];

/// Transaction identifier (hash of the transaction body).
pub type TxId = [u8; 32];

/// Node identity as 32-byte ed25519 public key.
pub type NodeId = [u8; 32];

/// Absolute slot number.
pub type SlotNo = u64;

/// POSIX time in milliseconds.
pub type PosixTime = u64;

/// Asset name within a policy, raw bytes.
pub type AssetName = Vec<u8>;

/// Bech32-style address, kept opaque.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address(s.to_string())
    }
}

/// Reference to a transaction output: transaction id plus output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub tx_id: TxId,
    pub index: u32,
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", hex::encode(self.tx_id), self.index)
    }
}

/// A multi-asset ledger value: base-coin quantity plus native tokens keyed
/// by `(policy, asset name)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub coin: u64,
    pub assets: BTreeMap<(PolicyId, AssetName), u64>,
}

impl Value {
    pub fn coin(coin: u64) -> Self {
        Value { coin, assets: BTreeMap::new() }
    }

    /// Quantity of one asset, zero when absent.
    pub fn asset(&self, policy: &PolicyId, name: &[u8]) -> u64 {
        self.assets
            .get(&(*policy, name.to_vec()))
            .copied()
            .unwrap_or(0)
    }

    pub fn add_asset(&mut self, policy: PolicyId, name: AssetName, quantity: u64) {
        if quantity == 0 {
            return;
        }
        *self.assets.entry((policy, name)).or_insert(0) += quantity;
    }

    /// Removes up to `quantity` of an asset, dropping the entry at zero.
    pub fn sub_asset(&mut self, policy: &PolicyId, name: &[u8], quantity: u64) {
        let key = (*policy, name.to_vec());
        if let Some(held) = self.assets.get_mut(&key) {
            *held = held.saturating_sub(quantity);
            if *held == 0 {
                self.assets.remove(&key);
            }
        }
    }

    /// True when the value carries no native tokens at all.
    pub fn is_plain(&self) -> bool {
        self.assets.values().all(|q| *q == 0)
    }

    /// Merges another value into this one.
    pub fn add(&mut self, other: &Value) {
        self.coin += other.coin;
        for ((policy, name), quantity) in &other.assets {
            self.add_asset(*policy, name.clone(), *quantity);
        }
    }

    /// Per-asset shortfall of `self` against `required`, `None` when covered.
    pub fn shortfall(&self, required: &Value) -> Option<Value> {
        let mut missing = Value::default();
        if required.coin > self.coin {
            missing.coin = required.coin - self.coin;
        }
        for ((policy, name), quantity) in &required.assets {
            let held = self.asset(policy, name);
            if *quantity > held {
                missing.add_asset(*policy, name.clone(), quantity - held);
            }
        }
        if missing.coin == 0 && missing.assets.is_empty() {
            None
        } else {
            Some(missing)
        }
    }
}

/// A transaction output: where the value sits and what datum rides along.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub address: Address,
    pub value: Value,
    pub datum: Option<OracleDatum>,
    pub script: Option<ScriptHash>,
}

impl TxOut {
    pub fn new(address: Address, value: Value) -> Self {
        TxOut { address, value, datum: None, script: None }
    }

    pub fn with_datum(address: Address, value: Value, datum: OracleDatum) -> Self {
        TxOut { address, value, datum: Some(datum), script: None }
    }
}

/// An unspent output together with the reference that locates it on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub reference: OutputRef,
    pub output: TxOut,
}

impl Utxo {
    /// Quantity of one asset held by this UTxO.
    pub fn asset(&self, policy: &PolicyId, name: &[u8]) -> u64 {
        self.output.value.asset(policy, name)
    }
}

/// Raw validator script bytes, as fetched from a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script(pub Vec<u8>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_asset_accounting() {
        let mut value = Value::coin(2_000_000);
        value.add_asset([1u8; 32], b"Token".to_vec(), 5);
        assert_eq!(value.asset(&[1u8; 32], b"Token"), 5);
        assert_eq!(value.asset(&[1u8; 32], b"Other"), 0);
        assert!(!value.is_plain());

        value.sub_asset(&[1u8; 32], b"Token", 5);
        assert!(value.is_plain());
        assert!(value.assets.is_empty());
    }

    #[test]
    fn value_shortfall() {
        let mut held = Value::coin(1_000_000);
        held.add_asset([2u8; 32], b"Fee".to_vec(), 10);

        let mut required = Value::coin(3_000_000);
        required.add_asset([2u8; 32], b"Fee".to_vec(), 25);

        let missing = held.shortfall(&required).unwrap();
        assert_eq!(missing.coin, 2_000_000);
        assert_eq!(missing.asset(&[2u8; 32], b"Fee"), 15);

        assert!(required.shortfall(&held).is_none());
    }
}
