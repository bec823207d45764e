//! Pluggable ledger query backends.
//!
//! Two interchangeable HTTP implementations sit behind [`ChainBackend`]:
//! an indexer that serves everything from one REST API, and a node paired
//! with a separate UTxO index. A missing resource is an absent result,
//! never an error; callers polling for a transaction rely on that.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use feedline_core::{Address, OracleDatum, OutputRef, Script, ScriptHash, SlotNo, TxId, TxOut, Utxo, Value};

use crate::ChainError;

/// Read/write access to the ledger.
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// All unspent outputs at an address. An unknown address yields an
    /// empty list.
    async fn utxos_at(&self, address: &Address) -> Result<Vec<Utxo>, ChainError>;

    /// Validator script bytes by hash, `None` when unknown.
    async fn script(&self, hash: &ScriptHash) -> Result<Option<Script>, ChainError>;

    /// Submits serialized transaction bytes, returning the transaction id.
    async fn submit(&self, tx_bytes: &[u8]) -> Result<TxId, ChainError>;

    /// Slot of the current chain tip.
    async fn tip_slot(&self) -> Result<SlotNo, ChainError>;

    /// Whether a transaction is visible on chain yet. `Ok(false)` means
    /// "not yet", which confirmation polling treats as a reason to retry.
    async fn transaction_exists(&self, id: &TxId) -> Result<bool, ChainError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct AssetDto {
    policy: String,
    name: String,
    quantity: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct UtxoDto {
    tx_id: String,
    index: u32,
    address: String,
    coin: u64,
    #[serde(default)]
    assets: Vec<AssetDto>,
    #[serde(default)]
    datum: Option<String>,
    #[serde(default)]
    script_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScriptDto {
    bytes: String,
}

#[derive(Debug, Deserialize)]
struct SubmitDto {
    tx_id: String,
}

#[derive(Debug, Deserialize)]
struct TipDto {
    slot: SlotNo,
}

fn parse_hash32(hex_str: &str, what: &str) -> Result<[u8; 32], ChainError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| ChainError::Query(format!("invalid {what} hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| ChainError::Query(format!("{what} is not 32 bytes")))
}

impl UtxoDto {
    fn into_utxo(self) -> Result<Utxo, ChainError> {
        let tx_id = parse_hash32(&self.tx_id, "tx id")?;
        let mut value = Value::coin(self.coin);
        for asset in self.assets {
            let policy = parse_hash32(&asset.policy, "policy id")?;
            let name = hex::decode(&asset.name)
                .map_err(|e| ChainError::Query(format!("invalid asset name hex: {e}")))?;
            value.add_asset(policy, name, asset.quantity);
        }
        // A datum that fails to decode is treated as foreign, not fatal;
        // the state layer skips datum-less UTxOs.
        let datum = self.datum.as_deref().and_then(|datum_hex| {
            let bytes = hex::decode(datum_hex).ok()?;
            match bincode::deserialize::<OracleDatum>(&bytes) {
                Ok(datum) => Some(datum),
                Err(_) => {
                    debug!(tx_id = %self.tx_id, index = self.index, "skipping undecodable datum");
                    None
                }
            }
        });
        let script = match self.script_hash.as_deref() {
            Some(hash_hex) => Some(parse_hash32(hash_hex, "script hash")?),
            None => None,
        };
        Ok(Utxo {
            reference: OutputRef { tx_id, index: self.index },
            output: TxOut {
                address: Address(self.address),
                value,
                datum,
                script,
            },
        })
    }
}

/// Backend over a single REST indexer.
pub struct IndexerBackend {
    base_url: String,
    client: reqwest::Client,
}

impl IndexerBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        IndexerBackend {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChainBackend for IndexerBackend {
    async fn utxos_at(&self, address: &Address) -> Result<Vec<Utxo>, ChainError> {
        let url = format!("{}/addresses/{}/utxos", self.base_url, address);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let dtos: Vec<UtxoDto> = resp.error_for_status()?.json().await?;
        dtos.into_iter().map(UtxoDto::into_utxo).collect()
    }

    async fn script(&self, hash: &ScriptHash) -> Result<Option<Script>, ChainError> {
        let url = format!("{}/scripts/{}", self.base_url, hex::encode(hash));
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let dto: ScriptDto = resp.error_for_status()?.json().await?;
        let bytes = hex::decode(&dto.bytes)
            .map_err(|e| ChainError::Query(format!("invalid script hex: {e}")))?;
        Ok(Some(Script(bytes)))
    }

    async fn submit(&self, tx_bytes: &[u8]) -> Result<TxId, ChainError> {
        let url = format!("{}/tx/submit", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "tx": hex::encode(tx_bytes) }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, %body, "indexer rejected transaction");
            return Err(ChainError::Submission(format!("indexer returned {status}: {body}")));
        }
        let dto: SubmitDto = resp.json().await?;
        parse_hash32(&dto.tx_id, "tx id")
    }

    async fn tip_slot(&self) -> Result<SlotNo, ChainError> {
        let url = format!("{}/tip", self.base_url);
        let dto: TipDto = self.client.get(&url).send().await?.error_for_status()?.json().await?;
        Ok(dto.slot)
    }

    async fn transaction_exists(&self, id: &TxId) -> Result<bool, ChainError> {
        let url = format!("{}/txs/{}", self.base_url, hex::encode(id));
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status()?;
        Ok(true)
    }
}

/// Backend over a node endpoint for submission and tip, paired with a
/// separate UTxO index for queries.
pub struct NodeBackend {
    node_url: String,
    index_url: String,
    client: reqwest::Client,
}

impl NodeBackend {
    pub fn new(node_url: impl Into<String>, index_url: impl Into<String>) -> Self {
        NodeBackend {
            node_url: node_url.into(),
            index_url: index_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChainBackend for NodeBackend {
    async fn utxos_at(&self, address: &Address) -> Result<Vec<Utxo>, ChainError> {
        let url = format!("{}/matches/{}?unspent", self.index_url, address);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let dtos: Vec<UtxoDto> = resp.error_for_status()?.json().await?;
        dtos.into_iter().map(UtxoDto::into_utxo).collect()
    }

    async fn script(&self, hash: &ScriptHash) -> Result<Option<Script>, ChainError> {
        let url = format!("{}/scripts/{}", self.index_url, hex::encode(hash));
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let dto: ScriptDto = resp.error_for_status()?.json().await?;
        let bytes = hex::decode(&dto.bytes)
            .map_err(|e| ChainError::Query(format!("invalid script hex: {e}")))?;
        Ok(Some(Script(bytes)))
    }

    async fn submit(&self, tx_bytes: &[u8]) -> Result<TxId, ChainError> {
        let url = format!("{}/tx", self.node_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "tx": hex::encode(tx_bytes) }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, %body, "node rejected transaction");
            return Err(ChainError::Submission(format!("node returned {status}: {body}")));
        }
        let dto: SubmitDto = resp.json().await?;
        parse_hash32(&dto.tx_id, "tx id")
    }

    async fn tip_slot(&self) -> Result<SlotNo, ChainError> {
        let url = format!("{}/tip", self.node_url);
        let dto: TipDto = self.client.get(&url).send().await?.error_for_status()?.json().await?;
        Ok(dto.slot)
    }

    async fn transaction_exists(&self, id: &TxId) -> Result<bool, ChainError> {
        // The index has no per-transaction endpoint; an unspent or spent
        // match for the id means the transaction made it on chain.
        let url = format!("{}/matches/*@{}", self.index_url, hex::encode(id));
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let matches: Vec<serde_json::Value> = resp.error_for_status()?.json().await?;
        Ok(!matches.is_empty())
    }
}
