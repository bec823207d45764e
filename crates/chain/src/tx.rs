//! Transaction model, builder and signing.
//!
//! Transactions are built against a [`ChainQuery`] so UTxO selection and
//! collateral handling see the same cache the rest of the engine sees.
//! Ordering matters in `build_script_tx`: collateral is attached before the
//! fee-paying inputs are chosen, because creating collateral can spend and
//! replace the very outputs fee selection would otherwise pick.

use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use feedline_core::{
    Address, AssetName, NodeId, OracleRedeemer, OutputRef, PolicyId, PosixTime, SlotNo, TxId,
    TxOut, Utxo, Value,
};

use crate::query::{ChainQuery, SubmitStatus};
use crate::ChainError;

/// Flat fee reserved by the builder for every transaction.
pub const TX_FEE: u64 = 200_000;

/// An ed25519 verification-key witness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VkeyWitness {
    pub vkey: [u8; 32],
    pub signature: Vec<u8>,
}

/// A spent input, optionally a script spend with redeemer and a reference
/// to the UTxO carrying the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub source: OutputRef,
    pub redeemer: Option<OracleRedeemer>,
    pub script_ref: Option<OutputRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBody {
    pub inputs: Vec<TxInput>,
    pub reference_inputs: Vec<OutputRef>,
    pub outputs: Vec<TxOut>,
    pub mint: Vec<((PolicyId, AssetName), i64)>,
    pub required_signers: Vec<NodeId>,
    pub collateral: Option<OutputRef>,
    pub validity_start: SlotNo,
    pub validity_end: SlotNo,
    pub fee: u64,
}

/// A transaction: body plus accumulated witnesses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub body: TxBody,
    pub witnesses: Vec<VkeyWitness>,
}

impl Tx {
    /// Transaction id: SHA-256 over the serialized body.
    pub fn id(&self) -> TxId {
        let bytes = bincode::serialize(&self.body).expect("body serialization is infallible");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.finalize().into()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChainError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Appends a witness for `key`, replacing nothing: signing twice with
    /// the same key is a no-op.
    pub fn sign(&mut self, key: &SigningKey) {
        let vkey = key.verifying_key().to_bytes();
        if self.witnesses.iter().any(|w| w.vkey == vkey) {
            return;
        }
        let signature = key.sign(&self.id());
        self.witnesses.push(VkeyWitness {
            vkey,
            signature: signature.to_bytes().to_vec(),
        });
    }

    /// Merges another party's witness set into this transaction, keyed by
    /// verification key.
    pub fn merge_witnesses(&mut self, other: &Tx) {
        for witness in &other.witnesses {
            if !self.witnesses.iter().any(|w| w.vkey == witness.vkey) {
                self.witnesses.push(witness.clone());
            }
        }
    }

    pub fn signer_keys(&self) -> Vec<[u8; 32]> {
        self.witnesses.iter().map(|w| w.vkey).collect()
    }

    /// Distinct addresses paid by this transaction.
    pub fn output_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> =
            self.body.outputs.iter().map(|o| o.address.clone()).collect();
        addresses.sort();
        addresses.dedup();
        addresses
    }
}

/// Transaction validity interval in POSIX milliseconds, with the midpoint
/// taken as the canonical "current time" of the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub start: PosixTime,
    pub end: PosixTime,
}

impl ValidityWindow {
    pub fn new(start: PosixTime, end: PosixTime) -> Result<Self, ChainError> {
        if end <= start {
            return Err(ChainError::Build(format!(
                "validity window [{start}, {end}] is empty"
            )));
        }
        Ok(ValidityWindow { start, end })
    }

    /// Canonical current time of a transaction carrying this window.
    pub fn current_time(&self) -> PosixTime {
        (self.start + self.end) / 2
    }

    pub fn contains(&self, timestamp: PosixTime) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}

/// A partially signed transaction in its persistence format: hex-encoded
/// bytes, the keys that already signed, and the signature threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignedTx {
    pub tx_bytes: String,
    pub signed_by: Vec<String>,
    pub threshold: usize,
}

impl PartialSignedTx {
    pub fn from_tx(tx: &Tx, threshold: usize) -> Result<Self, ChainError> {
        Ok(PartialSignedTx {
            tx_bytes: hex::encode(tx.to_bytes()?),
            signed_by: tx.signer_keys().iter().map(hex::encode).collect(),
            threshold,
        })
    }

    pub fn to_tx(&self) -> Result<Tx, ChainError> {
        let bytes = hex::decode(&self.tx_bytes)
            .map_err(|e| ChainError::Serialization(format!("invalid tx hex: {e}")))?;
        Tx::from_bytes(&bytes)
    }

    /// Folds another party's copy of the same transaction into this one.
    pub fn merge(&mut self, other: &PartialSignedTx) -> Result<(), ChainError> {
        let mut tx = self.to_tx()?;
        let other_tx = other.to_tx()?;
        if tx.body != other_tx.body {
            return Err(ChainError::Build("cannot merge witnesses of different transactions".into()));
        }
        tx.merge_witnesses(&other_tx);
        *self = PartialSignedTx::from_tx(&tx, self.threshold)?;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.signed_by.len() >= self.threshold
    }
}

/// Parameters of a script-spending transaction.
#[derive(Debug, Clone, Default)]
pub struct ScriptTx {
    /// Script inputs with their redeemers and reference-script sources.
    pub script_inputs: Vec<(Utxo, OracleRedeemer, Option<OutputRef>)>,
    pub outputs: Vec<TxOut>,
    pub reference_inputs: Vec<OutputRef>,
    pub mint: Vec<((PolicyId, AssetName), i64)>,
    pub required_signers: Vec<NodeId>,
    pub validity: Option<ValidityWindow>,
}

/// Builder configuration.
#[derive(Debug, Clone)]
pub struct TxConfig {
    /// Collateral amount requested when a script spend needs one.
    pub collateral_amount: u64,
    /// Minimum coin placed on a change output; smaller change folds into
    /// the fee.
    pub min_change: u64,
}

impl Default for TxConfig {
    fn default() -> Self {
        TxConfig {
            collateral_amount: 10_000_000,
            min_change: 1_000_000,
        }
    }
}

/// Builds, signs and submits transactions against a [`ChainQuery`].
pub struct TxManager {
    query: Arc<ChainQuery>,
    config: TxConfig,
}

impl TxManager {
    pub fn new(query: Arc<ChainQuery>) -> Self {
        TxManager { query, config: TxConfig::default() }
    }

    pub fn with_config(query: Arc<ChainQuery>, config: TxConfig) -> Self {
        TxManager { query, config }
    }

    pub fn query(&self) -> &Arc<ChainQuery> {
        &self.query
    }

    /// Validity window `[now, now + uncertainty]`.
    pub fn calculate_validity_window(&self, uncertainty: u64) -> Result<ValidityWindow, ChainError> {
        let now = self.query.now_ms();
        ValidityWindow::new(now, now + uncertainty)
    }

    /// Assembles an unsigned script-spending transaction.
    ///
    /// Collateral is attached first, then fee-paying inputs are selected
    /// from `change_address` and the change output appended.
    pub async fn build_script_tx(
        &self,
        params: ScriptTx,
        change_address: &Address,
        signing_key: &SigningKey,
    ) -> Result<Tx, ChainError> {
        let window = match params.validity {
            Some(window) => window,
            None => return Err(ChainError::Build("script transaction needs a validity window".into())),
        };
        let epoch = self.query.epoch();
        let validity_start = epoch.posix_to_slot(window.start)?;
        let validity_end = epoch.posix_to_slot(window.end)?;

        let mut body = TxBody {
            reference_inputs: params.reference_inputs,
            mint: params.mint,
            required_signers: params.required_signers,
            validity_start,
            validity_end,
            fee: TX_FEE,
            ..TxBody::default()
        };

        let mut total_in = Value::default();
        for (utxo, redeemer, script_ref) in &params.script_inputs {
            total_in.add(&utxo.output.value);
            body.inputs.push(TxInput {
                source: utxo.reference,
                redeemer: Some(redeemer.clone()),
                script_ref: *script_ref,
            });
        }

        // Collateral first. Creating it may replace the UTxOs at the
        // change address, so fee selection must come after.
        let collateral = if params.script_inputs.is_empty() {
            None
        } else {
            let utxo = self
                .query
                .get_or_create_collateral(change_address, signing_key, self.config.collateral_amount)
                .await?;
            Some(utxo.reference)
        };
        body.collateral = collateral;

        let mut required = Value::coin(TX_FEE);
        for output in &params.outputs {
            required.add(&output.value);
        }
        for ((policy, name), amount) in &body.mint {
            if *amount > 0 {
                total_in.add_asset(*policy, name.clone(), *amount as u64);
            } else {
                required.add_asset(*policy, name.clone(), amount.unsigned_abs());
            }
        }
        body.outputs = params.outputs;

        if let Some(missing) = total_in.shortfall(&required) {
            let candidates = self.query.utxos(change_address).await?;
            let selected = select_inputs(&candidates, &missing, collateral.as_ref())?;
            for utxo in selected {
                total_in.add(&utxo.output.value);
                body.inputs.push(TxInput {
                    source: utxo.reference,
                    redeemer: None,
                    script_ref: None,
                });
            }
        }

        if let Some(change) = change_value(&total_in, &required)? {
            if change.coin >= self.config.min_change || !change.is_plain() {
                body.outputs.push(TxOut::new(change_address.clone(), change));
            } else {
                // Sub-minimum plain change folds into the fee so the value
                // equation stays balanced.
                body.fee += change.coin;
            }
        }

        debug!(
            inputs = body.inputs.len(),
            outputs = body.outputs.len(),
            validity_start,
            validity_end,
            "built script transaction"
        );
        Ok(Tx { body, witnesses: Vec::new() })
    }

    /// Signs with every key, submits, and optionally waits for
    /// confirmation.
    pub async fn sign_and_submit(
        &self,
        mut tx: Tx,
        keys: &[&SigningKey],
        wait: bool,
    ) -> Result<SubmitStatus, ChainError> {
        for key in keys {
            tx.sign(key);
        }
        let status = self.query.submit_and_wait(&tx, wait).await?;
        info!(tx_id = %hex::encode(tx.id()), ?status, "transaction submitted");
        Ok(status)
    }
}

/// Greedy coin-and-asset selection over plain ordering of `candidates`.
fn select_inputs<'a>(
    candidates: &'a [Utxo],
    missing: &Value,
    exclude: Option<&OutputRef>,
) -> Result<Vec<&'a Utxo>, ChainError> {
    let mut selected = Vec::new();
    let mut gathered = Value::default();
    for utxo in candidates {
        if Some(&utxo.reference) == exclude {
            continue;
        }
        selected.push(utxo);
        gathered.add(&utxo.output.value);
        if gathered.shortfall(missing).is_none() {
            return Ok(selected);
        }
    }
    let outstanding = gathered.shortfall(missing).unwrap_or_default();
    Err(ChainError::Build(format!(
        "insufficient funds: still missing {} coin after selecting {} inputs",
        outstanding.coin,
        selected.len()
    )))
}

/// Surplus of inputs over requirements, `None` when exact.
fn change_value(total_in: &Value, required: &Value) -> Result<Option<Value>, ChainError> {
    if total_in.shortfall(required).is_some() {
        return Err(ChainError::Build("inputs do not cover outputs and fee".into()));
    }
    let mut change = Value::coin(total_in.coin - required.coin);
    for ((policy, name), quantity) in &total_in.assets {
        let out = required.asset(policy, name);
        if *quantity > out {
            change.add_asset(*policy, name.clone(), quantity - out);
        }
    }
    if change.coin == 0 && change.assets.is_empty() {
        Ok(None)
    } else {
        Ok(Some(change))
    }
}

/// Builds the unsigned self-payment used to mint a fresh collateral UTxO.
pub(crate) fn build_self_payment(
    candidates: &[Utxo],
    address: &Address,
    amount: u64,
    epoch_slots: (SlotNo, SlotNo),
) -> Result<Tx, ChainError> {
    let missing = Value::coin(amount + TX_FEE);
    let selected = select_inputs(candidates, &missing, None)?;
    let mut total_in = Value::default();
    let mut inputs = Vec::new();
    for utxo in &selected {
        total_in.add(&utxo.output.value);
        inputs.push(TxInput {
            source: utxo.reference,
            redeemer: None,
            script_ref: None,
        });
    }

    let mut outputs = vec![TxOut::new(address.clone(), Value::coin(amount))];
    if let Some(change) = change_value(&total_in, &missing)? {
        outputs.push(TxOut::new(address.clone(), change));
    }

    Ok(Tx {
        body: TxBody {
            inputs,
            outputs,
            validity_start: epoch_slots.0,
            validity_end: epoch_slots.1,
            fee: TX_FEE,
            ..TxBody::default()
        },
        witnesses: Vec::new(),
    })
}
