//! Caching ledger query facade.
//!
//! `ChainQuery` wraps a backend with an explicit address-keyed UTxO cache,
//! confirmation polling and collateral management. The cache is only ever
//! invalidated explicitly: after a submission (for every output address)
//! and during the collateral refresh rescan.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use feedline_core::{Address, PosixTime, Script, ScriptHash, SlotNo, TxId, Utxo};

use crate::backend::ChainBackend;
use crate::network::{NetworkEpoch, NetworkTime};
use crate::tx::{build_self_payment, Tx};
use crate::ChainError;

/// Outcome of a submission. A timeout is an outcome, not an error: the
/// transaction may still confirm later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// Submitted without waiting for confirmation.
    Submitted,
    /// Seen on chain within the polling budget.
    Confirmed,
    /// Polling budget exhausted without a sighting.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ChainQueryConfig {
    /// Confirmation polling attempts before giving up.
    pub max_retries: u32,
    /// Delay between confirmation polls.
    pub retry_delay: Duration,
    /// Settle time before rescanning after a collateral creation.
    pub utxo_refresh_delay: Duration,
    /// Accepted collateral amount bounds, validated before any ledger call.
    pub min_collateral: u64,
    pub max_collateral: u64,
    /// A found collateral UTxO may exceed the requested amount by up to
    /// this much.
    pub collateral_buffer: u64,
}

impl Default for ChainQueryConfig {
    fn default() -> Self {
        ChainQueryConfig {
            max_retries: 10,
            retry_delay: Duration::from_secs(20),
            utxo_refresh_delay: Duration::from_secs(5),
            min_collateral: 5_000_000,
            max_collateral: 20_000_000,
            collateral_buffer: 1_000_000,
        }
    }
}

pub struct ChainQuery {
    backend: Box<dyn ChainBackend>,
    time: NetworkTime,
    config: ChainQueryConfig,
    cache: Mutex<HashMap<Address, Vec<Utxo>>>,
}

impl ChainQuery {
    pub fn new(backend: Box<dyn ChainBackend>, time: NetworkTime, config: ChainQueryConfig) -> Self {
        ChainQuery {
            backend,
            time,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn epoch(&self) -> NetworkEpoch {
        self.time.epoch
    }

    pub fn config(&self) -> &ChainQueryConfig {
        &self.config
    }

    /// Current POSIX milliseconds per the configured time source.
    pub fn now_ms(&self) -> PosixTime {
        self.time.now_ms()
    }

    pub async fn tip_slot(&self) -> Result<SlotNo, ChainError> {
        self.backend.tip_slot().await
    }

    /// UTxOs at an address, served from cache when warm.
    pub async fn utxos(&self, address: &Address) -> Result<Vec<Utxo>, ChainError> {
        {
            let cache = self.cache.lock().expect("cache lock poisoned");
            if let Some(utxos) = cache.get(address) {
                return Ok(utxos.clone());
            }
        }
        let utxos = self.backend.utxos_at(address).await?;
        debug!(%address, count = utxos.len(), "cached utxos");
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .insert(address.clone(), utxos.clone());
        Ok(utxos)
    }

    /// Drops cached entries for the given addresses.
    pub fn invalidate<'a>(&self, addresses: impl IntoIterator<Item = &'a Address>) {
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        for address in addresses {
            cache.remove(address);
        }
    }

    pub async fn script(&self, hash: &ScriptHash) -> Result<Option<Script>, ChainError> {
        self.backend.script(hash).await
    }

    /// Submits a transaction, invalidates every output address, and
    /// optionally polls for confirmation.
    pub async fn submit_and_wait(&self, tx: &Tx, wait: bool) -> Result<SubmitStatus, ChainError> {
        let bytes = tx.to_bytes()?;
        let tx_id = self.backend.submit(&bytes).await?;
        self.invalidate(tx.output_addresses().iter());
        info!(tx_id = %hex::encode(tx_id), wait, "submitted transaction");
        if !wait {
            return Ok(SubmitStatus::Submitted);
        }
        self.wait_for_confirmation(&tx_id).await
    }

    /// Bounded confirmation polling. "Not on chain yet" keeps the loop
    /// going; any other backend failure aborts it.
    pub async fn wait_for_confirmation(&self, tx_id: &TxId) -> Result<SubmitStatus, ChainError> {
        for attempt in 1..=self.config.max_retries {
            if self.backend.transaction_exists(tx_id).await? {
                info!(tx_id = %hex::encode(tx_id), attempt, "transaction confirmed");
                return Ok(SubmitStatus::Confirmed);
            }
            debug!(tx_id = %hex::encode(tx_id), attempt, "transaction not visible yet");
            if attempt < self.config.max_retries {
                sleep(self.config.retry_delay).await;
            }
        }
        warn!(
            tx_id = %hex::encode(tx_id),
            retries = self.config.max_retries,
            "confirmation polling exhausted"
        );
        Ok(SubmitStatus::TimedOut)
    }

    /// A plain UTxO at `address` holding between `amount` and
    /// `amount + collateral_buffer` coin.
    pub async fn find_collateral(
        &self,
        address: &Address,
        amount: u64,
    ) -> Result<Option<Utxo>, ChainError> {
        let upper = amount + self.config.collateral_buffer;
        let utxos = self.utxos(address).await?;
        Ok(utxos.into_iter().find(|utxo| {
            utxo.output.value.is_plain()
                && utxo.output.value.coin >= amount
                && utxo.output.value.coin <= upper
        }))
    }

    /// Creates a collateral UTxO by paying `amount` back to `address`,
    /// then waits for the ledger view to settle and rescans.
    pub async fn create_collateral(
        &self,
        address: &Address,
        signing_key: &SigningKey,
        amount: u64,
    ) -> Result<(), ChainError> {
        let candidates = self.utxos(address).await?;
        let now = self.now_ms();
        let epoch = self.epoch();
        let slots = (
            epoch.posix_to_slot(now)?,
            epoch.posix_to_slot(now + 3_600_000)?,
        );
        let mut tx = build_self_payment(&candidates, address, amount, slots)?;
        tx.sign(signing_key);

        info!(%address, amount, "creating collateral utxo");
        match self.submit_and_wait(&tx, true).await? {
            SubmitStatus::Confirmed | SubmitStatus::Submitted => {}
            SubmitStatus::TimedOut => {
                return Err(ChainError::Collateral(
                    "collateral transaction did not confirm in time".into(),
                ));
            }
        }

        sleep(self.config.utxo_refresh_delay).await;
        self.invalidate([address]);
        Ok(())
    }

    /// Finds a suitable collateral UTxO, creating one when none exists.
    /// The amount is validated against the configured bounds before any
    /// ledger interaction.
    pub async fn get_or_create_collateral(
        &self,
        address: &Address,
        signing_key: &SigningKey,
        amount: u64,
    ) -> Result<Utxo, ChainError> {
        if !(self.config.min_collateral..=self.config.max_collateral).contains(&amount) {
            return Err(ChainError::Collateral(format!(
                "collateral amount {amount} outside [{}, {}]",
                self.config.min_collateral, self.config.max_collateral
            )));
        }

        if let Some(utxo) = self.find_collateral(address, amount).await? {
            debug!(%address, reference = %utxo.reference, "reusing existing collateral");
            return Ok(utxo);
        }

        self.create_collateral(address, signing_key, amount).await?;
        self.find_collateral(address, amount)
            .await?
            .ok_or_else(|| {
                ChainError::Collateral("collateral utxo not visible after creation".into())
            })
    }
}
