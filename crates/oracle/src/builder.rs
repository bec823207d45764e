//! The two engine transactions: aggregation and reward processing.
//!
//! An aggregation round spends an `(Empty, reusable)` transport/agg-state
//! pair and recreates it as `(Pending, Published)`, paying the round fee
//! into the transport. Reward processing later spends pending transports
//! together with the reward account, resets the transports to `Empty`, and
//! moves their fees onto the account while crediting the per-node balance
//! list.

use std::collections::BTreeMap;

use ed25519_dalek::SigningKey;
use tracing::{debug, info, warn};

use feedline_chain::{ChainQuery, ScriptTx, SubmitStatus, Tx, TxManager, ValidityWindow};
use feedline_core::{
    Address, AggState, AggregateMessage, Aggregation, AssetName, NodeId, OracleDatum,
    OracleRedeemer, OracleSettings, PolicyId, RewardAccount, TransportState, Utxo, Value,
};

use crate::{consensus, rewards, state, OracleError};

/// Result of building an aggregation transaction. The transaction still
/// needs the node co-signatures before submission.
#[derive(Debug)]
pub struct AggregateRound {
    pub tx: Tx,
    pub oracle_feed: u64,
    pub message: AggregateMessage,
    pub required_signers: Vec<NodeId>,
}

/// Result of building a reward-processing transaction.
#[derive(Debug)]
pub struct RewardsRound {
    pub tx: Tx,
    pub distribution: BTreeMap<NodeId, u64>,
    pub new_balances: Vec<u64>,
    pub processed: usize,
}

pub struct OracleTxBuilder {
    manager: TxManager,
    script_address: Address,
    policy: PolicyId,
    /// Token the round fee is paid in; `None` pays in the base coin.
    fee_token: Option<(PolicyId, AssetName)>,
}

impl OracleTxBuilder {
    pub fn new(
        manager: TxManager,
        script_address: Address,
        policy: PolicyId,
        fee_token: Option<(PolicyId, AssetName)>,
    ) -> Self {
        OracleTxBuilder { manager, script_address, policy, fee_token }
    }

    pub fn manager(&self) -> &TxManager {
        &self.manager
    }

    fn query(&self) -> &ChainQuery {
        self.manager.query()
    }

    async fn script_utxos(&self) -> Result<Vec<Utxo>, OracleError> {
        let utxos = self.query().utxos(&self.script_address).await?;
        if utxos.is_empty() {
            return Err(OracleError::State(format!(
                "no utxos at oracle address {}",
                self.script_address
            )));
        }
        Ok(utxos)
    }

    fn add_fee(&self, value: &mut Value, amount: u64) {
        match &self.fee_token {
            Some((policy, name)) => value.add_asset(*policy, name.clone(), amount),
            None => value.coin += amount,
        }
    }

    fn remove_fee(&self, value: &mut Value, amount: u64) {
        match &self.fee_token {
            Some((policy, name)) => value.sub_asset(policy, name, amount),
            None => value.coin = value.coin.saturating_sub(amount),
        }
    }

    fn validity_window(
        &self,
        settings: &OracleSettings,
        requested: Option<ValidityWindow>,
    ) -> Result<ValidityWindow, OracleError> {
        match requested {
            Some(window) => {
                if window.end - window.start > settings.time_uncertainty {
                    return Err(OracleError::Aggregation(format!(
                        "validity window of {} ms exceeds time uncertainty {} ms",
                        window.end - window.start,
                        settings.time_uncertainty
                    )));
                }
                Ok(window)
            }
            None => Ok(self.manager.calculate_validity_window(settings.time_uncertainty)?),
        }
    }

    /// Builds the aggregation transaction for one round of collected
    /// feeds.
    pub async fn build_aggregate_tx(
        &self,
        feeds: &BTreeMap<NodeId, u64>,
        signing_key: &SigningKey,
        change_address: &Address,
        validity: Option<ValidityWindow>,
    ) -> Result<AggregateRound, OracleError> {
        if feeds.is_empty() {
            return Err(OracleError::Consensus("no node feeds to aggregate".into()));
        }

        let utxos = self.script_utxos().await?;
        let (settings, settings_utxo) = state::settings(&utxos, &self.policy)?;
        if settings.is_paused() {
            return Err(OracleError::State("oracle is paused".into()));
        }

        let mut registered: BTreeMap<NodeId, u64> = BTreeMap::new();
        for (node, feed) in feeds {
            if settings.is_registered(node) {
                registered.insert(*node, *feed);
            } else {
                warn!(node = %hex::encode(node), "dropping feed from unregistered node");
            }
        }
        if (registered.len() as u64) < settings.required_signatures {
            return Err(OracleError::Aggregation(format!(
                "{} registered feeds, {} signatures required",
                registered.len(),
                settings.required_signatures
            )));
        }

        let window = self.validity_window(settings, validity)?;
        let now = window.current_time();

        let (transport_utxo, agg_state_utxo) =
            state::find_aggregation_pair(&utxos, &self.policy, now)?;

        let message = AggregateMessage::from_feeds(&registered, now);
        let sorted = message.feed_values();
        let oracle_feed = consensus::median(&sorted);
        let paid = rewards::min_fee(&settings.fee, message.count);

        let mut transport_output = transport_utxo.output.clone();
        self.add_fee(&mut transport_output.value, paid);
        transport_output.datum = Some(OracleDatum::Transport(TransportState::Pending(
            Aggregation {
                oracle_feed,
                message: message.clone(),
                node_reward_price: settings.fee.node_fee,
                rewards_amount_paid: paid,
            },
        )));

        let mut agg_state_output = agg_state_utxo.output.clone();
        agg_state_output.datum = Some(OracleDatum::AggState(AggState::Published {
            oracle_feed,
            created_at: now,
            expiry: now + settings.aggregation_liveness,
        }));

        let required_signers = message.node_ids();
        let script_ref = state::reference_script_utxo(&utxos)
            .ok()
            .map(|utxo| utxo.reference);

        let params = ScriptTx {
            script_inputs: vec![
                (
                    transport_utxo.clone(),
                    OracleRedeemer::Aggregate(message.clone()),
                    script_ref,
                ),
                (agg_state_utxo.clone(), OracleRedeemer::PublishFeed, script_ref),
            ],
            outputs: vec![transport_output, agg_state_output],
            reference_inputs: vec![settings_utxo.reference],
            mint: Vec::new(),
            required_signers: required_signers.clone(),
            validity: Some(window),
        };
        let tx = self
            .manager
            .build_script_tx(params, change_address, signing_key)
            .await?;

        info!(
            oracle_feed,
            nodes = message.count,
            fee_paid = paid,
            "built aggregation transaction"
        );
        Ok(AggregateRound { tx, oracle_feed, message, required_signers })
    }

    /// Builds the reward-processing transaction over up to
    /// `max_transports` due pending transports.
    pub async fn build_rewards_tx(
        &self,
        signing_key: &SigningKey,
        change_address: &Address,
        max_transports: usize,
    ) -> Result<RewardsRound, OracleError> {
        let utxos = self.script_utxos().await?;
        let (settings, settings_utxo) = state::settings(&utxos, &self.policy)?;
        let (account, account_utxo) = state::reward_account(&utxos, &self.policy)?;

        let window = self.validity_window(settings, None)?;
        let now = window.current_time();

        let due: Vec<&Utxo> = state::pending_transports(&utxos, &self.policy)
            .into_iter()
            .filter(|utxo| state::can_process_rewards(utxo, now, settings.aggregation_liveness))
            .take(max_transports)
            .collect();
        if due.is_empty() {
            return Err(OracleError::State("no pending transports due for rewards".into()));
        }

        let node_order = settings.node_order();
        let mut combined: BTreeMap<NodeId, u64> = BTreeMap::new();
        let mut total_paid = 0u64;
        let mut transport_outputs = Vec::with_capacity(due.len());

        for transport in &due {
            let aggregation = pending_aggregation(transport)?;
            let feeds: BTreeMap<NodeId, u64> =
                aggregation.message.node_feeds.iter().copied().collect();
            let accepted = consensus::consensus_set(
                &feeds,
                settings.iqr_fence_multiplier,
                settings.median_divergence_factor,
            );
            if accepted.is_empty() {
                return Err(OracleError::Consensus(format!(
                    "no feeds within consensus bounds for transport {}",
                    transport.reference
                )));
            }
            debug!(
                transport = %transport.reference,
                accepted = accepted.len(),
                submitted = feeds.len(),
                "consensus over pending transport"
            );
            for (node, amount) in rewards::distribute(&accepted, aggregation.node_reward_price) {
                *combined.entry(node).or_insert(0) += amount;
            }
            total_paid += aggregation.rewards_amount_paid;

            let mut output = transport.output.clone();
            self.remove_fee(&mut output.value, aggregation.rewards_amount_paid);
            output.datum = Some(OracleDatum::Transport(TransportState::Empty));
            transport_outputs.push(output);
        }

        let new_balances = rewards::accumulate(&account.balances, &combined, &node_order);
        debug_assert!(rewards::conserves(&account.balances, &new_balances, &combined));

        let mut account_output = account_utxo.output.clone();
        self.add_fee(&mut account_output.value, total_paid);
        account_output.datum = Some(OracleDatum::RewardAccount(RewardAccount {
            balances: new_balances.clone(),
        }));

        let script_ref = state::reference_script_utxo(&utxos)
            .ok()
            .map(|utxo| utxo.reference);
        let mut script_inputs: Vec<(Utxo, OracleRedeemer, _)> = due
            .iter()
            .map(|utxo| ((*utxo).clone(), OracleRedeemer::ProcessRewards, script_ref))
            .collect();
        script_inputs.push((account_utxo.clone(), OracleRedeemer::ProcessRewards, script_ref));

        let mut outputs = transport_outputs;
        outputs.push(account_output);

        let params = ScriptTx {
            script_inputs,
            outputs,
            reference_inputs: vec![settings_utxo.reference],
            mint: Vec::new(),
            required_signers: Vec::new(),
            validity: Some(window),
        };
        let tx = self
            .manager
            .build_script_tx(params, change_address, signing_key)
            .await?;

        info!(
            processed = due.len(),
            distributed = combined.values().sum::<u64>(),
            total_paid,
            "built reward-processing transaction"
        );
        Ok(RewardsRound {
            tx,
            distribution: combined,
            new_balances,
            processed: due.len(),
        })
    }

    /// Signs with the given keys and submits through the query facade.
    pub async fn sign_and_submit(
        &self,
        tx: Tx,
        keys: &[&SigningKey],
        wait: bool,
    ) -> Result<SubmitStatus, OracleError> {
        Ok(self.manager.sign_and_submit(tx, keys, wait).await?)
    }
}

fn pending_aggregation(utxo: &Utxo) -> Result<&Aggregation, OracleError> {
    match &utxo.output.datum {
        Some(OracleDatum::Transport(TransportState::Pending(aggregation))) => Ok(aggregation),
        _ => Err(OracleError::State(format!(
            "transport {} is not pending",
            utxo.reference
        ))),
    }
}
