//! Oracle record classification and state-machine checks.
//!
//! Each oracle record UTxO carries one policy token whose name identifies
//! the record kind. Transports and aggregation states come in numbered
//! pairs: `RewardTransport3` cooperates with `AggregationState3`, and a
//! pair only ever sits in a legal combination of states, `(Empty, Empty)`
//! between rounds and `(Pending, Published)` after an aggregation.

use tracing::debug;

use feedline_core::{
    AggState, OracleSettings, PolicyId, PosixTime, RewardAccount, TransportState, Utxo,
};

use crate::OracleError;

pub const SETTINGS_TOKEN: &[u8] = b"CoreSettings";
pub const REWARD_ACCOUNT_TOKEN: &[u8] = b"RewardAccount";
pub const TRANSPORT_TOKEN: &[u8] = b"RewardTransport";
pub const AGG_STATE_TOKEN: &[u8] = b"AggregationState";

/// Sequence number embedded in a record token name. A bare prefix counts
/// as sequence zero.
fn token_sequence(name: &[u8], prefix: &[u8]) -> Option<u64> {
    let suffix = name.strip_prefix(prefix)?;
    if suffix.is_empty() {
        return Some(0);
    }
    std::str::from_utf8(suffix).ok()?.parse().ok()
}

/// The sequence of the first token under `policy` whose name starts with
/// `prefix`.
fn utxo_sequence(utxo: &Utxo, policy: &PolicyId, prefix: &[u8]) -> Option<u64> {
    utxo.output
        .value
        .assets
        .iter()
        .find_map(|((asset_policy, name), quantity)| {
            if asset_policy == policy && *quantity > 0 {
                token_sequence(name, prefix)
            } else {
                None
            }
        })
}

fn holds_token(utxo: &Utxo, policy: &PolicyId, name: &[u8]) -> bool {
    utxo.asset(policy, name) > 0
}

/// The settings record and its UTxO.
pub fn settings<'a>(
    utxos: &'a [Utxo],
    policy: &PolicyId,
) -> Result<(&'a OracleSettings, &'a Utxo), OracleError> {
    utxos
        .iter()
        .find(|utxo| holds_token(utxo, policy, SETTINGS_TOKEN))
        .and_then(|utxo| match &utxo.output.datum {
            Some(feedline_core::OracleDatum::Settings(settings)) => Some((settings, utxo)),
            _ => None,
        })
        .ok_or_else(|| OracleError::State("oracle settings record not found".into()))
}

/// The reward-account record and its UTxO.
pub fn reward_account<'a>(
    utxos: &'a [Utxo],
    policy: &PolicyId,
) -> Result<(&'a RewardAccount, &'a Utxo), OracleError> {
    utxos
        .iter()
        .find(|utxo| holds_token(utxo, policy, REWARD_ACCOUNT_TOKEN))
        .and_then(|utxo| match &utxo.output.datum {
            Some(feedline_core::OracleDatum::RewardAccount(account)) => Some((account, utxo)),
            _ => None,
        })
        .ok_or_else(|| OracleError::State("reward account record not found".into()))
}

/// The UTxO carrying the oracle validator as a reference script.
pub fn reference_script_utxo<'a>(utxos: &'a [Utxo]) -> Result<&'a Utxo, OracleError> {
    utxos
        .iter()
        .find(|utxo| utxo.output.script.is_some())
        .ok_or_else(|| OracleError::State("reference script utxo not found".into()))
}

/// Transport records with their datum state, paired with their sequence.
fn transports<'a>(utxos: &'a [Utxo], policy: &PolicyId) -> Vec<(u64, &'a TransportState, &'a Utxo)> {
    utxos
        .iter()
        .filter_map(|utxo| {
            let seq = utxo_sequence(utxo, policy, TRANSPORT_TOKEN)?;
            match &utxo.output.datum {
                Some(feedline_core::OracleDatum::Transport(state)) => Some((seq, state, utxo)),
                _ => None,
            }
        })
        .collect()
}

fn agg_states<'a>(utxos: &'a [Utxo], policy: &PolicyId) -> Vec<(u64, &'a AggState, &'a Utxo)> {
    utxos
        .iter()
        .filter_map(|utxo| {
            // Transport names share no prefix with agg-state names, so a
            // plain prefix match is unambiguous.
            let seq = utxo_sequence(utxo, policy, AGG_STATE_TOKEN)?;
            match &utxo.output.datum {
                Some(feedline_core::OracleDatum::AggState(state)) => Some((seq, state, utxo)),
                _ => None,
            }
        })
        .collect()
}

/// Transports holding a committed aggregation awaiting reward processing.
pub fn pending_transports<'a>(utxos: &'a [Utxo], policy: &PolicyId) -> Vec<&'a Utxo> {
    transports(utxos, policy)
        .into_iter()
        .filter(|(_, state, _)| matches!(state, TransportState::Pending(_)))
        .map(|(_, _, utxo)| utxo)
        .collect()
}

/// Transports ready to receive a new aggregation.
pub fn empty_transports<'a>(utxos: &'a [Utxo], policy: &PolicyId) -> Vec<&'a Utxo> {
    transports(utxos, policy)
        .into_iter()
        .filter(|(_, state, _)| matches!(state, TransportState::Empty))
        .map(|(_, _, utxo)| utxo)
        .collect()
}

/// Whether a transport/agg-state pair sits in a legal combination.
pub fn validate_matching_pair(transport: &TransportState, agg_state: &AggState) -> bool {
    matches!(
        (transport, agg_state),
        (TransportState::Empty, AggState::Empty)
            | (TransportState::Pending(_), AggState::Published { .. })
    )
}

/// Selects one legally paired transport/agg-state couple: an idle
/// `(Empty, Empty)` pair if one exists, otherwise a committed
/// `(Pending, Published)` pair. Sequences must agree.
pub fn find_matching_pair<'a>(
    utxos: &'a [Utxo],
    policy: &PolicyId,
) -> Result<(&'a Utxo, &'a Utxo), OracleError> {
    let transports = transports(utxos, policy);
    let states = agg_states(utxos, policy);

    let mut committed = None;
    for &(seq, transport_state, transport) in &transports {
        for &(state_seq, agg_state, state_utxo) in &states {
            if seq != state_seq || !validate_matching_pair(transport_state, agg_state) {
                continue;
            }
            if matches!(transport_state, TransportState::Empty) {
                debug!(seq, "found idle record pair");
                return Ok((transport, state_utxo));
            }
            if committed.is_none() {
                committed = Some((seq, transport, state_utxo));
            }
        }
    }
    if let Some((seq, transport, state_utxo)) = committed {
        debug!(seq, "found committed record pair");
        return Ok((transport, state_utxo));
    }
    Err(OracleError::State("no legally paired transport/agg-state records".into()))
}

/// Selects the pair an aggregation round can consume: an `Empty` transport
/// together with its agg-state that is either `Empty` or `Published` but
/// expired at `now`.
pub fn find_aggregation_pair<'a>(
    utxos: &'a [Utxo],
    policy: &PolicyId,
    now: PosixTime,
) -> Result<(&'a Utxo, &'a Utxo), OracleError> {
    let transports = transports(utxos, policy);
    let states = agg_states(utxos, policy);

    for &(seq, transport_state, transport) in &transports {
        if !matches!(transport_state, TransportState::Empty) {
            continue;
        }
        for &(state_seq, agg_state, state_utxo) in &states {
            if seq != state_seq {
                continue;
            }
            let reusable = matches!(agg_state, AggState::Empty) || agg_state.is_expired(now);
            if reusable {
                debug!(seq, "found aggregation-ready record pair");
                return Ok((transport, state_utxo));
            }
        }
    }
    Err(OracleError::State("no transport/agg-state pair available for aggregation".into()))
}

/// Whether a pending transport's rewards are due: the committed round must
/// be at least `liveness` milliseconds old at `now`.
pub fn can_process_rewards(utxo: &Utxo, now: PosixTime, liveness: u64) -> bool {
    match &utxo.output.datum {
        Some(feedline_core::OracleDatum::Transport(TransportState::Pending(agg))) => {
            now >= agg.message.timestamp + liveness
        }
        _ => false,
    }
}
