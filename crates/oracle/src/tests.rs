//! End-to-end engine tests over a mock ledger backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use feedline_chain::{
    ChainBackend, ChainError, ChainQuery, ChainQueryConfig, NetworkEpoch, NetworkTime,
    SubmitStatus, Tx, TxManager,
};
use feedline_core::{
    Address, AggState, AggregateMessage, Aggregation, FeeSchedule, Node, NodeId, OracleDatum,
    OracleSettings, OutputRef, PolicyId, PosixTime, RewardAccount, Script, ScriptHash, SlotNo,
    TransportState, TxId, TxOut, Utxo, Value,
};

use crate::builder::OracleTxBuilder;
use crate::state;
use crate::OracleError;

const POLICY: PolicyId = [9u8; 32];

fn node(byte: u8) -> NodeId {
    [byte; 32]
}

fn oracle_address() -> Address {
    Address::from("addr_test1_oracle_script")
}

fn change_address() -> Address {
    Address::from("addr_test1_aggregator")
}

fn wall_now() -> PosixTime {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// In-memory ledger that applies submitted transactions to its UTxO set.
struct MockLedger {
    utxos: Mutex<HashMap<Address, Vec<Utxo>>>,
}

impl MockLedger {
    fn new() -> Arc<Self> {
        Arc::new(MockLedger { utxos: Mutex::new(HashMap::new()) })
    }

    fn seed(&self, address: &Address, utxo: Utxo) {
        self.utxos
            .lock()
            .unwrap()
            .entry(address.clone())
            .or_default()
            .push(utxo);
    }
}

/// Local handle so the foreign backend trait can be implemented over the
/// shared ledger.
struct LedgerHandle(Arc<MockLedger>);

#[async_trait]
impl ChainBackend for LedgerHandle {
    async fn utxos_at(&self, address: &Address) -> Result<Vec<Utxo>, ChainError> {
        Ok(self.0.utxos.lock().unwrap().get(address).cloned().unwrap_or_default())
    }

    async fn script(&self, _hash: &ScriptHash) -> Result<Option<Script>, ChainError> {
        Ok(None)
    }

    async fn submit(&self, tx_bytes: &[u8]) -> Result<TxId, ChainError> {
        let tx = Tx::from_bytes(tx_bytes)?;
        let tx_id = tx.id();
        let mut utxos = self.0.utxos.lock().unwrap();
        let spent: Vec<OutputRef> = tx.body.inputs.iter().map(|i| i.source).collect();
        for held in utxos.values_mut() {
            held.retain(|u| !spent.contains(&u.reference));
        }
        for (index, output) in tx.body.outputs.iter().enumerate() {
            utxos.entry(output.address.clone()).or_default().push(Utxo {
                reference: OutputRef { tx_id, index: index as u32 },
                output: output.clone(),
            });
        }
        Ok(tx_id)
    }

    async fn tip_slot(&self) -> Result<SlotNo, ChainError> {
        Ok(0)
    }

    async fn transaction_exists(&self, _id: &TxId) -> Result<bool, ChainError> {
        Ok(true)
    }
}

fn record(token: &[u8], coin: u64, datum: OracleDatum, tx_byte: u8) -> Utxo {
    let mut value = Value::coin(coin);
    value.add_asset(POLICY, token.to_vec(), 1);
    Utxo {
        reference: OutputRef { tx_id: [tx_byte; 32], index: 0 },
        output: TxOut {
            address: oracle_address(),
            value,
            datum: Some(datum),
            script: None,
        },
    }
}

fn plain(coin: u64, tx_byte: u8) -> Utxo {
    Utxo {
        reference: OutputRef { tx_id: [tx_byte; 32], index: 0 },
        output: TxOut::new(change_address(), Value::coin(coin)),
    }
}

fn test_settings() -> OracleSettings {
    OracleSettings {
        nodes: (1..=4)
            .map(|i| Node { feed_key: node(i), payment_key: node(i + 100) })
            .collect(),
        required_signatures: 3,
        fee: FeeSchedule { node_fee: 500, platform_fee: 2_000 },
        aggregation_liveness: 60_000,
        time_uncertainty: 120_000,
        iqr_fence_multiplier: 150,
        median_divergence_factor: 10,
        paused_at: None,
        closed_at: None,
    }
}

fn test_builder(ledger: &Arc<MockLedger>) -> OracleTxBuilder {
    let epoch = NetworkEpoch::new(0, 0, 1_000).unwrap();
    let config = ChainQueryConfig {
        retry_delay: Duration::from_millis(1),
        utxo_refresh_delay: Duration::from_millis(1),
        ..ChainQueryConfig::default()
    };
    let query = Arc::new(ChainQuery::new(
        Box::new(LedgerHandle(ledger.clone())),
        NetworkTime::new(epoch, true),
        config,
    ));
    OracleTxBuilder::new(TxManager::new(query), oracle_address(), POLICY, None)
}

fn seed_change_address(ledger: &Arc<MockLedger>) {
    // A collateral-sized UTxO plus a large fee-paying one.
    ledger.seed(&change_address(), plain(10_500_000, 0xA1));
    ledger.seed(&change_address(), plain(100_000_000, 0xA2));
}

fn seed_idle_oracle(ledger: &Arc<MockLedger>) {
    ledger.seed(
        &oracle_address(),
        record(b"CoreSettings", 2_000_000, OracleDatum::Settings(test_settings()), 1),
    );
    ledger.seed(
        &oracle_address(),
        record(
            b"RewardAccount",
            2_000_000,
            OracleDatum::RewardAccount(RewardAccount { balances: vec![0, 0, 0, 0] }),
            2,
        ),
    );
    ledger.seed(
        &oracle_address(),
        record(b"RewardTransport1", 2_000_000, OracleDatum::Transport(TransportState::Empty), 3),
    );
    ledger.seed(
        &oracle_address(),
        record(b"AggregationState1", 2_000_000, OracleDatum::AggState(AggState::Empty), 4),
    );
}

fn test_feeds() -> BTreeMap<NodeId, u64> {
    let mut feeds = BTreeMap::new();
    feeds.insert(node(1), 100);
    feeds.insert(node(2), 102);
    feeds.insert(node(3), 98);
    feeds.insert(node(4), 200);
    feeds
}

#[tokio::test]
async fn aggregate_round_commits_pending_and_published() {
    let ledger = MockLedger::new();
    seed_idle_oracle(&ledger);
    seed_change_address(&ledger);
    let builder = test_builder(&ledger);
    let key = SigningKey::generate(&mut OsRng);

    let round = builder
        .build_aggregate_tx(&test_feeds(), &key, &change_address(), None)
        .await
        .unwrap();

    assert_eq!(round.oracle_feed, 101);
    assert_eq!(round.message.count, 4);
    // Signers in feed order: 98, 100, 102, 200.
    assert_eq!(round.required_signers, vec![node(3), node(1), node(2), node(4)]);

    let outputs = &round.tx.body.outputs;
    let transport = outputs
        .iter()
        .find_map(|o| match &o.datum {
            Some(OracleDatum::Transport(TransportState::Pending(agg))) => Some((o, agg)),
            _ => None,
        })
        .expect("pending transport output");
    // platform 2000 + 4 * 500 paid into the transport in base coin.
    assert_eq!(transport.1.rewards_amount_paid, 4_000);
    assert_eq!(transport.0.value.coin, 2_004_000);
    assert_eq!(transport.1.node_reward_price, 500);

    let published = outputs
        .iter()
        .find_map(|o| match &o.datum {
            Some(OracleDatum::AggState(state @ AggState::Published { .. })) => Some(state),
            _ => None,
        })
        .expect("published agg-state output");
    match published {
        AggState::Published { oracle_feed, created_at, expiry } => {
            assert_eq!(*oracle_feed, 101);
            assert_eq!(*expiry, created_at + 60_000);
            assert_eq!(*created_at, round.message.timestamp);
        }
        AggState::Empty => unreachable!(),
    }

    // Script spend: collateral attached, settings referenced, window set.
    assert!(round.tx.body.collateral.is_some());
    assert_eq!(round.tx.body.reference_inputs.len(), 1);
    assert!(round.tx.body.validity_end > round.tx.body.validity_start);
}

#[tokio::test]
async fn aggregate_outputs_form_a_legal_pair_on_chain() {
    let ledger = MockLedger::new();
    seed_idle_oracle(&ledger);
    seed_change_address(&ledger);
    let builder = test_builder(&ledger);
    let key = SigningKey::generate(&mut OsRng);

    let round = builder
        .build_aggregate_tx(&test_feeds(), &key, &change_address(), None)
        .await
        .unwrap();
    let status = builder
        .sign_and_submit(round.tx, &[&key], false)
        .await
        .unwrap();
    assert_eq!(status, SubmitStatus::Submitted);

    let utxos = builder.manager().query().utxos(&oracle_address()).await.unwrap();
    let (transport, agg_state) = state::find_matching_pair(&utxos, &POLICY).unwrap();
    match (&transport.output.datum, &agg_state.output.datum) {
        (
            Some(OracleDatum::Transport(TransportState::Pending(_))),
            Some(OracleDatum::AggState(AggState::Published { .. })),
        ) => {}
        other => panic!("unexpected pair states: {other:?}"),
    }
}

#[tokio::test]
async fn aggregate_requires_quorum_of_registered_feeds() {
    let ledger = MockLedger::new();
    seed_idle_oracle(&ledger);
    seed_change_address(&ledger);
    let builder = test_builder(&ledger);
    let key = SigningKey::generate(&mut OsRng);

    // Two registered nodes plus one stranger: below the threshold of 3.
    let mut feeds = BTreeMap::new();
    feeds.insert(node(1), 100);
    feeds.insert(node(2), 101);
    feeds.insert(node(77), 99);
    let err = builder
        .build_aggregate_tx(&feeds, &key, &change_address(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::Aggregation(_)));
}

#[tokio::test]
async fn single_feed_aggregates_unconditionally() {
    let ledger = MockLedger::new();
    seed_idle_oracle(&ledger);
    seed_change_address(&ledger);

    // Loosen the quorum so one node suffices.
    {
        let mut utxos = ledger.utxos.lock().unwrap();
        let records = utxos.get_mut(&oracle_address()).unwrap();
        for utxo in records.iter_mut() {
            if let Some(OracleDatum::Settings(settings)) = &mut utxo.output.datum {
                settings.required_signatures = 1;
            }
        }
    }

    let builder = test_builder(&ledger);
    let key = SigningKey::generate(&mut OsRng);
    let mut feeds = BTreeMap::new();
    feeds.insert(node(1), 424_242);

    let round = builder
        .build_aggregate_tx(&feeds, &key, &change_address(), None)
        .await
        .unwrap();
    assert_eq!(round.oracle_feed, 424_242);
    assert_eq!(round.message.count, 1);
}

fn seed_pending_oracle(ledger: &Arc<MockLedger>, timestamp: PosixTime) {
    let message = AggregateMessage::from_feeds(&test_feeds(), timestamp);
    ledger.seed(
        &oracle_address(),
        record(b"CoreSettings", 2_000_000, OracleDatum::Settings(test_settings()), 1),
    );
    ledger.seed(
        &oracle_address(),
        record(
            b"RewardAccount",
            2_000_000,
            OracleDatum::RewardAccount(RewardAccount { balances: vec![0, 0, 0, 0] }),
            2,
        ),
    );
    ledger.seed(
        &oracle_address(),
        record(
            b"RewardTransport1",
            2_004_000,
            OracleDatum::Transport(TransportState::Pending(Aggregation {
                oracle_feed: 101,
                message,
                node_reward_price: 500,
                rewards_amount_paid: 4_000,
            })),
            3,
        ),
    );
    ledger.seed(
        &oracle_address(),
        record(
            b"AggregationState1",
            2_000_000,
            OracleDatum::AggState(AggState::Published {
                oracle_feed: 101,
                created_at: timestamp,
                expiry: timestamp + 60_000,
            }),
            4,
        ),
    );
}

#[tokio::test]
async fn rewards_round_pays_consensus_nodes_and_resets_transport() {
    let ledger = MockLedger::new();
    // Committed two minutes ago, well past the 60 s liveness.
    seed_pending_oracle(&ledger, wall_now() - 120_000);
    seed_change_address(&ledger);
    let builder = test_builder(&ledger);
    let key = SigningKey::generate(&mut OsRng);

    let round = builder
        .build_rewards_tx(&key, &change_address(), 8)
        .await
        .unwrap();

    assert_eq!(round.processed, 1);
    // The 200 outlier is fenced out; three nodes earn the flat fee.
    assert_eq!(round.distribution.len(), 3);
    assert!(!round.distribution.contains_key(&node(4)));
    assert_eq!(round.new_balances, vec![500, 500, 500, 0]);

    let account = round
        .tx
        .body
        .outputs
        .iter()
        .find_map(|o| match &o.datum {
            Some(OracleDatum::RewardAccount(account)) => Some((o, account)),
            _ => None,
        })
        .expect("reward account output");
    // The whole round fee moves onto the account value, including the
    // platform share and the rejected node's fee.
    assert_eq!(account.0.value.coin, 2_004_000);
    assert_eq!(account.1.balances.iter().sum::<u64>(), 1_500);

    let transport = round
        .tx
        .body
        .outputs
        .iter()
        .find(|o| matches!(&o.datum, Some(OracleDatum::Transport(TransportState::Empty))))
        .expect("reset transport output");
    assert_eq!(transport.value.coin, 2_000_000);
}

#[tokio::test]
async fn rewards_round_applies_and_cannot_repeat() {
    let ledger = MockLedger::new();
    seed_pending_oracle(&ledger, wall_now() - 120_000);
    seed_change_address(&ledger);
    let builder = test_builder(&ledger);
    let key = SigningKey::generate(&mut OsRng);

    let round = builder
        .build_rewards_tx(&key, &change_address(), 8)
        .await
        .unwrap();
    builder.sign_and_submit(round.tx, &[&key], true).await.unwrap();

    let utxos = builder.manager().query().utxos(&oracle_address()).await.unwrap();
    let (account, _) = state::reward_account(&utxos, &POLICY).unwrap();
    assert_eq!(account.balances, vec![500, 500, 500, 0]);
    assert!(state::pending_transports(&utxos, &POLICY).is_empty());

    // Nothing pending: a second pass refuses to build.
    let err = builder
        .build_rewards_tx(&key, &change_address(), 8)
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::State(_)));
}

#[tokio::test]
async fn rewards_not_due_before_liveness() {
    let ledger = MockLedger::new();
    // Committed just now; liveness has not elapsed even at the window
    // midpoint.
    seed_pending_oracle(&ledger, wall_now() + 60_000);
    seed_change_address(&ledger);
    let builder = test_builder(&ledger);
    let key = SigningKey::generate(&mut OsRng);

    let err = builder
        .build_rewards_tx(&key, &change_address(), 8)
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::State(_)));
}

#[tokio::test]
async fn rewards_refused_when_no_feed_survives_filtering() {
    let ledger = MockLedger::new();
    // Two feeds so far apart that the divergence band around their median
    // accepts neither. Nobody may earn, and nothing may be reset.
    let timestamp = wall_now() - 120_000;
    let mut feeds = BTreeMap::new();
    feeds.insert(node(1), 0);
    feeds.insert(node(2), 1_000);
    let message = AggregateMessage::from_feeds(&feeds, timestamp);
    ledger.seed(
        &oracle_address(),
        record(b"CoreSettings", 2_000_000, OracleDatum::Settings(test_settings()), 1),
    );
    ledger.seed(
        &oracle_address(),
        record(
            b"RewardAccount",
            2_000_000,
            OracleDatum::RewardAccount(RewardAccount { balances: vec![0, 0, 0, 0] }),
            2,
        ),
    );
    ledger.seed(
        &oracle_address(),
        record(
            b"RewardTransport1",
            2_003_000,
            OracleDatum::Transport(TransportState::Pending(Aggregation {
                oracle_feed: 500,
                message,
                node_reward_price: 500,
                rewards_amount_paid: 3_000,
            })),
            3,
        ),
    );
    seed_change_address(&ledger);
    let builder = test_builder(&ledger);
    let key = SigningKey::generate(&mut OsRng);

    let err = builder
        .build_rewards_tx(&key, &change_address(), 8)
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::Consensus(_)));
}

#[tokio::test]
async fn paused_oracle_refuses_aggregation() {
    let ledger = MockLedger::new();
    let mut settings = test_settings();
    settings.paused_at = Some(1);
    ledger.seed(
        &oracle_address(),
        record(b"CoreSettings", 2_000_000, OracleDatum::Settings(settings), 1),
    );
    seed_change_address(&ledger);
    let builder = test_builder(&ledger);
    let key = SigningKey::generate(&mut OsRng);

    let err = builder
        .build_aggregate_tx(&test_feeds(), &key, &change_address(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::State(_)));
}
