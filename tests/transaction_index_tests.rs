//! Transaction index tests driven by address histories
//!
//! The index is exercised directly, without an account: histories are applied with
//! `update_address_history` and raw transactions come from a MockBlockchain.

use std::io;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use parking_lot::Mutex;
use tempfile::TempDir;

use lightweight_btc_wallet::blockchain::mocks::{MockBlockchain, MockFailureModes};
use lightweight_btc_wallet::config::{CoinParams, DoubleSpendPolicy};
use lightweight_btc_wallet::data_structures::{ScriptHashHex, TxHistory, TxHistoryEntry};
use lightweight_btc_wallet::headers::Headers;
use lightweight_btc_wallet::storage::{HeadersDb, TransactionsDb};
use lightweight_btc_wallet::synchronizer::Synchronizer;
use lightweight_btc_wallet::transactions::{Transactions, TxType};

struct Index {
    _dir: TempDir,
    mock: Arc<MockBlockchain>,
    db: Arc<TransactionsDb>,
    synchronizer: Arc<Synchronizer>,
    transactions: Transactions,
}

fn index(policy: DoubleSpendPolicy) -> Index {
    let dir = TempDir::new().unwrap();
    let mock = Arc::new(MockBlockchain::new());
    let db = Arc::new(TransactionsDb::open_in_memory().unwrap());
    let synchronizer = Synchronizer::detached();
    let headers = Headers::new(
        CoinParams::new(Network::Regtest),
        HeadersDb::open(dir.path().join("headers.bin")).unwrap(),
        mock.clone(),
        synchronizer.clone(),
        10,
        100,
    );
    let transactions = Transactions::new(
        Network::Regtest,
        db.clone(),
        headers,
        synchronizer.clone(),
        mock.clone(),
        policy,
    );
    Index {
        _dir: dir,
        mock,
        db,
        synchronizer,
        transactions,
    }
}

/// A p2wpkh script with a fixed hash.
fn script(seed: u8) -> ScriptBuf {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend([seed; 20]);
    ScriptBuf::from_bytes(bytes)
}

fn tx(inputs: &[OutPoint], outputs: &[(u64, &ScriptBuf)]) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|(value, script)| TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: (*script).clone(),
            })
            .collect(),
    }
}

fn history(entries: &[(Txid, i32)]) -> TxHistory {
    TxHistory::new(
        entries
            .iter()
            .map(|(txid, height)| TxHistoryEntry::new(*txid, *height))
            .collect(),
    )
}

impl Index {
    async fn apply(&self, script: &ScriptBuf, entries: &[(Txid, i32)]) {
        self.transactions
            .update_address_history(&ScriptHashHex::from_script(script), &history(entries))
            .unwrap();
        self.synchronizer.wait_synchronized().await;
    }

    fn spender(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.db.begin_read().unwrap().input(outpoint).unwrap()
    }
}

fn never_change(_: &ScriptHashHex) -> bool {
    false
}

#[tokio::test]
async fn test_unconfirmed_self_spend_stays_spendable() {
    let index = index(DoubleSpendPolicy::LastSeen);
    let (ours_a, ours_b, foreign) = (script(1), script(2), script(9));
    let funding = tx(
        &[OutPoint::new(Txid::hash(b"elsewhere"), 0)],
        &[(100_000, &ours_a)],
    );
    let funding_id = index.mock.add_transaction(funding.clone());
    let self_spend = tx(
        &[OutPoint::new(funding_id, 0)],
        &[(40_000, &ours_b), (59_000, &foreign)],
    );
    let self_spend_id = index.mock.add_transaction(self_spend);

    index.apply(&ours_a, &[(funding_id, 5)]).await;
    index
        .apply(&ours_a, &[(funding_id, 5), (self_spend_id, 0)])
        .await;
    index.apply(&ours_b, &[(self_spend_id, 0)]).await;

    let spendable = index.transactions.spendable_outputs().await.unwrap();
    assert_eq!(spendable.len(), 1);
    assert!(spendable.contains_key(&OutPoint::new(self_spend_id, 0)));
    let balance = index.transactions.balance().await.unwrap();
    assert_eq!(balance.available, 40_000);
    assert_eq!(balance.incoming, 0);

    let txs = index.transactions.transactions(&never_change).await.unwrap();
    assert_eq!(txs.len(), 2);
    // Confirmed before unconfirmed.
    assert_eq!(txs[0].txid, funding_id);
    assert_eq!(txs[1].txid, self_spend_id);
    assert_eq!(txs[1].tx_type, TxType::Send);
    assert_eq!(txs[1].fee, Some(1_000));
    assert_eq!(txs[1].amount, 59_000);
}

#[tokio::test]
async fn test_unconfirmed_foreign_funds_are_incoming() {
    let index = index(DoubleSpendPolicy::LastSeen);
    let ours = script(1);
    let incoming = tx(&[OutPoint::new(Txid::hash(b"someone"), 3)], &[(7_000, &ours)]);
    let txid = index.mock.add_transaction(incoming);
    index.apply(&ours, &[(txid, 0)]).await;

    let balance = index.transactions.balance().await.unwrap();
    assert_eq!(balance.available, 0);
    assert_eq!(balance.incoming, 7_000);
    assert!(index.transactions.spendable_outputs().await.unwrap().is_empty());

    // Confirmation makes it spendable.
    index.apply(&ours, &[(txid, 12)]).await;
    let balance = index.transactions.balance().await.unwrap();
    assert_eq!(balance.available, 7_000);
}

#[tokio::test]
async fn test_same_history_twice_is_idempotent() {
    let index = index(DoubleSpendPolicy::LastSeen);
    let ours = script(1);
    let funding = tx(&[OutPoint::new(Txid::hash(b"x"), 0)], &[(5_000, &ours)]);
    let txid = index.mock.add_transaction(funding);

    index.apply(&ours, &[(txid, 3)]).await;
    let first = index.db.begin_read().unwrap().outputs().unwrap();
    index.apply(&ours, &[(txid, 3)]).await;
    let second = index.db.begin_read().unwrap().outputs().unwrap();
    assert_eq!(first, second);
    assert_eq!(index.mock.transaction_get_calls(&txid), 1);
    assert_eq!(index.db.begin_read().unwrap().transactions().unwrap(), vec![txid]);
}

async fn double_spend(policy: DoubleSpendPolicy) -> (Index, OutPoint, Txid, Txid) {
    let index = index(policy);
    let ours = script(1);
    let funding = tx(&[OutPoint::new(Txid::hash(b"x"), 0)], &[(5_000, &ours)]);
    let funding_id = index.mock.add_transaction(funding);
    let coin = OutPoint::new(funding_id, 0);
    let first = index
        .mock
        .add_transaction(tx(&[coin], &[(4_000, &script(7))]));
    let second = index
        .mock
        .add_transaction(tx(&[coin], &[(4_500, &script(8))]));

    index.apply(&ours, &[(funding_id, 3), (first, 0)]).await;
    assert_eq!(index.spender(&coin), Some(first));
    index
        .apply(&ours, &[(funding_id, 3), (first, 0), (second, 0)])
        .await;
    (index, coin, first, second)
}

/// Collects formatted log lines.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

#[tokio::test]
async fn test_double_spend_warning_names_both_spenders() {
    for policy in [DoubleSpendPolicy::LastSeen, DoubleSpendPolicy::FirstSeen] {
        let logs = LogCapture::default();
        let _guard = logs.install();
        let (_index, coin, first, second) = double_spend(policy).await;

        let line = logs
            .contents()
            .lines()
            .find(|line| line.contains("double spend detected"))
            .map(str::to_string)
            .unwrap_or_else(|| panic!("no double spend warning for {policy:?}"));
        assert!(line.contains("WARN"));
        assert!(line.contains(&coin.to_string()));
        assert!(line.contains(&format!("first={first}")));
        assert!(line.contains(&format!("second={second}")));
    }
}

#[tokio::test]
async fn test_double_spend_last_seen_wins() {
    let (index, coin, _, second) = double_spend(DoubleSpendPolicy::LastSeen).await;
    assert_eq!(index.spender(&coin), Some(second));
}

#[tokio::test]
async fn test_double_spend_first_seen_is_kept() {
    let (index, coin, first, _) = double_spend(DoubleSpendPolicy::FirstSeen).await;
    assert_eq!(index.spender(&coin), Some(first));
}

#[tokio::test]
async fn test_failed_download_is_retried_on_next_history() {
    let index = index(DoubleSpendPolicy::LastSeen);
    let ours = script(1);
    let txid = index
        .mock
        .add_transaction(tx(&[OutPoint::new(Txid::hash(b"x"), 0)], &[(5_000, &ours)]));
    index.mock.set_failure_mode(MockFailureModes {
        fail_transaction_get: true,
        ..MockFailureModes::default()
    });
    index.apply(&ours, &[(txid, 3)]).await;
    assert!(index.db.begin_read().unwrap().transactions().unwrap().is_empty());
    assert_eq!(index.transactions.pending_fetches(), 0);
    // The stored history no longer matches the indexer's, so its status differs too.
    let stored = index
        .db
        .begin_read()
        .unwrap()
        .address_history(&ScriptHashHex::from_script(&ours))
        .unwrap();
    assert!(!stored.contains(&txid));
    assert_ne!(stored.status(), history(&[(txid, 3)]).status());

    index.mock.set_failure_mode(MockFailureModes::default());
    index.apply(&ours, &[(txid, 3)]).await;
    assert_eq!(index.db.begin_read().unwrap().transactions().unwrap(), vec![txid]);
    assert_eq!(index.mock.transaction_get_calls(&txid), 2);
}

#[tokio::test]
async fn test_duplicate_history_entries_are_rejected() {
    let index = index(DoubleSpendPolicy::LastSeen);
    let txid = Txid::hash(b"dup");
    let result = index.transactions.update_address_history(
        &ScriptHashHex::from_script(&script(1)),
        &history(&[(txid, 1), (txid, 2)]),
    );
    assert!(result.is_err());
}
