//! In-memory indexer for deterministic testing
//!
//! [`MockBlockchain`] serves histories, transactions, headers and merkle proofs from maps
//! that tests fill beforehand, records broadcasts and can push notifications on demand.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::{Transaction, Txid};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{
    Blockchain, BlockchainNotification, GetMerkleResult, HeadersResult,
    NOTIFICATION_CHANNEL_CAPACITY,
};
use crate::data_structures::{ScriptHashHex, TxHistory};
use crate::errors::{WalletError, WalletResult};

/// Simulated failures. Flags stay set until cleared.
#[derive(Debug, Clone, Default)]
pub struct MockFailureModes {
    pub fail_get_history: bool,
    pub fail_transaction_get: bool,
    pub fail_broadcast: bool,
    pub fail_estimate_fee: bool,
    pub fail_headers: bool,
    pub fail_get_merkle: bool,
    /// Returned (once) by the next call of any method.
    pub next_error_message: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    histories: HashMap<ScriptHashHex, TxHistory>,
    transactions: HashMap<Txid, Transaction>,
    headers: Vec<Header>,
    max_headers: u32,
    tip: u32,
    merkle: HashMap<Txid, GetMerkleResult>,
    fee_estimates: HashMap<u32, Option<u64>>,
    relay_fee: u64,
    broadcasts: Vec<Transaction>,
    subscriptions: Vec<ScriptHashHex>,
    transaction_get_calls: HashMap<Txid, usize>,
    transaction_get_delay: Option<Duration>,
    connection_error: Option<String>,
    failure_modes: MockFailureModes,
}

/// Mock [`Blockchain`] implementation.
#[derive(Debug)]
pub struct MockBlockchain {
    state: Mutex<MockState>,
    notifications: broadcast::Sender<BlockchainNotification>,
}

impl Default for MockBlockchain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBlockchain {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MockState {
                max_headers: 2016,
                relay_fee: 1000,
                ..MockState::default()
            }),
            notifications,
        }
    }

    pub fn set_failure_mode(&self, modes: MockFailureModes) {
        self.state.lock().failure_modes = modes;
    }

    fn check_failure(&self, operation: &str) -> WalletResult<()> {
        let mut state = self.state.lock();
        let modes = &mut state.failure_modes;
        if let Some(message) = modes.next_error_message.take() {
            return Err(WalletError::ConnectionError(message));
        }
        let fail = match operation {
            "get_history" => modes.fail_get_history,
            "transaction_get" => modes.fail_transaction_get,
            "broadcast" => modes.fail_broadcast,
            "estimate_fee" => modes.fail_estimate_fee,
            "headers" => modes.fail_headers,
            "get_merkle" => modes.fail_get_merkle,
            _ => false,
        };
        if fail {
            return Err(WalletError::ConnectionError(format!(
                "Mock failure: {operation}"
            )));
        }
        Ok(())
    }

    /// Makes `tx` available to `transaction_get`.
    pub fn add_transaction(&self, tx: Transaction) -> Txid {
        let txid = tx.compute_txid();
        self.state.lock().transactions.insert(txid, tx);
        txid
    }

    pub fn set_history(&self, script_hash: &ScriptHashHex, history: TxHistory) {
        self.state
            .lock()
            .histories
            .insert(script_hash.clone(), history);
    }

    /// Pushes the status of the stored history of `script_hash`.
    pub fn push_script_hash_status(&self, script_hash: &ScriptHashHex) {
        let status = self
            .state
            .lock()
            .histories
            .get(script_hash)
            .map(TxHistory::status)
            .unwrap_or_default();
        let _ = self
            .notifications
            .send(BlockchainNotification::ScriptHashStatus {
                script_hash: script_hash.clone(),
                status,
            });
    }

    /// Replaces the served header chain.
    pub fn set_headers(&self, headers: Vec<Header>) {
        let mut state = self.state.lock();
        state.tip = u32::try_from(headers.len().saturating_sub(1)).unwrap_or(u32::MAX);
        state.headers = headers;
    }

    pub fn set_max_headers(&self, max: u32) {
        self.state.lock().max_headers = max;
    }

    /// Pushes a new tip notification for the current header chain.
    pub fn push_new_header(&self) {
        let height = self.state.lock().tip;
        let _ = self
            .notifications
            .send(BlockchainNotification::NewHeader { height });
    }

    pub fn set_merkle(&self, txid: Txid, result: GetMerkleResult) {
        self.state.lock().merkle.insert(txid, result);
    }

    pub fn set_fee_estimate(&self, blocks: u32, fee_rate_per_kb: Option<u64>) {
        self.state
            .lock()
            .fee_estimates
            .insert(blocks, fee_rate_per_kb);
    }

    pub fn set_relay_fee(&self, fee_rate_per_kb: u64) {
        self.state.lock().relay_fee = fee_rate_per_kb;
    }

    pub fn set_transaction_get_delay(&self, delay: Duration) {
        self.state.lock().transaction_get_delay = Some(delay);
    }

    /// Simulates a connection change.
    pub fn set_connection_error(&self, error: Option<String>) {
        self.state.lock().connection_error = error.clone();
        let _ = self
            .notifications
            .send(BlockchainNotification::ConnectionStatus { error });
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.state.lock().broadcasts.clone()
    }

    pub fn subscriptions(&self) -> Vec<ScriptHashHex> {
        self.state.lock().subscriptions.clone()
    }

    pub fn transaction_get_calls(&self, txid: &Txid) -> usize {
        self.state
            .lock()
            .transaction_get_calls
            .get(txid)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Blockchain for MockBlockchain {
    async fn script_hash_get_history(
        &self,
        script_hash: &ScriptHashHex,
    ) -> WalletResult<TxHistory> {
        self.check_failure("get_history")?;
        Ok(self
            .state
            .lock()
            .histories
            .get(script_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn script_hash_subscribe(&self, script_hash: &ScriptHashHex) -> WalletResult<String> {
        self.check_failure("subscribe")?;
        let mut state = self.state.lock();
        state.subscriptions.push(script_hash.clone());
        Ok(state
            .histories
            .get(script_hash)
            .map(TxHistory::status)
            .unwrap_or_default())
    }

    async fn transaction_get(&self, txid: &Txid) -> WalletResult<Transaction> {
        let delay = {
            let mut state = self.state.lock();
            *state.transaction_get_calls.entry(*txid).or_default() += 1;
            state.transaction_get_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_failure("transaction_get")?;
        self.state
            .lock()
            .transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| WalletError::ResourceNotFound(format!("transaction {txid}")))
    }

    async fn transaction_broadcast(&self, tx: &Transaction) -> WalletResult<()> {
        self.check_failure("broadcast")?;
        self.state.lock().broadcasts.push(tx.clone());
        Ok(())
    }

    async fn relay_fee(&self) -> WalletResult<u64> {
        self.check_failure("relay_fee")?;
        Ok(self.state.lock().relay_fee)
    }

    async fn estimate_fee(&self, blocks: u32) -> WalletResult<Option<u64>> {
        self.check_failure("estimate_fee")?;
        Ok(self
            .state
            .lock()
            .fee_estimates
            .get(&blocks)
            .copied()
            .flatten())
    }

    async fn headers(&self, start_height: u32, count: u32) -> WalletResult<HeadersResult> {
        self.check_failure("headers")?;
        let state = self.state.lock();
        let count = count.min(state.max_headers) as usize;
        let headers = state
            .headers
            .iter()
            .skip(start_height as usize)
            .take(count)
            .copied()
            .collect();
        Ok(HeadersResult {
            headers,
            max: state.max_headers,
        })
    }

    async fn get_merkle(&self, txid: &Txid, _height: u32) -> WalletResult<GetMerkleResult> {
        self.check_failure("get_merkle")?;
        self.state
            .lock()
            .merkle
            .get(txid)
            .cloned()
            .ok_or_else(|| WalletError::ResourceNotFound(format!("merkle proof of {txid}")))
    }

    async fn headers_subscribe(&self) -> WalletResult<u32> {
        self.check_failure("headers_subscribe")?;
        Ok(self.state.lock().tip)
    }

    fn notifications(&self) -> broadcast::Receiver<BlockchainNotification> {
        self.notifications.subscribe()
    }

    fn connection_error(&self) -> Option<String> {
        self.state.lock().connection_error.clone()
    }
}
