//! Transaction index of an account
//!
//! [`Transactions`] reconciles address histories pushed by the indexer with the transactions
//! database. Raw transactions are downloaded once per hash, however many addresses reference
//! them; callbacks waiting for the same hash are queued behind a single fetch. Confirmed
//! transactions are checked against the header chain with merkle proofs.

pub mod tx_info;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Network, OutPoint, Transaction, TxMerkleNode, Txid};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use tx_info::{AddressAndAmount, Balance, SpendableOutput, TxInfo, TxType, UNKNOWN_ADDRESS};

use crate::blockchain::Blockchain;
use crate::config::DoubleSpendPolicy;
use crate::data_structures::{ScriptHashHex, TxHistory};
use crate::errors::{WalletError, WalletResult};
use crate::events::HeadersEvent;
use crate::headers::Headers;
use crate::storage::{DbTx, TransactionsDb};
use crate::synchronizer::Synchronizer;

type TxCallback = Box<dyn FnOnce(&DbTx<'_>, &Transaction) -> WalletResult<()> + Send>;

/// A callback waiting for a download, with the address whose history asked for it.
struct PendingCallback {
    script_hash: ScriptHashHex,
    callback: TxCallback,
}

struct Inner {
    network: Network,
    db: Arc<TransactionsDb>,
    headers: Headers,
    synchronizer: Arc<Synchronizer>,
    blockchain: Arc<dyn Blockchain>,
    double_spend_policy: DoubleSpendPolicy,
    /// Callbacks waiting for a transaction that is being downloaded.
    requested: Mutex<HashMap<Txid, Vec<PendingCallback>>>,
    closed: AtomicBool,
    headers_listener: Mutex<Option<JoinHandle<()>>>,
}

/// Index of the transactions, inputs and outputs touching an account.
#[derive(Clone)]
pub struct Transactions {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transactions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transactions")
            .field("network", &self.inner.network)
            .field("pending_fetches", &self.inner.requested.lock().len())
            .finish()
    }
}

impl Transactions {
    /// Creates the index and starts verifying transactions whenever the header chain syncs.
    pub fn new(
        network: Network,
        db: Arc<TransactionsDb>,
        headers: Headers,
        synchronizer: Arc<Synchronizer>,
        blockchain: Arc<dyn Blockchain>,
        double_spend_policy: DoubleSpendPolicy,
    ) -> Self {
        let inner = Arc::new(Inner {
            network,
            db,
            headers,
            synchronizer,
            blockchain,
            double_spend_policy,
            requested: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            headers_listener: Mutex::new(None),
        });
        let mut events = inner.headers.subscribe_events();
        let listener = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(HeadersEvent::Synced) => {
                            if let Err(e) = Inner::verify_transactions(&inner) {
                                error!(error = %e, "failed to queue transaction verification");
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "missed header events");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };
        *inner.headers_listener.lock() = Some(listener);
        Self { inner }
    }

    /// Stops processing. Pending download callbacks are discarded.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.requested.lock().clear();
        if let Some(listener) = self.inner.headers_listener.lock().take() {
            listener.abort();
        }
    }

    /// Reconciles the stored history of `script_hash` with `history` and indexes every
    /// transaction in it. All changes are committed at once, or not at all.
    pub fn update_address_history(
        &self,
        script_hash: &ScriptHashHex,
        history: &TxHistory,
    ) -> WalletResult<()> {
        let unique: HashSet<Txid> = history.iter().map(|entry| entry.tx_hash).collect();
        if unique.len() != history.len() {
            return Err(WalletError::invalid_argument(
                "history",
                format!("duplicate tx ids in address history of {script_hash}"),
            ));
        }

        let db_tx = self.inner.db.begin()?;
        let previous = db_tx.address_history(script_hash)?;
        for entry in previous.iter() {
            if unique.contains(&entry.tx_hash) {
                continue;
            }
            // Gone from the history. A download still in flight will find it missing and
            // skip it.
            Inner::remove_tx_for_address(&db_tx, script_hash, &entry.tx_hash)?;
        }
        db_tx.put_address_history(script_hash, history)?;

        for entry in history.iter() {
            let inner = Arc::clone(&self.inner);
            let owner = script_hash.clone();
            let (txid, height) = (entry.tx_hash, entry.height);
            Inner::do_for_transaction(
                &self.inner,
                &db_tx,
                txid,
                script_hash,
                Box::new(move |db_tx: &DbTx<'_>, tx: &Transaction| {
                    inner.process_tx_for_address(db_tx, &owner, txid, tx, height)
                }),
            )?;
        }
        db_tx.commit()
    }

    /// Sum of spendable (available) and unconfirmed foreign (incoming) outputs.
    pub async fn balance(&self) -> WalletResult<Balance> {
        self.inner.synchronizer.wait_synchronized().await;
        let db_tx = self.inner.db.begin_read()?;
        let mut balance = Balance::default();
        for (outpoint, txout) in db_tx.outputs()? {
            if db_tx.input(&outpoint)?.is_some() {
                continue;
            }
            let info = db_tx.tx_info(&outpoint.txid)?;
            let confirmed = info.height > 0;
            let ours = match &info.tx {
                Some(tx) => tx_info::all_inputs_ours(&db_tx, tx)?,
                None => false,
            };
            if confirmed || ours {
                balance.available += txout.value.to_sat();
            } else {
                balance.incoming += txout.value.to_sat();
            }
        }
        Ok(balance)
    }

    /// Unspent outputs that are confirmed or were created by the account itself.
    pub async fn spendable_outputs(&self) -> WalletResult<HashMap<OutPoint, SpendableOutput>> {
        self.inner.synchronizer.wait_synchronized().await;
        let db_tx = self.inner.db.begin_read()?;
        let mut result = HashMap::new();
        for (outpoint, txout) in db_tx.outputs()? {
            if db_tx.input(&outpoint)?.is_some() {
                continue;
            }
            let info = db_tx.tx_info(&outpoint.txid)?;
            let spendable = info.height > 0
                || match &info.tx {
                    Some(tx) => tx_info::all_inputs_ours(&db_tx, tx)?,
                    None => false,
                };
            if spendable {
                result.insert(
                    outpoint,
                    SpendableOutput::new(outpoint, txout, self.inner.network),
                );
            }
        }
        Ok(result)
    }

    /// All indexed transactions, newest confirmed first and unconfirmed last.
    pub async fn transactions(
        &self,
        is_change: &(dyn Fn(&ScriptHashHex) -> bool + Sync),
    ) -> WalletResult<Vec<TxInfo>> {
        self.inner.synchronizer.wait_synchronized().await;
        let tip_height = self.inner.headers.tip_height();
        let db_tx = self.inner.db.begin_read()?;
        let mut result = Vec::new();
        for txid in db_tx.transactions()? {
            let info = db_tx.tx_info(&txid)?;
            let Some(tx) = info.tx.clone() else {
                warn!(txid = %txid, "transaction record without transaction");
                continue;
            };
            let (tx_type, amount, fee, addresses) =
                tx_info::classify(&db_tx, &tx, txid, is_change, self.inner.network)?;
            let vsize = tx.vsize() as u64;
            let num_confirmations = if info.height > 0 && tip_height > 0 {
                (i64::from(tip_height) - i64::from(info.height) + 1).max(0) as u32
            } else {
                0
            };
            result.push(TxInfo {
                txid,
                tx_type,
                amount,
                fee,
                fee_rate_per_kb: fee.filter(|_| vsize > 0).map(|fee| fee * 1000 / vsize),
                size: tx.total_size() as u64,
                vsize,
                weight: tx.weight().to_wu(),
                height: info.height,
                num_confirmations,
                addresses,
                header_timestamp: info.header_timestamp,
                created_timestamp: info.created_timestamp,
                verified: info.is_verified(),
                tx,
            });
        }
        sort_transactions(&mut result);
        Ok(result)
    }

    /// Hashes currently being downloaded.
    pub fn pending_fetches(&self) -> usize {
        self.inner.requested.lock().len()
    }

    /// Queues merkle verification of every unverified confirmed transaction.
    pub fn verify_transactions(&self) -> WalletResult<()> {
        Inner::verify_transactions(&self.inner)
    }
}

/// Confirmed by descending height, then unconfirmed. Ties by creation time (newest first),
/// then txid.
fn sort_transactions(txs: &mut [TxInfo]) {
    txs.sort_by(|a, b| {
        b.is_confirmed()
            .cmp(&a.is_confirmed())
            .then_with(|| b.height.cmp(&a.height))
            .then_with(|| b.created_timestamp.cmp(&a.created_timestamp))
            .then_with(|| a.txid.cmp(&b.txid))
    });
}

impl Inner {
    /// Runs `callback` with the raw transaction, downloading it first if it is not stored.
    /// Must be called with a write snapshot open.
    fn do_for_transaction(
        this: &Arc<Self>,
        db_tx: &DbTx<'_>,
        txid: Txid,
        script_hash: &ScriptHashHex,
        callback: TxCallback,
    ) -> WalletResult<()> {
        if let Some(tx) = db_tx.tx_info(&txid)?.tx {
            return callback(db_tx, &tx);
        }
        {
            let mut requested = this.requested.lock();
            let callbacks = requested.entry(txid).or_default();
            let already_downloading = !callbacks.is_empty();
            callbacks.push(PendingCallback {
                script_hash: script_hash.clone(),
                callback,
            });
            if already_downloading {
                return Ok(());
            }
        }
        let guard = this.synchronizer.inc_request_count();
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let _guard = guard;
            let result = inner.blockchain.transaction_get(&txid).await;
            inner.on_transaction_fetched(txid, result);
        });
        Ok(())
    }

    fn on_transaction_fetched(&self, txid: Txid, result: WalletResult<Transaction>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let tx = match result {
            Ok(tx) if tx.compute_txid() == txid => tx,
            Ok(tx) => {
                error!(txid = %txid, got = %tx.compute_txid(), "indexer returned the wrong transaction");
                self.forget_download(txid);
                return;
            }
            Err(e) => {
                error!(txid = %txid, error = %e, "failed to download transaction");
                self.forget_download(txid);
                return;
            }
        };
        let outcome = (|| -> WalletResult<()> {
            let db_tx = self.db.begin()?;
            let callbacks = self.requested.lock().remove(&txid).unwrap_or_default();
            for pending in callbacks {
                (pending.callback)(&db_tx, &tx)?;
            }
            db_tx.commit()
        })();
        if let Err(e) = outcome {
            error!(txid = %txid, error = %e, "failed to index downloaded transaction");
        }
    }

    /// Drops the callbacks of a failed download and takes `txid` out of the stored history
    /// of every address that waited for it. The stored status then differs from the
    /// indexer's, so the next status push or restart downloads it again.
    fn forget_download(&self, txid: Txid) {
        let callbacks = self.requested.lock().remove(&txid).unwrap_or_default();
        let script_hashes: HashSet<ScriptHashHex> = callbacks
            .into_iter()
            .map(|pending| pending.script_hash)
            .collect();
        let outcome = (|| -> WalletResult<()> {
            let db_tx = self.db.begin()?;
            for script_hash in &script_hashes {
                let history = db_tx.address_history(script_hash)?;
                let remaining = TxHistory::new(
                    history
                        .iter()
                        .filter(|entry| entry.tx_hash != txid)
                        .cloned()
                        .collect(),
                );
                db_tx.put_address_history(script_hash, &remaining)?;
                debug!(txid = %txid, %script_hash, "address history marked for a new sync");
            }
            db_tx.commit()
        })();
        if let Err(e) = outcome {
            error!(txid = %txid, error = %e, "failed to roll back address histories");
        }
    }

    fn tx_in_history(
        db_tx: &DbTx<'_>,
        script_hash: &ScriptHashHex,
        txid: &Txid,
    ) -> WalletResult<bool> {
        Ok(db_tx.address_history(script_hash)?.contains(txid))
    }

    fn header_timestamp(&self, height: i32) -> Option<DateTime<Utc>> {
        if height <= 0 {
            return None;
        }
        match self.headers.header_by_height(height) {
            Ok(Some(header)) => DateTime::from_timestamp(i64::from(header.time), 0),
            Ok(None) => None,
            Err(e) => {
                warn!(height, error = %e, "failed to read header");
                None
            }
        }
    }

    fn process_tx_for_address(
        self: &Arc<Self>,
        db_tx: &DbTx<'_>,
        script_hash: &ScriptHashHex,
        txid: Txid,
        tx: &Transaction,
        height: i32,
    ) -> WalletResult<()> {
        // The history may have changed while the transaction was downloading.
        if !Self::tx_in_history(db_tx, script_hash, &txid)? {
            debug!(txid = %txid, %script_hash, "transaction left the address history");
            return Ok(());
        }

        let previous_height = db_tx.tx_info(&txid)?.height;
        db_tx.put_tx(&txid, tx, height, self.header_timestamp(height))?;
        if previous_height <= 0 && height > 0 {
            debug!(txid = %txid, height, "verifying newly confirmed transaction");
            self.spawn_verification(txid, height);
        }
        db_tx.add_address_to_tx(&txid, script_hash)?;

        // Inputs are indexed whether or not they spend our outputs; the spent output may be
        // indexed later.
        for input in &tx.input {
            let outpoint = input.previous_output;
            match db_tx.input(&outpoint)? {
                Some(other) if other != txid => {
                    warn!(
                        outpoint = %outpoint,
                        first = %other,
                        second = %txid,
                        policy = ?self.double_spend_policy,
                        "double spend detected"
                    );
                    if self.double_spend_policy == DoubleSpendPolicy::LastSeen {
                        db_tx.put_input(&outpoint, &txid)?;
                    }
                }
                _ => db_tx.put_input(&outpoint, &txid)?,
            }
        }
        for (vout, output) in tx.output.iter().enumerate() {
            if &ScriptHashHex::from_script(&output.script_pubkey) == script_hash {
                db_tx.put_output(&OutPoint::new(txid, vout as u32), output)?;
            }
        }
        Ok(())
    }

    fn remove_tx_for_address(
        db_tx: &DbTx<'_>,
        script_hash: &ScriptHashHex,
        txid: &Txid,
    ) -> WalletResult<()> {
        let Some(tx) = db_tx.tx_info(txid)?.tx else {
            debug!(txid = %txid, "transaction not indexed yet");
            return Ok(());
        };
        if !db_tx.remove_address_from_tx(txid, script_hash)? {
            return Ok(());
        }
        debug!(txid = %txid, "removing transaction no address refers to");
        for input in &tx.input {
            db_tx.delete_input(&input.previous_output)?;
        }
        for vout in 0..tx.output.len() {
            db_tx.delete_output(&OutPoint::new(*txid, vout as u32))?;
        }
        db_tx.delete_tx(txid)
    }

    fn verify_transactions(this: &Arc<Self>) -> WalletResult<()> {
        if this.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let pending: Vec<(Txid, i32)> = {
            let db_tx = this.db.begin_read()?;
            let mut pending = Vec::new();
            for txid in db_tx.unverified_transactions()? {
                let height = db_tx.tx_info(&txid)?.height;
                if height > 0 {
                    pending.push((txid, height));
                }
            }
            pending
        };
        for (txid, height) in pending {
            this.spawn_verification(txid, height);
        }
        Ok(())
    }

    fn spawn_verification(self: &Arc<Self>, txid: Txid, height: i32) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.verify_transaction(txid, height).await {
                warn!(txid = %txid, height, error = %e, "transaction verification failed");
            }
        });
    }

    async fn verify_transaction(&self, txid: Txid, height: i32) -> WalletResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(header) = self.headers.verified_header_by_height(height)? else {
            // Retried once the headers are synced.
            debug!(txid = %txid, height, "header not available yet");
            return Ok(());
        };
        let proof = {
            let _request = self.synchronizer.inc_request_count();
            self.blockchain.get_merkle(&txid, height as u32).await?
        };
        let root = merkle_root_from_branch(txid, &proof.merkle, proof.pos);
        if root != header.merkle_root {
            warn!(
                txid = %txid,
                height,
                expected = %header.merkle_root,
                got = %root,
                "merkle root mismatch"
            );
            return Ok(());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let timestamp = DateTime::from_timestamp(i64::from(header.time), 0).ok_or_else(|| {
            WalletError::InternalError(format!("invalid header time {}", header.time))
        })?;
        let db_tx = self.db.begin()?;
        if db_tx.tx_info(&txid)?.tx.is_none() {
            // Removed in the meantime.
            return db_tx.rollback();
        }
        db_tx.mark_tx_verified(&txid, timestamp)?;
        db_tx.commit()?;
        info!(txid = %txid, height, "transaction verified");
        Ok(())
    }
}

/// Folds a merkle branch into the root it commits to. Bit `i` of `pos` tells whether the node
/// at level `i` is a right child.
pub fn merkle_root_from_branch(txid: Txid, branch: &[TxMerkleNode], pos: u32) -> TxMerkleNode {
    let mut current = txid.to_byte_array();
    for (level, sibling) in branch.iter().enumerate() {
        let sibling = sibling.to_byte_array();
        let mut preimage = [0u8; 64];
        if level < 32 && (pos >> level) & 1 == 1 {
            preimage[..32].copy_from_slice(&sibling);
            preimage[32..].copy_from_slice(&current);
        } else {
            preimage[..32].copy_from_slice(&current);
            preimage[32..].copy_from_slice(&sibling);
        }
        current = sha256d::Hash::hash(&preimage).to_byte_array();
    }
    TxMerkleNode::from_byte_array(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(seed: &[u8]) -> Txid {
        Txid::hash(seed)
    }

    fn node_of(left: [u8; 32], right: [u8; 32]) -> [u8; 32] {
        let mut preimage = [0u8; 64];
        preimage[..32].copy_from_slice(&left);
        preimage[32..].copy_from_slice(&right);
        sha256d::Hash::hash(&preimage).to_byte_array()
    }

    #[test]
    fn test_merkle_root_of_four_leaves() {
        let leaves: Vec<Txid> = [b"a", b"b", b"c", b"d"].iter().map(|s| txid(*s)).collect();
        let raw: Vec<[u8; 32]> = leaves.iter().map(|t| t.to_byte_array()).collect();
        let ab = node_of(raw[0], raw[1]);
        let cd = node_of(raw[2], raw[3]);
        let root = TxMerkleNode::from_byte_array(node_of(ab, cd));

        // Leaf "c" sits at position 2: left child at level 0, right child at level 1.
        let branch = vec![
            TxMerkleNode::from_byte_array(raw[3]),
            TxMerkleNode::from_byte_array(ab),
        ];
        assert_eq!(merkle_root_from_branch(leaves[2], &branch, 2), root);
        assert_ne!(merkle_root_from_branch(leaves[2], &branch, 1), root);
    }

    #[test]
    fn test_single_transaction_block_root_is_txid() {
        let id = txid(b"coinbase");
        assert_eq!(
            merkle_root_from_branch(id, &[], 0),
            TxMerkleNode::from_byte_array(id.to_byte_array())
        );
    }
}
