//! Account controller
//!
//! An [`Account`] ties the components together for one xpub: it opens the transactions
//! database and the header chain, subscribes every address of its receive and change chains at
//! the indexer, keeps fee estimates current and answers balance, history and send requests.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lightweight_btc_wallet::account::Account;
//! use lightweight_btc_wallet::blockchain::mocks::MockBlockchain;
//! use lightweight_btc_wallet::config::{AccountConfig, CoinParams, SigningConfiguration};
//! use lightweight_btc_wallet::keystore::mocks::MockKeystore;
//!
//! # async fn example(signing: SigningConfiguration) -> lightweight_btc_wallet::WalletResult<()> {
//! let account = Account::new(
//!     AccountConfig::new("tbtc-0", "/tmp/wallet"),
//!     CoinParams::new(bitcoin::Network::Testnet),
//!     signing,
//!     Arc::new(MockBlockchain::new()),
//!     Arc::new(MockKeystore::new()),
//! )?;
//! account.initialize().await?;
//! println!("{:?}", account.balance().await?);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, OutPoint, ScriptBuf, Txid};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::addresses::{AccountAddress, AddressChain};
use crate::blockchain::{Blockchain, BlockchainNotification};
use crate::config::{AccountConfig, CoinParams, SigningConfiguration};
use crate::data_structures::{FeeTarget, FeeTargetCode, FeeTargets, ScriptHashHex, ScriptType};
use crate::errors::{TxValidationError, WalletError, WalletResult};
use crate::events::{AccountEvent, EventEmitter, HeadersEvent};
use crate::headers::{self, Headers};
use crate::keystore::{Keystore, ProposedTransaction};
use crate::maketx::{self, TxProposal, Utxo};
use crate::storage::{headers_db, transactions_db, GapLimits, TransactionsDb};
use crate::synchronizer::Synchronizer;
use crate::transactions::{Balance, SpendableOutput, Transactions, TxInfo};

/// Overall state of an account as shown to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountStatus {
    /// Initialized and caught up with the indexer.
    Synced,
    /// Initialized, the first sync is still running.
    NotSynced,
    /// The indexer connection is down.
    Offline,
    /// Not initialized, or closed.
    Disabled,
}

/// What to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAmount {
    Amount(u64),
    /// Every spendable coin, minus the fee.
    All,
}

/// Parameters of a transaction to propose or send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub recipient_address: String,
    pub amount: SendAmount,
    pub fee_target: FeeTargetCode,
    /// Fee rate in satoshis per 1000 vbytes, required with [`FeeTargetCode::Custom`].
    pub custom_fee_per_kb: Option<u64>,
    /// Coin control: restricts the coins to spend. Empty means all spendable coins.
    pub selected_utxos: HashSet<OutPoint>,
}

impl SendRequest {
    pub fn new(
        recipient_address: impl Into<String>,
        amount: SendAmount,
        fee_target: FeeTargetCode,
    ) -> Self {
        Self {
            recipient_address: recipient_address.into(),
            amount,
            fee_target,
            custom_fee_per_kb: None,
            selected_utxos: HashSet::new(),
        }
    }

    pub fn with_custom_fee(mut self, fee_per_kb: u64) -> Self {
        self.fee_target = FeeTargetCode::Custom;
        self.custom_fee_per_kb = Some(fee_per_kb);
        self
    }

    pub fn with_selected_utxos(mut self, outpoints: impl IntoIterator<Item = OutPoint>) -> Self {
        self.selected_utxos = outpoints.into_iter().collect();
        self
    }
}

/// Components that exist once the account is initialized.
struct Components {
    db: Arc<TransactionsDb>,
    headers: Headers,
    transactions: Transactions,
}

/// Guarded by the account lock.
struct AccountState {
    receive: AddressChain,
    change: AddressChain,
    fee_targets: FeeTargets,
}

impl AccountState {
    fn chain_mut(&mut self, change: bool) -> &mut AddressChain {
        if change {
            &mut self.change
        } else {
            &mut self.receive
        }
    }

    fn lookup(&self, script_hash: &ScriptHashHex) -> Option<&AccountAddress> {
        self.receive
            .lookup_by_script_hash(script_hash)
            .or_else(|| self.change.lookup_by_script_hash(script_hash))
    }

    fn set_history_status(&mut self, script_hash: &ScriptHashHex, status: String) -> bool {
        if self.receive.lookup_by_script_hash(script_hash).is_some() {
            self.receive.set_history_status(script_hash, status)
        } else {
            self.change.set_history_status(script_hash, status)
        }
    }
}

struct Inner {
    config: AccountConfig,
    coin: CoinParams,
    signing: SigningConfiguration,
    blockchain: Arc<dyn Blockchain>,
    keystore: Arc<dyn Keystore>,
    events: EventEmitter<AccountEvent>,
    synchronizer: Arc<Synchronizer>,
    state: RwLock<AccountState>,
    components: OnceLock<Components>,
    initial_sync_done: AtomicBool,
    offline: Mutex<Option<String>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A single-signature Bitcoin account. Cheap to clone.
#[derive(Clone)]
pub struct Account {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("code", &self.inner.config.code)
            .field("script_type", &self.inner.signing.script_type)
            .field("status", &self.status())
            .finish()
    }
}

fn address_chains(
    coin: &CoinParams,
    signing: &SigningConfiguration,
    limits: GapLimits,
) -> (AddressChain, AddressChain) {
    let chain = |gap_limit, change| {
        AddressChain::new(
            signing.xpub,
            signing.keypath.clone(),
            signing.script_type,
            coin.network,
            gap_limit,
            change,
        )
    };
    (chain(limits.receive, false), chain(limits.change, true))
}

impl Account {
    pub fn new(
        config: AccountConfig,
        coin: CoinParams,
        signing: SigningConfiguration,
        blockchain: Arc<dyn Blockchain>,
        keystore: Arc<dyn Keystore>,
    ) -> WalletResult<Self> {
        config.validate()?;
        let (receive, change) = {
            let (receive, change) = config.gap_limits(signing.script_type);
            address_chains(&coin, &signing, GapLimits { receive, change })
        };
        let fee_targets = FeeTargets::new(&config.fee_targets);
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_started = weak.clone();
            let on_done = weak.clone();
            let synchronizer = Synchronizer::new(
                move || {
                    if let Some(inner) = on_started.upgrade() {
                        inner.events.emit(AccountEvent::SyncStarted);
                    }
                },
                move || {
                    if let Some(inner) = on_done.upgrade() {
                        inner.on_sync_done();
                    }
                },
            );
            Inner {
                config,
                coin,
                signing,
                blockchain,
                keystore,
                events: EventEmitter::new(),
                synchronizer,
                state: RwLock::new(AccountState {
                    receive,
                    change,
                    fee_targets,
                }),
                components: OnceLock::new(),
                initial_sync_done: AtomicBool::new(false),
                offline: Mutex::new(None),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }
        });
        Ok(Self { inner })
    }

    pub fn code(&self) -> &str {
        &self.inner.config.code
    }

    pub fn signing_configuration(&self) -> &SigningConfiguration {
        &self.inner.signing
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AccountEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventEmitter<AccountEvent> {
        &self.inner.events
    }

    /// Opens the stores, starts the header chain and subscribes all addresses. Returns once
    /// every address has been subscribed; histories keep syncing in the background. Calling it
    /// again has no effect.
    pub async fn initialize(&self) -> WalletResult<()> {
        let inner = &self.inner;
        if inner.components.get().is_some() {
            debug!(code = %inner.config.code, "account already initialized");
            return Ok(());
        }
        // Held until all addresses are subscribed, so the first sync epoch covers them.
        let init_guard = inner.synchronizer.inc_request_count();

        let db_path = inner.config.db_path(&inner.signing);
        debug!(path = %db_path.display(), "opening transactions database");
        let db = Arc::new(transactions_db::open_or_quarantine(&db_path)?);
        let limits = inner.sync_gap_limits(&db)?;
        {
            let (receive, change) = address_chains(&inner.coin, &inner.signing, limits);
            let mut state = inner.state.write();
            state.receive = receive;
            state.change = change;
        }

        let headers_db = headers_db::open_or_quarantine(&inner.config.headers_path(&inner.coin))?;
        let headers = Headers::new(
            inner.coin.clone(),
            headers_db,
            Arc::clone(&inner.blockchain),
            Arc::clone(&inner.synchronizer),
            inner.config.headers_per_batch,
            inner.config.reorg_limit,
        );
        let transactions = Transactions::new(
            inner.coin.network,
            Arc::clone(&db),
            headers.clone(),
            Arc::clone(&inner.synchronizer),
            Arc::clone(&inner.blockchain),
            inner.config.double_spend_policy,
        );
        if inner
            .components
            .set(Components {
                db,
                headers: headers.clone(),
                transactions,
            })
            .is_err()
        {
            debug!("account initialized concurrently");
            return Ok(());
        }

        *inner.offline.lock() = inner.blockchain.connection_error();
        inner.events.emit(AccountEvent::StatusChanged);

        let headers_listener = tokio::spawn(Inner::forward_headers_events(
            Arc::clone(inner),
            headers.subscribe_events(),
        ));
        let notifications = tokio::spawn(Inner::notification_loop(
            Arc::clone(inner),
            inner.blockchain.notifications(),
        ));
        inner.tasks.lock().extend([headers_listener, notifications]);

        headers.initialize();
        inner.ensure_addresses().await?;
        inner.spawn_fee_targets_update();
        drop(init_guard);
        info!(
            code = %inner.config.code,
            script_type = %inner.signing.script_type,
            "account initialized"
        );
        Ok(())
    }

    pub fn status(&self) -> AccountStatus {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) || inner.components.get().is_none() {
            AccountStatus::Disabled
        } else if inner.offline.lock().is_some() {
            AccountStatus::Offline
        } else if inner.initial_sync_done.load(Ordering::SeqCst) {
            AccountStatus::Synced
        } else {
            AccountStatus::NotSynced
        }
    }

    /// Whether all addresses have been synced at least once since the last (re)connect.
    pub fn initial_sync_done(&self) -> bool {
        self.inner.initial_sync_done.load(Ordering::SeqCst)
    }

    /// The connection error, if the indexer is unreachable.
    pub fn offline(&self) -> Option<String> {
        self.inner.offline.lock().clone()
    }

    /// Resolves once no indexer request is outstanding.
    pub async fn wait_synchronized(&self) {
        self.inner.synchronizer.wait_synchronized().await;
    }

    /// Available fee targets, cheapest first, and the one to preselect.
    pub fn fee_targets(&self) -> (Vec<FeeTarget>, FeeTargetCode) {
        self.inner.state.read().fee_targets.available()
    }

    /// Refreshes all fee estimates. Runs on every new block.
    pub async fn update_fee_targets(&self) {
        self.inner.update_fee_targets().await;
    }

    pub async fn balance(&self) -> WalletResult<Balance> {
        self.inner.components()?.transactions.balance().await
    }

    /// Transactions of the account, newest confirmed first, unconfirmed last.
    pub async fn transactions(&self) -> WalletResult<Vec<TxInfo>> {
        let components = self.inner.components()?;
        self.inner.synchronizer.wait_synchronized().await;
        let change: HashSet<ScriptHashHex> = self
            .inner
            .state
            .read()
            .change
            .addresses()
            .iter()
            .map(|address| address.script_hash().clone())
            .collect();
        components
            .transactions
            .transactions(&|script_hash: &ScriptHashHex| change.contains(script_hash))
            .await
    }

    /// Spendable coins, largest first.
    pub async fn spendable_outputs(&self) -> WalletResult<Vec<SpendableOutput>> {
        let mut outputs: Vec<SpendableOutput> = self
            .inner
            .components()?
            .transactions
            .spendable_outputs()
            .await?
            .into_values()
            .collect();
        outputs.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then_with(|| b.script_hash.cmp(&a.script_hash))
        });
        Ok(outputs)
    }

    /// Unused receive addresses, at most as many as the configured receive gap limit even if
    /// the account scans further.
    pub async fn get_unused_receive_addresses(&self) -> WalletResult<Vec<AccountAddress>> {
        self.inner.synchronizer.wait_synchronized().await;
        let state = self.inner.state.read();
        let unused = state.receive.get_unused()?;
        let limit = usize::from(self.inner.config.gap_limit).min(unused.len());
        Ok(unused[..limit].to_vec())
    }

    /// Shows a receive address on the keystore. Returns false if the keystore has no way to
    /// display it.
    pub async fn verify_address(&self, script_hash: &ScriptHashHex) -> WalletResult<bool> {
        self.inner.synchronizer.wait_synchronized().await;
        let address = self
            .inner
            .state
            .read()
            .receive
            .lookup_by_script_hash(script_hash)
            .cloned()
            .ok_or_else(|| {
                WalletError::invalid_argument("script_hash", format!("unknown address {script_hash}"))
            })?;
        if !self.inner.keystore.can_verify_address() {
            return Ok(false);
        }
        self.inner.keystore.verify_address(&address).await?;
        Ok(true)
    }

    pub fn headers_status(&self) -> WalletResult<headers::Status> {
        self.inner.components()?.headers.status()
    }

    /// Builds an unsigned transaction for `request` and validates it. Nothing is signed or
    /// broadcast.
    pub async fn tx_proposal(&self, request: &SendRequest) -> WalletResult<TxProposal> {
        debug!(fee_target = %request.fee_target, "proposing transaction");
        let proposal = self.inner.new_tx(request).await?;
        debug!(fee = proposal.fee, amount = proposal.amount, "proposal ready");
        Ok(proposal)
    }

    /// Builds, signs and broadcasts a transaction. Returns its id.
    pub async fn send_tx(&self, request: &SendRequest) -> WalletResult<Txid> {
        info!("sending transaction");
        let inner = &self.inner;
        let proposal = inner.new_tx(request).await?;
        let db = Arc::clone(&inner.components()?.db);
        let proposed = ProposedTransaction::new(proposal, inner.signing.root_fingerprint, |txid| {
            Ok(db.begin_read()?.tx_info(txid)?.tx)
        })?;
        let signatures = inner.keystore.sign_transaction(&proposed).await?;
        let tx = proposed.finalize(&signatures)?;
        let txid = tx.compute_txid();
        {
            let _guard = inner.synchronizer.inc_request_count();
            inner.blockchain.transaction_broadcast(&tx).await?;
        }
        info!(txid = %txid, "signed transaction broadcast");
        Ok(txid)
    }

    /// Stops all background work. Pending downloads are discarded.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(components) = inner.components.get() {
            components.transactions.close();
            components.headers.close().await;
        }
        inner.initial_sync_done.store(false, Ordering::SeqCst);
        inner.events.emit(AccountEvent::StatusChanged);
        info!(code = %inner.config.code, "account closed");
    }
}

impl Inner {
    fn components(&self) -> WalletResult<&Components> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WalletError::NotAvailable("account closed".to_string()));
        }
        self.components
            .get()
            .ok_or_else(|| WalletError::NotAvailable("account not initialized".to_string()))
    }

    fn on_sync_done(&self) {
        self.events.emit(AccountEvent::SyncDone);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !self.initial_sync_done.swap(true, Ordering::SeqCst) {
            info!(code = %self.config.code, "initial sync done");
            self.events.emit(AccountEvent::StatusChanged);
        }
    }

    /// Uses the larger of the configured and the persisted limits and persists the result.
    fn sync_gap_limits(&self, db: &TransactionsDb) -> WalletResult<GapLimits> {
        let (receive, change) = self.config.gap_limits(self.signing.script_type);
        let db_tx = db.begin()?;
        let stored = db_tx.gap_limits()?;
        let limits = GapLimits {
            receive: receive.max(stored.receive),
            change: change.max(stored.change),
        };
        if limits != stored {
            db_tx.put_gap_limits(limits)?;
            db_tx.commit()?;
        } else {
            db_tx.rollback()?;
        }
        if self.signing.script_type == ScriptType::P2pkh {
            debug!(
                receive = limits.receive,
                change = limits.change,
                "legacy account scans with increased gap limits"
            );
        }
        Ok(limits)
    }

    async fn forward_headers_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<HeadersEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(HeadersEvent::Synced) => self.events.emit(AccountEvent::HeadersSynced),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "missed header events"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn notification_loop(
        self: Arc<Self>,
        mut notifications: broadcast::Receiver<BlockchainNotification>,
    ) {
        loop {
            let notification = match notifications.recv().await {
                Ok(notification) => notification,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed indexer notifications, resubscribing");
                    self.spawn_resubscribe();
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            match notification {
                BlockchainNotification::ScriptHashStatus {
                    script_hash,
                    status,
                } => self.on_address_status(script_hash, status),
                BlockchainNotification::NewHeader { height } => {
                    debug!(height, "new block, refreshing fee estimates");
                    self.spawn_fee_targets_update();
                }
                BlockchainNotification::ConnectionStatus { error } => {
                    self.on_connection_status(error)
                }
            }
        }
    }

    fn on_connection_status(self: &Arc<Self>, error: Option<String>) {
        let reconnected = {
            let mut offline = self.offline.lock();
            let reconnected = offline.is_some() && error.is_none();
            if reconnected {
                // A new backend has to be synced from scratch.
                self.initial_sync_done.store(false, Ordering::SeqCst);
            }
            *offline = error.clone();
            reconnected
        };
        match &error {
            Some(message) => warn!(error = %message, "connection to the indexer lost"),
            None => debug!("connection to the indexer established"),
        }
        if reconnected {
            self.spawn_resubscribe();
        }
        self.events
            .emit(AccountEvent::ConnectionStatusChanged { error });
        self.events.emit(AccountEvent::StatusChanged);
    }

    /// Handles a (possibly) new status of an address: downloads its history if the status
    /// differs from the one we know.
    fn on_address_status(self: &Arc<Self>, script_hash: ScriptHashHex, status: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let state = self.state.read();
            match state.lookup(&script_hash) {
                Some(address) if address.history_status == status => {
                    // A failed download takes its tx out of the stored history.
                    match self.stored_status(&script_hash) {
                        Ok(stored) if stored == status => return,
                        Ok(_) => debug!(script_hash = %script_hash, "stored history is incomplete"),
                        Err(e) => warn!(script_hash = %script_hash, error = %e, "failed to read stored history"),
                    }
                }
                Some(_) => {}
                None => {
                    debug!(script_hash = %script_hash, "status of an unknown address");
                    return;
                }
            }
        }
        debug!(script_hash = %script_hash, "address status changed, fetching history");
        let guard = self.synchronizer.inc_request_count();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.sync_address_history(&script_hash, &status).await {
                error!(script_hash = %script_hash, error = %e, "failed to sync address history");
            }
            drop(guard);
        });
    }

    fn stored_status(&self, script_hash: &ScriptHashHex) -> WalletResult<String> {
        let components = self.components()?;
        Ok(components.db.begin_read()?.address_history(script_hash)?.status())
    }

    async fn sync_address_history(
        self: &Arc<Self>,
        script_hash: &ScriptHashHex,
        status: &str,
    ) -> WalletResult<()> {
        let history = self.blockchain.script_hash_get_history(script_hash).await?;
        let components = self.components()?;
        {
            let mut state = self.state.write();
            let new_status = history.status();
            if new_status != status {
                warn!(script_hash = %script_hash, "indexer status does not match the fetched history");
            }
            components
                .transactions
                .update_address_history(script_hash, &history)?;
            state.set_history_status(script_hash, new_status);
        }
        self.ensure_addresses().await
    }

    /// Extends both chains until each has a full tail of unused addresses and subscribes the new
    /// addresses.
    async fn ensure_addresses(self: &Arc<Self>) -> WalletResult<()> {
        let _guard = self.synchronizer.inc_request_count();
        let components = self.components()?;
        for change in [false, true] {
            loop {
                let added = {
                    let mut state = self.state.write();
                    let chain = state.chain_mut(change);
                    let added = chain.ensure_addresses()?;
                    let db_tx = components.db.begin_read()?;
                    let mut subscribe = Vec::with_capacity(added.len());
                    for address in added {
                        let stored = db_tx.address_history(address.script_hash())?.status();
                        chain.set_history_status(address.script_hash(), stored);
                        subscribe.push(address.script_hash().clone());
                    }
                    subscribe
                };
                if added.is_empty() {
                    break;
                }
                for script_hash in added {
                    self.subscribe_address(&script_hash).await;
                }
            }
        }
        Ok(())
    }

    async fn subscribe_address(self: &Arc<Self>, script_hash: &ScriptHashHex) {
        let _guard = self.synchronizer.inc_request_count();
        match self.blockchain.script_hash_subscribe(script_hash).await {
            Ok(status) => self.on_address_status(script_hash.clone(), status),
            Err(e) => warn!(script_hash = %script_hash, error = %e, "failed to subscribe address"),
        }
    }

    fn spawn_resubscribe(self: &Arc<Self>) {
        let guard = self.synchronizer.inc_request_count();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let script_hashes: Vec<ScriptHashHex> = {
                let state = inner.state.read();
                state
                    .receive
                    .addresses()
                    .iter()
                    .chain(state.change.addresses())
                    .map(|address| address.script_hash().clone())
                    .collect()
            };
            for script_hash in &script_hashes {
                inner.subscribe_address(script_hash).await;
            }
            drop(guard);
        });
    }

    fn spawn_fee_targets_update(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.update_fee_targets().await });
    }

    async fn update_fee_targets(&self) {
        let targets: Vec<(FeeTargetCode, u32)> = self
            .state
            .read()
            .fee_targets
            .all()
            .iter()
            .map(|target| (target.code, target.blocks))
            .collect();
        let mut changed = false;
        for (code, blocks) in targets {
            let estimate = {
                let _guard = self.synchronizer.inc_request_count();
                self.blockchain.estimate_fee(blocks).await
            };
            let rate = match estimate {
                Ok(Some(rate)) => rate,
                Ok(None) => {
                    warn!(blocks, "fee could not be estimated, using the relay fee");
                    let _guard = self.synchronizer.inc_request_count();
                    match self.blockchain.relay_fee().await {
                        Ok(rate) => rate,
                        Err(e) => {
                            warn!(blocks, error = %e, "relay fee not available");
                            continue;
                        }
                    }
                }
                Err(e) => {
                    warn!(blocks, error = %e, "fee estimate failed");
                    continue;
                }
            };
            debug!(blocks, fee_rate_per_kb = rate, "fee estimate");
            changed |= self.state.write().fee_targets.set_rate(code, Some(rate));
        }
        if changed {
            self.events.emit(AccountEvent::FeeTargetsChanged);
        }
    }

    async fn fee_rate(&self, request: &SendRequest) -> WalletResult<u64> {
        if request.fee_target == FeeTargetCode::Custom {
            let rate = request
                .custom_fee_per_kb
                .ok_or(TxValidationError::FeesNotAvailable)?;
            let relay_fee = {
                let _guard = self.synchronizer.inc_request_count();
                self.blockchain.relay_fee().await?
            };
            if rate < relay_fee {
                return Err(TxValidationError::FeeTooLow.into());
            }
            return Ok(rate);
        }
        self.state
            .read()
            .fee_targets
            .get(request.fee_target)
            .and_then(|target| target.fee_rate_per_kb)
            .ok_or_else(|| TxValidationError::FeesNotAvailable.into())
    }

    fn recipient_script(&self, recipient_address: &str) -> WalletResult<ScriptBuf> {
        let address = recipient_address
            .trim()
            .parse::<Address<NetworkUnchecked>>()
            .map_err(|_| TxValidationError::InvalidAddress)?
            .require_network(self.coin.network)
            .map_err(|_| TxValidationError::InvalidAddress)?;
        Ok(address.script_pubkey())
    }

    async fn new_tx(&self, request: &SendRequest) -> WalletResult<TxProposal> {
        let components = self.components()?;
        if !self.initial_sync_done.load(Ordering::SeqCst) {
            return Err(TxValidationError::AccountNotSynced.into());
        }
        let output_pk_script = self.recipient_script(&request.recipient_address)?;
        if request.amount == SendAmount::Amount(0) {
            return Err(TxValidationError::InvalidAmount.into());
        }
        let fee_per_kb = self.fee_rate(request).await?;

        let spendable = components.transactions.spendable_outputs().await?;
        let (utxos, change_address) = {
            let state = self.state.read();
            let utxos: HashMap<OutPoint, Utxo> = spendable
                .into_iter()
                .filter(|(outpoint, _)| {
                    request.selected_utxos.is_empty() || request.selected_utxos.contains(outpoint)
                })
                .filter_map(|(outpoint, output)| match state.lookup(&output.script_hash) {
                    Some(address) => Some((
                        outpoint,
                        Utxo {
                            txout: output.txout,
                            address: address.clone(),
                        },
                    )),
                    None => {
                        warn!(outpoint = %outpoint, "spendable output of an unknown address");
                        None
                    }
                })
                .collect();
            let change_address = state
                .change
                .get_unused()?
                .first()
                .cloned()
                .ok_or_else(|| WalletError::InternalError("no unused change address".to_string()))?;
            (utxos, change_address)
        };

        let proposal = match request.amount {
            SendAmount::All => {
                maketx::new_tx_spend_all(&utxos, &output_pk_script, fee_per_kb, self.coin.rbf)?
            }
            SendAmount::Amount(amount) => maketx::new_tx(
                &utxos,
                &output_pk_script,
                amount,
                fee_per_kb,
                &change_address,
                self.coin.rbf,
            )?,
        };
        debug!(
            inputs = proposal.transaction.input.len(),
            outputs = proposal.transaction.output.len(),
            "created transaction"
        );
        Ok(proposal)
    }
}
