//! Block header chain synchronization
//!
//! [`Headers`] keeps the local header file in step with the indexer. A single worker
//! task downloads batches of headers whenever it is kicked. Kicks come from the
//! initial start, from full batches (there may be more) and from new-tip pushes. The
//! kick channel holds at most one pending kick, so callers never block.
//!
//! Every header must link to its predecessor. A header that does not is taken as a
//! reorg: the chain is truncated by up to the reorg limit and downloaded again. Each
//! batch starts at the stored tip, so a tip replaced by a competing block of the same
//! height is caught the same way.

use std::sync::Arc;

use bitcoin::block::Header;
use bitcoin::CompactTarget;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::blockchain::{Blockchain, BlockchainNotification};
use crate::config::CoinParams;
use crate::errors::{WalletError, WalletResult};
use crate::events::{EventEmitter, HeadersEvent};
use crate::storage::HeadersDb;
use crate::synchronizer::Synchronizer;

/// Blocks between two difficulty adjustments.
const BLOCKS_PER_RETARGET: i32 = 2016;

/// Sync progress of the header chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Tip loaded from disk at start, to show catch-up progress.
    pub tip_at_init_time: i32,
    pub tip: i32,
    pub tip_hash_hex: String,
    /// Tip height reported by the indexer.
    pub target_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersState {
    Initial,
    Downloading,
    Synced,
    Error,
    Closed,
}

#[derive(Debug)]
struct ChainState {
    headers_per_batch: u32,
    target_height: u32,
    tip_at_init_time: i32,
    state: HeadersState,
    /// Set when the chain changed since the last `Synced` event.
    changed: bool,
}

/// Why a header could not be appended.
enum ConnectError {
    /// The header does not build on our tip.
    PrevHash(String),
    Invalid(WalletError),
}

impl From<WalletError> for ConnectError {
    fn from(e: WalletError) -> Self {
        ConnectError::Invalid(e)
    }
}

struct Inner {
    coin: CoinParams,
    db: Mutex<HeadersDb>,
    blockchain: Arc<dyn Blockchain>,
    synchronizer: Arc<Synchronizer>,
    reorg_limit: u32,
    chain: Mutex<ChainState>,
    kick_sender: mpsc::Sender<()>,
    kick_receiver: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown: watch::Sender<bool>,
    events: EventEmitter<HeadersEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Header chain controller. Cheap to clone.
#[derive(Clone)]
pub struct Headers {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Headers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Headers")
            .field("network", &self.inner.coin.network)
            .field("chain", &*self.inner.chain.lock())
            .finish()
    }
}

impl Headers {
    pub fn new(
        coin: CoinParams,
        db: HeadersDb,
        blockchain: Arc<dyn Blockchain>,
        synchronizer: Arc<Synchronizer>,
        headers_per_batch: u32,
        reorg_limit: u32,
    ) -> Self {
        let (kick_sender, kick_receiver) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                coin,
                db: Mutex::new(db),
                blockchain,
                synchronizer,
                reorg_limit,
                chain: Mutex::new(ChainState {
                    headers_per_batch: headers_per_batch.max(1),
                    target_height: 0,
                    tip_at_init_time: -1,
                    state: HeadersState::Initial,
                    changed: false,
                }),
                kick_sender,
                kick_receiver: Mutex::new(Some(kick_receiver)),
                shutdown,
                events: EventEmitter::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<HeadersEvent> {
        self.inner.events.subscribe()
    }

    /// Starts the download worker and follows tip pushes from the indexer. Calling it twice
    /// has no effect.
    pub fn initialize(&self) {
        let Some(kick_receiver) = self.inner.kick_receiver.lock().take() else {
            debug!("headers already initialized");
            return;
        };
        let tip = self.inner.db.lock().tip();
        self.inner.chain.lock().tip_at_init_time = tip;
        info!(tip, "last header tip loaded");

        let worker = tokio::spawn(Inner::download_loop(
            Arc::clone(&self.inner),
            kick_receiver,
            self.inner.shutdown.subscribe(),
        ));
        let follower = tokio::spawn(Inner::follow_tip(
            Arc::clone(&self.inner),
            self.inner.shutdown.subscribe(),
        ));
        self.inner.tasks.lock().extend([worker, follower]);
        self.inner.kick();
    }

    /// Records a new indexer tip and triggers a download.
    pub fn update(&self, height: u32) {
        self.inner.update(height);
    }

    /// Tip height reported by the indexer.
    pub fn tip_height(&self) -> u32 {
        self.inner.chain.lock().target_height
    }

    pub fn state(&self) -> HeadersState {
        self.inner.chain.lock().state
    }

    /// Height of the last stored header.
    pub fn tip(&self) -> i32 {
        self.inner.db.lock().tip()
    }

    pub fn header_by_height(&self, height: i32) -> WalletResult<Option<Header>> {
        self.inner.db.lock().header_by_height(height)
    }

    /// Like [`Headers::header_by_height`], but `None` while the chain has not reached the
    /// checkpoint.
    pub fn verified_header_by_height(&self, height: i32) -> WalletResult<Option<Header>> {
        let db = self.inner.db.lock();
        if let Some(checkpoint) = self.inner.coin.checkpoint {
            if db.tip() < checkpoint.height as i32 {
                return Ok(None);
            }
        }
        db.header_by_height(height)
    }

    pub fn status(&self) -> WalletResult<Status> {
        let db = self.inner.db.lock();
        let tip = db.tip();
        let header = db
            .header_by_height(tip)?
            .ok_or_else(|| WalletError::NotAvailable(format!("header at {tip} not found")))?;
        let chain = self.inner.chain.lock();
        Ok(Status {
            tip_at_init_time: chain.tip_at_init_time,
            tip,
            tip_hash_hex: header.block_hash().to_string(),
            target_height: chain.target_height,
        })
    }

    /// Stops the worker and waits for it to finish its current batch.
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "headers task ended abnormally");
            }
        }
        self.inner.chain.lock().state = HeadersState::Closed;
        if let Err(e) = self.inner.db.lock().flush() {
            warn!(error = %e, "failed to flush headers");
        }
        info!("headers closed");
    }
}

/// Resolves once shutdown is signalled. The watch guard is dropped before returning, so
/// the select branches awaiting after it stay `Send`.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await.map(|_| ());
}

impl Inner {
    fn kick(&self) {
        // A pending kick already covers this one.
        let _ = self.kick_sender.try_send(());
    }

    fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn update(&self, height: u32) {
        debug!(height, "new header target");
        self.kick();
        self.chain.lock().target_height = height;
        self.events.emit(HeadersEvent::NewTip);
    }

    fn set_state(&self, state: HeadersState) {
        self.chain.lock().state = state;
    }

    async fn download_loop(
        self: Arc<Self>,
        mut kicks: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = closed(&mut shutdown) => break,
                kick = kicks.recv() => {
                    if kick.is_none() {
                        break;
                    }
                    self.download_and_process_batch().await;
                }
            }
        }
        debug!("stopped downloading headers");
    }

    async fn follow_tip(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut notifications = self.blockchain.notifications();
        let initial = {
            let _request = self.synchronizer.inc_request_count();
            self.blockchain.headers_subscribe().await
        };
        match initial {
            Ok(height) => self.update(height),
            Err(e) => error!(error = %e, "headers subscription failed"),
        }
        loop {
            tokio::select! {
                biased;
                _ = closed(&mut shutdown) => break,
                notification = notifications.recv() => match notification {
                    Ok(BlockchainNotification::NewHeader { height }) => self.update(height),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed header notifications");
                        self.kick();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn download_and_process_batch(&self) {
        if self.is_closed() {
            return;
        }
        let tip = self.db.lock().tip();
        let per_batch = self.chain.lock().headers_per_batch;
        // Re-read the tip header as well, so a replaced tip is noticed even when the
        // indexer's chain is no longer than ours.
        let start = u32::try_from(tip).unwrap_or(0);
        let count = if tip < 0 { per_batch } else { per_batch.saturating_add(1) };
        self.set_state(HeadersState::Downloading);
        let result = {
            let _request = self.synchronizer.inc_request_count();
            self.blockchain.headers(start, count).await
        };
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, start, "fetching headers failed");
                self.set_state(HeadersState::Error);
                return;
            }
        };
        if self.is_closed() {
            return;
        }
        let mut db = self.db.lock();
        if db.tip() != tip {
            // Only this worker appends, so the tip cannot move underneath us.
            warn!(expected = tip, actual = db.tip(), "header tip moved during download");
            self.kick();
            return;
        }
        if let Err(e) = self.process_batch(&mut db, tip, count, &result.headers, result.max) {
            error!(error = %e, "can't connect header, unexpected blockchain reply");
            self.set_state(HeadersState::Error);
        }
    }

    fn process_batch(
        &self,
        db: &mut HeadersDb,
        mut tip: i32,
        requested: u32,
        headers: &[Header],
        max: u32,
    ) -> WalletResult<()> {
        let mut new_headers = headers;
        if tip >= 0 {
            if let Some((first, rest)) = headers.split_first() {
                let stored = db.header_by_height(tip)?.map(|header| header.block_hash());
                if stored != Some(first.block_hash()) {
                    info!(height = tip, hash = %first.block_hash(), "tip replaced, reorg detected");
                    return self.reorg(db, tip);
                }
                new_headers = rest;
            }
        }
        for header in new_headers {
            match self.can_connect(db, tip + 1, header) {
                Ok(()) => {}
                Err(ConnectError::PrevHash(reason)) => {
                    info!(height = tip + 1, %reason, "reorg detected");
                    return self.reorg(db, tip);
                }
                Err(ConnectError::Invalid(e)) => return Err(e),
            }
            tip += 1;
            db.put_header(tip, header)?;
        }
        if let Err(e) = db.flush() {
            warn!(error = %e, "failed to flush headers");
        }
        let mut chain = self.chain.lock();
        chain.changed |= !new_headers.is_empty();
        if !new_headers.is_empty() && headers.len() == max.min(requested) as usize {
            // A full batch, there might be more.
            self.kick();
            debug!(tip, "syncing headers");
            chain.state = HeadersState::Downloading;
            self.events.emit(HeadersEvent::Syncing);
        } else {
            chain.state = HeadersState::Synced;
            if std::mem::take(&mut chain.changed) {
                debug!(tip, "synced headers");
                self.events.emit(HeadersEvent::Synced);
            }
        }
        chain.headers_per_batch = max.max(1);
        Ok(())
    }

    /// Truncates up to the reorg limit and downloads again. A hostile indexer can set us back
    /// by at most this many blocks without providing valid proof of work.
    fn reorg(&self, db: &mut HeadersDb, tip: i32) -> WalletResult<()> {
        let new_tip = (tip - self.reorg_limit as i32).max(-1);
        db.revert_to(new_tip)?;
        self.chain.lock().changed = true;
        self.kick();
        Ok(())
    }

    fn can_connect(&self, db: &HeadersDb, index: i32, header: &Header) -> Result<(), ConnectError> {
        if index == 0 {
            let genesis = self.coin.genesis_hash();
            if header.block_hash() != genesis {
                return Err(ConnectError::Invalid(WalletError::InvalidArgument {
                    argument: "header".to_string(),
                    message: format!(
                        "wrong genesis hash, got {}, expected {genesis}",
                        header.block_hash()
                    ),
                }));
            }
            return Ok(());
        }
        let previous = db.header_by_height(index - 1)?.ok_or_else(|| {
            WalletError::InternalError(format!("header at {} not found", index - 1))
        })?;
        let prev_hash = previous.block_hash();
        if header.prev_blockhash != prev_hash {
            return Err(ConnectError::PrevHash(format!(
                "{} ({index}) does not connect to {prev_hash} ({})",
                header.prev_blockhash,
                index - 1
            )));
        }

        let checkpoint = self.coin.checkpoint;
        if let Some(checkpoint) = checkpoint {
            if index == checkpoint.height as i32 {
                if header.block_hash() != checkpoint.hash {
                    return Err(ConnectError::Invalid(WalletError::InvalidArgument {
                        argument: "header".to_string(),
                        message: format!(
                            "checkpoint mismatch at {index}, expected {}, got {}",
                            checkpoint.hash,
                            header.block_hash()
                        ),
                    }));
                }
                info!(height = index, "checkpoint matches");
            }
        }

        if self.coin.validate_pow {
            let required = self.required_bits(db, index)?;
            if header.bits != required {
                return Err(ConnectError::Invalid(WalletError::InvalidArgument {
                    argument: "header".to_string(),
                    message: format!("header {index} has an unexpected difficulty"),
                }));
            }
            // Proof of work below the checkpoint is implied by the checkpoint itself.
            let past_checkpoint = checkpoint.map_or(true, |c| index > c.height as i32);
            if past_checkpoint {
                if let Err(e) = header.validate_pow(header.target()) {
                    return Err(ConnectError::Invalid(WalletError::InvalidArgument {
                        argument: "header".to_string(),
                        message: format!("header {index} has insufficient proof of work: {e}"),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Difficulty bits a header at `index` must carry.
    fn required_bits(&self, db: &HeadersDb, index: i32) -> WalletResult<CompactTarget> {
        let chunk = index / BLOCKS_PER_RETARGET - 1;
        if chunk < 0 {
            return Ok(bitcoin::constants::genesis_block(self.coin.network)
                .header
                .bits);
        }
        let first_index = chunk * BLOCKS_PER_RETARGET;
        let last_index = (chunk + 1) * BLOCKS_PER_RETARGET - 1;
        let first = db.header_by_height(first_index)?.ok_or_else(|| {
            WalletError::InternalError(format!("header at {first_index} not found"))
        })?;
        let last = db.header_by_height(last_index)?.ok_or_else(|| {
            WalletError::InternalError(format!("header at {last_index} not found"))
        })?;
        let timespan = (i64::from(last.time) - i64::from(first.time)).max(0) as u64;
        Ok(CompactTarget::from_next_work_required(
            last.bits,
            timespan,
            self.coin.network,
        ))
    }
}
