//! Interface to an Electrum-protocol blockchain indexer
//!
//! The wire client itself (JSON-RPC framing, TLS, failover) lives outside this crate.
//! Implementations of [`Blockchain`] translate its replies into these types and push
//! subscription updates through [`Blockchain::notifications`].

pub mod mocks;

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::{Transaction, TxMerkleNode, Txid};
use tokio::sync::broadcast;

use crate::data_structures::{ScriptHashHex, TxHistory};
use crate::errors::WalletResult;

/// Lowest Electrum protocol version a client must negotiate.
pub const MIN_PROTOCOL_VERSION: &str = "1.2";

/// Reply of `blockchain.block.headers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersResult {
    pub headers: Vec<Header>,
    /// Maximum number of headers the server returns per request.
    pub max: u32,
}

/// Reply of `blockchain.transaction.get_merkle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMerkleResult {
    pub merkle: Vec<TxMerkleNode>,
    pub pos: u32,
}

/// Pushes from the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockchainNotification {
    /// New status of a subscribed scripthash.
    ScriptHashStatus {
        script_hash: ScriptHashHex,
        status: String,
    },
    /// New chain tip.
    NewHeader { height: u32 },
    /// The connection went up (`None`) or down (`Some(error)`).
    ConnectionStatus { error: Option<String> },
}

/// Capacity of notification channels created by implementations.
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

/// The indexer RPCs used by the wallet.
#[async_trait]
pub trait Blockchain: Send + Sync {
    /// `blockchain.scripthash.get_history`
    async fn script_hash_get_history(&self, script_hash: &ScriptHashHex)
        -> WalletResult<TxHistory>;

    /// `blockchain.scripthash.subscribe`. Returns the current status, the empty string for an
    /// unused scripthash. Later changes arrive as [`BlockchainNotification::ScriptHashStatus`].
    async fn script_hash_subscribe(&self, script_hash: &ScriptHashHex) -> WalletResult<String>;

    /// `blockchain.transaction.get`
    async fn transaction_get(&self, txid: &Txid) -> WalletResult<Transaction>;

    /// `blockchain.transaction.broadcast`
    async fn transaction_broadcast(&self, tx: &Transaction) -> WalletResult<()>;

    /// `blockchain.relayfee` in satoshis per 1000 virtual bytes.
    async fn relay_fee(&self) -> WalletResult<u64>;

    /// `blockchain.estimatefee` in satoshis per 1000 virtual bytes, `None` if the server cannot
    /// estimate for this target.
    async fn estimate_fee(&self, blocks: u32) -> WalletResult<Option<u64>>;

    /// `blockchain.block.headers`
    async fn headers(&self, start_height: u32, count: u32) -> WalletResult<HeadersResult>;

    /// `blockchain.transaction.get_merkle`
    async fn get_merkle(&self, txid: &Txid, height: u32) -> WalletResult<GetMerkleResult>;

    /// `blockchain.headers.subscribe`. Returns the current tip height.
    async fn headers_subscribe(&self) -> WalletResult<u32>;

    /// Subscription pushes and connection changes.
    fn notifications(&self) -> broadcast::Receiver<BlockchainNotification>;

    /// The current connection error, if the client is offline.
    fn connection_error(&self) -> Option<String> {
        None
    }
}
