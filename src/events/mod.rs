//! Event system for account and header chain notifications
//!
//! Components publish events through an [`EventEmitter`], a thin wrapper around a
//! tokio broadcast channel. Consumers either subscribe to the channel directly or
//! register an [`EventListener`], which gets its own task so that a slow or failing
//! listener never blocks the publisher.
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use lightweight_btc_wallet::events::{AccountEvent, EventEmitter, EventListener};
//!
//! struct PrintListener;
//!
//! #[async_trait]
//! impl EventListener<AccountEvent> for PrintListener {
//!     async fn handle_event(
//!         &mut self,
//!         event: &AccountEvent,
//!     ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!         println!("{event:?}");
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() {
//! let emitter = EventEmitter::<AccountEvent>::new();
//! let _task = emitter.register(PrintListener);
//! emitter.emit(AccountEvent::SyncStarted);
//! # }
//! ```

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Buffered events per subscriber before the slowest one starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum AccountEvent {
    /// The account status (synced, offline, ...) may have changed.
    StatusChanged,
    SyncStarted,
    SyncDone,
    /// The header chain caught up with the indexer tip.
    HeadersSynced,
    FeeTargetsChanged,
    /// The indexer connection went up (`None`) or down.
    ConnectionStatusChanged { error: Option<String> },
}

/// Events emitted by the header chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HeadersEvent {
    /// A full batch was stored; more are being fetched.
    Syncing,
    /// The last batch was not full; the chain is at the indexer tip.
    Synced,
    /// The indexer reported a new tip.
    NewTip,
}

/// Handles events on a dedicated task.
#[async_trait]
pub trait EventListener<E>: Send + 'static {
    async fn handle_event(
        &mut self,
        event: &E,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        "UnnamedListener"
    }
}

/// Broadcasts events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventEmitter<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + Sync + std::fmt::Debug + 'static> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + Sync + std::fmt::Debug + 'static> EventEmitter<E> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publishes `event`. Having no subscriber is not an error.
    pub fn emit(&self, event: E) {
        debug!(?event, "emitting event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Feeds every future event to `listener` until the emitter is dropped.
    pub fn register<L: EventListener<E>>(&self, mut listener: L) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if let Err(e) = listener.handle_event(&event).await {
                            warn!(listener = listener.name(), error = %e, "event listener failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(listener = listener.name(), skipped, "event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
