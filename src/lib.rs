//! Lightweight Bitcoin account engine
//!
//! This crate keeps a single-xpub Bitcoin account in sync with an Electrum-protocol indexer
//! and builds transactions spending its coins, including address management, header
//! verification and coin selection.
//!
//! ## Components
//!
//! - [`addresses`]: receive and change chains extended up to a gap limit
//! - [`storage`]: the SQLite transaction index and the flat-file header store
//! - [`headers`]: header chain download with reorg handling
//! - [`transactions`]: address histories, merkle verification, balance and history views
//! - [`maketx`]: fee estimation, coin selection and BIP69 ordering
//! - [`account`]: the controller tying everything to a [`blockchain::Blockchain`] and a
//!   [`keystore::Keystore`]
//!
//! ## Features
//!
//! - `cli`: builds the `wallet-inspect` binary for looking at address chains, account
//!   databases and header files offline
//!
//! ```toml
//! [dependencies]
//! lightweight_btc_wallet = { version = "0.2", features = ["cli"] }
//! ```

pub mod account;
pub mod addresses;
pub mod blockchain;
pub mod config;
pub mod data_structures;
pub mod errors;
pub mod events;
pub mod headers;
pub mod keystore;
pub mod maketx;
pub mod storage;
pub mod synchronizer;
pub mod transactions;

pub use account::Account;
pub use errors::*;
