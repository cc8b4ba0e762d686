//! Persistence for the wallet engine
//!
//! Two stores live on disk: the SQLite transactions database of an account and the
//! flat headers file of a coin. Both recover from corruption by moving the damaged
//! file aside and starting over.

pub mod headers_db;
pub mod transactions_db;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::errors::WalletResult;

pub use headers_db::HeadersDb;
pub use transactions_db::{DbTx, DbTxInfo, GapLimits, StoreFailureModes, TransactionsDb};

/// Renames a damaged file to `<name>.corrupt.<unix-nanos>` and returns the new path.
pub fn quarantine_file(path: &Path) -> WalletResult<PathBuf> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt.{nanos}"));
    let target = PathBuf::from(name);
    std::fs::rename(path, &target)?;
    warn!(from = %path.display(), to = %target.display(), "quarantined corrupt file");
    Ok(target)
}
