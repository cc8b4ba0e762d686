//! SQLite backed transactions database of one account
//!
//! The database is a set of key-value buckets, each stored as a two-column table.
//! All access goes through a [`DbTx`] snapshot which holds the connection lock for
//! its lifetime. A snapshot that is dropped without [`DbTx::commit`] is rolled back.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use bitcoin::base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bitcoin::consensus;
use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::data_structures::{ScriptHashHex, TxHistory};
use crate::errors::{WalletError, WalletResult};
use crate::storage::quarantine_file;

const GAP_LIMITS_KEY: &[u8] = b"gapLimits";

/// Logical buckets of the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Transactions,
    UnverifiedTransactions,
    Inputs,
    Outputs,
    AddressHistories,
    Config,
}

impl Bucket {
    const ALL: [Bucket; 6] = [
        Bucket::Transactions,
        Bucket::UnverifiedTransactions,
        Bucket::Inputs,
        Bucket::Outputs,
        Bucket::AddressHistories,
        Bucket::Config,
    ];

    fn table(self) -> &'static str {
        match self {
            Bucket::Transactions => "transactions",
            Bucket::UnverifiedTransactions => "unverifiedTransactions",
            Bucket::Inputs => "inputs",
            Bucket::Outputs => "outputs",
            Bucket::AddressHistories => "addressHistories",
            Bucket::Config => "config",
        }
    }
}

/// Consensus-hex (de)serialization of the raw transaction inside a record.
mod tx_hex {
    use super::*;

    pub fn serialize<S: Serializer>(
        tx: &Option<Transaction>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match tx {
            Some(tx) => serializer.serialize_some(&consensus::encode::serialize_hex(tx)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Transaction>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let bytes = hex::decode(&raw).map_err(serde::de::Error::custom)?;
        consensus::deserialize(&bytes)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

/// A transaction record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTxInfo {
    #[serde(rename = "Tx", with = "tx_hex", default)]
    pub tx: Option<Transaction>,
    /// Confirmation height; 0 or -1 when unconfirmed.
    #[serde(rename = "Height", default)]
    pub height: i32,
    /// Scripthashes of this account whose history contains the transaction.
    #[serde(rename = "addresses", default)]
    pub addresses: BTreeMap<String, bool>,
    /// `None` until a merkle proof was checked.
    #[serde(rename = "Verified", default)]
    pub verified: Option<bool>,
    #[serde(rename = "ts", default)]
    pub header_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "created", default)]
    pub created_timestamp: Option<DateTime<Utc>>,
}

impl DbTxInfo {
    pub fn is_verified(&self) -> bool {
        self.verified == Some(true)
    }
}

#[derive(Serialize, Deserialize)]
struct DbTxOut {
    #[serde(rename = "Value")]
    value: u64,
    #[serde(rename = "PkScript")]
    pk_script: String,
}

impl From<&TxOut> for DbTxOut {
    fn from(txout: &TxOut) -> Self {
        Self {
            value: txout.value.to_sat(),
            pk_script: BASE64.encode(txout.script_pubkey.as_bytes()),
        }
    }
}

impl TryFrom<DbTxOut> for TxOut {
    type Error = WalletError;

    fn try_from(stored: DbTxOut) -> Result<Self, Self::Error> {
        let script = BASE64
            .decode(stored.pk_script.as_bytes())
            .map_err(|e| WalletError::SerializationError(format!("invalid pk script: {e}")))?;
        Ok(TxOut {
            value: Amount::from_sat(stored.value),
            script_pubkey: ScriptBuf::from_bytes(script),
        })
    }
}

/// Receive and change gap limits persisted with the account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GapLimits {
    pub receive: u16,
    pub change: u16,
}

impl GapLimits {
    fn to_bytes(self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[..2].copy_from_slice(&self.receive.to_le_bytes());
        bytes[2..].copy_from_slice(&self.change.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> WalletResult<Self> {
        if bytes.len() != 4 {
            return Err(WalletError::SerializationError(format!(
                "gap limits must be 4 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            receive: u16::from_le_bytes([bytes[0], bytes[1]]),
            change: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }
}

/// Fault injection for tests.
#[derive(Debug, Default)]
pub struct StoreFailureModes {
    fail_next_commit: AtomicBool,
}

impl StoreFailureModes {
    pub fn set_fail_next_commit(&self, fail: bool) {
        self.fail_next_commit.store(fail, Ordering::SeqCst);
    }

    fn take_commit_failure(&self) -> bool {
        self.fail_next_commit.swap(false, Ordering::SeqCst)
    }
}

/// Transactions database of one account.
pub struct TransactionsDb {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    failure_modes: StoreFailureModes,
}

impl std::fmt::Debug for TransactionsDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionsDb")
            .field("path", &self.path)
            .finish()
    }
}

impl TransactionsDb {
    /// Opens or creates the database at `path`. An unreadable file yields
    /// [`WalletError::Corruption`].
    pub fn open(path: impl AsRef<Path>) -> WalletResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            WalletError::StorageError(format!("Failed to open {}: {e}", path.display()))
        })?;
        Self::init(&conn)
            .map_err(|e| WalletError::Corruption(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "opened transactions database");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            failure_modes: StoreFailureModes::default(),
        })
    }

    pub fn open_in_memory() -> WalletResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            failure_modes: StoreFailureModes::default(),
        })
    }

    fn init(conn: &Connection) -> WalletResult<()> {
        let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if check != "ok" {
            return Err(WalletError::Corruption(check));
        }
        for bucket in Bucket::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (key BLOB PRIMARY KEY, value BLOB NOT NULL);",
                bucket.table()
            ))?;
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn failure_modes(&self) -> &StoreFailureModes {
        &self.failure_modes
    }

    /// Starts a read-write snapshot. Blocks while another snapshot is open.
    pub fn begin(&self) -> WalletResult<DbTx<'_>> {
        self.begin_with("BEGIN IMMEDIATE", true)
    }

    /// Starts a read-only snapshot.
    pub fn begin_read(&self) -> WalletResult<DbTx<'_>> {
        self.begin_with("BEGIN DEFERRED", false)
    }

    fn begin_with(&self, statement: &str, writable: bool) -> WalletResult<DbTx<'_>> {
        let conn = self.conn.lock();
        conn.execute_batch(statement)?;
        Ok(DbTx {
            conn,
            failure_modes: &self.failure_modes,
            writable,
            finished: false,
        })
    }
}

/// Opens the database, moving a corrupt file aside and starting empty if needed.
pub fn open_or_quarantine(path: &Path) -> WalletResult<TransactionsDb> {
    match TransactionsDb::open(path) {
        Err(err) if err.is_corruption() => {
            warn!(path = %path.display(), error = %err, "transactions database is corrupt");
            quarantine_file(path)?;
            TransactionsDb::open(path)
        }
        other => other,
    }
}

fn txid_from_key(key: &[u8]) -> WalletResult<Txid> {
    let bytes: [u8; 32] = key.try_into().map_err(|_| {
        WalletError::SerializationError(format!("invalid tx hash key of {} bytes", key.len()))
    })?;
    Ok(Txid::from_byte_array(bytes))
}

fn outpoint_key(outpoint: &OutPoint) -> Vec<u8> {
    outpoint.to_string().into_bytes()
}

fn outpoint_from_key(key: &[u8]) -> WalletResult<OutPoint> {
    let key = std::str::from_utf8(key)
        .map_err(|e| WalletError::SerializationError(format!("invalid outpoint key: {e}")))?;
    OutPoint::from_str(key)
        .map_err(|e| WalletError::SerializationError(format!("invalid outpoint {key}: {e}")))
}

/// An open snapshot on the transactions database.
pub struct DbTx<'a> {
    conn: MutexGuard<'a, Connection>,
    failure_modes: &'a StoreFailureModes,
    writable: bool,
    finished: bool,
}

impl<'a> DbTx<'a> {
    /// Makes all writes of this snapshot durable.
    pub fn commit(mut self) -> WalletResult<()> {
        if self.failure_modes.take_commit_failure() {
            return Err(WalletError::StorageError(
                "commit failed (injected)".to_string(),
            ));
        }
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    /// Discards all writes of this snapshot.
    pub fn rollback(mut self) -> WalletResult<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn ensure_writable(&self) -> WalletResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(WalletError::InternalError(
                "write on a read-only snapshot".to_string(),
            ))
        }
    }

    fn get(&self, bucket: Bucket, key: &[u8]) -> WalletResult<Option<Vec<u8>>> {
        let sql = format!("SELECT value FROM \"{}\" WHERE key = ?1", bucket.table());
        Ok(self
            .conn
            .query_row(&sql, params![key], |row| row.get(0))
            .optional()?)
    }

    fn put(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> WalletResult<()> {
        self.ensure_writable()?;
        let sql = format!(
            "INSERT INTO \"{}\" (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            bucket.table()
        );
        self.conn.execute(&sql, params![key, value])?;
        Ok(())
    }

    fn delete(&self, bucket: Bucket, key: &[u8]) -> WalletResult<()> {
        self.ensure_writable()?;
        let sql = format!("DELETE FROM \"{}\" WHERE key = ?1", bucket.table());
        self.conn.execute(&sql, params![key])?;
        Ok(())
    }

    fn entries(&self, bucket: Bucket) -> WalletResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let sql = format!(
            "SELECT key, value FROM \"{}\" ORDER BY rowid",
            bucket.table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn modify_tx(&self, txid: &Txid, f: impl FnOnce(&mut DbTxInfo)) -> WalletResult<()> {
        let key = txid.to_byte_array();
        let mut info = match self.get(Bucket::Transactions, &key)? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => DbTxInfo {
                created_timestamp: Some(Utc::now()),
                ..DbTxInfo::default()
            },
        };
        f(&mut info);
        self.put(Bucket::Transactions, &key, &serde_json::to_vec(&info)?)
    }

    /// The record of `txid`, or an empty record if it is unknown.
    pub fn tx_info(&self, txid: &Txid) -> WalletResult<DbTxInfo> {
        match self.get(Bucket::Transactions, &txid.to_byte_array())? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(DbTxInfo::default()),
        }
    }

    /// Inserts or updates a transaction. The verified flag and an existing header timestamp are
    /// kept; a transaction that was never verified is (re)queued for verification.
    pub fn put_tx(
        &self,
        txid: &Txid,
        tx: &Transaction,
        height: i32,
        header_timestamp: Option<DateTime<Utc>>,
    ) -> WalletResult<()> {
        let mut verified = None;
        self.modify_tx(txid, |info| {
            verified = info.verified;
            info.tx = Some(tx.clone());
            info.height = height;
            if header_timestamp.is_some() {
                info.header_timestamp = header_timestamp;
            }
        })?;
        if verified.is_none() {
            self.put(Bucket::UnverifiedTransactions, &txid.to_byte_array(), &[])?;
        }
        Ok(())
    }

    pub fn delete_tx(&self, txid: &Txid) -> WalletResult<()> {
        let key = txid.to_byte_array();
        self.delete(Bucket::Transactions, &key)?;
        self.delete(Bucket::UnverifiedTransactions, &key)
    }

    pub fn add_address_to_tx(&self, txid: &Txid, script_hash: &ScriptHashHex) -> WalletResult<()> {
        self.modify_tx(txid, |info| {
            info.addresses.insert(script_hash.to_string(), true);
        })
    }

    /// Removes `script_hash` from the set of addresses claiming `txid`. Returns true if no
    /// address claims it anymore.
    pub fn remove_address_from_tx(
        &self,
        txid: &Txid,
        script_hash: &ScriptHashHex,
    ) -> WalletResult<bool> {
        let mut empty = false;
        self.modify_tx(txid, |info| {
            info.addresses.remove(script_hash.as_str());
            empty = info.addresses.is_empty();
        })?;
        Ok(empty)
    }

    /// All transaction hashes, in insertion order.
    pub fn transactions(&self) -> WalletResult<Vec<Txid>> {
        self.entries(Bucket::Transactions)?
            .into_iter()
            .map(|(key, _)| txid_from_key(&key))
            .collect()
    }

    /// Hashes of transactions whose merkle proof was not checked yet.
    pub fn unverified_transactions(&self) -> WalletResult<Vec<Txid>> {
        self.entries(Bucket::UnverifiedTransactions)?
            .into_iter()
            .map(|(key, _)| txid_from_key(&key))
            .collect()
    }

    pub fn mark_tx_verified(
        &self,
        txid: &Txid,
        header_timestamp: DateTime<Utc>,
    ) -> WalletResult<()> {
        self.delete(Bucket::UnverifiedTransactions, &txid.to_byte_array())?;
        self.modify_tx(txid, |info| {
            info.verified = Some(true);
            info.header_timestamp = Some(header_timestamp);
        })
    }

    /// Records that `outpoint` is spent by `txid`.
    pub fn put_input(&self, outpoint: &OutPoint, txid: &Txid) -> WalletResult<()> {
        self.put(Bucket::Inputs, &outpoint_key(outpoint), &txid.to_byte_array())
    }

    /// The transaction spending `outpoint`, if known.
    pub fn input(&self, outpoint: &OutPoint) -> WalletResult<Option<Txid>> {
        self.get(Bucket::Inputs, &outpoint_key(outpoint))?
            .map(|raw| txid_from_key(&raw))
            .transpose()
    }

    pub fn delete_input(&self, outpoint: &OutPoint) -> WalletResult<()> {
        self.delete(Bucket::Inputs, &outpoint_key(outpoint))
    }

    pub fn put_output(&self, outpoint: &OutPoint, txout: &TxOut) -> WalletResult<()> {
        let value = serde_json::to_vec(&DbTxOut::from(txout))?;
        self.put(Bucket::Outputs, &outpoint_key(outpoint), &value)
    }

    pub fn output(&self, outpoint: &OutPoint) -> WalletResult<Option<TxOut>> {
        match self.get(Bucket::Outputs, &outpoint_key(outpoint))? {
            Some(raw) => Ok(Some(
                serde_json::from_slice::<DbTxOut>(&raw)?.try_into()?,
            )),
            None => Ok(None),
        }
    }

    /// All outputs paying this account.
    pub fn outputs(&self) -> WalletResult<HashMap<OutPoint, TxOut>> {
        let mut outputs = HashMap::new();
        for (key, value) in self.entries(Bucket::Outputs)? {
            let stored: DbTxOut = serde_json::from_slice(&value)?;
            outputs.insert(outpoint_from_key(&key)?, stored.try_into()?);
        }
        Ok(outputs)
    }

    pub fn delete_output(&self, outpoint: &OutPoint) -> WalletResult<()> {
        self.delete(Bucket::Outputs, &outpoint_key(outpoint))
    }

    pub fn put_address_history(
        &self,
        script_hash: &ScriptHashHex,
        history: &TxHistory,
    ) -> WalletResult<()> {
        self.put(
            Bucket::AddressHistories,
            script_hash.as_str().as_bytes(),
            &serde_json::to_vec(history)?,
        )
    }

    /// The stored history of `script_hash`; empty if none was stored.
    pub fn address_history(&self, script_hash: &ScriptHashHex) -> WalletResult<TxHistory> {
        match self.get(Bucket::AddressHistories, script_hash.as_str().as_bytes())? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(TxHistory::default()),
        }
    }

    pub fn put_gap_limits(&self, limits: GapLimits) -> WalletResult<()> {
        self.put(Bucket::Config, GAP_LIMITS_KEY, &limits.to_bytes())
    }

    /// Persisted gap limits, or zeros if none were stored.
    pub fn gap_limits(&self) -> WalletResult<GapLimits> {
        match self.get(Bucket::Config, GAP_LIMITS_KEY)? {
            Some(raw) => GapLimits::from_bytes(&raw),
            None => Ok(GapLimits::default()),
        }
    }
}

impl Drop for DbTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "rollback of unfinished snapshot failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Sequence, TxIn, Witness};
    use tempfile::TempDir;

    fn test_tx(seed: &str) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::hash(seed.as_bytes()), 3),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(12345),
                script_pubkey: ScriptBuf::from_bytes(b"script1".to_vec()),
            }],
        }
    }

    #[test]
    fn test_put_tx_round_trip_and_unverified_queue() {
        let db = TransactionsDb::open_in_memory().unwrap();
        let tx = test_tx("a");
        let txid = tx.compute_txid();

        let dbtx = db.begin().unwrap();
        assert_eq!(dbtx.tx_info(&txid).unwrap(), DbTxInfo::default());
        dbtx.put_tx(&txid, &tx, 10, None).unwrap();
        dbtx.commit().unwrap();

        let dbtx = db.begin_read().unwrap();
        let info = dbtx.tx_info(&txid).unwrap();
        assert_eq!(info.tx.as_ref(), Some(&tx));
        assert_eq!(info.height, 10);
        assert_eq!(info.verified, None);
        assert!(info.created_timestamp.is_some());
        assert_eq!(dbtx.unverified_transactions().unwrap(), vec![txid]);
        assert_eq!(dbtx.transactions().unwrap(), vec![txid]);
    }

    #[test]
    fn test_mark_verified_is_kept_by_put_tx() {
        let db = TransactionsDb::open_in_memory().unwrap();
        let tx = test_tx("b");
        let txid = tx.compute_txid();
        let ts = DateTime::parse_from_rfc3339("2020-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);

        let dbtx = db.begin().unwrap();
        dbtx.put_tx(&txid, &tx, 0, None).unwrap();
        let created = dbtx.tx_info(&txid).unwrap().created_timestamp;
        dbtx.mark_tx_verified(&txid, ts).unwrap();
        assert!(dbtx.unverified_transactions().unwrap().is_empty());

        dbtx.put_tx(&txid, &tx, 12, None).unwrap();
        let info = dbtx.tx_info(&txid).unwrap();
        assert!(info.is_verified());
        assert_eq!(info.header_timestamp, Some(ts));
        assert_eq!(info.created_timestamp, created);
        assert!(dbtx.unverified_transactions().unwrap().is_empty());
        dbtx.commit().unwrap();
    }

    #[test]
    fn test_tx_record_json_keys() {
        let tx = test_tx("c");
        let info = DbTxInfo {
            tx: Some(tx.clone()),
            height: 7,
            ..DbTxInfo::default()
        };
        let value: serde_json::Value = serde_json::to_value(&info).unwrap();
        let object = value.as_object().unwrap();
        for key in ["Tx", "Height", "addresses", "Verified", "ts", "created"] {
            assert!(object.contains_key(key), "missing {key}");
        }
        assert_eq!(
            object["Tx"].as_str().unwrap(),
            consensus::encode::serialize_hex(&tx)
        );
        assert!(object["Verified"].is_null());

        let minimal: DbTxInfo = serde_json::from_str(r#"{"Height":5}"#).unwrap();
        assert_eq!(minimal.height, 5);
        assert!(minimal.tx.is_none());
    }

    #[test]
    fn test_address_set_reports_empty() {
        let db = TransactionsDb::open_in_memory().unwrap();
        let txid = Txid::hash(b"tx");
        let a = ScriptHashHex::new("aa");
        let b = ScriptHashHex::new("bb");
        let dbtx = db.begin().unwrap();
        dbtx.add_address_to_tx(&txid, &a).unwrap();
        dbtx.add_address_to_tx(&txid, &b).unwrap();
        assert!(!dbtx.remove_address_from_tx(&txid, &a).unwrap());
        assert!(dbtx.remove_address_from_tx(&txid, &b).unwrap());
        dbtx.delete_tx(&txid).unwrap();
        dbtx.delete_tx(&txid).unwrap();
        assert!(dbtx.transactions().unwrap().is_empty());
    }

    #[test]
    fn test_inputs_and_outputs() {
        let db = TransactionsDb::open_in_memory().unwrap();
        let outpoint = OutPoint::new(Txid::hash(b"parent"), 1);
        let spender = Txid::hash(b"spender");
        let txout = TxOut {
            value: Amount::from_sat(12345),
            script_pubkey: ScriptBuf::from_bytes(b"script1".to_vec()),
        };

        let dbtx = db.begin().unwrap();
        assert_eq!(dbtx.input(&outpoint).unwrap(), None);
        dbtx.put_input(&outpoint, &spender).unwrap();
        assert_eq!(dbtx.input(&outpoint).unwrap(), Some(spender));
        dbtx.put_output(&outpoint, &txout).unwrap();
        assert_eq!(dbtx.output(&outpoint).unwrap(), Some(txout.clone()));
        assert_eq!(dbtx.outputs().unwrap().get(&outpoint), Some(&txout));

        let key = outpoint_key(&outpoint);
        let raw = dbtx.get(Bucket::Outputs, &key).unwrap().unwrap();
        assert_eq!(
            String::from_utf8(raw).unwrap(),
            r#"{"Value":12345,"PkScript":"c2NyaXB0MQ=="}"#
        );
        let raw_input = dbtx.get(Bucket::Inputs, &key).unwrap().unwrap();
        assert_eq!(raw_input, spender.to_byte_array().to_vec());
        assert_eq!(
            String::from_utf8(key).unwrap(),
            format!("{}:1", Txid::hash(b"parent"))
        );

        dbtx.delete_input(&outpoint).unwrap();
        dbtx.delete_output(&outpoint).unwrap();
        assert_eq!(dbtx.input(&outpoint).unwrap(), None);
        assert!(dbtx.outputs().unwrap().is_empty());
    }

    #[test]
    fn test_gap_limits_encoding() {
        let db = TransactionsDb::open_in_memory().unwrap();
        let dbtx = db.begin().unwrap();
        assert_eq!(dbtx.gap_limits().unwrap(), GapLimits::default());
        let limits = GapLimits {
            receive: 321,
            change: 123,
        };
        dbtx.put_gap_limits(limits).unwrap();
        assert_eq!(dbtx.gap_limits().unwrap(), limits);
        let raw = dbtx.get(Bucket::Config, GAP_LIMITS_KEY).unwrap().unwrap();
        assert_eq!(hex::encode(raw), "41017b00");
    }

    #[test]
    fn test_missing_history_is_empty() {
        let db = TransactionsDb::open_in_memory().unwrap();
        let dbtx = db.begin_read().unwrap();
        assert!(dbtx
            .address_history(&ScriptHashHex::new("00"))
            .unwrap()
            .is_empty());
        assert!(dbtx
            .put_gap_limits(GapLimits::default())
            .is_err());
    }

    #[test]
    fn test_dropped_snapshot_rolls_back() {
        let db = TransactionsDb::open_in_memory().unwrap();
        let tx = test_tx("d");
        let txid = tx.compute_txid();
        {
            let dbtx = db.begin().unwrap();
            dbtx.put_tx(&txid, &tx, 1, None).unwrap();
        }
        let dbtx = db.begin().unwrap();
        assert!(dbtx.transactions().unwrap().is_empty());
        dbtx.rollback().unwrap();
    }

    #[test]
    fn test_injected_commit_failure_rolls_back() {
        let db = TransactionsDb::open_in_memory().unwrap();
        let tx = test_tx("e");
        let txid = tx.compute_txid();
        db.failure_modes().set_fail_next_commit(true);

        let dbtx = db.begin().unwrap();
        dbtx.put_tx(&txid, &tx, 1, None).unwrap();
        assert!(dbtx.commit().is_err());

        // The lock was released and nothing was written.
        let dbtx = db.begin().unwrap();
        assert!(dbtx.transactions().unwrap().is_empty());
        dbtx.put_tx(&txid, &tx, 1, None).unwrap();
        dbtx.commit().unwrap();
        assert_eq!(db.begin_read().unwrap().transactions().unwrap(), vec![txid]);
    }

    #[test]
    fn test_corrupt_file_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("account.db");
        std::fs::write(&path, vec![0x5au8; 4096]).unwrap();

        assert!(TransactionsDb::open(&path).unwrap_err().is_corruption());

        let db = open_or_quarantine(&path).unwrap();
        assert!(db.begin_read().unwrap().transactions().unwrap().is_empty());
        let quarantined: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt."))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("account.db");
        let tx = test_tx("f");
        let txid = tx.compute_txid();
        {
            let db = TransactionsDb::open(&path).unwrap();
            let dbtx = db.begin().unwrap();
            dbtx.put_tx(&txid, &tx, 3, None).unwrap();
            dbtx.commit().unwrap();
        }
        let db = TransactionsDb::open(&path).unwrap();
        let info = db.begin_read().unwrap().tx_info(&txid).unwrap();
        assert_eq!(info.tx, Some(tx));
    }
}
