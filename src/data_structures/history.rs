//! Address histories as reported by an Electrum indexer

use std::fmt::{Display, Formatter};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Script, Txid};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Indexer identifier of an output script: sha256 of the script, byte-reversed, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptHashHex(String);

impl ScriptHashHex {
    pub fn from_script(script: &Script) -> Self {
        let mut bytes = sha256::Hash::hash(script.as_bytes()).to_byte_array();
        bytes.reverse();
        Self(hex::encode(bytes))
    }

    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ScriptHashHex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction hash as found in history JSON.
///
/// Serialized as display-order hex. Older records stored the raw 32 bytes (internal order) as a
/// JSON array of numbers; both forms deserialize.
mod tx_hash_json {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TxHashRepr {
        Hex(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(txid: &Txid, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&txid.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Txid, D::Error> {
        match TxHashRepr::deserialize(deserializer)? {
            TxHashRepr::Hex(s) => s.parse::<Txid>().map_err(serde::de::Error::custom),
            TxHashRepr::Bytes(bytes) => {
                let array: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
                    serde::de::Error::custom(format!("expected 32 bytes, got {}", bytes.len()))
                })?;
                Ok(Txid::from_byte_array(array))
            }
        }
    }
}

/// One entry of an address history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHistoryEntry {
    /// Block height, or 0 / -1 for unconfirmed transactions.
    pub height: i32,
    #[serde(with = "tx_hash_json")]
    pub tx_hash: Txid,
    #[serde(default)]
    pub fee: Option<i64>,
}

impl TxHistoryEntry {
    pub fn new(tx_hash: Txid, height: i32) -> Self {
        Self {
            height,
            tx_hash,
            fee: None,
        }
    }
}

/// Ordered history of one scripthash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHistory(pub Vec<TxHistoryEntry>);

impl TxHistory {
    pub fn new(entries: Vec<TxHistoryEntry>) -> Self {
        Self(entries)
    }

    /// Electrum status of this history: hex(sha256("txhash:height:" for each entry)), or the empty
    /// string for an empty history.
    pub fn status(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let mut preimage = String::new();
        for entry in &self.0 {
            preimage.push_str(&format!("{}:{}:", entry.tx_hash, entry.height));
        }
        hex::encode(sha256::Hash::hash(preimage.as_bytes()).to_byte_array())
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.0.iter().any(|entry| &entry.tx_hash == txid)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TxHistoryEntry> {
        self.0.iter()
    }
}
