//! Account, coin and signing configuration
//!
//! Configuration is plain serde data with defaults, so it can be built in code
//! with the `with_*` helpers or loaded from a JSON file.

use std::path::{Path, PathBuf};

use bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::{BlockHash, Network};
use serde::{Deserialize, Serialize};

use crate::data_structures::{FeeTargetCode, ScriptType};
use crate::errors::{WalletError, WalletResult};

/// Receive gap limit.
pub const DEFAULT_GAP_LIMIT: u16 = 20;
/// Change gap limit.
pub const DEFAULT_CHANGE_GAP_LIMIT: u16 = 6;
/// Receive gap limit of legacy p2pkh accounts; older wallet services used no limit at all.
pub const LEGACY_GAP_LIMIT: u16 = 60;
/// Change gap limit of legacy p2pkh accounts.
pub const LEGACY_CHANGE_GAP_LIMIT: u16 = 20;
/// Maximum number of blocks a reorg may roll back.
pub const REORG_LIMIT: u32 = 100;

/// What to do when a second transaction claims an outpoint that is already mapped to a spender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DoubleSpendPolicy {
    /// The most recently processed spender wins (replace-by-fee aware).
    #[default]
    LastSeen,
    /// The first recorded spender is kept.
    FirstSeen,
}

/// A known block at a fixed height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: BlockHash,
}

/// Per-coin parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinParams {
    pub network: Network,
    /// Headers below the checkpoint are not considered verified.
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    /// Validate difficulty transitions and proof of work of downloaded headers.
    #[serde(default)]
    pub validate_pow: bool,
    /// Signal replace-by-fee on new transactions.
    #[serde(default)]
    pub rbf: bool,
}

impl CoinParams {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            checkpoint: None,
            validate_pow: network == Network::Bitcoin,
            rbf: true,
        }
    }

    pub fn with_checkpoint(mut self, height: u32, hash: BlockHash) -> Self {
        self.checkpoint = Some(Checkpoint { height, hash });
        self
    }

    pub fn with_pow_validation(mut self, enabled: bool) -> Self {
        self.validate_pow = enabled;
        self
    }

    pub fn with_rbf(mut self, enabled: bool) -> Self {
        self.rbf = enabled;
        self
    }

    pub fn genesis_hash(&self) -> BlockHash {
        bitcoin::constants::genesis_block(self.network).block_hash()
    }

    /// File name of the per-coin headers file.
    pub fn headers_file_name(&self) -> String {
        format!("headers-{}.bin", self.network)
    }
}

/// Everything needed to derive the addresses of a single-signature account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningConfiguration {
    pub script_type: ScriptType,
    pub xpub: Xpub,
    /// Absolute keypath of `xpub`, e.g. m/84'/0'/0'.
    pub keypath: DerivationPath,
    #[serde(default)]
    pub root_fingerprint: Fingerprint,
}

impl SigningConfiguration {
    pub fn new(script_type: ScriptType, xpub: Xpub, keypath: DerivationPath) -> Self {
        Self {
            script_type,
            xpub,
            keypath,
            root_fingerprint: Fingerprint::default(),
        }
    }

    pub fn with_root_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.root_fingerprint = fingerprint;
        self
    }

    /// Stable identifier of this configuration, used to name the account database.
    pub fn hash(&self) -> String {
        let preimage = format!("{}:{}:{}", self.script_type, self.keypath, self.xpub);
        hex::encode(sha256::Hash::hash(preimage.as_bytes()).to_byte_array())
    }
}

fn default_gap_limit() -> u16 {
    DEFAULT_GAP_LIMIT
}

fn default_change_gap_limit() -> u16 {
    DEFAULT_CHANGE_GAP_LIMIT
}

fn default_fee_targets() -> Vec<(FeeTargetCode, u32)> {
    vec![
        (FeeTargetCode::Economy, 25),
        (FeeTargetCode::Low, 10),
        (FeeTargetCode::Normal, 5),
        (FeeTargetCode::High, 2),
    ]
}

fn default_headers_per_batch() -> u32 {
    10
}

fn default_reorg_limit() -> u32 {
    REORG_LIMIT
}

/// Account level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    /// Short account identifier, part of the database file name.
    pub code: String,
    /// Directory holding the account database and the headers file.
    pub db_dir: PathBuf,
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u16,
    #[serde(default = "default_change_gap_limit")]
    pub change_gap_limit: u16,
    #[serde(default)]
    pub double_spend_policy: DoubleSpendPolicy,
    #[serde(default = "default_fee_targets")]
    pub fee_targets: Vec<(FeeTargetCode, u32)>,
    /// Batch size of the first headers request; later batches use the server maximum.
    #[serde(default = "default_headers_per_batch")]
    pub headers_per_batch: u32,
    #[serde(default = "default_reorg_limit")]
    pub reorg_limit: u32,
}

impl AccountConfig {
    pub fn new(code: impl Into<String>, db_dir: impl Into<PathBuf>) -> Self {
        Self {
            code: code.into(),
            db_dir: db_dir.into(),
            gap_limit: DEFAULT_GAP_LIMIT,
            change_gap_limit: DEFAULT_CHANGE_GAP_LIMIT,
            double_spend_policy: DoubleSpendPolicy::default(),
            fee_targets: default_fee_targets(),
            headers_per_batch: default_headers_per_batch(),
            reorg_limit: REORG_LIMIT,
        }
    }

    pub fn with_gap_limits(mut self, receive: u16, change: u16) -> Self {
        self.gap_limit = receive;
        self.change_gap_limit = change;
        self
    }

    pub fn with_double_spend_policy(mut self, policy: DoubleSpendPolicy) -> Self {
        self.double_spend_policy = policy;
        self
    }

    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> WalletResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WalletError::ConfigurationError(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            WalletError::ConfigurationError(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> WalletResult<()> {
        if self.gap_limit == 0 || self.change_gap_limit == 0 {
            return Err(WalletError::ConfigurationError(
                "gap limits must be positive".to_string(),
            ));
        }
        if self.headers_per_batch == 0 {
            return Err(WalletError::ConfigurationError(
                "headers_per_batch must be positive".to_string(),
            ));
        }
        if self.fee_targets.is_empty() {
            return Err(WalletError::ConfigurationError(
                "at least one fee target is required".to_string(),
            ));
        }
        Ok(())
    }

    /// (receive, change) gap limits for an account of the given script type. Legacy p2pkh
    /// accounts scan further to find funds created by wallets with larger gaps.
    pub fn gap_limits(&self, script_type: ScriptType) -> (u16, u16) {
        if script_type == ScriptType::P2pkh {
            (
                self.gap_limit.max(LEGACY_GAP_LIMIT),
                self.change_gap_limit.max(LEGACY_CHANGE_GAP_LIMIT),
            )
        } else {
            (self.gap_limit, self.change_gap_limit)
        }
    }

    pub fn db_path(&self, signing: &SigningConfiguration) -> PathBuf {
        self.db_dir
            .join(format!("account-{}-{}.db", signing.hash(), self.code))
    }

    pub fn headers_path(&self, coin: &CoinParams) -> PathBuf {
        self.db_dir.join(coin.headers_file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: AccountConfig =
            serde_json::from_str(r#"{"code":"tbtc-1","dbDir":"/tmp/wallet"}"#).unwrap();
        assert_eq!(config, AccountConfig::new("tbtc-1", "/tmp/wallet"));
        assert_eq!(config.reorg_limit, 100);
        assert_eq!(config.fee_targets.len(), 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_legacy_gap_limits() {
        let config = AccountConfig::new("btc", "/tmp");
        assert_eq!(config.gap_limits(ScriptType::P2pkh), (60, 20));
        assert_eq!(config.gap_limits(ScriptType::P2wpkh), (20, 6));
        assert_eq!(config.gap_limits(ScriptType::P2tr), (20, 6));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = AccountConfig::new("btc", "/tmp").with_gap_limits(0, 6);
        assert!(matches!(
            config.validate(),
            Err(WalletError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_signing_configuration_hash_is_stable() {
        let xpub = Xpub::from_str("tpubDEXZPZzoVxHQdZg6ndWKoDXwsPtfTKpYsF6SDCm2dHxydcNvoKM58RmA7FDj3hXqy8BrxfwoTNaV5SzWgCzurTaQmDNywHVvv5tPSj6Evgr").unwrap();
        let keypath = DerivationPath::from_str("m/44'/1'/0'").unwrap();
        let a = SigningConfiguration::new(ScriptType::P2pkh, xpub, keypath.clone());
        let b = SigningConfiguration::new(ScriptType::P2wpkh, xpub, keypath);
        assert_eq!(a.hash(), a.clone().hash());
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn test_coin_params_defaults() {
        let mainnet = CoinParams::new(Network::Bitcoin);
        assert!(mainnet.validate_pow);
        let regtest = CoinParams::new(Network::Regtest);
        assert!(!regtest.validate_pow);
        assert_eq!(
            regtest.genesis_hash(),
            bitcoin::constants::genesis_block(Network::Regtest).block_hash()
        );
    }
}
