//! A single address of an account

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, Network, ScriptBuf, Witness};
use serde::Serialize;

use crate::data_structures::{secp, InputSignature, ScriptHashHex, ScriptType};
use crate::errors::{WalletError, WalletResult};

/// Position of an address below the account keypath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Derivation {
    /// Whether the address is on the change chain (`1`) or the receive chain (`0`).
    pub change: bool,
    pub address_index: u32,
}

impl Derivation {
    pub fn chain_index(&self) -> u32 {
        u32::from(self.change)
    }

    /// The non-hardened `<chain>/<index>` suffix.
    pub fn relative_path(&self) -> DerivationPath {
        DerivationPath::from(vec![
            ChildNumber::Normal {
                index: self.chain_index(),
            },
            ChildNumber::Normal {
                index: self.address_index,
            },
        ])
    }
}

/// An address derived from the account xpub.
#[derive(Debug, Clone)]
pub struct AccountAddress {
    pub script_type: ScriptType,
    pub derivation: Derivation,
    /// Absolute keypath, for the keystore.
    pub keypath: DerivationPath,
    public_key: PublicKey,
    pk_script: ScriptBuf,
    script_hash: ScriptHashHex,
    address: Address,
    /// Electrum status of the address history; empty while the address is unused.
    pub history_status: String,
}

impl AccountAddress {
    /// Derives `xpub/<chain>/<index>`.
    pub fn derive(
        xpub: &Xpub,
        account_keypath: &DerivationPath,
        script_type: ScriptType,
        derivation: Derivation,
        network: Network,
    ) -> WalletResult<Self> {
        let relative = derivation.relative_path();
        let child = xpub.derive_pub(secp(), &relative)?;
        let public_key = child.public_key;
        let pk_script = script_type.pk_script(&public_key);
        let address = Address::from_script(&pk_script, network).map_err(|e| {
            WalletError::InternalError(format!("no address for {script_type} script: {e}"))
        })?;
        Ok(Self {
            script_type,
            derivation,
            keypath: account_keypath.extend(relative),
            public_key,
            script_hash: ScriptHashHex::from_script(&pk_script),
            pk_script,
            address,
            history_status: String::new(),
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn pk_script(&self) -> &ScriptBuf {
        &self.pk_script
    }

    /// Identifier used by the indexer.
    pub fn script_hash(&self) -> &ScriptHashHex {
        &self.script_hash
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Human readable encoding of the address.
    pub fn encode(&self) -> String {
        self.address.to_string()
    }

    pub fn is_used(&self) -> bool {
        !self.history_status.is_empty()
    }

    /// The p2wpkh redeem script of a nested segwit address.
    pub fn redeem_script(&self) -> Option<ScriptBuf> {
        match self.script_type {
            ScriptType::P2wpkhP2sh => Some(ScriptBuf::new_p2wpkh(
                &bitcoin::CompressedPublicKey(self.public_key).wpubkey_hash(),
            )),
            _ => None,
        }
    }

    /// The sigScript and witness spending an output of this address.
    pub fn signature_script(
        &self,
        signature: &InputSignature,
    ) -> WalletResult<(ScriptBuf, Witness)> {
        self.script_type
            .signature_script(&self.public_key, signature)
    }
}
