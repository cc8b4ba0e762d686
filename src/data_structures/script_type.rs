//! Output script types supported by an account
//!
//! [`ScriptType`] is the closed set of single-signature script types. The
//! behaviour that differs between them (building the pk-script, the worst-case
//! size of the spending data, assembling the spending data from a signature)
//! lives behind the [`ScriptCapability`] trait, implemented once per type.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::OnceLock;

use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{PublicKey, Secp256k1, VerifyOnly};
use bitcoin::{ecdsa, taproot, CompressedPublicKey, ScriptBuf, ScriptHash, Witness};
use serde::{Deserialize, Serialize};

use crate::errors::{WalletError, WalletResult};

/// Worst-case DER signature size including the sighash byte, assuming low-S.
pub const SIGNATURE_SIZE: usize = 72;
/// Compressed public key size.
pub const PUBKEY_SIZE: usize = 33;
/// Taproot key-path signature size with the default sighash.
pub const SCHNORR_SIGNATURE_SIZE: usize = 64;

/// Size of the serialized varint encoding `n`.
pub fn var_int_size(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// `<sig> <pubkey>` segwit v0 witness, with element count and length prefixes.
pub const fn witness_v0_size() -> usize {
    // varint(2) + varint(72) + 72 + varint(33) + 33
    1 + 1 + SIGNATURE_SIZE + 1 + PUBKEY_SIZE
}

pub(crate) fn secp() -> &'static Secp256k1<VerifyOnly> {
    static SECP: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::verification_only)
}

/// A signature produced by a keystore for one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSignature {
    Ecdsa(ecdsa::Signature),
    Schnorr(taproot::Signature),
}

/// Behaviour that varies per script type.
pub trait ScriptCapability: Send + Sync {
    /// Output script paying to `public_key`.
    fn pk_script(&self, public_key: &PublicKey) -> ScriptBuf;

    /// Maximum (sigScript size, witness size) needed to spend an output of this type.
    /// A witness size of 0 means the input carries no witness.
    fn sig_script_witness_size(&self) -> (usize, usize);

    /// Assembles the sigScript and witness from a signature.
    fn signature_script(
        &self,
        public_key: &PublicKey,
        signature: &InputSignature,
    ) -> WalletResult<(ScriptBuf, Witness)>;
}

fn expect_ecdsa(signature: &InputSignature) -> WalletResult<&ecdsa::Signature> {
    match signature {
        InputSignature::Ecdsa(sig) => Ok(sig),
        InputSignature::Schnorr(_) => Err(WalletError::invalid_argument(
            "signature",
            "expected an ECDSA signature",
        )),
    }
}

fn v0_witness(public_key: &PublicKey, sig: &ecdsa::Signature) -> Witness {
    let mut witness = Witness::new();
    witness.push(sig.to_vec());
    witness.push(public_key.serialize());
    witness
}

fn push_bytes(bytes: Vec<u8>) -> WalletResult<PushBytesBuf> {
    PushBytesBuf::try_from(bytes)
        .map_err(|e| WalletError::InternalError(format!("push exceeds script limits: {e}")))
}

/// Pay-to-pubkey-hash.
pub struct P2pkh;
/// Pay-to-witness-pubkey-hash nested in pay-to-script-hash.
pub struct P2wpkhP2sh;
/// Native pay-to-witness-pubkey-hash.
pub struct P2wpkh;
/// Taproot key-path (BIP86) output.
pub struct P2tr;

impl ScriptCapability for P2pkh {
    fn pk_script(&self, public_key: &PublicKey) -> ScriptBuf {
        ScriptBuf::new_p2pkh(&CompressedPublicKey(*public_key).pubkey_hash())
    }

    fn sig_script_witness_size(&self) -> (usize, usize) {
        // OP_DATA_72 <sig> OP_DATA_33 <pubkey>
        (1 + SIGNATURE_SIZE + 1 + PUBKEY_SIZE, 0)
    }

    fn signature_script(
        &self,
        public_key: &PublicKey,
        signature: &InputSignature,
    ) -> WalletResult<(ScriptBuf, Witness)> {
        let sig = expect_ecdsa(signature)?;
        let script = Builder::new()
            .push_slice(push_bytes(sig.to_vec())?)
            .push_key(&bitcoin::PublicKey::new(*public_key))
            .into_script();
        Ok((script, Witness::new()))
    }
}

impl P2wpkhP2sh {
    fn redeem_script(public_key: &PublicKey) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&CompressedPublicKey(*public_key).wpubkey_hash())
    }
}

impl ScriptCapability for P2wpkhP2sh {
    fn pk_script(&self, public_key: &PublicKey) -> ScriptBuf {
        let redeem = Self::redeem_script(public_key);
        ScriptBuf::new_p2sh(&ScriptHash::hash(redeem.as_bytes()))
    }

    fn sig_script_witness_size(&self) -> (usize, usize) {
        // OP_DATA_22 <OP_0 OP_DATA_20 pubkeyhash>
        const REDEEM_SCRIPT_SIZE: usize = 1 + 1 + 20;
        (1 + REDEEM_SCRIPT_SIZE, witness_v0_size())
    }

    fn signature_script(
        &self,
        public_key: &PublicKey,
        signature: &InputSignature,
    ) -> WalletResult<(ScriptBuf, Witness)> {
        let sig = expect_ecdsa(signature)?;
        let redeem = Self::redeem_script(public_key);
        let script = Builder::new()
            .push_slice(push_bytes(redeem.to_bytes())?)
            .into_script();
        Ok((script, v0_witness(public_key, sig)))
    }
}

impl ScriptCapability for P2wpkh {
    fn pk_script(&self, public_key: &PublicKey) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&CompressedPublicKey(*public_key).wpubkey_hash())
    }

    fn sig_script_witness_size(&self) -> (usize, usize) {
        (0, witness_v0_size())
    }

    fn signature_script(
        &self,
        public_key: &PublicKey,
        signature: &InputSignature,
    ) -> WalletResult<(ScriptBuf, Witness)> {
        let sig = expect_ecdsa(signature)?;
        Ok((ScriptBuf::new(), v0_witness(public_key, sig)))
    }
}

impl ScriptCapability for P2tr {
    fn pk_script(&self, public_key: &PublicKey) -> ScriptBuf {
        let (internal_key, _parity) = public_key.x_only_public_key();
        ScriptBuf::new_p2tr(secp(), internal_key, None)
    }

    fn sig_script_witness_size(&self) -> (usize, usize) {
        // varint(1) + varint(64) + 64
        (0, 1 + 1 + SCHNORR_SIGNATURE_SIZE)
    }

    fn signature_script(
        &self,
        _public_key: &PublicKey,
        signature: &InputSignature,
    ) -> WalletResult<(ScriptBuf, Witness)> {
        let sig = match signature {
            InputSignature::Schnorr(sig) => sig,
            InputSignature::Ecdsa(_) => {
                return Err(WalletError::invalid_argument(
                    "signature",
                    "expected a Schnorr signature",
                ))
            }
        };
        let mut witness = Witness::new();
        witness.push(sig.to_vec());
        Ok((ScriptBuf::new(), witness))
    }
}

/// Script type of a single-signature account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptType {
    P2pkh,
    P2wpkhP2sh,
    P2wpkh,
    P2tr,
}

impl ScriptType {
    pub const ALL: [ScriptType; 4] = [
        ScriptType::P2pkh,
        ScriptType::P2wpkhP2sh,
        ScriptType::P2wpkh,
        ScriptType::P2tr,
    ];

    /// The capability implementation for this script type.
    pub fn capability(&self) -> &'static dyn ScriptCapability {
        match self {
            ScriptType::P2pkh => &P2pkh,
            ScriptType::P2wpkhP2sh => &P2wpkhP2sh,
            ScriptType::P2wpkh => &P2wpkh,
            ScriptType::P2tr => &P2tr,
        }
    }

    pub fn pk_script(&self, public_key: &PublicKey) -> ScriptBuf {
        self.capability().pk_script(public_key)
    }

    pub fn sig_script_witness_size(&self) -> (usize, usize) {
        self.capability().sig_script_witness_size()
    }

    pub fn signature_script(
        &self,
        public_key: &PublicKey,
        signature: &InputSignature,
    ) -> WalletResult<(ScriptBuf, Witness)> {
        self.capability().signature_script(public_key, signature)
    }

    /// Whether spending this script type produces a witness.
    pub fn has_witness(&self) -> bool {
        self.sig_script_witness_size().1 > 0
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2wpkhP2sh => "p2wpkh-p2sh",
            ScriptType::P2wpkh => "p2wpkh",
            ScriptType::P2tr => "p2tr",
        }
    }
}

impl Display for ScriptType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScriptType::ALL
            .into_iter()
            .find(|script_type| script_type.as_str() == s)
            .ok_or_else(|| WalletError::invalid_argument("script_type", format!("unknown: {s}")))
    }
}
