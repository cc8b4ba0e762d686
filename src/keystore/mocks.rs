//! Software keystore for tests
//!
//! Without a private key [`MockKeystore`] returns well-formed dummy signatures, which is
//! enough to exercise the send flow against a [`crate::blockchain::mocks::MockBlockchain`].
//! With an account xpriv it produces real signatures.

use async_trait::async_trait;
use bitcoin::bip32::Xpriv;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{ecdsa, schnorr, Keypair, Secp256k1};
use bitcoin::sighash::TapSighashType;
use bitcoin::taproot;
use parking_lot::Mutex;

use super::{Keystore, ProposedTransaction};
use crate::addresses::AccountAddress;
use crate::data_structures::{InputSignature, ScriptType};
use crate::errors::{WalletError, WalletResult};

#[derive(Debug, Default)]
struct MockKeystoreState {
    abort: bool,
    cannot_verify_address: bool,
    proposals: Vec<ProposedTransaction>,
    verified_addresses: Vec<String>,
}

/// Mock [`Keystore`] implementation.
#[derive(Debug, Default)]
pub struct MockKeystore {
    account_xpriv: Option<Xpriv>,
    state: Mutex<MockKeystoreState>,
}

fn dummy_signature(script_type: ScriptType) -> WalletResult<InputSignature> {
    let invalid = |e: bitcoin::secp256k1::Error| WalletError::InternalError(e.to_string());
    Ok(match script_type {
        ScriptType::P2tr => InputSignature::Schnorr(taproot::Signature {
            signature: schnorr::Signature::from_slice(&[1u8; 64]).map_err(invalid)?,
            sighash_type: TapSighashType::Default,
        }),
        _ => InputSignature::Ecdsa(bitcoin::ecdsa::Signature::sighash_all(
            ecdsa::Signature::from_compact(&[1u8; 64]).map_err(invalid)?,
        )),
    })
}

impl MockKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A keystore signing with the private key of the account xpub.
    pub fn with_xpriv(account_xpriv: Xpriv) -> Self {
        Self {
            account_xpriv: Some(account_xpriv),
            ..Self::default()
        }
    }

    /// Makes the user decline every following signing request.
    pub fn set_abort(&self, abort: bool) {
        self.state.lock().abort = abort;
    }

    pub fn set_can_verify_address(&self, can_verify: bool) {
        self.state.lock().cannot_verify_address = !can_verify;
    }

    /// Every transaction passed to `sign_transaction`, including declined ones.
    pub fn proposals(&self) -> Vec<ProposedTransaction> {
        self.state.lock().proposals.clone()
    }

    pub fn verified_addresses(&self) -> Vec<String> {
        self.state.lock().verified_addresses.clone()
    }

    fn sign_with(
        xpriv: &Xpriv,
        proposed: &ProposedTransaction,
    ) -> WalletResult<Vec<InputSignature>> {
        let secp = Secp256k1::new();
        let messages = proposed.sighashes()?;
        let mut signatures = Vec::with_capacity(messages.len());
        for (input, message) in proposed.transaction().input.iter().zip(messages) {
            let address = proposed
                .input_address(&input.previous_output)
                .ok_or_else(|| WalletError::InternalError("unknown input".to_string()))?;
            let child = xpriv.derive_priv(&secp, &address.derivation.relative_path())?;
            let signature = match address.script_type {
                ScriptType::P2tr => {
                    let keypair = Keypair::from_secret_key(&secp, &child.private_key)
                        .tap_tweak(&secp, None)
                        .to_keypair();
                    InputSignature::Schnorr(taproot::Signature {
                        signature: secp.sign_schnorr_no_aux_rand(&message, &keypair),
                        sighash_type: TapSighashType::Default,
                    })
                }
                _ => InputSignature::Ecdsa(bitcoin::ecdsa::Signature::sighash_all(
                    secp.sign_ecdsa(&message, &child.private_key),
                )),
            };
            signatures.push(signature);
        }
        Ok(signatures)
    }
}

#[async_trait]
impl Keystore for MockKeystore {
    fn can_verify_address(&self) -> bool {
        !self.state.lock().cannot_verify_address
    }

    async fn verify_address(&self, address: &AccountAddress) -> WalletResult<()> {
        self.state
            .lock()
            .verified_addresses
            .push(address.encode());
        Ok(())
    }

    async fn sign_transaction(
        &self,
        proposed: &ProposedTransaction,
    ) -> WalletResult<Vec<InputSignature>> {
        let abort = {
            let mut state = self.state.lock();
            state.proposals.push(proposed.clone());
            state.abort
        };
        if abort {
            return Err(WalletError::UserAborted);
        }
        match &self.account_xpriv {
            Some(xpriv) => Self::sign_with(xpriv, proposed),
            None => proposed
                .transaction()
                .input
                .iter()
                .map(|input| {
                    let script_type = proposed
                        .input_address(&input.previous_output)
                        .map(|address| address.script_type)
                        .unwrap_or(ScriptType::P2wpkh);
                    dummy_signature(script_type)
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::AddressChain;
    use crate::maketx::{new_tx, TxProposal, Utxo};
    use bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, Network, OutPoint, TxOut, Txid};
    use std::collections::HashMap;
    use std::str::FromStr;

    fn account(script_type: ScriptType) -> (Xpriv, Vec<AccountAddress>) {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(Network::Regtest, &[7u8; 32]).unwrap();
        let keypath = DerivationPath::from_str("m/84'/1'/0'").unwrap();
        let account_xpriv = master.derive_priv(&secp, &keypath).unwrap();
        let xpub = Xpub::from_priv(&secp, &account_xpriv);
        let mut chain = AddressChain::new(xpub, keypath, script_type, Network::Regtest, 3, false);
        (account_xpriv, chain.ensure_addresses().unwrap())
    }

    fn tx_proposal(addresses: &[AccountAddress]) -> TxProposal {
        let utxos: HashMap<OutPoint, Utxo> = (0..2)
            .map(|i| {
                (
                    OutPoint::new(Txid::hash(b"funding"), i),
                    Utxo {
                        txout: TxOut {
                            value: Amount::from_sat(50_000),
                            script_pubkey: addresses[1].pk_script().clone(),
                        },
                        address: addresses[1].clone(),
                    },
                )
            })
            .collect();
        new_tx(
            &utxos,
            addresses[2].pk_script(),
            70_000,
            1000,
            &addresses[0],
            false,
        )
        .unwrap()
    }

    fn proposal(addresses: &[AccountAddress]) -> ProposedTransaction {
        ProposedTransaction::new(tx_proposal(addresses), Fingerprint::default(), |_| Ok(None))
            .unwrap()
    }

    #[tokio::test]
    async fn test_signs_segwit_inputs() {
        let (xpriv, addresses) = account(ScriptType::P2wpkh);
        let proposed = proposal(&addresses);
        assert_eq!(proposed.psbt.inputs.len(), 2);
        assert!(proposed.psbt.inputs[0].witness_utxo.is_some());
        assert_eq!(proposed.psbt.inputs[0].bip32_derivation.len(), 1);

        let keystore = MockKeystore::with_xpriv(xpriv);
        let signatures = keystore.sign_transaction(&proposed).await.unwrap();
        let messages = proposed.sighashes().unwrap();
        let secp = Secp256k1::verification_only();
        for (signature, message) in signatures.iter().zip(&messages) {
            match signature {
                InputSignature::Ecdsa(sig) => secp
                    .verify_ecdsa(message, &sig.signature, addresses[1].public_key())
                    .unwrap(),
                InputSignature::Schnorr(_) => panic!("expected ECDSA"),
            }
        }

        let signed = proposed.finalize(&signatures).unwrap();
        for input in &signed.input {
            assert!(input.script_sig.is_empty());
            assert_eq!(input.witness.len(), 2);
        }
        assert_eq!(keystore.proposals().len(), 1);
    }

    #[tokio::test]
    async fn test_signs_taproot_inputs() {
        let (xpriv, addresses) = account(ScriptType::P2tr);
        let proposed = proposal(&addresses);
        assert!(proposed.psbt.inputs[0].tap_internal_key.is_some());

        let keystore = MockKeystore::with_xpriv(xpriv);
        let signatures = keystore.sign_transaction(&proposed).await.unwrap();
        let messages = proposed.sighashes().unwrap();
        let secp = Secp256k1::verification_only();
        let (internal_key, _) = addresses[1].public_key().x_only_public_key();
        let (output_key, _) = internal_key.tap_tweak(&secp, None);
        for (signature, message) in signatures.iter().zip(&messages) {
            match signature {
                InputSignature::Schnorr(sig) => secp
                    .verify_schnorr(&sig.signature, message, &output_key.to_x_only_public_key())
                    .unwrap(),
                InputSignature::Ecdsa(_) => panic!("expected Schnorr"),
            }
        }
        let signed = proposed.finalize(&signatures).unwrap();
        assert_eq!(signed.input[0].witness.len(), 1);
    }

    #[test]
    fn test_legacy_previous_tx_lookup_errors_are_returned() {
        let (_, addresses) = account(ScriptType::P2pkh);
        let result = ProposedTransaction::new(
            tx_proposal(&addresses),
            Fingerprint::default(),
            |_| Err(WalletError::StorageError("database is locked".to_string())),
        );
        assert!(matches!(result, Err(WalletError::StorageError(_))));

        let proposed =
            ProposedTransaction::new(tx_proposal(&addresses), Fingerprint::default(), |_| Ok(None))
                .unwrap();
        assert!(proposed.psbt.inputs[0].non_witness_utxo.is_none());
        assert_eq!(proposed.psbt.inputs[0].bip32_derivation.len(), 1);
    }

    #[tokio::test]
    async fn test_abort_and_dummy_signatures() {
        let (_, addresses) = account(ScriptType::P2wpkhP2sh);
        let proposed = proposal(&addresses);
        assert!(proposed.psbt.inputs[0].redeem_script.is_some());

        let keystore = MockKeystore::new();
        keystore.set_abort(true);
        assert!(matches!(
            keystore.sign_transaction(&proposed).await,
            Err(WalletError::UserAborted)
        ));
        keystore.set_abort(false);
        let signatures = keystore.sign_transaction(&proposed).await.unwrap();
        let signed = proposed.finalize(&signatures).unwrap();
        assert!(!signed.input[0].script_sig.is_empty());
        assert_eq!(keystore.proposals().len(), 2);

        assert!(proposed.finalize(&signatures[..1]).is_err());
    }
}
