//! Signing devices
//!
//! The engine never touches private keys. A [`Keystore`] receives a [`ProposedTransaction`],
//! asks its user for confirmation and returns one signature per input. The account then
//! inserts sigScripts and witnesses with [`ProposedTransaction::finalize`].

pub mod mocks;

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::bip32::Fingerprint;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::Message;
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::{OutPoint, Transaction, TxOut, Txid};

use crate::addresses::AccountAddress;
use crate::data_structures::{InputSignature, ScriptType};
use crate::errors::{WalletError, WalletResult};
use crate::maketx::TxProposal;

/// A transaction waiting for signatures, with everything a signer needs to display and sign it.
#[derive(Debug, Clone)]
pub struct ProposedTransaction {
    pub proposal: TxProposal,
    /// The unsigned transaction with previous outputs and key origins filled in.
    pub psbt: Psbt,
    pub root_fingerprint: Fingerprint,
}

fn internal(context: &str, e: impl std::fmt::Display) -> WalletError {
    WalletError::InternalError(format!("{context}: {e}"))
}

impl ProposedTransaction {
    /// Builds the PSBT of `proposal`. `previous_tx` resolves the full previous transaction of
    /// legacy inputs; inputs whose previous transaction is unknown carry only the spent output.
    /// Lookup errors are returned.
    pub fn new(
        proposal: TxProposal,
        root_fingerprint: Fingerprint,
        previous_tx: impl Fn(&Txid) -> WalletResult<Option<Transaction>>,
    ) -> WalletResult<Self> {
        let mut psbt = Psbt::from_unsigned_tx(proposal.transaction.clone())
            .map_err(|e| internal("invalid unsigned transaction", e))?;
        for (input, psbt_input) in proposal.transaction.input.iter().zip(psbt.inputs.iter_mut()) {
            let utxo = proposal
                .previous_outputs
                .get(&input.previous_output)
                .ok_or_else(|| {
                    WalletError::InternalError(format!(
                        "missing previous output {}",
                        input.previous_output
                    ))
                })?;
            let address = &utxo.address;
            let key_source = (root_fingerprint, address.keypath.clone());
            match address.script_type {
                ScriptType::P2pkh => {
                    psbt_input.non_witness_utxo = previous_tx(&input.previous_output.txid)?;
                    psbt_input
                        .bip32_derivation
                        .insert(*address.public_key(), key_source);
                }
                ScriptType::P2wpkhP2sh | ScriptType::P2wpkh => {
                    psbt_input.witness_utxo = Some(utxo.txout.clone());
                    psbt_input.redeem_script = address.redeem_script();
                    psbt_input
                        .bip32_derivation
                        .insert(*address.public_key(), key_source);
                }
                ScriptType::P2tr => {
                    let (internal_key, _) = address.public_key().x_only_public_key();
                    psbt_input.witness_utxo = Some(utxo.txout.clone());
                    psbt_input.tap_internal_key = Some(internal_key);
                    psbt_input
                        .tap_key_origins
                        .insert(internal_key, (Vec::new(), key_source));
                }
            }
        }
        Ok(Self {
            proposal,
            psbt,
            root_fingerprint,
        })
    }

    pub fn transaction(&self) -> &Transaction {
        &self.proposal.transaction
    }

    /// The account address spent by `outpoint`.
    pub fn input_address(&self, outpoint: &OutPoint) -> Option<&AccountAddress> {
        self.proposal
            .previous_outputs
            .get(outpoint)
            .map(|utxo| &utxo.address)
    }

    fn spent_outputs(&self) -> WalletResult<Vec<(TxOut, &AccountAddress)>> {
        self.transaction()
            .input
            .iter()
            .map(|input| {
                self.proposal
                    .previous_outputs
                    .get(&input.previous_output)
                    .map(|utxo| (utxo.txout.clone(), &utxo.address))
                    .ok_or_else(|| {
                        WalletError::InternalError(format!(
                            "missing previous output {}",
                            input.previous_output
                        ))
                    })
            })
            .collect()
    }

    /// The message each input signature commits to: SIGHASH_ALL for ECDSA inputs and the
    /// default sighash for taproot key spends.
    pub fn sighashes(&self) -> WalletResult<Vec<Message>> {
        let spent = self.spent_outputs()?;
        let prevouts: Vec<TxOut> = spent.iter().map(|(txout, _)| txout.clone()).collect();
        let mut cache = SighashCache::new(self.transaction());
        let mut messages = Vec::with_capacity(spent.len());
        for (index, (txout, address)) in spent.iter().enumerate() {
            let digest = match address.script_type {
                ScriptType::P2pkh => cache
                    .legacy_signature_hash(
                        index,
                        &txout.script_pubkey,
                        EcdsaSighashType::All.to_u32(),
                    )
                    .map_err(|e| internal("legacy sighash", e))?
                    .to_byte_array(),
                ScriptType::P2wpkhP2sh | ScriptType::P2wpkh => {
                    let witness_program = address
                        .redeem_script()
                        .unwrap_or_else(|| txout.script_pubkey.clone());
                    cache
                        .p2wpkh_signature_hash(
                            index,
                            &witness_program,
                            txout.value,
                            EcdsaSighashType::All,
                        )
                        .map_err(|e| internal("segwit sighash", e))?
                        .to_byte_array()
                }
                ScriptType::P2tr => cache
                    .taproot_key_spend_signature_hash(
                        index,
                        &Prevouts::All(&prevouts),
                        TapSighashType::Default,
                    )
                    .map_err(|e| internal("taproot sighash", e))?
                    .to_byte_array(),
            };
            messages.push(Message::from_digest(digest));
        }
        Ok(messages)
    }

    /// The transaction with sigScripts and witnesses built from `signatures`, one per input in
    /// input order.
    pub fn finalize(&self, signatures: &[InputSignature]) -> WalletResult<Transaction> {
        let mut tx = self.transaction().clone();
        if signatures.len() != tx.input.len() {
            return Err(WalletError::invalid_argument(
                "signatures",
                format!(
                    "expected {} signatures, got {}",
                    tx.input.len(),
                    signatures.len()
                ),
            ));
        }
        let addresses: HashMap<OutPoint, &AccountAddress> = self
            .proposal
            .previous_outputs
            .iter()
            .map(|(outpoint, utxo)| (*outpoint, &utxo.address))
            .collect();
        for (input, signature) in tx.input.iter_mut().zip(signatures) {
            let address = addresses.get(&input.previous_output).ok_or_else(|| {
                WalletError::InternalError(format!(
                    "missing previous output {}",
                    input.previous_output
                ))
            })?;
            let (script_sig, witness) = address.signature_script(signature)?;
            input.script_sig = script_sig;
            input.witness = witness;
        }
        Ok(tx)
    }
}

/// A device or service holding the private keys of an account.
#[async_trait]
pub trait Keystore: Send + Sync {
    /// Whether the keystore can display an address for the user to compare.
    fn can_verify_address(&self) -> bool;

    /// Shows `address` on the device.
    async fn verify_address(&self, address: &AccountAddress) -> WalletResult<()>;

    /// Signs every input of `proposed`. Returns [`WalletError::UserAborted`] if the user
    /// declines.
    async fn sign_transaction(
        &self,
        proposed: &ProposedTransaction,
    ) -> WalletResult<Vec<InputSignature>>;
}
