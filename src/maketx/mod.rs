//! Coin selection and unsigned transaction construction
//!
//! [`new_tx`] selects coins largest first until amount and fee are covered, where the fee
//! itself depends on the number of selected inputs. Change that would be dust is added to the
//! fee instead. [`new_tx_spend_all`] sweeps every coin into a single output.
//!
//! Inputs and outputs of the result are BIP69-sorted.

pub mod txsize;

use std::cmp::Ordering;
use std::collections::HashMap;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use tracing::{debug, info};

pub use txsize::{estimate_tx_size, fee_for_serialize_size, is_dust_amount};

use crate::addresses::AccountAddress;
use crate::data_structures::{ScriptHashHex, ScriptType};
use crate::errors::{TxValidationError, WalletError, WalletResult};

/// A coin that can be spent, with the account address it pays to.
#[derive(Debug, Clone)]
pub struct Utxo {
    pub txout: TxOut,
    pub address: AccountAddress,
}

/// An unsigned transaction ready to be shown to the user and signed.
#[derive(Debug, Clone)]
pub struct TxProposal {
    /// Value of the recipient output, fee excluded.
    pub amount: u64,
    pub fee: u64,
    pub transaction: Transaction,
    /// Index of the recipient output.
    pub out_index: usize,
    /// Set if the transaction has a change output.
    pub change_address: Option<AccountAddress>,
    /// Outputs spent by the transaction, for signing.
    pub previous_outputs: HashMap<OutPoint, Utxo>,
}

impl TxProposal {
    pub fn total(&self) -> u64 {
        self.amount + self.fee
    }
}

fn insufficient_funds() -> WalletError {
    WalletError::TxValidation(TxValidationError::InsufficientFunds)
}

fn sequence(rbf: bool) -> Sequence {
    if rbf {
        Sequence::ENABLE_RBF_NO_LOCKTIME
    } else {
        Sequence::MAX
    }
}

fn reversed(txid: &Txid) -> [u8; 32] {
    let mut bytes = txid.to_byte_array();
    bytes.reverse();
    bytes
}

/// Sorts inputs by previous outpoint and outputs by value, then script (BIP69).
pub fn bip69_sort(tx: &mut Transaction) {
    tx.input.sort_by(|a, b| {
        reversed(&a.previous_output.txid)
            .cmp(&reversed(&b.previous_output.txid))
            .then(a.previous_output.vout.cmp(&b.previous_output.vout))
    });
    tx.output.sort_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
    });
}

/// Largest first. Equal values are ordered by scripthash, then outpoint, so selection is
/// deterministic.
fn by_value_descending(
    utxos: &HashMap<OutPoint, Utxo>,
) -> Vec<OutPoint> {
    let mut outpoints: Vec<OutPoint> = utxos.keys().copied().collect();
    outpoints.sort_by(|a, b| {
        let (ua, ub) = (&utxos[a], &utxos[b]);
        match ub.txout.value.cmp(&ua.txout.value) {
            Ordering::Equal => ScriptHashHex::from_script(&ub.txout.script_pubkey)
                .cmp(&ScriptHashHex::from_script(&ua.txout.script_pubkey))
                .then_with(|| b.cmp(a)),
            other => other,
        }
    });
    outpoints
}

fn coin_selection(
    min_amount: u64,
    utxos: &HashMap<OutPoint, Utxo>,
) -> WalletResult<(u64, Vec<OutPoint>)> {
    let mut sum: u64 = 0;
    let mut selected = Vec::new();
    for outpoint in by_value_descending(utxos) {
        if sum >= min_amount {
            break;
        }
        sum += utxos[&outpoint].txout.value.to_sat();
        selected.push(outpoint);
    }
    if sum < min_amount {
        return Err(insufficient_funds());
    }
    Ok((sum, selected))
}

fn unsigned_tx(outpoints: &[OutPoint], outputs: Vec<TxOut>, rbf: bool) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: outpoints
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: sequence(rbf),
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

fn previous_outputs(
    utxos: &HashMap<OutPoint, Utxo>,
    outpoints: &[OutPoint],
) -> HashMap<OutPoint, Utxo> {
    outpoints
        .iter()
        .filter_map(|outpoint| utxos.get(outpoint).map(|utxo| (*outpoint, utxo.clone())))
        .collect()
}

fn input_script_types(utxos: &HashMap<OutPoint, Utxo>, outpoints: &[OutPoint]) -> Vec<ScriptType> {
    outpoints
        .iter()
        .filter_map(|outpoint| utxos.get(outpoint))
        .map(|utxo| utxo.address.script_type)
        .collect()
}

fn find_output(tx: &Transaction, output: &TxOut) -> usize {
    tx.output
        .iter()
        .position(|candidate| candidate == output)
        .unwrap_or(0)
}

/// Spends every coin in `utxos` to `output_pk_script`, paying the fee out of the output.
pub fn new_tx_spend_all(
    utxos: &HashMap<OutPoint, Utxo>,
    output_pk_script: &ScriptBuf,
    fee_per_kb: u64,
    rbf: bool,
) -> WalletResult<TxProposal> {
    let outpoints: Vec<OutPoint> = utxos.keys().copied().collect();
    let sum: u64 = utxos.values().map(|utxo| utxo.txout.value.to_sat()).sum();
    let vsize = estimate_tx_size(
        &input_script_types(utxos, &outpoints),
        output_pk_script.len(),
        0,
    );
    let fee = fee_for_serialize_size(fee_per_kb, vsize);
    if sum <= fee {
        return Err(insufficient_funds());
    }
    let output = TxOut {
        value: Amount::from_sat(sum - fee),
        script_pubkey: output_pk_script.clone(),
    };
    let mut transaction = unsigned_tx(&outpoints, vec![output.clone()], rbf);
    bip69_sort(&mut transaction);
    debug!(fee, inputs = outpoints.len(), "prepared transaction spending all coins");
    Ok(TxProposal {
        amount: sum - fee,
        fee,
        out_index: find_output(&transaction, &output),
        transaction,
        change_address: None,
        previous_outputs: previous_outputs(utxos, &outpoints),
    })
}

/// Pays `amount` to `output_pk_script` from a subset of `utxos`, sending change to
/// `change_address` unless it would be dust.
pub fn new_tx(
    utxos: &HashMap<OutPoint, Utxo>,
    output_pk_script: &ScriptBuf,
    amount: u64,
    fee_per_kb: u64,
    change_address: &AccountAddress,
    rbf: bool,
) -> WalletResult<TxProposal> {
    if amount == 0 {
        return Err(WalletError::TxValidation(TxValidationError::InvalidAmount));
    }
    let change_pk_script = change_address.pk_script();
    let mut target_fee = fee_for_serialize_size(
        fee_per_kb,
        estimate_tx_size(
            &[change_address.script_type],
            output_pk_script.len(),
            change_pk_script.len(),
        ),
    );
    loop {
        let min_amount = amount.checked_add(target_fee).ok_or_else(insufficient_funds)?;
        let (selected_sum, selected) = coin_selection(min_amount, utxos)?;
        let vsize = estimate_tx_size(
            &input_script_types(utxos, &selected),
            output_pk_script.len(),
            change_pk_script.len(),
        );
        let max_required_fee = fee_for_serialize_size(fee_per_kb, vsize);
        if selected_sum - amount < max_required_fee {
            target_fee = max_required_fee;
            continue;
        }

        let recipient = TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: output_pk_script.clone(),
        };
        let mut outputs = vec![recipient.clone()];
        let change = selected_sum - amount - max_required_fee;
        let change_is_dust = is_dust_amount(
            change,
            change_pk_script.len(),
            change_address.script_type,
            fee_per_kb,
        );
        let mut final_fee = max_required_fee;
        let mut used_change_address = None;
        if change_is_dust {
            info!(change, "change is dust, adding it to the fee");
            final_fee = selected_sum - amount;
        } else if change != 0 {
            outputs.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: change_pk_script.clone(),
            });
            used_change_address = Some(change_address.clone());
        }

        let mut transaction = unsigned_tx(&selected, outputs, rbf);
        bip69_sort(&mut transaction);
        debug!(fee = final_fee, inputs = selected.len(), "prepared transaction");
        return Ok(TxProposal {
            amount,
            fee: final_fee,
            out_index: find_output(&transaction, &recipient),
            transaction,
            change_address: used_change_address,
            previous_outputs: previous_outputs(utxos, &selected),
        });
    }
}
