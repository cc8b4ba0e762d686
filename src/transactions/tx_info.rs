//! Display types computed from the transaction index

use bitcoin::{Address, Network, OutPoint, Script, Transaction, TxOut, Txid};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::data_structures::ScriptHashHex;
use crate::errors::WalletResult;
use crate::storage::DbTx;

/// Shown for outputs whose script has no address form.
pub const UNKNOWN_ADDRESS: &str = "<unknown address>";

pub(crate) fn output_address(pk_script: &Script, network: Network) -> String {
    Address::from_script(pk_script, network)
        .map(|address| address.to_string())
        .unwrap_or_else(|_| UNKNOWN_ADDRESS.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TxType {
    Receive,
    Send,
    SendSelf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressAndAmount {
    pub address: String,
    pub amount: u64,
    /// Whether the output pays this account.
    pub ours: bool,
}

/// Balance split by spendability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub available: u64,
    /// Unconfirmed funds from others.
    pub incoming: u64,
}

/// An unspent output the account may spend right away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendableOutput {
    #[serde(serialize_with = "serialize_display")]
    pub outpoint: OutPoint,
    #[serde(skip)]
    pub txout: TxOut,
    pub value: u64,
    pub address: String,
    pub script_hash: ScriptHashHex,
}

impl SpendableOutput {
    pub fn new(outpoint: OutPoint, txout: TxOut, network: Network) -> Self {
        Self {
            outpoint,
            value: txout.value.to_sat(),
            address: output_address(&txout.script_pubkey, network),
            script_hash: ScriptHashHex::from_script(&txout.script_pubkey),
            txout,
        }
    }
}

fn serialize_display<T: std::fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// An indexed transaction with everything a user interface shows about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInfo {
    #[serde(serialize_with = "serialize_display")]
    pub txid: Txid,
    #[serde(skip)]
    pub tx: Transaction,
    pub tx_type: TxType,
    /// Net amount as seen by the account. Negative only for unusual receives that also spend
    /// some of our coins.
    pub amount: i64,
    /// Known only if all inputs are ours.
    pub fee: Option<u64>,
    pub fee_rate_per_kb: Option<u64>,
    pub size: u64,
    pub vsize: u64,
    pub weight: u64,
    /// 0 or -1 while unconfirmed.
    pub height: i32,
    pub num_confirmations: u32,
    /// Recipients of a send, or our receive addresses of a receive.
    pub addresses: Vec<AddressAndAmount>,
    pub header_timestamp: Option<DateTime<Utc>>,
    pub created_timestamp: Option<DateTime<Utc>>,
    pub verified: bool,
}

impl TxInfo {
    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }
}

/// Whether every input of `tx` spends an output of this account.
pub(crate) fn all_inputs_ours(db_tx: &DbTx<'_>, tx: &Transaction) -> WalletResult<bool> {
    for input in &tx.input {
        if db_tx.output(&input.previous_output)?.is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Classifies `tx` relative to the account.
pub(crate) fn classify(
    db_tx: &DbTx<'_>,
    tx: &Transaction,
    txid: Txid,
    is_change: &dyn Fn(&ScriptHashHex) -> bool,
    network: Network,
) -> WalletResult<(TxType, i64, Option<u64>, Vec<AddressAndAmount>)> {
    let mut sum_our_inputs: u64 = 0;
    let mut all_inputs_ours = true;
    for input in &tx.input {
        match db_tx.output(&input.previous_output)? {
            Some(spent) => sum_our_inputs += spent.value.to_sat(),
            None => all_inputs_ours = false,
        }
    }

    let mut sum_all_outputs: u64 = 0;
    let mut sum_our_receive: u64 = 0;
    let mut sum_our_change: u64 = 0;
    let mut all_outputs_ours = true;
    let mut receive_addresses = Vec::new();
    let mut send_addresses = Vec::new();
    for (vout, output) in tx.output.iter().enumerate() {
        let value = output.value.to_sat();
        sum_all_outputs += value;
        let outpoint = OutPoint::new(txid, vout as u32);
        let ours = db_tx.output(&outpoint)?;
        let entry = AddressAndAmount {
            address: output_address(&output.script_pubkey, network),
            amount: value,
            ours: ours.is_some(),
        };
        match ours {
            Some(our_output) => {
                if is_change(&ScriptHashHex::from_script(&our_output.script_pubkey)) {
                    sum_our_change += value;
                } else {
                    sum_our_receive += value;
                    receive_addresses.push(entry.clone());
                    send_addresses.push(entry);
                }
            }
            None => {
                all_outputs_ours = false;
                send_addresses.push(entry);
            }
        }
    }

    if all_inputs_ours {
        let fee = sum_our_inputs.saturating_sub(sum_all_outputs);
        if all_outputs_ours {
            Ok((
                TxType::SendSelf,
                sum_our_receive as i64,
                Some(fee),
                send_addresses,
            ))
        } else {
            let amount = sum_all_outputs as i64 - sum_our_receive as i64 - sum_our_change as i64;
            Ok((TxType::Send, amount, Some(fee), send_addresses))
        }
    } else {
        let amount = sum_our_receive as i64 + sum_our_change as i64 - sum_our_inputs as i64;
        Ok((TxType::Receive, amount, None, receive_addresses))
    }
}
