//! Worst-case virtual size estimates for unsigned transactions

use crate::data_structures::{var_int_size, ScriptType};

const VERSION_SIZE: usize = 4;
const LOCK_TIME_SIZE: usize = 4;
/// Weight factor of non-witness data.
const NON_WITNESS: usize = 4;

/// No single output may carry more than all bitcoin in existence.
pub const MAX_FEE: u64 = 21_000_000 * 100_000_000;

fn input_size(sig_script_size: usize) -> usize {
    // prev hash + prev index + sigScript + sequence
    32 + 4 + var_int_size(sig_script_size as u64) + sig_script_size + 4
}

/// Serialized size of an output with a pk-script of the given size. 0 for no output.
pub fn output_size(pk_script_size: usize) -> usize {
    if pk_script_size == 0 {
        return 0;
    }
    8 + var_int_size(pk_script_size as u64) + pk_script_size
}

/// Virtual size of one input spending `script_type`.
pub fn input_vsize(script_type: ScriptType) -> usize {
    let (sig_script_size, witness_size) = script_type.sig_script_witness_size();
    (NON_WITNESS * input_size(sig_script_size) + witness_size).div_ceil(4)
}

/// Virtual size of a transaction with the given inputs, one output and an optional change
/// output (`change_pk_script_size == 0` means none).
pub fn estimate_tx_size(
    inputs: &[ScriptType],
    output_pk_script_size: usize,
    change_pk_script_size: usize,
) -> usize {
    let output_count = if change_pk_script_size == 0 { 1 } else { 2 };
    let mut weight = NON_WITNESS
        * (VERSION_SIZE
            + LOCK_TIME_SIZE
            + var_int_size(inputs.len() as u64)
            + var_int_size(output_count)
            + output_size(output_pk_script_size)
            + output_size(change_pk_script_size));

    let is_segwit = inputs.iter().any(ScriptType::has_witness);
    for script_type in inputs {
        let (sig_script_size, witness_size) = script_type.sig_script_witness_size();
        weight += NON_WITNESS * input_size(sig_script_size) + witness_size;
        if is_segwit && witness_size == 0 {
            // An empty witness is encoded as a single zero byte.
            weight += var_int_size(0);
        }
    }
    if is_segwit {
        // marker + flag
        weight += 2;
    }
    weight.div_ceil(4)
}

/// Fee for `vsize` virtual bytes at `fee_per_kb` satoshis per 1000 vbytes, rounded up.
pub fn fee_for_serialize_size(fee_per_kb: u64, vsize: usize) -> u64 {
    let fee = (fee_per_kb as u128 * vsize as u128).div_ceil(1000);
    let fee = u64::try_from(fee).unwrap_or(MAX_FEE);
    let fee = if fee == 0 && fee_per_kb > 0 {
        fee_per_kb
    } else {
        fee
    };
    fee.min(MAX_FEE)
}

/// Whether an output of `value` paying a `change_script_type` script costs more than a third
/// of its value to spend later.
pub fn is_dust_amount(
    value: u64,
    pk_script_size: usize,
    change_script_type: ScriptType,
    fee_per_kb: u64,
) -> bool {
    let total_size = (input_vsize(change_script_type) + output_size(pk_script_size)) as u128;
    total_size * 3 * fee_per_kb as u128 > 1000 * value as u128
}
