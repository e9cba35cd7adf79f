//! Virtual-size estimation, dust thresholds, and fee math.
//!
//! Sizes are estimated per input script class *before* signing, so the fee
//! loop in the builder can converge without producing signatures. Estimates
//! use worst-case signature sizes and therefore never under-pay.

use bitcoin::{Amount, Script, TxOut};

use crate::{
    constants::{
        DUST_SPEND_COST_LEGACY, DUST_SPEND_COST_SEGWIT,
        MIN_RELAY_FEE_PER_KB, P2PKH_INPUT_SIZE, P2WPKH_INPUT_BASE_SIZE,
        P2WPKH_WITNESS_SIZE,
    },
    keys::RedeemData,
};

/// The signed-size class of an input, determined by the script template of
/// the output it spends.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InputClass {
    /// Legacy pay-to-pubkey-hash (sized for an uncompressed pubkey).
    P2pkh,
    /// Segwit v0 pay-to-witness-pubkey-hash.
    P2wpkh,
    /// Pay-to-script-hash; sized from the redeem script we hold.
    P2sh { redeem_script_len: usize, num_keys: usize },
    /// Anything we cannot classify; sized like a legacy input.
    Unknown,
}

impl InputClass {
    pub fn of(
        spent_script_pubkey: &Script,
        redeem: Option<&RedeemData>,
    ) -> Self {
        if spent_script_pubkey.is_p2pkh()
            || spent_script_pubkey.is_p2pk()
        {
            Self::P2pkh
        } else if spent_script_pubkey.is_p2wpkh() {
            Self::P2wpkh
        } else if spent_script_pubkey.is_p2sh() {
            match redeem {
                Some(redeem) => Self::P2sh {
                    redeem_script_len: redeem.redeem_script.len(),
                    num_keys: redeem.keys.len().max(1),
                },
                None => Self::Unknown,
            }
        } else {
            Self::Unknown
        }
    }

    /// Non-witness serialized bytes of the signed input.
    fn base_size(&self) -> usize {
        match self {
            Self::P2pkh | Self::Unknown => P2PKH_INPUT_SIZE,
            Self::P2wpkh => P2WPKH_INPUT_BASE_SIZE,
            Self::P2sh { redeem_script_len, num_keys } => {
                // outpoint + sequence + scriptSig holding one ~72-byte
                // signature per key plus the pushed redeem script.
                let script_sig =
                    74 * num_keys + redeem_script_len + 3;
                36 + 4 + varint_len(script_sig) + script_sig
            }
        }
    }

    /// Witness bytes of the signed input (zero for legacy classes).
    fn witness_size(&self) -> usize {
        match self {
            Self::P2wpkh => P2WPKH_WITNESS_SIZE,
            _ => 0,
        }
    }
}

fn varint_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn output_size(output: &TxOut) -> usize {
    let script_len = output.script_pubkey.len();
    8 + varint_len(script_len) + script_len
}

/// Estimated virtual size of a transaction spending inputs of the given
/// classes to the given outputs: non-witness bytes count 4 weight units,
/// witness bytes 1, `vsize = ceil(weight / 4)`.
pub fn estimate_vsize(
    input_classes: &[InputClass],
    outputs: &[TxOut],
) -> usize {
    let base = 4 // version
        + varint_len(input_classes.len())
        + varint_len(outputs.len())
        + 4; // locktime
    let outputs_size: usize = outputs.iter().map(output_size).sum();

    let mut non_witness = base + outputs_size;
    let mut witness = 0usize;
    for class in input_classes {
        non_witness += class.base_size();
        witness += class.witness_size();
    }
    if witness > 0 {
        // Segwit marker + flag bytes are witness-discounted too.
        witness += 2;
    }

    let weight = non_witness * 4 + witness;
    weight.div_ceil(4)
}

/// The fee required for a transaction of `vsize` vbytes at `fee_per_kb`,
/// rounding up.
pub fn required_fee(vsize: usize, fee_per_kb: Amount) -> Amount {
    let sats = (vsize as u64)
        .saturating_mul(fee_per_kb.to_sat())
        .div_ceil(1000);
    Amount::from_sat(sats)
}

/// The dust threshold for `output`: the value below which relaying the
/// output (and later spending it) costs more than it is worth.
///
/// `3 · min_relay_fee · (serialized_size + spend_cost) / 1000`, where the
/// spend cost is a legacy input's size, discounted 4x when the output is a
/// witness program.
pub fn dust_threshold(output: &TxOut) -> Amount {
    let spend_cost = if output.script_pubkey.is_witness_program() {
        DUST_SPEND_COST_SEGWIT
    } else {
        DUST_SPEND_COST_LEGACY
    };
    let size = output_size(output) + spend_cost;
    let sats =
        3 * MIN_RELAY_FEE_PER_KB.to_sat() * (size as u64) / 1000;
    Amount::from_sat(sats)
}

pub fn is_dust(output: &TxOut) -> bool {
    !output.script_pubkey.is_op_return() && output.value < dust_threshold(output)
}
