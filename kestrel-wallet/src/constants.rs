//! Wallet-wide constants.

use bitcoin::Amount;

/// The maximum number of satoshis that can ever exist: 21 million BTC.
pub const MAX_MONEY: Amount = Amount::from_sat(21_000_000 * 100_000_000);

/// The number of confirmations a coinbase output needs before it is
/// spendable (mainnet consensus rule).
pub const COINBASE_MATURITY: u32 = 100;

/// Once a transaction is this many blocks deep, we stop tracking which peers
/// announced it; a reorg past this depth is considered impossible in
/// practice.
pub const EVENT_HORIZON: u32 = 10;

/// The default fee rate in satoshis per 1000 virtual bytes.
pub const DEFAULT_FEE_PER_KB: Amount = Amount::from_sat(5_000);

/// The minimum relay fee rate assumed for dust calculations, in satoshis
/// per 1000 virtual bytes.
pub const MIN_RELAY_FEE_PER_KB: Amount = Amount::from_sat(1_000);

/// Transactions larger than this (in vbytes) are not standard and will not
/// relay.
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;

/// Cap on the ring buffer of risk-dropped transactions; the eldest entry is
/// evicted when a new one arrives at capacity.
pub const RISK_DROPPED_CAPACITY: usize = 1_000;

/// Maximum number of inputs a single key-rotation transaction may consume.
pub const ROTATION_BATCH_MAX_INPUTS: usize = 600;

/// How many keys each deterministic chain derives beyond the last issued
/// one, so that the network filters pick up payments to keys we haven't
/// handed out yet.
pub const DEFAULT_LOOKAHEAD: u32 = 100;

/// Estimated size in bytes of a signed P2PKH (uncompressed pubkey) input:
/// outpoint (36) + script len (1) + sig (~72) + pubkey (65 + 2 pushes) +
/// sequence (4).
pub const P2PKH_INPUT_SIZE: usize = 180;

/// Non-witness size in bytes of a P2WPKH input: outpoint (36) + empty
/// script (1) + sequence (4).
pub const P2WPKH_INPUT_BASE_SIZE: usize = 41;

/// Witness size in bytes of a signed P2WPKH input: item count (1) +
/// sig (1 + ~72) + pubkey (1 + 33).
pub const P2WPKH_WITNESS_SIZE: usize = 108;

/// The spend cost in vbytes that the dust threshold formula charges a
/// legacy output: roughly the size of a signed P2PKH input.
pub const DUST_SPEND_COST_LEGACY: usize = 148;

/// The segwit analogue: the legacy spend cost discounted by the witness
/// factor of 4.
pub const DUST_SPEND_COST_SEGWIT: usize = DUST_SPEND_COST_LEGACY / 4;
