//! Proptest strategies for foreign ([`bitcoin`]) types which we cannot
//! implement [`Arbitrary`] for directly.
//!
//! [`Arbitrary`]: proptest::arbitrary::Arbitrary

use bitcoin::{
    hashes::Hash as _, Amount, BlockHash, OutPoint, PubkeyHash, ScriptBuf,
    TxOut, Txid, WPubkeyHash,
};
use proptest::{
    arbitrary::any,
    prop_oneof,
    strategy::{Just, Strategy},
};

/// An arbitrary [`Txid`].
pub fn any_txid() -> impl Strategy<Value = Txid> {
    any::<[u8; 32]>().prop_map(Txid::from_byte_array)
}

/// An arbitrary [`BlockHash`].
pub fn any_block_hash() -> impl Strategy<Value = BlockHash> {
    any::<[u8; 32]>().prop_map(BlockHash::from_byte_array)
}

/// An arbitrary [`OutPoint`].
pub fn any_outpoint() -> impl Strategy<Value = OutPoint> {
    (any_txid(), 0u32..16).prop_map(|(txid, vout)| OutPoint { txid, vout })
}

/// An arbitrary standard script pubkey (P2PKH, P2WPKH, or OP_RETURN).
pub fn any_script_pubkey() -> impl Strategy<Value = ScriptBuf> {
    prop_oneof![
        any::<[u8; 20]>().prop_map(|hash| ScriptBuf::new_p2pkh(
            &PubkeyHash::from_byte_array(hash)
        )),
        any::<[u8; 20]>().prop_map(|hash| ScriptBuf::new_p2wpkh(
            &WPubkeyHash::from_byte_array(hash)
        )),
        Just(ScriptBuf::new_op_return([0x69u8; 4])),
    ]
}

/// An arbitrary [`TxOut`] with a value in a sane (non-dust, sub-max) range.
pub fn any_txout() -> impl Strategy<Value = TxOut> {
    (1_000u64..1_000_000_000, any_script_pubkey()).prop_map(
        |(sats, script_pubkey)| TxOut {
            value: Amount::from_sat(sats),
            script_pubkey,
        },
    )
}
