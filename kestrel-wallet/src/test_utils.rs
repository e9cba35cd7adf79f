//! Shared test fixtures. Only compiled in tests or with the `test-utils`
//! feature enabled.

use std::sync::{Arc, Mutex};

use bip39::Mnemonic;
use bitcoin::{
    absolute::LockTime, hashes::Hash as _, transaction::Version, Amount,
    BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use kestrel_common::{
    chain::{BlockId, BlockType},
    network::KsNetwork,
    time::TimestampMs,
};
use rand_core::RngCore;

use crate::{
    broadcast::{self, Broadcaster, TxBroadcast},
    classify::DefaultRiskAnalyzer,
    confidence::ConfidenceTable,
    keychain::{AccountStructure, KeyRegistry},
    keys::ScriptType,
    state::WalletState,
    tx::TxSource,
};

/// The well-known test mnemonic.
pub const TEST_MNEMONIC: &str = "panda diary marriage suffer basic glare \
                                 surge auto scissors describe sell unique";

/// A tiny xorshift rng; deterministic and good enough for fixtures.
pub struct DeterministicRng(u64);

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(2685821657736338717).wrapping_add(1))
    }
}

impl RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// A fresh regtest wallet state over the test mnemonic.
pub fn test_state(script_type: ScriptType) -> WalletState {
    let mnemonic = Mnemonic::parse(TEST_MNEMONIC).unwrap();
    let registry = KeyRegistry::from_mnemonic(
        &mnemonic,
        AccountStructure::Bip43,
        script_type,
        KsNetwork::Regtest,
        TimestampMs::from_secs(1_700_000_000),
    );
    WalletState::new(
        KsNetwork::Regtest,
        Arc::new(ConfidenceTable::new()),
        Arc::new(registry),
        Arc::new(DefaultRiskAnalyzer),
    )
}

/// A deterministic fake block id for `height`.
pub fn block(height: u32) -> BlockId {
    let mut bytes = [0xb0; 32];
    bytes[..4].copy_from_slice(&height.to_le_bytes());
    BlockId::new(BlockHash::from_byte_array(bytes), height)
}

/// A variant block at the same height (for reorg branches).
pub fn block_prime(height: u32) -> BlockId {
    let mut bytes = [0xb1; 32];
    bytes[..4].copy_from_slice(&height.to_le_bytes());
    BlockId::new(BlockHash::from_byte_array(bytes), height)
}

/// A deterministic foreign outpoint.
pub fn foreign_outpoint(tag: u8) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([tag; 32]),
        vout: 0,
    }
}

/// A transaction paying `value` to `script_pubkey` from a foreign input.
pub fn payment_to(
    script_pubkey: ScriptBuf,
    value: Amount,
    from: OutPoint,
) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: from,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut { value, script_pubkey }],
    }
}

/// A transaction spending `from` and paying a foreign P2WPKH script.
pub fn foreign_spend(from: Vec<OutPoint>, value: Amount) -> Transaction {
    let stranger = ScriptBuf::new_p2wpkh(
        &bitcoin::WPubkeyHash::from_byte_array([0xfe; 20]),
    );
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: from
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: vec![TxOut { value, script_pubkey: stranger }],
    }
}

/// Fund the wallet with `value` via a fresh receive script, as a pending
/// transaction. Returns the funding transaction.
pub fn fund_pending(
    state: &mut WalletState,
    value: Amount,
    tag: u8,
) -> Transaction {
    let script = state.keys.fresh_receive_script();
    let tx = payment_to(script, value, foreign_outpoint(tag));
    state.receive_pending(tx.clone(), &[]).unwrap();
    tx
}

/// Fund the wallet with `value`, confirmed in `at`.
pub fn fund_confirmed(
    state: &mut WalletState,
    value: Amount,
    tag: u8,
    at: BlockId,
) -> Transaction {
    let script = state.keys.fresh_receive_script();
    let tx = payment_to(script, value, foreign_outpoint(tag));
    confirm(state, tx.clone(), at, 0);
    tx
}

/// Deliver `tx` in `at` (best chain) and advance the best block.
pub fn confirm(
    state: &mut WalletState,
    tx: Transaction,
    at: BlockId,
    offset: u32,
) {
    state
        .receive_from_block(tx, at, BlockType::BestChain, offset)
        .unwrap();
    state
        .notify_new_best_block(at, TimestampMs::from_secs(1_700_000_000))
        .unwrap();
}

/// Commit a self-originated spend of the wallet's coins.
pub fn commit_self(state: &mut WalletState, tx: Transaction) -> Txid {
    state.commit(tx, TxSource::SelfOriginated).unwrap()
}

/// A broadcaster that records transactions and completes immediately.
#[derive(Default)]
pub struct RecordingBroadcaster {
    pub sent: Mutex<Vec<Transaction>>,
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, tx: Transaction) -> TxBroadcast {
        self.sent.lock().unwrap().push(tx);
        let (mut handle, broadcast) = broadcast::channel();
        handle.complete_sent(Ok(()));
        handle.complete_relayed(Ok(()));
        broadcast
    }
}
