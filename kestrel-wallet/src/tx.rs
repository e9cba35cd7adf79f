//! The wallet's view of a single transaction.
//!
//! A [`WalletTx`] is a value object keyed by txid. Inputs reference their
//! funding outputs by [`OutPoint`] only; the "connected output" and "spent
//! by" back-references of the transaction graph are resolved through the
//! spent-by index in [`crate::pool::PoolStore`], never by owning pointers.
//! This keeps the tx ↔ input ↔ output graph acyclic and makes reorg replay
//! a matter of rebuilding the index.

use std::collections::BTreeMap;

use bitcoin::{Amount, BlockHash, OutPoint, Transaction, TxOut, Txid};
use kestrel_common::time::TimestampMs;
use serde::{Deserialize, Serialize};

/// Where a tracked transaction came from. Self-originated pending
/// transactions may spend their own change before confirmation; network
/// transactions may not.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TxSource {
    /// This wallet created and committed the transaction.
    SelfOriginated,
    /// The transaction arrived from the network.
    Network,
}

/// A transaction tracked by the wallet, plus bookkeeping.
///
/// The inner [`Transaction`] is immutable once committed: mutation happens
/// by building a replacement *before* commit, never by editing in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletTx {
    tx: Transaction,
    /// Cached; computing a txid hashes the whole serialization.
    txid: Txid,
    pub source: TxSource,
    /// Last time this transaction's pool or confidence changed.
    pub update_time: TimestampMs,
    /// The block(s) this transaction appears in, mapped to its in-block
    /// offset. Normally a singleton; transiently multi-valued while
    /// side-chain blocks race the best chain.
    pub appearances: BTreeMap<BlockHash, u32>,
}

impl WalletTx {
    pub fn new(tx: Transaction, source: TxSource, now: TimestampMs) -> Self {
        let txid = tx.compute_txid();
        Self {
            tx,
            txid,
            source,
            update_time: now,
            appearances: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn txid(&self) -> Txid {
        self.txid
    }

    #[inline]
    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    #[inline]
    pub fn is_coinbase(&self) -> bool {
        self.tx.is_coinbase()
    }

    /// The outpoint referring to this transaction's `vout`-th output.
    pub fn outpoint(&self, vout: u32) -> OutPoint {
        OutPoint { txid: self.txid, vout }
    }

    pub fn output(&self, vout: u32) -> Option<&TxOut> {
        self.tx.output.get(vout as usize)
    }

    pub fn output_value(&self, vout: u32) -> Amount {
        self.output(vout).map(|out| out.value).unwrap_or(Amount::ZERO)
    }

    /// The outpoints this transaction's inputs consume. Empty for coinbase.
    pub fn input_outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        let coinbase = self.is_coinbase();
        self.tx
            .input
            .iter()
            .filter(move |_| !coinbase)
            .map(|input| input.previous_output)
    }

    /// If this transaction spends `outpoint`, the index of the spending
    /// input.
    pub fn spending_input(&self, outpoint: OutPoint) -> Option<u32> {
        if self.is_coinbase() {
            return None;
        }
        self.tx
            .input
            .iter()
            .position(|input| input.previous_output == outpoint)
            .map(|vin| vin as u32)
    }

    pub fn add_appearance(&mut self, block_hash: BlockHash, offset: u32) {
        self.appearances.insert(block_hash, offset);
    }

    pub fn remove_appearance(&mut self, block_hash: &BlockHash) -> Option<u32> {
        self.appearances.remove(block_hash)
    }

    pub fn appears_in(&self, block_hash: &BlockHash) -> bool {
        self.appearances.contains_key(block_hash)
    }
}

/// Identifies one input of a tracked transaction; the value stored in the
/// spent-by index.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InputRef {
    pub spender: Txid,
    pub vin: u32,
}
