//! Per-transaction confidence tracking.
//!
//! A transaction's confidence is the wallet's belief about its status:
//! pending (in the mempool), building (in the best chain at some depth),
//! dead (overridden by a double spend), or in-conflict (double-spent by
//! another *pending* transaction, awaiting miner arbitration).
//!
//! The [`ConfidenceTable`] is process-wide and internally synchronized: it
//! is constructed once and passed into each wallet explicitly, so two
//! wallets tracking the same transaction share one confidence record (and
//! so there is no hidden global singleton).
//!
//! Callers can watch a transaction via [`ConfidenceTable::subscribe`] or
//! await a confirmation depth via [`ConfidenceTable::wait_for_depth`]; the
//! futures complete on wallet state change and complete at most once.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
};

use bitcoin::Txid;
use kestrel_common::chain::BlockId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::trace;

/// The coarse confidence states. See the module docs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConfidenceKind {
    /// Never seen in a block or the mempool; nothing is known.
    Unknown,
    /// In the mempool (or committed locally and awaiting broadcast).
    Pending,
    /// Included in the best chain.
    Building,
    /// Overridden by a confirmed double spend, or a reorganized-out
    /// coinbase. Will never confirm unless resurrected.
    Dead,
    /// An unconfirmed transaction sharing an outpoint with another
    /// unconfirmed transaction; miners will arbitrate.
    InConflict,
}

/// A snapshot of one transaction's confidence.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxConfidence {
    pub kind: ConfidenceKind,
    /// The best-chain block the transaction appeared in, if any.
    pub appeared_in: Option<BlockId>,
    /// Number of blocks building on the appearance block, inclusive.
    /// `depth == 1` means newly confirmed. Zero unless `Building`.
    pub depth: u32,
    /// For `Dead` transactions: the transaction that double-spent this one.
    /// `None` only for reorganized-out coinbases.
    pub overriding_txid: Option<Txid>,
    /// Peers that have announced this transaction to us.
    pub seen_by: BTreeSet<String>,
}

impl TxConfidence {
    fn new() -> Self {
        Self {
            kind: ConfidenceKind::Unknown,
            appeared_in: None,
            depth: 0,
            overriding_txid: None,
            seen_by: BTreeSet::new(),
        }
    }

    pub fn num_broadcast_peers(&self) -> usize {
        self.seen_by.len()
    }
}

struct Entry {
    conf: TxConfidence,
    watch_tx: watch::Sender<TxConfidence>,
}

impl Entry {
    fn new() -> Self {
        let conf = TxConfidence::new();
        let (watch_tx, _watch_rx) = watch::channel(conf.clone());
        Self { conf, watch_tx }
    }

    fn publish(&self) {
        // Subscribers may all have gone away; that's fine.
        let _ = self.watch_tx.send(self.conf.clone());
    }
}

/// The process-wide confidence table. See the module docs.
pub struct ConfidenceTable {
    inner: Mutex<HashMap<Txid, Entry>>,
}

impl Default for ConfidenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfidenceTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    /// Snapshot the confidence of `txid`, if tracked.
    pub fn get(&self, txid: Txid) -> Option<TxConfidence> {
        let locked = self.inner.lock().unwrap();
        locked.get(&txid).map(|entry| entry.conf.clone())
    }

    /// Run `mutate` on the (possibly fresh) entry for `txid` and publish
    /// the result to subscribers.
    fn with_entry<T>(
        &self,
        txid: Txid,
        mutate: impl FnOnce(&mut TxConfidence) -> T,
    ) -> T {
        let mut locked = self.inner.lock().unwrap();
        let entry = locked.entry(txid).or_insert_with(Entry::new);
        let out = mutate(&mut entry.conf);
        entry.publish();
        out
    }

    pub fn set_pending(&self, txid: Txid) {
        trace!(%txid, "confidence -> pending");
        self.with_entry(txid, |conf| {
            conf.kind = ConfidenceKind::Pending;
            conf.depth = 0;
            conf.appeared_in = None;
            conf.overriding_txid = None;
        });
    }

    pub fn set_in_conflict(&self, txid: Txid) {
        trace!(%txid, "confidence -> in-conflict");
        self.with_entry(txid, |conf| {
            conf.kind = ConfidenceKind::InConflict;
            conf.depth = 0;
        });
    }

    pub fn set_dead(&self, txid: Txid, overriding_txid: Option<Txid>) {
        trace!(%txid, ?overriding_txid, "confidence -> dead");
        self.with_entry(txid, |conf| {
            conf.kind = ConfidenceKind::Dead;
            conf.depth = 0;
            conf.overriding_txid = overriding_txid;
        });
    }

    /// Record a best-chain appearance: the transaction is now building with
    /// depth 1 in `block`.
    pub fn set_building(&self, txid: Txid, block: BlockId) {
        trace!(%txid, %block, "confidence -> building");
        self.with_entry(txid, |conf| {
            conf.kind = ConfidenceKind::Building;
            conf.appeared_in = Some(block);
            conf.depth = 1;
            conf.overriding_txid = None;
        });
    }

    /// A new best block built on top of this transaction's block. Returns
    /// the new depth.
    pub fn bump_depth(&self, txid: Txid) -> u32 {
        self.with_entry(txid, |conf| {
            debug_assert_eq!(conf.kind, ConfidenceKind::Building);
            conf.depth = conf.depth.saturating_add(1);
            conf.depth
        })
    }

    /// A reorg rolled back `blocks` best-chain blocks.
    pub fn subtract_depth(&self, txid: Txid, blocks: u32) {
        self.with_entry(txid, |conf| {
            conf.depth = conf.depth.saturating_sub(blocks);
        });
    }

    /// Demote a building (or conflicted) transaction back to pending, e.g.
    /// because its block was reorganized away or its conflict resolved.
    pub fn demote_to_pending(&self, txid: Txid) {
        self.set_pending(txid);
    }

    /// Record that `peer` announced `txid`; returns the new announce count.
    pub fn mark_seen_by(&self, txid: Txid, peer: &str) -> usize {
        self.with_entry(txid, |conf| {
            conf.seen_by.insert(peer.to_owned());
            conf.seen_by.len()
        })
    }

    /// Forget the broadcast peer set, e.g. once the transaction is past the
    /// event horizon and can no longer plausibly be reorged out.
    pub fn clear_seen_by(&self, txid: Txid) {
        self.with_entry(txid, |conf| conf.seen_by.clear());
    }

    pub fn num_broadcast_peers(&self, txid: Txid) -> usize {
        self.get(txid).map(|conf| conf.num_broadcast_peers()).unwrap_or(0)
    }

    /// Watch `txid`'s confidence. The receiver holds the current value.
    pub fn subscribe(&self, txid: Txid) -> watch::Receiver<TxConfidence> {
        let mut locked = self.inner.lock().unwrap();
        let entry = locked.entry(txid).or_insert_with(Entry::new);
        entry.watch_tx.subscribe()
    }

    /// Completes once `txid` reaches `target_depth` confirmations, or
    /// resolves early with the final confidence if the transaction dies.
    pub async fn wait_for_depth(
        &self,
        txid: Txid,
        target_depth: u32,
    ) -> TxConfidence {
        let mut rx = self.subscribe(txid);
        loop {
            let conf = rx.borrow_and_update().clone();
            let done = conf.kind == ConfidenceKind::Dead
                || (conf.kind == ConfidenceKind::Building
                    && conf.depth >= target_depth);
            if done {
                return conf;
            }
            if rx.changed().await.is_err() {
                // Table entry dropped; resolve with the last known state.
                return rx.borrow().clone();
            }
        }
    }

    /// Drop the record for `txid` entirely (wallet reset / cleanup).
    pub fn forget(&self, txid: Txid) {
        let mut locked = self.inner.lock().unwrap();
        locked.remove(&txid);
    }
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::Hash as _;
    use bitcoin::BlockHash;

    use super::*;

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    fn block(height: u32) -> BlockId {
        BlockId::new(BlockHash::from_byte_array([height as u8; 32]), height)
    }

    #[test]
    fn lifecycle_pending_building_depth() {
        let table = ConfidenceTable::new();
        let id = txid(1);

        assert_eq!(table.get(id), None);
        table.set_pending(id);
        assert_eq!(table.get(id).unwrap().kind, ConfidenceKind::Pending);

        table.set_building(id, block(10));
        let conf = table.get(id).unwrap();
        assert_eq!(conf.kind, ConfidenceKind::Building);
        assert_eq!(conf.depth, 1);
        assert_eq!(conf.appeared_in, Some(block(10)));

        assert_eq!(table.bump_depth(id), 2);
        table.subtract_depth(id, 1);
        assert_eq!(table.get(id).unwrap().depth, 1);
    }

    #[test]
    fn dead_records_overriding_txid() {
        let table = ConfidenceTable::new();
        table.set_pending(txid(1));
        table.set_dead(txid(1), Some(txid(2)));
        let conf = table.get(txid(1)).unwrap();
        assert_eq!(conf.kind, ConfidenceKind::Dead);
        assert_eq!(conf.overriding_txid, Some(txid(2)));
    }

    #[test]
    fn seen_by_dedupes_peers() {
        let table = ConfidenceTable::new();
        let id = txid(3);
        assert_eq!(table.mark_seen_by(id, "peer-a"), 1);
        assert_eq!(table.mark_seen_by(id, "peer-a"), 1);
        assert_eq!(table.mark_seen_by(id, "peer-b"), 2);
        table.clear_seen_by(id);
        assert_eq!(table.num_broadcast_peers(id), 0);
    }

    #[tokio::test]
    async fn wait_for_depth_completes_on_confirmation() {
        let table = std::sync::Arc::new(ConfidenceTable::new());
        let id = txid(4);
        table.set_pending(id);

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait_for_depth(id, 2).await })
        };

        table.set_building(id, block(100));
        table.bump_depth(id);

        let conf = waiter.await.unwrap();
        assert_eq!(conf.kind, ConfidenceKind::Building);
        assert!(conf.depth >= 2);
    }

    #[tokio::test]
    async fn wait_for_depth_resolves_early_on_death() {
        let table = std::sync::Arc::new(ConfidenceTable::new());
        let id = txid(5);
        table.set_pending(id);

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait_for_depth(id, 6).await })
        };

        table.set_dead(id, Some(txid(6)));
        let conf = waiter.await.unwrap();
        assert_eq!(conf.kind, ConfidenceKind::Dead);
    }
}
