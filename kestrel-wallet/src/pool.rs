//! The four-pool transaction store.
//!
//! Every tracked transaction lives in exactly one of four disjoint pools;
//! the pools plus the id→tx index are the ground truth the wallet
//! invariants are stated over. The store also owns the two derived
//! indexes: the spent-by index (outpoint → consuming input) realizing the
//! "spent by" back-references of the transaction graph, and the set of
//! currently spendable owned outputs.
//!
//! All mutation happens through the state machine in [`crate::state`],
//! under the wallet lock.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    constants::RISK_DROPPED_CAPACITY,
    error::ConsistencyError,
    tx::{InputRef, WalletTx},
};

/// The pool a tracked transaction currently belongs to.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Pool {
    /// Confirmed, with at least one owned unspent output.
    Unspent,
    /// Confirmed, all owned outputs spent.
    Spent,
    /// Unconfirmed (mempool or awaiting broadcast), including in-conflict.
    Pending,
    /// Overridden by a double spend or a reorged-out coinbase.
    Dead,
}

impl Pool {
    pub const ALL: [Pool; 4] =
        [Pool::Unspent, Pool::Spent, Pool::Pending, Pool::Dead];

    pub fn as_str(self) -> &'static str {
        match self {
            Pool::Unspent => "unspent",
            Pool::Spent => "spent",
            Pool::Pending => "pending",
            Pool::Dead => "dead",
        }
    }
}

impl std::fmt::Display for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transaction store. See the module docs.
#[derive(Default)]
pub struct PoolStore {
    /// The id→tx index; its domain is the union of the four pools.
    txs: HashMap<Txid, WalletTx>,
    unspent: HashSet<Txid>,
    spent: HashSet<Txid>,
    pending: HashSet<Txid>,
    dead: HashSet<Txid>,
    /// outpoint → the input consuming it. At most one spender per outpoint.
    spent_by: HashMap<OutPoint, InputRef>,
    /// Owned outputs currently available for spending. BTree for
    /// deterministic iteration order.
    my_unspents: BTreeSet<OutPoint>,
    /// Ring of transactions dropped by risk analysis, eldest first.
    risk_dropped: VecDeque<Transaction>,
    risk_dropped_ids: HashSet<Txid>,
}

impl PoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool_set(&self, pool: Pool) -> &HashSet<Txid> {
        match pool {
            Pool::Unspent => &self.unspent,
            Pool::Spent => &self.spent,
            Pool::Pending => &self.pending,
            Pool::Dead => &self.dead,
        }
    }

    fn pool_set_mut(&mut self, pool: Pool) -> &mut HashSet<Txid> {
        match pool {
            Pool::Unspent => &mut self.unspent,
            Pool::Spent => &mut self.spent,
            Pool::Pending => &mut self.pending,
            Pool::Dead => &mut self.dead,
        }
    }

    /// All pools containing `txid`. A singleton in steady state;
    /// multi-valued only during a bug, which the consistency check turns
    /// into an error.
    pub fn pools_of(&self, txid: Txid) -> Vec<Pool> {
        Pool::ALL
            .into_iter()
            .filter(|pool| self.pool_set(*pool).contains(&txid))
            .collect()
    }

    pub fn pool_of(&self, txid: Txid) -> Option<Pool> {
        Pool::ALL
            .into_iter()
            .find(|pool| self.pool_set(*pool).contains(&txid))
    }

    pub fn is_tracked(&self, txid: Txid) -> bool {
        self.txs.contains_key(&txid)
    }

    /// Insert a transaction into exactly one pool.
    ///
    /// Errors if the id is already tracked anywhere: re-inserting a tracked
    /// transaction is a bookkeeping bug, not a recoverable condition.
    pub fn put(
        &mut self,
        pool: Pool,
        wtx: WalletTx,
    ) -> Result<(), ConsistencyError> {
        let txid = wtx.txid();
        if let Some(existing) = self.pool_of(txid) {
            return Err(ConsistencyError::new(format!(
                "put {txid} into {pool}: already tracked in {existing}"
            )));
        }
        trace!(%txid, %pool, "pool put");
        self.txs.insert(txid, wtx);
        self.pool_set_mut(pool).insert(txid);
        Ok(())
    }

    /// Atomically (under the wallet lock) move `txid` between pools.
    pub fn move_pool(
        &mut self,
        txid: Txid,
        from: Pool,
        to: Pool,
    ) -> Result<(), ConsistencyError> {
        if !self.pool_set_mut(from).remove(&txid) {
            return Err(ConsistencyError::new(format!(
                "move {txid} {from}->{to}: not in {from}"
            )));
        }
        trace!(%txid, %from, %to, "pool move");
        self.pool_set_mut(to).insert(txid);
        Ok(())
    }

    /// Remove a transaction from the store entirely. The caller is
    /// responsible for first disconnecting its inputs and outputs.
    pub fn remove(&mut self, txid: Txid) -> Option<WalletTx> {
        for pool in Pool::ALL {
            self.pool_set_mut(pool).remove(&txid);
        }
        self.txs.remove(&txid)
    }

    pub fn get(&self, txid: Txid) -> Option<&WalletTx> {
        self.txs.get(&txid)
    }

    pub fn get_mut(&mut self, txid: Txid) -> Option<&mut WalletTx> {
        self.txs.get_mut(&txid)
    }

    /// Look up the output a given outpoint refers to, if we track its
    /// parent.
    pub fn output(&self, outpoint: OutPoint) -> Option<&TxOut> {
        self.txs.get(&outpoint.txid)?.output(outpoint.vout)
    }

    pub fn ids_in_pool(&self, pool: Pool) -> impl Iterator<Item = Txid> + '_ {
        self.pool_set(pool).iter().copied()
    }

    pub fn txs_in_pool(
        &self,
        pool: Pool,
    ) -> impl Iterator<Item = &WalletTx> + '_ {
        self.pool_set(pool).iter().filter_map(|txid| self.txs.get(txid))
    }

    pub fn all_ids(&self) -> impl Iterator<Item = Txid> + '_ {
        self.txs.keys().copied()
    }

    pub fn num_tracked(&self) -> usize {
        self.txs.len()
    }

    pub fn pool_len(&self, pool: Pool) -> usize {
        self.pool_set(pool).len()
    }

    // --- Spent-by index --- //

    /// Record that `spender` consumes `outpoint`.
    ///
    /// Fails (without mutating) if a *different* input already spends it;
    /// the caller decides whether that is a double spend or a replay.
    pub fn connect(
        &mut self,
        outpoint: OutPoint,
        spender: InputRef,
    ) -> Result<(), InputRef> {
        match self.spent_by.get(&outpoint) {
            Some(existing) if *existing != spender => Err(*existing),
            _ => {
                self.spent_by.insert(outpoint, spender);
                Ok(())
            }
        }
    }

    /// Clear the spender of `outpoint`, returning the previous back-ref.
    pub fn disconnect(&mut self, outpoint: OutPoint) -> Option<InputRef> {
        self.spent_by.remove(&outpoint)
    }

    pub fn spender_of(&self, outpoint: OutPoint) -> Option<InputRef> {
        self.spent_by.get(&outpoint).copied()
    }

    /// An output is available iff nothing spends it. Whether it is *owned*
    /// is the key registry's call, not ours.
    pub fn is_available(&self, outpoint: OutPoint) -> bool {
        !self.spent_by.contains_key(&outpoint)
    }

    // --- My unspents --- //

    pub fn add_my_unspent(&mut self, outpoint: OutPoint) {
        self.my_unspents.insert(outpoint);
    }

    pub fn remove_my_unspent(&mut self, outpoint: OutPoint) -> bool {
        self.my_unspents.remove(&outpoint)
    }

    pub fn is_my_unspent(&self, outpoint: OutPoint) -> bool {
        self.my_unspents.contains(&outpoint)
    }

    /// Snapshot of the currently spendable owned outputs.
    pub fn my_unspents(&self) -> Vec<(OutPoint, TxOut)> {
        self.my_unspents
            .iter()
            .filter_map(|outpoint| {
                let output = self.output(*outpoint)?;
                Some((*outpoint, output.clone()))
            })
            .collect()
    }

    pub fn my_unspent_outpoints(
        &self,
    ) -> impl Iterator<Item = OutPoint> + '_ {
        self.my_unspents.iter().copied()
    }

    // --- Risk-dropped ring --- //

    /// Remember a transaction diverted by risk analysis, evicting the
    /// eldest entry at capacity.
    pub fn push_risk_dropped(&mut self, tx: Transaction) {
        let txid = tx.compute_txid();
        if self.risk_dropped_ids.contains(&txid) {
            return;
        }
        if self.risk_dropped.len() >= RISK_DROPPED_CAPACITY {
            if let Some(evicted) = self.risk_dropped.pop_front() {
                self.risk_dropped_ids.remove(&evicted.compute_txid());
            }
        }
        self.risk_dropped_ids.insert(txid);
        self.risk_dropped.push_back(tx);
    }

    pub fn is_risk_dropped(&self, txid: Txid) -> bool {
        self.risk_dropped_ids.contains(&txid)
    }

    pub fn num_risk_dropped(&self) -> usize {
        self.risk_dropped.len()
    }

    pub fn clear_risk_dropped(&mut self) {
        self.risk_dropped.clear();
        self.risk_dropped_ids.clear();
    }
}

#[cfg(test)]
mod test {
    use bitcoin::{
        absolute::LockTime, hashes::Hash as _, transaction::Version, Amount,
        ScriptBuf, Sequence, TxIn, Witness,
    };
    use kestrel_common::time::TimestampMs;

    use super::*;
    use crate::tx::TxSource;

    fn tx_with_locktime(locktime: u32) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(locktime),
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([9; 32]),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ZERO,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn wtx(locktime: u32) -> WalletTx {
        WalletTx::new(
            tx_with_locktime(locktime),
            TxSource::Network,
            TimestampMs::MIN,
        )
    }

    #[test]
    fn put_twice_is_a_consistency_error() {
        let mut store = PoolStore::new();
        let wtx1 = wtx(1);
        let txid = wtx1.txid();

        store.put(Pool::Pending, wtx1.clone()).unwrap();
        assert_eq!(store.pools_of(txid), vec![Pool::Pending]);

        let err = store.put(Pool::Unspent, wtx1).unwrap_err();
        assert!(err.reason.contains("already tracked"));
    }

    #[test]
    fn move_requires_source_pool() {
        let mut store = PoolStore::new();
        let wtx1 = wtx(2);
        let txid = wtx1.txid();
        store.put(Pool::Pending, wtx1).unwrap();

        store.move_pool(txid, Pool::Pending, Pool::Unspent).unwrap();
        assert_eq!(store.pool_of(txid), Some(Pool::Unspent));

        let err = store
            .move_pool(txid, Pool::Pending, Pool::Dead)
            .unwrap_err();
        assert!(err.reason.contains("not in pending"));
    }

    #[test]
    fn connect_rejects_second_spender() {
        let mut store = PoolStore::new();
        let outpoint = OutPoint {
            txid: Txid::from_byte_array([1; 32]),
            vout: 0,
        };
        let spender_a =
            InputRef { spender: Txid::from_byte_array([2; 32]), vin: 0 };
        let spender_b =
            InputRef { spender: Txid::from_byte_array([3; 32]), vin: 1 };

        store.connect(outpoint, spender_a).unwrap();
        // Re-connecting the same input is an idempotent no-op.
        store.connect(outpoint, spender_a).unwrap();
        assert_eq!(store.connect(outpoint, spender_b), Err(spender_a));

        assert_eq!(store.disconnect(outpoint), Some(spender_a));
        assert!(store.is_available(outpoint));
        store.connect(outpoint, spender_b).unwrap();
    }

    #[test]
    fn risk_ring_evicts_eldest_at_capacity() {
        let mut store = PoolStore::new();
        let eldest = tx_with_locktime(0);
        let eldest_txid = eldest.compute_txid();
        store.push_risk_dropped(eldest);

        for locktime in 1..=(RISK_DROPPED_CAPACITY as u32) {
            store.push_risk_dropped(tx_with_locktime(locktime));
        }

        assert_eq!(store.num_risk_dropped(), RISK_DROPPED_CAPACITY);
        assert!(!store.is_risk_dropped(eldest_txid));
        assert!(store.is_risk_dropped(tx_with_locktime(1).compute_txid()));
    }
}
