//! The wallet state machine: the only mutator of pool membership and
//! spent flags.
//!
//! All methods run synchronously under the wallet lock (see
//! [`crate::wallet::Wallet`]); there are no suspension points here.
//! Listener events are queued on the state and drained by the wallet
//! facade after the lock is released.
//!
//! The invariants this module maintains at every quiescent point:
//!
//! 1. Pools are pairwise disjoint; their union is the tracked-id set.
//! 2. A transaction is UNSPENT iff it has ≥ 1 owned available output;
//!    SPENT iff confirmed with all owned outputs spent.
//! 3. Every spent-by back-reference points at an input that cites it.
//! 4. `my_unspents` holds exactly the owned available outputs whose parent
//!    is UNSPENT or PENDING.
//! 5. Confidence agrees with pool membership.
//! 6. Every DEAD transaction is a reorged-out coinbase or records its
//!    overriding double spend.
//!
//! [`is_consistent_or_throw`](WalletState::is_consistent_or_throw) checks
//! all of these after every mutator.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use bitcoin::{Amount, OutPoint, Transaction, TxOut, Txid};
use kestrel_common::{
    chain::{BlockId, BlockType, LastBlockSeen},
    network::KsNetwork,
    time::TimestampMs,
};
use tracing::{debug, info, warn};

use crate::{
    classify::RiskAnalyzer,
    confidence::{ConfidenceKind, ConfidenceTable},
    constants::{EVENT_HORIZON, MAX_MONEY},
    error::ConsistencyError,
    events::WalletEvent,
    keychain::{KeyEvent, KeyRegistry},
    keys::KeyBag as _,
    pool::{Pool, PoolStore},
    select::{BalanceKind, Coin, CoinSelector, DefaultCoinSelector},
    tx::{InputRef, TxSource, WalletTx},
};

/// All wallet state guarded by the coarse wallet lock.
pub struct WalletState {
    pub(crate) network: KsNetwork,
    pub(crate) pools: PoolStore,
    pub(crate) confidence: Arc<ConfidenceTable>,
    pub(crate) keys: Arc<KeyRegistry>,
    pub(crate) last_block_seen: Option<LastBlockSeen>,
    /// Transactions whose depth was just set by `receive_from_block`; the
    /// immediately following `notify_new_best_block` must not bump them
    /// again.
    ignore_next_depth_bump: HashSet<Txid>,
    /// Listener events queued under the lock, dispatched after release.
    pending_events: Vec<WalletEvent>,
    pub(crate) accept_risky: bool,
    pub(crate) risk_analyzer: Arc<dyn RiskAnalyzer>,
}

/// Whether a spend-connection pass comes from a best-chain block (which
/// wins conflicts) or from the mempool (which aborts on conflict).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SpendSource {
    Chain,
    Mempool,
}

impl WalletState {
    pub fn new(
        network: KsNetwork,
        confidence: Arc<ConfidenceTable>,
        keys: Arc<KeyRegistry>,
        risk_analyzer: Arc<dyn RiskAnalyzer>,
    ) -> Self {
        Self {
            network,
            pools: PoolStore::new(),
            confidence,
            keys,
            last_block_seen: None,
            ignore_next_depth_bump: HashSet::new(),
            pending_events: Vec::new(),
            accept_risky: false,
            risk_analyzer,
        }
    }

    pub(crate) fn queue_event(&mut self, event: WalletEvent) {
        self.pending_events.push(event);
    }

    /// Drain queued listener events; called by the facade after unlocking.
    pub(crate) fn take_events(&mut self) -> Vec<WalletEvent> {
        // Key registry bookkeeping events ride along with wallet events.
        for key_event in self.keys.take_events() {
            let event = match key_event {
                KeyEvent::KeysAdded(count) => WalletEvent::KeysAdded { count },
                KeyEvent::CurrentKeyChanged => WalletEvent::CurrentKeyChanged,
            };
            self.pending_events.push(event);
        }
        std::mem::take(&mut self.pending_events)
    }

    // --- Ownership and value accounting --- //

    pub(crate) fn is_mine_output(&self, output: &TxOut) -> bool {
        self.keys.is_mine_script(&output.script_pubkey)
    }

    /// Total value of `tx`'s outputs paying keys we own.
    pub fn value_sent_to_me(&self, tx: &Transaction) -> Amount {
        tx.output
            .iter()
            .filter(|output| self.is_mine_output(output))
            .map(|output| output.value)
            .fold(Amount::ZERO, |acc, value| acc + value)
    }

    /// Total value `tx` takes from us: the sum of its inputs' connected
    /// outputs that we own. Only counts inputs whose parents we track.
    pub fn value_sent_from_me(&self, tx: &Transaction) -> Amount {
        if tx.is_coinbase() {
            return Amount::ZERO;
        }
        tx.input
            .iter()
            .filter_map(|input| self.pools.output(input.previous_output))
            .filter(|output| self.is_mine_output(output))
            .map(|output| output.value)
            .fold(Amount::ZERO, |acc, value| acc + value)
    }

    // --- Balances and spend candidates --- //

    /// All spend candidates: the owned available outputs of UNSPENT and
    /// PENDING parents, annotated for the selector.
    pub fn spend_candidates(&self) -> Vec<Coin> {
        let mut coins = Vec::new();
        for outpoint in self.pools.my_unspent_outpoints() {
            let parent = match self.pools.get(outpoint.txid) {
                Some(parent) => parent,
                None => continue,
            };
            let output = match parent.output(outpoint.vout) {
                Some(output) => output.clone(),
                None => continue,
            };
            let conf = self.confidence.get(outpoint.txid);
            let depth = conf
                .as_ref()
                .filter(|conf| conf.kind == ConfidenceKind::Building)
                .map(|conf| conf.depth)
                .unwrap_or(0);
            let broadcast_peers = conf
                .as_ref()
                .map(|conf| conf.num_broadcast_peers())
                .unwrap_or(0);
            let spendable = self
                .keys
                .find_key_for_script(&output.script_pubkey)
                .map(|key| key.privkey.is_some())
                .unwrap_or(false)
                || crate::keys::p2sh_hash(&output.script_pubkey)
                    .map(|hash| self.keys.is_script_hash_mine(&hash))
                    .unwrap_or(false);
            coins.push(Coin {
                outpoint,
                output,
                depth,
                coinbase: parent.is_coinbase(),
                self_originated: parent.source == TxSource::SelfOriginated,
                broadcast_peers,
                spendable,
            });
        }
        coins
    }

    pub fn balance(&self, kind: BalanceKind) -> Amount {
        self.balance_with(kind, &DefaultCoinSelector)
    }

    pub fn balance_with(
        &self,
        kind: BalanceKind,
        selector: &dyn CoinSelector,
    ) -> Amount {
        let mut candidates = self.spend_candidates();
        if matches!(
            kind,
            BalanceKind::AvailableSpendable | BalanceKind::EstimatedSpendable
        ) {
            candidates.retain(|coin| coin.spendable);
        }
        match kind {
            BalanceKind::Available | BalanceKind::AvailableSpendable =>
                selector.select(MAX_MONEY, candidates).total,
            BalanceKind::Estimated | BalanceKind::EstimatedSpendable =>
                candidates
                    .iter()
                    .map(Coin::value)
                    .fold(Amount::ZERO, |acc, value| acc + value),
        }
    }

    // --- Commit (inbound pending / outbound send) --- //

    /// Make the wallet track `tx`: connect its spends, classify it against
    /// every pool, route it into a pool, and mark touched keys used.
    pub fn commit(
        &mut self,
        tx: Transaction,
        source: TxSource,
    ) -> Result<Txid, ConsistencyError> {
        let now = TimestampMs::now();
        let wtx = WalletTx::new(tx, source, now);
        let txid = wtx.txid();
        if self.pools.is_tracked(txid) {
            debug!(%txid, "commit: already tracked");
            return Ok(txid);
        }

        let prev_balance = self.balance(BalanceKind::Estimated);
        let value_to_me = self.value_sent_to_me(wtx.tx());
        let value_from_me = self.value_sent_from_me(wtx.tx());
        info!(
            %txid, %value_to_me, %value_from_me,
            "Committing transaction"
        );

        // Classify against each pool before connecting anything.
        let confirmed_conflicts =
            self.double_spends_of(&wtx, &[Pool::Unspent, Pool::Spent]);
        let spends_dead = wtx.input_outpoints().any(|outpoint| {
            self.pools.pool_of(outpoint.txid) == Some(Pool::Dead)
        });
        let pending_conflicts = self.double_spends_of(&wtx, &[Pool::Pending]);
        let spends_conflicted = wtx.input_outpoints().any(|outpoint| {
            self.confidence_kind(outpoint.txid)
                == Some(ConfidenceKind::InConflict)
        });

        if !confirmed_conflicts.is_empty() || spends_dead {
            // Already overridden on arrival: it conflicts with the chain
            // (or builds on something dead). Track it as dead, inheriting
            // the dead parent's overrider when the conflict is inherited.
            let overriding = confirmed_conflicts.first().copied().or_else(|| {
                wtx.input_outpoints().find_map(|outpoint| {
                    self.confidence
                        .get(outpoint.txid)
                        .filter(|conf| conf.kind == ConfidenceKind::Dead)
                        .and_then(|conf| conf.overriding_txid)
                })
            });
            self.pools.put(Pool::Dead, wtx)?;
            self.confidence.set_dead(txid, overriding);
            self.queue_event(WalletEvent::ConfidenceChanged { txid });
            self.is_consistent_or_throw()?;
            return Ok(txid);
        }

        self.update_for_spends(&wtx, SpendSource::Mempool)?;

        self.pools.put(Pool::Pending, wtx)?;
        // Safe to look the tx back up from here on.
        self.index_owned_outputs(txid);

        if !pending_conflicts.is_empty() || spends_conflicted {
            // Miner arbitration will pick a winner; meanwhile the whole
            // dependency closure on both sides is suspect.
            let mut conflicted = self.descendants_of(&pending_conflicts);
            conflicted.extend(pending_conflicts.iter().copied());
            conflicted.insert(txid);
            for conflicted_txid in conflicted {
                self.confidence.set_in_conflict(conflicted_txid);
                self.queue_event(WalletEvent::ConfidenceChanged {
                    txid: conflicted_txid,
                });
            }
        } else {
            self.confidence.set_pending(txid);
        }

        self.mark_keys_used(txid);

        let new_balance = self.balance(BalanceKind::Estimated);
        if value_to_me > Amount::ZERO {
            self.queue_event(WalletEvent::CoinsReceived {
                txid,
                prev_balance,
                new_balance,
            });
        }
        if value_from_me > Amount::ZERO {
            self.queue_event(WalletEvent::CoinsSent {
                txid,
                prev_balance,
                new_balance,
            });
        }
        self.queue_event(WalletEvent::Changed);

        self.is_consistent_or_throw()?;
        Ok(txid)
    }

    fn confidence_kind(&self, txid: Txid) -> Option<ConfidenceKind> {
        self.confidence.get(txid).map(|conf| conf.kind)
    }

    /// Tracked transactions in `pools` sharing an input outpoint with
    /// `wtx` (i.e. double spends), excluding `wtx` itself.
    fn double_spends_of(&self, wtx: &WalletTx, pools: &[Pool]) -> Vec<Txid> {
        let outpoints: HashSet<OutPoint> = wtx.input_outpoints().collect();
        if outpoints.is_empty() {
            return Vec::new();
        }
        let mut conflicting = Vec::new();
        for pool in pools {
            for other in self.pools.txs_in_pool(*pool) {
                if other.txid() == wtx.txid() {
                    continue;
                }
                if other
                    .input_outpoints()
                    .any(|outpoint| outpoints.contains(&outpoint))
                {
                    conflicting.push(other.txid());
                }
            }
        }
        conflicting
    }

    /// All tracked transactions that (transitively) spend outputs of
    /// `roots`.
    fn descendants_of(&self, roots: &[Txid]) -> HashSet<Txid> {
        let mut result = HashSet::new();
        let mut work: Vec<Txid> = roots.to_vec();
        while let Some(txid) = work.pop() {
            let wtx = match self.pools.get(txid) {
                Some(wtx) => wtx,
                None => continue,
            };
            for vout in 0..wtx.tx().output.len() as u32 {
                let outpoint = wtx.outpoint(vout);
                if let Some(spender) = self.pools.spender_of(outpoint) {
                    if result.insert(spender.spender) {
                        work.push(spender.spender);
                    }
                }
            }
        }
        result
    }

    /// Connect `wtx`'s inputs to tracked outputs, and tracked pending
    /// inputs to `wtx`'s outputs.
    ///
    /// With `SpendSource::Mempool`, an existing conflicting connection
    /// aborts that input's connection (double-spend classification happens
    /// in [`commit`](Self::commit)). With `SpendSource::Chain`, the chain
    /// transaction wins: the previously connected pending spender and its
    /// dependency closure are killed.
    pub(crate) fn update_for_spends(
        &mut self,
        wtx: &WalletTx,
        source: SpendSource,
    ) -> Result<(), ConsistencyError> {
        let txid = wtx.txid();

        // Inputs: connect to tracked funding outputs.
        let inputs: Vec<(u32, OutPoint)> = wtx
            .input_outpoints()
            .enumerate()
            .map(|(vin, outpoint)| (vin as u32, outpoint))
            .collect();
        for (vin, outpoint) in inputs {
            if self.pools.output(outpoint).is_none() {
                continue;
            }
            let spender = InputRef { spender: txid, vin };
            match self.pools.connect(outpoint, spender) {
                Ok(()) => self.finish_connect(outpoint),
                Err(existing) => match source {
                    SpendSource::Mempool => {
                        // Leave both sides for conflict classification.
                        debug!(
                            %txid, %outpoint, rival = %existing.spender,
                            "connection aborted on conflict"
                        );
                    }
                    SpendSource::Chain => {
                        // The chain spend overrides whatever pending
                        // transaction thought it owned this outpoint.
                        warn!(
                            %txid, %outpoint, loser = %existing.spender,
                            "chain transaction overrides pending spender"
                        );
                        self.kill_transactions(
                            Some(txid),
                            vec![existing.spender],
                        )?;
                        self.pools
                            .connect(outpoint, spender)
                            .map_err(|stale| {
                                ConsistencyError::new(format!(
                                    "outpoint {outpoint} still spent by \
                                     {} after kill",
                                    stale.spender
                                ))
                            })?;
                        self.finish_connect(outpoint);
                    }
                },
            }
        }

        // Outputs: pending transactions may already cite them (dependency
        // arrived after its spender).
        let num_outputs = wtx.tx().output.len() as u32;
        for vout in 0..num_outputs {
            let outpoint = wtx.outpoint(vout);
            let citing: Vec<InputRef> = self
                .pools
                .txs_in_pool(Pool::Pending)
                .filter(|pending| pending.txid() != txid)
                .filter_map(|pending| {
                    pending.spending_input(outpoint).map(|vin| InputRef {
                        spender: pending.txid(),
                        vin,
                    })
                })
                .collect();
            // First one wins; the rest stay unconnected and will be
            // classified as conflicts by their own commit path.
            if let Some(spender) = citing.first() {
                if self.pools.connect(outpoint, *spender).is_ok() {
                    self.finish_connect(outpoint);
                }
            }
        }

        Ok(())
    }

    /// After a successful connection: flip availability bookkeeping and
    /// maybe move the (confirmed) parent to SPENT.
    fn finish_connect(&mut self, outpoint: OutPoint) {
        self.pools.remove_my_unspent(outpoint);
        self.maybe_move_pool(outpoint.txid);
    }

    /// Re-evaluate a confirmed parent's UNSPENT/SPENT membership from its
    /// outputs' availability.
    fn maybe_move_pool(&mut self, txid: Txid) {
        let pool = match self.pools.pool_of(txid) {
            Some(pool @ (Pool::Unspent | Pool::Spent)) => pool,
            _ => return,
        };
        let has_owned_available = self.has_owned_available_output(txid);
        match (pool, has_owned_available) {
            (Pool::Unspent, false) => {
                let _ = self.pools.move_pool(txid, Pool::Unspent, Pool::Spent);
            }
            (Pool::Spent, true) => {
                let _ = self.pools.move_pool(txid, Pool::Spent, Pool::Unspent);
            }
            _ => (),
        }
    }

    fn has_owned_available_output(&self, txid: Txid) -> bool {
        let wtx = match self.pools.get(txid) {
            Some(wtx) => wtx,
            None => return false,
        };
        (0..wtx.tx().output.len() as u32).any(|vout| {
            let outpoint = wtx.outpoint(vout);
            wtx.output(vout)
                .map(|output| self.is_mine_output(output))
                .unwrap_or(false)
                && self.pools.is_available(outpoint)
        })
    }

    /// Add the owned available outputs of a tracked non-dead transaction
    /// to `my_unspents`.
    fn index_owned_outputs(&mut self, txid: Txid) {
        let wtx = match self.pools.get(txid) {
            Some(wtx) => wtx,
            None => return,
        };
        let owned: Vec<OutPoint> = (0..wtx.tx().output.len() as u32)
            .filter(|vout| {
                wtx.output(*vout)
                    .map(|output| self.is_mine_output(output))
                    .unwrap_or(false)
            })
            .map(|vout| wtx.outpoint(vout))
            .filter(|outpoint| self.pools.is_available(*outpoint))
            .collect();
        for outpoint in owned {
            self.pools.add_my_unspent(outpoint);
        }
    }

    /// Advance the deterministic lookahead past every key `txid` touches.
    fn mark_keys_used(&mut self, txid: Txid) {
        let scripts: Vec<bitcoin::ScriptBuf> = match self.pools.get(txid) {
            Some(wtx) => wtx
                .tx()
                .output
                .iter()
                .map(|output| output.script_pubkey.clone())
                .collect(),
            None => return,
        };
        for script in scripts {
            self.keys.mark_script_used(&script);
        }
    }

    /// Kill `victims` and every tracked descendant: disconnect their
    /// spends (restoring parent outputs), drop their outputs from
    /// `my_unspents`, move them to DEAD, and record the overriding txid.
    pub(crate) fn kill_transactions(
        &mut self,
        overriding: Option<Txid>,
        victims: Vec<Txid>,
    ) -> Result<(), ConsistencyError> {
        let mut work = victims;
        while let Some(victim) = work.pop() {
            let pool = match self.pools.pool_of(victim) {
                Some(Pool::Dead) | None => continue,
                Some(pool) => pool,
            };
            info!(%victim, ?overriding, "killing transaction");

            let (inputs, num_outputs): (Vec<(u32, OutPoint)>, u32) = {
                let wtx = self
                    .pools
                    .get(victim)
                    .expect("pool membership implies tracked");
                (
                    wtx.input_outpoints()
                        .enumerate()
                        .map(|(vin, outpoint)| (vin as u32, outpoint))
                        .collect(),
                    wtx.tx().output.len() as u32,
                )
            };

            // Release the outputs this victim was spending.
            for (vin, outpoint) in inputs {
                let ours = InputRef { spender: victim, vin };
                if self.pools.spender_of(outpoint) == Some(ours) {
                    self.pools.disconnect(outpoint);
                    let parent_pool = self.pools.pool_of(outpoint.txid);
                    let owned = self
                        .pools
                        .output(outpoint)
                        .map(|output| self.is_mine_output(output))
                        .unwrap_or(false);
                    if owned
                        && matches!(
                            parent_pool,
                            Some(Pool::Unspent | Pool::Spent | Pool::Pending)
                        )
                    {
                        self.pools.add_my_unspent(outpoint);
                    }
                    self.maybe_move_pool(outpoint.txid);
                }
            }

            // Anything spending the victim's outputs dies with it.
            for vout in 0..num_outputs {
                let outpoint = OutPoint { txid: victim, vout };
                self.pools.remove_my_unspent(outpoint);
                if let Some(spender) = self.pools.spender_of(outpoint) {
                    self.pools.disconnect(outpoint);
                    work.push(spender.spender);
                }
            }

            self.pools.move_pool(victim, pool, Pool::Dead)?;
            self.confidence.set_dead(victim, overriding);
            self.queue_event(WalletEvent::ConfidenceChanged { txid: victim });
        }
        Ok(())
    }

    // --- Block chain callbacks --- //

    /// Fast path for the filtered-block downloader: returns whether we
    /// track `txid` (and processed the appearance) without needing the full
    /// transaction.
    pub fn notify_tx_in_block(
        &mut self,
        txid: Txid,
        block: BlockId,
        block_type: BlockType,
        offset: u32,
    ) -> Result<bool, ConsistencyError> {
        let tx = match self.pools.get(txid) {
            Some(wtx) => wtx.tx().clone(),
            None => return Ok(false),
        };
        self.receive_from_block(tx, block, block_type, offset)?;
        Ok(true)
    }

    /// A (relevant) transaction appeared in a block.
    pub fn receive_from_block(
        &mut self,
        tx: Transaction,
        block: BlockId,
        block_type: BlockType,
        offset: u32,
    ) -> Result<(), ConsistencyError> {
        let txid = tx.compute_txid();
        debug!(%txid, %block, ?block_type, offset, "receive from block");

        let prev_balance = self.balance(BalanceKind::Estimated);
        let was_tracked = self.pools.is_tracked(txid);
        let value_to_me = self.value_sent_to_me(&tx);

        // A dead transaction reappearing on the best chain is resurrected;
        // the chain is authoritative. For a coinbase this is the expected
        // undo of an earlier reorg. A dead double-spend loser reappearing
        // means the branch that confirmed its rival was itself rolled
        // back, so the rival dies below instead.
        if block_type == BlockType::BestChain
            && self.pools.pool_of(txid) == Some(Pool::Dead)
        {
            if tx.is_coinbase() {
                info!(%txid, "resurrecting reorged-out coinbase");
            } else {
                warn!(%txid, "dead transaction reappeared on best chain");
            }
            self.pools.move_pool(txid, Pool::Dead, Pool::Pending)?;
            self.confidence.set_pending(txid);
        }

        if !self.pools.is_tracked(txid) {
            let now = TimestampMs::now();
            let wtx = WalletTx::new(tx, TxSource::Network, now);
            // Side-chain transactions are tracked as pending; best-chain
            // routing below moves them out.
            self.pools.put(Pool::Pending, wtx)?;
            self.confidence.set_pending(txid);
        }

        if let Some(wtx) = self.pools.get_mut(txid) {
            wtx.add_appearance(block.hash, offset);
            wtx.update_time = TimestampMs::now();
        }

        if block_type == BlockType::BestChain {
            let wtx_snapshot = self
                .pools
                .get(txid)
                .expect("inserted above")
                .clone();
            self.update_for_spends(&wtx_snapshot, SpendSource::Chain)?;
            self.index_owned_outputs(txid);

            // Any pending rival double-spending this (now confirmed)
            // transaction loses.
            let rivals =
                self.double_spends_of(&wtx_snapshot, &[Pool::Pending]);
            if !rivals.is_empty() {
                self.kill_transactions(Some(txid), rivals)?;
            }

            // Route into UNSPENT or SPENT.
            let from_pool = self
                .pools
                .pool_of(txid)
                .expect("tracked");
            let to_pool = if self.has_owned_available_output(txid) {
                Pool::Unspent
            } else {
                Pool::Spent
            };
            if from_pool != to_pool {
                self.pools.move_pool(txid, from_pool, to_pool)?;
            }

            self.confidence.set_building(txid, block);
            self.ignore_next_depth_bump.insert(txid);
            self.queue_event(WalletEvent::ConfidenceChanged { txid });

            // Conflicts this confirmation resolved can go back to pending.
            self.demote_resolved_conflicts();

            self.mark_keys_used(txid);
        }

        if !was_tracked && value_to_me > Amount::ZERO {
            let new_balance = self.balance(BalanceKind::Estimated);
            self.queue_event(WalletEvent::CoinsReceived {
                txid,
                prev_balance,
                new_balance,
            });
        }
        self.queue_event(WalletEvent::Changed);

        self.is_consistent_or_throw()
    }

    /// Clear IN_CONFLICT back to PENDING for every pending transaction
    /// that no longer shares an outpoint with another pending transaction
    /// and no longer builds on a conflicted or dead ancestor. Runs to a
    /// fixed point so whole dependency closures settle together.
    fn demote_resolved_conflicts(&mut self) {
        loop {
            let conflicted: Vec<Txid> = self
                .pools
                .ids_in_pool(Pool::Pending)
                .filter(|txid| {
                    self.confidence_kind(*txid)
                        == Some(ConfidenceKind::InConflict)
                })
                .collect();

            let mut changed = false;
            for txid in conflicted {
                let wtx = match self.pools.get(txid) {
                    Some(wtx) => wtx.clone(),
                    None => continue,
                };
                let still_double_spent = !self
                    .double_spends_of(&wtx, &[Pool::Pending])
                    .is_empty();
                let bad_ancestor = wtx.input_outpoints().any(|outpoint| {
                    matches!(
                        self.confidence_kind(outpoint.txid),
                        Some(
                            ConfidenceKind::InConflict | ConfidenceKind::Dead
                        )
                    ) && self.pools.is_tracked(outpoint.txid)
                });
                if !still_double_spent && !bad_ancestor {
                    self.confidence.demote_to_pending(txid);
                    self.queue_event(WalletEvent::ConfidenceChanged { txid });
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// A new block extended the best chain (without containing anything
    /// relevant beyond what `receive_from_block` already delivered).
    pub fn notify_new_best_block(
        &mut self,
        block: BlockId,
        time: TimestampMs,
    ) -> Result<(), ConsistencyError> {
        if self.last_block_seen.map(|seen| seen.block.hash)
            == Some(block.hash)
        {
            return Ok(());
        }
        debug!(%block, "new best block");

        let confirmed: Vec<Txid> = self
            .pools
            .ids_in_pool(Pool::Unspent)
            .chain(self.pools.ids_in_pool(Pool::Spent))
            .collect();
        for txid in confirmed {
            if self.ignore_next_depth_bump.contains(&txid) {
                continue;
            }
            if self.confidence_kind(txid) == Some(ConfidenceKind::Building) {
                let depth = self.confidence.bump_depth(txid);
                if depth > EVENT_HORIZON {
                    // Deep enough that a reorg is no longer plausible; the
                    // broadcast peer set has served its purpose.
                    self.confidence.clear_seen_by(txid);
                }
                self.queue_event(WalletEvent::ConfidenceChanged { txid });
            }
        }
        self.ignore_next_depth_bump.clear();

        self.last_block_seen = Some(LastBlockSeen { block, time });
        self.queue_event(WalletEvent::Changed);
        self.is_consistent_or_throw()
    }

    // --- Reorganization --- //

    /// The best chain switched branches at `split_point`.
    ///
    /// `old_blocks` are the rolled-back blocks, tip first; `new_blocks`
    /// the replacement branch, tip first. Transactions confirmed in old
    /// blocks return to PENDING and are replayed into whichever new blocks
    /// contain them (by their recorded appearances).
    pub fn reorganize(
        &mut self,
        split_point: BlockId,
        old_blocks: &[BlockId],
        new_blocks: &[BlockId],
    ) -> Result<(), ConsistencyError> {
        info!(
            %split_point,
            old = old_blocks.len(),
            new = new_blocks.len(),
            "reorganizing"
        );

        // Bucket affected transactions by old block, offset-ordered.
        let mut by_block: HashMap<bitcoin::BlockHash, Vec<(u32, Txid)>> =
            HashMap::new();
        for txid in self.pools.all_ids().collect::<Vec<_>>() {
            let wtx = match self.pools.get(txid) {
                Some(wtx) => wtx,
                None => continue,
            };
            for old in old_blocks {
                if let Some(offset) = wtx.appearances.get(&old.hash) {
                    by_block
                        .entry(old.hash)
                        .or_default()
                        .push((*offset, txid));
                }
            }
        }
        for bucket in by_block.values_mut() {
            bucket.sort_unstable();
        }

        // Walk the dying branch from the tip toward the split point,
        // unwinding each block's transactions in reverse in-block order.
        let mut buffered: Vec<(u32, u32, Txid)> = Vec::new();
        for (block_index, old) in old_blocks.iter().enumerate() {
            let bucket = match by_block.remove(&old.hash) {
                Some(bucket) => bucket,
                None => continue,
            };
            for (offset, txid) in bucket.into_iter().rev() {
                // NOTE: the appearance record is kept even though the
                // block is rolled back, so a later reorg back onto this
                // branch can replay the transaction into it.
                if self.pools.pool_of(txid) == Some(Pool::Dead) {
                    // Dead stays dead; only a best-chain reappearance
                    // resurrects.
                    continue;
                }
                let is_coinbase = self
                    .pools
                    .get(txid)
                    .map(WalletTx::is_coinbase)
                    .unwrap_or(false);
                if is_coinbase {
                    // The coinbase never happened on this branch; it and
                    // everything built on it are gone.
                    self.kill_transactions(None, vec![txid])?;
                    continue;
                }

                let num_outputs = self
                    .pools
                    .get(txid)
                    .map(|wtx| wtx.tx().output.len() as u32)
                    .unwrap_or(0);
                for vout in 0..num_outputs {
                    let outpoint = OutPoint { txid, vout };
                    self.pools.disconnect(outpoint);
                    let owned = self
                        .pools
                        .output(outpoint)
                        .map(|output| self.is_mine_output(output))
                        .unwrap_or(false);
                    if owned {
                        self.pools.add_my_unspent(outpoint);
                    }
                }

                buffered.push((block_index as u32, offset, txid));
            }
        }

        // Demote the buffered transactions to pending, oldest first, and
        // re-run mempool-mode spend connection over them.
        buffered.sort_unstable_by(|a, b| {
            // block_index counts from the tip, so higher index = older.
            b.0.cmp(&a.0).then(a.1.cmp(&b.1))
        });
        for (_, _, txid) in &buffered {
            let txid = *txid;
            if let Some(pool @ (Pool::Unspent | Pool::Spent)) =
                self.pools.pool_of(txid)
            {
                self.pools.move_pool(txid, pool, Pool::Pending)?;
            }
            self.confidence.demote_to_pending(txid);
            self.queue_event(WalletEvent::ConfidenceChanged { txid });
        }
        for (_, _, txid) in &buffered {
            if let Some(wtx) = self.pools.get(*txid).cloned() {
                self.update_for_spends(&wtx, SpendSource::Mempool)?;
                self.index_owned_outputs(*txid);
            }
        }

        // Everything still building just lost |old_blocks| of depth.
        let building: Vec<Txid> = self
            .pools
            .ids_in_pool(Pool::Unspent)
            .chain(self.pools.ids_in_pool(Pool::Spent))
            .filter(|txid| {
                self.confidence_kind(*txid) == Some(ConfidenceKind::Building)
            })
            .collect();
        for txid in building {
            self.confidence.subtract_depth(txid, old_blocks.len() as u32);
        }

        self.last_block_seen = Some(LastBlockSeen {
            block: split_point,
            time: TimestampMs::now(),
        });

        // Replay the new branch bottom-up: re-confirm every tracked
        // transaction that appears in each new block, then advance the
        // best block.
        for new in new_blocks.iter().rev() {
            let mut appearing: Vec<(u32, Txid)> = self
                .pools
                .all_ids()
                .collect::<Vec<_>>()
                .into_iter()
                .filter_map(|txid| {
                    let wtx = self.pools.get(txid)?;
                    let offset = wtx.appearances.get(&new.hash)?;
                    Some((*offset, txid))
                })
                .collect();
            appearing.sort_unstable();
            for (offset, txid) in appearing {
                let tx = self
                    .pools
                    .get(txid)
                    .expect("appearing implies tracked")
                    .tx()
                    .clone();
                self.receive_from_block(
                    tx,
                    *new,
                    BlockType::BestChain,
                    offset,
                )?;
            }
            self.notify_new_best_block(*new, TimestampMs::now())?;
        }

        self.queue_event(WalletEvent::Reorganized);
        self.is_consistent_or_throw()
    }

    // --- Maintenance --- //

    /// Drop risk-diverted and risky unconfirmed transactions whose outputs
    /// nothing depends on.
    pub fn cleanup(&mut self) {
        self.pools.clear_risk_dropped();
    }

    /// Forget all transaction state (keys are kept) so history can be
    /// replayed from the key birth time.
    pub fn reset(&mut self) {
        let all: Vec<Txid> = self.pools.all_ids().collect();
        for txid in &all {
            self.confidence.forget(*txid);
        }
        self.pools = PoolStore::new();
        self.last_block_seen = None;
        self.ignore_next_depth_bump.clear();
        self.queue_event(WalletEvent::Changed);
    }

    // --- Consistency --- //

    /// Check every structural invariant; call after each mutator.
    pub fn is_consistent_or_throw(&self) -> Result<(), ConsistencyError> {
        // 1. Disjoint pools covering the id→tx index.
        let mut seen = HashSet::new();
        for pool in Pool::ALL {
            for txid in self.pools.ids_in_pool(pool) {
                let pools = self.pools.pools_of(txid);
                if pools.len() != 1 {
                    return Err(ConsistencyError::new(format!(
                        "{txid} is in pools {pools:?}"
                    )));
                }
                if !self.pools.is_tracked(txid) {
                    return Err(ConsistencyError::new(format!(
                        "{txid} is pooled but not indexed"
                    )));
                }
                seen.insert(txid);
            }
        }
        if seen.len() != self.pools.num_tracked() {
            return Err(ConsistencyError::new(format!(
                "{} pooled vs {} indexed transactions",
                seen.len(),
                self.pools.num_tracked()
            )));
        }

        // 2. UNSPENT/SPENT membership matches output availability.
        for wtx in self.pools.txs_in_pool(Pool::Unspent) {
            if !self.has_owned_available_output(wtx.txid()) {
                return Err(ConsistencyError::new(format!(
                    "{} is UNSPENT without an owned available output",
                    wtx.txid()
                )));
            }
        }
        for wtx in self.pools.txs_in_pool(Pool::Spent) {
            if self.has_owned_available_output(wtx.txid()) {
                return Err(ConsistencyError::new(format!(
                    "{} is SPENT with an owned available output",
                    wtx.txid()
                )));
            }
        }

        // 3. Spent-by back-references point at real citing inputs.
        for txid in self.pools.all_ids() {
            let wtx = self.pools.get(txid).expect("tracked");
            for outpoint in
                (0..wtx.tx().output.len() as u32).map(|v| wtx.outpoint(v))
            {
                if let Some(spender) = self.pools.spender_of(outpoint) {
                    let citing = self
                        .pools
                        .get(spender.spender)
                        .and_then(|s| s.spending_input(outpoint));
                    if citing != Some(spender.vin) {
                        return Err(ConsistencyError::new(format!(
                            "spent-by of {outpoint} names input \
                             {}:{} which does not cite it",
                            spender.spender, spender.vin
                        )));
                    }
                }
            }
        }

        // 4. my_unspents == owned available outputs of UNSPENT/PENDING.
        for outpoint in self.pools.my_unspent_outpoints() {
            let parent_pool = self.pools.pool_of(outpoint.txid);
            if !matches!(parent_pool, Some(Pool::Unspent | Pool::Pending)) {
                return Err(ConsistencyError::new(format!(
                    "my_unspents contains {outpoint} whose parent is in \
                     {parent_pool:?}"
                )));
            }
            if !self.pools.is_available(outpoint) {
                return Err(ConsistencyError::new(format!(
                    "my_unspents contains spent outpoint {outpoint}"
                )));
            }
            let owned = self
                .pools
                .output(outpoint)
                .map(|output| self.is_mine_output(output))
                .unwrap_or(false);
            if !owned {
                return Err(ConsistencyError::new(format!(
                    "my_unspents contains foreign outpoint {outpoint}"
                )));
            }
        }
        for pool in [Pool::Unspent, Pool::Pending] {
            let ids: Vec<Txid> = self.pools.ids_in_pool(pool).collect();
            for txid in ids {
                let wtx = self.pools.get(txid).expect("tracked");
                for vout in 0..wtx.tx().output.len() as u32 {
                    let outpoint = wtx.outpoint(vout);
                    let owned = wtx
                        .output(vout)
                        .map(|output| self.is_mine_output(output))
                        .unwrap_or(false);
                    if owned
                        && self.pools.is_available(outpoint)
                        && !self.pools.is_my_unspent(outpoint)
                    {
                        return Err(ConsistencyError::new(format!(
                            "owned available {outpoint} missing from \
                             my_unspents"
                        )));
                    }
                }
            }
        }

        // 5. Confidence agrees with pool membership.
        for pool in Pool::ALL {
            for txid in self.pools.ids_in_pool(pool) {
                let kind = self.confidence_kind(txid);
                let ok = match pool {
                    Pool::Unspent | Pool::Spent =>
                        kind == Some(ConfidenceKind::Building),
                    Pool::Pending => matches!(
                        kind,
                        Some(
                            ConfidenceKind::Pending
                                | ConfidenceKind::InConflict
                        )
                    ),
                    Pool::Dead => kind == Some(ConfidenceKind::Dead),
                };
                if !ok {
                    return Err(ConsistencyError::new(format!(
                        "{txid} in pool {pool} has confidence {kind:?}"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::Hash as _;

    use super::*;
    use crate::{
        keys::{KeyBag as _, ScriptType},
        test_utils::{
            self, block, block_prime, commit_self, confirm, foreign_outpoint,
            foreign_spend, fund_confirmed, fund_pending, payment_to,
        },
    };

    const SAT: fn(u64) -> Amount = Amount::from_sat;

    #[test]
    fn pending_then_confirmed_balances() {
        // S2: pending funds are estimated-only until the block arrives.
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let tx_a = fund_pending(&mut state, SAT(100_000), 1);
        let txid_a = tx_a.compute_txid();

        assert_eq!(state.balance(BalanceKind::Available), Amount::ZERO);
        assert_eq!(state.balance(BalanceKind::Estimated), SAT(100_000));
        assert_eq!(state.pools.pool_of(txid_a), Some(Pool::Pending));

        confirm(&mut state, tx_a, block(10), 0);

        assert_eq!(state.balance(BalanceKind::Available), SAT(100_000));
        assert_eq!(state.pools.pool_of(txid_a), Some(Pool::Unspent));
        let conf = state.confidence.get(txid_a).unwrap();
        assert_eq!(conf.kind, ConfidenceKind::Building);
        assert_eq!(conf.depth, 1);
        assert_eq!(conf.appeared_in, Some(block(10)));
    }

    #[test]
    fn receive_pending_is_idempotent() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let script = state.keys.fresh_receive_script();
        let tx = payment_to(script, SAT(40_000), foreign_outpoint(7));

        assert!(state.receive_pending(tx.clone(), &[]).unwrap());
        assert!(!state.receive_pending(tx, &[]).unwrap());

        assert_eq!(state.pools.num_tracked(), 1);
        assert_eq!(state.balance(BalanceKind::Estimated), SAT(40_000));
    }

    #[test]
    fn irrelevant_pending_is_ignored() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let tx = foreign_spend(vec![foreign_outpoint(9)], SAT(5_000));
        assert!(!state.receive_pending(tx, &[]).unwrap());
        assert_eq!(state.pools.num_tracked(), 0);
    }

    #[test]
    fn chain_double_spend_kills_pending_spender() {
        // S3: a confirmed double spend overrides our pending spend.
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let funding = fund_confirmed(&mut state, SAT(100_000), 1, block(10));
        let outpoint_x = OutPoint {
            txid: funding.compute_txid(),
            vout: 0,
        };

        // Our own pending spend of X, with change back to us.
        let change = state.keys.current_change_script();
        let mut tx_p = foreign_spend(vec![outpoint_x], SAT(60_000));
        tx_p.output.push(bitcoin::TxOut {
            value: SAT(39_000),
            script_pubkey: change,
        });
        let txid_p = commit_self(&mut state, tx_p);
        assert_eq!(state.balance(BalanceKind::Estimated), SAT(39_000));

        // A rival spend of X confirms instead.
        let tx_q = foreign_spend(vec![outpoint_x], SAT(99_000));
        let txid_q = tx_q.compute_txid();
        confirm(&mut state, tx_q, block(11), 0);

        assert_eq!(state.pools.pool_of(txid_p), Some(Pool::Dead));
        let conf_p = state.confidence.get(txid_p).unwrap();
        assert_eq!(conf_p.kind, ConfidenceKind::Dead);
        assert_eq!(conf_p.overriding_txid, Some(txid_q));

        // tx_q pays a stranger, so it lands in SPENT; nothing of ours is
        // left.
        assert_eq!(state.pools.pool_of(txid_q), Some(Pool::Spent));
        assert_eq!(state.balance(BalanceKind::Estimated), Amount::ZERO);
        assert_eq!(state.pools.pool_of(funding.compute_txid()), Some(Pool::Spent));
    }

    #[test]
    fn spend_of_dead_output_is_dead_on_arrival() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let funding = fund_confirmed(&mut state, SAT(50_000), 1, block(10));
        let outpoint_x = OutPoint {
            txid: funding.compute_txid(),
            vout: 0,
        };

        let change = state.keys.current_change_script();
        let tx_p = payment_to(change, SAT(49_000), outpoint_x);
        let txid_p = commit_self(&mut state, tx_p.clone());

        // Rival confirms; tx_p dies.
        let tx_q = foreign_spend(vec![outpoint_x], SAT(49_500));
        confirm(&mut state, tx_q, block(11), 0);
        assert_eq!(state.pools.pool_of(txid_p), Some(Pool::Dead));

        // A child spending tx_p's output inherits death and the overrider.
        let child = foreign_spend(
            vec![OutPoint { txid: txid_p, vout: 0 }],
            SAT(48_000),
        );
        let txid_child = child.compute_txid();
        state.commit(child, TxSource::Network).unwrap();
        assert_eq!(state.pools.pool_of(txid_child), Some(Pool::Dead));
        let conf = state.confidence.get(txid_child).unwrap();
        assert_eq!(conf.overriding_txid, Some(tx_q_txid(&state, outpoint_x)));
    }

    fn tx_q_txid(state: &WalletState, outpoint: OutPoint) -> Txid {
        state
            .pools
            .spender_of(outpoint)
            .expect("outpoint is spent by the confirmed rival")
            .spender
    }

    #[test]
    fn mutual_pending_double_spends_go_in_conflict() {
        // Open question (a): neither side wins until a miner arbitrates.
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let funding = fund_confirmed(&mut state, SAT(80_000), 1, block(10));
        let outpoint_x = OutPoint {
            txid: funding.compute_txid(),
            vout: 0,
        };

        let change_a = state.keys.current_change_script();
        let tx_a = payment_to(change_a, SAT(79_000), outpoint_x);
        let txid_a = state.commit(tx_a, TxSource::Network).unwrap();

        let mut tx_b = foreign_spend(vec![outpoint_x], SAT(78_000));
        tx_b.lock_time = bitcoin::absolute::LockTime::from_consensus(1);
        let txid_b = state.commit(tx_b.clone(), TxSource::Network).unwrap();

        assert_eq!(
            state.confidence.get(txid_a).unwrap().kind,
            ConfidenceKind::InConflict
        );
        assert_eq!(
            state.confidence.get(txid_b).unwrap().kind,
            ConfidenceKind::InConflict
        );
        assert_eq!(state.pools.pool_of(txid_a), Some(Pool::Pending));
        assert_eq!(state.pools.pool_of(txid_b), Some(Pool::Pending));

        // Miner arbitration: tx_b confirms, tx_a dies.
        confirm(&mut state, tx_b, block(11), 0);
        assert_eq!(state.pools.pool_of(txid_a), Some(Pool::Dead));
        assert_eq!(state.pools.pool_of(txid_b), Some(Pool::Spent));
        assert_eq!(
            state.confidence.get(txid_a).unwrap().overriding_txid,
            Some(txid_b)
        );
    }

    #[test]
    fn reorg_restores_pending_and_replays() {
        // S4: rolling back the confirming block demotes to pending.
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let tx_a = fund_pending(&mut state, SAT(100_000), 1);
        let txid_a = tx_a.compute_txid();
        confirm(&mut state, tx_a.clone(), block(10), 0);
        assert_eq!(state.balance(BalanceKind::Available), SAT(100_000));

        let split = block(9);
        state.reorganize(split, &[block(10)], &[]).unwrap();

        assert_eq!(state.pools.pool_of(txid_a), Some(Pool::Pending));
        let conf = state.confidence.get(txid_a).unwrap();
        assert_eq!(conf.kind, ConfidenceKind::Pending);
        assert_eq!(conf.depth, 0);
        assert_eq!(
            state.last_block_seen.map(|seen| seen.block),
            Some(split)
        );
        assert_eq!(state.balance(BalanceKind::Available), Amount::ZERO);
        assert_eq!(state.balance(BalanceKind::Estimated), SAT(100_000));

        // The replacement branch arrives without tx_a...
        state
            .notify_new_best_block(
                block_prime(10),
                TimestampMs::from_secs(1_700_000_600),
            )
            .unwrap();
        assert_eq!(state.pools.pool_of(txid_a), Some(Pool::Pending));

        // ...then block 11 confirms it again.
        confirm(&mut state, tx_a, block(11), 0);
        let conf = state.confidence.get(txid_a).unwrap();
        assert_eq!(conf.kind, ConfidenceKind::Building);
        assert_eq!(conf.depth, 1);
        assert_eq!(state.balance(BalanceKind::Available), SAT(100_000));
    }

    #[test]
    fn reorg_roundtrip_restores_confirmed_state() {
        // reorganize(split, [B], []) then reorganize(split, [], [B])
        // restores what receive_from_block(B) originally produced.
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let tx_a = fund_pending(&mut state, SAT(30_000), 1);
        let txid_a = tx_a.compute_txid();
        confirm(&mut state, tx_a, block(10), 0);

        let split = block(9);
        state.reorganize(split, &[block(10)], &[]).unwrap();
        assert_eq!(state.pools.pool_of(txid_a), Some(Pool::Pending));

        state.reorganize(split, &[], &[block(10)]).unwrap();
        assert_eq!(state.pools.pool_of(txid_a), Some(Pool::Unspent));
        let conf = state.confidence.get(txid_a).unwrap();
        assert_eq!(conf.kind, ConfidenceKind::Building);
        assert_eq!(conf.depth, 1);
        assert_eq!(conf.appeared_in, Some(block(10)));
        assert_eq!(state.balance(BalanceKind::Available), SAT(30_000));
    }

    #[test]
    fn reorg_rolls_back_depth_of_deeper_transactions() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let tx_a = fund_pending(&mut state, SAT(10_000), 1);
        let txid_a = tx_a.compute_txid();
        confirm(&mut state, tx_a, block(5), 0);

        // Three more empty blocks: depth 4.
        for height in 6..=8 {
            state
                .notify_new_best_block(
                    block(height),
                    TimestampMs::from_secs(1_700_000_000),
                )
                .unwrap();
        }
        assert_eq!(state.confidence.get(txid_a).unwrap().depth, 4);

        // Blocks 7 and 8 are replaced by a single longer... shorter
        // branch; tx_a stays confirmed but loses two blocks of depth,
        // then regains one from the replacement block.
        state
            .reorganize(block(6), &[block(8), block(7)], &[block_prime(7)])
            .unwrap();
        let conf = state.confidence.get(txid_a).unwrap();
        assert_eq!(conf.kind, ConfidenceKind::Building);
        assert_eq!(conf.depth, 3);
    }

    #[test]
    fn reorged_out_coinbase_dies_and_descendants_follow() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let script = state.keys.fresh_receive_script();

        // A coinbase paying us, confirmed in block 10.
        let coinbase = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn {
                previous_output: OutPoint::null(),
                script_sig: bitcoin::ScriptBuf::new(),
                sequence: bitcoin::Sequence::MAX,
                witness: bitcoin::Witness::new(),
            }],
            output: vec![bitcoin::TxOut {
                value: SAT(5_000_000_000),
                script_pubkey: script,
            }],
        };
        assert!(coinbase.is_coinbase());
        let txid_cb = coinbase.compute_txid();
        confirm(&mut state, coinbase, block(10), 0);
        assert_eq!(state.pools.pool_of(txid_cb), Some(Pool::Unspent));

        // We spend it (immaturely, but the pool store doesn't police
        // that; the selector does).
        let change = state.keys.current_change_script();
        let spend = payment_to(
            change,
            SAT(4_999_000_000),
            OutPoint { txid: txid_cb, vout: 0 },
        );
        let txid_spend = commit_self(&mut state, spend);

        // The block vanishes; the coinbase never happened.
        state.reorganize(block(9), &[block(10)], &[]).unwrap();

        assert_eq!(state.pools.pool_of(txid_cb), Some(Pool::Dead));
        assert_eq!(state.pools.pool_of(txid_spend), Some(Pool::Dead));
        let conf = state.confidence.get(txid_cb).unwrap();
        assert_eq!(conf.kind, ConfidenceKind::Dead);
        // A reorged-out coinbase has no overriding transaction.
        assert_eq!(conf.overriding_txid, None);
        assert_eq!(state.balance(BalanceKind::Estimated), Amount::ZERO);
    }

    #[test]
    fn new_best_block_is_idempotent_per_hash() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let tx_a = fund_pending(&mut state, SAT(10_000), 1);
        let txid_a = tx_a.compute_txid();
        confirm(&mut state, tx_a, block(10), 0);

        let now = TimestampMs::from_secs(1_700_000_000);
        state.notify_new_best_block(block(10), now).unwrap();
        state.notify_new_best_block(block(10), now).unwrap();
        assert_eq!(state.confidence.get(txid_a).unwrap().depth, 1);
    }

    #[test]
    fn broadcast_peers_cleared_past_event_horizon() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let tx_a = fund_pending(&mut state, SAT(10_000), 1);
        let txid_a = tx_a.compute_txid();
        state.confidence.mark_seen_by(txid_a, "peer-1");
        confirm(&mut state, tx_a, block(10), 0);

        for height in 11..=(10 + EVENT_HORIZON) {
            state
                .notify_new_best_block(
                    block(height),
                    TimestampMs::from_secs(1_700_000_000),
                )
                .unwrap();
        }
        // depth == 11 > EVENT_HORIZON, so the peer set is gone.
        let conf = state.confidence.get(txid_a).unwrap();
        assert!(conf.depth > EVENT_HORIZON);
        assert_eq!(conf.num_broadcast_peers(), 0);
    }

    #[test]
    fn estimated_balance_dominates_available() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        fund_confirmed(&mut state, SAT(40_000), 1, block(10));
        fund_pending(&mut state, SAT(25_000), 2);

        let available = state.balance(BalanceKind::Available);
        let estimated = state.balance(BalanceKind::Estimated);
        assert_eq!(available, SAT(40_000));
        assert_eq!(estimated, SAT(65_000));
        assert!(estimated >= available);

        // Property 5: AVAILABLE equals what the default selector returns
        // for an unbounded target.
        let selected = crate::select::DefaultCoinSelector
            .select(MAX_MONEY, state.spend_candidates());
        assert_eq!(selected.total, available);
    }

    #[test]
    fn self_originated_change_spendable_once_propagated() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let funding = fund_confirmed(&mut state, SAT(50_000), 1, block(10));

        let change = state.keys.current_change_script();
        let mut spend = foreign_spend(
            vec![OutPoint { txid: funding.compute_txid(), vout: 0 }],
            SAT(20_000),
        );
        spend.output.push(bitcoin::TxOut {
            value: SAT(29_000),
            script_pubkey: change,
        });
        let txid_spend = commit_self(&mut state, spend);

        // Unpropagated self-change is not available.
        assert_eq!(state.balance(BalanceKind::Available), Amount::ZERO);
        state.confidence.mark_seen_by(txid_spend, "peer-1");
        assert_eq!(state.balance(BalanceKind::Available), SAT(29_000));
    }

    #[test]
    fn late_dependency_connects_to_waiting_spender() {
        // The spender arrives before the transaction that funds it.
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let script = state.keys.fresh_receive_script();
        let funding = payment_to(script, SAT(70_000), foreign_outpoint(4));
        let funding_txid = funding.compute_txid();

        let change = state.keys.current_change_script();
        let spender = payment_to(
            change,
            SAT(69_000),
            OutPoint { txid: funding_txid, vout: 0 },
        );
        let spender_txid = spender.compute_txid();

        // The spender is relevant (it pays our change key) even though
        // its funding is unknown.
        state.receive_pending(spender, &[]).unwrap();
        assert_eq!(state.pools.pool_of(spender_txid), Some(Pool::Pending));

        // Now the dependency arrives; its output must connect to the
        // waiting input, not to my_unspents.
        state.receive_pending(funding, &[]).unwrap();
        let spent_by = state
            .pools
            .spender_of(OutPoint { txid: funding_txid, vout: 0 })
            .unwrap();
        assert_eq!(spent_by.spender, spender_txid);
        assert_eq!(state.balance(BalanceKind::Estimated), SAT(69_000));
    }

    #[test]
    fn reset_forgets_transactions_but_keeps_keys() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        let script = state.keys.current_receive_script();
        fund_confirmed(&mut state, SAT(10_000), 1, block(10));
        assert!(state.pools.num_tracked() > 0);

        state.reset();
        assert_eq!(state.pools.num_tracked(), 0);
        assert_eq!(state.balance(BalanceKind::Estimated), Amount::ZERO);
        assert_eq!(state.last_block_seen, None);
        assert!(state.keys.is_mine_script(&script));
    }
}
