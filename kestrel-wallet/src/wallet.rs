//! The wallet facade.
//!
//! [`Wallet`] owns the coarse per-wallet lock around [`WalletState`] and is
//! the only place that lock is taken. The key registry keeps its own finer
//! lock which nests *inside* the wallet lock; taking them in the other
//! order is forbidden. Listener callbacks and broadcasts happen strictly
//! after the wallet lock is released.
//!
//! Cloning a [`Wallet`] clones a handle, not the wallet.

use std::sync::{Arc, Mutex, MutexGuard};

use bip39::Mnemonic;
use bitcoin::{Address, Amount, Transaction, Txid};
use kestrel_common::{
    chain::{BlockId, BlockType},
    network::KsNetwork,
    notify,
    time::TimestampMs,
};
use rand_core::RngCore;
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::{
    broadcast::{Broadcaster, TxBroadcast},
    builder::{CompletedTx, SendRequest},
    classify::{DefaultRiskAnalyzer, RiskAnalyzer},
    confidence::{ConfidenceTable, TxConfidence},
    error::{
        ConsistencyError, KeyCryptoError, MaintenanceError, SendCoinsError,
    },
    events::{EventCallback, EventExecutor, ListenerRegistry, WalletEvent},
    keychain::{AccountStructure, KeyRegistry},
    keys::ScriptType,
    persist::{WalletSnapshot, WalletStore},
    pool::Pool,
    select::BalanceKind,
    signer::{run_signer_chain, LocalSigner, Signer, TxProposal},
    state::WalletState,
    tx::TxSource,
};

/// Construction-time knobs.
pub struct WalletConfig {
    pub network: KsNetwork,
    pub structure: AccountStructure,
    pub script_type: ScriptType,
    pub description: String,
    /// Track risky pending transactions instead of diverting them.
    pub accept_risky: bool,
    /// Keys created before this are rotating; see
    /// [`Wallet::do_maintenance`].
    pub key_rotation_time: Option<TimestampMs>,
}

impl WalletConfig {
    pub fn new(
        network: KsNetwork,
        structure: AccountStructure,
        script_type: ScriptType,
    ) -> Self {
        Self {
            network,
            structure,
            script_type,
            description: String::new(),
            accept_risky: false,
            key_rotation_time: None,
        }
    }
}

/// The outcome of [`Wallet::send_coins`].
pub struct SendResult {
    pub txid: Txid,
    pub tx: Transaction,
    pub fee: Amount,
    /// `None` if the wallet has no broadcaster attached.
    pub broadcast: Option<TxBroadcast>,
}

/// A handle to one wallet. See the module docs.
#[derive(Clone)]
pub struct Wallet {
    state: Arc<Mutex<WalletState>>,
    keys: Arc<KeyRegistry>,
    confidence: Arc<ConfidenceTable>,
    listeners: Arc<ListenerRegistry>,
    signers: Arc<Mutex<Vec<Box<dyn Signer>>>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    persist_tx: notify::Sender,
    /// (available, estimated), refreshed after every mutation; backs
    /// [`Wallet::wait_for_balance`].
    balance_tx: Arc<watch::Sender<(Amount, Amount)>>,
    description: String,
    key_rotation_time: Arc<Mutex<Option<TimestampMs>>>,
}

impl Wallet {
    /// Create a wallet from a BIP39 mnemonic.
    ///
    /// The confidence table is passed in (rather than being a process
    /// global) so tests and multi-wallet setups control sharing
    /// explicitly. Returns the wallet plus the persist-notify receiver to
    /// hand to [`crate::persist::spawn_autosaver`].
    pub fn from_mnemonic(
        mnemonic: &Mnemonic,
        config: WalletConfig,
        confidence: Arc<ConfidenceTable>,
        broadcaster: Option<Arc<dyn Broadcaster>>,
    ) -> (Self, notify::Receiver) {
        let keys = Arc::new(KeyRegistry::from_mnemonic(
            mnemonic,
            config.structure,
            config.script_type,
            config.network,
            TimestampMs::now(),
        ));
        Self::assemble(keys, config, confidence, broadcaster, None)
            .expect("assembling a fresh wallet is infallible")
    }

    /// Reconstruct a wallet from a snapshot previously produced by
    /// [`Wallet::snapshot`].
    pub fn restore(
        snapshot: WalletSnapshot,
        config: WalletConfig,
        confidence: Arc<ConfidenceTable>,
        broadcaster: Option<Arc<dyn Broadcaster>>,
    ) -> anyhow::Result<(Self, notify::Receiver)> {
        let keys = Arc::new(KeyRegistry::restore(snapshot.keys.clone())?);
        Self::assemble(keys, config, confidence, broadcaster, Some(&snapshot))
    }

    fn assemble(
        keys: Arc<KeyRegistry>,
        config: WalletConfig,
        confidence: Arc<ConfidenceTable>,
        broadcaster: Option<Arc<dyn Broadcaster>>,
        snapshot: Option<&WalletSnapshot>,
    ) -> anyhow::Result<(Self, notify::Receiver)> {
        use anyhow::Context;

        let risk_analyzer: Arc<dyn RiskAnalyzer> =
            Arc::new(DefaultRiskAnalyzer);
        let mut state = WalletState::new(
            config.network,
            confidence.clone(),
            keys.clone(),
            risk_analyzer,
        );
        state.accept_risky = config.accept_risky;
        if let Some(snapshot) = snapshot {
            state
                .restore_txs(snapshot)
                .context("Wallet snapshot failed its consistency checks")?;
        }

        let (persist_tx, persist_rx) = notify::channel();
        let available = state.balance(BalanceKind::Available);
        let estimated = state.balance(BalanceKind::Estimated);
        let (balance_tx, _balance_rx) =
            watch::channel((available, estimated));

        let wallet = Self {
            state: Arc::new(Mutex::new(state)),
            keys,
            confidence,
            listeners: Arc::new(ListenerRegistry::new()),
            signers: Arc::new(Mutex::new(vec![
                Box::new(LocalSigner::default()) as Box<dyn Signer>
            ])),
            broadcaster,
            persist_tx,
            balance_tx: Arc::new(balance_tx),
            description: config.description,
            key_rotation_time: Arc::new(Mutex::new(
                config.key_rotation_time,
            )),
        };
        Ok((wallet, persist_rx))
    }

    // --- Locking discipline --- //

    fn lock(&self) -> MutexGuard<'_, WalletState> {
        self.state.lock().unwrap()
    }

    /// Run a mutator under the wallet lock, then (lock released) publish
    /// balances, dispatch events, and poke the persister.
    fn with_state_mut<T>(
        &self,
        mutate: impl FnOnce(&mut WalletState) -> T,
    ) -> T {
        let (out, events, balances) = {
            let mut state = self.lock();
            let out = mutate(&mut state);
            let events = state.take_events();
            let balances = (
                state.balance(BalanceKind::Available),
                state.balance(BalanceKind::Estimated),
            );
            (out, events, balances)
        };
        let _ = self.balance_tx.send(balances);
        self.listeners.dispatch(events);
        self.persist_tx.send();
        out
    }

    // --- Listeners --- //

    pub fn add_listener(
        &self,
        executor: Arc<dyn EventExecutor>,
        callback: EventCallback,
    ) {
        self.listeners.register(executor, callback);
    }

    // --- Addresses and keys --- //

    pub fn network(&self) -> KsNetwork {
        self.keys.network()
    }

    pub fn current_receive_address(&self) -> Address {
        let script = self.keys.current_receive_script();
        Address::from_script(&script, self.network().to_bitcoin())
            .expect("we only derive addressable scripts")
    }

    pub fn fresh_receive_address(&self) -> Address {
        let script = self.keys.fresh_receive_script();
        let address =
            Address::from_script(&script, self.network().to_bitcoin())
                .expect("we only derive addressable scripts");
        // Handing out a fresh key changes the watched-script set.
        self.listeners.dispatch(vec![WalletEvent::ScriptsChanged]);
        self.persist_tx.send();
        address
    }

    pub fn current_change_address(&self) -> Address {
        let script = self.keys.current_change_script();
        Address::from_script(&script, self.network().to_bitcoin())
            .expect("we only derive addressable scripts")
    }

    pub fn earliest_key_creation_time(&self) -> TimestampMs {
        use crate::keys::KeyBag as _;
        self.keys.earliest_key_creation_time()
    }

    /// Seal key material at rest. See [`KeyRegistry::encrypt`].
    pub fn encrypt(
        &self,
        rng: &mut dyn RngCore,
        password: &str,
    ) -> Result<(), KeyCryptoError> {
        let result = self.keys.encrypt(rng, password);
        self.persist_tx.send();
        result
    }

    pub fn decrypt(&self, password: &str) -> Result<(), KeyCryptoError> {
        let result = self.keys.decrypt(password);
        self.persist_tx.send();
        result
    }

    // --- Balances --- //

    pub fn balance(&self, kind: BalanceKind) -> Amount {
        self.lock().balance(kind)
    }

    /// Completes once `kind` first reaches `target`. Completes
    /// immediately if it already has.
    pub async fn wait_for_balance(
        &self,
        kind: BalanceKind,
        target: Amount,
    ) -> Amount {
        let mut rx = self.balance_tx.subscribe();
        loop {
            let (available, estimated) = *rx.borrow_and_update();
            let current = match kind {
                BalanceKind::Available
                | BalanceKind::AvailableSpendable => available,
                BalanceKind::Estimated
                | BalanceKind::EstimatedSpendable => estimated,
            };
            if current >= target {
                return current;
            }
            if rx.changed().await.is_err() {
                return current;
            }
        }
    }

    /// Completes once `txid` reaches `depth` confirmations (or dies).
    pub async fn wait_for_depth(
        &self,
        txid: Txid,
        depth: u32,
    ) -> TxConfidence {
        self.confidence.wait_for_depth(txid, depth).await
    }

    pub fn confidence(&self, txid: Txid) -> Option<TxConfidence> {
        self.confidence.get(txid)
    }

    pub fn pool_of(&self, txid: Txid) -> Option<Pool> {
        self.lock().pools.pool_of(txid)
    }

    // --- Inbound --- //

    /// Pure query: would this pending transaction matter to us?
    pub fn is_pending_relevant(&self, tx: &Transaction) -> bool {
        self.lock().is_pending_relevant(tx)
    }

    /// Accept a pending transaction from the network.
    #[instrument(skip_all, name = "(receive-pending)")]
    pub fn receive_pending(
        &self,
        tx: Transaction,
        dependencies: &[Transaction],
    ) -> Result<bool, ConsistencyError> {
        self.with_state_mut(|state| state.receive_pending(tx, dependencies))
    }

    /// Record that a peer announced `txid`.
    pub fn notify_tx_seen_by_peer(&self, txid: Txid, peer: &str) -> usize {
        let count = self.confidence.mark_seen_by(txid, peer);
        self.listeners
            .dispatch(vec![WalletEvent::ConfidenceChanged { txid }]);
        count
    }

    // --- Block chain callbacks --- //

    pub fn notify_tx_in_block(
        &self,
        txid: Txid,
        block: BlockId,
        block_type: BlockType,
        offset: u32,
    ) -> Result<bool, ConsistencyError> {
        self.with_state_mut(|state| {
            state.notify_tx_in_block(txid, block, block_type, offset)
        })
    }

    #[instrument(skip_all, name = "(receive-from-block)")]
    pub fn receive_from_block(
        &self,
        tx: Transaction,
        block: BlockId,
        block_type: BlockType,
        offset: u32,
    ) -> Result<(), ConsistencyError> {
        self.with_state_mut(|state| {
            state.receive_from_block(tx, block, block_type, offset)
        })
    }

    pub fn notify_new_best_block(
        &self,
        block: BlockId,
        time: TimestampMs,
    ) -> Result<(), ConsistencyError> {
        self.with_state_mut(|state| state.notify_new_best_block(block, time))
    }

    #[instrument(skip_all, name = "(reorganize)")]
    pub fn reorganize(
        &self,
        split_point: BlockId,
        old_blocks: &[BlockId],
        new_blocks: &[BlockId],
    ) -> Result<(), ConsistencyError> {
        self.with_state_mut(|state| {
            state.reorganize(split_point, old_blocks, new_blocks)
        })
    }

    // --- Outbound --- //

    /// Plan a spend without mutating anything.
    pub fn complete_tx(
        &self,
        request: &SendRequest,
    ) -> Result<CompletedTx, crate::error::CompleteTxError> {
        self.lock().complete_tx(request)
    }

    /// Drive the signer chain over a proposal.
    pub fn sign_tx(
        &self,
        proposal: &mut TxProposal,
    ) -> Result<bool, crate::error::SignError> {
        let signers = self.signers.lock().unwrap();
        run_signer_chain(&signers, proposal, self.keys.as_ref())
    }

    /// Track a transaction we created ourselves.
    pub fn commit_tx(&self, tx: Transaction) -> Result<Txid, ConsistencyError> {
        self.with_state_mut(|state| {
            state.commit(tx, TxSource::SelfOriginated)
        })
    }

    /// Complete, sign, commit, and hand off for broadcast.
    ///
    /// The wallet lock is *not* held while broadcasting; network errors
    /// stay inside the returned [`TxBroadcast`] and the transaction
    /// remains pending for retry.
    #[instrument(skip_all, name = "(send-coins)")]
    pub fn send_coins(
        &self,
        request: SendRequest,
    ) -> Result<SendResult, SendCoinsError> {
        let mut completed = self.complete_tx(&request)?;
        self.sign_tx(&mut completed.proposal)?;
        let tx = completed.proposal.tx;
        let txid = self.commit_tx(tx.clone())?;
        info!(%txid, fee = %completed.fee, "sending coins");

        let broadcast = self
            .broadcaster
            .as_ref()
            .map(|broadcaster| broadcaster.broadcast(tx.clone()));

        Ok(SendResult { txid, tx, fee: completed.fee, broadcast })
    }

    /// Append a cosigner to the signer chain.
    pub fn add_signer(&self, signer: Box<dyn Signer>) {
        self.signers.lock().unwrap().push(signer);
    }

    // --- Maintenance --- //

    /// Run key rotation if configured. Committed sweeps are broadcast
    /// (lock released) before returning.
    pub fn do_maintenance(
        &self,
        password: Option<&str>,
    ) -> Result<Vec<Txid>, MaintenanceError> {
        let threshold = match *self.key_rotation_time.lock().unwrap() {
            Some(threshold) => threshold,
            None => return Ok(Vec::new()),
        };
        let swept = self.with_state_mut(|state| {
            let signers = self.signers.lock().unwrap();
            state.do_key_rotation(threshold, &signers, password)
        })?;

        let mut txids = Vec::with_capacity(swept.len());
        for tx in swept {
            txids.push(tx.compute_txid());
            if let Some(broadcaster) = &self.broadcaster {
                let _ = broadcaster.broadcast(tx);
            }
        }
        Ok(txids)
    }

    pub fn set_key_rotation_time(&self, threshold: Option<TimestampMs>) {
        *self.key_rotation_time.lock().unwrap() = threshold;
        self.persist_tx.send();
    }

    /// Drop risk-diverted transactions that nothing depends on.
    pub fn cleanup(&self) {
        self.with_state_mut(WalletState::cleanup);
    }

    /// Forget all transaction history, keeping keys; the chain can then be
    /// replayed from [`Wallet::earliest_key_creation_time`].
    pub fn reset(&self) {
        self.with_state_mut(WalletState::reset);
    }

    // --- Persistence --- //

    pub fn snapshot(&self) -> WalletSnapshot {
        self.lock().snapshot(self.description.clone())
    }

    /// Save synchronously, bypassing the auto-save delay.
    pub fn save_now(&self, store: &dyn WalletStore) -> anyhow::Result<()> {
        let snapshot = self.snapshot();
        store.save(&snapshot)
    }

    /// Check the structural invariants without mutating.
    pub fn is_consistent(&self) -> Result<(), ConsistencyError> {
        self.lock().is_consistent_or_throw()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex as StdMutex;

    use bitcoin::{hashes::Hash as _, Amount};
    use kestrel_common::chain::BlockType;

    use super::*;
    use crate::{
        events::SameThreadExecutor,
        test_utils::{self, block, RecordingBroadcaster, TEST_MNEMONIC},
    };

    fn test_wallet(
        broadcaster: Option<Arc<dyn Broadcaster>>,
    ) -> (Wallet, notify::Receiver) {
        let mnemonic = Mnemonic::parse(TEST_MNEMONIC).unwrap();
        let config = WalletConfig::new(
            KsNetwork::Regtest,
            AccountStructure::Bip43,
            ScriptType::P2wpkh,
        );
        Wallet::from_mnemonic(
            &mnemonic,
            config,
            Arc::new(ConfidenceTable::new()),
            broadcaster,
        )
    }

    #[test]
    fn receive_pending_emits_coins_received() {
        let (wallet, _persist_rx) = test_wallet(None);
        let events = Arc::new(StdMutex::new(Vec::new()));
        {
            let events = events.clone();
            wallet.add_listener(
                Arc::new(SameThreadExecutor),
                Arc::new(move |event| events.lock().unwrap().push(event)),
            );
        }

        let script =
            wallet.fresh_receive_address().script_pubkey();
        let tx = test_utils::payment_to(
            script,
            Amount::from_sat(25_000),
            test_utils::foreign_outpoint(1),
        );
        wallet.receive_pending(tx, &[]).unwrap();

        let events = events.lock().unwrap();
        assert!(events.iter().any(|event| matches!(
            event,
            WalletEvent::CoinsReceived { .. }
        )));
        assert_eq!(
            wallet.balance(BalanceKind::Estimated),
            Amount::from_sat(25_000)
        );
    }

    #[test]
    fn send_coins_commits_and_broadcasts() {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let (wallet, _persist_rx) =
            test_wallet(Some(broadcaster.clone() as Arc<dyn Broadcaster>));

        let script =
            wallet.fresh_receive_address().script_pubkey();
        let funding = test_utils::payment_to(
            script,
            Amount::from_sat(100_000),
            test_utils::foreign_outpoint(2),
        );
        wallet
            .receive_from_block(
                funding,
                block(10),
                BlockType::BestChain,
                0,
            )
            .unwrap();
        wallet
            .notify_new_best_block(
                block(10),
                TimestampMs::from_secs(1_700_000_000),
            )
            .unwrap();

        let stranger = bitcoin::ScriptBuf::new_p2wpkh(
            &bitcoin::WPubkeyHash::from_byte_array([0xcd; 20]),
        );
        let result = wallet
            .send_coins(SendRequest::to(
                stranger,
                Amount::from_sat(40_000),
            ))
            .unwrap();

        // Committed as self-originated pending, and broadcast.
        assert_eq!(wallet.pool_of(result.txid), Some(Pool::Pending));
        assert_eq!(broadcaster.sent.lock().unwrap().len(), 1);
        assert!(result.fee > Amount::ZERO);
        // The spent coin is gone; change remains (estimated balance).
        assert_eq!(
            wallet.balance(BalanceKind::Estimated),
            Amount::from_sat(100_000) - Amount::from_sat(40_000)
                - result.fee
        );
        wallet.is_consistent().unwrap();
    }

    #[tokio::test]
    async fn wait_for_balance_completes_on_funding() {
        let (wallet, _persist_rx) = test_wallet(None);
        let script =
            wallet.fresh_receive_address().script_pubkey();

        let waiter = {
            let wallet = wallet.clone();
            tokio::spawn(async move {
                wallet
                    .wait_for_balance(
                        BalanceKind::Estimated,
                        Amount::from_sat(10_000),
                    )
                    .await
            })
        };

        let wallet2 = wallet.clone();
        tokio::task::spawn_blocking(move || {
            let tx = test_utils::payment_to(
                script,
                Amount::from_sat(10_000),
                test_utils::foreign_outpoint(3),
            );
            wallet2.receive_pending(tx, &[]).unwrap();
        })
        .await
        .unwrap();

        let balance = waiter.await.unwrap();
        assert_eq!(balance, Amount::from_sat(10_000));
    }
}
