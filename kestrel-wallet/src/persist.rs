//! Wallet persistence.
//!
//! The wallet's durable state is one serializable [`WalletSnapshot`]; the
//! actual on-disk format lives behind the [`WalletStore`] collaborator.
//! [`FileStore`] is the built-in JSON implementation, writing
//! temp-file-then-rename so a crash never leaves a torn wallet file.
//!
//! Auto-save follows a write-back model: every mutator pokes a coalescing
//! notify channel, and a single background owner debounces the pokes and
//! persists one snapshot per burst. A synchronous save (the facade's
//! `save_now`) bypasses the delay entirely.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use bitcoin::{hashes::Hash as _, BlockHash, Transaction, Txid};
use kestrel_common::{
    chain::{BlockId, LastBlockSeen},
    network::KsNetwork,
    notify,
    shutdown::ShutdownSignal,
    task::NamedTask,
    time::TimestampMs,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{
    confidence::{ConfidenceKind, TxConfidence},
    error::ConsistencyError,
    keychain::KeyRegistrySnapshot,
    pool::Pool,
    state::WalletState,
    tx::{TxSource, WalletTx},
};

/// Bumped when the snapshot layout changes incompatibly.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One tracked transaction's durable state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx: Transaction,
    pub pool: Pool,
    pub source: TxSource,
    pub update_time: TimestampMs,
    pub appearances: Vec<(BlockHash, u32)>,
    pub confidence: TxConfidence,
}

/// Everything needed to reconstruct a wallet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub version: u32,
    pub description: String,
    pub network: KsNetwork,
    pub keys: KeyRegistrySnapshot,
    pub txs: Vec<TxRecord>,
    pub last_block_seen: Option<LastBlockSeen>,
    /// Opaque extension blobs keyed by a reverse-domain identifier.
    pub extensions: BTreeMap<String, Vec<u8>>,
}

impl WalletState {
    /// Capture the wallet's durable state.
    pub fn snapshot(&self, description: String) -> WalletSnapshot {
        let mut txs: Vec<TxRecord> = self
            .pools
            .all_ids()
            .filter_map(|txid| {
                let wtx = self.pools.get(txid)?;
                let pool = self.pools.pool_of(txid)?;
                let confidence =
                    self.confidence.get(txid).unwrap_or_else(|| {
                        // Untouched entries deserialize as unknown.
                        TxConfidence {
                            kind: ConfidenceKind::Unknown,
                            appeared_in: None,
                            depth: 0,
                            overriding_txid: None,
                            seen_by: Default::default(),
                        }
                    });
                Some(TxRecord {
                    tx: wtx.tx().clone(),
                    pool,
                    source: wtx.source,
                    update_time: wtx.update_time,
                    appearances: wtx
                        .appearances
                        .iter()
                        .map(|(hash, offset)| (*hash, *offset))
                        .collect(),
                    confidence,
                })
            })
            .collect();
        // Stable output ordering makes snapshots diffable.
        txs.sort_by_key(|record| record.update_time);

        WalletSnapshot {
            version: SNAPSHOT_VERSION,
            description,
            network: self.network,
            keys: self.keys.snapshot(),
            txs,
            last_block_seen: self.last_block_seen,
            extensions: BTreeMap::new(),
        }
    }

    /// Rebuild transaction state from a snapshot. The key registry must
    /// already be restored (the facade wires both together).
    pub fn restore_txs(
        &mut self,
        snapshot: &WalletSnapshot,
    ) -> Result<(), ConsistencyError> {
        for record in &snapshot.txs {
            let mut wtx = WalletTx::new(
                record.tx.clone(),
                record.source,
                record.update_time,
            );
            for (hash, offset) in &record.appearances {
                wtx.add_appearance(*hash, *offset);
            }
            let txid = wtx.txid();
            self.pools.put(record.pool, wtx)?;

            let conf = &record.confidence;
            match conf.kind {
                ConfidenceKind::Pending | ConfidenceKind::Unknown =>
                    self.confidence.set_pending(txid),
                ConfidenceKind::InConflict =>
                    self.confidence.set_in_conflict(txid),
                ConfidenceKind::Dead =>
                    self.confidence.set_dead(txid, conf.overriding_txid),
                ConfidenceKind::Building => {
                    let appeared = conf
                        .appeared_in
                        .or_else(|| {
                            record
                                .appearances
                                .first()
                                .map(|(hash, _)| BlockId::new(*hash, 0))
                        })
                        .unwrap_or_else(|| {
                            BlockId::new(BlockHash::all_zeros(), 0)
                        });
                    self.confidence.set_building(txid, appeared);
                    if conf.depth > 1 {
                        for _ in 1..conf.depth {
                            self.confidence.bump_depth(txid);
                        }
                    }
                }
            }
        }
        self.last_block_seen = snapshot.last_block_seen;

        // Reconnect the spend graph: oldest first so steady-state
        // connections win, exactly as they did live.
        let mut order: Vec<(TimestampMs, Txid)> = snapshot
            .txs
            .iter()
            .map(|record| {
                (record.update_time, record.tx.compute_txid())
            })
            .collect();
        order.sort_unstable();
        for (_, txid) in order {
            if self.pools.pool_of(txid) == Some(Pool::Dead) {
                continue;
            }
            let wtx = match self.pools.get(txid) {
                Some(wtx) => wtx.clone(),
                None => continue,
            };
            let spender_refs: Vec<_> = wtx
                .input_outpoints()
                .enumerate()
                .map(|(vin, outpoint)| (vin as u32, outpoint))
                .collect();
            for (vin, outpoint) in spender_refs {
                if self.pools.output(outpoint).is_some() {
                    let _ = self.pools.connect(
                        outpoint,
                        crate::tx::InputRef { spender: txid, vin },
                    );
                }
            }
        }

        // Derive my_unspents from scratch.
        let live: Vec<Txid> = self
            .pools
            .ids_in_pool(Pool::Unspent)
            .chain(self.pools.ids_in_pool(Pool::Pending))
            .collect();
        for txid in live {
            let wtx = self.pools.get(txid).expect("tracked").clone();
            for vout in 0..wtx.tx().output.len() as u32 {
                let outpoint = wtx.outpoint(vout);
                let owned = wtx
                    .output(vout)
                    .map(|output| self.is_mine_output(output))
                    .unwrap_or(false);
                if owned && self.pools.is_available(outpoint) {
                    self.pools.add_my_unspent(outpoint);
                }
            }
        }

        self.is_consistent_or_throw()
    }
}

/// The persistence collaborator: somewhere snapshots can be durably
/// written and read back.
pub trait WalletStore: Send + Sync {
    fn save(&self, snapshot: &WalletSnapshot) -> anyhow::Result<()>;
    fn load(&self) -> anyhow::Result<Option<WalletSnapshot>>;
}

/// JSON-on-disk store with atomic replace.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl WalletStore for FileStore {
    fn save(&self, snapshot: &WalletSnapshot) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)
            .context("Could not serialize wallet snapshot")?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, json).with_context(|| {
            format!("Could not write {}", tmp_path.display())
        })?;
        // Readers see either the old file or the new one, never a torn
        // mixture.
        std::fs::rename(&tmp_path, &self.path).with_context(|| {
            format!("Could not rename into {}", self.path.display())
        })?;
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Option<WalletSnapshot>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound =>
                return Ok(None),
            Err(err) =>
                return Err(err).with_context(|| {
                    format!("Could not read {}", self.path.display())
                }),
        };
        let snapshot = serde_json::from_slice(&bytes)
            .context("Could not deserialize wallet snapshot")?;
        Ok(Some(snapshot))
    }
}

/// Spawn the single background save owner.
///
/// Waits for a poke, sleeps `delay` to coalesce the burst, drains any
/// pokes that arrived during the sleep, then saves once. On shutdown a
/// final save runs if any poke is outstanding.
pub fn spawn_autosaver(
    snapshot_fn: Arc<dyn Fn() -> WalletSnapshot + Send + Sync>,
    store: Arc<dyn WalletStore>,
    delay: Duration,
    mut persist_rx: notify::Receiver,
    mut shutdown: ShutdownSignal,
) -> NamedTask<()> {
    NamedTask::spawn("wallet-autosaver", async move {
        loop {
            tokio::select! {
                () = persist_rx.recv() => {
                    tokio::time::sleep(delay).await;
                    persist_rx.clear();
                    let snapshot = snapshot_fn();
                    if let Err(err) = store.save(&snapshot) {
                        error!("Auto-save failed: {err:#}");
                    } else {
                        debug!("Auto-saved wallet snapshot");
                    }
                }
                () = shutdown.recv() => {
                    if persist_rx.try_recv() {
                        let snapshot = snapshot_fn();
                        if let Err(err) = store.save(&snapshot) {
                            error!("Final save failed: {err:#}");
                        }
                    }
                    return;
                }
            }
        }
    })
}
