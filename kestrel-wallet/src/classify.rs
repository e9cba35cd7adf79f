//! Classification of inbound pending transactions.
//!
//! [`WalletState::is_pending_relevant`] is a pure query; the mutation path
//! is [`WalletState::receive_pending`], which re-checks relevance (the
//! dependency that makes a transaction relevant may have arrived
//! concurrently), runs risk analysis, and only then commits.
//!
//! Risk analysis is a capability so integrators can swap policies; the
//! default flags non-final and non-standard transactions, which a miner
//! may never confirm and which are therefore cheap double-spend vectors.

use std::collections::HashSet;

use bitcoin::{absolute::LockTime, OutPoint, Transaction};
use kestrel_common::time::TimestampMs;
use tracing::{debug, info};

use crate::{
    error::ConsistencyError,
    fees,
    pool::Pool,
    state::WalletState,
    tx::TxSource,
};

/// What the analyzer thinks of a transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RiskVerdict {
    Ok,
    Risky(String),
}

/// Chain facts the analyzer needs for finality checks.
#[derive(Copy, Clone, Debug)]
pub struct ChainContext {
    /// Height the *next* block will have.
    pub next_block_height: u32,
    /// Current wall-clock time, standing in for median-time-past.
    pub time: TimestampMs,
}

/// Pluggable risk policy for unconfirmed transactions.
pub trait RiskAnalyzer: Send + Sync {
    fn analyze(
        &self,
        tx: &Transaction,
        dependencies: &[Transaction],
        context: &ChainContext,
    ) -> RiskVerdict;
}

/// The default policy: finality plus a few standardness rules.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultRiskAnalyzer;

impl DefaultRiskAnalyzer {
    fn is_final(tx: &Transaction, context: &ChainContext) -> bool {
        if !tx.is_lock_time_enabled() {
            return true;
        }
        match tx.lock_time {
            LockTime::Blocks(height) =>
                height.to_consensus_u32() < context.next_block_height,
            LockTime::Seconds(time) =>
                u64::from(time.to_consensus_u32()) <= context.time.to_secs(),
        }
    }

    fn standardness_problem(tx: &Transaction) -> Option<String> {
        let version = tx.version.0;
        if !(1..=2).contains(&version) {
            return Some(format!("non-standard version {version}"));
        }
        for (vout, output) in tx.output.iter().enumerate() {
            if fees::is_dust(output) {
                return Some(format!(
                    "output {vout} of {} is dust",
                    output.value
                ));
            }
        }
        None
    }
}

impl RiskAnalyzer for DefaultRiskAnalyzer {
    fn analyze(
        &self,
        tx: &Transaction,
        dependencies: &[Transaction],
        context: &ChainContext,
    ) -> RiskVerdict {
        if !Self::is_final(tx, context) {
            return RiskVerdict::Risky("non-final".to_owned());
        }
        for dep in dependencies {
            if !Self::is_final(dep, context) {
                return RiskVerdict::Risky(format!(
                    "depends on non-final {}",
                    dep.compute_txid()
                ));
            }
        }
        if let Some(problem) = Self::standardness_problem(tx) {
            return RiskVerdict::Risky(problem);
        }
        RiskVerdict::Ok
    }
}

impl WalletState {
    /// Whether an unconfirmed transaction matters to this wallet: it pays
    /// one of our keys, spends an output we track, or double-spends an
    /// outpoint some tracked transaction also spends.
    ///
    /// Pure query; mutates nothing.
    pub fn is_pending_relevant(&self, tx: &Transaction) -> bool {
        if self.value_sent_to_me(tx) > bitcoin::Amount::ZERO {
            return true;
        }
        if tx.is_coinbase() {
            return false;
        }
        if tx
            .input
            .iter()
            .any(|input| self.pools.output(input.previous_output).is_some())
        {
            return true;
        }
        // Double spend of any tracked transaction's outpoint set.
        let outpoints: HashSet<OutPoint> =
            tx.input.iter().map(|input| input.previous_output).collect();
        Pool::ALL.into_iter().any(|pool| {
            self.pools.txs_in_pool(pool).any(|tracked| {
                tracked
                    .input_outpoints()
                    .any(|outpoint| outpoints.contains(&outpoint))
            })
        })
    }

    fn chain_context(&self) -> ChainContext {
        ChainContext {
            next_block_height: self
                .last_block_seen
                .map(|seen| seen.block.height + 1)
                .unwrap_or(0),
            time: TimestampMs::now(),
        }
    }

    /// Accept an unconfirmed transaction from the network.
    ///
    /// Returns whether the transaction was newly committed. Calling this
    /// twice with the same transaction is a no-op the second time.
    pub fn receive_pending(
        &mut self,
        tx: Transaction,
        dependencies: &[Transaction],
    ) -> Result<bool, ConsistencyError> {
        let txid = tx.compute_txid();
        if !self.pools.pools_of(txid).is_empty() {
            debug!(%txid, "receive_pending: already tracked");
            return Ok(false);
        }

        // Relevance may have changed since the network layer's pre-check:
        // a dependency could have arrived concurrently.
        if !self.is_pending_relevant(&tx) {
            debug!(%txid, "receive_pending: not relevant");
            return Ok(false);
        }

        let context = self.chain_context();
        let verdict =
            self.risk_analyzer.clone().analyze(&tx, dependencies, &context);
        if let RiskVerdict::Risky(reason) = verdict {
            if !self.accept_risky {
                info!(%txid, %reason, "diverting risky transaction");
                self.pools.push_risk_dropped(tx);
                return Ok(false);
            }
            info!(%txid, %reason, "accepting risky transaction");
        }

        // Clone-by-value breaks any sharing with other wallets tracking
        // the same transaction object.
        self.commit(tx, TxSource::Network)?;
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use bitcoin::{
        absolute::LockTime, hashes::Hash as _, transaction::Version, Amount,
        ScriptBuf, Sequence, TxIn, TxOut, Txid, WPubkeyHash, Witness,
    };

    use super::*;

    fn context(height: u32, secs: u64) -> ChainContext {
        ChainContext {
            next_block_height: height,
            time: TimestampMs::from_secs(secs as u32),
        }
    }

    fn tx_with(lock_time: LockTime, sequence: Sequence) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time,
            input: vec![TxIn {
                previous_output: bitcoin::OutPoint {
                    txid: Txid::from_byte_array([1; 32]),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(10_000),
                script_pubkey: ScriptBuf::new_p2wpkh(
                    &WPubkeyHash::from_byte_array([2; 20]),
                ),
            }],
        }
    }

    #[test]
    fn final_tx_is_ok() {
        let tx = tx_with(LockTime::ZERO, Sequence::MAX);
        let verdict =
            DefaultRiskAnalyzer.analyze(&tx, &[], &context(100, 1_000));
        assert_eq!(verdict, RiskVerdict::Ok);
    }

    #[test]
    fn future_locktime_is_risky() {
        let tx = tx_with(
            LockTime::from_consensus(200),
            Sequence::ENABLE_LOCKTIME_NO_RBF,
        );
        let verdict =
            DefaultRiskAnalyzer.analyze(&tx, &[], &context(100, 1_000));
        assert_eq!(verdict, RiskVerdict::Risky("non-final".to_owned()));

        // Same locktime with all-final sequences is fine.
        let tx = tx_with(LockTime::from_consensus(200), Sequence::MAX);
        let verdict =
            DefaultRiskAnalyzer.analyze(&tx, &[], &context(100, 1_000));
        assert_eq!(verdict, RiskVerdict::Ok);
    }

    #[test]
    fn non_final_dependency_is_risky() {
        let tx = tx_with(LockTime::ZERO, Sequence::MAX);
        let dep = tx_with(
            LockTime::from_consensus(500),
            Sequence::ENABLE_LOCKTIME_NO_RBF,
        );
        let verdict =
            DefaultRiskAnalyzer.analyze(&tx, &[dep], &context(100, 1_000));
        assert!(matches!(verdict, RiskVerdict::Risky(_)));
    }

    #[test]
    fn dust_output_is_risky() {
        let mut tx = tx_with(LockTime::ZERO, Sequence::MAX);
        tx.output[0].value = Amount::from_sat(100);
        let verdict =
            DefaultRiskAnalyzer.analyze(&tx, &[], &context(100, 1_000));
        assert!(matches!(verdict, RiskVerdict::Risky(_)));
    }

    #[test]
    fn weird_version_is_risky() {
        let mut tx = tx_with(LockTime::ZERO, Sequence::MAX);
        tx.version = Version(42);
        let verdict =
            DefaultRiskAnalyzer.analyze(&tx, &[], &context(100, 1_000));
        assert!(matches!(verdict, RiskVerdict::Risky(_)));
    }
}
