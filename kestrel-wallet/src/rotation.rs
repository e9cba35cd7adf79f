//! Key rotation: migrating funds off pre-rotation keys.
//!
//! Once a rotation time `T` is configured, every key created before `T` is
//! considered compromised-or-stale. The maintainer sweeps outputs
//! controlled by such keys to a fresh address in size-bounded batches,
//! deducting a minimal fee from the swept value. If every deterministic
//! chain predates `T`, a new chain is synthesized first (which, on an
//! encrypted wallet, requires the password).

use bitcoin::{Amount, Transaction, TxOut};
use kestrel_common::time::TimestampMs;
use tracing::info;

use crate::{
    constants::ROTATION_BATCH_MAX_INPUTS,
    error::MaintenanceError,
    fees,
    select::Coin,
    signer::{run_signer_chain, ProposalInput, Signer, TxProposal},
    state::WalletState,
    tx::TxSource,
};

/// Split rotating coins into maintenance-transaction batches.
pub(crate) fn batch_rotating(coins: Vec<Coin>) -> Vec<Vec<Coin>> {
    coins
        .chunks(ROTATION_BATCH_MAX_INPUTS)
        .map(<[Coin]>::to_vec)
        .collect()
}

impl WalletState {
    /// The spendable coins currently controlled by rotating keys.
    pub fn rotating_coins(&self, threshold: TimestampMs) -> Vec<Coin> {
        self.spend_candidates()
            .into_iter()
            .filter(|coin| coin.spendable)
            .filter(|coin| {
                self.keys
                    .is_script_rotating(&coin.output.script_pubkey, threshold)
            })
            .collect()
    }

    /// Run one maintenance pass: build, sign, and commit batched sweeps of
    /// all rotating value. Returns the committed transactions, which the
    /// caller must broadcast.
    pub fn do_key_rotation(
        &mut self,
        threshold: TimestampMs,
        signers: &[Box<dyn Signer>],
        password: Option<&str>,
    ) -> Result<Vec<Transaction>, MaintenanceError> {
        let rotating = self.rotating_coins(threshold);
        if rotating.is_empty() {
            return Ok(Vec::new());
        }

        // Make sure the destination chain itself is post-rotation.
        if self.keys.all_chains_rotating(threshold) {
            self.keys.add_fresh_chain(TimestampMs::now(), password)?;
        }

        let mut committed = Vec::new();
        for batch in batch_rotating(rotating) {
            let total = batch
                .iter()
                .map(Coin::value)
                .fold(Amount::ZERO, |acc, value| acc + value);
            let destination = self.keys.fresh_receive_script();

            let input_classes: Vec<_> = batch
                .iter()
                .map(|coin| {
                    fees::InputClass::of(&coin.output.script_pubkey, None)
                })
                .collect();
            let outputs = vec![TxOut {
                value: total,
                script_pubkey: destination.clone(),
            }];
            let vsize = fees::estimate_vsize(&input_classes, &outputs);
            let fee = fees::required_fee(
                vsize,
                crate::constants::DEFAULT_FEE_PER_KB,
            );
            let value = match total.checked_sub(fee) {
                Some(value)
                    if value
                        >= fees::dust_threshold(&outputs[0]) =>
                    value,
                // Not worth the fee to move; leave the dust behind.
                _ => continue,
            };

            // Sweep-style one shot: all batch inputs, one output, fee
            // subtracted from the swept value. No change planning needed.
            let tx = Transaction {
                version: bitcoin::transaction::Version::TWO,
                lock_time: bitcoin::absolute::LockTime::ZERO,
                input: batch
                    .iter()
                    .map(|coin| bitcoin::TxIn {
                        previous_output: coin.outpoint,
                        script_sig: bitcoin::ScriptBuf::new(),
                        sequence: bitcoin::Sequence::MAX,
                        witness: bitcoin::Witness::new(),
                    })
                    .collect(),
                output: vec![TxOut { value, script_pubkey: destination }],
            };
            let mut proposal = TxProposal {
                tx,
                inputs: batch
                    .iter()
                    .map(|coin| ProposalInput {
                        spent_output: coin.output.clone(),
                        redeem: None,
                        hd_path: None,
                    })
                    .collect(),
                missing_sigs_mode: Default::default(),
            };

            run_signer_chain(signers, &mut proposal, self.keys.as_ref())?;

            let tx = proposal.tx;
            info!(
                txid = %tx.compute_txid(),
                inputs = tx.input.len(),
                %value,
                "committing key-rotation sweep"
            );
            self.commit(tx.clone(), TxSource::SelfOriginated)?;
            committed.push(tx);
        }

        Ok(committed)
    }
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::Hash as _;

    use super::*;
    use crate::{
        keys::{KeyBag as _, ScriptType},
        signer::LocalSigner,
        test_utils::{self, block},
    };

    #[test]
    fn batches_are_bounded() {
        let coins: Vec<Coin> = (0..1_450)
            .map(|index| Coin {
                outpoint: bitcoin::OutPoint {
                    txid: bitcoin::Txid::from_byte_array(
                        [(index % 251) as u8; 32],
                    ),
                    vout: index,
                },
                output: TxOut {
                    value: Amount::from_sat(1_000),
                    script_pubkey: bitcoin::ScriptBuf::new(),
                },
                depth: 1,
                coinbase: false,
                self_originated: false,
                broadcast_peers: 0,
                spendable: true,
            })
            .collect();

        let batches = batch_rotating(coins);
        assert_eq!(batches.len(), 3);
        assert!(batches
            .iter()
            .all(|batch| batch.len() <= ROTATION_BATCH_MAX_INPUTS));
        assert_eq!(
            batches.iter().map(Vec::len).sum::<usize>(),
            1_450
        );
    }

    #[test]
    fn rotation_sweeps_old_coins_to_fresh_chain() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        test_utils::fund_confirmed(
            &mut state,
            Amount::from_sat(80_000),
            1,
            block(10),
        );
        test_utils::fund_confirmed(
            &mut state,
            Amount::from_sat(60_000),
            2,
            block(11),
        );

        // Keys were created at 1.7e9; rotate everything before 1.75e9.
        // (The fresh chain is created at the current wall clock, which is
        // comfortably past the threshold.)
        let threshold = TimestampMs::from_secs(1_750_000_000);
        assert_eq!(state.rotating_coins(threshold).len(), 2);

        let signers: Vec<Box<dyn Signer>> =
            vec![Box::new(LocalSigner::default())];
        let swept =
            state.do_key_rotation(threshold, &signers, None).unwrap();
        assert_eq!(swept.len(), 1);

        let sweep = &swept[0];
        assert_eq!(sweep.input.len(), 2);
        assert_eq!(sweep.output.len(), 1);
        // Value minus a real fee, signed and committed.
        assert!(sweep.output[0].value < Amount::from_sat(140_000));
        assert!(sweep.output[0].value > Amount::from_sat(139_000));
        assert!(sweep.input.iter().all(|input| !input.witness.is_empty()));

        // The destination is ours but no longer rotating, so a second
        // pass has nothing to do.
        assert!(state.rotating_coins(threshold).is_empty());
        assert!(state
            .keys
            .is_mine_script(&sweep.output[0].script_pubkey));
        state.is_consistent_or_throw().unwrap();
    }

    #[test]
    fn no_rotation_time_reached_is_a_noop() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        test_utils::fund_confirmed(
            &mut state,
            Amount::from_sat(80_000),
            1,
            block(10),
        );

        // Threshold earlier than every key's creation time.
        let threshold = TimestampMs::from_secs(1_000);
        let signers: Vec<Box<dyn Signer>> =
            vec![Box::new(LocalSigner::default())];
        let swept =
            state.do_key_rotation(threshold, &signers, None).unwrap();
        assert!(swept.is_empty());
    }
}
