//! Building spends: funding, fee iteration, change, and output ordering.
//!
//! [`WalletState::complete_tx`] is a read-only planner: it selects coins,
//! iterates the fee to a fixed point, and returns a [`TxProposal`] ready
//! for the signer chain. Committing and broadcasting are separate steps on
//! the wallet facade, so a caller can inspect (or abandon) a plan without
//! mutating anything.

use bitcoin::{
    absolute::LockTime, transaction::Version, Amount, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Witness,
};
use tracing::debug;

use crate::{
    constants::MAX_STANDARD_TX_SIZE,
    error::CompleteTxError,
    fees::{self, InputClass},
    keys::{self, KeyBag as _},
    select::{Coin, CoinSelector, DefaultCoinSelector},
    signer::{MissingSigsMode, ProposalInput, TxProposal},
    state::WalletState,
};

/// The fee sequence is monotone non-decreasing and bounded, so it reaches
/// a fixed point; in practice within two or three rounds. Anything past
/// this cap indicates a selector that keeps reshuffling coins.
const MAX_FEE_ITERATIONS: usize = 20;

/// A spend the caller wants to make.
pub struct SendRequest {
    /// The recipient outputs. Exactly one when `empty_wallet` is set.
    pub outputs: Vec<TxOut>,
    /// Fee rate in satoshis per 1000 vbytes.
    pub fee_per_kb: Amount,
    /// Send everything spendable to the single output, shrinking it by
    /// the fee.
    pub empty_wallet: bool,
    /// Deduct the fee from the recipients instead of adding it on top.
    pub recipients_pay_fees: bool,
    /// Where change goes; defaults to the wallet's current change script.
    pub change_script: Option<ScriptBuf>,
    /// Overrides the wallet's default coin selector.
    pub coin_selector: Option<Box<dyn CoinSelector>>,
    pub missing_sigs_mode: MissingSigsMode,
    /// Order outputs canonically (value, then scriptPubKey) so the change
    /// position leaks nothing.
    pub sort_outputs: bool,
}

impl SendRequest {
    /// A plain send of `value` to `script_pubkey`.
    pub fn to(script_pubkey: ScriptBuf, value: Amount) -> Self {
        Self {
            outputs: vec![TxOut { value, script_pubkey }],
            fee_per_kb: crate::constants::DEFAULT_FEE_PER_KB,
            empty_wallet: false,
            recipients_pay_fees: false,
            change_script: None,
            coin_selector: None,
            missing_sigs_mode: MissingSigsMode::default(),
            sort_outputs: true,
        }
    }

    /// Sweep the whole wallet to `script_pubkey`.
    pub fn empty_wallet_to(script_pubkey: ScriptBuf) -> Self {
        let mut request =
            Self::to(script_pubkey, Amount::ZERO);
        request.empty_wallet = true;
        request
    }
}

/// A fully planned (but unsigned, uncommitted) spend.
#[derive(Debug)]
pub struct CompletedTx {
    pub proposal: TxProposal,
    pub fee: Amount,
    pub selected: Vec<Coin>,
}

impl WalletState {
    /// Fund and plan `request` against the current spendable coins.
    pub fn complete_tx(
        &self,
        request: &SendRequest,
    ) -> Result<CompletedTx, CompleteTxError> {
        let num_op_return = request
            .outputs
            .iter()
            .filter(|output| output.script_pubkey.is_op_return())
            .count();
        if num_op_return > 1 {
            return Err(CompleteTxError::MultipleOpReturn);
        }
        if !request.empty_wallet {
            for output in &request.outputs {
                if fees::is_dust(output) {
                    return Err(CompleteTxError::Dusty {
                        value: output.value,
                        min_non_dust: fees::dust_threshold(output),
                    });
                }
            }
        }

        let default_selector = DefaultCoinSelector;
        let selector: &dyn CoinSelector = request
            .coin_selector
            .as_deref()
            .unwrap_or(&default_selector);
        let candidates: Vec<Coin> = self
            .spend_candidates()
            .into_iter()
            .filter(|coin| coin.spendable)
            .collect();

        if request.empty_wallet {
            self.complete_empty_wallet(request, selector, candidates)
        } else {
            self.complete_with_fee_loop(request, selector, candidates)
        }
    }

    fn complete_with_fee_loop(
        &self,
        request: &SendRequest,
        selector: &dyn CoinSelector,
        candidates: Vec<Coin>,
    ) -> Result<CompletedTx, CompleteTxError> {
        let target = request
            .outputs
            .iter()
            .map(|output| output.value)
            .fold(Amount::ZERO, |acc, value| acc + value);
        let change_script = request
            .change_script
            .clone()
            .unwrap_or_else(|| self.keys.current_change_script());

        let mut fee = Amount::ZERO;
        for iteration in 0..MAX_FEE_ITERATIONS {
            let mut outputs = request.outputs.clone();

            if request.recipients_pay_fees && fee > Amount::ZERO {
                deduct_fee_from_recipients(&mut outputs, fee)?;
            }

            let needed = if request.recipients_pay_fees {
                target
            } else {
                target + fee
            };
            let selection = selector.select(needed, candidates.clone());
            if selection.total < needed {
                return Err(CompleteTxError::InsufficientFunds {
                    missing: needed - selection.total,
                    available: selection.total,
                    target,
                    fee,
                });
            }

            // Plan change; dust change folds into the fee (or is raised
            // out of the first recipient when they pay fees).
            let mut change = selection.total - needed;
            let mut fee_paid = fee;
            if change > Amount::ZERO {
                let mut change_output = TxOut {
                    value: change,
                    script_pubkey: change_script.clone(),
                };
                let min_non_dust = fees::dust_threshold(&change_output);
                if change < min_non_dust && request.recipients_pay_fees {
                    let shortfall = min_non_dust - change;
                    let first = outputs
                        .first_mut()
                        .expect("requests have at least one output");
                    let adjusted = first
                        .value
                        .checked_sub(shortfall)
                        .unwrap_or(Amount::ZERO);
                    let first_floor = fees::dust_threshold(first);
                    if adjusted < first_floor {
                        return Err(
                            CompleteTxError::CouldNotAdjustDownwards {
                                value: adjusted,
                                min_non_dust: first_floor,
                            },
                        );
                    }
                    first.value = adjusted;
                    change = min_non_dust;
                    change_output.value = change;
                    outputs.push(change_output);
                } else if change < min_non_dust {
                    fee_paid = fee_paid + change;
                } else {
                    change_output.value = change;
                    outputs.push(change_output);
                }
            }

            let input_classes = self.input_classes(&selection.coins);
            let vsize = fees::estimate_vsize(&input_classes, &outputs);
            if vsize > MAX_STANDARD_TX_SIZE {
                return Err(CompleteTxError::ExceededMaxTxSize { vsize });
            }
            let required = fees::required_fee(vsize, request.fee_per_kb);
            debug!(
                iteration,
                vsize,
                %fee_paid,
                %required,
                "fee iteration"
            );
            if fee_paid >= required {
                let completed = self.assemble(
                    request,
                    outputs,
                    selection.coins,
                    selection.total,
                )?;
                return Ok(completed);
            }
            fee = required;
        }

        // The fee sequence failed to reach its fixed point; the request is
        // effectively unfundable at a standard size.
        Err(CompleteTxError::ExceededMaxTxSize {
            vsize: MAX_STANDARD_TX_SIZE,
        })
    }

    fn complete_empty_wallet(
        &self,
        request: &SendRequest,
        selector: &dyn CoinSelector,
        candidates: Vec<Coin>,
    ) -> Result<CompletedTx, CompleteTxError> {
        let selection =
            selector.select(crate::constants::MAX_MONEY, candidates);
        if selection.total == Amount::ZERO {
            return Err(CompleteTxError::InsufficientFunds {
                missing: Amount::from_sat(1),
                available: Amount::ZERO,
                target: Amount::ZERO,
                fee: Amount::ZERO,
            });
        }

        let mut output = request
            .outputs
            .first()
            .cloned()
            .expect("empty-wallet requests have exactly one output");
        output.value = selection.total;

        // One shot: the output's size doesn't depend on its value, so the
        // fee is stable under the shrink.
        let input_classes = self.input_classes(&selection.coins);
        let outputs = vec![output];
        let vsize = fees::estimate_vsize(&input_classes, &outputs);
        if vsize > MAX_STANDARD_TX_SIZE {
            return Err(CompleteTxError::ExceededMaxTxSize { vsize });
        }
        let fee = fees::required_fee(vsize, request.fee_per_kb);

        let mut outputs = outputs;
        let value = match selection.total.checked_sub(fee) {
            Some(value) if value > Amount::ZERO => value,
            _ =>
                return Err(CompleteTxError::InsufficientFunds {
                    missing: fee - selection.total,
                    available: selection.total,
                    target: selection.total,
                    fee,
                }),
        };
        outputs[0].value = value;
        if fees::is_dust(&outputs[0]) {
            return Err(CompleteTxError::CouldNotAdjustDownwards {
                value,
                min_non_dust: fees::dust_threshold(&outputs[0]),
            });
        }

        self.assemble(request, outputs, selection.coins, selection.total)
    }

    fn input_classes(&self, coins: &[Coin]) -> Vec<InputClass> {
        coins
            .iter()
            .map(|coin| {
                let redeem = keys::p2sh_hash(&coin.output.script_pubkey)
                    .and_then(|hash| self.keys.find_redeem_data(&hash));
                InputClass::of(&coin.output.script_pubkey, redeem.as_ref())
            })
            .collect()
    }

    fn assemble(
        &self,
        request: &SendRequest,
        mut outputs: Vec<TxOut>,
        selected: Vec<Coin>,
        selected_total: Amount,
    ) -> Result<CompletedTx, CompleteTxError> {
        if request.sort_outputs {
            outputs.sort_by(|a, b| {
                a.value.cmp(&b.value).then_with(|| {
                    a.script_pubkey
                        .as_bytes()
                        .cmp(b.script_pubkey.as_bytes())
                })
            });
        }

        let output_total = outputs
            .iter()
            .map(|output| output.value)
            .fold(Amount::ZERO, |acc, value| acc + value);
        let fee = selected_total - output_total;

        let input: Vec<TxIn> = selected
            .iter()
            .map(|coin| TxIn {
                previous_output: coin.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect();
        let inputs_meta: Vec<ProposalInput> = selected
            .iter()
            .map(|coin| ProposalInput {
                spent_output: coin.output.clone(),
                redeem: keys::p2sh_hash(&coin.output.script_pubkey)
                    .and_then(|hash| self.keys.find_redeem_data(&hash)),
                hd_path: None,
            })
            .collect();

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output: outputs,
        };

        Ok(CompletedTx {
            proposal: TxProposal {
                tx,
                inputs: inputs_meta,
                missing_sigs_mode: request.missing_sigs_mode,
            },
            fee,
            selected,
        })
    }
}

/// Split `fee` across `outputs`, remainder on the first.
fn deduct_fee_from_recipients(
    outputs: &mut [TxOut],
    fee: Amount,
) -> Result<(), CompleteTxError> {
    let n = outputs.len() as u64;
    let each = fee / n;
    let remainder = fee - each * n;
    for (index, output) in outputs.iter_mut().enumerate() {
        let mut share = each;
        if index == 0 {
            share = share + remainder;
        }
        let adjusted = output
            .value
            .checked_sub(share)
            .unwrap_or(Amount::ZERO);
        let floor = fees::dust_threshold(output);
        if adjusted < floor {
            return Err(CompleteTxError::CouldNotAdjustDownwards {
                value: adjusted,
                min_non_dust: floor,
            });
        }
        output.value = adjusted;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::Hash as _;
    use bitcoin::WPubkeyHash;

    use super::*;
    use crate::{
        error::CompleteTxError,
        fees,
        keys::ScriptType,
        signer::LocalSigner,
        signer::Signer as _,
        test_utils::{self, block, fund_confirmed},
    };

    const SAT: fn(u64) -> Amount = Amount::from_sat;

    fn stranger_p2wpkh() -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([0xee; 20]))
    }

    #[test]
    fn one_input_send_with_change() {
        // S5: 50k to a P2WPKH recipient at 1000 sat/kvB from one 100k coin.
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        fund_confirmed(&mut state, SAT(100_000), 1, block(10));

        let mut request = SendRequest::to(stranger_p2wpkh(), SAT(50_000));
        request.fee_per_kb = SAT(1_000);
        let completed = state.complete_tx(&request).unwrap();

        let tx = &completed.proposal.tx;
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.output.len(), 2);

        let vsize = fees::estimate_vsize(
            &[fees::InputClass::P2wpkh],
            &tx.output,
        );
        assert!((140..=145).contains(&vsize), "vsize = {vsize}");
        assert!(completed.fee >= fees::required_fee(vsize, SAT(1_000)));

        let change = tx
            .output
            .iter()
            .find(|output| output.script_pubkey != stranger_p2wpkh())
            .unwrap();
        assert_eq!(change.value, SAT(100_000) - SAT(50_000) - completed.fee);

        // Signing completes with the wallet's own keys.
        let mut proposal = completed.proposal;
        let complete = LocalSigner::default()
            .sign_inputs(&mut proposal, state.keys.as_ref())
            .unwrap();
        assert!(complete);
    }

    #[test]
    fn empty_wallet_send_shrinks_single_output() {
        // S6: sweep a single 10k coin at 2000 sat/kvB.
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        fund_confirmed(&mut state, SAT(10_000), 1, block(10));

        let mut request = SendRequest::empty_wallet_to(stranger_p2wpkh());
        request.fee_per_kb = SAT(2_000);
        let completed = state.complete_tx(&request).unwrap();

        let tx = &completed.proposal.tx;
        assert_eq!(tx.output.len(), 1);
        let vsize = fees::estimate_vsize(
            &[fees::InputClass::P2wpkh],
            &tx.output,
        );
        assert_eq!(completed.fee, fees::required_fee(vsize, SAT(2_000)));
        assert_eq!(tx.output[0].value, SAT(10_000) - completed.fee);
    }

    #[test]
    fn empty_wallet_dust_result_fails_to_adjust() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        fund_confirmed(&mut state, SAT(300), 1, block(10));

        let mut request = SendRequest::empty_wallet_to(stranger_p2wpkh());
        request.fee_per_kb = SAT(2_000);
        let err = state.complete_tx(&request).unwrap_err();
        assert!(matches!(
            err,
            CompleteTxError::CouldNotAdjustDownwards { .. }
        ));
    }

    #[test]
    fn insufficient_funds_reports_missing_amount() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        fund_confirmed(&mut state, SAT(30_000), 1, block(10));

        let request = SendRequest::to(stranger_p2wpkh(), SAT(50_000));
        match state.complete_tx(&request).unwrap_err() {
            CompleteTxError::InsufficientFunds {
                missing,
                available,
                target,
                ..
            } => {
                assert_eq!(missing, SAT(20_000));
                assert_eq!(available, SAT(30_000));
                assert_eq!(target, SAT(50_000));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn dusty_request_is_rejected_up_front() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        fund_confirmed(&mut state, SAT(30_000), 1, block(10));

        let request = SendRequest::to(stranger_p2wpkh(), SAT(100));
        assert!(matches!(
            state.complete_tx(&request).unwrap_err(),
            CompleteTxError::Dusty { .. }
        ));
    }

    #[test]
    fn multiple_op_returns_are_rejected() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        fund_confirmed(&mut state, SAT(30_000), 1, block(10));

        let op_return = |tag: u8| TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new_op_return([tag; 4]),
        };
        let mut request = SendRequest::to(stranger_p2wpkh(), SAT(10_000));
        request.outputs.push(op_return(1));
        request.outputs.push(op_return(2));
        assert!(matches!(
            state.complete_tx(&request).unwrap_err(),
            CompleteTxError::MultipleOpReturn
        ));
    }

    #[test]
    fn recipients_pay_fees_deducts_from_outputs() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        fund_confirmed(&mut state, SAT(100_000), 1, block(10));

        let mut request = SendRequest::to(stranger_p2wpkh(), SAT(100_000));
        request.recipients_pay_fees = true;
        request.fee_per_kb = SAT(1_000);
        let completed = state.complete_tx(&request).unwrap();

        // Recipient got 100k minus the fee; no change output.
        let tx = &completed.proposal.tx;
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, SAT(100_000) - completed.fee);
        assert!(completed.fee > Amount::ZERO);
    }

    #[test]
    fn dust_change_folds_into_fee() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        fund_confirmed(&mut state, SAT(50_500), 1, block(10));

        // needed ~= 50_000 + ~141 fee; change ~= 350... pick a value so
        // change lands below the P2WPKH dust floor of 204 sats.
        let mut request = SendRequest::to(stranger_p2wpkh(), SAT(50_200));
        request.fee_per_kb = SAT(1_000);
        let completed = state.complete_tx(&request).unwrap();

        let tx = &completed.proposal.tx;
        assert_eq!(tx.output.len(), 1, "dust change must not materialize");
        // The dropped change was paid as fee on top of the required fee.
        assert_eq!(completed.fee, SAT(50_500) - SAT(50_200));
    }

    #[test]
    fn fee_iteration_reaches_fixed_point_quickly() {
        // Many small coins force re-selection as the fee grows; the loop
        // must still settle fast.
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        for tag in 1..=12u8 {
            fund_confirmed(&mut state, SAT(10_000), tag, block(10 + tag as u32));
        }

        let mut request = SendRequest::to(stranger_p2wpkh(), SAT(95_000));
        request.fee_per_kb = SAT(5_000);
        let completed = state.complete_tx(&request).unwrap();

        let tx = &completed.proposal.tx;
        let classes: Vec<_> = tx
            .input
            .iter()
            .map(|_| fees::InputClass::P2wpkh)
            .collect();
        let vsize = fees::estimate_vsize(&classes, &tx.output);
        assert!(completed.fee >= fees::required_fee(vsize, SAT(5_000)));

        // Inputs cover outputs plus fee exactly.
        let in_total: Amount = completed
            .selected
            .iter()
            .map(|coin| coin.value())
            .fold(Amount::ZERO, |acc, value| acc + value);
        let out_total: Amount = tx
            .output
            .iter()
            .map(|output| output.value)
            .fold(Amount::ZERO, |acc, value| acc + value);
        assert_eq!(in_total, out_total + completed.fee);
    }

    #[test]
    fn outputs_are_canonically_ordered() {
        let mut state = test_utils::test_state(ScriptType::P2wpkh);
        fund_confirmed(&mut state, SAT(100_000), 1, block(10));

        let mut request = SendRequest::to(stranger_p2wpkh(), SAT(30_000));
        request.outputs.push(TxOut {
            value: SAT(20_000),
            script_pubkey: ScriptBuf::new_p2wpkh(
                &WPubkeyHash::from_byte_array([0x11; 20]),
            ),
        });
        request.fee_per_kb = SAT(1_000);
        let completed = state.complete_tx(&request).unwrap();

        let values: Vec<Amount> = completed
            .proposal
            .tx
            .output
            .iter()
            .map(|output| output.value)
            .collect();
        let mut sorted = values.clone();
        sorted.sort();
        assert_eq!(values, sorted);
    }
}
