//! The signer chain.
//!
//! A proposed transaction passes through an ordered list of [`Signer`]s,
//! each filling in whatever signatures it can produce from the key bag.
//! The built-in [`LocalSigner`] handles P2PKH, P2PK, P2SH (via redeem
//! data) and P2WPKH with `SIGHASH_ALL`; external cosigners can be chained
//! after it and pick the same HD branch from the paths recorded on the
//! proposal.
//!
//! Script *verification* is an external collaborator behind
//! [`ScriptVerifier`]: the local signer only uses it to skip inputs that
//! are already spending correctly. Inputs we cannot verify (e.g. an
//! exotic SIGHASH on a transaction we didn't build) are treated as already
//! signed: we log and skip rather than crash or clobber.

use bitcoin::{
    bip32::DerivationPath,
    hashes::Hash as _,
    script::{Builder, PushBytesBuf},
    sighash::SighashCache,
    EcdsaSighashType, ScriptBuf, Transaction, TxOut, Witness,
};
use secp256k1::{All, Message, Secp256k1};
use tracing::warn;

use crate::{
    error::SignError,
    keys::{self, KeyBag, RedeemData, ScriptType},
};

/// What to put in place of a signature we cannot produce.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum MissingSigsMode {
    /// Leave an `OP_0` placeholder (standard for unsigned multisig slots).
    #[default]
    UseOpZero,
    /// Insert a correctly-sized dummy signature; useful when the result is
    /// only used for fee estimation.
    UseDummySig,
    /// Fail the signing pass.
    Throw,
}

/// Per-input context travelling with a proposal, parallel to `tx.input`.
#[derive(Clone, Debug)]
pub struct ProposalInput {
    /// The output this input spends.
    pub spent_output: TxOut,
    /// Redeem data when the spent output is P2SH and we are party to it.
    pub redeem: Option<RedeemData>,
    /// The HD path of the key that signed (or should sign) this input,
    /// recorded by the first signer to resolve it.
    pub hd_path: Option<DerivationPath>,
}

/// A transaction in the process of being signed.
#[derive(Clone, Debug)]
pub struct TxProposal {
    pub tx: Transaction,
    pub inputs: Vec<ProposalInput>,
    pub missing_sigs_mode: MissingSigsMode,
}

/// One stage of the signer chain.
pub trait Signer: Send + Sync {
    /// Whether this signer can currently operate (e.g. a hardware device
    /// is connected). Chains skip signers that are not ready.
    fn is_ready(&self) -> bool;

    /// Add whatever signatures this signer can. Returns `Ok(true)` if
    /// every input it is responsible for is now fully signed.
    fn sign_inputs(
        &self,
        proposal: &mut TxProposal,
        key_bag: &dyn KeyBag,
    ) -> Result<bool, SignError>;
}

/// The outcome of checking one input's existing script.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VerifyOutcome {
    /// The input correctly spends its output.
    Valid,
    /// No signature material present yet.
    Unsigned,
    /// We cannot judge (non-template script or unusual signature); the
    /// caller must not clobber it.
    Unverifiable,
}

/// Judges whether an input already spends its output correctly. The real
/// interpreter (with P2SH and NULLDUMMY flags, accepting any SIGHASH) is
/// an external collaborator; [`StructuralVerifier`] is the built-in
/// approximation.
pub trait ScriptVerifier: Send + Sync {
    fn verify_input(
        &self,
        tx: &Transaction,
        vin: usize,
        spent_output: &TxOut,
    ) -> VerifyOutcome;
}

/// Template-shape checks only: enough to distinguish "empty" from
/// "plausibly signed" without executing scripts.
#[derive(Copy, Clone, Debug, Default)]
pub struct StructuralVerifier;

impl ScriptVerifier for StructuralVerifier {
    fn verify_input(
        &self,
        tx: &Transaction,
        vin: usize,
        spent_output: &TxOut,
    ) -> VerifyOutcome {
        let input = &tx.input[vin];
        let spk = &spent_output.script_pubkey;

        if input.script_sig.is_empty() && input.witness.is_empty() {
            return VerifyOutcome::Unsigned;
        }

        if spk.is_p2wpkh() {
            let looks_signed = input.witness.len() == 2
                && input
                    .witness
                    .nth(0)
                    .map(|sig| (60..=73).contains(&sig.len()))
                    .unwrap_or(false)
                && input
                    .witness
                    .nth(1)
                    .map(|pubkey| pubkey.len() == 33)
                    .unwrap_or(false);
            return if looks_signed {
                VerifyOutcome::Valid
            } else {
                VerifyOutcome::Unsigned
            };
        }

        if spk.is_p2pkh() || spk.is_p2pk() {
            // Something was spliced in; whether the signature verifies is
            // the interpreter's business, not ours.
            return VerifyOutcome::Unverifiable;
        }

        VerifyOutcome::Unverifiable
    }
}

/// The built-in software signer.
pub struct LocalSigner {
    secp: Secp256k1<All>,
    verifier: Box<dyn ScriptVerifier>,
}

impl Default for LocalSigner {
    fn default() -> Self {
        Self::new(Box::new(StructuralVerifier))
    }
}

impl LocalSigner {
    pub fn new(verifier: Box<dyn ScriptVerifier>) -> Self {
        Self { secp: Secp256k1::new(), verifier }
    }

    fn dummy_signature() -> Vec<u8> {
        // Worst-case DER signature length plus the sighash byte.
        vec![0x30; 72]
    }
}

impl Signer for LocalSigner {
    fn is_ready(&self) -> bool {
        true
    }

    fn sign_inputs(
        &self,
        proposal: &mut TxProposal,
        key_bag: &dyn KeyBag,
    ) -> Result<bool, SignError> {
        let mut all_signed = true;
        let num_inputs = proposal.tx.input.len();
        debug_assert_eq!(num_inputs, proposal.inputs.len());

        for vin in 0..num_inputs {
            let spent_output = proposal.inputs[vin].spent_output.clone();
            let spk = spent_output.script_pubkey.clone();

            match self.verifier.verify_input(&proposal.tx, vin, &spent_output)
            {
                VerifyOutcome::Valid => continue,
                VerifyOutcome::Unverifiable => {
                    // Possibly a non-standard SIGHASH from a cosigner;
                    // treat as signed rather than clobber it.
                    warn!(vin, "skipping unverifiable input");
                    continue;
                }
                VerifyOutcome::Unsigned => (),
            }

            if let Some(hash) = keys::p2wpkh_hash(&spk) {
                let key = key_bag
                    .find_key_by_pubkey_hash(&hash, ScriptType::P2wpkh);
                let key = match key {
                    Some(key) => key,
                    None => {
                        all_signed = false;
                        continue;
                    }
                };
                proposal.inputs[vin].hd_path = Some(key.path.clone());
                let privkey = match key.privkey {
                    Some(privkey) => privkey,
                    None => match proposal.missing_sigs_mode {
                        MissingSigsMode::Throw =>
                            return Err(SignError::MissingPrivateKey {
                                input_index: vin,
                            }),
                        _ => {
                            all_signed = false;
                            continue;
                        }
                    },
                };

                let sighash = SighashCache::new(&proposal.tx)
                    .p2wpkh_signature_hash(
                        vin,
                        &spk,
                        spent_output.value,
                        EcdsaSighashType::All,
                    )
                    .expect("input index is in bounds");
                let message =
                    Message::from_digest(sighash.to_byte_array());
                let signature = bitcoin::ecdsa::Signature {
                    signature: self.secp.sign_ecdsa(&message, &privkey),
                    sighash_type: EcdsaSighashType::All,
                };
                proposal.tx.input[vin].witness =
                    Witness::p2wpkh(&signature, &key.pubkey);
                proposal.tx.input[vin].script_sig = ScriptBuf::new();
                continue;
            }

            if spk.is_p2pkh() || spk.is_p2pk() {
                let key = keys::p2pkh_hash(&spk)
                    .and_then(|hash| {
                        key_bag
                            .find_key_by_pubkey_hash(&hash, ScriptType::P2pkh)
                    })
                    .or_else(|| {
                        keys::p2pk_pubkey(&spk).and_then(|pubkey| {
                            key_bag.find_key_by_pubkey(&pubkey)
                        })
                    });
                let key = match key {
                    Some(key) => key,
                    None => {
                        all_signed = false;
                        continue;
                    }
                };
                proposal.inputs[vin].hd_path = Some(key.path.clone());
                let privkey = match key.privkey {
                    Some(privkey) => privkey,
                    None => match proposal.missing_sigs_mode {
                        MissingSigsMode::Throw =>
                            return Err(SignError::MissingPrivateKey {
                                input_index: vin,
                            }),
                        _ => {
                            all_signed = false;
                            continue;
                        }
                    },
                };

                let sighash = SighashCache::new(&proposal.tx)
                    .legacy_signature_hash(
                        vin,
                        &spk,
                        EcdsaSighashType::All.to_u32(),
                    )
                    .expect("input index is in bounds");
                let message =
                    Message::from_digest(sighash.to_byte_array());
                let signature = bitcoin::ecdsa::Signature {
                    signature: self.secp.sign_ecdsa(&message, &privkey),
                    sighash_type: EcdsaSighashType::All,
                };
                let sig_push =
                    PushBytesBuf::try_from(signature.to_vec())
                        .expect("signatures fit in a push");

                // Signature splices in at position 0; P2PK stops there,
                // P2PKH appends the pubkey.
                let mut builder = Builder::new().push_slice(&sig_push);
                if spk.is_p2pkh() {
                    let pubkey_push = PushBytesBuf::try_from(
                        key.pubkey.serialize().to_vec(),
                    )
                    .expect("pubkeys fit in a push");
                    builder = builder.push_slice(&pubkey_push);
                }
                proposal.tx.input[vin].script_sig = builder.into_script();
                continue;
            }

            if let Some(script_hash) = keys::p2sh_hash(&spk) {
                let redeem = proposal.inputs[vin]
                    .redeem
                    .clone()
                    .or_else(|| key_bag.find_redeem_data(&script_hash));
                let redeem = match redeem {
                    Some(redeem) => redeem,
                    None => {
                        all_signed = false;
                        continue;
                    }
                };

                let sighash = SighashCache::new(&proposal.tx)
                    .legacy_signature_hash(
                        vin,
                        &redeem.redeem_script,
                        EcdsaSighashType::All.to_u32(),
                    )
                    .expect("input index is in bounds");
                let message =
                    Message::from_digest(sighash.to_byte_array());

                // NULLDUMMY slot for CHECKMULTISIG, then one signature
                // (or placeholder) per key, then the redeem script.
                let mut builder = Builder::new().push_int(0);
                let mut complete = true;
                for key in &redeem.keys {
                    if let Some(key) = &key.privkey {
                        let signature = bitcoin::ecdsa::Signature {
                            signature: self.secp.sign_ecdsa(&message, key),
                            sighash_type: EcdsaSighashType::All,
                        };
                        let push =
                            PushBytesBuf::try_from(signature.to_vec())
                                .expect("signatures fit in a push");
                        builder = builder.push_slice(&push);
                    } else {
                        match proposal.missing_sigs_mode {
                            MissingSigsMode::UseOpZero => {
                                builder = builder.push_int(0);
                                complete = false;
                            }
                            MissingSigsMode::UseDummySig => {
                                let push = PushBytesBuf::try_from(
                                    Self::dummy_signature(),
                                )
                                .expect("dummy sig fits in a push");
                                builder = builder.push_slice(&push);
                                complete = false;
                            }
                            MissingSigsMode::Throw =>
                                return Err(SignError::MissingPrivateKey {
                                    input_index: vin,
                                }),
                        }
                    }
                }
                let redeem_push = PushBytesBuf::try_from(
                    redeem.redeem_script.to_bytes(),
                )
                .expect("standard redeem scripts fit in a push");
                builder = builder.push_slice(&redeem_push);
                proposal.tx.input[vin].script_sig = builder.into_script();
                proposal.inputs[vin].hd_path = redeem
                    .keys
                    .first()
                    .map(|key| key.path.clone());
                all_signed &= complete;
                continue;
            }

            // Unknown template; nothing we can do.
            warn!(vin, "cannot sign input with unknown script template");
            all_signed = false;
        }

        Ok(all_signed)
    }
}

/// Drive `signers` over `proposal` in order. Signers that are not ready
/// are an error: the caller opted into a chain it cannot complete.
pub fn run_signer_chain(
    signers: &[Box<dyn Signer>],
    proposal: &mut TxProposal,
    key_bag: &dyn KeyBag,
) -> Result<bool, SignError> {
    let mut complete = true;
    for signer in signers {
        if !signer.is_ready() {
            return Err(SignError::SignerNotReady);
        }
        complete = signer.sign_inputs(proposal, key_bag)?;
    }
    Ok(complete)
}

#[cfg(test)]
mod test {
    use bitcoin::{
        absolute::LockTime, transaction::Version, Amount, OutPoint,
        Sequence, TxIn, Txid,
    };
    use kestrel_common::time::TimestampMs;
    use secp256k1::SecretKey;

    use super::*;
    use crate::keys::SigningKey;

    struct StubKeyBag {
        keys: Vec<SigningKey>,
        redeem: Option<RedeemData>,
    }

    impl KeyBag for StubKeyBag {
        fn find_key_by_pubkey(
            &self,
            pubkey: &secp256k1::PublicKey,
        ) -> Option<SigningKey> {
            self.keys.iter().find(|key| key.pubkey == *pubkey).cloned()
        }

        fn find_key_by_pubkey_hash(
            &self,
            hash: &[u8; 20],
            _script_type: ScriptType,
        ) -> Option<SigningKey> {
            self.keys
                .iter()
                .find(|key| key.pubkey_hash().to_byte_array() == *hash)
                .cloned()
        }

        fn find_redeem_data(
            &self,
            script_hash: &bitcoin::ScriptHash,
        ) -> Option<RedeemData> {
            self.redeem
                .clone()
                .filter(|redeem| redeem.script_hash() == *script_hash)
        }

        fn mark_pubkey_used(&self, _pubkey: &secp256k1::PublicKey) {}
        fn mark_script_hash_used(&self, _hash: &bitcoin::ScriptHash) {}
        fn earliest_key_creation_time(&self) -> TimestampMs {
            TimestampMs::MIN
        }
    }

    fn stub_key(byte: u8) -> SigningKey {
        let privkey = SecretKey::from_slice(&[byte; 32]).unwrap();
        let secp = Secp256k1::new();
        SigningKey {
            pubkey: privkey.public_key(&secp),
            privkey: Some(privkey),
            path: DerivationPath::master(),
            created_at: TimestampMs::MIN,
        }
    }

    fn proposal_spending(spent_output: TxOut) -> TxProposal {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([7; 32]),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(40_000),
                script_pubkey: ScriptBuf::new_p2wpkh(
                    &bitcoin::WPubkeyHash::from_byte_array([9; 20]),
                ),
            }],
        };
        TxProposal {
            tx,
            inputs: vec![ProposalInput {
                spent_output,
                redeem: None,
                hd_path: None,
            }],
            missing_sigs_mode: MissingSigsMode::default(),
        }
    }

    #[test]
    fn signs_p2wpkh_with_witness_and_empty_script_sig() {
        let key = stub_key(11);
        let spent = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: key.script_pubkey(ScriptType::P2wpkh),
        };
        let mut proposal = proposal_spending(spent);
        let bag = StubKeyBag { keys: vec![key], redeem: None };

        let complete =
            LocalSigner::default().sign_inputs(&mut proposal, &bag).unwrap();
        assert!(complete);

        let input = &proposal.tx.input[0];
        assert!(input.script_sig.is_empty());
        assert_eq!(input.witness.len(), 2);
        assert_eq!(input.witness.nth(1).unwrap().len(), 33);
        assert!(proposal.inputs[0].hd_path.is_some());
    }

    #[test]
    fn signs_p2pkh_with_sig_then_pubkey() {
        let key = stub_key(12);
        let spent = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: key.script_pubkey(ScriptType::P2pkh),
        };
        let mut proposal = proposal_spending(spent);
        let bag = StubKeyBag { keys: vec![key], redeem: None };

        let complete =
            LocalSigner::default().sign_inputs(&mut proposal, &bag).unwrap();
        assert!(complete);

        let input = &proposal.tx.input[0];
        assert!(input.witness.is_empty());
        // Two pushes: signature then pubkey.
        let pushes: Vec<_> = input
            .script_sig
            .instructions()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(pushes.len(), 2);
    }

    #[test]
    fn already_signed_input_is_skipped() {
        let key = stub_key(13);
        let spent = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: key.script_pubkey(ScriptType::P2wpkh),
        };
        let mut proposal = proposal_spending(spent);
        let bag = StubKeyBag { keys: vec![key], redeem: None };

        let signer = LocalSigner::default();
        signer.sign_inputs(&mut proposal, &bag).unwrap();
        let witness_before = proposal.tx.input[0].witness.clone();

        // Signing again must not clobber the existing witness.
        signer.sign_inputs(&mut proposal, &bag).unwrap();
        assert_eq!(proposal.tx.input[0].witness, witness_before);
    }

    #[test]
    fn missing_key_with_throw_mode_errors() {
        let key = stub_key(14);
        let spent = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: key.script_pubkey(ScriptType::P2wpkh),
        };
        let mut proposal = proposal_spending(spent);
        proposal.missing_sigs_mode = MissingSigsMode::Throw;

        // The bag knows the pubkey but has no private half.
        let watch_only = SigningKey { privkey: None, ..key };
        let bag = StubKeyBag { keys: vec![watch_only], redeem: None };

        let err = LocalSigner::default()
            .sign_inputs(&mut proposal, &bag)
            .unwrap_err();
        assert_eq!(err, SignError::MissingPrivateKey { input_index: 0 });
    }

    #[test]
    fn p2sh_multisig_gets_placeholders_for_missing_sigs() {
        let ours = stub_key(15);
        let theirs = SigningKey { privkey: None, ..stub_key(16) };

        // 2-of-2 multisig redeem script.
        let redeem_script = Builder::new()
            .push_int(2)
            .push_slice(
                &PushBytesBuf::try_from(ours.pubkey.serialize().to_vec())
                    .unwrap(),
            )
            .push_slice(
                &PushBytesBuf::try_from(theirs.pubkey.serialize().to_vec())
                    .unwrap(),
            )
            .push_int(2)
            .push_opcode(bitcoin::opcodes::all::OP_CHECKMULTISIG)
            .into_script();
        let redeem = RedeemData {
            redeem_script: redeem_script.clone(),
            keys: vec![ours.clone(), theirs],
        };

        let spent = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::new_p2sh(&redeem.script_hash()),
        };
        let mut proposal = proposal_spending(spent);
        let bag = StubKeyBag { keys: vec![ours], redeem: Some(redeem) };

        let complete =
            LocalSigner::default().sign_inputs(&mut proposal, &bag).unwrap();
        // Our signature is in, the cosigner's slot is an OP_0 placeholder.
        assert!(!complete);
        assert!(!proposal.tx.input[0].script_sig.is_empty());
    }
}
