//! The error taxonomy exposed to wallet callers.
//!
//! User-actionable errors surface from the call that triggered them and
//! leave wallet state unchanged. Consistency violations are fatal: they
//! indicate a bug in pool or spent-flag bookkeeping and are raised from
//! [`is_consistent_or_throw`] after every mutator.
//!
//! [`is_consistent_or_throw`]: crate::state::WalletState::is_consistent_or_throw

use bitcoin::Amount;
use thiserror::Error;

/// Errors from completing (funding, adjusting, and planning fees for) a
/// spend request.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CompleteTxError {
    #[error(
        "Insufficient funds: missing {missing}, have {available}, \
         target {target}, fee {fee}"
    )]
    InsufficientFunds {
        missing: Amount,
        available: Amount,
        target: Amount,
        fee: Amount,
    },

    #[error("Requested output of {value} is below its dust threshold {min_non_dust}")]
    Dusty { value: Amount, min_non_dust: Amount },

    #[error(
        "Could not adjust output of {value} downwards to pay the fee; \
         minimum non-dust value is {min_non_dust}"
    )]
    CouldNotAdjustDownwards { value: Amount, min_non_dust: Amount },

    #[error("Transaction of {vsize} vbytes exceeds the max standard size")]
    ExceededMaxTxSize { vsize: usize },

    #[error("At most one OP_RETURN output is standard")]
    MultipleOpReturn,
}

/// Errors from driving the signer chain.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignError {
    #[error("No private key available for input {input_index}")]
    MissingPrivateKey { input_index: usize },

    #[error("Input {input_index} is missing a signature")]
    MissingSignature { input_index: usize },

    #[error("A signer in the chain reported it is not ready")]
    SignerNotReady,
}

/// Errors from encrypting / decrypting key material at rest.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum KeyCryptoError {
    #[error("The supplied password does not decrypt this wallet")]
    BadEncryptionKey,

    #[error("The wallet is already encrypted")]
    AlreadyEncrypted,

    #[error("The wallet is not encrypted")]
    NotEncrypted,
}

/// Errors from wallet maintenance (key rotation and deterministic upgrade).
#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("Key rotation on an encrypted wallet requires the password")]
    KeyRotationRequiresPassword,

    #[error("Deterministic upgrade on an encrypted wallet requires the password")]
    DeterministicUpgradeRequiresPassword,

    #[error(transparent)]
    CompleteTx(#[from] CompleteTxError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
}

/// Errors from the full send path (complete → sign → commit).
#[derive(Debug, Error)]
pub enum SendCoinsError {
    #[error(transparent)]
    CompleteTx(#[from] CompleteTxError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
}

/// A fatal internal invariant violation: pool disjointness, a spent-by
/// mismatch, or a negative balance. The wallet is left in a best-effort
/// state and the error propagated to the caller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Wallet consistency violation: {reason}")]
pub struct ConsistencyError {
    pub reason: String,
}

impl ConsistencyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}
