//! The Kestrel SPV wallet core.
//!
//! This crate is the partial-information state machine at the heart of an
//! SPV wallet: it classifies and stores transactions relevant to a key
//! set, maintains spent/unspent state through pending broadcast, block
//! confirmation, double-spend discovery and chain reorganization, and
//! assembles, signs and tracks new payments.
//!
//! It deliberately has no network stack, no script interpreter, and no
//! header chain of its own; those arrive through the capability traits in
//! [`broadcast`], [`signer`] and the block callbacks on
//! [`wallet::Wallet`].
//!
//! Start at [`wallet::Wallet`] for the public surface, or [`state`] for
//! the state machine itself.

/// The broadcaster capability.
pub mod broadcast;
/// Spend planning: funding, fee iteration, change.
pub mod builder;
/// Relevance classification and risk analysis of pending transactions.
pub mod classify;
/// Per-transaction confidence tracking.
pub mod confidence;
pub mod constants;
/// Password sealing of key material at rest.
pub mod crypt;
/// The caller-facing error taxonomy.
pub mod error;
/// Listener events and executor dispatch.
pub mod events;
/// Virtual sizes, dust thresholds, fee math.
pub mod fees;
/// Deterministic chains and the key registry.
pub mod keychain;
/// The key-bag capability.
pub mod keys;
/// Snapshots, the store collaborator, auto-save.
pub mod persist;
/// The four-pool transaction store.
pub mod pool;
/// Key-rotation maintenance.
pub mod rotation;
/// Coin selection.
pub mod select;
/// The signer chain.
pub mod signer;
/// The wallet state machine.
pub mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
/// The wallet's view of a transaction.
pub mod tx;
/// The wallet facade and lock.
pub mod wallet;

pub use wallet::{SendResult, Wallet, WalletConfig};
