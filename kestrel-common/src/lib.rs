//! Shared primitive types for the Kestrel SPV wallet.
//!
//! Everything in this crate is wallet-logic-free: newtypes over
//! [`bitcoin`] hash types with consistent orderings and serializations,
//! the network enum, millisecond timestamps, and a few small tokio
//! synchronization utilities used by background tasks.

/// Block ids.
pub mod chain;
/// Network enum with consistent `FromStr` / `Display` impls.
pub mod network;
/// Coalescing single-permit notification channel.
pub mod notify;
/// One-shot multi-consumer shutdown signal.
pub mod shutdown;
/// Named task handles.
pub mod task;
/// Test-only helpers, e.g. serde round-trip proptests.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
/// Millisecond timestamps.
pub mod time;

/// The default channel size for bounded tokio channels.
pub const DEFAULT_CHANNEL_SIZE: usize = 256;
