//! The broadcaster capability.
//!
//! The wallet itself has no network stack; committing a self-originated
//! transaction hands it to a [`Broadcaster`] supplied at construction.
//! Network errors stay isolated inside the returned [`TxBroadcast`]: the
//! transaction remains pending in the wallet and is retried on
//! reconnection by the network layer.
//!
//! Implementations must never be called with the wallet lock held.

use bitcoin::Transaction;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Peer rejected the transaction: {0}")]
    Rejected(String),

    #[error("The network layer went away before reporting a result")]
    ChannelClosed,
}

/// The in-flight broadcast of one transaction.
pub struct TxBroadcast {
    sent: Option<oneshot::Receiver<Result<(), BroadcastError>>>,
    relayed: Option<oneshot::Receiver<Result<(), BroadcastError>>>,
}

impl TxBroadcast {
    /// Completes once the transaction has been written to at least one
    /// peer.
    pub async fn await_sent(&mut self) -> Result<(), BroadcastError> {
        Self::await_stage(&mut self.sent).await
    }

    /// Completes once at least one *other* peer has announced the
    /// transaction back to us, i.e. it is propagating.
    pub async fn await_relayed(&mut self) -> Result<(), BroadcastError> {
        Self::await_stage(&mut self.relayed).await
    }

    async fn await_stage(
        stage: &mut Option<oneshot::Receiver<Result<(), BroadcastError>>>,
    ) -> Result<(), BroadcastError> {
        match stage.take() {
            Some(rx) =>
                rx.await.unwrap_or(Err(BroadcastError::ChannelClosed)),
            // Already awaited; the first answer stands.
            None => Ok(()),
        }
    }
}

/// The completion side handed to the network layer. Each stage completes
/// at most once; repeat completions are no-ops.
pub struct TxBroadcastHandle {
    sent: Option<oneshot::Sender<Result<(), BroadcastError>>>,
    relayed: Option<oneshot::Sender<Result<(), BroadcastError>>>,
}

impl TxBroadcastHandle {
    pub fn complete_sent(&mut self, result: Result<(), BroadcastError>) {
        if let Some(sender) = self.sent.take() {
            let _ = sender.send(result);
        }
    }

    pub fn complete_relayed(&mut self, result: Result<(), BroadcastError>) {
        if let Some(sender) = self.relayed.take() {
            let _ = sender.send(result);
        }
    }
}

/// Create a linked broadcast handle/future pair.
pub fn channel() -> (TxBroadcastHandle, TxBroadcast) {
    let (sent_tx, sent_rx) = oneshot::channel();
    let (relayed_tx, relayed_rx) = oneshot::channel();
    (
        TxBroadcastHandle {
            sent: Some(sent_tx),
            relayed: Some(relayed_tx),
        },
        TxBroadcast { sent: Some(sent_rx), relayed: Some(relayed_rx) },
    )
}

/// Sends transactions to the network.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, tx: Transaction) -> TxBroadcast;
}
