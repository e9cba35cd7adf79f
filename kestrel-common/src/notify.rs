//! A coalescing notification channel wrapping [`tokio::sync::mpsc`].
//!
//! If multiple notifications are sent before the receiver calls
//! [`Receiver::recv`], the receiver is only woken once, so a burst of wallet
//! mutations results in a single (re-)persist instead of one write per
//! mutation.
//!
//! - `tx.send()` never blocks and doesn't care whether the channel was full
//!   or the receiver was dropped.
//! - `rx.recv()` never resolves if all senders have been dropped, which is
//!   the behavior background tasks want (they exit via a shutdown signal
//!   instead).

use tokio::sync::mpsc;

/// Create a new `notify` channel returning a [`Sender`] (cloneable) and
/// [`Receiver`] (not cloneable), analogous to `mpsc::channel(1)`.
pub fn channel() -> (Sender, Receiver) {
    let (tx, rx) = mpsc::channel(1);
    (Sender(tx), Receiver(rx))
}

/// `notify` sender, analogous to `mpsc::Sender<()>`.
#[derive(Clone)]
pub struct Sender(mpsc::Sender<()>);

/// `notify` receiver, analogous to `mpsc::Receiver<()>`.
pub struct Receiver(mpsc::Receiver<()>);

impl Sender {
    /// Sends a notification to the [`Receiver`].
    pub fn send(&self) {
        let _ = self.0.try_send(());
    }
}

impl Receiver {
    /// Waits until a notification is received over the channel. Completes
    /// immediately if a notification has already been sent. NOTE: If all
    /// [`Sender`]s have been dropped, this future never completes!
    pub async fn recv(&mut self) {
        match self.0.recv().await {
            Some(()) => (),
            None => std::future::pending().await,
        }
    }

    /// Immediately returns whether a notification has been sent.
    #[must_use]
    pub fn try_recv(&mut self) -> bool {
        self.0.try_recv().is_ok()
    }

    /// Clears out any pending notifications on the channel.
    pub fn clear(&mut self) {
        while self.0.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn multiple_sends_coalesce() {
        let (tx, mut rx) = channel();
        tx.send();
        tx.send();
        tx.send();

        // Only one notification should have been enqueued.
        rx.recv().await;
        assert!(!rx.try_recv());
    }

    #[tokio::test]
    async fn clear_discards_pending() {
        let (tx, mut rx) = channel();
        tx.send();
        rx.clear();
        assert!(!rx.try_recv());
    }
}
