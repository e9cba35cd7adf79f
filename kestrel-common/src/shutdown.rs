use std::sync::Arc;

use tokio::sync::Semaphore;

/// Synchronization utility which sends a notification to all consumers
/// *once*, most commonly used for shutdown signals.
///
/// - Multi-producer and multi-consumer - simply clone to get another handle.
/// - Every clone observes a signal at-most-once. If the signal has already
///   been sent, new clones can still observe it once.
/// - Consumers can receive signals that were sent prior to 'subscribing' to
///   the channel (unlike [`tokio::sync::broadcast`]).
/// - It is safe to send a signal multiple times (e.g. by accident).
///
/// The implementation relies on the fact that calling [`acquire`] on a
/// [`Semaphore`] with 0 permits only returns once the [`Semaphore`] has been
/// closed. Closing the [`Semaphore`] is equivalent to sending a signal.
///
/// [`acquire`]: Semaphore::acquire
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    inner: Arc<Semaphore>,
    have_recved: bool,
}

impl ShutdownSignal {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
            have_recved: false,
        }
    }

    /// Send the signal, causing all actors waiting on this channel to
    /// complete their call to [`recv`].
    ///
    /// [`recv`]: ShutdownSignal::recv
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for the signal.
    ///
    /// NOTE: If this handle has already observed a signal, this future will
    /// never resolve again.
    pub async fn recv(&mut self) {
        if self.have_recved {
            std::future::pending().await
        } else {
            // The acquire can only fail once the semaphore is closed, i.e.
            // once the signal has been sent.
            self.inner
                .acquire()
                .await
                .map(|_| ())
                .expect_err("Shouldn't have been able to acquire a permit");
            self.have_recved = true;
        }
    }

    /// Immediately returns whether the signal has been sent.
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}
