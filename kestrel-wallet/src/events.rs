//! Listener events and their dispatch.
//!
//! Every observable wallet change collapses into one tagged enum,
//! dispatched to registered (executor, callback) pairs. Callbacks run on
//! their executor, never with the wallet lock held, and a panicking
//! listener is caught and logged rather than allowed to poison wallet
//! state.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use bitcoin::{Amount, Txid};
use tracing::error;

/// Everything a wallet can tell its listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    /// A transaction sending us value was committed or confirmed.
    CoinsReceived {
        txid: Txid,
        prev_balance: Amount,
        new_balance: Amount,
    },
    /// A transaction spending our value was committed or confirmed.
    CoinsSent {
        txid: Txid,
        prev_balance: Amount,
        new_balance: Amount,
    },
    /// The best chain switched branches and history was replayed.
    Reorganized,
    /// Catch-all: some tracked transaction changed pool or depth.
    Changed,
    /// The set of watched scripts changed; filters must be rebuilt.
    ScriptsChanged,
    /// One transaction's confidence changed.
    ConfidenceChanged { txid: Txid },
    /// The deterministic lookahead grew by `count` keys.
    KeysAdded { count: u32 },
    /// The current receive key was consumed; the next caller gets a new
    /// address.
    CurrentKeyChanged,
}

/// Where listener callbacks run.
pub trait EventExecutor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs callbacks inline on the dispatching thread. Cheap, but listeners
/// block event delivery.
pub struct SameThreadExecutor;

impl EventExecutor for SameThreadExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// Runs callbacks on the tokio blocking pool, isolating slow listeners
/// from the caller.
pub struct TokioExecutor;

impl EventExecutor for TokioExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        tokio::task::spawn_blocking(task);
    }
}

pub type EventCallback = Arc<dyn Fn(WalletEvent) + Send + Sync>;

struct Listener {
    executor: Arc<dyn EventExecutor>,
    callback: EventCallback,
}

/// The set of registered listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        executor: Arc<dyn EventExecutor>,
        callback: EventCallback,
    ) {
        let mut locked = self.listeners.lock().unwrap();
        locked.push(Listener { executor, callback });
    }

    /// Deliver `events`, in order, to every listener.
    ///
    /// Must be called *after* releasing the wallet lock: callbacks are free
    /// to call back into the wallet.
    pub fn dispatch(&self, events: Vec<WalletEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().unwrap();
        for event in events {
            for listener in listeners.iter() {
                let callback = listener.callback.clone();
                let event = event.clone();
                listener.executor.execute(Box::new(move || {
                    let result =
                        catch_unwind(AssertUnwindSafe(|| callback(event)));
                    if let Err(panic) = result {
                        error!(
                            "Wallet event listener panicked: {panic:?}; \
                             wallet state is unaffected"
                        );
                    }
                }));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn events_reach_all_listeners_in_order() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let seen = seen.clone();
            registry.register(
                Arc::new(SameThreadExecutor),
                Arc::new(move |event| seen.lock().unwrap().push(event)),
            );
        }

        registry.dispatch(vec![
            WalletEvent::Changed,
            WalletEvent::CurrentKeyChanged,
        ]);

        let seen = seen.lock().unwrap();
        // Two listeners x two events.
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], WalletEvent::Changed);
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let registry = ListenerRegistry::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        registry.register(
            Arc::new(SameThreadExecutor),
            Arc::new(|_| panic!("listener bug")),
        );
        {
            let delivered = delivered.clone();
            registry.register(
                Arc::new(SameThreadExecutor),
                Arc::new(move |_| {
                    delivered.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        registry.dispatch(vec![WalletEvent::Changed]);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
