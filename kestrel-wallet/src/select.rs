//! Coin selection.
//!
//! The selector is pluggable so callers can implement their own policies
//! (e.g. privacy-preserving selection); the wallet's default prefers
//! confirmed coins, allows spending our own unconfirmed change once the
//! network has seen it, and keeps old coins for last so key rotation has
//! time to migrate them.

use bitcoin::{Amount, OutPoint, TxOut};

use crate::constants::COINBASE_MATURITY;

/// The balance kinds a wallet can report.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BalanceKind {
    /// Value safe to spend right now: what the default selector would pick
    /// given an unbounded target.
    Available,
    /// Available plus unconfirmed inbound value; what the wallet will hold
    /// once everything pending confirms. Always ≥ `Available`.
    Estimated,
    /// `Available`, excluding outputs we can watch but not sign for.
    AvailableSpendable,
    /// `Estimated`, excluding outputs we can watch but not sign for.
    EstimatedSpendable,
}

/// A spend candidate handed to the selector.
#[derive(Clone, Debug)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub output: TxOut,
    /// Confirmation depth of the parent transaction; 0 while pending.
    pub depth: u32,
    pub coinbase: bool,
    /// Whether the parent transaction was created by this wallet.
    pub self_originated: bool,
    /// How many peers have announced the (pending) parent.
    pub broadcast_peers: usize,
    /// Whether we hold signing material for this output.
    pub spendable: bool,
}

impl Coin {
    pub fn value(&self) -> Amount {
        self.output.value
    }
}

/// The outcome of a selection round.
#[derive(Clone, Debug, Default)]
pub struct CoinSelection {
    pub coins: Vec<Coin>,
    pub total: Amount,
}

/// A coin selection policy.
pub trait CoinSelector: Send + Sync {
    /// Pick candidates worth at least `target` if possible. Selectors may
    /// return less than `target` (the builder turns that into an
    /// insufficient-funds error) and may over-shoot (the builder returns
    /// change).
    fn select(&self, target: Amount, candidates: Vec<Coin>) -> CoinSelection;
}

/// The default policy. Eligibility:
///
/// - coinbase outputs must be mature (depth ≥ 100);
/// - otherwise confirmed (depth ≥ 1), or self-originated pending that at
///   least one peer has seen.
///
/// Candidates are taken larger-value first; ties prefer the *lower*-depth
/// (newer) parent so old coins stay around for key rotation to migrate.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultCoinSelector;

impl DefaultCoinSelector {
    fn is_eligible(coin: &Coin) -> bool {
        if coin.coinbase {
            return coin.depth >= COINBASE_MATURITY;
        }
        if coin.depth >= 1 {
            return true;
        }
        coin.self_originated && coin.broadcast_peers >= 1
    }
}

impl CoinSelector for DefaultCoinSelector {
    fn select(&self, target: Amount, candidates: Vec<Coin>) -> CoinSelection {
        let mut eligible: Vec<Coin> = candidates
            .into_iter()
            .filter(Self::is_eligible)
            .collect();
        eligible.sort_by(|a, b| {
            b.value()
                .cmp(&a.value())
                .then_with(|| a.depth.cmp(&b.depth))
                // Deterministic final tiebreak.
                .then_with(|| a.outpoint.cmp(&b.outpoint))
        });

        let mut selection = CoinSelection::default();
        for coin in eligible {
            if selection.total >= target {
                break;
            }
            selection.total += coin.value();
            selection.coins.push(coin);
        }
        selection
    }
}
