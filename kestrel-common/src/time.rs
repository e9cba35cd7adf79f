use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
#[cfg(any(test, feature = "test-utils"))]
use proptest_derive::Arbitrary;
use serde::{de, Deserialize, Deserializer, Serialize};

/// The number of milliseconds since the [`UNIX_EPOCH`].
///
/// - Internally represented by a non-negative [`i64`] to ease
///   interoperability with platforms that don't support unsigned ints.
/// - Can represent any time from January 1st, 1970 00:00:00.000 UTC to
///   roughly 292 million years in the future.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
pub struct TimestampMs(
    #[cfg_attr(
        any(test, feature = "test-utils"),
        proptest(strategy = "0..=i64::MAX")
    )]
    i64,
);

impl TimestampMs {
    pub const MIN: Self = Self(0);
    pub const MAX: Self = Self(i64::MAX);

    /// Creates a new [`TimestampMs`] from the current [`SystemTime`].
    ///
    /// Panics if the current time is not within bounds.
    pub fn now() -> Self {
        Self::try_from(SystemTime::now()).unwrap()
    }

    /// Constructs from whole seconds since the epoch.
    pub fn from_secs(secs: u32) -> Self {
        Self(i64::from(secs) * 1000)
    }

    /// Returns the contained [`i64`] milliseconds.
    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Whole seconds since the epoch, rounding down.
    pub fn to_secs(self) -> u64 {
        (self.0 / 1000) as u64
    }

    /// This timestamp as a [`Duration`] since the epoch.
    pub fn to_duration(self) -> Duration {
        Duration::from_millis(self.0 as u64)
    }

    /// Saturating addition of a [`Duration`].
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis =
            i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }
}

/// Get a [`SystemTime`] corresponding to this timestamp.
impl From<TimestampMs> for SystemTime {
    fn from(timestamp: TimestampMs) -> Self {
        UNIX_EPOCH + timestamp.to_duration()
    }
}

/// Attempts to convert a [`SystemTime`] into a [`TimestampMs`].
///
/// Returns an error if the [`SystemTime`] is not within bounds.
impl TryFrom<SystemTime> for TimestampMs {
    type Error = anyhow::Error;
    fn try_from(system_time: SystemTime) -> anyhow::Result<Self> {
        system_time
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .map(i64::try_from)
            .map(|res| res.map(Self))
            .context("Current time is before January 1st, 1970")?
            .context("Current time is more than 292 million years past epoch")
    }
}

/// Enforces that the inner [`i64`] is non-negative.
impl<'de> Deserialize<'de> for TimestampMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        if value >= 0 {
            Ok(TimestampMs(value))
        } else {
            Err(de::Error::invalid_value(
                de::Unexpected::Signed(value),
                &"Unix timestamp must be non-negative",
            ))
        }
    }
}
