//! Shared test helpers. Only compiled in tests or with the `test-utils`
//! feature enabled.

pub mod arbitrary;
pub mod roundtrip;
