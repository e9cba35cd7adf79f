use std::{fmt, fmt::Display, str::FromStr};

use anyhow::anyhow;
#[cfg(any(test, feature = "test-utils"))]
use proptest_derive::Arbitrary;
use serde::Serialize;
use strum::VariantArray;

/// A simple version of [`bitcoin::Network`] which impls [`FromStr`] and
/// [`Display`] in a consistent way, and which isn't `#[non_exhaustive]`.
///
/// NOTE: [`bitcoin::Network`] serializes their mainnet variant as "bitcoin",
/// while we serialize it as "mainnet". Be sure to use *our* [`serde`] impls
/// when (de)serializing this network.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, VariantArray)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
#[serde(rename_all = "lowercase")]
pub enum KsNetwork {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl KsNetwork {
    /// Convert to a [`bitcoin::Network`].
    /// Equivalent to using the [`From`] impl.
    #[inline]
    pub fn to_bitcoin(self) -> bitcoin::Network {
        bitcoin::Network::from(self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Signet => "signet",
            Self::Regtest => "regtest",
        }
    }

    /// The BIP44 coin type for this network: 0 for mainnet, 1 for test nets.
    pub fn bip44_coin_type(self) -> u32 {
        match self {
            Self::Mainnet => 0,
            Self::Testnet | Self::Signet | Self::Regtest => 1,
        }
    }
}

impl FromStr for KsNetwork {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "signet" => Ok(Self::Signet),
            "regtest" => Ok(Self::Regtest),
            _ => Err(anyhow!("Invalid `KsNetwork`: {s}")),
        }
    }
}

impl Display for KsNetwork {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<bitcoin::Network> for KsNetwork {
    type Error = anyhow::Error;

    fn try_from(network: bitcoin::Network) -> Result<Self, Self::Error> {
        match network {
            bitcoin::Network::Bitcoin => Ok(Self::Mainnet),
            bitcoin::Network::Testnet => Ok(Self::Testnet),
            bitcoin::Network::Signet => Ok(Self::Signet),
            bitcoin::Network::Regtest => Ok(Self::Regtest),
            _ => Err(anyhow!("Unknown `bitcoin::Network`: {network:?}")),
        }
    }
}

impl From<KsNetwork> for bitcoin::Network {
    fn from(net: KsNetwork) -> Self {
        match net {
            KsNetwork::Mainnet => Self::Bitcoin,
            KsNetwork::Testnet => Self::Testnet,
            KsNetwork::Signet => Self::Signet,
            KsNetwork::Regtest => Self::Regtest,
        }
    }
}

impl<'de> serde::Deserialize<'de> for KsNetwork {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}
